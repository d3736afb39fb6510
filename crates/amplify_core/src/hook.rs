//! Plain-data view of the elements handed to a custom hook.
//!
//! Hooks run outside the document model (they may talk to the browser), so
//! they receive detached copies of the matched elements and describe what
//! should happen to each one through [`HookEdit`]. The edits are applied in a
//! second parse of the same markup, which yields the same node ids.

use ego_tree::NodeId;

use crate::document::Document;
use crate::error::ActionError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HookEdit {
    #[default]
    Keep,
    SetInner(String),
    Replace(String),
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookElement {
    id: NodeId,
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub inner_html: String,
    pub outer_html: String,
    pub edit: HookEdit,
}

impl HookElement {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(attr, _)| attr.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Detached copies of every element matching `selector`. An empty selector
/// yields no elements.
pub fn collect_hook_targets(
    document: &Document,
    selector: &str,
) -> Result<Vec<HookElement>, ActionError> {
    if selector.trim().is_empty() {
        return Ok(Vec::new());
    }
    let (_, elements) = document.edit(|dom| {
        let ids = dom.select_all(selector)?;
        Ok(ids
            .into_iter()
            .map(|id| HookElement {
                id,
                tag: dom.tag_name(id).unwrap_or_default().to_string(),
                attributes: dom.attributes(id),
                inner_html: dom.inner_html(id),
                outer_html: dom.outer_html(id),
                edit: HookEdit::Keep,
            })
            .collect::<Vec<_>>())
    })?;
    Ok(elements)
}

/// Applies the edits recorded on `elements`, which must come from
/// [`collect_hook_targets`] on the same `document`.
pub fn apply_hook_edits(document: &Document, elements: &[HookElement]) -> Document {
    let edited = document.edit(|dom| {
        for element in elements {
            match &element.edit {
                HookEdit::Keep => {}
                HookEdit::SetInner(markup) => dom.set_inner_html(element.id, markup.clone()),
                HookEdit::Replace(markup) => {
                    dom.insert_after(element.id, markup);
                    dom.remove(element.id);
                }
                HookEdit::Remove => dom.remove(element.id),
            }
        }
        Ok(())
    });
    match edited {
        Ok((document, ())) => document,
        Err(_) => document.clone(),
    }
}
