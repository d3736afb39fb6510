//! The authoritative DOM snapshot of a job.
//!
//! A [`Document`] holds normalized markup rather than a live tree. Each edit
//! parses it, records changes against node ids in a patch set, writes the
//! patched tree out and re-normalizes the result. An edit that returns an
//! error produces no new document, so callers keep the prior snapshot.

use ego_tree::NodeId;
use scraper::node::Node;
use scraper::{Html, Selector};

use crate::error::ActionError;
use crate::serialize::{
    qualified_attributes, render_document, render_inner, render_outer, Layout, PatchSet,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    markup: String,
}

impl Document {
    /// Parses `markup` and stores it in pretty-printed form.
    pub fn parse(markup: &str) -> Self {
        let html = Html::parse_document(markup);
        Self {
            markup: render_document(&html, &PatchSet::default(), Layout::Pretty),
        }
    }

    /// The normalized markup, starting with `<!DOCTYPE html>`.
    pub fn html(&self) -> &str {
        &self.markup
    }

    pub fn into_html(self) -> String {
        self.markup
    }

    pub fn parsed(&self) -> Html {
        Html::parse_document(&self.markup)
    }

    /// Number of elements matching `selector`.
    pub fn count(&self, selector: &str) -> Result<usize, ActionError> {
        let selector = parse_selector(selector)?;
        Ok(self.parsed().select(&selector).count())
    }

    /// Runs `f` against a fresh parse of the document and returns the edited
    /// copy together with the closure's result.
    pub fn edit<T>(
        &self,
        f: impl FnOnce(&mut DomEditor<'_>) -> Result<T, ActionError>,
    ) -> Result<(Document, T), ActionError> {
        let html = self.parsed();
        let mut editor = DomEditor {
            html: &html,
            patches: PatchSet::default(),
        };
        let value = f(&mut editor)?;
        if editor.patches.is_empty() {
            return Ok((self.clone(), value));
        }
        let compact = render_document(&html, &editor.patches, Layout::Compact);
        Ok((Document::parse(&compact), value))
    }
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, ActionError> {
    Selector::parse(selector).map_err(|err| ActionError::InvalidSelector {
        selector: selector.to_string(),
        message: err.to_string(),
    })
}

/// Query and mutation access to one parse of a [`Document`].
///
/// Reads reflect edits already recorded through the same editor, except
/// that selectors always run against the tree as parsed.
pub struct DomEditor<'a> {
    html: &'a Html,
    patches: PatchSet,
}

impl<'a> DomEditor<'a> {
    pub fn html(&self) -> &'a Html {
        self.html
    }

    /// Ids of every element matching `selector`, in document order.
    pub fn select_all(&self, selector: &str) -> Result<Vec<NodeId>, ActionError> {
        let parsed = parse_selector(selector)?;
        Ok(self
            .html
            .select(&parsed)
            .map(|element| element.id())
            .filter(|id| !self.is_removed(*id))
            .collect())
    }

    pub fn select_first(&self, selector: &str) -> Result<Option<NodeId>, ActionError> {
        Ok(self.select_all(selector)?.into_iter().next())
    }

    fn is_removed(&self, id: NodeId) -> bool {
        self.patches.get(id).is_some_and(|patch| patch.removed)
    }

    pub fn tag_name(&self, id: NodeId) -> Option<&'a str> {
        match self.html.tree.get(id)?.value() {
            Node::Element(element) => Some(element.name()),
            _ => None,
        }
    }

    pub fn parent_tag_name(&self, id: NodeId) -> Option<&'a str> {
        let parent = self.html.tree.get(id)?.parent()?;
        match parent.value() {
            Node::Element(element) => Some(element.name()),
            _ => None,
        }
    }

    /// Current attributes of `id`, including recorded edits.
    pub fn attributes(&self, id: NodeId) -> Vec<(String, String)> {
        if let Some(attrs) = self.patches.get(id).and_then(|patch| patch.attrs.as_ref()) {
            return attrs.clone();
        }
        match self.html.tree.get(id).map(|node| node.value()) {
            Some(Node::Element(element)) => qualified_attributes(element),
            _ => Vec::new(),
        }
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<String> {
        self.attributes(id)
            .into_iter()
            .find(|(attr, _)| attr.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) {
        let mut attrs = self.attributes(id);
        let name = name.to_ascii_lowercase();
        match attrs.iter_mut().find(|(attr, _)| *attr == name) {
            Some(slot) => slot.1 = value.to_string(),
            None => attrs.push((name, value.to_string())),
        }
        self.patches.entry(id).attrs = Some(attrs);
    }

    /// Returns whether the attribute was present.
    pub fn remove_attribute(&mut self, id: NodeId, name: &str) -> bool {
        let mut attrs = self.attributes(id);
        let before = attrs.len();
        attrs.retain(|(attr, _)| !attr.eq_ignore_ascii_case(name));
        if attrs.len() == before {
            return false;
        }
        self.patches.entry(id).attrs = Some(attrs);
        true
    }

    pub fn inner_html(&self, id: NodeId) -> String {
        render_inner(self.html, &self.patches, id)
    }

    pub fn outer_html(&self, id: NodeId) -> String {
        render_outer(self.html, &self.patches, id)
    }

    /// Replaces the content of `id`, discarding earlier prepends and appends.
    pub fn set_inner_html(&mut self, id: NodeId, markup: impl Into<String>) {
        let patch = self.patches.entry(id);
        patch.inner = Some(markup.into());
        patch.prepend.clear();
        patch.append.clear();
    }

    pub fn append_html(&mut self, id: NodeId, markup: &str) {
        self.patches.entry(id).append.push_str(markup);
    }

    pub fn prepend_html(&mut self, id: NodeId, markup: &str) {
        self.patches.entry(id).prepend.insert_str(0, markup);
    }

    /// Inserts `markup` as the next siblings of `id`.
    pub fn insert_after(&mut self, id: NodeId, markup: &str) {
        self.patches.entry(id).after.insert_str(0, markup);
    }

    pub fn remove(&mut self, id: NodeId) {
        self.patches.entry(id).removed = true;
    }
}
