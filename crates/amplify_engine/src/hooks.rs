//! Named custom hooks invoked by `customFunc` actions.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use amplify_core::{Action, ActionError, HookEdit, HookElement};
use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};

use crate::browser::RenderPage;

/// Behavior that cannot be written as a declarative action.
///
/// `elements` are detached copies of the matched elements; a hook records
/// what should happen to each through [`HookElement::edit`]. The returned
/// string is logged as the action's message.
#[async_trait]
pub trait CustomHook: Send + Sync {
    async fn run(
        &self,
        action: &Action,
        elements: &mut [HookElement],
        page: &dyn RenderPage,
        root_html: &str,
    ) -> Result<String, ActionError>;
}

#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn CustomHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every hook this crate ships.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(INSTAGRAM_EMBED, Arc::new(InstagramEmbedHook));
        registry
    }

    /// Registers `hook` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, hook: Arc<dyn CustomHook>) {
        self.hooks.insert(name.into(), hook);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CustomHook>> {
        self.hooks.get(name).cloned()
    }
}

pub const INSTAGRAM_EMBED: &str = "instagramEmbed";

/// Replaces the content of containers holding an Instagram embed with an
/// `amp-instagram` element for the same post.
pub struct InstagramEmbedHook;

fn shortcode_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^(?:.*/p/)([\w\-]+)").expect("valid regex"))
}

fn embed_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| Selector::parse(".instagram-media").expect("valid selector"))
}

/// Post shortcode of the first Instagram embed inside `inner_html`.
pub fn instagram_shortcode(inner_html: &str) -> Option<String> {
    let fragment = Html::parse_fragment(inner_html);
    let embed = fragment.select(embed_selector()).next()?;
    let permalink = embed
        .value()
        .attr("src")
        .or_else(|| embed.value().attr("data-instgrm-permalink"))?;
    shortcode_pattern()
        .captures(permalink)
        .and_then(|caps| caps.get(1))
        .map(|code| code.as_str().to_string())
}

#[async_trait]
impl CustomHook for InstagramEmbedHook {
    async fn run(
        &self,
        _action: &Action,
        elements: &mut [HookElement],
        _page: &dyn RenderPage,
        _root_html: &str,
    ) -> Result<String, ActionError> {
        let mut replaced = 0;
        for element in elements.iter_mut() {
            if let Some(code) = instagram_shortcode(&element.inner_html) {
                element.edit = HookEdit::SetInner(format!(
                    r#"<amp-instagram data-shortcode="{code}" data-captioned width="400" height="400" layout="responsive"></amp-instagram>"#
                ));
                replaced += 1;
            }
        }
        Ok(format!("{replaced} embeds replaced"))
    }
}
