//! The pattern expansion collaborator.
//!
//! [TemplateEngine] is the seam to whatever macro language a host uses for URL patterns.
//! [PlaceholderExpander] is the built-in engine: it substitutes `{Name}` and `{% Name %}`
//! placeholders (an optional trailing `()` is accepted) from an [ExpansionContext].
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::SlugError;

pub const PARENT_SLUG: &str = "ParentSlug";
/// Alternate spelling of [PARENT_SLUG] accepted in patterns.
pub const PARENT_URL: &str = "ParentUrl";
pub const NODE_ORDER: &str = "NodeOrder";
pub const NODE_LEVEL: &str = "NodeLevel";
pub const NODE_PARENT_ID: &str = "NodeParentID";
pub const NODE_ALIAS_PATH: &str = "NodeAliasPath";
pub const NODE_ID: &str = "NodeID";
pub const DOCUMENT_NAME: &str = "DocumentName";
pub const DOCUMENT_NAME_PATH: &str = "DocumentNamePath";
pub const DOCUMENT_CULTURE: &str = "DocumentCulture";
pub const CLASS_NAME: &str = "ClassName";

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\{%\s*([A-Za-z_][A-Za-z0-9_.]*)(?:\(\))?\s*%\}|\{([A-Za-z_][A-Za-z0-9_.]*)(?:\(\))?\}",
    )
    .expect("placeholder regex is valid")
});

/// Values available to a pattern. Lookups ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpansionContext {
    values: BTreeMap<String, String>,
}

impl ExpansionContext {
    pub fn new() -> Self {
        ExpansionContext::default()
    }

    pub fn insert<V: ToString>(&mut self, key: &str, value: V) {
        self.values.insert(key.to_ascii_lowercase(), value.to_string());
    }

    pub fn extend<'a, I: IntoIterator<Item = (&'a String, &'a String)>>(&mut self, values: I) {
        for (key, value) in values {
            self.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(&key.to_ascii_lowercase())
            .map(|v| v.as_str())
    }
}

pub trait TemplateEngine: Send + Sync {
    fn expand(&self, pattern: &str, context: &ExpansionContext) -> Result<String, SlugError>;

    /// Names of the placeholders a pattern references.
    fn placeholders(&self, pattern: &str) -> BTreeSet<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderExpander;

fn placeholder_name<'a>(caps: &'a Captures) -> &'a str {
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str())
        .unwrap_or_default()
}

impl TemplateEngine for PlaceholderExpander {
    fn expand(&self, pattern: &str, context: &ExpansionContext) -> Result<String, SlugError> {
        let expanded = PLACEHOLDER_RE.replace_all(pattern, |caps: &Captures| {
            let name = placeholder_name(caps);
            match context.get(name) {
                Some(value) => value.to_string(),
                None => {
                    tracing::debug!("[PlaceholderExpander] No value for placeholder '{}'", name);
                    String::new()
                }
            }
        });
        Ok(expanded.into_owned())
    }

    fn placeholders(&self, pattern: &str) -> BTreeSet<String> {
        PLACEHOLDER_RE
            .captures_iter(pattern)
            .map(|caps| placeholder_name(&caps).to_string())
            .collect()
    }
}
