//! Rendering one node's slug for one culture.
use std::sync::Arc;

use crate::{
    error::SlugError,
    paths::normalize_slug,
    properties::ContentNode,
    settings::{BuilderSettings, ResolutionContext},
    template::{
        ExpansionContext, TemplateEngine, CLASS_NAME, DOCUMENT_CULTURE, DOCUMENT_NAME,
        DOCUMENT_NAME_PATH, NODE_ALIAS_PATH, NODE_ID, NODE_LEVEL, NODE_ORDER, NODE_PARENT_ID,
        PARENT_SLUG, PARENT_URL,
    },
};

#[derive(Clone)]
pub struct SlugRenderer {
    engine: Arc<dyn TemplateEngine>,
}

impl SlugRenderer {
    pub fn new(engine: Arc<dyn TemplateEngine>) -> Self {
        SlugRenderer { engine }
    }

    pub fn engine(&self) -> &dyn TemplateEngine {
        self.engine.as_ref()
    }

    /// Values a pattern of `node` can reference when rendered for `culture`. `None` when the
    /// node has no document to render from.
    pub fn expansion_context(
        &self,
        node: &ContentNode,
        culture: &str,
        parent_slug: &str,
        settings: &BuilderSettings,
    ) -> Option<ExpansionContext> {
        let document = node.document(culture).or_else(|| {
            settings
                .generate_if_missing
                .then(|| node.document(&settings.default_culture))
                .flatten()
        })?;

        let mut context = ExpansionContext::new();
        context.extend(node.fields.iter());
        context.extend(document.fields.iter());
        context.insert(NODE_ID, node.id);
        context.insert(
            NODE_PARENT_ID,
            node.parent_id.map(|p| p.to_string()).unwrap_or_default(),
        );
        context.insert(NODE_LEVEL, node.level);
        context.insert(NODE_ORDER, node.order);
        context.insert(NODE_ALIAS_PATH, &node.alias_path);
        context.insert(CLASS_NAME, &node.class_name);
        context.insert(DOCUMENT_NAME, &document.name);
        context.insert(DOCUMENT_NAME_PATH, &document.name_path);
        context.insert(DOCUMENT_CULTURE, culture);
        context.insert(PARENT_SLUG, parent_slug);
        context.insert(PARENT_URL, parent_slug);
        Some(context)
    }

    /// Render the slug of `node` in `culture` below a parent whose slug is `parent_slug`
    /// (empty for a root).
    ///
    /// An empty pattern falls back to the node's alias path so descendants still have a
    /// usable parent slug.
    pub fn render(
        &self,
        node: &ContentNode,
        culture: &str,
        parent_slug: &str,
        pattern: &str,
        settings: &BuilderSettings,
        resolution: &ResolutionContext,
    ) -> Result<Option<String>, SlugError> {
        let Some(context) = self.expansion_context(node, culture, parent_slug, settings) else {
            return Ok(None);
        };
        let expanded = if pattern.trim().is_empty() {
            node.alias_path.clone()
        } else {
            self.engine.expand(pattern, &context)?
        };
        Ok(Some(normalize_slug(&expanded, &resolution.format)))
    }
}
