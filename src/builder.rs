//! Building the in-memory [NodeItem] tree of a pass.
//!
//! A node is always resolved before its children: [TreeBuilder::build_children] hands every
//! child the parent's freshly computed slugs, so a `{ParentSlug}` placeholder never reads
//! stale data even when parent and child change in the same pass. Nothing here writes to
//! storage.
use std::{future::Future, pin::Pin, sync::Arc};

use crate::{
    config::SlugConfigProvider,
    error::SlugError,
    nodeitem::{select_slug, NodeItem, NodeUrlSlug},
    properties::{ContentNode, NodeId},
    render::SlugRenderer,
    settings::BuilderSettings,
    store::SlugStore,
    tree::ContentTree,
};

type SubtreeFuture<'a> = Pin<Box<dyn Future<Output = Result<usize, SlugError>> + Send + 'a>>;

#[derive(Clone)]
pub struct TreeBuilder<S> {
    tree: Arc<dyn ContentTree>,
    renderer: SlugRenderer,
    config: Arc<dyn SlugConfigProvider>,
    store: S,
}

impl<S: SlugStore + Send + Sync> TreeBuilder<S> {
    pub fn new(
        tree: Arc<dyn ContentTree>,
        renderer: SlugRenderer,
        config: Arc<dyn SlugConfigProvider>,
        store: S,
    ) -> Self {
        TreeBuilder {
            tree,
            renderer,
            config,
            store,
        }
    }

    pub fn tree(&self) -> &dyn ContentTree {
        self.tree.as_ref()
    }

    /// Persisted slugs of `node` in working form. Used as the parent slugs of the first node
    /// of a pass, whose parent is not rebuilt.
    pub async fn persisted_slugs(
        &self,
        node: NodeId,
        settings: &BuilderSettings,
    ) -> Result<Vec<NodeUrlSlug>, SlugError> {
        Ok(self
            .store
            .slugs_for_node(node)
            .await?
            .iter()
            .map(|r| NodeUrlSlug::from_record(r, &settings.default_culture))
            .collect())
    }

    /// Build `node_id` without its children. `force_children` requests its children be built
    /// whether or not the node itself changes.
    #[tracing::instrument(skip(self, settings))]
    pub async fn build_node(
        &self,
        node_id: NodeId,
        settings: Arc<BuilderSettings>,
        force_children: bool,
    ) -> Result<NodeItem, SlugError> {
        let node = self
            .tree
            .get_node(node_id)?
            .ok_or_else(|| SlugError::Load(format!("node {node_id} no longer exists")))?;
        let parent_slugs = match node.parent_id {
            Some(parent) => self.persisted_slugs(parent, &settings).await?,
            None => Vec::new(),
        };
        self.build_from(node, &parent_slugs, settings, force_children)
            .await
    }

    async fn build_from(
        &self,
        node: ContentNode,
        parent_slugs: &[NodeUrlSlug],
        settings: Arc<BuilderSettings>,
        force_children: bool,
    ) -> Result<NodeItem, SlugError> {
        let resolution = settings.context(self.config.as_ref())?;
        let pattern = match self.tree.get_class_pattern(&node.class_name)? {
            Some(pattern) => pattern,
            None => {
                tracing::debug!(
                    "[TreeBuilder] Class '{}' has no URL pattern, using alias path for node {}",
                    node.class_name,
                    node.id
                );
                String::new()
            }
        };

        let mut slugs: Vec<NodeUrlSlug> = self
            .store
            .slugs_for_node(node.id)
            .await?
            .iter()
            .filter(|r| settings.check_for_updates || r.is_custom)
            .map(|r| NodeUrlSlug::from_record(r, &settings.default_culture))
            .collect();

        for culture in settings.cultures.iter() {
            if slugs.iter().any(|s| &s.culture == culture && s.is_custom) {
                continue;
            }
            let parent_slug = select_slug(parent_slugs, culture)
                .map(|s| s.slug.as_str())
                .unwrap_or_default();
            let Some(rendered) = self.renderer.render(
                &node,
                culture,
                parent_slug,
                &pattern,
                &settings,
                &resolution,
            )?
            else {
                continue;
            };
            match slugs.iter_mut().find(|s| &s.culture == culture) {
                Some(existing) => {
                    if existing.slug != rendered {
                        existing.slug = rendered;
                        existing.is_new_or_updated = true;
                    }
                }
                None => slugs.push(NodeUrlSlug::new(
                    culture,
                    &rendered,
                    settings.is_default_culture(culture),
                )),
            }
        }

        let mut item = NodeItem {
            node_id: node.id,
            parent_id: node.parent_id,
            class_name: node.class_name,
            is_container: node.is_container,
            slugs,
            children: Vec::new(),
            children_loaded: false,
            build_children: false,
            force_child: None,
            saved: false,
            settings,
        };
        item.build_children =
            force_children || item.settings.rebuild_descendants || item.has_changes();
        Ok(item)
    }

    /// Build the immediate children of `item` from its current slugs. Each child decides on
    /// its own whether its children need building. Returns how many children were built.
    pub async fn build_children(&self, item: &mut NodeItem) -> Result<usize, SlugError> {
        if item.children_loaded {
            return Ok(0);
        }
        let children = self.tree.get_children(item.node_id)?;
        let mut built = Vec::with_capacity(children.len());
        for child in children {
            let force = item.force_child == Some(child.id);
            built.push(
                self.build_from(child, &item.slugs, item.settings.clone(), force)
                    .await?,
            );
        }
        tracing::debug!(
            "[TreeBuilder] Built {} children of node {}",
            built.len(),
            item.node_id
        );
        item.children = built;
        item.children_loaded = true;
        Ok(item.children.len())
    }

    /// Build every descendant of `item` that needs building, top-down. Returns the number
    /// of items built.
    pub fn build_subtree<'a>(&'a self, item: &'a mut NodeItem) -> SubtreeFuture<'a> {
        Box::pin(async move {
            let mut built = 0;
            if item.needs_children_build() {
                built += self.build_children(item).await?;
            }
            for child in item.children.iter_mut() {
                if child.needs_children_build() {
                    built += self.build_subtree(child).await?;
                }
            }
            Ok(built)
        })
    }
}
