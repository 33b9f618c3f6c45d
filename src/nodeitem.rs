//! The in-memory tree a build pass works on.
//!
//! A [NodeItem] owns its children outright. The upward link is the parent id only: a child
//! reads its parent's slugs while the builder recurses top-down, so no item ever needs to
//! reach back through a pointer.
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    properties::{NodeId, SlugRecord, CULTURE_INVARIANT},
    settings::BuilderSettings,
};

/// Working state of one (node, culture) slug during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUrlSlug {
    pub culture: String,
    pub slug: String,
    pub is_custom: bool,
    pub is_default: bool,
    pub is_new_or_updated: bool,
    /// Persisted text before this pass, kept for redirects.
    pub previous_slug: Option<String>,
    /// Identity of the persisted record this slug updates in place.
    pub existing_id: Option<Uuid>,
}

impl NodeUrlSlug {
    pub fn from_record(record: &SlugRecord, default_culture: &str) -> Self {
        NodeUrlSlug {
            culture: record.culture.clone(),
            slug: record.slug.clone(),
            is_custom: record.is_custom,
            is_default: record.culture == default_culture,
            is_new_or_updated: false,
            previous_slug: Some(record.slug.clone()),
            existing_id: Some(record.id),
        }
    }

    pub fn new(culture: &str, slug: &str, is_default: bool) -> Self {
        NodeUrlSlug {
            culture: culture.to_string(),
            slug: slug.to_string(),
            is_custom: false,
            is_default,
            is_new_or_updated: true,
            previous_slug: None,
            existing_id: None,
        }
    }

    /// No persisted record backs this slug yet.
    pub fn is_new(&self) -> bool {
        self.existing_id.is_none()
    }

    /// The pass gives this slug a text it did not have before.
    pub fn has_new_text(&self) -> bool {
        self.is_new_or_updated && self.previous_slug.as_deref() != Some(self.slug.as_str())
    }
}

/// Pick the slug for `culture` out of one node's slugs: exact culture, then the default
/// culture, then the culture invariant slug, then whatever is there.
pub fn select_slug<'a>(slugs: &'a [NodeUrlSlug], culture: &str) -> Option<&'a NodeUrlSlug> {
    slugs
        .iter()
        .find(|s| s.culture == culture)
        .or_else(|| slugs.iter().find(|s| s.is_default))
        .or_else(|| slugs.iter().find(|s| s.culture == CULTURE_INVARIANT))
        .or_else(|| slugs.first())
}

#[derive(Debug, Clone)]
pub struct NodeItem {
    pub node_id: NodeId,
    pub parent_id: Option<NodeId>,
    pub class_name: String,
    pub is_container: bool,
    pub slugs: Vec<NodeUrlSlug>,
    pub children: Vec<NodeItem>,
    /// Children have been built into `children`.
    pub children_loaded: bool,
    /// Children must be built: requested, demanded by settings, or this node changed.
    pub build_children: bool,
    /// One child that must build its own children even though its siblings stay shallow.
    pub force_child: Option<NodeId>,
    pub saved: bool,
    pub settings: Arc<BuilderSettings>,
}

impl PartialEq for NodeItem {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
            && self.parent_id == other.parent_id
            && self.class_name == other.class_name
            && self.is_container == other.is_container
            && self.slugs == other.slugs
            && self.children == other.children
            && self.children_loaded == other.children_loaded
            && self.build_children == other.build_children
            && self.force_child == other.force_child
            && self.saved == other.saved
            && *self.settings == *other.settings
    }
}

impl NodeItem {
    /// The slug for `culture`, falling back to the default culture, the culture invariant
    /// slug and finally to any slug the node has.
    pub fn get_slug(&self, culture: &str) -> Option<&NodeUrlSlug> {
        select_slug(&self.slugs, culture)
    }

    /// Slug text children of this node see as their parent slug.
    pub fn slug_text(&self, culture: &str) -> String {
        self.get_slug(culture)
            .map(|s| s.slug.clone())
            .unwrap_or_default()
    }

    pub fn has_changes(&self) -> bool {
        self.slugs.iter().any(|s| s.is_new_or_updated)
    }

    /// Number of new or updated slugs in this subtree.
    pub fn change_count(&self) -> usize {
        self.slugs.iter().filter(|s| s.is_new_or_updated).count()
            + self.children.iter().map(|c| c.change_count()).sum::<usize>()
    }

    pub fn needs_children_build(&self) -> bool {
        self.build_children || self.force_child.is_some()
    }

    /// This item and all items below it, parents first.
    pub fn flatten(&self) -> Vec<&NodeItem> {
        let mut out = vec![self];
        for child in self.children.iter() {
            out.extend(child.flatten());
        }
        out
    }

    pub fn find(&self, node_id: NodeId) -> Option<&NodeItem> {
        if self.node_id == node_id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(node_id))
    }

    pub fn find_mut(&mut self, node_id: NodeId) -> Option<&mut NodeItem> {
        if self.node_id == node_id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(node_id))
    }
}

/// Serialized form of a [NodeItem] subtree: node ids plus per-culture slug states.
/// Settings are stored once beside the root, not per node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    pub class_name: String,
    #[serde(default)]
    pub is_container: bool,
    #[serde(default)]
    pub slugs: Vec<NodeUrlSlug>,
    #[serde(default)]
    pub children_loaded: bool,
    #[serde(default)]
    pub build_children: bool,
    #[serde(default)]
    pub force_child: Option<NodeId>,
    #[serde(default)]
    pub saved: bool,
    #[serde(default)]
    pub children: Vec<NodeSnapshot>,
}

impl From<&NodeItem> for NodeSnapshot {
    fn from(item: &NodeItem) -> Self {
        NodeSnapshot {
            node_id: item.node_id,
            parent_id: item.parent_id,
            class_name: item.class_name.clone(),
            is_container: item.is_container,
            slugs: item.slugs.clone(),
            children_loaded: item.children_loaded,
            build_children: item.build_children,
            force_child: item.force_child,
            saved: item.saved,
            children: item.children.iter().map(NodeSnapshot::from).collect(),
        }
    }
}

impl NodeSnapshot {
    pub fn into_item(self, settings: Arc<BuilderSettings>) -> NodeItem {
        NodeItem {
            node_id: self.node_id,
            parent_id: self.parent_id,
            class_name: self.class_name,
            is_container: self.is_container,
            slugs: self.slugs,
            children: self
                .children
                .into_iter()
                .map(|c| c.into_item(settings.clone()))
                .collect(),
            children_loaded: self.children_loaded,
            build_children: self.build_children,
            force_child: self.force_child,
            saved: self.saved,
            settings,
        }
    }
}
