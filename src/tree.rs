//! The content tree collaborator.
//!
//! Slug generation never writes to the tree. [ContentTree] is the read interface the engine
//! consumes; [MemoryTree] is a complete in-process implementation used by embedders without
//! a tree of their own, by the benchmarks and by the tests.
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::SlugError,
    paths::to_alias_segment,
    properties::{ContentNode, CultureDocument, NodeId},
};

pub trait ContentTree: Send + Sync {
    fn get_node(&self, id: NodeId) -> Result<Option<ContentNode>, SlugError>;

    /// Children of `parent`, ordered by their sibling order.
    fn get_children(&self, parent: NodeId) -> Result<Vec<ContentNode>, SlugError>;

    fn get_site_cultures(&self, site: &str) -> Result<Vec<String>, SlugError>;

    fn get_default_culture(&self, site: &str) -> Result<String, SlugError>;

    /// URL pattern of a class. `None` when the class is unknown.
    fn get_class_pattern(&self, class_name: &str) -> Result<Option<String>, SlugError>;

    /// Every class name with its URL pattern.
    fn class_patterns(&self) -> Result<BTreeMap<String, String>, SlugError>;

    fn site_root(&self, site: &str) -> Result<Option<NodeId>, SlugError>;

    fn nodes_of_class(&self, site: &str, class_name: &str) -> Result<Vec<NodeId>, SlugError>;

    /// Whether any strict descendant of `node` is of one of `classes`.
    ///
    /// Trees backed by a query engine should override this with a scoped query.
    fn subtree_uses_class(
        &self,
        node: NodeId,
        classes: &BTreeSet<String>,
    ) -> Result<bool, SlugError> {
        if classes.is_empty() {
            return Ok(false);
        }
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            for child in self.get_children(current)? {
                if classes.contains(&child.class_name) {
                    return Ok(true);
                }
                stack.push(child.id);
            }
        }
        Ok(false)
    }

    /// Ids of every strict descendant of `node`, parents before children.
    fn descendant_ids(&self, node: NodeId) -> Result<Vec<NodeId>, SlugError> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            for child in self.get_children(current)?.into_iter().rev() {
                out.push(child.id);
                stack.push(child.id);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default)]
struct SiteCultures {
    cultures: Vec<String>,
    default_culture: String,
}

#[derive(Debug, Default)]
struct TreeState {
    nodes: BTreeMap<NodeId, ContentNode>,
    patterns: BTreeMap<String, String>,
    sites: BTreeMap<String, SiteCultures>,
}

impl TreeState {
    fn children_of(&self, parent: NodeId) -> Vec<NodeId> {
        let mut children: Vec<&ContentNode> = self
            .nodes
            .values()
            .filter(|n| n.parent_id == Some(parent))
            .collect();
        children.sort_by_key(|n| (n.order, n.id));
        children.into_iter().map(|n| n.id).collect()
    }

    fn default_culture(&self, site: &str) -> String {
        self.sites
            .get(site)
            .map(|s| s.default_culture.clone())
            .unwrap_or_default()
    }

    /// Recompute level, alias path and name paths of `id` and everything below it.
    fn refresh_paths(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id).cloned() else {
            return;
        };
        let parent = node.parent_id.and_then(|p| self.nodes.get(&p)).cloned();
        let default_culture = self.default_culture(&node.site);
        let alias_name = node
            .document(&default_culture)
            .or_else(|| node.documents.values().next())
            .map(|doc| doc.name.clone())
            .unwrap_or_default();
        let (level, alias_path) = match &parent {
            Some(parent) => (
                parent.level + 1,
                format!(
                    "{}/{}",
                    parent.alias_path.trim_end_matches('/'),
                    to_alias_segment(&alias_name)
                ),
            ),
            None => (0, "/".to_string()),
        };
        if let Some(node) = self.nodes.get_mut(&id) {
            node.level = level;
            node.alias_path = alias_path;
            for (culture, doc) in node.documents.iter_mut() {
                let parent_name_path = parent
                    .as_ref()
                    .and_then(|p| p.document(culture).or_else(|| p.document(&default_culture)))
                    .map(|d| d.name_path.clone());
                doc.name_path = match parent_name_path {
                    Some(base) => format!("{}/{}", base.trim_end_matches('/'), doc.name),
                    None => "/".to_string(),
                };
            }
        }
        for child in self.children_of(id) {
            self.refresh_paths(child);
        }
    }

    fn renumber(&mut self, parent: NodeId, moved: Option<(NodeId, usize)>) {
        let mut order = self.children_of(parent);
        if let Some((id, position)) = moved {
            order.retain(|c| *c != id);
            let position = position.saturating_sub(1).min(order.len());
            order.insert(position, id);
        }
        for (idx, child) in order.iter().enumerate() {
            if let Some(node) = self.nodes.get_mut(child) {
                node.order = idx as i32 + 1;
            }
        }
    }
}

/// A [ContentTree] held in memory, with the editing operations needed to drive triggers.
#[derive(Debug, Default)]
pub struct MemoryTree(RwLock<TreeState>);

impl MemoryTree {
    pub fn new() -> Self {
        MemoryTree::default()
    }

    pub fn add_site(&self, site: &str, cultures: &[&str], default_culture: &str) {
        self.0.write().sites.insert(
            site.to_string(),
            SiteCultures {
                cultures: cultures.iter().map(|c| c.to_string()).collect(),
                default_culture: default_culture.to_string(),
            },
        );
    }

    pub fn set_pattern(&self, class_name: &str, pattern: &str) {
        self.0
            .write()
            .patterns
            .insert(class_name.to_string(), pattern.to_string());
    }

    /// Insert a node verbatim. Paths and order are taken as given.
    pub fn insert(&self, node: ContentNode) {
        self.0.write().nodes.insert(node.id, node);
    }

    /// Add the root node of a site.
    pub fn add_root(&self, id: NodeId, site: &str, class_name: &str) {
        let mut state = self.0.write();
        let default_culture = state.default_culture(site);
        let mut documents = BTreeMap::new();
        documents.insert(default_culture, CultureDocument::new("", "/"));
        state.nodes.insert(
            id,
            ContentNode {
                id,
                parent_id: None,
                site: site.to_string(),
                class_name: class_name.to_string(),
                is_container: true,
                order: 1,
                level: 0,
                alias_path: "/".to_string(),
                fields: BTreeMap::new(),
                documents,
            },
        );
    }

    /// Append a page as the last child of `parent`, with one document per `(culture, name)`.
    pub fn add_page(
        &self,
        id: NodeId,
        parent: NodeId,
        class_name: &str,
        names: &[(&str, &str)],
    ) -> Result<(), SlugError> {
        let mut state = self.0.write();
        let parent_node = state
            .nodes
            .get(&parent)
            .cloned()
            .ok_or_else(|| SlugError::Load(format!("parent node {parent} does not exist")))?;
        let order = state.children_of(parent).len() as i32 + 1;
        let documents = names
            .iter()
            .map(|(culture, name)| (culture.to_string(), CultureDocument::new(name, "")))
            .collect();
        state.nodes.insert(
            id,
            ContentNode {
                id,
                parent_id: Some(parent),
                site: parent_node.site.clone(),
                class_name: class_name.to_string(),
                is_container: false,
                order,
                level: parent_node.level + 1,
                alias_path: String::new(),
                fields: BTreeMap::new(),
                documents,
            },
        );
        state.refresh_paths(id);
        Ok(())
    }

    pub fn set_field(&self, id: NodeId, key: &str, value: &str) {
        if let Some(node) = self.0.write().nodes.get_mut(&id) {
            node.fields.insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_class(&self, id: NodeId, class_name: &str) {
        if let Some(node) = self.0.write().nodes.get_mut(&id) {
            node.class_name = class_name.to_string();
        }
    }

    /// Rename the document of `id` in `culture`. Alias path follows the default culture.
    pub fn rename(&self, id: NodeId, culture: &str, name: &str) -> Result<(), SlugError> {
        let mut state = self.0.write();
        let node = state
            .nodes
            .get_mut(&id)
            .ok_or_else(|| SlugError::Load(format!("node {id} does not exist")))?;
        node.documents
            .entry(culture.to_string())
            .or_default()
            .name = name.to_string();
        state.refresh_paths(id);
        Ok(())
    }

    /// Move `id` below `new_parent` at 1-based `position`.
    pub fn move_node(
        &self,
        id: NodeId,
        new_parent: NodeId,
        position: usize,
    ) -> Result<Option<NodeId>, SlugError> {
        let mut state = self.0.write();
        if !state.nodes.contains_key(&new_parent) {
            return Err(SlugError::Load(format!("node {new_parent} does not exist")));
        }
        let node = state
            .nodes
            .get_mut(&id)
            .ok_or_else(|| SlugError::Load(format!("node {id} does not exist")))?;
        let old_parent = node.parent_id.replace(new_parent);
        if let Some(old_parent) = old_parent {
            state.renumber(old_parent, None);
        }
        state.renumber(new_parent, Some((id, position)));
        state.refresh_paths(id);
        Ok(old_parent)
    }

    /// Move `id` to 1-based `position` among its siblings.
    pub fn reorder(&self, id: NodeId, position: usize) -> Result<(), SlugError> {
        let mut state = self.0.write();
        let parent = state
            .nodes
            .get(&id)
            .ok_or_else(|| SlugError::Load(format!("node {id} does not exist")))?
            .parent_id
            .ok_or_else(|| SlugError::Load(format!("root node {id} cannot be reordered")))?;
        state.renumber(parent, Some((id, position)));
        Ok(())
    }

    /// Remove `id` and its subtree, returning every removed id.
    pub fn remove(&self, id: NodeId) -> Vec<NodeId> {
        let mut state = self.0.write();
        let parent = state.nodes.get(&id).and_then(|n| n.parent_id);
        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            stack.extend(state.children_of(current));
            if state.nodes.remove(&current).is_some() {
                removed.push(current);
            }
        }
        if let Some(parent) = parent {
            state.renumber(parent, None);
        }
        removed
    }
}

impl ContentTree for MemoryTree {
    fn get_node(&self, id: NodeId) -> Result<Option<ContentNode>, SlugError> {
        Ok(self.0.read().nodes.get(&id).cloned())
    }

    fn get_children(&self, parent: NodeId) -> Result<Vec<ContentNode>, SlugError> {
        let state = self.0.read();
        Ok(state
            .children_of(parent)
            .into_iter()
            .filter_map(|id| state.nodes.get(&id).cloned())
            .collect())
    }

    fn get_site_cultures(&self, site: &str) -> Result<Vec<String>, SlugError> {
        self.0
            .read()
            .sites
            .get(site)
            .map(|s| s.cultures.clone())
            .ok_or_else(|| SlugError::Config(format!("site '{site}' has no cultures")))
    }

    fn get_default_culture(&self, site: &str) -> Result<String, SlugError> {
        self.0
            .read()
            .sites
            .get(site)
            .map(|s| s.default_culture.clone())
            .ok_or_else(|| SlugError::Config(format!("site '{site}' has no default culture")))
    }

    fn get_class_pattern(&self, class_name: &str) -> Result<Option<String>, SlugError> {
        Ok(self.0.read().patterns.get(class_name).cloned())
    }

    fn class_patterns(&self) -> Result<BTreeMap<String, String>, SlugError> {
        Ok(self.0.read().patterns.clone())
    }

    fn site_root(&self, site: &str) -> Result<Option<NodeId>, SlugError> {
        Ok(self
            .0
            .read()
            .nodes
            .values()
            .find(|n| n.site == site && n.parent_id.is_none())
            .map(|n| n.id))
    }

    fn nodes_of_class(&self, site: &str, class_name: &str) -> Result<Vec<NodeId>, SlugError> {
        let state = self.0.read();
        let mut nodes: Vec<&ContentNode> = state
            .nodes
            .values()
            .filter(|n| n.site == site && n.class_name == class_name)
            .collect();
        nodes.sort_by_key(|n| (n.level, n.order, n.id));
        Ok(nodes.into_iter().map(|n| n.id).collect())
    }
}
