//! How far a change reaches.
//!
//! A change to one node can only alter the slugs of other nodes whose class pattern reads
//! something the change touched: sibling order, ancestor data, or the parent's slug. The
//! [PlaceholderIndex] answers which classes read what. It depends only on class patterns
//! and is cached until [ImpactAnalyzer::invalidate] is called. Existence checks are scoped to
//! the siblings, children or subtree of the changed node.
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use crate::{
    error::SlugError,
    properties::{ContentNode, NodeId},
    template::{
        TemplateEngine, DOCUMENT_NAME_PATH, NODE_ALIAS_PATH, NODE_LEVEL, NODE_ORDER,
        NODE_PARENT_ID, PARENT_SLUG, PARENT_URL,
    },
    tree::ContentTree,
};

const ORDERING_PLACEHOLDERS: &[&str] = &[NODE_ORDER];
const ANCESTOR_PLACEHOLDERS: &[&str] =
    &[NODE_LEVEL, NODE_PARENT_ID, NODE_ALIAS_PATH, DOCUMENT_NAME_PATH];
const PARENT_SLUG_PLACEHOLDERS: &[&str] = &[PARENT_SLUG, PARENT_URL];

/// Classes whose pattern references each kind of scope sensitive placeholder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderIndex {
    pub ordering: BTreeSet<String>,
    pub ancestor: BTreeSet<String>,
    pub parent_slug: BTreeSet<String>,
}

fn references(placeholders: &BTreeSet<String>, names: &[&str]) -> bool {
    placeholders
        .iter()
        .any(|p| names.iter().any(|n| p.eq_ignore_ascii_case(n)))
}

impl PlaceholderIndex {
    pub fn build(patterns: &BTreeMap<String, String>, engine: &dyn TemplateEngine) -> Self {
        let mut index = PlaceholderIndex::default();
        for (class_name, pattern) in patterns.iter() {
            let placeholders = engine.placeholders(pattern);
            if references(&placeholders, ORDERING_PLACEHOLDERS) {
                index.ordering.insert(class_name.clone());
            }
            if references(&placeholders, ANCESTOR_PLACEHOLDERS) {
                index.ancestor.insert(class_name.clone());
            }
            if references(&placeholders, PARENT_SLUG_PLACEHOLDERS) {
                index.parent_slug.insert(class_name.clone());
            }
        }
        index
    }
}

/// Which neighbours of a changed node need their slugs rebuilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impact {
    pub siblings: bool,
    pub descendants: bool,
    pub children: bool,
}

pub struct ImpactAnalyzer {
    tree: Arc<dyn ContentTree>,
    engine: Arc<dyn TemplateEngine>,
    index: RwLock<Option<Arc<PlaceholderIndex>>>,
}

impl ImpactAnalyzer {
    pub fn new(tree: Arc<dyn ContentTree>, engine: Arc<dyn TemplateEngine>) -> Self {
        ImpactAnalyzer {
            tree,
            engine,
            index: RwLock::new(None),
        }
    }

    pub fn index(&self) -> Result<Arc<PlaceholderIndex>, SlugError> {
        if let Some(index) = self.index.read().as_ref() {
            return Ok(index.clone());
        }
        let patterns = self.tree.class_patterns()?;
        let index = Arc::new(PlaceholderIndex::build(&patterns, self.engine.as_ref()));
        tracing::debug!(
            "[ImpactAnalyzer] Indexed {} class patterns: {} ordering, {} ancestor, {} parent slug",
            patterns.len(),
            index.ordering.len(),
            index.ancestor.len(),
            index.parent_slug.len()
        );
        *self.index.write() = Some(index.clone());
        Ok(index)
    }

    /// Drop the cached index. Call whenever a class pattern changes.
    pub fn invalidate(&self) {
        *self.index.write() = None;
    }

    /// Whether the children of `parent` must be rebuilt after their order changed.
    pub fn needs_order_rebuild(&self, parent: NodeId) -> Result<bool, SlugError> {
        let index = self.index()?;
        if index.ordering.is_empty() {
            return Ok(false);
        }
        Ok(self
            .tree
            .get_children(parent)?
            .iter()
            .any(|c| index.ordering.contains(&c.class_name)))
    }

    /// Whether the siblings of `node`, itself included, must be rebuilt.
    pub fn needs_sibling_rebuild(&self, node: &ContentNode) -> Result<bool, SlugError> {
        match node.parent_id {
            Some(parent) => self.needs_order_rebuild(parent),
            None => Ok(false),
        }
    }

    pub fn needs_descendant_rebuild(&self, node: NodeId) -> Result<bool, SlugError> {
        let index = self.index()?;
        self.tree.subtree_uses_class(node, &index.ancestor)
    }

    pub fn needs_child_rebuild(&self, node: NodeId) -> Result<bool, SlugError> {
        let index = self.index()?;
        if index.parent_slug.is_empty() {
            return Ok(false);
        }
        Ok(self
            .tree
            .get_children(node)?
            .iter()
            .any(|c| index.parent_slug.contains(&c.class_name)))
    }

    pub fn analyze(&self, node: &ContentNode) -> Result<Impact, SlugError> {
        Ok(Impact {
            siblings: self.needs_sibling_rebuild(node)?,
            descendants: self.needs_descendant_rebuild(node.id)?,
            children: self.needs_child_rebuild(node.id)?,
        })
    }
}
