//! Tests for the placeholder index and impact predicates

use super::helpers::*;
use crate::{
    impact::{Impact, ImpactAnalyzer, PlaceholderIndex},
    tree::ContentTree,
};
use std::collections::BTreeMap;
use test_log::test;

#[test]
fn test_index_matches_placeholders_case_insensitively() {
    let mut patterns = BTreeMap::new();
    patterns.insert("Ordered".to_string(), "/{% nodeorder %}".to_string());
    patterns.insert("Nested".to_string(), "{ParentUrl}/{DocumentName}".to_string());
    patterns.insert("Deep".to_string(), "/{% NodeAliasPath %}".to_string());
    patterns.insert("Flat".to_string(), "/{% DocumentName %}".to_string());

    let index = PlaceholderIndex::build(&patterns, engine().as_ref());

    assert_eq!(index.ordering.len(), 1);
    assert!(index.ordering.contains("Ordered"));
    assert!(index.parent_slug.contains("Nested"));
    assert!(index.ancestor.contains("Deep"));
    assert!(!index.ancestor.contains("Flat"));
    assert!(!index.parent_slug.contains("Flat"));
}

#[test]
fn test_parent_slug_patterns_reach_children_only() {
    let tree = blog_tree();
    let analyzer = ImpactAnalyzer::new(tree.clone(), engine());
    let blog = tree.get_node(BLOG).unwrap().unwrap();

    let impact = analyzer.analyze(&blog).unwrap();
    assert_eq!(
        impact,
        Impact {
            siblings: false,
            descendants: false,
            children: true,
        }
    );

    let post = tree.get_node(POST_1).unwrap().unwrap();
    assert_eq!(analyzer.analyze(&post).unwrap(), Impact::default());
}

#[test]
fn test_invalidate_picks_up_new_patterns() {
    let tree = blog_tree();
    let analyzer = ImpactAnalyzer::new(tree.clone(), engine());
    assert!(!analyzer.needs_order_rebuild(BLOG).unwrap());

    tree.set_pattern("Post", "{% ParentSlug %}/{% NodeOrder %}");
    assert!(
        !analyzer.needs_order_rebuild(BLOG).unwrap(),
        "the index is cached until invalidated"
    );

    analyzer.invalidate();
    assert!(analyzer.needs_order_rebuild(BLOG).unwrap());
    assert!(!analyzer.needs_order_rebuild(ROOT).unwrap());

    let post = tree.get_node(POST_2).unwrap().unwrap();
    assert!(analyzer.needs_sibling_rebuild(&post).unwrap());
    let root = tree.get_node(ROOT).unwrap().unwrap();
    assert!(!analyzer.needs_sibling_rebuild(&root).unwrap());
}

#[test]
fn test_descendant_rebuild_is_scoped_to_the_subtree() {
    let tree = blog_tree();
    tree.set_pattern("Post", "{% NodeAliasPath %}");
    let analyzer = ImpactAnalyzer::new(tree.clone(), engine());

    assert!(analyzer.needs_descendant_rebuild(ROOT).unwrap());
    assert!(analyzer.needs_descendant_rebuild(BLOG).unwrap());
    assert!(!analyzer.needs_descendant_rebuild(ABOUT).unwrap());
    assert!(!analyzer.needs_descendant_rebuild(POST_1).unwrap());
}
