//! Tests for collision detection and the conflict policies

use super::helpers::*;
use crate::{
    config::{ConflictPolicy, SiteConfig},
    conflict::{apply_policy, skip_conflicting, ConflictDetector},
    nodeitem::NodeItem,
    store::MemoryStore,
};
use test_log::test;

fn seeded_settings(store: &MemoryStore) -> std::sync::Arc<crate::settings::BuilderSettings> {
    let tree = blog_tree();
    store.insert_record(record(ROOT, EN, "/", false));
    settings(&tree, &SiteConfig::default())
}

#[test(tokio::test)]
async fn test_persisted_slug_of_another_node_conflicts() {
    let store = MemoryStore::new();
    let settings = seeded_settings(&store);
    store.insert_record(record(ABOUT, EN, "/about", false));

    let blog = item(BLOG, &[(EN, "/about")], settings);
    let conflicts = ConflictDetector::new(&store, SITE)
        .find_conflicts(&[&blog])
        .await
        .unwrap();

    assert_eq!(conflicts.len(), 1);
    let conflict = conflicts.iter().next().unwrap();
    assert_eq!(conflict.node_id, BLOG);
    assert_eq!(conflict.existing_node, ABOUT);
    assert_eq!(conflict.slug, "/about");
    assert_eq!(
        conflict.to_string(),
        "'/about' for node 2 (en-US) is already used by node 5 (en-US) on site 'main'"
    );
}

#[test(tokio::test)]
async fn test_duplicate_within_one_pass_conflicts() {
    let store = MemoryStore::new();
    let settings = seeded_settings(&store);
    let blog = item(BLOG, &[(EN, "/news")], settings.clone());
    let about = item(ABOUT, &[(EN, "/news")], settings);

    let conflicts = ConflictDetector::new(&store, SITE)
        .find_conflicts(&[&blog, &about])
        .await
        .unwrap();

    assert_eq!(conflicts.len(), 1);
    let conflict = conflicts.iter().next().unwrap();
    assert_eq!(conflict.node_id, ABOUT);
    assert_eq!(conflict.existing_node, BLOG);
    assert!(conflicts.into_result().is_err());
}

#[test(tokio::test)]
async fn test_cultures_of_one_node_may_share_a_slug() {
    let store = MemoryStore::new();
    let settings = seeded_settings(&store);
    store.insert_record(record(BLOG, FR, "/blog", false));

    let blog = item(BLOG, &[(EN, "/blog"), (FR, "/blog")], settings);
    let conflicts = ConflictDetector::new(&store, SITE)
        .find_conflicts(&[&blog])
        .await
        .unwrap();
    assert!(conflicts.into_result().is_ok());
}

#[test(tokio::test)]
async fn test_swapping_slugs_is_not_a_conflict() {
    let store = MemoryStore::new();
    let settings = seeded_settings(&store);
    let blog_record = record(BLOG, EN, "/a", false);
    let about_record = record(ABOUT, EN, "/b", false);
    store.insert_record(blog_record.clone());
    store.insert_record(about_record.clone());

    let mut blog = item(BLOG, &[], settings.clone());
    let mut slug = crate::nodeitem::NodeUrlSlug::from_record(&blog_record, EN);
    slug.slug = "/b".to_string();
    slug.is_new_or_updated = true;
    blog.slugs.push(slug);

    let mut about = item(ABOUT, &[], settings);
    let mut slug = crate::nodeitem::NodeUrlSlug::from_record(&about_record, EN);
    slug.slug = "/a".to_string();
    slug.is_new_or_updated = true;
    about.slugs.push(slug);

    let conflicts = ConflictDetector::new(&store, SITE)
        .find_conflicts(&[&blog, &about])
        .await
        .unwrap();
    assert!(conflicts.is_empty(), "{conflicts}");
}

#[test(tokio::test)]
async fn test_append_finds_the_first_free_suffix() {
    let store = MemoryStore::new();
    let settings = seeded_settings(&store);
    store.insert_record(record(ABOUT, EN, "/about", false));
    store.insert_record(record(POST_2, EN, "/about-1", false));

    let mut items = vec![item(BLOG, &[(EN, "/about")], settings)];
    let detector = ConflictDetector::new(&store, SITE);
    let refs: Vec<&NodeItem> = items.iter().collect();
    let conflicts = detector.find_conflicts(&refs).await.unwrap();
    assert_eq!(conflicts.len(), 1);

    let unresolved = apply_policy(&detector, &mut items, conflicts, ConflictPolicy::Append, 5)
        .await
        .unwrap();

    assert!(unresolved.is_empty());
    assert_eq!(items[0].slug_text(EN), "/about-2");
}

#[test(tokio::test)]
async fn test_append_gives_up_after_max_attempts() {
    let store = MemoryStore::new();
    let settings = seeded_settings(&store);
    store.insert_record(record(ABOUT, EN, "/about", false));
    store.insert_record(record(POST_2, EN, "/about-1", false));

    let mut items = vec![item(BLOG, &[(EN, "/about")], settings)];
    let detector = ConflictDetector::new(&store, SITE);
    let refs: Vec<&NodeItem> = items.iter().collect();
    let conflicts = detector.find_conflicts(&refs).await.unwrap();

    let unresolved = apply_policy(&detector, &mut items, conflicts, ConflictPolicy::Append, 1)
        .await
        .unwrap();

    assert_eq!(unresolved.len(), 1);
    assert!(items[0].slugs.is_empty(), "a new slug without a free text is dropped");
}

#[test(tokio::test)]
async fn test_error_policy_keeps_items_untouched() {
    let store = MemoryStore::new();
    let settings = seeded_settings(&store);
    store.insert_record(record(ABOUT, EN, "/about", false));

    let mut items = vec![item(BLOG, &[(EN, "/about")], settings)];
    let detector = ConflictDetector::new(&store, SITE);
    let refs: Vec<&NodeItem> = items.iter().collect();
    let conflicts = detector.find_conflicts(&refs).await.unwrap();

    let remaining = apply_policy(&detector, &mut items, conflicts, ConflictPolicy::Error, 5)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(items[0].slug_text(EN), "/about");
}

#[test(tokio::test)]
async fn test_skip_reverts_to_the_persisted_text() {
    let store = MemoryStore::new();
    let settings = seeded_settings(&store);
    let blog_record = record(BLOG, EN, "/blog", false);
    store.insert_record(blog_record.clone());
    store.insert_record(record(ABOUT, EN, "/about", false));

    let mut blog = item(BLOG, &[(FR, "/about")], settings);
    let mut slug = crate::nodeitem::NodeUrlSlug::from_record(&blog_record, EN);
    slug.slug = "/about".to_string();
    slug.is_new_or_updated = true;
    blog.slugs.push(slug);
    let mut items = vec![blog];

    let refs: Vec<&NodeItem> = items.iter().collect();
    let conflicts = ConflictDetector::new(&store, SITE)
        .find_conflicts(&refs)
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 2);
    skip_conflicting(&mut items, &conflicts);

    let blog = &items[0];
    assert_eq!(blog.slugs.len(), 1);
    let en = blog.get_slug(EN).unwrap();
    assert_eq!(en.slug, "/blog");
    assert!(!en.is_new_or_updated);
}

#[test(tokio::test)]
async fn test_rebuild_from_scratch_only_sees_custom_records() {
    let store = MemoryStore::new();
    let settings = seeded_settings(&store);
    store.insert_record(record(ABOUT, EN, "/about", false));
    store.insert_record(record(POST_1, EN, "/team", true));

    let blog = item(BLOG, &[(EN, "/about")], settings.clone());
    let detector = ConflictDetector::new(&store, SITE).ignoring_generated(true);
    assert!(detector.find_conflicts(&[&blog]).await.unwrap().is_empty());

    let blog = item(BLOG, &[(EN, "/team")], settings);
    assert_eq!(detector.find_conflicts(&[&blog]).await.unwrap().len(), 1);
}
