//! Shared fixtures for unit tests

use crate::{
    builder::TreeBuilder,
    config::{SiteConfig, SlugConfig, SlugConfigProvider, StaticConfigProvider},
    nodeitem::{NodeItem, NodeUrlSlug},
    properties::{NodeId, SlugRecord},
    render::SlugRenderer,
    settings::BuilderSettings,
    store::MemoryStore,
    template::{PlaceholderExpander, TemplateEngine},
    tree::MemoryTree,
};
use std::sync::Arc;

pub const SITE: &str = "main";
pub const EN: &str = "en-US";
pub const FR: &str = "fr-FR";

pub const ROOT: NodeId = NodeId(1);
pub const BLOG: NodeId = NodeId(2);
pub const POST_1: NodeId = NodeId(3);
pub const POST_2: NodeId = NodeId(4);
pub const ABOUT: NodeId = NodeId(5);

pub const CHILD_PATTERN: &str = "{% ParentSlug %}/{% DocumentName %}";

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// A two culture site:
///
/// ```text
/// / (Root)
/// ├── blog (Section)
/// │   ├── post-1 (Post)
/// │   └── post-2 (Post)
/// └── about (Page)
/// ```
pub fn blog_tree() -> Arc<MemoryTree> {
    init_logging();
    let tree = MemoryTree::new();
    tree.add_site(SITE, &[EN, FR], EN);
    tree.set_pattern("Root", "");
    tree.set_pattern("Section", CHILD_PATTERN);
    tree.set_pattern("Post", CHILD_PATTERN);
    tree.set_pattern("Page", CHILD_PATTERN);
    tree.add_root(ROOT, SITE, "Root");
    tree.add_page(BLOG, ROOT, "Section", &[(EN, "blog"), (FR, "journal")])
        .unwrap();
    tree.add_page(POST_1, BLOG, "Post", &[(EN, "post-1"), (FR, "article-1")])
        .unwrap();
    tree.add_page(POST_2, BLOG, "Post", &[(EN, "post-2")]).unwrap();
    tree.add_page(ABOUT, ROOT, "Page", &[(EN, "About Us")])
        .unwrap();
    Arc::new(tree)
}

pub fn config_provider(site_config: SiteConfig) -> Arc<StaticConfigProvider> {
    Arc::new(StaticConfigProvider::new(SlugConfig {
        defaults: site_config,
        ..Default::default()
    }))
}

pub fn engine() -> Arc<dyn TemplateEngine> {
    Arc::new(PlaceholderExpander)
}

pub fn settings(tree: &MemoryTree, site_config: &SiteConfig) -> Arc<BuilderSettings> {
    Arc::new(BuilderSettings::for_site(SITE, tree, site_config).unwrap())
}

pub fn tree_builder(
    tree: Arc<MemoryTree>,
    config: Arc<dyn SlugConfigProvider>,
    store: MemoryStore,
) -> TreeBuilder<MemoryStore> {
    TreeBuilder::new(tree, SlugRenderer::new(engine()), config, store)
}

pub fn record(node: NodeId, culture: &str, slug: &str, is_custom: bool) -> SlugRecord {
    SlugRecord::new(SITE, node, culture, slug, is_custom)
}

/// A detached item holding the given freshly rendered slugs.
pub fn item(node: NodeId, slugs: &[(&str, &str)], settings: Arc<BuilderSettings>) -> NodeItem {
    NodeItem {
        node_id: node,
        parent_id: None,
        class_name: "Page".to_string(),
        is_container: false,
        slugs: slugs
            .iter()
            .map(|(culture, slug)| NodeUrlSlug::new(culture, slug, *culture == EN))
            .collect(),
        children: Vec::new(),
        children_loaded: false,
        build_children: false,
        force_child: None,
        saved: false,
        settings,
    }
}
