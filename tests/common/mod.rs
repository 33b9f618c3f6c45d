//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use noet_slugs::{
    config::{ConflictPolicy, GenerationMode, SiteConfig, SlugConfig, StaticConfigProvider},
    engine::SlugEngine,
    event::SlugEvent,
    properties::NodeId,
    store::SlugRepository,
    template::PlaceholderExpander,
    tree::MemoryTree,
};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

#[allow(dead_code)]
pub const SITE: &str = "main";
#[allow(dead_code)]
pub const EN: &str = "en-US";
#[allow(dead_code)]
pub const FR: &str = "fr-FR";

#[allow(dead_code)]
pub const ROOT: NodeId = NodeId(1);
#[allow(dead_code)]
pub const BLOG: NodeId = NodeId(2);
#[allow(dead_code)]
pub const POST_1: NodeId = NodeId(3);
#[allow(dead_code)]
pub const POST_2: NodeId = NodeId(4);
#[allow(dead_code)]
pub const ABOUT: NodeId = NodeId(5);

#[allow(dead_code)]
pub const CHILD_PATTERN: &str = "{% ParentSlug %}/{% DocumentName %}";

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times, later calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Everything an engine test drives: the tree to edit, the config to tweak, the engine and
/// the events it emitted.
#[allow(dead_code)]
pub struct Fixture<S> {
    pub tree: Arc<MemoryTree>,
    pub config: Arc<StaticConfigProvider>,
    pub engine: SlugEngine<S>,
    pub events: UnboundedReceiver<SlugEvent>,
}

#[allow(dead_code)]
impl<S: SlugRepository> Fixture<S> {
    pub fn new(tree: Arc<MemoryTree>, site_config: SiteConfig, store: S) -> Self {
        Self::with_config(
            tree,
            SlugConfig {
                defaults: site_config,
                ..Default::default()
            },
            store,
        )
    }

    pub fn with_config(tree: Arc<MemoryTree>, config: SlugConfig, store: S) -> Self {
        init_logging();
        let config = Arc::new(StaticConfigProvider::new(config));
        let (tx, events) = unbounded_channel();
        let engine = SlugEngine::new(
            tree.clone(),
            Arc::new(PlaceholderExpander),
            config.clone(),
            store,
            Some(tx),
        )
        .unwrap();
        Fixture {
            tree,
            config,
            engine,
            events,
        }
    }

    pub fn store(&self) -> &S {
        self.engine.store()
    }

    /// Change the default site config for every following trigger.
    pub fn configure<F: FnOnce(&mut SiteConfig)>(&self, f: F) {
        self.config.update(|config| f(&mut config.defaults));
    }

    /// Events emitted since the last call.
    pub fn take_events(&mut self) -> Vec<SlugEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn slug(&self, node: NodeId, culture: &str) -> Option<String> {
        self.engine
            .resolver()
            .get_slug_for_node(node, culture)
            .await
            .unwrap()
    }
}

/// Resolve everything inline and skip conflicting slugs.
#[allow(dead_code)]
pub fn synchronous() -> SiteConfig {
    SiteConfig {
        mode: GenerationMode::Synchronous,
        conflict_policy: ConflictPolicy::Skip,
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn strict() -> SiteConfig {
    SiteConfig {
        mode: GenerationMode::Synchronous,
        conflict_policy: ConflictPolicy::Error,
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn deferred() -> SiteConfig {
    SiteConfig {
        mode: GenerationMode::Deferred,
        conflict_policy: ConflictPolicy::Skip,
        ..Default::default()
    }
}

/// A two culture site:
///
/// ```text
/// / (Root)
/// ├── blog (Section)        fr: journal
/// │   ├── post-1 (Post)     fr: article-1
/// │   └── post-2 (Post)
/// └── About Us (Page)
/// ```
#[allow(dead_code)]
pub fn blog_tree() -> Arc<MemoryTree> {
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

/// A single culture site with `count` pages directly below the root.
#[allow(dead_code)]
pub fn wide_tree(count: i64) -> Arc<MemoryTree> {
    let tree = MemoryTree::new();
    tree.add_site(SITE, &[EN], EN);
    tree.set_pattern("Root", "");
    tree.set_pattern("Page", CHILD_PATTERN);
    tree.add_root(ROOT, SITE, "Root");
    for i in 0..count {
        let name = format!("page-{i}");
        tree.add_page(NodeId(100 + i), ROOT, "Page", &[(EN, name.as_str())])
            .unwrap();
    }
    Arc::new(tree)
}
