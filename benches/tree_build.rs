//! Benchmarks for building and reconciling slug trees
//!
//! Run with: cargo bench
//!
//! These benchmarks measure:
//! - A full synchronous site rebuild of a wide site
//! - Re-checking an already generated site, where nothing changes
//! - Building a preview without writing

use criterion::{criterion_group, criterion_main, Criterion};
use noet_slugs::{
    config::{ConflictPolicy, GenerationMode, SiteConfig, SlugConfig, StaticConfigProvider},
    engine::{SlugEngine, Trigger},
    properties::NodeId,
    store::MemoryStore,
    template::PlaceholderExpander,
    tree::MemoryTree,
};
use std::sync::Arc;

const SITE: &str = "main";
const ROOT: NodeId = NodeId(1);
const PAGES: i64 = 500;

fn wide_tree() -> Arc<MemoryTree> {
    let tree = MemoryTree::new();
    tree.add_site(SITE, &["en-US", "fr-FR"], "en-US");
    tree.set_pattern("Root", "");
    tree.set_pattern("Page", "{% ParentSlug %}/{% DocumentName %}");
    tree.add_root(ROOT, SITE, "Root");
    for i in 0..PAGES {
        let en = format!("Page {i}");
        let fr = format!("Page {i} fr");
        tree.add_page(
            NodeId(100 + i),
            ROOT,
            "Page",
            &[("en-US", en.as_str()), ("fr-FR", fr.as_str())],
        )
        .unwrap();
    }
    Arc::new(tree)
}

fn engine(tree: Arc<MemoryTree>) -> SlugEngine<MemoryStore> {
    let config = SlugConfig {
        defaults: SiteConfig {
            mode: GenerationMode::Synchronous,
            conflict_policy: ConflictPolicy::Append,
            ..Default::default()
        },
        ..Default::default()
    };
    SlugEngine::new(
        tree,
        Arc::new(PlaceholderExpander),
        Arc::new(StaticConfigProvider::new(config)),
        MemoryStore::new(),
        None,
    )
    .unwrap()
}

// Benchmark: Generate every slug of a fresh site
fn bench_full_rebuild(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let tree = wide_tree();

    c.bench_function("full_site_rebuild", |b| {
        b.to_async(&rt).iter(|| async {
            let engine = engine(tree.clone());
            let outcome = engine
                .handle(Trigger::SiteRebuild(SITE.to_string()))
                .await
                .unwrap();
            outcome.summary.inserted
        });
    });
}

// Benchmark: Rebuild a site whose slugs are already up to date
fn bench_unchanged_rebuild(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = engine(wide_tree());
    rt.block_on(engine.handle(Trigger::SiteRebuild(SITE.to_string())))
        .unwrap();

    c.bench_function("unchanged_site_rebuild", |b| {
        b.to_async(&rt).iter(|| async {
            let outcome = engine
                .handle(Trigger::SiteRebuild(SITE.to_string()))
                .await
                .unwrap();
            outcome.summary.updated
        });
    });
}

// Benchmark: Build the whole tree in memory without committing
fn bench_preview(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = engine(wide_tree());

    c.bench_function("preview_site", |b| {
        b.to_async(&rt).iter(|| async {
            let item = engine.preview(ROOT).await.unwrap();
            item.children.len()
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets =
        bench_full_rebuild,
        bench_unchanged_rebuild,
        bench_preview
}

criterion_main!(benches);
