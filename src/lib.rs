//! # noet-slugs
//!
//! Derives, reconciles and persists per-culture URL slugs for a hierarchical content tree.
//!
//! ## Overview
//!
//! Every node of a content tree gets one slug per culture, rendered from its class's URL
//! pattern. Patterns may reference the parent's slug, the node's position among its siblings
//! or its depth, so a single edit can change slugs far away from the edited node. noet-slugs
//! works out how far an edit reaches, rebuilds exactly that part of the tree, refuses or
//! renames slugs that would collide with another node's, and writes the result as one unit
//! of work. Large subtrees can be handed to a durable background queue that survives crashes.
//!
//! ### Key Features
//!
//! - **Impact analysis**: decides from the URL patterns whether siblings, children or whole
//!   subtrees must be rebuilt
//! - **Conflict policies**: abort, skip, or append a numeric suffix on collisions
//! - **Custom slugs**: manually authored slugs are never overwritten
//! - **Redirect bookkeeping**: previous slugs are kept as alternate URLs
//! - **Durable generation queue**: serialized per process, reaps entries of dead workers
//! - **Routing reads**: cached URL→node and node→slug lookups, cleared on every commit
//!
//! ## Architecture
//!
//! - **[`tree`]** / **[`template`]** / **[`config`]**: the collaborators the engine reads from
//! - **[`render`]**: renders one (node, culture) slug
//! - **[`builder`]**: builds the in-memory [`nodeitem::NodeItem`] tree for a pass
//! - **[`impact`]**: decides which nodes a change reaches
//! - **[`conflict`]**: finds and resolves collisions with other nodes' slugs
//! - **[`persist`]**: stages and commits a pass through a [`store::SlugStore`]
//! - **[`queue`]**: the durable generation queue
//! - **[`resolver`]**: read APIs used for routing
//! - **[`engine`]**: turns content [`engine::Trigger`]s into all of the above
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use noet_slugs::{
//!     config::{SlugConfig, StaticConfigProvider},
//!     engine::{SlugEngine, Trigger},
//!     properties::NodeId,
//!     store::MemoryStore,
//!     template::PlaceholderExpander,
//!     tree::MemoryTree,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tree = Arc::new(MemoryTree::new());
//!     tree.add_site("main", &["en-US"], "en-US");
//!     tree.set_pattern("Root", "");
//!     tree.set_pattern("Page", "{% ParentSlug %}/{% DocumentName %}");
//!     tree.add_root(NodeId(1), "main", "Root");
//!     tree.add_page(NodeId(2), NodeId(1), "Page", &[("en-US", "About Us")])?;
//!
//!     let engine = SlugEngine::new(
//!         tree.clone(),
//!         Arc::new(PlaceholderExpander),
//!         Arc::new(StaticConfigProvider::new(SlugConfig::default())),
//!         MemoryStore::new(),
//!         None,
//!     )?;
//!     engine.queue().start(&tokio::runtime::Handle::current());
//!     engine.handle(Trigger::DocumentInserted(NodeId(2))).await?;
//!
//!     let node = engine
//!         .resolver()
//!         .resolve_url_to_node("/About Us", "en-US", "main")
//!         .await?;
//!     assert_eq!(node, Some(NodeId(2)));
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **default**: everything plus the SQLite store
//! - **service**: the SQLite-backed [`db::DbConnection`] (`sqlx`)
//! - **bin**: the `noet-slugs` admin CLI

pub mod builder;
pub mod config;
pub mod conflict;
#[cfg(feature = "service")]
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod impact;
pub mod nodeitem;
pub mod paths;
pub mod persist;
pub mod properties;
pub mod queue;
pub mod render;
pub mod resolver;
pub mod settings;
pub mod store;
pub mod template;
#[cfg(test)]
mod tests;
pub mod tree;

pub use error::*;
