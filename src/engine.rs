//! Entry point for content changes.
//!
//! [SlugEngine::handle] turns a [Trigger] into one or more rebuild targets, using the
//! [ImpactAnalyzer] to decide how far each reaches, and runs them in the site's
//! [GenerationMode]:
//!
//! - Deferred: the target node is built and saved inline (with its immediate children when
//!   `sync_children` is set) and whatever remains of its subtree is queued.
//! - Synchronous: the whole affected subtree is resolved before `handle` returns. Combined
//!   with [ConflictPolicy::Error] nothing is written unless the whole subtree is free of
//!   conflicts.
//!
//! Several triggers raised for the same edit can share one [OperationContext], which keeps
//! each (entity, phase) from being processed twice.
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    builder::TreeBuilder,
    config::{ConflictPolicy, GenerationMode, SiteConfig, SlugConfigProvider},
    conflict::ConflictList,
    error::SlugError,
    event::{EventSink, SlugEvent},
    impact::{Impact, ImpactAnalyzer},
    nodeitem::NodeItem,
    persist::{Reconciler, Staging},
    properties::{ContentNode, NodeId, SlugRecord},
    queue::GenerationQueue,
    render::SlugRenderer,
    resolver::{SlugCache, SlugResolver},
    settings::BuilderSettings,
    store::{ChangeSet, CommitSummary, SlugChange, SlugRepository},
    template::TemplateEngine,
    tree::ContentTree,
};

/// A change in the content tree that may invalidate slugs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    DocumentInserted(NodeId),
    /// A document's name or fields changed.
    DocumentUpdated(NodeId),
    /// The node now sits below its current parent; `old_parent` is where it came from.
    DocumentMoved {
        node: NodeId,
        old_parent: Option<NodeId>,
    },
    /// The tree no longer has the removed nodes, so their ids and the parent they were
    /// removed from come with the trigger.
    DocumentDeleted {
        site: String,
        parent: Option<NodeId>,
        removed: Vec<NodeId>,
    },
    /// Children of the given parent changed order.
    DocumentsReordered(NodeId),
    ClassPatternChanged {
        site: String,
        class_name: String,
    },
    CultureSettingsChanged(String),
    /// Check every slug of a site against its current data.
    SiteRebuild(String),
    /// Throw away every generated slug of a site and generate them again.
    RegenerateSite(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Entity {
    Node(NodeId),
    Site(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// The node and whatever below it its changes reach.
    Rebuild,
    /// The immediate children of the node.
    Children,
    Delete,
    Regenerate,
}

/// Work already done within one logical operation.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    visited: BTreeSet<(Entity, Phase)>,
}

impl OperationContext {
    pub fn new() -> Self {
        OperationContext::default()
    }

    /// Record a visit. Returns false when (entity, phase) was already visited.
    pub fn first_visit(&mut self, entity: Entity, phase: Phase) -> bool {
        self.visited.insert((entity, phase))
    }

    pub fn has_visited(&self, entity: &Entity, phase: Phase) -> bool {
        self.visited.contains(&(entity.clone(), phase))
    }

    pub fn len(&self) -> usize {
        self.visited.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visited.is_empty()
    }
}

/// What handling a trigger did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub summary: CommitSummary,
    /// Queue entries created for deferred subtrees.
    pub queued: Vec<i64>,
}

impl Outcome {
    fn absorb(&mut self, other: Outcome) {
        self.summary.absorb(other.summary);
        self.queued.extend(other.queued);
    }
}

struct Target {
    node: NodeId,
    settings: Arc<BuilderSettings>,
    force_children: bool,
    force_child: Option<NodeId>,
    seed: ChangeSet,
}

pub struct SlugEngine<S> {
    tree: Arc<dyn ContentTree>,
    config: Arc<dyn SlugConfigProvider>,
    impact: ImpactAnalyzer,
    reconciler: Reconciler<S>,
    queue: GenerationQueue<S>,
    resolver: SlugResolver<S>,
}

impl<S: SlugRepository> SlugEngine<S> {
    pub fn new(
        tree: Arc<dyn ContentTree>,
        templates: Arc<dyn TemplateEngine>,
        config: Arc<dyn SlugConfigProvider>,
        store: S,
        events: Option<UnboundedSender<SlugEvent>>,
    ) -> Result<Self, SlugError> {
        let cache = SlugCache::new();
        let builder = TreeBuilder::new(
            tree.clone(),
            SlugRenderer::new(templates.clone()),
            config.clone(),
            store.clone(),
        );
        let reconciler = Reconciler::new(
            store.clone(),
            builder,
            config.clone(),
            EventSink::new(events),
            cache.clone(),
        );
        let queue = GenerationQueue::new(reconciler.clone(), config.queue_config()?);
        let resolver = SlugResolver::new(store, tree.clone(), config.clone(), cache);
        Ok(SlugEngine {
            impact: ImpactAnalyzer::new(tree.clone(), templates),
            tree,
            config,
            reconciler,
            queue,
            resolver,
        })
    }

    pub fn queue(&self) -> &GenerationQueue<S> {
        &self.queue
    }

    pub fn resolver(&self) -> &SlugResolver<S> {
        &self.resolver
    }

    pub fn impact(&self) -> &ImpactAnalyzer {
        &self.impact
    }

    pub fn reconciler(&self) -> &Reconciler<S> {
        &self.reconciler
    }

    pub fn store(&self) -> &S {
        self.reconciler.store()
    }

    fn load(&self, node: NodeId) -> Result<ContentNode, SlugError> {
        self.tree
            .get_node(node)?
            .ok_or_else(|| SlugError::Load(format!("node {node} no longer exists")))
    }

    fn settings_for<F>(&self, site: &str, adjust: F) -> Result<Arc<BuilderSettings>, SlugError>
    where
        F: FnOnce(&mut BuilderSettings),
    {
        let site_config = self.config.site_config(site)?;
        let mut settings = BuilderSettings::for_site(site, self.tree.as_ref(), &site_config)?;
        adjust(&mut settings);
        Ok(Arc::new(settings))
    }

    /// Handle one trigger in its own operation.
    pub async fn handle(&self, trigger: Trigger) -> Result<Outcome, SlugError> {
        let mut ctx = OperationContext::new();
        self.handle_in(&mut ctx, trigger).await
    }

    /// Handle triggers raised by the same edit, processing each (entity, phase) once.
    pub async fn handle_all<I>(&self, triggers: I) -> Result<Outcome, SlugError>
    where
        I: IntoIterator<Item = Trigger>,
    {
        let mut ctx = OperationContext::new();
        let mut outcome = Outcome::default();
        for trigger in triggers {
            outcome.absorb(self.handle_in(&mut ctx, trigger).await?);
        }
        Ok(outcome)
    }

    #[tracing::instrument(skip(self, ctx))]
    pub async fn handle_in(
        &self,
        ctx: &mut OperationContext,
        trigger: Trigger,
    ) -> Result<Outcome, SlugError> {
        match trigger {
            Trigger::DocumentInserted(node) => {
                let node = self.load(node)?;
                let impact = self.impact.analyze(&node)?;
                self.rebuild_placed(ctx, &node, impact).await
            }
            Trigger::DocumentUpdated(node) => {
                let node = self.load(node)?;
                let impact = Impact {
                    siblings: false,
                    ..self.impact.analyze(&node)?
                };
                self.rebuild_placed(ctx, &node, impact).await
            }
            Trigger::DocumentMoved { node, old_parent } => {
                let node = self.load(node)?;
                let mut outcome = Outcome::default();
                if let Some(old_parent) = old_parent.filter(|p| Some(*p) != node.parent_id) {
                    if self.impact.needs_order_rebuild(old_parent)? {
                        outcome.absorb(
                            self.rebuild_children_of(ctx, &node.site, old_parent)
                                .await?,
                        );
                    }
                }
                let impact = self.impact.analyze(&node)?;
                outcome.absorb(self.rebuild_placed(ctx, &node, impact).await?);
                Ok(outcome)
            }
            Trigger::DocumentDeleted {
                site,
                parent,
                removed,
            } => self.delete_nodes(ctx, &site, parent, removed).await,
            Trigger::DocumentsReordered(parent) => {
                let site = self.load(parent)?.site;
                if self.impact.needs_order_rebuild(parent)? {
                    self.rebuild_children_of(ctx, &site, parent).await
                } else {
                    tracing::debug!(
                        "[SlugEngine] No pattern below node {} depends on order",
                        parent
                    );
                    Ok(Outcome::default())
                }
            }
            Trigger::ClassPatternChanged { site, class_name } => {
                self.impact.invalidate();
                let mut outcome = Outcome::default();
                for id in self.tree.nodes_of_class(&site, &class_name)? {
                    let node = self.load(id)?;
                    let impact = Impact {
                        siblings: false,
                        ..self.impact.analyze(&node)?
                    };
                    outcome.absorb(self.rebuild_placed(ctx, &node, impact).await?);
                }
                Ok(outcome)
            }
            Trigger::CultureSettingsChanged(site) | Trigger::RegenerateSite(site) => {
                self.regenerate(ctx, &site).await
            }
            Trigger::SiteRebuild(site) => {
                if !ctx.first_visit(Entity::Site(site.clone()), Phase::Rebuild) {
                    return Ok(Outcome::default());
                }
                let root = self.site_root(&site)?;
                let settings = self.settings_for(&site, |s| s.rebuild_descendants = true)?;
                self.run_target(
                    ctx,
                    Phase::Rebuild,
                    Target {
                        node: root,
                        settings,
                        force_children: true,
                        force_child: None,
                        seed: ChangeSet::new(),
                    },
                )
                .await
            }
        }
    }

    fn site_root(&self, site: &str) -> Result<NodeId, SlugError> {
        self.tree
            .site_root(site)?
            .ok_or_else(|| SlugError::Load(format!("site '{site}' has no root node")))
    }

    /// Rebuild a node that appeared, changed or moved. When sibling order matters the parent's
    /// children are rebuilt shallowly with the node itself forced to recurse.
    async fn rebuild_placed(
        &self,
        ctx: &mut OperationContext,
        node: &ContentNode,
        impact: Impact,
    ) -> Result<Outcome, SlugError> {
        let mut outcome = Outcome::default();
        let parent = node.parent_id.filter(|_| impact.siblings);
        if let Some(parent) = parent {
            let settings = self.settings_for(&node.site, |s| {
                s.rebuild_siblings = true;
                s.rebuild_children = true;
            })?;
            outcome.absorb(
                self.run_target(
                    ctx,
                    Phase::Children,
                    Target {
                        node: parent,
                        settings,
                        force_children: true,
                        force_child: Some(node.id),
                        seed: ChangeSet::new(),
                    },
                )
                .await?,
            );
            if !impact.descendants {
                return Ok(outcome);
            }
        }
        let settings = self.settings_for(&node.site, |s| {
            s.rebuild_descendants = impact.descendants;
            s.rebuild_children = impact.children;
        })?;
        outcome.absorb(
            self.run_target(
                ctx,
                Phase::Rebuild,
                Target {
                    node: node.id,
                    settings,
                    force_children: impact.children || impact.descendants,
                    force_child: None,
                    seed: ChangeSet::new(),
                },
            )
            .await?,
        );
        Ok(outcome)
    }

    async fn rebuild_children_of(
        &self,
        ctx: &mut OperationContext,
        site: &str,
        parent: NodeId,
    ) -> Result<Outcome, SlugError> {
        let settings = self.settings_for(site, |s| {
            s.rebuild_siblings = true;
            s.rebuild_children = true;
        })?;
        self.run_target(
            ctx,
            Phase::Children,
            Target {
                node: parent,
                settings,
                force_children: true,
                force_child: None,
                seed: ChangeSet::new(),
            },
        )
        .await
    }

    async fn delete_nodes(
        &self,
        ctx: &mut OperationContext,
        site: &str,
        parent: Option<NodeId>,
        removed: Vec<NodeId>,
    ) -> Result<Outcome, SlugError> {
        let removed: Vec<NodeId> = removed
            .into_iter()
            .filter(|id| ctx.first_visit(Entity::Node(*id), Phase::Delete))
            .collect();
        let mut outcome = Outcome::default();
        if !removed.is_empty() {
            tracing::info!(
                "[SlugEngine] Removing slugs of {} deleted nodes on '{}'",
                removed.len(),
                site
            );
            let mut seed = ChangeSet::new();
            seed.push(SlugChange::DeleteForNodes(removed));
            outcome.summary = self.reconciler.commit(Staging::new(seed, &[], false)).await?;
        }
        if let Some(parent) = parent {
            if self.tree.get_node(parent)?.is_some() && self.impact.needs_order_rebuild(parent)? {
                outcome.absorb(self.rebuild_children_of(ctx, site, parent).await?);
            }
        }
        Ok(outcome)
    }

    async fn regenerate(
        &self,
        ctx: &mut OperationContext,
        site: &str,
    ) -> Result<Outcome, SlugError> {
        if !ctx.first_visit(Entity::Site(site.to_string()), Phase::Regenerate) {
            return Ok(Outcome::default());
        }
        tracing::info!("[SlugEngine] Regenerating every generated slug of '{}'", site);
        let root = self.site_root(site)?;
        let settings = self.settings_for(site, |s| {
            s.check_for_updates = false;
            s.rebuild_descendants = true;
        })?;
        let mut seed = ChangeSet::new();
        seed.push(SlugChange::DeleteGenerated {
            site: site.to_string(),
        });
        self.run_target(
            ctx,
            Phase::Rebuild,
            Target {
                node: root,
                settings,
                force_children: true,
                force_child: None,
                seed,
            },
        )
        .await
    }

    async fn run_target(
        &self,
        ctx: &mut OperationContext,
        phase: Phase,
        target: Target,
    ) -> Result<Outcome, SlugError> {
        if !ctx.first_visit(Entity::Node(target.node), phase) {
            tracing::debug!(
                "[SlugEngine] Node {} already handled in this operation ({:?})",
                target.node,
                phase
            );
            return Ok(Outcome::default());
        }
        let site_config = self.config.site_config(&target.settings.site)?;
        let mut item = self
            .reconciler
            .builder()
            .build_node(target.node, target.settings, target.force_children)
            .await?;
        if target.force_child.is_some() {
            item.force_child = target.force_child;
            item.build_children = true;
        }
        match site_config.mode {
            GenerationMode::Synchronous => {
                self.run_synchronous(&mut item, &site_config, target.seed)
                    .await
            }
            GenerationMode::Deferred => self.run_deferred(item, &site_config, target.seed).await,
        }
    }

    async fn run_synchronous(
        &self,
        item: &mut NodeItem,
        site_config: &SiteConfig,
        seed: ChangeSet,
    ) -> Result<Outcome, SlugError> {
        let mut outcome = Outcome::default();
        if site_config.conflict_policy == ConflictPolicy::Error {
            outcome.summary = self.reconciler.reconcile_tree_strict(item, seed).await?;
            return Ok(outcome);
        }
        outcome.summary = self
            .reconciler
            .reconcile_level(std::slice::from_mut(item), site_config, seed)
            .await?;
        outcome.summary.absorb(
            self.reconciler
                .reconcile_descendants(item, site_config)
                .await?,
        );
        Ok(outcome)
    }

    async fn run_deferred(
        &self,
        mut item: NodeItem,
        site_config: &SiteConfig,
        seed: ChangeSet,
    ) -> Result<Outcome, SlugError> {
        let mut outcome = Outcome::default();
        outcome.summary = self
            .reconciler
            .reconcile_level(std::slice::from_mut(&mut item), site_config, seed)
            .await?;
        if site_config.sync_children && item.needs_children_build() {
            self.reconciler.builder().build_children(&mut item).await?;
            outcome.summary.absorb(
                self.reconciler
                    .reconcile_level(&mut item.children, site_config, ChangeSet::new())
                    .await?,
            );
        }
        let pending = (item.needs_children_build() && !item.children_loaded)
            || item.children.iter().any(|c| c.needs_children_build());
        if pending {
            let entry = self.queue.enqueue(&item).await?;
            outcome.queued.push(entry.id);
        }
        Ok(outcome)
    }

    /// Build the subtree of `node` the way a site rebuild would, without writing anything.
    pub async fn preview(&self, node: NodeId) -> Result<NodeItem, SlugError> {
        let site = self.load(node)?.site;
        let settings = self.settings_for(&site, |s| s.rebuild_descendants = true)?;
        let builder = self.reconciler.builder();
        let mut item = builder.build_node(node, settings, true).await?;
        builder.build_subtree(&mut item).await?;
        Ok(item)
    }

    /// Conflicts a strict rebuild of the subtree of `node` would raise.
    pub async fn check_conflicts(&self, node: NodeId) -> Result<ConflictList, SlugError> {
        let item = self.preview(node).await?;
        self.reconciler.check_tree(&item).await
    }

    /// Author a custom slug. Automatic generation never changes it afterwards.
    pub async fn set_custom_slug(
        &self,
        node: NodeId,
        culture: &str,
        slug: &str,
    ) -> Result<SlugRecord, SlugError> {
        let site = self.load(node)?.site;
        let text = self.resolver.normalize_url(slug, &site)?;
        let record = SlugRecord::new(&site, node, culture, &text, true);
        let mut seed = ChangeSet::new();
        seed.push(SlugChange::SetCustom(record.clone()));
        self.reconciler
            .commit(Staging::new(seed, &[], false))
            .await?;
        Ok(record)
    }
}
