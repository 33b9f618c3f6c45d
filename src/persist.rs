//! Committing built slugs.
//!
//! Writes for a set of items are staged into one [ChangeSet] and committed together. Staging
//! re-checks every new text against storage, since a concurrent pass may have claimed it
//! after conflict detection ran. It also records the old text of every changed slug as an
//! [AlternateUrl] so existing links keep resolving.
//!
//! [Reconciler] drives a pass from built items to storage under a site's conflict policy:
//! [ConflictPolicy::Error] builds and checks the whole subtree before writing anything,
//! the lenient policies resolve and commit one sibling level at a time so every child is
//! rendered against its parent's final slug.
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    pin::Pin,
    sync::Arc,
};
use uuid::Uuid;

use crate::{
    builder::TreeBuilder,
    config::{ConflictPolicy, SiteConfig, SlugConfigProvider},
    conflict::{apply_policy, Conflict, ConflictDetector, ConflictList},
    error::SlugError,
    event::{EventSink, SlugEvent},
    nodeitem::{NodeItem, NodeUrlSlug},
    properties::{now_ms, AlternateUrl, NodeId, SlugRecord},
    resolver::SlugCache,
    store::{ChangeSet, CommitSummary, SlugChange, SlugStore},
};

type SaveFuture<'a> = Pin<Box<dyn Future<Output = Result<CommitSummary, SlugError>> + Send + 'a>>;
type StageFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SlugError>> + Send + 'a>>;

/// Writes and events accumulated for one commit.
#[derive(Debug, Default)]
pub struct Staging {
    pub changes: ChangeSet,
    before_commit: Vec<SlugEvent>,
    after_commit: Vec<SlugEvent>,
    /// Records whose text is replaced in this commit.
    released: BTreeSet<Uuid>,
    /// New texts of this commit, by the node that claimed them first.
    claimed: BTreeMap<String, NodeId>,
    /// Only custom records block a text; generated ones are being replaced.
    ignore_generated: bool,
}

impl Staging {
    pub fn new(seed: ChangeSet, items: &[&NodeItem], ignore_generated: bool) -> Self {
        let mut staging = Staging {
            changes: seed,
            ignore_generated,
            ..Default::default()
        };
        for item in items.iter().filter(|i| !i.saved) {
            for slug in item.slugs.iter().filter(|s| s.has_new_text()) {
                if let Some(id) = slug.existing_id {
                    staging.released.insert(id);
                }
                staging
                    .claimed
                    .entry(slug.slug.clone())
                    .or_insert(item.node_id);
            }
        }
        staging
    }

    fn blocks(&self, record: &SlugRecord, node: NodeId) -> bool {
        record.node_id != node
            && !self.released.contains(&record.id)
            && (!self.ignore_generated || record.is_custom)
    }
}

#[derive(Clone)]
pub struct Reconciler<S> {
    store: S,
    builder: TreeBuilder<S>,
    config: Arc<dyn SlugConfigProvider>,
    events: EventSink,
    cache: SlugCache,
}

impl<S: SlugStore + Clone + Send + Sync + 'static> Reconciler<S> {
    pub fn new(
        store: S,
        builder: TreeBuilder<S>,
        config: Arc<dyn SlugConfigProvider>,
        events: EventSink,
        cache: SlugCache,
    ) -> Self {
        Reconciler {
            store,
            builder,
            config,
            events,
            cache,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn builder(&self) -> &TreeBuilder<S> {
        &self.builder
    }

    pub fn config(&self) -> &dyn SlugConfigProvider {
        self.config.as_ref()
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    fn report_conflict(&self, conflict: &Conflict, log_conflicts: bool) {
        if log_conflicts {
            tracing::warn!("[Reconciler] Slug conflict: {}", conflict);
        } else {
            tracing::debug!("[Reconciler] Slug conflict: {}", conflict);
        }
        self.events
            .send(SlugEvent::ConflictDetected(conflict.clone()));
    }

    /// Commit staged writes. Change notifications go out before the commit so listeners
    /// can snapshot the previous text; the routing cache is invalidated after it.
    pub async fn commit(&self, staging: Staging) -> Result<CommitSummary, SlugError> {
        if staging.changes.is_empty() {
            return Ok(CommitSummary::default());
        }
        for event in staging.before_commit {
            self.events.send(event);
        }
        let summary = self.store.commit(staging.changes).await?;
        self.cache.invalidate();
        for event in staging.after_commit {
            self.events.send(event);
        }
        tracing::debug!(
            "[Reconciler] Committed {} inserts, {} updates, {} deletes, {} alternate URL writes",
            summary.inserted,
            summary.updated,
            summary.deleted,
            summary.alternates
        );
        Ok(summary)
    }

    /// Stage the writes of `item`, then of its built children when `recurse` is set or
    /// when `item` is staged for the first time. Staging an already saved item again is a
    /// no-op for that item.
    pub fn stage<'a>(
        &'a self,
        item: &'a mut NodeItem,
        recurse: bool,
        staging: &'a mut Staging,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            let fresh = !item.saved;
            if fresh {
                self.stage_item(item, staging).await?;
                item.saved = true;
            }
            if recurse || fresh {
                for child in item.children.iter_mut() {
                    self.stage(child, recurse, staging).await?;
                }
            }
            Ok(())
        })
    }

    /// `Save(item, recurse)`: stage and commit in one unit of work.
    pub async fn save(
        &self,
        item: &mut NodeItem,
        recurse: bool,
    ) -> Result<CommitSummary, SlugError> {
        let mut staging = Staging::new(
            ChangeSet::new(),
            &item.flatten(),
            !item.settings.check_for_updates,
        );
        self.stage(item, recurse, &mut staging).await?;
        self.commit(staging).await
    }

    async fn stage_item(&self, item: &NodeItem, staging: &mut Staging) -> Result<(), SlugError> {
        let settings = item.settings.clone();
        let site = settings.site.as_str();
        for slug in item.slugs.iter().filter(|s| s.is_new_or_updated) {
            if slug.is_custom || !slug.has_new_text() {
                continue;
            }
            if let Some(conflict) = self.recheck(item, slug, staging).await? {
                self.report_conflict(&conflict, settings.log_conflicts);
                continue;
            }
            match (slug.existing_id, slug.previous_slug.as_ref()) {
                (Some(id), previous) => {
                    staging.changes.push(SlugChange::Update {
                        id,
                        slug: slug.slug.clone(),
                        modified_ms: now_ms(),
                    });
                    if let Some(previous) = previous {
                        staging.before_commit.push(SlugEvent::SlugChanged(
                            site.to_string(),
                            item.node_id,
                            slug.culture.clone(),
                            previous.clone(),
                            slug.slug.clone(),
                        ));
                        self.stage_redirect(item, slug, previous, staging).await?;
                    }
                }
                (None, _) => {
                    staging.changes.push(SlugChange::Insert(SlugRecord::new(
                        site,
                        item.node_id,
                        &slug.culture,
                        &slug.slug,
                        false,
                    )));
                    staging.after_commit.push(SlugEvent::SlugCreated(
                        site.to_string(),
                        item.node_id,
                        slug.culture.clone(),
                        slug.slug.clone(),
                    ));
                }
            }
            if self
                .store
                .find_alternate_url(site, &slug.slug)
                .await?
                .is_some()
            {
                tracing::debug!(
                    "[Reconciler] Live slug '{}' of node {} replaces a redirect",
                    slug.slug,
                    item.node_id
                );
                staging.changes.push(SlugChange::RemoveAlternate {
                    site: site.to_string(),
                    url: slug.slug.clone(),
                });
            }
        }
        Ok(())
    }

    /// Collision check at write time, against storage and the rest of this commit.
    async fn recheck(
        &self,
        item: &NodeItem,
        slug: &NodeUrlSlug,
        staging: &Staging,
    ) -> Result<Option<Conflict>, SlugError> {
        let site = item.settings.site.as_str();
        let conflict = |existing_node: NodeId, existing_culture: String| Conflict {
            site: site.to_string(),
            node_id: item.node_id,
            culture: slug.culture.clone(),
            slug: slug.slug.clone(),
            existing_node,
            existing_culture,
        };
        if let Some(holder) = staging.claimed.get(&slug.slug) {
            if *holder != item.node_id {
                return Ok(Some(conflict(*holder, String::new())));
            }
        }
        Ok(self
            .store
            .find_slug(site, &slug.slug)
            .await?
            .into_iter()
            .find(|r| staging.blocks(r, item.node_id))
            .map(|r| conflict(r.node_id, r.culture)))
    }

    /// Keep `previous` resolving to `item` after its slug in `slug.culture` changes.
    async fn stage_redirect(
        &self,
        item: &NodeItem,
        slug: &NodeUrlSlug,
        previous: &str,
        staging: &mut Staging,
    ) -> Result<(), SlugError> {
        let settings = item.settings.clone();
        let site = settings.site.as_str();
        if staging.claimed.contains_key(previous) {
            // Another slug of this commit takes the old text over.
            return Ok(());
        }
        match self.store.find_alternate_url(site, previous).await? {
            None => {
                let live_holder = self
                    .store
                    .find_slug(site, previous)
                    .await?
                    .into_iter()
                    .find(|r| staging.blocks(r, item.node_id));
                match live_holder {
                    Some(record) => self.report_conflict(
                        &Conflict {
                            site: site.to_string(),
                            node_id: item.node_id,
                            culture: slug.culture.clone(),
                            slug: previous.to_string(),
                            existing_node: record.node_id,
                            existing_culture: record.culture,
                        },
                        settings.log_conflicts,
                    ),
                    None => staging
                        .changes
                        .push(SlugChange::AddAlternate(AlternateUrl::new(
                            site,
                            previous,
                            item.node_id,
                            &slug.culture,
                        ))),
                }
            }
            Some(existing) if existing.node_id == item.node_id => {
                if existing.culture != slug.culture
                    && existing.culture != settings.default_culture
                {
                    tracing::debug!(
                        "[Reconciler] Redirect '{}' of node {} moves to its default culture",
                        previous,
                        item.node_id
                    );
                    staging.changes.push(SlugChange::AddAlternate(AlternateUrl {
                        culture: settings.default_culture.clone(),
                        created_ms: now_ms(),
                        ..existing
                    }));
                }
            }
            Some(existing) => self.report_conflict(
                &Conflict {
                    site: site.to_string(),
                    node_id: item.node_id,
                    culture: slug.culture.clone(),
                    slug: previous.to_string(),
                    existing_node: existing.node_id,
                    existing_culture: existing.culture,
                },
                settings.log_conflicts,
            ),
        }
        Ok(())
    }

    /// Resolve the conflicts of one sibling level under the site policy, then commit the
    /// level's unsaved items (not their children) together with `seed`.
    #[tracing::instrument(skip_all, fields(items = items.len()))]
    pub async fn reconcile_level(
        &self,
        items: &mut [NodeItem],
        site_config: &SiteConfig,
        seed: ChangeSet,
    ) -> Result<CommitSummary, SlugError> {
        let Some(first) = items.first() else {
            return self.commit(Staging::new(seed, &[], false)).await;
        };
        let settings = first.settings.clone();
        let detector = ConflictDetector::new(&self.store, &settings.site)
            .ignoring_generated(!settings.check_for_updates);
        let unsaved: Vec<&NodeItem> = items.iter().filter(|i| !i.saved).collect();
        let conflicts = detector.find_conflicts(&unsaved).await?;
        let remaining = apply_policy(
            &detector,
            items,
            conflicts,
            site_config.conflict_policy,
            site_config.max_append_attempts,
        )
        .await?;
        for conflict in remaining.iter() {
            self.report_conflict(conflict, settings.log_conflicts);
        }
        if site_config.conflict_policy == ConflictPolicy::Error && !remaining.is_empty() {
            return Err(SlugError::Collision(remaining));
        }

        let mut staging = Staging::new(
            seed,
            &items.iter().collect::<Vec<_>>(),
            !settings.check_for_updates,
        );
        for item in items.iter_mut() {
            self.stage(item, false, &mut staging).await?;
        }
        self.commit(staging).await
    }

    /// Build, check and commit everything below `item` one sibling level at a time.
    pub fn reconcile_descendants<'a>(
        &'a self,
        item: &'a mut NodeItem,
        site_config: &'a SiteConfig,
    ) -> SaveFuture<'a> {
        Box::pin(async move {
            let mut summary = CommitSummary::default();
            if item.needs_children_build() {
                self.builder.build_children(item).await?;
            }
            if item.children.iter().any(|c| !c.saved) {
                summary.absorb(
                    self.reconcile_level(&mut item.children, site_config, ChangeSet::new())
                        .await?,
                );
            }
            for child in item.children.iter_mut() {
                if child.needs_children_build() || child.children_loaded {
                    summary.absorb(self.reconcile_descendants(child, site_config).await?);
                }
            }
            Ok(summary)
        })
    }

    /// Build the whole subtree below `root`, then commit it in one unit of work together
    /// with `seed`. Any conflict aborts before anything is written.
    #[tracing::instrument(skip_all, fields(node = %root.node_id))]
    pub async fn reconcile_tree_strict(
        &self,
        root: &mut NodeItem,
        seed: ChangeSet,
    ) -> Result<CommitSummary, SlugError> {
        let built = self.builder.build_subtree(root).await?;
        let settings = root.settings.clone();
        let detector = ConflictDetector::new(&self.store, &settings.site)
            .ignoring_generated(!settings.check_for_updates);
        let unsaved: Vec<&NodeItem> = root.flatten().into_iter().filter(|i| !i.saved).collect();
        let conflicts = detector.find_conflicts(&unsaved).await?;
        if let Err(conflicts) = conflicts.into_result() {
            for conflict in conflicts.iter() {
                self.report_conflict(conflict, settings.log_conflicts);
            }
            return Err(SlugError::Collision(conflicts));
        }
        tracing::debug!(
            "[Reconciler] Checked {} built items below node {}",
            built,
            root.node_id
        );
        let mut staging = Staging::new(seed, &root.flatten(), !settings.check_for_updates);
        self.stage(root, true, &mut staging).await?;
        self.commit(staging).await
    }

    /// Finish a subtree whose root may already be saved, the way the site policy asks.
    pub async fn reconcile_subtree(
        &self,
        root: &mut NodeItem,
        site_config: &SiteConfig,
    ) -> Result<CommitSummary, SlugError> {
        match site_config.conflict_policy {
            ConflictPolicy::Error => self.reconcile_tree_strict(root, ChangeSet::new()).await,
            ConflictPolicy::Skip | ConflictPolicy::Append => {
                let mut summary = CommitSummary::default();
                if !root.saved {
                    summary.absorb(
                        self.reconcile_level(
                            std::slice::from_mut(root),
                            site_config,
                            ChangeSet::new(),
                        )
                        .await?,
                    );
                }
                summary.absorb(self.reconcile_descendants(root, site_config).await?);
                Ok(summary)
            }
        }
    }

    /// Conflicts a full check of `root` would report, without writing.
    pub async fn check_tree(&self, root: &NodeItem) -> Result<ConflictList, SlugError> {
        let settings = root.settings.clone();
        ConflictDetector::new(&self.store, &settings.site)
            .ignoring_generated(!settings.check_for_updates)
            .find_tree_conflicts(root)
            .await
    }
}
