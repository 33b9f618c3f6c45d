//! Repositories for the two persisted entity kinds.
//!
//! Slug records and queue entries each get a repository trait exposing the load, save and
//! delete operations the engine needs. Writes to slug records are staged in a [ChangeSet]
//! and applied by [SlugStore::commit] as a single unit of work.
//!
//! [MemoryStore] implements both traits in process. The SQLite implementation lives in
//! [crate::db] behind the `service` feature.
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, future::Future, sync::Arc};
use uuid::Uuid;

use crate::{
    error::SlugError,
    properties::{now_ms, AlternateUrl, NodeId, QueueEntry, SlugRecord, WorkerIdentity},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlugChange {
    /// Insert a record, or take over the generated record already held by its
    /// (node, culture). A custom record is never replaced.
    Insert(SlugRecord),
    /// Author a custom slug for the record's (node, culture), replacing whatever is there.
    SetCustom(SlugRecord),
    /// Change the text of a record in place unless it is custom.
    Update {
        id: Uuid,
        slug: String,
        modified_ms: i64,
    },
    /// Remove every record and alternate URL of the given nodes.
    DeleteForNodes(Vec<NodeId>),
    /// Remove every generated (non custom) record of a site.
    DeleteGenerated { site: String },
    /// Record an alternate URL, replacing any previous owner of the same URL.
    AddAlternate(AlternateUrl),
    RemoveAlternate { site: String, url: String },
}

/// Staged slug writes, applied together by [SlugStore::commit].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub changes: Vec<SlugChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        ChangeSet::default()
    }

    pub fn push(&mut self, change: SlugChange) {
        self.changes.push(change);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn append(&mut self, other: &mut ChangeSet) {
        self.changes.append(&mut other.changes);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub alternates: usize,
}

impl CommitSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.alternates
    }

    pub fn absorb(&mut self, other: CommitSummary) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.alternates += other.alternates;
    }
}

pub trait SlugStore: Sync {
    fn slugs_for_node(
        &self,
        node: NodeId,
    ) -> impl Future<Output = Result<Vec<SlugRecord>, SlugError>> + Send;

    fn get_slug_record(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<SlugRecord>, SlugError>> + Send;

    /// Every record of `site` whose text is exactly `slug`.
    fn find_slug(
        &self,
        site: &str,
        slug: &str,
    ) -> impl Future<Output = Result<Vec<SlugRecord>, SlugError>> + Send;

    fn site_slugs(
        &self,
        site: &str,
    ) -> impl Future<Output = Result<Vec<SlugRecord>, SlugError>> + Send;

    fn find_alternate_url(
        &self,
        site: &str,
        url: &str,
    ) -> impl Future<Output = Result<Option<AlternateUrl>, SlugError>> + Send;

    fn commit(
        &self,
        changes: ChangeSet,
    ) -> impl Future<Output = Result<CommitSummary, SlugError>> + Send;
}

pub trait QueueStore: Sync {
    fn enqueue(
        &self,
        payload: String,
        digest: String,
    ) -> impl Future<Output = Result<QueueEntry, SlugError>> + Send;

    fn get_entry(
        &self,
        id: i64,
    ) -> impl Future<Output = Result<Option<QueueEntry>, SlugError>> + Send;

    /// All entries, oldest first.
    fn list_entries(&self) -> impl Future<Output = Result<Vec<QueueEntry>, SlugError>> + Send;

    /// Reset to pending every running entry of `process` not held by `live_worker`.
    /// Entries of other processes are left alone.
    fn reap_stuck(
        &self,
        process: &str,
        live_worker: Option<Uuid>,
    ) -> impl Future<Output = Result<u64, SlugError>> + Send;

    /// Atomically claim the oldest eligible entry for `owner`. Nothing is claimed while
    /// `owner.process` already runs an entry. With `skip_errored` unset an errored entry at
    /// the head of the queue blocks the queue.
    fn claim_next(
        &self,
        owner: &WorkerIdentity,
        skip_errored: bool,
    ) -> impl Future<Output = Result<Option<QueueEntry>, SlugError>> + Send;

    /// Atomically claim one specific entry regardless of its position or error state.
    fn claim_entry(
        &self,
        id: i64,
        owner: &WorkerIdentity,
    ) -> impl Future<Output = Result<Option<QueueEntry>, SlugError>> + Send;

    /// Remove a successfully processed entry.
    fn complete_entry(&self, id: i64) -> impl Future<Output = Result<(), SlugError>> + Send;

    /// Release an entry, recording why it failed.
    fn fail_entry(
        &self,
        id: i64,
        error: &str,
    ) -> impl Future<Output = Result<(), SlugError>> + Send;

    /// Clear the error of a non-running entry so it becomes pending again.
    fn retry_entry(&self, id: i64) -> impl Future<Output = Result<bool, SlugError>> + Send;

    fn delete_entry(&self, id: i64) -> impl Future<Output = Result<bool, SlugError>> + Send;
}

/// Everything the engine needs from storage.
pub trait SlugRepository: SlugStore + QueueStore + Clone + Send + Sync + 'static {}

impl<T> SlugRepository for T where T: SlugStore + QueueStore + Clone + Send + Sync + 'static {}

#[derive(Debug, Default)]
struct MemoryState {
    slugs: BTreeMap<Uuid, SlugRecord>,
    alternates: BTreeMap<(String, String), AlternateUrl>,
    queue: BTreeMap<i64, QueueEntry>,
    next_entry_id: i64,
}

impl MemoryState {
    fn apply(&mut self, change: SlugChange, summary: &mut CommitSummary) {
        match change {
            SlugChange::Insert(record) => {
                let held = self
                    .slugs
                    .values_mut()
                    .find(|r| r.node_id == record.node_id && r.culture == record.culture);
                match held {
                    Some(existing) if existing.is_custom => {}
                    Some(existing) => {
                        existing.slug = record.slug;
                        existing.site = record.site;
                        existing.modified_ms = record.modified_ms;
                        summary.updated += 1;
                    }
                    None => {
                        self.slugs.insert(record.id, record);
                        summary.inserted += 1;
                    }
                }
            }
            SlugChange::SetCustom(record) => {
                let held = self
                    .slugs
                    .values_mut()
                    .find(|r| r.node_id == record.node_id && r.culture == record.culture);
                match held {
                    Some(existing) => {
                        existing.slug = record.slug;
                        existing.is_custom = true;
                        existing.modified_ms = record.modified_ms;
                        summary.updated += 1;
                    }
                    None => {
                        self.slugs.insert(
                            record.id,
                            SlugRecord {
                                is_custom: true,
                                ..record
                            },
                        );
                        summary.inserted += 1;
                    }
                }
            }
            SlugChange::Update {
                id,
                slug,
                modified_ms,
            } => {
                if let Some(existing) = self.slugs.get_mut(&id) {
                    if !existing.is_custom {
                        existing.slug = slug;
                        existing.modified_ms = modified_ms;
                        summary.updated += 1;
                    }
                }
            }
            SlugChange::DeleteForNodes(nodes) => {
                let before = self.slugs.len();
                self.slugs.retain(|_, r| !nodes.contains(&r.node_id));
                summary.deleted += before - self.slugs.len();
                self.alternates.retain(|_, a| !nodes.contains(&a.node_id));
            }
            SlugChange::DeleteGenerated { site } => {
                let before = self.slugs.len();
                self.slugs.retain(|_, r| r.site != site || r.is_custom);
                summary.deleted += before - self.slugs.len();
            }
            SlugChange::AddAlternate(alternate) => {
                self.alternates
                    .insert((alternate.site.clone(), alternate.url.clone()), alternate);
                summary.alternates += 1;
            }
            SlugChange::RemoveAlternate { site, url } => {
                if self.alternates.remove(&(site, url)).is_some() {
                    summary.alternates += 1;
                }
            }
        }
    }

    fn process_busy(&self, process: &str) -> bool {
        self.queue.values().any(|e| {
            e.running
                && e.owner
                    .as_ref()
                    .is_some_and(|owner| owner.process == process)
        })
    }

    fn mark_running(&mut self, id: i64, owner: &WorkerIdentity) -> Option<QueueEntry> {
        let entry = self.queue.get_mut(&id)?;
        entry.running = true;
        entry.owner = Some(owner.clone());
        entry.started_ms = Some(now_ms());
        entry.ended_ms = None;
        entry.error = None;
        Some(entry.clone())
    }
}

/// In-process store. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore(Arc<Mutex<MemoryState>>);

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Insert a record directly, bypassing change tracking. Used to seed custom slugs.
    pub fn insert_record(&self, record: SlugRecord) {
        self.0.lock().slugs.insert(record.id, record);
    }

    pub fn slug_count(&self) -> usize {
        self.0.lock().slugs.len()
    }

    pub fn alternates(&self) -> Vec<AlternateUrl> {
        self.0.lock().alternates.values().cloned().collect()
    }

    /// Overwrite an entry as-is, e.g. to simulate a worker that died mid-run.
    pub fn put_entry(&self, entry: QueueEntry) {
        let mut state = self.0.lock();
        state.next_entry_id = state.next_entry_id.max(entry.id);
        state.queue.insert(entry.id, entry);
    }
}

impl SlugStore for MemoryStore {
    async fn slugs_for_node(&self, node: NodeId) -> Result<Vec<SlugRecord>, SlugError> {
        Ok(self
            .0
            .lock()
            .slugs
            .values()
            .filter(|r| r.node_id == node)
            .cloned()
            .collect())
    }

    async fn get_slug_record(&self, id: Uuid) -> Result<Option<SlugRecord>, SlugError> {
        Ok(self.0.lock().slugs.get(&id).cloned())
    }

    async fn find_slug(&self, site: &str, slug: &str) -> Result<Vec<SlugRecord>, SlugError> {
        Ok(self
            .0
            .lock()
            .slugs
            .values()
            .filter(|r| r.site == site && r.slug == slug)
            .cloned()
            .collect())
    }

    async fn site_slugs(&self, site: &str) -> Result<Vec<SlugRecord>, SlugError> {
        Ok(self
            .0
            .lock()
            .slugs
            .values()
            .filter(|r| r.site == site)
            .cloned()
            .collect())
    }

    async fn find_alternate_url(
        &self,
        site: &str,
        url: &str,
    ) -> Result<Option<AlternateUrl>, SlugError> {
        Ok(self
            .0
            .lock()
            .alternates
            .get(&(site.to_string(), url.to_string()))
            .cloned())
    }

    async fn commit(&self, changes: ChangeSet) -> Result<CommitSummary, SlugError> {
        let mut summary = CommitSummary::default();
        let mut state = self.0.lock();
        for change in changes.changes {
            state.apply(change, &mut summary);
        }
        Ok(summary)
    }
}

impl QueueStore for MemoryStore {
    async fn enqueue(&self, payload: String, digest: String) -> Result<QueueEntry, SlugError> {
        let mut state = self.0.lock();
        state.next_entry_id += 1;
        let entry = QueueEntry {
            id: state.next_entry_id,
            payload,
            digest,
            running: false,
            owner: None,
            started_ms: None,
            ended_ms: None,
            error: None,
            created_ms: now_ms(),
        };
        state.queue.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_entry(&self, id: i64) -> Result<Option<QueueEntry>, SlugError> {
        Ok(self.0.lock().queue.get(&id).cloned())
    }

    async fn list_entries(&self) -> Result<Vec<QueueEntry>, SlugError> {
        Ok(self.0.lock().queue.values().cloned().collect())
    }

    async fn reap_stuck(&self, process: &str, live_worker: Option<Uuid>) -> Result<u64, SlugError> {
        let mut reaped = 0;
        for entry in self.0.lock().queue.values_mut() {
            let stuck = entry.running
                && entry.owner.as_ref().is_some_and(|owner| {
                    owner.process == process && Some(owner.worker) != live_worker
                });
            if stuck {
                entry.running = false;
                entry.owner = None;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn claim_next(
        &self,
        owner: &WorkerIdentity,
        skip_errored: bool,
    ) -> Result<Option<QueueEntry>, SlugError> {
        let mut state = self.0.lock();
        if state.process_busy(&owner.process) {
            return Ok(None);
        }
        let head = state
            .queue
            .values()
            .find(|e| !e.running && (!skip_errored || e.error.is_none()))
            .map(|e| (e.id, e.error.is_some()));
        match head {
            Some((id, false)) => Ok(state.mark_running(id, owner)),
            _ => Ok(None),
        }
    }

    async fn claim_entry(
        &self,
        id: i64,
        owner: &WorkerIdentity,
    ) -> Result<Option<QueueEntry>, SlugError> {
        let mut state = self.0.lock();
        if state.process_busy(&owner.process) {
            return Ok(None);
        }
        match state.queue.get(&id) {
            Some(entry) if !entry.running => Ok(state.mark_running(id, owner)),
            _ => Ok(None),
        }
    }

    async fn complete_entry(&self, id: i64) -> Result<(), SlugError> {
        self.0.lock().queue.remove(&id);
        Ok(())
    }

    async fn fail_entry(&self, id: i64, error: &str) -> Result<(), SlugError> {
        if let Some(entry) = self.0.lock().queue.get_mut(&id) {
            entry.running = false;
            entry.error = Some(error.to_string());
            entry.ended_ms = Some(now_ms());
        }
        Ok(())
    }

    async fn retry_entry(&self, id: i64) -> Result<bool, SlugError> {
        match self.0.lock().queue.get_mut(&id) {
            Some(entry) if !entry.running => {
                entry.error = None;
                entry.ended_ms = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_entry(&self, id: i64) -> Result<bool, SlugError> {
        Ok(self.0.lock().queue.remove(&id).is_some())
    }
}
