//! The durable generation queue.
//!
//! Deferred subtrees are stored as [QueueEntry] rows holding a versioned [QueuePayload] and
//! its SHA-256 digest. Entries move `Pending → Running → deleted` on success, or to
//! `Errored` with the error text kept for inspection.
//!
//! Each process runs at most one consumer loop. The loop sleeps on a [Notify] and, when
//! woken, drains the queue oldest first: every check first reaps entries this process left
//! running under a worker identity that is no longer live, then atomically claims the next
//! eligible entry. A fresh [WorkerIdentity] is minted whenever a consumer loop starts.
//!
//! ## Payload format
//!
//! ```json
//! {"format": "slug-tree/1", "settings": {...}, "root": {"node_id": 7, "slugs": [...], ...}}
//! ```
//!
//! The `format` tag names the schema version. A payload with an unknown tag, a shape that
//! does not decode, or a digest that does not match fails the entry with
//! [SlugError::Serialization].
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::{runtime::Handle, sync::Notify, task::JoinHandle};

use crate::{
    config::QueueConfig,
    error::SlugError,
    event::SlugEvent,
    nodeitem::{NodeItem, NodeSnapshot},
    persist::Reconciler,
    properties::{QueueEntry, WorkerIdentity},
    settings::BuilderSettings,
    store::{CommitSummary, SlugRepository},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format")]
pub enum QueuePayload {
    #[serde(rename = "slug-tree/1")]
    SlugTreeV1 {
        settings: BuilderSettings,
        root: NodeSnapshot,
    },
}

impl QueuePayload {
    pub fn from_item(item: &NodeItem) -> Self {
        QueuePayload::SlugTreeV1 {
            settings: item.settings.as_ref().clone(),
            root: NodeSnapshot::from(item),
        }
    }

    pub fn into_item(self) -> NodeItem {
        match self {
            QueuePayload::SlugTreeV1 { settings, root } => root.into_item(Arc::new(settings)),
        }
    }
}

pub fn payload_digest(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// Serialize `item` for the queue. Returns the payload and its digest.
pub fn encode_payload(item: &NodeItem) -> Result<(String, String), SlugError> {
    let payload = serde_json::to_string(&QueuePayload::from_item(item))?;
    let digest = payload_digest(&payload);
    Ok((payload, digest))
}

/// Restore the item of an entry, verifying its digest first.
pub fn decode_payload(entry: &QueueEntry) -> Result<NodeItem, SlugError> {
    let expected = hex::decode(&entry.digest)?;
    let actual = Sha256::digest(entry.payload.as_bytes());
    if actual.as_slice() != expected.as_slice() {
        return Err(SlugError::Serialization(format!(
            "payload of queue entry {} does not match its digest",
            entry.id
        )));
    }
    let payload: QueuePayload = serde_json::from_str(&entry.payload)?;
    Ok(payload.into_item())
}

#[derive(Clone)]
pub struct GenerationQueue<S> {
    reconciler: Reconciler<S>,
    queue_config: QueueConfig,
    work_notifier: Arc<Notify>,
    identity: Arc<RwLock<WorkerIdentity>>,
    consumer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<S: SlugRepository> GenerationQueue<S> {
    pub fn new(reconciler: Reconciler<S>, queue_config: QueueConfig) -> Self {
        let identity = WorkerIdentity::new(&queue_config.process_identity);
        GenerationQueue {
            reconciler,
            queue_config,
            work_notifier: Arc::new(Notify::new()),
            identity: Arc::new(RwLock::new(identity)),
            consumer: Arc::new(Mutex::new(None)),
        }
    }

    /// The identity this process currently claims entries under.
    pub fn identity(&self) -> WorkerIdentity {
        self.identity.read().clone()
    }

    fn store(&self) -> &S {
        self.reconciler.store()
    }

    /// Persist `item` as a pending entry and wake the consumer loop.
    #[tracing::instrument(skip_all, fields(node = %item.node_id))]
    pub async fn enqueue(&self, item: &NodeItem) -> Result<QueueEntry, SlugError> {
        let (payload, digest) = encode_payload(item)?;
        let entry = self.store().enqueue(payload, digest).await?;
        tracing::debug!(
            "[GenerationQueue] Queued entry {} for the subtree below node {}",
            entry.id,
            item.node_id
        );
        self.reconciler
            .events()
            .send(SlugEvent::EntryQueued(entry.id, item.node_id));
        self.work_notifier.notify_one();
        Ok(entry)
    }

    /// Wake the consumer loop, if one is running.
    pub fn notify(&self) {
        self.work_notifier.notify_one();
    }

    /// Start the consumer loop on `runtime` unless one is already alive. Returns the worker
    /// identity the loop claims entries under.
    pub fn start(&self, runtime: &Handle) -> WorkerIdentity {
        let mut consumer = self.consumer.lock();
        if let Some(handle) = consumer.as_ref() {
            if !handle.is_finished() {
                return self.identity();
            }
            tracing::warn!(
                "[GenerationQueue] Consumer {} is gone, starting a new one",
                self.identity()
            );
        }
        let identity = WorkerIdentity::new(&self.queue_config.process_identity);
        *self.identity.write() = identity.clone();

        let queue = self.clone();
        *consumer = Some(runtime.spawn(async move {
            tracing::info!("[GenerationQueue] Starting consumer {}", identity);
            loop {
                queue.work_notifier.notified().await;
                match queue.drain().await {
                    Ok(0) => {}
                    Ok(processed) => {
                        tracing::info!("[GenerationQueue] Processed {} entries", processed)
                    }
                    Err(e) => tracing::error!("[GenerationQueue] Queue check failed: {}", e),
                }
            }
        }));
        // Existing entries are picked up without waiting for the next enqueue.
        self.work_notifier.notify_one();
        self.identity()
    }

    /// Whether the consumer loop is running.
    pub fn is_alive(&self) -> bool {
        self.consumer
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.consumer.lock().take() {
            handle.abort();
        }
    }

    /// Release entries this process left running under a worker that is no longer live.
    pub async fn reap_stuck(&self) -> Result<u64, SlugError> {
        let identity = self.identity();
        let reaped = self
            .store()
            .reap_stuck(&identity.process, Some(identity.worker))
            .await?;
        if reaped > 0 {
            tracing::warn!(
                "[GenerationQueue] Reset {} stuck entries of process '{}'",
                reaped,
                identity.process
            );
        }
        Ok(reaped)
    }

    /// Claim the next eligible entry for this process, reaping stuck entries first.
    pub async fn dequeue_next(&self) -> Result<Option<QueueEntry>, SlugError> {
        self.reap_stuck().await?;
        let identity = self.identity();
        let entry = self
            .store()
            .claim_next(&identity, self.queue_config.skip_errored)
            .await?;
        if let Some(entry) = entry.as_ref() {
            tracing::debug!("[GenerationQueue] {} claimed entry {}", identity, entry.id);
        }
        Ok(entry)
    }

    /// Process claimed entries until none is eligible. Returns how many were processed,
    /// failed ones included. Stops with an error when the outcome of an entry could not be
    /// stored.
    pub async fn drain(&self) -> Result<usize, SlugError> {
        let mut processed = 0;
        while let Some(entry) = self.dequeue_next().await? {
            // A failed entry already carries its error.
            let _outcome = self.execute(entry).await?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Run one entry now regardless of its position or error state.
    #[tracing::instrument(skip(self))]
    pub async fn run_entry(&self, id: i64) -> Result<CommitSummary, SlugError> {
        if self.store().get_entry(id).await?.is_none() {
            return Err(SlugError::NotFound(format!("queue entry {id}")));
        }
        let identity = self.identity();
        match self.store().claim_entry(id, &identity).await? {
            Some(entry) => self.execute(entry).await?,
            None => Err(SlugError::QueueBusy),
        }
    }

    /// Clear the error of an entry so it is picked up again.
    pub async fn retry(&self, id: i64) -> Result<bool, SlugError> {
        let cleared = self.store().retry_entry(id).await?;
        if cleared {
            self.work_notifier.notify_one();
        }
        Ok(cleared)
    }

    pub async fn delete(&self, id: i64) -> Result<bool, SlugError> {
        self.store().delete_entry(id).await
    }

    pub async fn list(&self) -> Result<Vec<QueueEntry>, SlugError> {
        self.store().list_entries().await
    }

    /// Run a claimed entry and store how it went. The inner result is the outcome of the
    /// entry itself. The outer error means that outcome could not be stored; the entry has
    /// then been handed back to the queue where possible.
    async fn execute(
        &self,
        entry: QueueEntry,
    ) -> Result<Result<CommitSummary, SlugError>, SlugError> {
        let id = entry.id;
        match self.rebuild(&entry).await {
            Ok(summary) => {
                if let Err(e) = self.store().complete_entry(id).await {
                    return Err(self.release_unrecorded(id, e).await);
                }
                tracing::info!(
                    "[GenerationQueue] Entry {} completed with {} slug writes",
                    id,
                    summary.total()
                );
                self.reconciler
                    .events()
                    .send(SlugEvent::EntryCompleted(id, summary.total()));
                Ok(Ok(summary))
            }
            Err(e) => {
                tracing::error!("[GenerationQueue] Entry {} failed: {}", id, e);
                if let Err(store_error) = self.store().fail_entry(id, &e.to_string()).await {
                    return Err(self.release_unrecorded(id, store_error).await);
                }
                self.reconciler
                    .events()
                    .send(SlugEvent::EntryFailed(id, e.to_string()));
                Ok(Err(e))
            }
        }
    }

    /// The current worker still owns entry `id`. Retire it so the entry is reaped rather
    /// than keeping this process busy forever.
    async fn release_unrecorded(&self, id: i64, error: SlugError) -> SlugError {
        tracing::error!(
            "[GenerationQueue] Could not store the outcome of entry {}: {}",
            id,
            error
        );
        let retired = self.identity();
        *self.identity.write() = WorkerIdentity::new(&retired.process);
        if let Err(e) = self.reap_stuck().await {
            tracing::error!(
                "[GenerationQueue] Entry {} stays claimed by {} until the next check: {}",
                id,
                retired,
                e
            );
        }
        error
    }

    async fn rebuild(&self, entry: &QueueEntry) -> Result<CommitSummary, SlugError> {
        let mut item = decode_payload(entry)?;
        if self.reconciler.builder().tree().get_node(item.node_id)?.is_none() {
            return Err(SlugError::Load(format!(
                "node {} of queue entry {} no longer exists",
                item.node_id, entry.id
            )));
        }
        let site_config = self
            .reconciler
            .config()
            .site_config(&item.settings.site)?;
        self.reconciler
            .reconcile_subtree(&mut item, &site_config)
            .await
    }
}
