//! Generation queue integration tests
//!
//! Drive the consumer loop, stuck entry recovery and the manual recovery operations against
//! the in-memory store.

mod common;

use common::*;
use noet_slugs::{
    config::{QueueConfig, SlugConfig},
    engine::Trigger,
    error::SlugError,
    event::SlugEvent,
    properties::{AlternateUrl, NodeId, QueueEntry, QueueState, SlugRecord, WorkerIdentity},
    queue::payload_digest,
    store::{ChangeSet, CommitSummary, MemoryStore, QueueStore, SlugStore},
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use test_log::test;
use uuid::Uuid;

/// A memory store whose next `failing_completions` calls to `complete_entry` fail.
#[derive(Clone, Default)]
struct FlakyStore {
    inner: MemoryStore,
    failing_completions: Arc<AtomicUsize>,
}

impl SlugStore for FlakyStore {
    async fn slugs_for_node(&self, node: NodeId) -> Result<Vec<SlugRecord>, SlugError> {
        self.inner.slugs_for_node(node).await
    }

    async fn get_slug_record(&self, id: Uuid) -> Result<Option<SlugRecord>, SlugError> {
        self.inner.get_slug_record(id).await
    }

    async fn find_slug(&self, site: &str, slug: &str) -> Result<Vec<SlugRecord>, SlugError> {
        self.inner.find_slug(site, slug).await
    }

    async fn site_slugs(&self, site: &str) -> Result<Vec<SlugRecord>, SlugError> {
        self.inner.site_slugs(site).await
    }

    async fn find_alternate_url(
        &self,
        site: &str,
        url: &str,
    ) -> Result<Option<AlternateUrl>, SlugError> {
        self.inner.find_alternate_url(site, url).await
    }

    async fn commit(&self, changes: ChangeSet) -> Result<CommitSummary, SlugError> {
        self.inner.commit(changes).await
    }
}

impl QueueStore for FlakyStore {
    async fn enqueue(&self, payload: String, digest: String) -> Result<QueueEntry, SlugError> {
        self.inner.enqueue(payload, digest).await
    }

    async fn get_entry(&self, id: i64) -> Result<Option<QueueEntry>, SlugError> {
        self.inner.get_entry(id).await
    }

    async fn list_entries(&self) -> Result<Vec<QueueEntry>, SlugError> {
        self.inner.list_entries().await
    }

    async fn reap_stuck(&self, process: &str, live_worker: Option<Uuid>) -> Result<u64, SlugError> {
        self.inner.reap_stuck(process, live_worker).await
    }

    async fn claim_next(
        &self,
        owner: &WorkerIdentity,
        skip_errored: bool,
    ) -> Result<Option<QueueEntry>, SlugError> {
        self.inner.claim_next(owner, skip_errored).await
    }

    async fn claim_entry(
        &self,
        id: i64,
        owner: &WorkerIdentity,
    ) -> Result<Option<QueueEntry>, SlugError> {
        self.inner.claim_entry(id, owner).await
    }

    async fn complete_entry(&self, id: i64) -> Result<(), SlugError> {
        let failing = self
            .failing_completions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SlugError::Store("database is locked".to_string()));
        }
        self.inner.complete_entry(id).await
    }

    async fn fail_entry(&self, id: i64, error: &str) -> Result<(), SlugError> {
        self.inner.fail_entry(id, error).await
    }

    async fn retry_entry(&self, id: i64) -> Result<bool, SlugError> {
        self.inner.retry_entry(id).await
    }

    async fn delete_entry(&self, id: i64) -> Result<bool, SlugError> {
        self.inner.delete_entry(id).await
    }
}

/// A deferred fixture whose site rebuild left one pending entry behind.
async fn queued_fixture(skip_errored: bool) -> (Fixture<MemoryStore>, QueueEntry) {
    let fixture = Fixture::with_config(
        blog_tree(),
        SlugConfig {
            queue: QueueConfig {
                process_identity: "test-host:1".to_string(),
                skip_errored,
            },
            defaults: deferred(),
            ..Default::default()
        },
        MemoryStore::new(),
    );
    let outcome = fixture
        .engine
        .handle(Trigger::SiteRebuild(SITE.to_string()))
        .await
        .unwrap();
    assert_eq!(outcome.queued.len(), 1);
    let entry = fixture
        .store()
        .get_entry(outcome.queued[0])
        .await
        .unwrap()
        .unwrap();
    (fixture, entry)
}

async fn enqueue_garbage(store: &MemoryStore) -> QueueEntry {
    let payload = r#"{"format":"slug-tree/1"}"#.to_string();
    let digest = payload_digest(&payload);
    store.enqueue(payload, digest).await.unwrap()
}

async fn wait_for_empty_queue(fixture: &Fixture<MemoryStore>) {
    for _ in 0..200 {
        if fixture.engine.queue().list().await.unwrap().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue was not drained");
}

#[test(tokio::test)]
async fn test_consumer_loop_drains_existing_entries() {
    let (mut fixture, entry) = queued_fixture(true).await;
    assert_eq!(entry.state(), QueueState::Pending);
    assert_eq!(fixture.store().slug_count(), 1);

    let queue = fixture.engine.queue().clone();
    let identity = queue.start(&tokio::runtime::Handle::current());
    assert!(queue.is_alive());
    assert_eq!(identity.process, "test-host:1");
    assert_eq!(
        queue.start(&tokio::runtime::Handle::current()),
        identity,
        "a live consumer is reused"
    );

    wait_for_empty_queue(&fixture).await;
    assert_eq!(fixture.store().slug_count(), 7);
    assert!(fixture
        .take_events()
        .contains(&SlugEvent::EntryCompleted(entry.id, 6)));

    queue.stop();
    assert!(!queue.is_alive());
}

#[test(tokio::test)]
async fn test_consumer_loop_wakes_on_enqueue() {
    let fixture = Fixture::new(blog_tree(), deferred(), MemoryStore::new());
    let queue = fixture.engine.queue();
    queue.start(&tokio::runtime::Handle::current());
    tokio::time::sleep(Duration::from_millis(10)).await;

    fixture
        .engine
        .handle(Trigger::SiteRebuild(SITE.to_string()))
        .await
        .unwrap();

    wait_for_empty_queue(&fixture).await;
    assert_eq!(fixture.store().slug_count(), 7);
    queue.stop();
}

#[test(tokio::test)]
async fn test_new_consumer_gets_a_new_worker_identity() {
    let (fixture, _) = queued_fixture(true).await;
    let queue = fixture.engine.queue();
    let first = queue.start(&tokio::runtime::Handle::current());
    queue.stop();
    let second = queue.start(&tokio::runtime::Handle::current());

    assert_eq!(first.process, second.process);
    assert_ne!(first.worker, second.worker);
    queue.stop();
}

#[test(tokio::test)]
async fn test_entry_of_a_dead_worker_is_reaped() {
    let (fixture, entry) = queued_fixture(true).await;
    let queue = fixture.engine.queue();
    let dead = WorkerIdentity::new(&queue.identity().process);
    fixture.store().put_entry(QueueEntry {
        running: true,
        owner: Some(dead),
        ..entry.clone()
    });

    // The process looks busy until the stuck entry is released.
    assert!(fixture
        .store()
        .claim_next(&queue.identity(), true)
        .await
        .unwrap()
        .is_none());

    assert_eq!(queue.reap_stuck().await.unwrap(), 1);
    let reaped = fixture.store().get_entry(entry.id).await.unwrap().unwrap();
    assert_eq!(reaped.state(), QueueState::Pending);

    assert_eq!(queue.drain().await.unwrap(), 1);
    assert_eq!(fixture.store().slug_count(), 7);
}

#[test(tokio::test)]
async fn test_drain_reaps_before_claiming() {
    let (fixture, entry) = queued_fixture(true).await;
    let queue = fixture.engine.queue();
    fixture.store().put_entry(QueueEntry {
        running: true,
        owner: Some(WorkerIdentity::new(&queue.identity().process)),
        ..entry
    });

    assert_eq!(queue.drain().await.unwrap(), 1);
    assert!(queue.list().await.unwrap().is_empty());
}

#[test(tokio::test)]
async fn test_running_entry_of_another_process_is_left_alone() {
    let (fixture, entry) = queued_fixture(true).await;
    let queue = fixture.engine.queue();
    fixture.store().put_entry(QueueEntry {
        running: true,
        owner: Some(WorkerIdentity::new("other-host:7")),
        ..entry
    });

    assert_eq!(queue.reap_stuck().await.unwrap(), 0);
    assert_eq!(queue.drain().await.unwrap(), 0);
    let running = queue.list().await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].state(), QueueState::Running);
}

#[test(tokio::test)]
async fn test_failed_entry_keeps_its_error() {
    let (mut fixture, _) = queued_fixture(true).await;
    fixture.engine.queue().drain().await.unwrap();
    let bad = enqueue_garbage(fixture.store()).await;
    fixture.take_events();

    assert_eq!(fixture.engine.queue().drain().await.unwrap(), 1);

    let failed = fixture.store().get_entry(bad.id).await.unwrap().unwrap();
    assert_eq!(failed.state(), QueueState::Errored);
    assert!(failed.error.unwrap().contains("serialization"));
    assert!(fixture
        .take_events()
        .iter()
        .any(|e| matches!(e, SlugEvent::EntryFailed(id, _) if *id == bad.id)));
}

#[test(tokio::test)]
async fn test_errored_head_blocks_the_queue_unless_skipped() {
    let (fixture, good) = queued_fixture(false).await;
    let store = fixture.store().clone();
    let bad = enqueue_garbage(&store).await;
    // Put the failing entry ahead of the good one.
    store.delete_entry(good.id).await.unwrap();
    let good = store
        .enqueue(good.payload.clone(), good.digest.clone())
        .await
        .unwrap();
    assert!(bad.id < good.id);

    let queue = fixture.engine.queue();
    assert_eq!(queue.drain().await.unwrap(), 1);
    assert_eq!(queue.drain().await.unwrap(), 0, "the errored head blocks");
    assert_eq!(
        store.get_entry(good.id).await.unwrap().unwrap().state(),
        QueueState::Pending
    );

    let summary = queue.run_entry(good.id).await.unwrap();
    assert_eq!(summary.inserted, 6);
    assert!(store.get_entry(good.id).await.unwrap().is_none());

    assert!(queue.retry(bad.id).await.unwrap());
    assert_eq!(
        store.get_entry(bad.id).await.unwrap().unwrap().state(),
        QueueState::Pending
    );
    assert!(queue.delete(bad.id).await.unwrap());
    assert!(queue.list().await.unwrap().is_empty());
}

#[test(tokio::test)]
async fn test_run_entry_respects_the_single_worker_rule() {
    let (fixture, entry) = queued_fixture(true).await;
    let queue = fixture.engine.queue();

    let missing = queue.run_entry(9999).await;
    assert!(matches!(missing, Err(SlugError::NotFound(_))));

    let other = enqueue_garbage(fixture.store()).await;
    fixture.store().put_entry(QueueEntry {
        running: true,
        owner: Some(queue.identity()),
        ..other
    });
    let busy = queue.run_entry(entry.id).await;
    assert!(matches!(busy, Err(SlugError::QueueBusy)));
    assert_eq!(
        fixture
            .store()
            .get_entry(entry.id)
            .await
            .unwrap()
            .unwrap()
            .state(),
        QueueState::Pending
    );
}

#[test(tokio::test)]
async fn test_default_identity_reaps_entries_of_a_previous_run() {
    let (fixture, entry) = {
        let fixture = Fixture::new(blog_tree(), deferred(), MemoryStore::new());
        let outcome = fixture
            .engine
            .handle(Trigger::SiteRebuild(SITE.to_string()))
            .await
            .unwrap();
        let entry = fixture
            .store()
            .get_entry(outcome.queued[0])
            .await
            .unwrap()
            .unwrap();
        (fixture, entry)
    };
    // The run that claimed the entry used the same default configuration and then died.
    let previous_run = WorkerIdentity::new(&QueueConfig::default().process_identity);
    fixture.store().put_entry(QueueEntry {
        running: true,
        owner: Some(previous_run.clone()),
        ..entry.clone()
    });

    let queue = fixture.engine.queue();
    assert_eq!(queue.identity().process, previous_run.process);
    assert_ne!(queue.identity().worker, previous_run.worker);
    assert_eq!(queue.reap_stuck().await.unwrap(), 1);
    assert_eq!(
        fixture
            .store()
            .get_entry(entry.id)
            .await
            .unwrap()
            .unwrap()
            .state(),
        QueueState::Pending
    );
}

#[test(tokio::test)]
async fn test_entry_of_a_deleted_node_fails_with_a_load_error() {
    let (mut fixture, _) = queued_fixture(true).await;
    fixture.engine.queue().drain().await.unwrap();
    fixture.tree.rename(BLOG, EN, "News").unwrap();
    let outcome = fixture
        .engine
        .handle(Trigger::DocumentUpdated(BLOG))
        .await
        .unwrap();
    assert_eq!(outcome.queued.len(), 1);
    let queued = outcome.queued[0];

    fixture.tree.remove(BLOG);
    fixture.take_events();
    assert_eq!(fixture.engine.queue().drain().await.unwrap(), 1);

    let failed = fixture.store().get_entry(queued).await.unwrap().unwrap();
    assert_eq!(failed.state(), QueueState::Errored);
    assert!(failed.error.unwrap().contains("could not be loaded"));
    assert!(fixture
        .take_events()
        .iter()
        .any(|e| matches!(e, SlugEvent::EntryFailed(id, _) if *id == queued)));
}

#[test(tokio::test)]
async fn test_unstored_completion_hands_the_entry_back() {
    let fixture = Fixture::new(blog_tree(), deferred(), FlakyStore::default());
    let outcome = fixture
        .engine
        .handle(Trigger::SiteRebuild(SITE.to_string()))
        .await
        .unwrap();
    let id = outcome.queued[0];
    fixture.store().failing_completions.store(1, Ordering::SeqCst);

    let queue = fixture.engine.queue();
    let before = queue.identity();
    assert!(matches!(queue.drain().await, Err(SlugError::Store(_))));

    let entry = fixture.store().get_entry(id).await.unwrap().unwrap();
    assert_eq!(entry.state(), QueueState::Pending);
    assert!(entry.owner.is_none());
    assert_eq!(queue.identity().process, before.process);
    assert_ne!(queue.identity().worker, before.worker);

    assert_eq!(queue.drain().await.unwrap(), 1);
    assert!(queue.list().await.unwrap().is_empty());
    assert_eq!(fixture.store().inner.slug_count(), 7);
}
