//! SQLite implementation of [SlugStore] and [QueueStore].
//!
//! The schema is created by embedded migrations when the database is opened through
//! [db_init]. Commits run inside one SQLite transaction, so a failing change leaves every
//! table as it was before the commit.
use sqlx::{
    error::BoxDynError,
    migrate::{
        MigrateDatabase, Migration as SqlxMigration, MigrationSource, MigrationType, Migrator,
    },
    sqlite::{Sqlite, SqliteConnectOptions, SqliteConnection, SqliteRow},
    ConnectOptions, FromRow, Pool, QueryBuilder, Row,
};
use std::{future::Future, path::PathBuf, pin::Pin, str::FromStr};
use uuid::Uuid;

use crate::{
    error::SlugError,
    properties::{now_ms, AlternateUrl, NodeId, QueueEntry, SlugRecord, WorkerIdentity},
    store::{ChangeSet, CommitSummary, QueueStore, SlugChange, SlugStore},
};

pub const SLUG_DB: &str = "slugs.db";

type MigrationFuture =
    Pin<Box<dyn Future<Output = Result<Vec<SqlxMigration>, BoxDynError>> + Send + 'static>>;

fn decode_uuid(value: &str) -> sqlx::Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| sqlx::Error::from(SlugError::from(e)))
}

impl FromRow<'_, SqliteRow> for SlugRecord {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let id_str: &str = row.try_get("id")?;
        let is_custom: i64 = row.try_get("is_custom")?;
        Ok(SlugRecord {
            id: decode_uuid(id_str)?,
            site: row.try_get("site")?,
            node_id: NodeId(row.try_get("node_id")?),
            culture: row.try_get("culture")?,
            slug: row.try_get("slug")?,
            is_custom: is_custom != 0,
            modified_ms: row.try_get("modified_ms")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for AlternateUrl {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let id_str: &str = row.try_get("id")?;
        Ok(AlternateUrl {
            id: decode_uuid(id_str)?,
            site: row.try_get("site")?,
            url: row.try_get("url")?,
            node_id: NodeId(row.try_get("node_id")?),
            culture: row.try_get("culture")?,
            created_ms: row.try_get("created_ms")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for QueueEntry {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let running: i64 = row.try_get("running")?;
        let process: Option<String> = row.try_get("worker_process")?;
        let worker: Option<&str> = row.try_get("worker_id")?;
        let owner = match (process, worker) {
            (Some(process), Some(worker)) => Some(WorkerIdentity {
                process,
                worker: decode_uuid(worker)?,
            }),
            _ => None,
        };
        Ok(QueueEntry {
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
            digest: row.try_get("digest")?,
            running: running != 0,
            owner,
            started_ms: row.try_get("started_ms")?,
            ended_ms: row.try_get("ended_ms")?,
            error: row.try_get("error")?,
            created_ms: row.try_get("created_ms")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DbConnection(pub Pool<Sqlite>);

impl DbConnection {
    /// Open (creating and migrating if needed) the database at `db_path`.
    pub async fn open(db_path: PathBuf) -> Result<DbConnection, SlugError> {
        Ok(DbConnection(db_init(db_path).await?))
    }

    async fn find_record(
        conn: &mut SqliteConnection,
        node_id: NodeId,
        culture: &str,
    ) -> Result<Option<SlugRecord>, SlugError> {
        let record = sqlx::query_as::<_, SlugRecord>(
            "SELECT * FROM slugs WHERE node_id = ? AND culture = ?",
        )
        .bind(node_id.0)
        .bind(culture)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(record)
    }

    async fn insert_record(
        conn: &mut SqliteConnection,
        record: &SlugRecord,
        is_custom: bool,
    ) -> Result<(), SlugError> {
        sqlx::query(
            "INSERT INTO slugs (id, site, node_id, culture, slug, is_custom, modified_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(&record.site)
        .bind(record.node_id.0)
        .bind(&record.culture)
        .bind(&record.slug)
        .bind(is_custom as i64)
        .bind(record.modified_ms)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn apply(
        conn: &mut SqliteConnection,
        change: SlugChange,
        summary: &mut CommitSummary,
    ) -> Result<(), SlugError> {
        match change {
            SlugChange::Insert(record) => {
                match Self::find_record(conn, record.node_id, &record.culture).await? {
                    Some(existing) if existing.is_custom => {}
                    Some(existing) => {
                        sqlx::query(
                            "UPDATE slugs SET slug = ?, site = ?, modified_ms = ? \
                             WHERE id = ? AND is_custom = 0",
                        )
                        .bind(&record.slug)
                        .bind(&record.site)
                        .bind(record.modified_ms)
                        .bind(existing.id.to_string())
                        .execute(&mut *conn)
                        .await?;
                        summary.updated += 1;
                    }
                    None => {
                        Self::insert_record(conn, &record, record.is_custom).await?;
                        summary.inserted += 1;
                    }
                }
            }
            SlugChange::SetCustom(record) => {
                match Self::find_record(conn, record.node_id, &record.culture).await? {
                    Some(existing) => {
                        sqlx::query(
                            "UPDATE slugs SET slug = ?, is_custom = 1, modified_ms = ? \
                             WHERE id = ?",
                        )
                        .bind(&record.slug)
                        .bind(record.modified_ms)
                        .bind(existing.id.to_string())
                        .execute(&mut *conn)
                        .await?;
                        summary.updated += 1;
                    }
                    None => {
                        Self::insert_record(conn, &record, true).await?;
                        summary.inserted += 1;
                    }
                }
            }
            SlugChange::Update {
                id,
                slug,
                modified_ms,
            } => {
                let result = sqlx::query(
                    "UPDATE slugs SET slug = ?, modified_ms = ? WHERE id = ? AND is_custom = 0",
                )
                .bind(slug)
                .bind(modified_ms)
                .bind(id.to_string())
                .execute(&mut *conn)
                .await?;
                summary.updated += result.rows_affected() as usize;
            }
            SlugChange::DeleteForNodes(nodes) => {
                if nodes.is_empty() {
                    return Ok(());
                }
                for table in ["slugs", "alternate_urls"] {
                    let mut qb = QueryBuilder::<Sqlite>::new(format!(
                        "DELETE FROM {table} WHERE node_id IN ("
                    ));
                    let mut separated = qb.separated(", ");
                    for node in nodes.iter() {
                        separated.push_bind(node.0);
                    }
                    separated.push_unseparated(")");
                    let result = qb.build().execute(&mut *conn).await?;
                    if table == "slugs" {
                        summary.deleted += result.rows_affected() as usize;
                    }
                }
            }
            SlugChange::DeleteGenerated { site } => {
                let result = sqlx::query("DELETE FROM slugs WHERE site = ? AND is_custom = 0")
                    .bind(site)
                    .execute(&mut *conn)
                    .await?;
                summary.deleted += result.rows_affected() as usize;
            }
            SlugChange::AddAlternate(alternate) => {
                sqlx::query(
                    "INSERT INTO alternate_urls (id, site, url, node_id, culture, created_ms) \
                     VALUES (?, ?, ?, ?, ?, ?) \
                     ON CONFLICT(site, url) DO UPDATE SET node_id = excluded.node_id, \
                     culture = excluded.culture, created_ms = excluded.created_ms",
                )
                .bind(alternate.id.to_string())
                .bind(&alternate.site)
                .bind(&alternate.url)
                .bind(alternate.node_id.0)
                .bind(&alternate.culture)
                .bind(alternate.created_ms)
                .execute(&mut *conn)
                .await?;
                summary.alternates += 1;
            }
            SlugChange::RemoveAlternate { site, url } => {
                let result = sqlx::query("DELETE FROM alternate_urls WHERE site = ? AND url = ?")
                    .bind(site)
                    .bind(url)
                    .execute(&mut *conn)
                    .await?;
                summary.alternates += result.rows_affected() as usize;
            }
        }
        Ok(())
    }

    /// Every alternate URL of a site.
    pub async fn site_alternates(&self, site: &str) -> Result<Vec<AlternateUrl>, SlugError> {
        let alternates = sqlx::query_as::<_, AlternateUrl>(
            "SELECT * FROM alternate_urls WHERE site = ? ORDER BY url",
        )
        .bind(site)
        .fetch_all(&self.0)
        .await?;
        Ok(alternates)
    }
}

impl SlugStore for DbConnection {
    async fn slugs_for_node(&self, node: NodeId) -> Result<Vec<SlugRecord>, SlugError> {
        let records = sqlx::query_as::<_, SlugRecord>(
            "SELECT * FROM slugs WHERE node_id = ? ORDER BY culture",
        )
        .bind(node.0)
        .fetch_all(&self.0)
        .await?;
        Ok(records)
    }

    async fn get_slug_record(&self, id: Uuid) -> Result<Option<SlugRecord>, SlugError> {
        let record = sqlx::query_as::<_, SlugRecord>("SELECT * FROM slugs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.0)
            .await?;
        Ok(record)
    }

    async fn find_slug(&self, site: &str, slug: &str) -> Result<Vec<SlugRecord>, SlugError> {
        let records = sqlx::query_as::<_, SlugRecord>(
            "SELECT * FROM slugs WHERE site = ? AND slug = ? ORDER BY node_id, culture",
        )
        .bind(site)
        .bind(slug)
        .fetch_all(&self.0)
        .await?;
        Ok(records)
    }

    async fn site_slugs(&self, site: &str) -> Result<Vec<SlugRecord>, SlugError> {
        let records = sqlx::query_as::<_, SlugRecord>(
            "SELECT * FROM slugs WHERE site = ? ORDER BY node_id, culture",
        )
        .bind(site)
        .fetch_all(&self.0)
        .await?;
        Ok(records)
    }

    async fn find_alternate_url(
        &self,
        site: &str,
        url: &str,
    ) -> Result<Option<AlternateUrl>, SlugError> {
        let alternate = sqlx::query_as::<_, AlternateUrl>(
            "SELECT * FROM alternate_urls WHERE site = ? AND url = ?",
        )
        .bind(site)
        .bind(url)
        .fetch_optional(&self.0)
        .await?;
        Ok(alternate)
    }

    #[tracing::instrument(skip_all, fields(changes = changes.len()))]
    async fn commit(&self, changes: ChangeSet) -> Result<CommitSummary, SlugError> {
        let mut summary = CommitSummary::default();
        if changes.is_empty() {
            return Ok(summary);
        }
        let mut tx = self.0.begin().await?;
        for change in changes.changes {
            if let Err(e) = Self::apply(&mut *tx, change, &mut summary).await {
                tracing::error!("[DbConnection.commit] Rolling back: {}", e);
                tx.rollback().await?;
                return Err(e);
            }
        }
        tx.commit().await?;
        tracing::debug!(
            "[DbConnection.commit] {} inserted, {} updated, {} deleted, {} alternate writes",
            summary.inserted,
            summary.updated,
            summary.deleted,
            summary.alternates
        );
        Ok(summary)
    }
}

impl QueueStore for DbConnection {
    async fn enqueue(&self, payload: String, digest: String) -> Result<QueueEntry, SlugError> {
        let entry = sqlx::query_as::<_, QueueEntry>(
            "INSERT INTO queue_entries (payload, digest, running, created_ms) \
             VALUES (?, ?, 0, ?) RETURNING *",
        )
        .bind(payload)
        .bind(digest)
        .bind(now_ms())
        .fetch_one(&self.0)
        .await?;
        Ok(entry)
    }

    async fn get_entry(&self, id: i64) -> Result<Option<QueueEntry>, SlugError> {
        let entry = sqlx::query_as::<_, QueueEntry>("SELECT * FROM queue_entries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.0)
            .await?;
        Ok(entry)
    }

    async fn list_entries(&self) -> Result<Vec<QueueEntry>, SlugError> {
        let entries = sqlx::query_as::<_, QueueEntry>("SELECT * FROM queue_entries ORDER BY id")
            .fetch_all(&self.0)
            .await?;
        Ok(entries)
    }

    async fn reap_stuck(&self, process: &str, live_worker: Option<Uuid>) -> Result<u64, SlugError> {
        let result = sqlx::query(
            "UPDATE queue_entries SET running = 0, worker_process = NULL, worker_id = NULL \
             WHERE running = 1 AND worker_process = ?1 \
             AND (?2 IS NULL OR worker_id IS NULL OR worker_id != ?2)",
        )
        .bind(process)
        .bind(live_worker.map(|worker| worker.to_string()))
        .execute(&self.0)
        .await?;
        Ok(result.rows_affected())
    }

    async fn claim_next(
        &self,
        owner: &WorkerIdentity,
        skip_errored: bool,
    ) -> Result<Option<QueueEntry>, SlugError> {
        let entry = sqlx::query_as::<_, QueueEntry>(
            "UPDATE queue_entries \
             SET running = 1, worker_process = ?1, worker_id = ?2, started_ms = ?3, ended_ms = NULL \
             WHERE id = (SELECT id FROM queue_entries \
                         WHERE running = 0 AND (?4 = 0 OR error IS NULL) \
                         ORDER BY id LIMIT 1) \
             AND error IS NULL \
             AND NOT EXISTS (SELECT 1 FROM queue_entries \
                             WHERE running = 1 AND worker_process = ?1) \
             RETURNING *",
        )
        .bind(&owner.process)
        .bind(owner.worker.to_string())
        .bind(now_ms())
        .bind(skip_errored as i64)
        .fetch_optional(&self.0)
        .await?;
        Ok(entry)
    }

    async fn claim_entry(
        &self,
        id: i64,
        owner: &WorkerIdentity,
    ) -> Result<Option<QueueEntry>, SlugError> {
        let entry = sqlx::query_as::<_, QueueEntry>(
            "UPDATE queue_entries \
             SET running = 1, worker_process = ?1, worker_id = ?2, started_ms = ?3, \
                 ended_ms = NULL, error = NULL \
             WHERE id = ?4 AND running = 0 \
             AND NOT EXISTS (SELECT 1 FROM queue_entries \
                             WHERE running = 1 AND worker_process = ?1) \
             RETURNING *",
        )
        .bind(&owner.process)
        .bind(owner.worker.to_string())
        .bind(now_ms())
        .bind(id)
        .fetch_optional(&self.0)
        .await?;
        Ok(entry)
    }

    async fn complete_entry(&self, id: i64) -> Result<(), SlugError> {
        sqlx::query("DELETE FROM queue_entries WHERE id = ?")
            .bind(id)
            .execute(&self.0)
            .await?;
        Ok(())
    }

    async fn fail_entry(&self, id: i64, error: &str) -> Result<(), SlugError> {
        sqlx::query(
            "UPDATE queue_entries SET running = 0, error = ?, ended_ms = ? WHERE id = ?",
        )
        .bind(error)
        .bind(now_ms())
        .bind(id)
        .execute(&self.0)
        .await?;
        Ok(())
    }

    async fn retry_entry(&self, id: i64) -> Result<bool, SlugError> {
        let result = sqlx::query(
            "UPDATE queue_entries SET error = NULL, ended_ms = NULL WHERE id = ? AND running = 0",
        )
        .bind(id)
        .execute(&self.0)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_entry(&self, id: i64) -> Result<bool, SlugError> {
        let result = sqlx::query("DELETE FROM queue_entries WHERE id = ?")
            .bind(id)
            .execute(&self.0)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> MigrationFuture {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::ReversibleUp) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

pub async fn db_init(db_path: PathBuf) -> Result<Pool<Sqlite>, sqlx::Error> {
    let fqdb = format!("sqlite:{}", db_path.display());
    tracing::debug!("Initializing slug db from file: {:?}", fqdb);
    if !Sqlite::database_exists(&fqdb).await.unwrap_or(false) {
        Sqlite::create_database(&fqdb).await?;
    }
    let options = SqliteConnectOptions::from_str(&fqdb)?
        .read_only(false)
        .busy_timeout(std::time::Duration::from_secs(5))
        .disable_statement_logging()
        .create_if_missing(true);

    use sqlx::pool::PoolOptions;
    let pool = PoolOptions::<Sqlite>::new().connect_with(options).await?;

    let migrations = MigrationList(vec![
        Migration {
            version: 1,
            description: "create_initial_tables",
            sql: "\
            CREATE TABLE slugs (id TEXT PRIMARY KEY, site TEXT NOT NULL, node_id INTEGER NOT NULL, culture TEXT NOT NULL, slug TEXT NOT NULL, is_custom INTEGER NOT NULL DEFAULT 0, modified_ms INTEGER NOT NULL, UNIQUE(node_id, culture)); \
            CREATE INDEX slugs_site_slug ON slugs (site, slug); \
            CREATE TABLE alternate_urls (id TEXT PRIMARY KEY, site TEXT NOT NULL, url TEXT NOT NULL, node_id INTEGER NOT NULL, culture TEXT NOT NULL, created_ms INTEGER NOT NULL, UNIQUE(site, url)); \
            CREATE TABLE queue_entries (id INTEGER PRIMARY KEY AUTOINCREMENT, payload TEXT NOT NULL, digest TEXT NOT NULL, running INTEGER NOT NULL DEFAULT 0, worker_process TEXT, worker_id TEXT, started_ms INTEGER, ended_ms INTEGER, error TEXT, created_ms INTEGER NOT NULL);",
            kind: MigrationType::ReversibleUp,
        }
    ]);
    let migrator = Migrator::new(migrations.clone()).await?;
    migrator.run(&pool).await?;

    let slug_res = sqlx::query("SELECT COUNT(*) as scount FROM slugs;")
        .fetch_one(&pool)
        .await?;
    let queue_res = sqlx::query("SELECT COUNT(*) as qcount FROM queue_entries;")
        .fetch_one(&pool)
        .await?;
    tracing::info!(
        "DB Connection initialized.\n \
         \tStored slug count:\t{:?} \n \
         \tQueued entry count:\t{:?}",
        slug_res.get::<i64, usize>(0),
        queue_res.get::<i64, usize>(0)
    );

    Ok(pool)
}
