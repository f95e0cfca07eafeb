//! PostgreSQL Store
//!
//! `PgStore` implements every pipeline storage trait plus [`LockBackend`]
//! over a deadpool-postgres pool; `PgQueue` is a table-backed work queue.
//! Schema lives in `migrations/V1__rbac_pipeline.sql`.
//!
//! Multi-row writes that must be atomic (transfer commit, materialized
//! apply) run inside one transaction.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;

use ::async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use serde_json::Value as JsonValue;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;
use warrant_core::constants::DEFAULT_QUEUE_VISIBILITY_SECS;
use warrant_core::{
    ActionPk, ActionScope, BatchStatus, EntityKind, GroupAlterEvent, GroupPk, GroupResource,
    LockData, LockError, QueueError, ResourceMap, ResourceType, ResourceTypePk, StorageError,
    SubjectActionAlterMessage, SubjectActionExpression, SubjectActionGroupMessage,
    SubjectActionGroupResource, SubjectActionPair, SubjectPk, Timestamp, UnixSeconds,
    WarrantError, WarrantResult,
};

use crate::async_trait::{
    BatchStore, ChangeEventStore, GrantSource, MaterializedStore, RecomputeOutcome,
};
use crate::lock_backend::{LockBackend, LockKey};
use crate::queue::{Delivery, WorkQueue};

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Wait timeout for a pooled connection
    pub timeout: Duration,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "warrant".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl PgConfig {
    /// Create a new database configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("WARRANT_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("WARRANT_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5432),
            dbname: std::env::var("WARRANT_DB_NAME").unwrap_or_else(|_| "warrant".to_string()),
            user: std::env::var("WARRANT_DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("WARRANT_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("WARRANT_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(16),
            timeout: Duration::from_secs(
                std::env::var("WARRANT_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> WarrantResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_cfg = PoolConfig::new(self.max_size);
        pool_cfg.timeouts.wait = Some(self.timeout);
        cfg.pool = Some(pool_cfg);

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| pool_err(format!("Failed to create pool: {}", e)))
    }
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn pool_err(e: impl Display) -> WarrantError {
    StorageError::Pool {
        reason: e.to_string(),
    }
    .into()
}

fn query_err(kind: EntityKind) -> impl FnOnce(tokio_postgres::Error) -> WarrantError {
    move |e| {
        StorageError::QueryFailed {
            kind,
            reason: e.to_string(),
        }
        .into()
    }
}

fn txn_err(e: tokio_postgres::Error) -> WarrantError {
    StorageError::TransactionFailed {
        reason: e.to_string(),
    }
    .into()
}

fn corrupt(kind: EntityKind, key: impl Display, reason: impl Display) -> WarrantError {
    StorageError::Corrupt {
        kind,
        key: key.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn to_json<T: serde::Serialize>(kind: EntityKind, key: impl Display, value: &T) -> WarrantResult<JsonValue> {
    serde_json::to_value(value).map_err(|e| corrupt(kind, key, e))
}

fn from_json<T: serde::de::DeserializeOwned>(
    kind: EntityKind,
    key: impl Display,
    value: JsonValue,
) -> WarrantResult<T> {
    serde_json::from_value(value).map_err(|e| corrupt(kind, key, e))
}

// ============================================================================
// ROW MAPPING
// ============================================================================

const EVENT_COLUMNS: &str = "uuid, group_pk, subject_pks, action_pks, created_at";
const BATCH_COLUMNS: &str = "uuid, messages, status, check_count, created_at, updated_at";

fn row_to_event(row: &Row) -> WarrantResult<GroupAlterEvent> {
    let uuid: Uuid = row.get("uuid");
    Ok(GroupAlterEvent {
        uuid,
        group_pk: row.get("group_pk"),
        subject_pks: from_json(EntityKind::ChangeEvent, uuid, row.get("subject_pks"))?,
        action_pks: from_json(EntityKind::ChangeEvent, uuid, row.get("action_pks"))?,
        created_at: row.get("created_at"),
    })
}

fn row_to_batch(row: &Row) -> WarrantResult<SubjectActionAlterMessage> {
    let uuid: Uuid = row.get("uuid");
    let status: String = row.get("status");
    let messages: Vec<SubjectActionGroupMessage> =
        from_json(EntityKind::Batch, uuid, row.get("messages"))?;
    Ok(SubjectActionAlterMessage {
        uuid,
        messages,
        status: BatchStatus::from_db_str(&status).map_err(|e| corrupt(EntityKind::Batch, uuid, e))?,
        check_count: row.get("check_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// ============================================================================
// STORE
// ============================================================================

/// PostgreSQL-backed pipeline store.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &PgConfig) -> WarrantResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn conn(&self) -> WarrantResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(pool_err)
    }

    /// Apply the bundled schema migration. Idempotent.
    pub async fn migrate(&self) -> WarrantResult<()> {
        let conn = self.conn().await?;
        conn.batch_execute(include_str!("../migrations/V1__rbac_pipeline.sql"))
            .await
            .map_err(txn_err)
    }
}

#[async_trait]
impl ChangeEventStore for PgStore {
    async fn event_create_bulk(&self, events: &[GroupAlterEvent]) -> WarrantResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let txn = conn.transaction().await.map_err(txn_err)?;
        let stmt = txn
            .prepare(
                "INSERT INTO warrant_group_alter_event \
                 (uuid, group_pk, subject_pks, action_pks, created_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .await
            .map_err(query_err(EntityKind::ChangeEvent))?;

        for event in events {
            let subjects = to_json(EntityKind::ChangeEvent, event.uuid, &event.subject_pks)?;
            let actions = to_json(EntityKind::ChangeEvent, event.uuid, &event.action_pks)?;
            txn.execute(
                &stmt,
                &[&event.uuid, &event.group_pk, &subjects, &actions, &event.created_at],
            )
            .await
            .map_err(query_err(EntityKind::ChangeEvent))?;
        }
        txn.commit().await.map_err(txn_err)
    }

    async fn event_list_by_group(&self, group_pk: GroupPk) -> WarrantResult<Vec<GroupAlterEvent>> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {} FROM warrant_group_alter_event WHERE group_pk = $1 ORDER BY created_at, uuid",
            EVENT_COLUMNS
        );
        let rows = conn
            .query(sql.as_str(), &[&group_pk])
            .await
            .map_err(query_err(EntityKind::ChangeEvent))?;
        rows.iter().map(row_to_event).collect()
    }

    async fn event_list_before(
        &self,
        created_before: Timestamp,
        limit: usize,
    ) -> WarrantResult<Vec<GroupAlterEvent>> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {} FROM warrant_group_alter_event WHERE created_at <= $1 \
             ORDER BY created_at, uuid LIMIT $2",
            EVENT_COLUMNS
        );
        let limit = limit as i64;
        let rows = conn
            .query(sql.as_str(), &[&created_before, &limit])
            .await
            .map_err(query_err(EntityKind::ChangeEvent))?;
        rows.iter().map(row_to_event).collect()
    }
}

#[async_trait]
impl BatchStore for PgStore {
    async fn batch_commit_transfer(
        &self,
        batches: &[SubjectActionAlterMessage],
        consumed_events: &[Uuid],
    ) -> WarrantResult<()> {
        let mut conn = self.conn().await?;
        let txn = conn.transaction().await.map_err(txn_err)?;

        let stmt = txn
            .prepare(
                "INSERT INTO warrant_subject_action_alter_message \
                 (uuid, messages, status, check_count, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .await
            .map_err(query_err(EntityKind::Batch))?;
        for batch in batches {
            let messages = to_json(EntityKind::Batch, batch.uuid, &batch.messages)?;
            txn.execute(
                &stmt,
                &[
                    &batch.uuid,
                    &messages,
                    &batch.status.as_db_str(),
                    &batch.check_count,
                    &batch.created_at,
                    &batch.updated_at,
                ],
            )
            .await
            .map_err(query_err(EntityKind::Batch))?;
        }

        if !consumed_events.is_empty() {
            txn.execute(
                "DELETE FROM warrant_group_alter_event WHERE uuid = ANY($1)",
                &[&consumed_events],
            )
            .await
            .map_err(query_err(EntityKind::ChangeEvent))?;
        }

        txn.commit().await.map_err(txn_err)
    }

    async fn batch_get(&self, uuid: Uuid) -> WarrantResult<Option<SubjectActionAlterMessage>> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {} FROM warrant_subject_action_alter_message WHERE uuid = $1",
            BATCH_COLUMNS
        );
        let row = conn
            .query_opt(sql.as_str(), &[&uuid])
            .await
            .map_err(query_err(EntityKind::Batch))?;
        row.as_ref().map(row_to_batch).transpose()
    }

    async fn batch_begin_processing(
        &self,
        uuid: Uuid,
        now: Timestamp,
    ) -> WarrantResult<Option<SubjectActionAlterMessage>> {
        let conn = self.conn().await?;
        let sql = format!(
            "UPDATE warrant_subject_action_alter_message \
             SET status = $2, check_count = check_count + 1, updated_at = $3 \
             WHERE uuid = $1 RETURNING {}",
            BATCH_COLUMNS
        );
        let row = conn
            .query_opt(
                sql.as_str(),
                &[&uuid, &BatchStatus::Processing.as_db_str(), &now],
            )
            .await
            .map_err(query_err(EntityKind::Batch))?;
        row.as_ref().map(row_to_batch).transpose()
    }

    async fn batch_transition(
        &self,
        uuid: Uuid,
        from: BatchStatus,
        to: BatchStatus,
        now: Timestamp,
    ) -> WarrantResult<bool> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE warrant_subject_action_alter_message \
                 SET status = $3, updated_at = $4 WHERE uuid = $1 AND status = $2",
                &[&uuid, &from.as_db_str(), &to.as_db_str(), &now],
            )
            .await
            .map_err(query_err(EntityKind::Batch))?;
        Ok(updated == 1)
    }

    async fn batch_delete(&self, uuid: Uuid) -> WarrantResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "DELETE FROM warrant_subject_action_alter_message WHERE uuid = $1",
            &[&uuid],
        )
        .await
        .map_err(query_err(EntityKind::Batch))?;
        Ok(())
    }

    async fn batch_list_stale(
        &self,
        updated_before: Timestamp,
        max_check_count: i64,
        limit: usize,
    ) -> WarrantResult<Vec<SubjectActionAlterMessage>> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {} FROM warrant_subject_action_alter_message \
             WHERE updated_at < $1 AND check_count <= $2 \
             ORDER BY updated_at, uuid LIMIT $3",
            BATCH_COLUMNS
        );
        let limit = limit as i64;
        let rows = conn
            .query(sql.as_str(), &[&updated_before, &max_check_count, &limit])
            .await
            .map_err(query_err(EntityKind::Batch))?;
        rows.iter().map(row_to_batch).collect()
    }
}

#[async_trait]
impl GrantSource for PgStore {
    async fn membership_expires_at(
        &self,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
    ) -> WarrantResult<Option<UnixSeconds>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT expires_at FROM warrant_subject_group WHERE subject_pk = $1 AND group_pk = $2",
                &[&subject_pk, &group_pk],
            )
            .await
            .map_err(query_err(EntityKind::Membership))?;
        Ok(row.map(|r| r.get("expires_at")))
    }

    async fn group_action_resources(
        &self,
        group_pk: GroupPk,
        action_pk: ActionPk,
    ) -> WarrantResult<ResourceMap> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT resources FROM warrant_group_action_resource \
                 WHERE group_pk = $1 AND action_pk = $2",
                &[&group_pk, &action_pk],
            )
            .await
            .map_err(query_err(EntityKind::Grant))?;
        match row {
            Some(row) => from_json(
                EntityKind::Grant,
                format!("{}:{}", group_pk, action_pk),
                row.get("resources"),
            ),
            None => Ok(ResourceMap::new()),
        }
    }

    async fn action_scope(&self, action_pk: ActionPk) -> WarrantResult<Option<ActionScope>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT resource_type_pk FROM warrant_action WHERE pk = $1",
                &[&action_pk],
            )
            .await
            .map_err(query_err(EntityKind::Action))?;
        Ok(row.map(|r| ActionScope {
            action_pk,
            resource_type_pk: r.get("resource_type_pk"),
        }))
    }

    async fn resource_types(&self, pks: &[ResourceTypePk]) -> WarrantResult<Vec<ResourceType>> {
        if pks.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT pk, id FROM warrant_resource_type WHERE pk = ANY($1) ORDER BY pk",
                &[&pks],
            )
            .await
            .map_err(query_err(EntityKind::ResourceType))?;
        Ok(rows
            .iter()
            .map(|r| ResourceType {
                pk: r.get("pk"),
                id: r.get("id"),
            })
            .collect())
    }

    async fn group_member_pks(&self, group_pk: GroupPk) -> WarrantResult<Vec<SubjectPk>> {
        let conn = self.conn().await?;
        let now = Utc::now().timestamp();
        let rows = conn
            .query(
                "SELECT subject_pk FROM warrant_subject_group \
                 WHERE group_pk = $1 AND expires_at > $2 ORDER BY subject_pk",
                &[&group_pk, &now],
            )
            .await
            .map_err(query_err(EntityKind::Membership))?;
        Ok(rows.iter().map(|r| r.get("subject_pk")).collect())
    }

    async fn group_action_pks(&self, group_pk: GroupPk) -> WarrantResult<Vec<ActionPk>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT action_pk FROM warrant_group_action_resource \
                 WHERE group_pk = $1 ORDER BY action_pk",
                &[&group_pk],
            )
            .await
            .map_err(query_err(EntityKind::Grant))?;
        Ok(rows.iter().map(|r| r.get("action_pk")).collect())
    }
}

#[async_trait]
impl MaterializedStore for PgStore {
    async fn aggregate_get(
        &self,
        subject_pk: SubjectPk,
        action_pk: ActionPk,
    ) -> WarrantResult<Option<SubjectActionGroupResource>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT group_resource FROM warrant_subject_action_group_resource \
                 WHERE subject_pk = $1 AND action_pk = $2",
                &[&subject_pk, &action_pk],
            )
            .await
            .map_err(query_err(EntityKind::Aggregate))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let group_resource: BTreeMap<GroupPk, GroupResource> = from_json(
            EntityKind::Aggregate,
            format!("{}:{}", subject_pk, action_pk),
            row.get("group_resource"),
        )?;
        Ok(Some(SubjectActionGroupResource {
            subject_pk,
            action_pk,
            group_resource,
        }))
    }

    async fn expressions_list(
        &self,
        pairs: &[SubjectActionPair],
    ) -> WarrantResult<Vec<SubjectActionExpression>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let (subjects, actions): (Vec<SubjectPk>, Vec<ActionPk>) = pairs.iter().copied().unzip();
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT e.subject_pk, e.action_pk, e.expression, e.expires_at \
                 FROM warrant_subject_action_expression e \
                 JOIN unnest($1::bigint[], $2::bigint[]) AS p(subject_pk, action_pk) \
                   ON e.subject_pk = p.subject_pk AND e.action_pk = p.action_pk",
                &[&subjects, &actions],
            )
            .await
            .map_err(query_err(EntityKind::Expression))?;

        rows.iter()
            .map(|r| {
                let subject_pk: SubjectPk = r.get("subject_pk");
                let action_pk: ActionPk = r.get("action_pk");
                Ok(SubjectActionExpression {
                    subject_pk,
                    action_pk,
                    expression: from_json(
                        EntityKind::Expression,
                        format!("{}:{}", subject_pk, action_pk),
                        r.get("expression"),
                    )?,
                    expires_at: r.get("expires_at"),
                })
            })
            .collect()
    }

    async fn materialized_apply(&self, outcome: &RecomputeOutcome) -> WarrantResult<()> {
        let (subject_pk, action_pk) = outcome.pair();
        let key = format!("{}:{}", subject_pk, action_pk);
        let mut conn = self.conn().await?;
        let txn = conn.transaction().await.map_err(txn_err)?;

        match outcome {
            RecomputeOutcome::Persist {
                aggregate,
                expression,
            } => {
                let group_resource =
                    to_json(EntityKind::Aggregate, &key, &aggregate.group_resource)?;
                txn.execute(
                    "INSERT INTO warrant_subject_action_group_resource \
                     (subject_pk, action_pk, group_resource, updated_at) VALUES ($1, $2, $3, now()) \
                     ON CONFLICT (subject_pk, action_pk) DO UPDATE \
                     SET group_resource = EXCLUDED.group_resource, updated_at = now()",
                    &[&subject_pk, &action_pk, &group_resource],
                )
                .await
                .map_err(query_err(EntityKind::Aggregate))?;

                match expression {
                    Some(expression) => {
                        let body = to_json(EntityKind::Expression, &key, &expression.expression)?;
                        txn.execute(
                            "INSERT INTO warrant_subject_action_expression \
                             (subject_pk, action_pk, expression, expires_at, updated_at) \
                             VALUES ($1, $2, $3, $4, now()) \
                             ON CONFLICT (subject_pk, action_pk) DO UPDATE \
                             SET expression = EXCLUDED.expression, \
                                 expires_at = EXCLUDED.expires_at, updated_at = now()",
                            &[&subject_pk, &action_pk, &body, &expression.expires_at],
                        )
                        .await
                        .map_err(query_err(EntityKind::Expression))?;
                    }
                    None => {
                        delete_expression(&txn, subject_pk, action_pk).await?;
                    }
                }
            }
            RecomputeOutcome::Delete { .. } => {
                txn.execute(
                    "DELETE FROM warrant_subject_action_group_resource \
                     WHERE subject_pk = $1 AND action_pk = $2",
                    &[&subject_pk, &action_pk],
                )
                .await
                .map_err(query_err(EntityKind::Aggregate))?;
                delete_expression(&txn, subject_pk, action_pk).await?;
            }
        }

        txn.commit().await.map_err(txn_err)
    }
}

async fn delete_expression(
    txn: &deadpool_postgres::Transaction<'_>,
    subject_pk: SubjectPk,
    action_pk: ActionPk,
) -> WarrantResult<()> {
    txn.execute(
        "DELETE FROM warrant_subject_action_expression WHERE subject_pk = $1 AND action_pk = $2",
        &[&subject_pk, &action_pk],
    )
    .await
    .map_err(query_err(EntityKind::Expression))?;
    Ok(())
}

// ============================================================================
// LOCK BACKEND
// ============================================================================

#[async_trait]
impl LockBackend for PgStore {
    async fn try_acquire(&self, key: &LockKey, ttl: Duration) -> WarrantResult<Option<LockData>> {
        let lock_err = |e: &dyn Display| -> WarrantError {
            LockError::Backend {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()
        };
        let conn = self.pool.get().await.map_err(|e| lock_err(&e))?;
        let data = LockData::new(key.as_str(), Utc::now(), ttl);

        // Only an expired holder row may be overwritten.
        let written = conn
            .execute(
                "INSERT INTO warrant_lock (key, token, acquired_at, expires_at) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (key) DO UPDATE \
                 SET token = EXCLUDED.token, acquired_at = EXCLUDED.acquired_at, \
                     expires_at = EXCLUDED.expires_at \
                 WHERE warrant_lock.expires_at <= EXCLUDED.acquired_at",
                &[&data.key, &data.token, &data.acquired_at, &data.expires_at],
            )
            .await
            .map_err(|e| lock_err(&e))?;

        Ok((written == 1).then_some(data))
    }

    async fn release(&self, lock: &LockData) -> WarrantResult<bool> {
        let lock_err = |e: &dyn Display| -> WarrantError {
            LockError::Backend {
                key: lock.key.clone(),
                reason: e.to_string(),
            }
            .into()
        };
        let conn = self.pool.get().await.map_err(|e| lock_err(&e))?;
        let deleted = conn
            .execute(
                "DELETE FROM warrant_lock WHERE key = $1 AND token = $2",
                &[&lock.key, &lock.token],
            )
            .await
            .map_err(|e| lock_err(&e))?;
        Ok(deleted == 1)
    }
}

// ============================================================================
// QUEUE
// ============================================================================

/// Table-backed work queue.
///
/// `receive` claims the oldest visible row with `FOR UPDATE SKIP LOCKED`
/// and pushes its visibility forward; a consumer that dies without acking
/// lets the row reappear once the visibility timeout passes.
#[derive(Clone)]
pub struct PgQueue {
    pool: Pool,
    visibility: Duration,
}

impl PgQueue {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            visibility: Duration::from_secs(DEFAULT_QUEUE_VISIBILITY_SECS),
        }
    }

    pub fn with_visibility(mut self, visibility: Duration) -> Self {
        self.visibility = visibility;
        self
    }

    async fn conn(&self) -> WarrantResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(pool_err)
    }
}

#[async_trait]
impl WorkQueue for PgQueue {
    async fn publish(&self, tokens: &[String]) -> WarrantResult<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO warrant_queue (token) SELECT unnest($1::text[])",
            &[&tokens],
        )
        .await
        .map_err(|e| QueueError::PublishFailed {
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn receive(&self) -> WarrantResult<Option<Delivery>> {
        let conn = self.conn().await?;
        let visibility = self.visibility.as_secs_f64();
        let row = conn
            .query_opt(
                "UPDATE warrant_queue \
                 SET visible_at = now() + make_interval(secs => $1), \
                     delivery_count = delivery_count + 1 \
                 WHERE id = ( \
                     SELECT id FROM warrant_queue WHERE visible_at <= now() \
                     ORDER BY id FOR UPDATE SKIP LOCKED LIMIT 1) \
                 RETURNING id, token, delivery_count",
                &[&visibility],
            )
            .await
            .map_err(|e| QueueError::ReceiveFailed {
                reason: e.to_string(),
            })?;

        Ok(row.map(|r| {
            let delivery_count: i32 = r.get("delivery_count");
            Delivery {
                id: r.get("id"),
                token: r.get("token"),
                attempt: delivery_count.max(0) as u32,
            }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> WarrantResult<()> {
        let conn = self.conn().await?;
        conn.execute("DELETE FROM warrant_queue WHERE id = $1", &[&delivery.id])
            .await
            .map_err(|e| QueueError::AckFailed {
                delivery_id: delivery.id,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> WarrantResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE warrant_queue SET visible_at = now() WHERE id = $1",
            &[&delivery.id],
        )
        .await
        .map_err(|e| QueueError::AckFailed {
            delivery_id: delivery.id,
            reason: e.to_string(),
        })?;
        Ok(())
    }
}
