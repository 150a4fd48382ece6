//! Durable FIFO log of pending mutations.
//!
//! Every mutation a collaborator makes is written to its entity table and
//! appended here in the same transaction ([`OperationQueue::record`]). Only the
//! sync engine removes rows: after the server confirms them, or by evicting
//! them to the dead-letter table once they can never succeed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use crate::error::StorageError;
use crate::id_map;
use crate::models::{Entity, EntityKind};
use crate::remote::Method;
use crate::store::{self, LocalStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    /// HTTP verb used to apply this kind of operation remotely.
    pub fn method(&self) -> Method {
        match self {
            OperationKind::Create => Method::Post,
            OperationKind::Update => Method::Put,
            OperationKind::Delete => Method::Delete,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            _ => Err(format!("Unknown operation '{}'", s)),
        }
    }
}

/// A mutation of one entity, carrying its typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Create { entity: Entity },
    Update { entity: Entity },
    Delete { kind: EntityKind, id: String },
}

impl Operation {
    pub fn create(entity: impl Into<Entity>) -> Self {
        Operation::Create {
            entity: entity.into(),
        }
    }

    pub fn update(entity: impl Into<Entity>) -> Self {
        Operation::Update {
            entity: entity.into(),
        }
    }

    pub fn delete(kind: EntityKind, id: impl Into<String>) -> Self {
        Operation::Delete {
            kind,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Create { .. } => OperationKind::Create,
            Operation::Update { .. } => OperationKind::Update,
            Operation::Delete { .. } => OperationKind::Delete,
        }
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            Operation::Create { entity } | Operation::Update { entity } => entity.kind(),
            Operation::Delete { kind, .. } => *kind,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            Operation::Create { entity } | Operation::Update { entity } => entity.id(),
            Operation::Delete { id, .. } => id,
        }
    }

    /// The entity's own id followed by every id it references.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids = vec![self.entity_id()];
        if let Operation::Create { entity } | Operation::Update { entity } = self {
            ids.extend(entity.references());
        }
        ids
    }

    /// Ids that must already exist on the server before this can be sent.
    ///
    /// A create introduces its own id, so only its references count.
    pub fn dependencies(&self) -> Vec<&str> {
        match self {
            Operation::Create { entity } => entity.references(),
            Operation::Update { .. } | Operation::Delete { .. } => self.ids(),
        }
    }

    /// Replace `old` with `new` wherever it appears. Returns true on change.
    pub fn rewrite_id(&mut self, old: &str, new: &str) -> bool {
        match self {
            Operation::Create { entity } | Operation::Update { entity } => {
                entity.rewrite_id(old, new)
            }
            Operation::Delete { id, .. } => {
                if id == old {
                    *id = new.to_string();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Remote path: the collection for creates, the item otherwise.
    pub fn endpoint(&self) -> String {
        let collection = self.entity_kind().collection();
        match self {
            Operation::Create { .. } => format!("/{}", collection),
            Operation::Update { .. } | Operation::Delete { .. } => {
                format!("/{}/{}", collection, self.entity_id())
            }
        }
    }

    /// Request body. Creates omit the id, the server assigns one.
    pub fn body(&self) -> Option<serde_json::Value> {
        match self {
            Operation::Create { entity } => {
                let mut body = entity.to_body();
                if let Some(fields) = body.as_object_mut() {
                    fields.remove("id");
                }
                Some(body)
            }
            Operation::Update { entity } => Some(entity.to_body()),
            Operation::Delete { .. } => None,
        }
    }
}

/// A persisted queue row.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    pub id: i64,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub kind: OperationKind,
    pub operation: Operation,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl QueuedOperation {
    /// Short human description, e.g. `create routine local_…`.
    pub fn describe(&self) -> String {
        format!("{} {} {}", self.kind, self.entity_type, self.entity_id)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct QueueRow {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

impl QueueRow {
    pub(crate) fn parse(&self) -> Result<QueuedOperation, StorageError> {
        let corrupt = |reason: String| StorageError::CorruptRow {
            id: self.id,
            reason,
        };

        let entity_type: EntityKind = self.entity_type.parse().map_err(corrupt)?;
        let kind: OperationKind = self.operation.parse().map_err(corrupt)?;
        let operation: Operation =
            serde_json::from_str(&self.payload).map_err(|e| corrupt(e.to_string()))?;

        if operation.kind() != kind
            || operation.entity_kind() != entity_type
            || operation.entity_id() != self.entity_id
        {
            return Err(corrupt("payload does not match row columns".to_string()));
        }

        Ok(QueuedOperation {
            id: self.id,
            entity_type,
            entity_id: self.entity_id.clone(),
            kind,
            operation,
            created_at: self.created_at,
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            last_error: self.last_error.clone(),
        })
    }
}

/// An operation removed from the queue without being applied.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DeadLetter {
    pub id: i64,
    pub op_id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: String,
    pub attempts: i64,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn describe(&self) -> String {
        format!(
            "{} {} {}: {}",
            self.operation, self.entity_type, self.entity_id, self.reason
        )
    }
}

/// Fixed-width timestamp so that lexical order is chronological order.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

async fn insert(
    conn: &mut SqliteConnection,
    operation: &Operation,
    created_at: DateTime<Utc>,
) -> Result<i64, StorageError> {
    let payload = serde_json::to_string(operation)?;

    let result = sqlx::query(
        r#"
        INSERT INTO sync_queue (entity_type, entity_id, operation, payload, created_at, attempts)
        VALUES (?, ?, ?, ?, ?, 0)
        "#,
    )
    .bind(operation.entity_kind().as_str())
    .bind(operation.entity_id())
    .bind(operation.kind().as_str())
    .bind(&payload)
    .bind(timestamp(created_at))
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Move a queue row into `dead_letters`. Returns the new dead letter, if the row existed.
async fn move_to_dead_letters(
    conn: &mut SqliteConnection,
    op_id: i64,
    reason: &str,
) -> Result<Option<DeadLetter>, StorageError> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO dead_letters (op_id, entity_type, entity_id, operation, payload, attempts, reason, failed_at)
        SELECT id, entity_type, entity_id, operation, payload, attempts, ?, ?
        FROM sync_queue WHERE id = ?
        "#,
    )
    .bind(reason)
    .bind(timestamp(Utc::now()))
    .bind(op_id)
    .execute(&mut *conn)
    .await?;

    if inserted.rows_affected() == 0 {
        return Ok(None);
    }

    sqlx::query("DELETE FROM sync_queue WHERE id = ?")
        .bind(op_id)
        .execute(&mut *conn)
        .await?;

    let letter: DeadLetter = sqlx::query_as("SELECT * FROM dead_letters WHERE id = ?")
        .bind(inserted.last_insert_rowid())
        .fetch_one(&mut *conn)
        .await?;
    Ok(Some(letter))
}

/// One FIFO slice of the queue.
#[derive(Debug, Default)]
pub struct Batch {
    pub operations: Vec<QueuedOperation>,
    /// Rows that could not be decoded and went straight to the dead-letter table.
    pub quarantined: Vec<DeadLetter>,
}

#[derive(Debug, Clone)]
pub struct OperationQueue {
    store: LocalStore,
}

impl OperationQueue {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Append an operation without touching the entity tables.
    pub async fn enqueue(&self, operation: &Operation) -> Result<i64, StorageError> {
        let _guard = self.store.lock().await;
        let mut conn = self.store.pool().acquire().await?;
        let op_id = insert(&mut conn, operation, Utc::now()).await?;

        tracing::debug!(
            "Queued {} {} {} as #{}",
            operation.kind(),
            operation.entity_kind(),
            operation.entity_id(),
            op_id
        );
        Ok(op_id)
    }

    /// Apply a mutation to the local tables and queue it, atomically.
    ///
    /// Temporary ids that already have a server mapping are translated first;
    /// a create of an entity the server already knows becomes an update.
    pub async fn record(&self, operation: Operation) -> Result<QueuedOperation, StorageError> {
        let _guard = self.store.lock().await;
        let mut tx = self.store.pool().begin().await?;

        let operation = id_map::translate(&mut tx, operation).await?;
        match &operation {
            Operation::Create { entity } | Operation::Update { entity } => {
                store::upsert(&mut tx, entity).await?;
            }
            Operation::Delete { kind, id } => {
                if !store::soft_delete(&mut tx, *kind, id).await? {
                    tracing::debug!("Queueing delete of {} {} with no local row", kind, id);
                }
            }
        }

        let created_at = Utc::now();
        let op_id = insert(&mut tx, &operation, created_at).await?;
        tx.commit().await?;

        tracing::debug!(
            "Recorded {} {} {} as #{}",
            operation.kind(),
            operation.entity_kind(),
            operation.entity_id(),
            op_id
        );

        Ok(QueuedOperation {
            id: op_id,
            entity_type: operation.entity_kind(),
            entity_id: operation.entity_id().to_string(),
            kind: operation.kind(),
            operation,
            created_at,
            attempts: 0,
            last_error: None,
        })
    }

    /// Up to `limit` operations, oldest first.
    ///
    /// Rows that can no longer be decoded are moved to the dead-letter table
    /// instead of blocking the queue.
    pub async fn dequeue_batch(&self, limit: u32) -> Result<Vec<QueuedOperation>, StorageError> {
        Ok(self.take_batch(limit).await?.operations)
    }

    /// Like [`dequeue_batch`](Self::dequeue_batch), also returning the rows
    /// quarantined along the way.
    pub async fn take_batch(&self, limit: u32) -> Result<Batch, StorageError> {
        let rows: Vec<QueueRow> =
            sqlx::query_as("SELECT * FROM sync_queue ORDER BY created_at, id LIMIT ?")
                .bind(i64::from(limit))
                .fetch_all(self.store.pool())
                .await?;

        let mut batch = Batch::default();
        for row in rows {
            match row.parse() {
                Ok(op) => batch.operations.push(op),
                Err(e) => {
                    tracing::error!("Quarantining undecodable queue row: {}", e);
                    if let Some(letter) = self.evict(row.id, &e.to_string()).await? {
                        batch.quarantined.push(letter);
                    }
                }
            }
        }
        Ok(batch)
    }

    /// Whether a create for `entity_id` is still waiting to be sent.
    pub async fn has_pending_create(&self, entity_id: &str) -> Result<bool, StorageError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sync_queue WHERE entity_id = ? AND operation = ?)",
        )
        .bind(entity_id)
        .bind(OperationKind::Create.as_str())
        .fetch_one(self.store.pool())
        .await?;
        Ok(exists)
    }

    /// Every queued operation, oldest first.
    pub async fn list(&self) -> Result<Vec<QueuedOperation>, StorageError> {
        let rows: Vec<QueueRow> =
            sqlx::query_as("SELECT * FROM sync_queue ORDER BY created_at, id")
                .fetch_all(self.store.pool())
                .await?;
        rows.iter().map(QueueRow::parse).collect()
    }

    /// Physically remove an operation. Returns false if it was already gone.
    pub async fn remove(&self, op_id: i64) -> Result<bool, StorageError> {
        let _guard = self.store.lock().await;
        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(op_id)
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove a confirmed operation and flag its entity synced if nothing else is pending for it.
    pub async fn complete(
        &self,
        op_id: i64,
        kind: EntityKind,
        entity_id: &str,
    ) -> Result<(), StorageError> {
        let _guard = self.store.lock().await;
        let mut tx = self.store.pool().begin().await?;

        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(op_id)
            .execute(&mut *tx)
            .await?;
        store::mark_synced(&mut tx, kind, entity_id).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Count a failed attempt. Returns the new attempt count, or `None` if the row is gone.
    pub async fn increment_attempts(
        &self,
        op_id: i64,
        error: &str,
    ) -> Result<Option<u32>, StorageError> {
        let _guard = self.store.lock().await;
        let attempts: Option<i64> = sqlx::query_scalar(
            "UPDATE sync_queue SET attempts = attempts + 1, last_error = ? WHERE id = ? RETURNING attempts",
        )
        .bind(error)
        .bind(op_id)
        .fetch_optional(self.store.pool())
        .await?;

        Ok(attempts.map(|a| u32::try_from(a).unwrap_or(u32::MAX)))
    }

    /// Move an operation to the dead-letter table.
    pub async fn evict(&self, op_id: i64, reason: &str) -> Result<Option<DeadLetter>, StorageError> {
        let _guard = self.store.lock().await;
        let mut tx = self.store.pool().begin().await?;
        let letter = move_to_dead_letters(&mut tx, op_id, reason).await?;
        tx.commit().await?;
        Ok(letter)
    }

    /// Queued operations that mention `entity_id`, as their target or as a reference.
    pub async fn referencing(&self, entity_id: &str) -> Result<Vec<QueuedOperation>, StorageError> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            "SELECT * FROM sync_queue WHERE entity_id = ?1 OR instr(payload, ?1) > 0 ORDER BY created_at, id",
        )
        .bind(entity_id)
        .fetch_all(self.store.pool())
        .await?;

        let mut operations = Vec::new();
        for row in rows {
            let op = row.parse()?;
            if op.operation.ids().contains(&entity_id) {
                operations.push(op);
            }
        }
        Ok(operations)
    }

    pub async fn len(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue")
            .fetch_one(self.store.pool())
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len().await? == 0)
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError> {
        let letters = sqlx::query_as("SELECT * FROM dead_letters ORDER BY id")
            .fetch_all(self.store.pool())
            .await?;
        Ok(letters)
    }

    pub async fn clear_dead_letters(&self) -> Result<u64, StorageError> {
        let _guard = self.store.lock().await;
        let result = sqlx::query("DELETE FROM dead_letters")
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
