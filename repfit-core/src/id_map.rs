//! Temporary-to-server id translation.
//!
//! When the server confirms a create, [`IdMapper::complete_create`] records the
//! mapping and rewrites every occurrence of the temporary id (entity rows,
//! reference columns and queued payloads) in one transaction, so no reader
//! ever sees a half-migrated store.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::StorageError;
use crate::id::is_temporary;
use crate::models::EntityKind;
use crate::queue::{timestamp, Operation, QueueRow, QueuedOperation};
use crate::store::{self, LocalStore};

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct IdMapping {
    pub local_id: String,
    pub server_id: String,
    pub entity_type: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of resolving an operation's dependencies.
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    /// Every id is known to the server; send this translated operation.
    Ready(Operation),
    /// This temporary id has no server counterpart yet.
    Blocked(String),
}

/// What [`IdMapper::complete_create`] changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Remap {
    pub server_id: String,
    pub rows_rewritten: u64,
    pub operations_rewritten: u64,
}

async fn lookup_in(conn: &mut SqliteConnection, local_id: &str) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT server_id FROM id_mappings WHERE local_id = ?")
        .bind(local_id)
        .fetch_optional(&mut *conn)
        .await
}

/// Insert a mapping unless one exists. Returns the server id now in effect;
/// the first mapping recorded for a local id wins.
async fn record_in(
    conn: &mut SqliteConnection,
    local_id: &str,
    server_id: &str,
    kind: EntityKind,
) -> Result<String, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO id_mappings (local_id, server_id, entity_type, created_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(local_id) DO NOTHING
        "#,
    )
    .bind(local_id)
    .bind(server_id)
    .bind(kind.as_str())
    .bind(timestamp(Utc::now()))
    .execute(&mut *conn)
    .await?;

    let effective = lookup_in(conn, local_id).await?;
    Ok(effective.unwrap_or_else(|| server_id.to_string()))
}

/// Replace every mapped temporary id in `operation`.
///
/// A create whose own id is already mapped has reached the server before,
/// so it is turned into an update of the server entity.
pub(crate) async fn translate(
    conn: &mut SqliteConnection,
    mut operation: Operation,
) -> Result<Operation, sqlx::Error> {
    let temporary: Vec<String> = operation
        .ids()
        .into_iter()
        .filter(|id| is_temporary(id))
        .map(str::to_string)
        .collect();

    let own_id = operation.entity_id().to_string();
    let mut own_mapped = false;

    for id in temporary {
        if let Some(server_id) = lookup_in(conn, &id).await? {
            operation.rewrite_id(&id, &server_id);
            own_mapped |= id == own_id;
        }
    }

    if own_mapped {
        if let Operation::Create { entity } = operation {
            return Ok(Operation::Update { entity });
        }
    }
    Ok(operation)
}

#[derive(Debug, Clone)]
pub struct IdMapper {
    store: LocalStore,
}

impl IdMapper {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub async fn lookup(&self, local_id: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.store.pool().acquire().await?;
        Ok(lookup_in(&mut conn, local_id).await?)
    }

    /// The id to use remotely: server ids pass through, temporary ids map or yield `None`.
    pub async fn resolve(&self, id: &str) -> Result<Option<String>, StorageError> {
        if !is_temporary(id) {
            return Ok(Some(id.to_string()));
        }
        self.lookup(id).await
    }

    /// Record a mapping without touching any other table.
    pub async fn record(
        &self,
        local_id: &str,
        server_id: &str,
        kind: EntityKind,
    ) -> Result<String, StorageError> {
        let _guard = self.store.lock().await;
        let mut conn = self.store.pool().acquire().await?;
        Ok(record_in(&mut conn, local_id, server_id, kind).await?)
    }

    pub async fn mappings(&self) -> Result<Vec<IdMapping>, StorageError> {
        let mappings = sqlx::query_as("SELECT * FROM id_mappings ORDER BY created_at, local_id")
            .fetch_all(self.store.pool())
            .await?;
        Ok(mappings)
    }

    /// Translate an operation for sending, or report the dependency blocking it.
    pub async fn prepare(&self, operation: &Operation) -> Result<Prepared, StorageError> {
        let mut prepared = operation.clone();
        for dependency in operation.dependencies() {
            match self.resolve(dependency).await? {
                Some(server_id) => {
                    if server_id != dependency {
                        prepared.rewrite_id(dependency, &server_id);
                    }
                }
                None => return Ok(Prepared::Blocked(dependency.to_string())),
            }
        }
        Ok(Prepared::Ready(prepared))
    }

    /// Apply a confirmed create: drop its queue row, record the mapping and
    /// rewrite the temporary id everywhere it appears.
    pub async fn complete_create(
        &self,
        op: &QueuedOperation,
        server_id: &str,
    ) -> Result<Remap, StorageError> {
        let local_id = op.entity_id.as_str();

        let _guard = self.store.lock().await;
        let mut tx = self.store.pool().begin().await?;

        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(op.id)
            .execute(&mut *tx)
            .await?;

        if !is_temporary(local_id) {
            store::mark_synced(&mut tx, op.entity_type, local_id).await?;
            tx.commit().await?;
            return Ok(Remap {
                server_id: local_id.to_string(),
                rows_rewritten: 0,
                operations_rewritten: 0,
            });
        }

        let server_id = record_in(&mut tx, local_id, server_id, op.entity_type).await?;

        let rows_rewritten = store::rewrite_references(&mut tx, local_id, &server_id).await?;

        let rows: Vec<QueueRow> = sqlx::query_as(
            "SELECT * FROM sync_queue WHERE entity_id = ?1 OR instr(payload, ?1) > 0",
        )
        .bind(local_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut operations_rewritten = 0;
        for row in rows {
            let mut queued = match row.parse() {
                Ok(queued) => queued,
                Err(e) => {
                    tracing::warn!("Skipping undecodable queue row during remap: {}", e);
                    continue;
                }
            };
            if !queued.operation.rewrite_id(local_id, &server_id) {
                continue;
            }

            sqlx::query("UPDATE sync_queue SET entity_id = ?, payload = ? WHERE id = ?")
                .bind(queued.operation.entity_id())
                .bind(serde_json::to_string(&queued.operation)?)
                .bind(queued.id)
                .execute(&mut *tx)
                .await?;
            operations_rewritten += 1;
        }

        store::mark_synced(&mut tx, op.entity_type, &server_id).await?;
        tx.commit().await?;

        tracing::info!(
            "Mapped {} {} -> {} ({} rows, {} queued ops rewritten)",
            op.entity_type,
            local_id,
            server_id,
            rows_rewritten,
            operations_rewritten
        );

        Ok(Remap {
            server_id,
            rows_rewritten,
            operations_rewritten,
        })
    }
}
