//! SQLite-backed local store.
//!
//! Holds every entity table plus the queue, id map and dead-letter tables.
//! All writers (collaborators recording mutations and the sync engine
//! applying results) go through the same [`LocalStore`], which serialises
//! them with an async write lock so multi-statement transactions from the two
//! paths never interleave.

mod entities;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::Sqlite;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::StorageError;
use crate::models::{Entity, EntityKind};

pub(crate) use entities::{mark_synced, rewrite_references, soft_delete, upsert};

/// An entity row together with its sync flags.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub entity: Entity,
    pub synced: bool,
    pub deleted: bool,
}

/// Row selection for [`LocalStore::query`].
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub kind: Option<EntityKind>,
    pub include_deleted: bool,
    pub only_pending: bool,
}

impl EntityFilter {
    pub fn kind(kind: EntityKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn pending(mut self) -> Self {
        self.only_pending = true;
        self
    }
}

/// A positional parameter for [`LocalStore::read`] and [`LocalStore::write`].
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Integer(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Real(value)
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [SqlParam],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlParam::Null => query.bind(None::<String>),
            SqlParam::Integer(v) => query.bind(*v),
            SqlParam::Real(v) => query.bind(*v),
            SqlParam::Text(v) => query.bind(v.as_str()),
        };
    }
    query
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl LocalStore {
    /// Open (creating if missing) the database at `path` and initialise the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Io(parent.to_path_buf(), e))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        store.init().await?;

        tracing::debug!("Opened local store at {}", path.display());
        Ok(store)
    }

    /// Create the schema if absent. Safe to call any number of times.
    pub async fn init(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Serialise a write against every other writer of this store.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Insert or replace an entity row. The row becomes pending (`synced = 0`).
    ///
    /// This does not queue anything; collaborators normally go through
    /// [`OperationQueue::record`](crate::queue::OperationQueue::record).
    pub async fn upsert(&self, entity: &Entity) -> Result<(), StorageError> {
        let _guard = self.lock().await;
        let mut conn = self.pool.acquire().await?;
        upsert(&mut conn, entity).await?;
        Ok(())
    }

    /// Mark a row deleted. Returns false when the row does not exist.
    pub async fn soft_delete(&self, kind: EntityKind, id: &str) -> Result<bool, StorageError> {
        let _guard = self.lock().await;
        let mut conn = self.pool.acquire().await?;
        Ok(soft_delete(&mut conn, kind, id).await?)
    }

    /// Hide a row the server will never accept. Unlike [`soft_delete`](Self::soft_delete)
    /// it leaves nothing pending.
    pub async fn discard(&self, kind: EntityKind, id: &str) -> Result<bool, StorageError> {
        let sql = format!(
            "UPDATE {} SET deleted = 1, synced = 1 WHERE id = ?",
            kind.table()
        );
        Ok(self.write(&sql, &[SqlParam::from(id)]).await? > 0)
    }

    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<StoredEntity>, StorageError> {
        let sql = format!("SELECT * FROM {} WHERE id = ?", kind.table());
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(entities::decode(kind, &row)?)),
            None => Ok(None),
        }
    }

    /// Rows matching `filter`, ordered by kind then `updated_at`.
    pub async fn query(&self, filter: &EntityFilter) -> Result<Vec<StoredEntity>, StorageError> {
        let kinds: Vec<EntityKind> = match filter.kind {
            Some(kind) => vec![kind],
            None => EntityKind::ALL.to_vec(),
        };

        let mut conditions = Vec::new();
        if !filter.include_deleted {
            conditions.push("deleted = 0");
        }
        if filter.only_pending {
            conditions.push("synced = 0");
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let mut results = Vec::new();
        for kind in kinds {
            let sql = format!(
                "SELECT * FROM {}{} ORDER BY updated_at, id",
                kind.table(),
                where_clause
            );
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
            for row in rows {
                results.push(entities::decode(kind, &row)?);
            }
        }
        Ok(results)
    }

    /// Every row not yet confirmed by the server, soft-deleted ones included.
    pub async fn query_pending(&self) -> Result<Vec<StoredEntity>, StorageError> {
        self.query(&EntityFilter::default().include_deleted().pending())
            .await
    }

    /// Run a raw read query.
    pub async fn read(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<SqliteRow>, StorageError> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Run a raw write statement, returning the number of changed rows.
    pub async fn write(&self, sql: &str, params: &[SqlParam]) -> Result<u64, StorageError> {
        let _guard = self.lock().await;
        let result = bind_params(sqlx::query(sql), params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::LocalStore;
    use tempfile::TempDir;

    /// A store on a fresh temporary database. Keep the `TempDir` alive.
    pub async fn temp_store() -> (LocalStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::open(temp_dir.path().join("test.db"))
            .await
            .unwrap();
        (store, temp_dir)
    }
}
