//! The sync engine: drains the operation queue against the remote API.
//!
//! A drain takes a bounded FIFO batch and applies it one operation at a time.
//! Operations whose dependencies have not reached the server yet are deferred,
//! failures are retried on later drains until the retry ceiling, and permanent
//! failures are moved to the dead-letter table. Only one drain runs at a time;
//! every trigger (timer, network edge, explicit call) goes through
//! [`SyncEngine::drain`].

mod status;

pub use status::{SyncFailure, SyncStatus, DEFAULT_RECENT_ERRORS};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{RemoteError, StorageError};
use crate::id::is_temporary;
use crate::id_map::{IdMapper, Prepared};
use crate::models::EntityKind;
use crate::network::NetworkMonitor;
use crate::queue::{OperationKind, OperationQueue, QueuedOperation};
use crate::remote::RemoteClient;
use crate::store::LocalStore;
use status::StatusBoard;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Sync engine is already started")]
    AlreadyStarted,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Attempts after which an operation is evicted.
    pub max_retries: u32,
    /// Operations fetched per drain.
    pub batch_size: u32,
    pub recent_errors_limit: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            batch_size: 50,
            recent_errors_limit: DEFAULT_RECENT_ERRORS,
        }
    }
}

/// Counts from one drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub success: u32,
    pub failed: u32,
    pub deferred: u32,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Holds the single-flight flag for as long as it lives.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Background {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// What the server accepted for an operation whose local bookkeeping is not
/// done yet.
#[derive(Debug, Clone, PartialEq)]
enum Confirmed {
    Created(String),
    Applied(EntityKind, String),
}

/// How one operation ended in a drain.
enum Outcome {
    Synced,
    Deferred,
    /// Number of operations that failed, cascaded evictions included.
    Failed(u32),
}

struct Inner<R, N> {
    queue: OperationQueue,
    mapper: IdMapper,
    remote: R,
    network: N,
    settings: SyncSettings,
    running: AtomicBool,
    status: StatusBoard,
    /// Operations the server confirmed but whose local write failed, by queue
    /// row id. Settled on the next drain without sending them again.
    unsettled: Mutex<HashMap<i64, Confirmed>>,
}

pub struct SyncEngine<R, N> {
    inner: Arc<Inner<R, N>>,
    background: Mutex<Option<Background>>,
}

impl<R: RemoteClient, N: NetworkMonitor> SyncEngine<R, N> {
    pub fn new(store: LocalStore, remote: R, network: N, settings: SyncSettings) -> Self {
        let inner = Inner {
            queue: OperationQueue::new(store.clone()),
            mapper: IdMapper::new(store),
            remote,
            network,
            settings,
            running: AtomicBool::new(false),
            status: StatusBoard::new(settings.recent_errors_limit),
            unsettled: Mutex::new(HashMap::new()),
        };
        Self {
            inner: Arc::new(inner),
            background: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.inner.queue
    }

    pub fn mapper(&self) -> &IdMapper {
        &self.inner.mapper
    }

    pub fn network(&self) -> &N {
        &self.inner.network
    }

    /// Run one drain now. A no-op while offline or while another drain runs.
    pub async fn drain(&self) -> DrainReport {
        self.inner.drain().await
    }

    /// Drain every `period` and on every transition to online, until [`stop`](Self::stop).
    pub fn start(&self, period: Duration) -> Result<(), EngineError> {
        let mut background = self
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if background.is_some() {
            return Err(EngineError::AlreadyStarted);
        }

        let (shutdown, _) = watch::channel(false);

        let timer = {
            let inner = self.inner.clone();
            let mut stop = shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = stop.changed() => break,
                    }
                    inner.drain().await;
                }
            })
        };

        let listener = {
            let inner = self.inner.clone();
            let mut stop = shutdown.subscribe();
            let mut subscription = self.inner.network.subscribe();
            let mut was_online = subscription.current().is_online();
            tokio::spawn(async move {
                loop {
                    let snapshot = tokio::select! {
                        changed = subscription.changed() => match changed {
                            Some(snapshot) => snapshot,
                            None => break,
                        },
                        _ = stop.changed() => break,
                    };
                    let online = snapshot.is_online();
                    if online && !was_online {
                        tracing::info!("Back online, draining queue");
                        inner.drain().await;
                    }
                    was_online = online;
                }
            })
        };

        tracing::info!("Sync engine started (period {:?})", period);
        *background = Some(Background {
            shutdown,
            tasks: vec![timer, listener],
        });
        Ok(())
    }

    /// Stop the timer and network listener. A drain already in flight completes first.
    pub async fn stop(&self) {
        let background = self
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(background) = background {
            let _ = background.shutdown.send(true);
            for task in background.tasks {
                if let Err(e) = task.await {
                    tracing::warn!("Sync task ended abnormally: {}", e);
                }
            }
            tracing::info!("Sync engine stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.background
            .lock()
            .map(|b| b.is_some())
            .unwrap_or(false)
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Re-read the pending count from the queue.
    pub async fn refresh_status(&self) -> Result<SyncStatus, EngineError> {
        let pending = self.inner.queue.len().await?;
        self.inner.status.set_pending(pending);
        Ok(self.status())
    }
}

impl<R, N> Drop for SyncEngine<R, N> {
    fn drop(&mut self) {
        let background = self
            .background
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(background) = background.take() {
            let _ = background.shutdown.send(true);
        }
    }
}

/// The server id in a create response: `id` as a string or a number.
fn server_id(response: &Value) -> Option<String> {
    let id = match response.get("id")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!id.is_empty() && !is_temporary(&id)).then_some(id)
}

impl<R: RemoteClient, N: NetworkMonitor> Inner<R, N> {
    async fn drain(&self) -> DrainReport {
        if !self.network.is_online() {
            tracing::debug!("Offline, skipping drain");
            return DrainReport::default();
        }
        let Some(_guard) = DrainGuard::acquire(&self.running) else {
            tracing::debug!("Drain already running");
            return DrainReport::default();
        };

        self.status.set_syncing(true);
        let report = match self.drain_batch().await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Drain aborted: {}", e);
                self.status.push_error(SyncFailure::other(format!("Drain aborted: {}", e)));
                DrainReport::default()
            }
        };

        let pending = match self.queue.len().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!("Could not count pending operations: {}", e);
                self.status.current().pending_count
            }
        };
        self.status.finish(pending, Utc::now());

        if !report.is_empty() {
            tracing::info!(
                "Drain finished: {} synced, {} failed, {} deferred, {} pending",
                report.success,
                report.failed,
                report.deferred,
                pending
            );
        }
        report
    }

    async fn drain_batch(&self) -> Result<DrainReport, StorageError> {
        let batch = self.queue.take_batch(self.settings.batch_size).await?;
        let mut report = DrainReport::default();

        for letter in &batch.quarantined {
            self.status.push_error(SyncFailure::evicted(letter));
            report.failed += 1;
        }

        // Entities with an earlier operation still queued in this pass
        let mut blocked: HashSet<String> = HashSet::new();
        let mut evicted: HashSet<i64> = HashSet::new();

        for op in batch.operations {
            if evicted.contains(&op.id) {
                continue;
            }

            match self.apply(&op, &blocked, &mut evicted).await {
                Ok(Outcome::Synced) => report.success += 1,
                Ok(Outcome::Deferred) => {
                    report.deferred += 1;
                    blocked.insert(op.entity_id.clone());
                }
                Ok(Outcome::Failed(count)) => {
                    report.failed += count;
                    blocked.insert(op.entity_id.clone());
                }
                Err(e) => {
                    tracing::error!("Storage error while syncing {}: {}", op.describe(), e);
                    self.status.push_error(SyncFailure::operation(
                        op.id,
                        format!("{}: {}", op.describe(), e),
                    ));
                    report.failed += 1;
                    blocked.insert(op.entity_id.clone());
                }
            }
        }

        Ok(report)
    }

    /// Send one operation and record the result locally.
    async fn apply(
        &self,
        op: &QueuedOperation,
        blocked: &HashSet<String>,
        evicted: &mut HashSet<i64>,
    ) -> Result<Outcome, StorageError> {
        if let Some(confirmed) = self.take_unsettled(op.id) {
            tracing::debug!("Settling {} confirmed earlier", op.describe());
            return self.settle(op, confirmed).await;
        }

        if op.operation.ids().iter().any(|id| blocked.contains(*id)) {
            tracing::debug!("Deferring {}: earlier operation still pending", op.describe());
            return Ok(Outcome::Deferred);
        }

        let prepared = match self.mapper.prepare(&op.operation).await? {
            Prepared::Ready(prepared) => prepared,
            Prepared::Blocked(dependency) => {
                if self.queue.has_pending_create(&dependency).await? {
                    tracing::debug!("Deferring {}: waiting for {}", op.describe(), dependency);
                    return Ok(Outcome::Deferred);
                }
                let reason = format!("depends on {} which will never be created", dependency);
                return Ok(Outcome::Failed(self.evict(op, reason, evicted).await?));
            }
        };

        let body = prepared.body();
        let response = self
            .remote
            .send(&prepared.endpoint(), prepared.kind().method(), body.as_ref())
            .await;

        let confirmed = match (prepared.kind(), response) {
            (OperationKind::Create, Ok(response)) => match server_id(&response) {
                Some(id) => Confirmed::Created(id),
                None => {
                    let err = RemoteError::Rejected {
                        status: 200,
                        message: "create response carried no usable id".to_string(),
                    };
                    return Ok(Outcome::Failed(self.fail(op, &err, evicted).await?));
                }
            },
            (_, Ok(_)) => Confirmed::Applied(prepared.entity_kind(), prepared.entity_id().to_string()),
            (_, Err(err)) => return Ok(Outcome::Failed(self.fail(op, &err, evicted).await?)),
        };

        self.settle(op, confirmed).await
    }

    /// Apply a server confirmation locally. On failure the confirmation is
    /// kept so the next drain does not send the operation again.
    async fn settle(&self, op: &QueuedOperation, confirmed: Confirmed) -> Result<Outcome, StorageError> {
        let result = match &confirmed {
            Confirmed::Created(server_id) => {
                self.mapper.complete_create(op, server_id).await.map(|_| ())
            }
            Confirmed::Applied(kind, entity_id) => {
                self.queue.complete(op.id, *kind, entity_id).await
            }
        };

        match result {
            Ok(()) => {
                tracing::debug!("Synced {}", op.describe());
                Ok(Outcome::Synced)
            }
            Err(e) => {
                self.unsettled_map().insert(op.id, confirmed);
                Err(e)
            }
        }
    }

    fn unsettled_map(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Confirmed>> {
        self.unsettled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_unsettled(&self, op_id: i64) -> Option<Confirmed> {
        self.unsettled_map().remove(&op_id)
    }

    /// Record a failed attempt and evict when the operation cannot succeed.
    /// Returns how many operations failed, counting cascaded evictions.
    async fn fail(
        &self,
        op: &QueuedOperation,
        err: &RemoteError,
        evicted: &mut HashSet<i64>,
    ) -> Result<u32, StorageError> {
        let message = err.to_string();
        let attempts = self.queue.increment_attempts(op.id, &message).await?;

        let reason = match attempts {
            None => return Ok(1),
            Some(_) if !err.is_retryable() => message,
            Some(n) if n >= self.settings.max_retries => {
                format!("gave up after {} attempts: {}", n, message)
            }
            Some(n) => {
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}",
                    op.describe(),
                    n,
                    self.settings.max_retries,
                    message
                );
                return Ok(1);
            }
        };

        self.evict(op, reason, evicted).await
    }

    /// Evict `op`, and for a create, everything that depends on the entity it
    /// would have created.
    async fn evict(
        &self,
        op: &QueuedOperation,
        reason: String,
        evicted: &mut HashSet<i64>,
    ) -> Result<u32, StorageError> {
        let mut count = 0;
        let mut work = vec![(op.id, op.kind, op.entity_type, op.entity_id.clone(), reason)];

        while let Some((op_id, kind, entity_type, entity_id, reason)) = work.pop() {
            if !evicted.insert(op_id) {
                continue;
            }
            if let Some(letter) = self.queue.evict(op_id, &reason).await? {
                tracing::error!("Evicted {}", letter.describe());
                self.status.push_error(SyncFailure::evicted(&letter));
                count += 1;
            }

            if kind == OperationKind::Create && is_temporary(&entity_id) {
                // Nothing can be attached to an entity the server will never see
                self.queue.store().discard(entity_type, &entity_id).await?;
                for dependent in self.queue.referencing(&entity_id).await? {
                    let reason = format!("depends on {} which will never be created", entity_id);
                    work.push((
                        dependent.id,
                        dependent.kind,
                        dependent.entity_type,
                        dependent.entity_id,
                        reason,
                    ));
                }
            }
        }

        Ok(count.max(1))
    }
}

#[cfg(test)]
mod tests;
