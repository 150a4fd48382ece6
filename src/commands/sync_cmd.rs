//! Sync CLI commands for draining the local queue to the server.

use clap::{Args, Subcommand};

use repfit_core::{
    DrainReport, EngineError, LocalStore, NetworkMonitor, OperationQueue, RemoteError,
    StorageError, SyncStatus,
};

use crate::config::Config;
use crate::sync::build_engine;

/// Sync with remote server
#[derive(Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Subcommand)]
enum SyncSubcommand {
    /// Send queued changes now (the default)
    Now,

    /// Show sync configuration, queue and server status
    Status,

    /// Keep syncing in the foreground until Ctrl-C
    Watch,

    /// List changes the server will never accept
    Failures {
        /// Forget all recorded failures
        #[arg(long)]
        clear: bool,
    },
}

impl SyncCommand {
    pub async fn run(&self, config: &Config, store: &LocalStore) -> Result<(), SyncCommandError> {
        match &self.command {
            None | Some(SyncSubcommand::Now) => self.sync(config, store).await,
            Some(SyncSubcommand::Status) => self.status(config, store).await,
            Some(SyncSubcommand::Watch) => self.watch(config, store).await,
            Some(SyncSubcommand::Failures { clear }) => self.failures(store, *clear).await,
        }
    }

    async fn sync(&self, config: &Config, store: &LocalStore) -> Result<(), SyncCommandError> {
        let engine = build_engine(&config.sync, store).await?;
        let pending = engine.queue().len().await?;

        if pending == 0 {
            println!("Nothing to sync.");
            return Ok(());
        }
        if !engine.network().is_online() {
            println!("Server unreachable. {} change(s) stay queued.", pending);
            return Ok(());
        }

        println!("Syncing {} queued change(s)...", pending);
        let report = engine.drain().await;
        print_report(&report);

        let status = engine.refresh_status().await?;
        print_errors(&status);
        if status.pending_count > 0 {
            println!("{} change(s) still queued.", status.pending_count);
        }
        Ok(())
    }

    async fn status(&self, config: &Config, store: &LocalStore) -> Result<(), SyncCommandError> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        let queue = OperationQueue::new(store.clone());
        let pending = queue.list().await?;
        let dead_letters = queue.dead_letters().await?;

        println!("Queued changes: {}", pending.len());
        for op in pending.iter().take(10) {
            match &op.last_error {
                Some(error) => println!(
                    "  #{} {} (attempts: {}, last error: {})",
                    op.id,
                    op.describe(),
                    op.attempts,
                    error
                ),
                None => println!("  #{} {}", op.id, op.describe()),
            }
        }
        if pending.len() > 10 {
            println!("  ... and {} more", pending.len() - 10);
        }
        println!("Failed changes: {}", dead_letters.len());
        println!();

        let Some(server_url) = config.sync.server_url.as_ref() else {
            println!("Status: Not configured");
            println!();
            println!("To enable sync, add to your config file:");
            println!();
            println!("  sync:");
            println!("    server_url: \"http://localhost:8080\"");
            println!("    api_key: \"your-api-key\"");
            println!();
            println!("Or set environment variables:");
            println!("  REPFIT_SYNC_URL, REPFIT_SYNC_API_KEY");
            return Ok(());
        };

        println!("Server:    {}", server_url);
        println!(
            "Auto-sync: {}",
            if config.sync.auto_sync {
                "enabled"
            } else {
                "disabled"
            }
        );

        match build_engine(&config.sync, store).await {
            Ok(engine) => {
                let snapshot = engine.network().snapshot();
                if snapshot.is_online() {
                    println!("Server status: ✓ reachable");
                } else if snapshot.connected {
                    println!("Server status: ✗ unhealthy");
                } else {
                    println!("Server status: ✗ unreachable");
                }
            }
            Err(e) => println!("Server status: ✗ {}", e),
        }
        Ok(())
    }

    async fn watch(&self, config: &Config, store: &LocalStore) -> Result<(), SyncCommandError> {
        let engine = build_engine(&config.sync, store).await?;
        let mut status = engine.subscribe_status();
        let mut last_seen = None;

        engine.start(config.sync.period())?;
        println!(
            "Watching for changes every {}s. Press Ctrl-C to stop.",
            config.sync.period().as_secs()
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = status.borrow_and_update().clone();
                    if current.is_syncing || current.last_sync_at == last_seen {
                        continue;
                    }
                    last_seen = current.last_sync_at;
                    if let Some(at) = current.last_sync_at {
                        println!(
                            "[{}] {} change(s) queued, {} failure(s) recorded",
                            at.format("%H:%M:%S"),
                            current.pending_count,
                            current.recent_errors.len()
                        );
                    }
                }
            }
        }

        println!("Stopping...");
        engine.stop().await;
        Ok(())
    }

    async fn failures(&self, store: &LocalStore, clear: bool) -> Result<(), SyncCommandError> {
        let queue = OperationQueue::new(store.clone());

        if clear {
            let cleared = queue.clear_dead_letters().await?;
            println!("Cleared {} failure(s).", cleared);
            return Ok(());
        }

        let letters = queue.dead_letters().await?;
        if letters.is_empty() {
            println!("No failed changes.");
            return Ok(());
        }

        for letter in &letters {
            println!(
                "[{}] {} (after {} attempt(s))",
                letter.failed_at.format("%Y-%m-%d %H:%M:%S"),
                letter.describe(),
                letter.attempts
            );
        }
        println!("\nTotal: {} failure(s)", letters.len());
        Ok(())
    }
}

fn print_report(report: &DrainReport) {
    println!("  ✓ {} synced", report.success);
    if report.failed > 0 {
        println!("  ✗ {} failed", report.failed);
    }
    if report.deferred > 0 {
        println!("  … {} waiting on earlier changes", report.deferred);
    }
}

fn print_errors(status: &SyncStatus) {
    for failure in &status.recent_errors {
        println!("  ✗ {}", failure.message);
    }
}

/// Errors from sync commands
#[derive(Debug)]
pub enum SyncCommandError {
    NotConfigured,
    StorageError(StorageError),
    ClientError(RemoteError),
    EngineError(EngineError),
}

impl std::fmt::Display for SyncCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCommandError::NotConfigured => write!(
                f,
                "Sync not configured. Add sync.server_url and sync.api_key to config."
            ),
            SyncCommandError::StorageError(e) => write!(f, "Storage error: {}", e),
            SyncCommandError::ClientError(e) => write!(f, "Client error: {}", e),
            SyncCommandError::EngineError(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SyncCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncCommandError::NotConfigured => None,
            SyncCommandError::StorageError(e) => Some(e),
            SyncCommandError::ClientError(e) => Some(e),
            SyncCommandError::EngineError(e) => Some(e),
        }
    }
}

impl From<StorageError> for SyncCommandError {
    fn from(e: StorageError) -> Self {
        SyncCommandError::StorageError(e)
    }
}

impl From<RemoteError> for SyncCommandError {
    fn from(e: RemoteError) -> Self {
        SyncCommandError::ClientError(e)
    }
}

impl From<EngineError> for SyncCommandError {
    fn from(e: EngineError) -> Self {
        SyncCommandError::EngineError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unconfigured_sync_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::open(temp_dir.path().join("test.db")).await.unwrap();

        let err = build_engine(&SyncConfig::default(), &store)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SyncCommandError::NotConfigured));
        assert!(err.to_string().contains("sync.server_url"));
    }

    #[tokio::test]
    async fn test_failures_clear() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::open(temp_dir.path().join("test.db")).await.unwrap();
        let queue = OperationQueue::new(store.clone());
        let op_id = queue
            .enqueue(&repfit_core::Operation::delete(
                repfit_core::EntityKind::Routine,
                "gone",
            ))
            .await
            .unwrap();
        queue.evict(op_id, "not found").await.unwrap();

        let command = SyncCommand {
            command: Some(SyncSubcommand::Failures { clear: true }),
        };
        command.failures(&store, true).await.unwrap();
        assert!(queue.dead_letters().await.unwrap().is_empty());
    }
}
