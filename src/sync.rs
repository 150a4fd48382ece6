//! Wiring between the CLI configuration and the sync engine.

use repfit_core::{HttpRemoteClient, LocalStore, ProbeNetworkMonitor, SyncEngine};

use crate::commands::SyncCommandError;
use crate::config::{Config, SyncConfig};

pub type CliEngine = SyncEngine<HttpRemoteClient, ProbeNetworkMonitor>;

/// Build an engine talking to the configured server. Probes the server once.
pub async fn build_engine(
    config: &SyncConfig,
    store: &LocalStore,
) -> Result<CliEngine, SyncCommandError> {
    let (Some(server_url), Some(api_key)) = (&config.server_url, &config.api_key) else {
        return Err(SyncCommandError::NotConfigured);
    };

    let remote = HttpRemoteClient::new(
        server_url.as_str(),
        Some(api_key.clone()),
        config.request_timeout(),
    )?;
    let network =
        ProbeNetworkMonitor::connect(server_url, config.probe_interval(), config.request_timeout())
            .await;

    Ok(SyncEngine::new(
        store.clone(),
        remote,
        network,
        config.settings(),
    ))
}

/// Drain once after a write, if `auto_sync` is enabled.
///
/// Failures are reported on stderr and otherwise ignored; the CLI must keep
/// working offline and the operations stay queued.
pub async fn try_auto_sync(config: &Config, store: &LocalStore) {
    if !config.sync.auto_sync || !config.sync.is_configured() {
        return;
    }

    let engine = match build_engine(&config.sync, store).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Auto-sync: {}", e);
            return;
        }
    };

    if !repfit_core::NetworkMonitor::is_online(engine.network()) {
        eprintln!("Auto-sync: server unreachable, changes stay queued");
        return;
    }

    let report = engine.drain().await;
    tracing::debug!(
        success = report.success,
        failed = report.failed,
        deferred = report.deferred,
        "Auto-sync finished"
    );
    if report.failed > 0 {
        eprintln!(
            "Auto-sync: {} operation(s) failed, see 'repfit sync status'",
            report.failed
        );
    }
}
