//! Connectivity reporting.
//!
//! A [`NetworkMonitor`] answers "are we online right now" and hands out
//! [`Subscription`]s that yield each change. The engine drains on every
//! offline-to-online edge.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkSnapshot {
    /// The device has a network interface up.
    pub connected: bool,
    /// The server answered the last reachability check.
    pub reachable: bool,
}

impl NetworkSnapshot {
    pub fn online() -> Self {
        Self {
            connected: true,
            reachable: true,
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> bool {
        self.connected && self.reachable
    }
}

/// A stream of connectivity changes. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: watch::Receiver<NetworkSnapshot>,
}

impl Subscription {
    pub fn current(&self) -> NetworkSnapshot {
        *self.rx.borrow()
    }

    /// Wait for the next change. `None` once the monitor is gone.
    pub async fn changed(&mut self) -> Option<NetworkSnapshot> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    pub fn unsubscribe(self) {}
}

pub trait NetworkMonitor: Send + Sync + 'static {
    fn snapshot(&self) -> NetworkSnapshot;

    fn is_online(&self) -> bool {
        self.snapshot().is_online()
    }

    fn subscribe(&self) -> Subscription;
}

/// Connectivity set by the host, for platforms that bridge their own
/// connectivity API and for tests.
#[derive(Debug, Clone)]
pub struct ManualNetworkMonitor {
    tx: Arc<watch::Sender<NetworkSnapshot>>,
}

impl ManualNetworkMonitor {
    pub fn new(initial: NetworkSnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, snapshot: NetworkSnapshot) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
        if changed {
            tracing::debug!("Network state changed: online={}", snapshot.is_online());
        }
    }

    pub fn set_online(&self, online: bool) {
        self.set(if online {
            NetworkSnapshot::online()
        } else {
            NetworkSnapshot::offline()
        });
    }
}

impl Default for ManualNetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkSnapshot::online())
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
    fn snapshot(&self) -> NetworkSnapshot {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }
}

/// Polls the server's health endpoint.
///
/// `connected` is false when the request could not be sent at all,
/// `reachable` is false when it was sent but did not get a 2xx answer.
#[derive(Debug)]
pub struct ProbeNetworkMonitor {
    state: ManualNetworkMonitor,
    task: JoinHandle<()>,
}

impl ProbeNetworkMonitor {
    /// Probe once, then keep probing every `interval` in the background.
    pub async fn connect(server_url: &str, interval: Duration, timeout: Duration) -> Self {
        let url = format!("{}/health", server_url.trim_end_matches('/'));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        let initial = probe(&client, &url).await;
        let state = ManualNetworkMonitor::new(initial);
        tracing::info!("Server {} online={}", url, initial.is_online());

        let publisher = state.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                publisher.set(probe(&client, &url).await);
            }
        });

        Self { state, task }
    }
}

async fn probe(client: &reqwest::Client, url: &str) -> NetworkSnapshot {
    match client.get(url).send().await {
        Ok(response) => NetworkSnapshot {
            connected: true,
            reachable: response.status().is_success(),
        },
        Err(e) if e.is_connect() => {
            tracing::debug!("Health probe could not connect: {}", e);
            NetworkSnapshot::offline()
        }
        Err(e) => {
            tracing::debug!("Health probe failed: {}", e);
            NetworkSnapshot {
                connected: true,
                reachable: false,
            }
        }
    }
}

impl NetworkMonitor for ProbeNetworkMonitor {
    fn snapshot(&self) -> NetworkSnapshot {
        self.state.snapshot()
    }

    fn subscribe(&self) -> Subscription {
        self.state.subscribe()
    }
}

impl Drop for ProbeNetworkMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
