//! Cached connectivity state with publish/subscribe.
//!
//! ## Design
//!
//! One [`NetworkSnapshot`] lives in a `watch` channel for the lifetime of
//! the monitor. It starts optimistic (connected, reachable) and is updated
//! by two paths:
//!
//! - active: [`NetworkMonitor::refresh`] runs the probe under a short timeout
//! - passive: [`NetworkMonitor::on_connectivity_change`] applies an OS event
//!   without probing
//!
//! Only the monitor writes the snapshot. Callback subscribers receive a copy
//! after each change; stream subscribers use [`NetworkMonitor::watch`].

use super::probe::ReachabilityProbe;
use crate::resilience::AbortSignal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// Link type as last reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Wifi,
    Cellular,
    Ethernet,
    Other,
    None,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSnapshot {
    pub is_connected: bool,
    pub is_internet_reachable: bool,
    pub transport: Transport,
    /// Time of the last probe; `None` until the first refresh
    pub last_checked: Option<SystemTime>,
}

impl Default for NetworkSnapshot {
    fn default() -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: true,
            transport: Transport::Unknown,
            last_checked: None,
        }
    }
}

impl NetworkSnapshot {
    pub fn state(&self) -> NetworkState {
        NetworkState {
            is_connected: self.is_connected,
            is_internet_reachable: self.is_internet_reachable,
        }
    }

    fn same_connectivity(&self, other: &Self) -> bool {
        self.is_connected == other.is_connected
            && self.is_internet_reachable == other.is_internet_reachable
            && self.transport == other.transport
    }
}

/// The two flags callers usually branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkState {
    pub is_connected: bool,
    pub is_internet_reachable: bool,
}

/// A passive connectivity signal from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityEvent {
    pub is_connected: bool,
    pub transport: Transport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorOptions {
    /// Timeout applied to each probe
    pub probe_timeout: Duration,
    /// Period of the background refresh started by `start`
    pub refresh_interval: Duration,
    /// Polling period of `wait_for_network`
    pub poll_interval: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(3),
            refresh_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Handle returned by [`NetworkMonitor::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&NetworkSnapshot) + Send + Sync>;

pub struct NetworkMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    options: MonitorOptions,
    snapshot: watch::Sender<NetworkSnapshot>,
    listeners: Mutex<BTreeMap<SubscriptionId, Listener>>,
    next_id: AtomicU64,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl NetworkMonitor {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, options: MonitorOptions) -> Self {
        let (snapshot, _) = watch::channel(NetworkSnapshot::default());
        Self {
            probe,
            options,
            snapshot,
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            refresher: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn network_state(&self) -> NetworkState {
        self.snapshot.borrow().state()
    }

    /// Replace the snapshot and notify listeners if connectivity changed.
    fn publish(&self, next: NetworkSnapshot) {
        let previous = self.snapshot.send_replace(next.clone());
        if previous.same_connectivity(&next) {
            return;
        }

        info!(
            connected = next.is_connected,
            reachable = next.is_internet_reachable,
            transport = ?next.transport,
            "connectivity changed"
        );
        let listeners: Vec<Listener> = lock(&self.listeners).values().cloned().collect();
        for listener in listeners {
            listener(&next);
        }
    }

    /// Probe now and update the snapshot.
    pub async fn refresh(&self) -> NetworkSnapshot {
        self.probe_within(self.options.probe_timeout).await
    }

    /// Probe under `limit` and publish the result. Nothing is published if
    /// the returned future is dropped first.
    async fn probe_within(&self, limit: Duration) -> NetworkSnapshot {
        let outcome = tokio::time::timeout(limit, self.probe.probe()).await;
        let reachable = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(error = %e, kind = %e.kind(), "probe failed");
                false
            }
            Err(_) => {
                debug!(timeout = ?limit, "probe timed out");
                false
            }
        };

        let mut next = self.snapshot();
        next.is_connected = reachable;
        next.is_internet_reachable = reachable;
        next.last_checked = Some(SystemTime::now());
        if !reachable {
            next.transport = Transport::None;
        } else if next.transport == Transport::None {
            next.transport = Transport::Unknown;
        }

        self.publish(next.clone());
        next
    }

    /// Apply a passive platform event without probing.
    ///
    /// A connected event is taken optimistically as reachable until the next
    /// refresh says otherwise.
    pub fn on_connectivity_change(&self, event: ConnectivityEvent) {
        let mut next = self.snapshot();
        next.is_connected = event.is_connected;
        next.is_internet_reachable = event.is_connected;
        next.transport = if event.is_connected {
            event.transport
        } else {
            Transport::None
        };
        self.publish(next);
    }

    /// The app returned to the foreground: re-probe.
    pub async fn on_app_foreground(&self) -> NetworkSnapshot {
        self.refresh().await
    }

    /// Call `listener` with every connectivity change.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&NetworkSnapshot) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.listeners).insert(id, Arc::new(listener));
        id
    }

    /// Returns whether `id` was subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.listeners).remove(&id).is_some()
    }

    /// Stream of snapshots, starting with the current one.
    pub fn watch(&self) -> WatchStream<NetworkSnapshot> {
        WatchStream::new(self.snapshot.subscribe())
    }

    /// Start periodic background refreshes. Replaces a running refresher.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.options.refresh_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else { break };
                monitor.refresh().await;
            }
        });

        if let Some(previous) = lock(&self.refresher).replace(handle) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = lock(&self.refresher).take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.refresher)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Poll until connected or `timeout` elapses. Never errors.
    ///
    /// Both the probes and the pauses between them end early on abort, and
    /// no probe runs past the deadline.
    ///
    /// # Returns
    ///
    /// `true` once a probe succeeds; `false` on timeout or abort.
    pub async fn wait_for_network(&self, timeout: Duration, abort: &AbortSignal) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if abort.is_aborted() {
                return false;
            }
            let limit = self
                .options
                .probe_timeout
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                snapshot = self.probe_within(limit) => {
                    if snapshot.is_connected {
                        return true;
                    }
                }
                _ = abort.aborted() => return false,
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(?timeout, "network did not come back in time");
                return false;
            }
            let nap = self.options.poll_interval.min(deadline - now);

            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = abort.aborted() => return false,
            }
        }
    }
}
