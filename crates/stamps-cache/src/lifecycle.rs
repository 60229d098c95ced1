//! Remote cache availability and background reconnection.
//!
//! ```text
//! Uninitialized -> Probing -> Available
//!                          -> Unavailable -> (backoff) -> Probing -> ...
//! ```
//!
//! A remote tier that is down at startup is left down. One that was healthy
//! at startup and later fails is reconnected in the background by a
//! supervised task, with exponential backoff, until the retry ceiling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use stamps_db::backoff_delay;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result, bounded};
use crate::metrics;
use crate::remote::RemoteCache;
use crate::ttl::CacheTtl;

/// Sentinel key written and read back by every probe.
pub const PROBE_KEY: &str = "stamps:cache:probe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Probing,
    Available,
    Unavailable,
}

struct Shared {
    remote: Arc<dyn RemoteCache>,
    initialized: AtomicBool,
    probing: AtomicBool,
    available: AtomicBool,
    available_at_startup: AtomicBool,
    retrying: AtomicBool,
    retry_count: AtomicU32,
    max_retries: u32,
    retry_interval: Duration,
    max_delay: Duration,
    timeout: Duration,
    wake: Notify,
}

impl Shared {
    async fn probe(&self) -> Result<()> {
        self.probing.store(true, Ordering::SeqCst);
        let outcome = self.run_checks().await;
        self.probing.store(false, Ordering::SeqCst);
        outcome
    }

    /// Reachability, then ping, then a read-after-write on [`PROBE_KEY`].
    async fn run_checks(&self) -> Result<()> {
        bounded("connect", self.timeout, self.remote.connect()).await?;
        bounded("ping", self.timeout, self.remote.ping()).await?;

        let token = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
            .to_string();
        bounded(
            "set",
            self.timeout,
            self.remote.set(PROBE_KEY, token.as_bytes(), CacheTtl::Seconds(60)),
        )
        .await?;
        let read = bounded("get", self.timeout, self.remote.get(PROBE_KEY)).await?;

        if read.as_deref() == Some(token.as_bytes()) {
            Ok(())
        } else {
            Err(CacheError::RoundTrip)
        }
    }

    fn mark_available(&self) {
        self.retry_count.store(0, Ordering::SeqCst);
        self.available.store(true, Ordering::SeqCst);
        metrics::set_remote_available(true);
    }

    /// Wakes the supervisor unless a reconnection is already running.
    fn request_reconnect(&self) -> bool {
        if !self.initialized.load(Ordering::SeqCst) {
            return false;
        }
        if self
            .retrying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.wake.notify_one();
        true
    }

    async fn reconnect(&self) {
        loop {
            match self.probe().await {
                Ok(()) => {
                    self.mark_available();
                    info!(target = %self.remote.describe(), "Remote cache reconnected");
                    return;
                }
                Err(e) => {
                    let count = self.retry_count.load(Ordering::SeqCst);
                    if count >= self.max_retries {
                        warn!(
                            max_retries = self.max_retries,
                            error = %e,
                            "Max retries reached, giving up on remote cache reconnection"
                        );
                        return;
                    }
                    let count = count + 1;
                    self.retry_count.store(count, Ordering::SeqCst);
                    let delay = backoff_delay(self.retry_interval, count, self.max_delay);
                    warn!(
                        attempt = count,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Remote cache reconnection failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Point-in-time view of the lifecycle, for health endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LifecycleStatus {
    pub state: LifecycleState,
    pub available: bool,
    pub available_at_startup: bool,
    pub retry_count: u32,
    pub retrying: bool,
}

/// Owns remote-cache availability. Readers only ever see a boolean.
pub struct CacheLifecycle {
    shared: Arc<Shared>,
    skip_connection: bool,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl CacheLifecycle {
    pub fn new(remote: Arc<dyn RemoteCache>, config: &CacheConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                remote,
                initialized: AtomicBool::new(false),
                probing: AtomicBool::new(false),
                available: AtomicBool::new(false),
                available_at_startup: AtomicBool::new(false),
                retrying: AtomicBool::new(false),
                retry_count: AtomicU32::new(0),
                max_retries: config.max_retries,
                retry_interval: config.retry_interval(),
                max_delay: config.reconnect_max_delay(),
                timeout: config.timeout(),
                wake: Notify::new(),
            }),
            skip_connection: config.skip_connection,
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteCache> {
        &self.shared.remote
    }

    /// Probes the remote cache once and starts the reconnection supervisor.
    ///
    /// A failed startup probe leaves the remote tier unavailable with no
    /// retries scheduled.
    #[instrument(skip(self), fields(target = %self.shared.remote.describe()))]
    pub async fn initialize(&self) {
        if self.skip_connection {
            info!("Skipping remote cache connection");
            return;
        }
        if self.shared.initialized.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Initializing remote cache connection");
        match self.shared.probe().await {
            Ok(()) => {
                self.shared.mark_available();
                self.shared.available_at_startup.store(true, Ordering::SeqCst);
                info!("Connected to remote cache");
            }
            Err(e) => {
                metrics::set_remote_available(false);
                warn!(error = %e, "Failed to connect to remote cache at startup; continuing without it");
            }
        }

        self.spawn_supervisor();
    }

    fn spawn_supervisor(&self) {
        let shared = Arc::clone(&self.shared);
        let token = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = shared.wake.notified() => {}
                }
                debug!("Remote cache reconnection started");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = shared.reconnect() => {}
                }
                shared.retrying.store(false, Ordering::SeqCst);
            }
            debug!("Remote cache supervisor stopped");
        });

        *self.supervisor.lock() = Some(handle);
    }

    pub fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }

    pub fn available_at_startup(&self) -> bool {
        self.shared.available_at_startup.load(Ordering::SeqCst)
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.retry_count.load(Ordering::SeqCst)
    }

    pub fn is_retrying(&self) -> bool {
        self.shared.retrying.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LifecycleState {
        if !self.shared.initialized.load(Ordering::SeqCst) {
            LifecycleState::Uninitialized
        } else if self.shared.probing.load(Ordering::SeqCst) {
            LifecycleState::Probing
        } else if self.is_available() {
            LifecycleState::Available
        } else {
            LifecycleState::Unavailable
        }
    }

    pub fn status(&self) -> LifecycleStatus {
        LifecycleStatus {
            state: self.state(),
            available: self.is_available(),
            available_at_startup: self.available_at_startup(),
            retry_count: self.retry_count(),
            retrying: self.is_retrying(),
        }
    }

    /// Marks the remote tier unavailable after an operational error.
    ///
    /// When it was healthy at startup, a fresh reconnection cycle starts.
    pub fn report_failure(&self, error: &CacheError) {
        metrics::record_remote_error(error.class());
        let was_available = self.shared.available.swap(false, Ordering::SeqCst);
        if was_available {
            metrics::set_remote_available(false);
            warn!(error = %error, "Remote cache operation failed; using local tier");
        }

        if !self.available_at_startup() {
            return;
        }
        if was_available {
            self.shared.retry_count.store(0, Ordering::SeqCst);
        }
        self.shared.request_reconnect();
    }

    /// Asks for a reconnection from the unavailable path without resetting
    /// the retry count. No-op while one is running or once the ceiling is
    /// reached.
    pub fn nudge(&self) {
        if self.is_available() || !self.available_at_startup() {
            return;
        }
        if self.retry_count() >= self.shared.max_retries {
            return;
        }
        self.shared.request_reconnect();
    }

    /// Starts a new reconnection cycle regardless of previous give-ups.
    pub fn probe_now(&self) -> bool {
        if self.is_available() {
            return false;
        }
        self.shared.retry_count.store(0, Ordering::SeqCst);
        self.shared.request_reconnect()
    }

    /// Stops the supervisor, abandoning any reconnection in flight.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
