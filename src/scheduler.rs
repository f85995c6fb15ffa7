//! Scheduler: the daemon loop and its one-shot cousins (spec §4.7, §5).
//!
//! No async runtime. The daemon's "separate worker units" are OS threads:
//! one drives the sync loop, another sends heartbeats on its own cadence,
//! both watch a shared shutdown flag set from a signal handler.

use crate::error::Result;
use crate::reconciler::{Reconciler, SyncMode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    sync_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(reconciler: Reconciler, sync_interval: Duration) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            sync_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install the SIGINT/SIGTERM handler. Call once, before `run_daemon`.
    pub fn install_signal_handler(&self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        ctrlc::set_handler(move || {
            info!("received shutdown signal, finishing current cycle");
            shutdown.store(true, Ordering::SeqCst);
        })
        .map_err(|e| crate::error::SyncError::StoreUnavailable(format!("signal handler: {e}")))?;
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// A single bidirectional sync cycle, used by `stabctl sync`.
    pub fn run_once(&self, mode: SyncMode) -> Result<()> {
        self.reconciler.sync(mode)
    }

    /// The bootstrap import, used by `stabctl initial`.
    pub fn run_initial(&self) -> Result<crate::reconciler::InitialSyncReport> {
        self.reconciler.initial_sync()
    }

    /// Run forever: sync every `sync_interval`, heartbeat on its own
    /// thread, both stopping promptly after a signal (spec §4.7).
    pub fn run_daemon(&self, api_key: Option<String>) {
        let heartbeat_handle = api_key.map(|key| {
            let reconciler = self.reconciler.clone();
            let shutdown = self.shutdown.clone();
            thread::spawn(move || heartbeat_loop(reconciler, key, shutdown))
        });

        info!(interval_secs = self.sync_interval.as_secs(), "daemon loop starting");
        while !self.should_stop() {
            match self.reconciler.sync(SyncMode::Bidirectional) {
                Ok(()) => info!("sync cycle completed"),
                Err(err) => error!(error = %err, "sync cycle failed, will retry next interval"),
            }
            sleep_interruptible(self.sync_interval, &self.shutdown);
        }
        info!("daemon loop stopped");

        if let Some(handle) = heartbeat_handle {
            let _ = handle.join();
        }
    }
}

fn heartbeat_loop(reconciler: Arc<Reconciler>, api_key: String, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        if !reconciler.heartbeat(&api_key) {
            warn!("heartbeat failed, continuing");
        }
        sleep_interruptible(HEARTBEAT_INTERVAL, &shutdown);
    }
}

/// Sleep in short slices so a shutdown signal is noticed within ~1s
/// instead of blocking for the full interval.
fn sleep_interruptible(total: Duration, shutdown: &AtomicBool) {
    const SLICE: Duration = Duration::from_secs(1);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let step = remaining.min(SLICE);
        thread::sleep(step);
        remaining -= step;
    }
}
