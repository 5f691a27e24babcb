//! Scheduled garbage collection.
//!
//! The sweeper wakes on a tokio interval and runs `garbage_collect_all` on its
//! own rayon pool, off the async runtime. Shutdown stops new per-group work
//! immediately; groups already being reconciled finish.

use crate::canonical::{garbage_collect_all_with, SweepReport};
use crate::config::SweepConfig;
use crate::error::{BugdexError, Result};
use crate::store::BugStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub struct Sweeper {
    store: Arc<dyn BugStore>,
    pool: rayon::ThreadPool,
    config: SweepConfig,
    cancel: Arc<AtomicBool>,
    sweeps_completed: AtomicU64,
    last_report: Mutex<Option<SweepReport>>,
}

impl Sweeper {
    pub fn new(store: Arc<dyn BugStore>, config: SweepConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads.max(1))
            .thread_name(|index| format!("bugdex-sweep-{index}"))
            .build()
            .map_err(|e| BugdexError::Config(format!("sweep pool: {e}")))?;
        Ok(Self {
            store,
            pool,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            sweeps_completed: AtomicU64::new(0),
            last_report: Mutex::new(None),
        })
    }

    /// One full sweep on the sweeper's pool, blocking the caller.
    pub fn run_once(&self) -> Result<SweepReport> {
        let started = Instant::now();
        let report = self
            .pool
            .install(|| garbage_collect_all_with(self.store.as_ref(), &self.cancel))?;
        self.sweeps_completed.fetch_add(1, Ordering::Relaxed);
        info!(
            scanned = report.scanned,
            consistent = report.consistent,
            retired = report.retired(),
            deferred = report.deferred,
            vanished = report.vanished,
            skipped = report.skipped,
            failures = report.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sweep finished"
        );
        *self.last_report.lock() = Some(report.clone());
        Ok(report)
    }

    pub fn sweeps_completed(&self) -> u64 {
        self.sweeps_completed.load(Ordering::Relaxed)
    }

    pub fn last_report(&self) -> Option<SweepReport> {
        self.last_report.lock().clone()
    }

    /// Stop issuing per-group work in the current and all later sweeps.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Sweep every `interval_secs` until `shutdown` turns true or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let cancel = Arc::clone(&self.cancel);
        let mut watcher = shutdown.clone();
        tokio::spawn(async move {
            loop {
                if watcher.changed().await.is_err() || *watcher.borrow() {
                    cancel.store(true, Ordering::Relaxed);
                    break;
                }
            }
        });

        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !self.config.run_on_start {
            // The first tick completes immediately.
            interval.tick().await;
        }
        info!(interval_secs = period.as_secs(), "sweeper started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let sweeper = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || sweeper.run_once()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "sweep failed, retrying next interval"),
                        Err(e) => warn!(error = %e, "sweep task panicked"),
                    }
                    if self.is_cancelled() {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.cancel();
                        break;
                    }
                }
            }
        }

        info!(sweeps = self.sweeps_completed(), "sweeper stopped");
        Ok(())
    }
}
