//! Background eviction of stale buckets.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::controller::AdmissionController;

pub struct Sweeper {
    controller: Arc<AdmissionController>,
    interval: Duration,
}

/// Running sweeper task; dropping it without [`SweeperHandle::stop`] leaves the task running
/// until the runtime shuts down.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Sweeper {
    pub fn new(controller: Arc<AdmissionController>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
        }
    }

    pub fn spawn(self) -> SweeperHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.interval, store = self.controller.store().name(), "bucket sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_once().await,
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("bucket sweeper stopped");
        });

        SweeperHandle { shutdown, task }
    }

    async fn run_once(&self) {
        match self.controller.sweep().await {
            Ok(0) => {}
            Ok(evicted) => debug!(evicted, "evicted stale buckets"),
            Err(e) => warn!(error = %e, "bucket sweep failed"),
        }
    }
}

impl SweeperHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "bucket sweeper task ended abnormally");
        }
    }
}
