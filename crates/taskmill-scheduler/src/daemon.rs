use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::loader::RecordLoader;
use crate::scheduler::Scheduler;

/// Drives [`Scheduler::run`] on a fixed cadence until shut down.
pub struct SchedulerDaemon {
    scheduler: Scheduler,
    loader: Box<dyn RecordLoader>,
    every: Duration,
}

impl SchedulerDaemon {
    pub fn new(scheduler: Scheduler, loader: Box<dyn RecordLoader>, every: Duration) -> Self {
        Self {
            scheduler,
            loader,
            every,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Main loop. Ticks immediately, then every `every`, until `shutdown`
    /// broadcasts `true`. A failed tick is logged and the loop carries on.
    ///
    /// Task bodies block, so each tick runs under `block_in_place`; this
    /// needs the multi-threaded runtime.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> u64 {
        info!(
            every_secs = self.every.as_secs_f64(),
            tasks = self.scheduler.tasks().len(),
            "scheduler daemon started"
        );

        let mut interval = tokio::time::interval(self.every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0u64;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    ticks += 1;
                    tokio::task::block_in_place(|| self.tick());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(ticks, "scheduler daemon shutting down");
                        break;
                    }
                }
            }
        }
        ticks
    }

    fn tick(&self) {
        // Other processes may have written since the last pass.
        self.loader.clear_cache();
        if let Err(e) = self.scheduler.run(self.loader.as_ref()) {
            match e.task_identity() {
                Some(identity) => error!(%identity, error = %e, "scheduler tick failed"),
                None => error!(error = %e, "scheduler tick failed"),
            }
        }
    }
}
