use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::engine::TripEngine;

/// Drives the overdue sweep on a fixed cadence. Single-flight: a tick that
/// fires while a sweep is still running is skipped, never overlapped, so a
/// slow sweep cannot cause duplicate overdue notifications.
pub struct Scheduler {
    engine: TripEngine,
    interval: Duration,
    in_flight: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(engine: TripEngine, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "overdue scan loop started");
            self.run().await;
        })
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One guarded sweep. Public so an operator surface or test can trigger
    /// a scan outside the timer; the in-flight flag keeps those calls from
    /// overlapping the loop.
    pub async fn tick(&self) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("scan still in flight, skipping tick");
            return;
        }
        match self.engine.scan(Utc::now()).await {
            Ok(0) => debug!("scan complete, no overdue trips"),
            Ok(transitions) => info!(transitions, "scan complete"),
            Err(err) => error!(error = %err, "scan failed"),
        }
        self.in_flight.store(false, Ordering::SeqCst);
    }
}
