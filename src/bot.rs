//! Bot runner: the monitoring loop around the trigger engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::trading::TriggerEngine;

/// Main bot runner.
pub struct Bot {
    engine: TriggerEngine,
    poll_interval: Duration,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    pub fn new(engine: TriggerEngine) -> Self {
        let poll_interval = Duration::from_secs(engine.config().poll_interval_secs.max(1));
        Self {
            engine,
            poll_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run ticks until Ctrl+C or the shutdown flag is set.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            poll_interval = self.poll_interval.as_secs(),
            "Starting monitoring loop"
        );

        let mut poll_interval = interval(self.poll_interval);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                _ = poll_interval.tick() => {}
                _ = wait_for_flag(self.shutdown.clone()) => break,
            }

            if let Err(e) = self.engine.tick().await {
                error!(error = %e, "Tick skipped");
            }
        }

        self.finish();
        Ok(())
    }

    /// Run a single tick; used by `run --once`.
    pub async fn run_once(&mut self) -> Result<()> {
        let result = self.engine.tick().await;
        self.finish();
        result.map_err(Into::into)
    }

    fn finish(&self) {
        let pending = self.engine.pending_writes();
        if pending > 0 {
            warn!(pending = pending, "Exiting with state changes not yet written");
        }
        info!("Monitoring stopped");
        println!("\n{}", self.engine.stats());
    }
}

async fn wait_for_flag(flag: Arc<AtomicBool>) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
