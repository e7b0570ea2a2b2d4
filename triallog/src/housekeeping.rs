//! Periodic trial maintenance.
//!
//! A timer task keeps the ring healthy when senders go quiet or never send
//! trial advances: long-open trials are split into portions, and stale
//! unwritten slots are flushed so memory stays bounded.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, trace};

use crate::control::Logger;
use crate::signals::Watcher;

fn default_split_trials_older_than_secs() -> f64 {
    10.0
}

fn default_flush_trials_older_than_secs() -> f64 {
    20.0
}

fn default_interval_secs() -> f64 {
    1.0
}

/// Configuration for [`Housekeeper`].
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Split the current trial once it has been open this long.
    #[serde(default = "default_split_trials_older_than_secs")]
    pub split_trials_older_than_secs: f64,
    /// Flush non-current slots untouched for this long, written or not.
    #[serde(default = "default_flush_trials_older_than_secs")]
    pub flush_trials_older_than_secs: f64,
    /// Tick cadence.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            split_trials_older_than_secs: default_split_trials_older_than_secs(),
            flush_trials_older_than_secs: default_flush_trials_older_than_secs(),
            interval_secs: default_interval_secs(),
        }
    }
}

/// The housekeeping task.
#[derive(Debug)]
pub struct Housekeeper {
    config: Config,
    logger: Arc<Logger>,
    shutdown: Watcher,
}

impl Housekeeper {
    /// Create a new [`Housekeeper`] over `logger`.
    #[must_use]
    pub fn new(config: Config, logger: Arc<Logger>, shutdown: Watcher) -> Self {
        Self {
            config,
            logger,
            shutdown,
        }
    }

    /// Run maintenance ticks until shutdown.
    pub async fn spin(self) {
        let Self {
            config,
            logger,
            mut shutdown,
        } = self;
        let mut ticker = interval(Duration::from_secs_f64(config.interval_secs.max(0.1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.recv() => {
                    info!("shutdown signal received");
                    return;
                }
                _ = ticker.tick() => {
                    logger.split_current_trial_if_older_than(config.split_trials_older_than_secs);
                    logger.flush_trials_older_than(config.flush_trials_older_than_secs);
                    trace!(snapshot = ?logger.snapshot(), "housekeeping tick");
                }
            }
        }
    }
}
