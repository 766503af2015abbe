// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task that destroys allocations past their expiration
//!
//! Runs on a fixed interval.  A sweep holds a mutex for its whole run so two
//! sweeps can never process the same expired set concurrently; a tick that
//! finds the previous sweep still running is skipped, not queued.  Races
//! with user-triggered destroys are benign: whichever acts first wins and
//! the other observes a not-running allocation.

use crate::controller::Controller;
use slog::debug;
use slog::info;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct ExpirationReaper {
    log: Logger,
    controller: Arc<Controller>,
    period: Duration,
    sweep_lock: Arc<Mutex<()>>,
}

impl ExpirationReaper {
    pub fn new(
        log: Logger,
        controller: Arc<Controller>,
        period: Duration,
    ) -> ExpirationReaper {
        ExpirationReaper {
            log,
            controller,
            period,
            sweep_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Spawns the periodic sweep.  The task runs until the returned handle
    /// is dropped or aborted.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(self.log, "expiration reaper running";
                "period_secs" => self.period.as_secs());
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }

    /// Runs one sweep, skipping if another sweep is still in progress.
    pub async fn sweep(&self) -> usize {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            debug!(self.log, "previous sweep still running, skipping tick");
            return 0;
        };
        let destroyed = self.controller.destroy_expired().await;
        debug!(self.log, "sweep complete"; "destroyed" => destroyed);
        destroyed
    }
}
