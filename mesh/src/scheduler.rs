//! Periodic task management
//!
//! Liveness sweeps, gossip broadcasts and sync kickoffs run as named periodic
//! tasks owned by the node. Each task stops when its cancellation token fires.

use std::{future::Future, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Handle to a running periodic task
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Run `tick` every `period`, first after `initial_delay`. A tick that
    /// overruns the period delays the next one instead of bursting.
    pub fn spawn<F, Fut>(
        name: &'static str,
        initial_delay: Duration,
        period: Duration,
        cancel: CancellationToken,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + initial_delay, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "Starting periodic task '{}' with {:?} interval (first run in {:?})",
                name, period, initial_delay
            );

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        debug!("Running periodic task '{}'", name);
                        tick().await;
                    }
                    _ = token.cancelled() => {
                        info!("Periodic task '{}' received shutdown signal", name);
                        break;
                    }
                }
            }

            info!("Periodic task '{}' stopped", name);
        });

        Self {
            name,
            cancel,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait for the task to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
