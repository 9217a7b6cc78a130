//! Background removal of idle sessions

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pool::SessionPool;

/// Periodic sweep over a pool. Holds the pool weakly so it never keeps a
/// dropped pool alive.
#[derive(Debug)]
pub(crate) struct Reaper {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn spawn(pool: Weak<SessionPool>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else {
                            break;
                        };
                        let reaped = pool.reap().await;
                        if reaped > 0 {
                            info!(reaped, "reaped idle sessions");
                        }
                    }
                }
            }
            debug!("reaper stopped");
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop the sweep and wait for an in-progress pass to finish
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
