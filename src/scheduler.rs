use crate::sync::Syncer;
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};

/// Background driver for periodic pulls and debounced pushes.
///
/// Every `interval` the syncer ticks (pull, then push if dirty). Each call to
/// [`Scheduler::notify_change`] restarts a debounce timer; when it fires, a
/// push runs if local is still dirty.
pub struct Scheduler {
    changed: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Scheduler {
    pub fn start(syncer: Arc<Syncer>) -> Self {
        let changed = Arc::new(Notify::new());
        let (shutdown, mut stop) = watch::channel(false);
        let policy = syncer.policy().clone();
        let notified = changed.clone();

        let handle = tokio::spawn(async move {
            let period = policy.interval();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut deadline: Option<Instant> = None;

            tracing::info!(?period, debounce = ?policy.debounce(), "auto-sync started");
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = syncer.tick().await {
                            tracing::warn!(error = %e, "periodic sync failed");
                        }
                    }
                    _ = notified.notified() => {
                        deadline = Some(Instant::now() + policy.debounce());
                    }
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        deadline = None;
                        if syncer.is_online() {
                            if let Err(e) = syncer.push_if_dirty().await {
                                tracing::warn!(error = %e, "debounced push failed");
                            }
                        }
                    }
                }
            }
            tracing::info!("auto-sync stopped");
        });

        Scheduler {
            changed,
            shutdown,
            handle,
        }
    }

    /// Local data changed; push once edits settle.
    pub fn notify_change(&self) {
        self.changed.notify_one();
    }

    /// Stop the loop, letting a sync already in progress finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "auto-sync task panicked");
        }
    }
}
