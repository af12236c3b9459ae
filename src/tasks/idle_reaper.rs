use std::sync::Weak;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Something that can evict idle channels
pub trait IdleSweep: Send + Sync + 'static {
    /// Evict idle entries and return how many were removed
    fn sweep_idle(&self, idle_timeout: Duration) -> usize;
}

/// Periodic safety-net sweep for channels nobody is subscribed to.
///
/// Reference counting closes channels as soon as their last subscriber
/// leaves; the reaper only catches entries left without subscribers, such
/// as warmed channels nobody ever attached to.
pub struct IdleReaper<S: IdleSweep> {
    target: Weak<S>,
    interval: Duration,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl<S: IdleSweep> IdleReaper<S> {
    pub fn new(
        target: Weak<S>,
        interval: Duration,
        idle_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            target,
            interval,
            idle_timeout,
            shutdown,
        }
    }

    /// Run until cancelled or the target is dropped
    pub async fn run(self) {
        let mut sweep_timer = tokio::time::interval(self.interval);

        // Skip immediate first tick
        sweep_timer.tick().await;

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            idle_timeout_ms = self.idle_timeout.as_millis() as u64,
            "Idle reaper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Idle reaper received shutdown signal");
                    break;
                }
                _ = sweep_timer.tick() => {
                    let Some(target) = self.target.upgrade() else {
                        break;
                    };
                    self.sweep(target.as_ref());
                }
            }
        }

        tracing::info!("Idle reaper stopped");
    }

    fn sweep(&self, target: &S) {
        let start = Instant::now();
        let removed = target.sweep_idle(self.idle_timeout);

        if removed > 0 {
            tracing::info!(
                removed = removed,
                idle_timeout_ms = self.idle_timeout.as_millis() as u64,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Reaped idle channels"
            );
        } else {
            tracing::debug!("Idle sweep found nothing to remove");
        }
    }
}
