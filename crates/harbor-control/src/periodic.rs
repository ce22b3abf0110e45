//! Fixed-interval background tasks.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Spawn a task that runs `f` every `period` until `cancel` fires.
///
/// The first run happens immediately. Each run is awaited before the next tick
/// is taken, and ticks missed during a slow run are skipped rather than
/// replayed, so runs never overlap or pile up.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut f: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(task = name, period_ms = period.as_millis(), "Periodic task started");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => f().await,
            }
        }

        tracing::info!(task = name, "Periodic task stopped");
    })
}
