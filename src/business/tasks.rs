//! Periodic background tasks owned by one controller

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::logger::log;

/// How long `close_all` waits for each task to observe cancellation
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Set of named periodic tasks sharing one cancellation token
pub struct TaskManager {
    token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Run `job` every `period`, first after one full period.
    ///
    /// Missed ticks are skipped so a slow job never queues a burst of runs.
    /// A job in progress is allowed to finish before cancellation is observed.
    pub fn spawn_periodic<F, Fut>(
        &mut self,
        name: &'static str,
        period: Duration,
        span: tracing::Span,
        mut job: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let handle = tokio::spawn(
            async move {
                let now = Instant::now();
                let start = now.checked_add(period).unwrap_or(now);
                let mut interval = interval_at(start, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            log::debug!(task = name, "Periodic task shutting down");
                            break;
                        }
                        _ = interval.tick() => job().await,
                    }
                }
            }
            .instrument(span),
        );
        log::debug!(task = name, period = ?period, "Periodic task started");
        self.handles.push((name, handle));
    }

    pub fn count(&self) -> usize {
        self.handles.len()
    }

    /// Cancel every task and wait for each to stop
    pub async fn close_all(&mut self) {
        self.token.cancel();
        for (name, handle) in self.handles.drain(..) {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => log::debug!(task = name, "Periodic task stopped"),
                Ok(Err(e)) => log::warn!(task = name, error = %e, "Periodic task panicked"),
                Err(_) => log::warn!(task = name, "Periodic task shutdown timeout"),
            }
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_runs_after_first_period() {
        let mut tasks = TaskManager::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        tasks.spawn_periodic("count", Duration::from_secs(10), tracing::Span::none(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(tasks.count(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        tasks.close_all().await;
        assert_eq!(tasks.count(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_all_without_tasks() {
        let mut tasks = TaskManager::default();
        tasks.close_all().await;
        assert_eq!(tasks.count(), 0);
    }
}
