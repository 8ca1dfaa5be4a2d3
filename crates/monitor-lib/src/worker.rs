//! Periodic worker scheduling
//!
//! Both monitoring workers run on the same model: tick immediately, then on
//! every interval; an overrunning tick delays the next one instead of
//! stacking up; shutdown is only observed between ticks.

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Run `tick` every `period` until `shutdown` fires
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    info!(
        worker = name,
        interval_secs = period.as_secs(),
        "Starting periodic worker"
    );

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let start = Instant::now();
                tick().await;
                ticks += 1;
                debug!(
                    worker = name,
                    tick = ticks,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Tick complete"
                );
            }
            _ = shutdown.recv() => {
                info!(worker = name, ticks, "Shutting down periodic worker");
                break;
            }
        }
    }
}

/// Handle to a spawned background loop
///
/// Dropping the handle leaves the loop running; call [`WorkerHandle::stop`]
/// to halt it.
pub struct WorkerHandle {
    name: &'static str,
    shutdown: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn `body` with a fresh shutdown receiver
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = broadcast::channel(1);
        let join = tokio::spawn(body(rx));
        Self {
            name,
            shutdown,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop scheduling new ticks and wait for the loop to exit
    pub async fn stop(self) {
        // Err only means the loop already exited
        let _ = self.shutdown.send(());
        if let Err(e) = self.join.await {
            warn!(worker = self.name, error = %e, "Worker task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_worker(period: Duration) -> (WorkerHandle, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = WorkerHandle::spawn("test", move |shutdown| async move {
            run_periodic("test", period, shutdown, move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
        });
        (handle, count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_is_immediate() {
        let (handle, count) = counting_worker(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_interval() {
        let (handle, count) = counting_worker(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(150)).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_scheduling() {
        let (handle, count) = counting_worker(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(25)).await;
        handle.stop().await;

        let after_stop = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_tick_completes_before_exit() {
        let started = Arc::new(tokio::sync::Notify::new());
        let finished = Arc::new(AtomicBool::new(false));

        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        let handle = WorkerHandle::spawn("slow", move |shutdown| async move {
            run_periodic("slow", Duration::from_secs(60), shutdown, move || {
                let (s, f) = (Arc::clone(&s), Arc::clone(&f));
                async move {
                    s.notify_one();
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    f.store(true, Ordering::SeqCst);
                }
            })
            .await
        });

        started.notified().await;
        handle.stop().await;

        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_tick_does_not_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let (r, m) = (Arc::clone(&running), Arc::clone(&max_seen));
        let handle = WorkerHandle::spawn("overrun", move |shutdown| async move {
            run_periodic("overrun", Duration::from_secs(1), shutdown, move || {
                let (r, m) = (Arc::clone(&r), Arc::clone(&m));
                async move {
                    let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                    m.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    r.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .await
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        handle.stop().await;

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
