//! Reconciliation timer with idempotent arming.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Owns at most one periodic timer task.
///
/// `arm` while armed and `disarm` while disarmed are no-ops. Dropping the
/// handle cancels the timer.
pub struct SchedulerHandle {
    period: Duration,
    timer: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            timer: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start running `job` every period, first run one period from now.
    ///
    /// Returns `false` if a timer was already active.
    pub fn arm<F, Fut>(&mut self, job: F) -> bool
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_armed() {
            return false;
        }
        let period = self.period;
        self.timer = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                job().await;
            }
        }));
        debug!(period_ms = period.as_millis() as u64, "sync timer armed");
        true
    }

    /// Cancel the timer. Returns `false` if none was active.
    pub fn disarm(&mut self) -> bool {
        match self.timer.take() {
            Some(timer) => {
                timer.abort();
                debug!("sync timer disarmed");
                true
            }
            None => false,
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(
        count: &Arc<AtomicUsize>,
    ) -> impl Fn() -> std::future::Ready<()> + Send + 'static {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn arming_twice_keeps_one_timer() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut handle = SchedulerHandle::new(Duration::from_secs(10));

        assert!(handle.arm(counting_job(&count)));
        assert!(!handle.arm(counting_job(&count)));

        tokio::time::sleep(Duration::from_secs(10) + Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_cancels_pending_tick() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut handle = SchedulerHandle::new(Duration::from_secs(10));
        handle.arm(counting_job(&count));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handle.disarm());
        assert!(!handle.disarm());
        assert!(!handle.is_armed());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
