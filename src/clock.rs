//! Small time seam: wall-clock reads for statuses and a resettable one-shot
//! timer for debouncing.
//!
//! Timer-sensitive tests run under `#[tokio::test(start_paused = true)]`,
//! which virtualizes `tokio::time` and therefore everything here.

use std::time::{Duration, SystemTime};

use tokio::time::Instant;

/// Wall-clock now, used for status and session timestamps.
pub fn now() -> SystemTime {
    SystemTime::now()
}

/// A one-shot timer that can be re-armed while pending.
///
/// Arming while already armed pushes the deadline out, which is exactly the
/// trailing-edge debounce behavior. The timer is inert until armed; `fired`
/// never resolves while disarmed, so it is safe inside `select!` loops.
#[derive(Debug, Default)]
pub struct OneShot {
    deadline: Option<Instant>,
}

impl OneShot {
    pub fn disarmed() -> Self {
        OneShot { deadline: None }
    }

    /// Start or reset the timer to fire `interval` from now.
    pub fn arm(&mut self, interval: Duration) {
        self.deadline = Some(Instant::now() + interval);
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the armed deadline passes; pends forever while
    /// disarmed.
    ///
    /// The returned future captures the current deadline by value, so the
    /// timer itself may be re-armed from another `select!` branch.
    pub fn fired(&self) -> impl std::future::Future<Output = ()> + 'static {
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_interval() {
        let mut timer = OneShot::disarmed();
        timer.arm(Duration::from_secs(1));

        let before = Instant::now();
        timer.fired().await;
        assert!(Instant::now() - before >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_extends_deadline() {
        let mut timer = OneShot::disarmed();
        timer.arm(Duration::from_secs(1));
        tokio::time::advance(Duration::from_millis(900)).await;
        timer.arm(Duration::from_secs(1));

        let fired = tokio::time::timeout(Duration::from_millis(500), timer.fired()).await;
        assert!(fired.is_err(), "timer fired before the extended deadline");
        timer.fired().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_never_fires() {
        let timer = OneShot::disarmed();
        let fired = tokio::time::timeout(Duration::from_secs(60), timer.fired()).await;
        assert!(fired.is_err());
    }
}
