use crate::clock::SchedulerClock;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::time::Duration;

/// [`SystemClock`] is the default implementation of the [`SchedulerClock`] trait, it
/// reports the operating system's wall-clock time and idles by sleeping on the tokio
/// timer
///
/// # Usage Note(s)
/// This is the clock every production orchestrator should run on. For tests and
/// simulations prefer [`VirtualClock`](crate::clock::VirtualClock), which only moves
/// when explicitly advanced
///
/// # See Also
/// - [`SchedulerClock`]
/// - [`VirtualClock`](crate::clock::VirtualClock)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl SchedulerClock for SystemClock {
    async fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    async fn idle(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
