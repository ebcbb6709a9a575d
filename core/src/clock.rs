pub mod system_clock;
pub mod virtual_clock;

pub use system_clock::SystemClock;
pub use virtual_clock::VirtualClock;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::fmt::Debug;
use std::ops::Deref;
use std::time::Duration;

/// [`SchedulerClock`] is the seam through which the tick loop and every `next_run`
/// computation observe time. Typical operations include getting the current local
/// time and idling between ticks
///
/// # Required Methods
/// When implementing the [`SchedulerClock`], one must provide implementations for two
/// methods, those being [`SchedulerClock::now`] and [`SchedulerClock::idle`], the former
/// is used to get the current wall-clock time while the latter parks the caller for a
/// given duration
///
/// # Trait Implementation(s)
/// Specifically, there are 2 noteworthy implementations to list, those being:
///
/// - [`SystemClock`] the default go-to clock, it automatically goes forward and idles by
///   sleeping on the runtime timer
///
/// - [`VirtualClock`] used to simulate time (for unit tests, replaying scheduling
///   scenarios... etc.), it doesn't go forward without explicit advancing and implements
///   the [`AdvanceableClock`] extension trait
///
/// # See Also
/// - [`SystemClock`]
/// - [`VirtualClock`]
/// - [`AdvanceableClock`]
#[async_trait]
pub trait SchedulerClock: Debug + Send + Sync {
    /// Gets the current time of the clock as local wall-clock time, the representation
    /// every cron computation in the crate works in
    async fn now(&self) -> DateTime<Local>;

    /// Parks the caller for the given duration as measured by this clock
    async fn idle(&self, duration: Duration);
}

#[async_trait]
impl<T> SchedulerClock for T
where
    T: Deref + Send + Sync + Debug,
    T::Target: SchedulerClock,
{
    async fn now(&self) -> DateTime<Local> {
        self.deref().now().await
    }

    async fn idle(&self, duration: Duration) {
        self.deref().idle(duration).await
    }
}

/// [`AdvanceableClock`] is an optional extension to [`SchedulerClock`] which, as the
/// name suggests, allows for arbitrary advancement of time. Clocks that follow the real
/// world (such as [`SystemClock`]) cannot support it, as such why it is a separate trait
///
/// # See Also
/// - [`SchedulerClock`]
/// - [`VirtualClock`]
#[async_trait]
pub trait AdvanceableClock: SchedulerClock {
    /// Advance the time by a specified duration forward, waking anything idling on
    /// an instant the advancement passes
    async fn advance(&self, duration: Duration) {
        let now = self.now().await;
        let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        self.advance_to(now + delta).await
    }

    /// Advance the time to a specific instant. Advancing backwards is a no-op
    async fn advance_to(&self, to: DateTime<Local>);
}

#[async_trait]
impl<T> AdvanceableClock for T
where
    T: Deref + Send + Sync + Debug,
    T::Target: AdvanceableClock,
{
    async fn advance(&self, duration: Duration) {
        self.deref().advance(duration).await
    }

    async fn advance_to(&self, to: DateTime<Local>) {
        self.deref().advance_to(to).await
    }
}
