use crate::clock::{AdvanceableClock, SchedulerClock};
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// [`VirtualClock`] is an implementation of the [`SchedulerClock`] trait, it acts as a
/// mock object, allowing to simulate time without the waiting around. This is what every
/// deterministic scheduling test in the crate runs on
///
/// Unlike [`SystemClock`](crate::clock::SystemClock), this clock doesn't move forward on
/// its own, rather it needs explicit calls to the advance methods ([`VirtualClock`]
/// implements the [`AdvanceableClock`] extension trait), which makes it predictable at
/// any point throughout the program
///
/// # Constructor(s)
/// When constructing a [`VirtualClock`], one can use a variety of constructor methods,
/// those being:
/// - [`VirtualClock::new`] For creating one from an initial [`DateTime<Local>`]
/// - [`VirtualClock::from_millis`] For creating one from epoch milliseconds
/// - [`VirtualClock::from_current_time`] For creating one frozen at the current time
///
/// # Trait Implementation(s)
/// It is clear as day that [`VirtualClock`] implements the [`SchedulerClock`], but it
/// also implements the [`AdvanceableClock`] extension trait and the [`Debug`] trait
///
/// # See Also
/// - [`SchedulerClock`]
/// - [`AdvanceableClock`]
pub struct VirtualClock {
    epoch_millis: AtomicI64,
    notify: Notify,
}

impl VirtualClock {
    pub fn new(initial: DateTime<Local>) -> Self {
        Self {
            epoch_millis: AtomicI64::new(initial.timestamp_millis()),
            notify: Notify::new(),
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self {
            epoch_millis: AtomicI64::new(millis),
            notify: Notify::new(),
        }
    }

    pub fn from_current_time() -> Self {
        Self::new(Local::now())
    }

    fn current(&self) -> DateTime<Local> {
        let millis = self.epoch_millis.load(Ordering::Acquire);
        match Local.timestamp_millis_opt(millis) {
            chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt,
            chrono::LocalResult::None => Local::now(),
        }
    }
}

impl Debug for VirtualClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualClock")
            .field("now", &self.current())
            .finish()
    }
}

#[async_trait]
impl SchedulerClock for VirtualClock {
    async fn now(&self) -> DateTime<Local> {
        self.current()
    }

    async fn idle(&self, duration: Duration) {
        let target = self.epoch_millis.load(Ordering::Acquire) + duration.as_millis() as i64;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking, so an advance between the check and the
            // await cannot be lost.
            notified.as_mut().enable();
            if self.epoch_millis.load(Ordering::Acquire) >= target {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl AdvanceableClock for VirtualClock {
    async fn advance_to(&self, to: DateTime<Local>) {
        let target = to.timestamp_millis();
        self.epoch_millis.fetch_max(target, Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}
