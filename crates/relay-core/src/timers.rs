//! Injectable clock and timer seams.
//!
//! Pipeline components never call `tokio::time` or `SystemTime` directly. They
//! receive a [`TimeContext`] so production code runs on tokio timers while
//! tests drive a [`crate::ManualTimers`] instance deterministically.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::time_utils::current_unix_timestamp_ms;

/// Callback fired by a scheduled timer.
pub type TimerTask = Arc<dyn Fn() + Send + Sync>;

/// Source of "now" in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[async_trait]
/// Trait contract for one-shot, repeating and sleeping timers.
pub trait TimerScheduler: Send + Sync {
    /// Runs `task` once after `delay`. Dropping the handle cancels the timer.
    fn schedule_once(&self, delay: Duration, task: TimerTask) -> TimerHandle;

    /// Runs `task` every `period`, first firing one period from now.
    fn schedule_repeating(&self, period: Duration, task: TimerTask) -> TimerHandle;

    async fn sleep(&self, duration: Duration);
}

/// Cancellation handle for a scheduled timer.
///
/// The timer is cancelled when the handle is dropped or [`TimerHandle::cancel`]
/// is called, whichever comes first.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel, used when no timer could be armed.
    pub fn inert() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Wall clock backed by `SystemTime`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        current_unix_timestamp_ms()
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Timer scheduler backed by the ambient tokio runtime.
pub struct TokioTimers;

impl TokioTimers {
    fn spawn(&self, future: impl std::future::Future<Output = ()> + Send + 'static) -> TimerHandle {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let join = runtime.spawn(future);
                TimerHandle::new(move || join.abort())
            }
            Err(_) => {
                tracing::warn!("timer requested outside a tokio runtime; timer not armed");
                TimerHandle::inert()
            }
        }
    }
}

#[async_trait]
impl TimerScheduler for TokioTimers {
    fn schedule_once(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        })
    }

    fn schedule_repeating(&self, period: Duration, task: TimerTask) -> TimerHandle {
        let period = period.max(Duration::from_millis(1));
        self.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                task();
            }
        })
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        tokio::time::sleep(duration).await;
    }
}

#[derive(Clone)]
/// Clock plus timers handed to every pipeline component.
pub struct TimeContext {
    pub clock: Arc<dyn Clock>,
    pub timers: Arc<dyn TimerScheduler>,
}

impl TimeContext {
    pub fn new(clock: Arc<dyn Clock>, timers: Arc<dyn TimerScheduler>) -> Self {
        Self { clock, timers }
    }

    /// Wall clock with tokio timers.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(TokioTimers))
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub async fn sleep_ms(&self, millis: u64) {
        if millis == 0 {
            return;
        }
        self.timers.sleep(Duration::from_millis(millis)).await;
    }
}

impl Default for TimeContext {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for TimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeContext")
            .field("now_ms", &self.clock.now_ms())
            .finish()
    }
}
