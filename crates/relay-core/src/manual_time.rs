//! Deterministic virtual clock and timer scheduler for tests and dry runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::sync::lock_or_recover;
use crate::time_utils::duration_to_ms;
use crate::timers::{Clock, TimeContext, TimerHandle, TimerScheduler, TimerTask};

struct ManualTimer {
    id: u64,
    due_ms: u64,
    period_ms: Option<u64>,
    task: TimerTask,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct ManualTimerState {
    now_ms: u64,
    next_id: u64,
    timers: Vec<ManualTimer>,
    sleeps: Vec<Duration>,
}

/// Virtual time source. Time only moves through [`ManualTimers::advance`] or
/// [`TimerScheduler::sleep`], and due timers fire in deadline order while it
/// moves.
pub struct ManualTimers {
    state: Mutex<ManualTimerState>,
}

impl ManualTimers {
    pub fn new() -> Arc<Self> {
        Self::starting_at(0)
    }

    pub fn starting_at(now_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManualTimerState {
                now_ms,
                ..ManualTimerState::default()
            }),
        })
    }

    /// Builds a [`TimeContext`] whose clock and timers both read this instance.
    pub fn context(self: &Arc<Self>) -> TimeContext {
        TimeContext::new(self.clone(), self.clone())
    }

    pub fn advance(&self, duration: Duration) {
        self.advance_ms(duration_to_ms(duration));
    }

    pub fn advance_ms(&self, millis: u64) {
        let target = {
            let state = lock_or_recover(&self.state);
            state.now_ms.saturating_add(millis)
        };
        loop {
            let due_task = {
                let mut state = lock_or_recover(&self.state);
                state
                    .timers
                    .retain(|timer| !timer.cancelled.load(Ordering::SeqCst));
                let next = state
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, timer)| timer.due_ms <= target)
                    .min_by_key(|(_, timer)| (timer.due_ms, timer.id))
                    .map(|(index, _)| index);
                match next {
                    Some(index) => {
                        let due_ms = state.timers[index].due_ms;
                        state.now_ms = state.now_ms.max(due_ms);
                        let task = Arc::clone(&state.timers[index].task);
                        match state.timers[index].period_ms {
                            Some(period_ms) => {
                                state.timers[index].due_ms = due_ms.saturating_add(period_ms);
                            }
                            None => {
                                state.timers.remove(index);
                            }
                        }
                        Some(task)
                    }
                    None => {
                        state.now_ms = state.now_ms.max(target);
                        None
                    }
                }
            };
            match due_task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Number of armed, uncancelled timers.
    pub fn pending_timers(&self) -> usize {
        let state = lock_or_recover(&self.state);
        state
            .timers
            .iter()
            .filter(|timer| !timer.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        lock_or_recover(&self.state).sleeps.clone()
    }

    fn arm(&self, delay_ms: u64, period_ms: Option<u64>, task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut state = lock_or_recover(&self.state);
            let id = state.next_id;
            state.next_id = state.next_id.saturating_add(1);
            let due_ms = state.now_ms.saturating_add(delay_ms);
            state.timers.push(ManualTimer {
                id,
                due_ms,
                period_ms,
                task,
                cancelled: Arc::clone(&cancelled),
            });
        }
        TimerHandle::new(move || cancelled.store(true, Ordering::SeqCst))
    }
}

impl Clock for ManualTimers {
    fn now_ms(&self) -> u64 {
        lock_or_recover(&self.state).now_ms
    }
}

#[async_trait]
impl TimerScheduler for ManualTimers {
    fn schedule_once(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        self.arm(duration_to_ms(delay), None, task)
    }

    fn schedule_repeating(&self, period: Duration, task: TimerTask) -> TimerHandle {
        let period_ms = duration_to_ms(period).max(1);
        self.arm(period_ms, Some(period_ms), task)
    }

    async fn sleep(&self, duration: Duration) {
        lock_or_recover(&self.state).sleeps.push(duration);
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::ManualTimers;
    use crate::timers::{Clock, TimerScheduler};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Arc<dyn Fn() + Send + Sync>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let make = move |label: &str| {
            let sink = Arc::clone(&sink);
            let label = label.to_string();
            Arc::new(move || sink.lock().expect("events lock").push(label.clone()))
                as Arc<dyn Fn() + Send + Sync>
        };
        (events, make)
    }

    #[test]
    fn unit_advance_moves_clock_forward() {
        let timers = ManualTimers::starting_at(1_000);
        timers.advance(Duration::from_millis(250));
        assert_eq!(timers.now_ms(), 1_250);
    }

    #[test]
    fn functional_advance_fires_due_timers_in_deadline_order() {
        let timers = ManualTimers::new();
        let (events, make) = recorder();
        let _late = timers.schedule_once(Duration::from_millis(300), make("late"));
        let _early = timers.schedule_once(Duration::from_millis(100), make("early"));
        let _beyond = timers.schedule_once(Duration::from_millis(900), make("beyond"));

        timers.advance(Duration::from_millis(500));

        assert_eq!(
            *events.lock().expect("events lock"),
            vec!["early".to_string(), "late".to_string()]
        );
        assert_eq!(timers.now_ms(), 500);
        assert_eq!(timers.pending_timers(), 1);
    }

    #[test]
    fn functional_repeating_timer_fires_every_period() {
        let timers = ManualTimers::new();
        let (events, make) = recorder();
        let _tick = timers.schedule_repeating(Duration::from_millis(100), make("tick"));
        timers.advance(Duration::from_millis(350));
        assert_eq!(events.lock().expect("events lock").len(), 3);
    }

    #[test]
    fn regression_dropped_handle_cancels_timer() {
        let timers = ManualTimers::new();
        let (events, make) = recorder();
        let handle = timers.schedule_once(Duration::from_millis(10), make("cancelled"));
        drop(handle);
        timers.advance(Duration::from_millis(20));
        assert!(events.lock().expect("events lock").is_empty());
        assert_eq!(timers.pending_timers(), 0);
    }

    #[tokio::test]
    async fn functional_sleep_records_duration_and_advances_clock() {
        let timers = ManualTimers::starting_at(10);
        timers.sleep(Duration::from_millis(750)).await;
        assert_eq!(timers.now_ms(), 760);
        assert_eq!(timers.recorded_sleeps(), vec![Duration::from_millis(750)]);
    }
}
