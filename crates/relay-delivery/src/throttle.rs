//! Per-destination pacing and "response in progress" markers.
//!
//! Two pieces of state live here:
//! - pending-message markers keyed by `(personality, channel)`, which let a
//!   failing request see that a slower request for the same pair is still
//!   producing a response;
//! - the last successful send time per channel, which spaces consecutive
//!   responses by at least `min_message_delay_ms`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_core::{elapsed_ms, lock_or_recover, TimeContext, TimerHandle};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_MIN_MESSAGE_DELAY_MS: u64 = 3_000;
pub const DEFAULT_MAX_ERROR_WAIT_MS: u64 = 15_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub min_message_delay_ms: u64,
    pub max_error_wait_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_message_delay_ms: DEFAULT_MIN_MESSAGE_DELAY_MS,
            max_error_wait_ms: DEFAULT_MAX_ERROR_WAIT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessageMarker {
    pub registered_at_ms: u64,
    pub request_id: String,
}

type MarkerKey = (String, String);

fn marker_key(personality: &str, channel_id: &str) -> MarkerKey {
    (personality.trim().to_lowercase(), channel_id.to_string())
}

#[derive(Default)]
struct ThrottleState {
    markers: HashMap<MarkerKey, PendingMessageMarker>,
    channel_last_sent_ms: HashMap<String, u64>,
}

struct ExpiryTimer {
    request_id: String,
    _handle: TimerHandle,
}

type ExpiryTimers = Arc<Mutex<HashMap<MarkerKey, ExpiryTimer>>>;

pub struct DeliveryThrottler {
    config: ThrottleConfig,
    time: TimeContext,
    state: Arc<Mutex<ThrottleState>>,
    expiry_timers: ExpiryTimers,
}

impl DeliveryThrottler {
    pub fn new(config: ThrottleConfig, time: TimeContext) -> Self {
        Self {
            config,
            time,
            state: Arc::new(Mutex::new(ThrottleState::default())),
            expiry_timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> ThrottleConfig {
        self.config
    }

    /// True while a marker exists for the pair and is younger than
    /// `max_error_wait_ms`. Expired markers are purged here.
    pub fn has_pending_message(&self, personality: &str, channel_id: &str) -> bool {
        let key = marker_key(personality, channel_id);
        let now_ms = self.time.now_ms();
        let mut state = lock_or_recover(&self.state);
        let Some(marker) = state.markers.get(&key) else {
            return false;
        };
        if elapsed_ms(marker.registered_at_ms, now_ms) < self.config.max_error_wait_ms {
            return true;
        }
        state.markers.remove(&key);
        drop(state);
        lock_or_recover(&self.expiry_timers).remove(&key);
        false
    }

    pub fn pending_marker(&self, personality: &str, channel_id: &str) -> Option<PendingMessageMarker> {
        let key = marker_key(personality, channel_id);
        lock_or_recover(&self.state).markers.get(&key).cloned()
    }

    /// Inserts or overwrites the marker and re-arms its expiry timer.
    pub fn register_pending_message(&self, personality: &str, channel_id: &str, request_id: &str) {
        let key = marker_key(personality, channel_id);
        let registered_at_ms = self.time.now_ms();
        lock_or_recover(&self.state).markers.insert(
            key.clone(),
            PendingMessageMarker {
                registered_at_ms,
                request_id: request_id.to_string(),
            },
        );

        let state = Arc::downgrade(&self.state);
        let expiry_timers = Arc::downgrade(&self.expiry_timers);
        let expiring_key = key.clone();
        let expiring_request_id = request_id.to_string();
        let timer = self.time.timers.schedule_once(
            Duration::from_millis(self.config.max_error_wait_ms),
            Arc::new(move || {
                let Some(state) = state.upgrade() else {
                    return;
                };
                {
                    let mut state = lock_or_recover(&state);
                    if state
                        .markers
                        .get(&expiring_key)
                        .is_some_and(|marker| marker.request_id == expiring_request_id)
                    {
                        state.markers.remove(&expiring_key);
                        debug!(
                            personality = %expiring_key.0,
                            channel_id = %expiring_key.1,
                            request_id = %expiring_request_id,
                            "pending message marker expired"
                        );
                    }
                }
                // A re-registration owns the slot under a newer request id.
                if let Some(expiry_timers) = expiry_timers.upgrade() {
                    let mut expiry_timers = lock_or_recover(&expiry_timers);
                    if expiry_timers
                        .get(&expiring_key)
                        .is_some_and(|timer| timer.request_id == expiring_request_id)
                    {
                        expiry_timers.remove(&expiring_key);
                    }
                }
            }),
        );
        // Replacing the entry drops the previous handle, which cancels it.
        lock_or_recover(&self.expiry_timers).insert(
            key,
            ExpiryTimer {
                request_id: request_id.to_string(),
                _handle: timer,
            },
        );
        debug!(personality, channel_id, request_id, "registered pending message marker");
    }

    /// Removes the marker when `request_id` is `None` or matches the stored
    /// one. Returns whether a marker was removed.
    pub fn clear_pending_message(
        &self,
        personality: &str,
        channel_id: &str,
        request_id: Option<&str>,
    ) -> bool {
        let key = marker_key(personality, channel_id);
        let removed = {
            let mut state = lock_or_recover(&self.state);
            let matches = state.markers.get(&key).is_some_and(|marker| {
                request_id.map_or(true, |request_id| marker.request_id == request_id)
            });
            if matches {
                state.markers.remove(&key);
            }
            matches
        };
        if removed {
            lock_or_recover(&self.expiry_timers).remove(&key);
        } else if request_id.is_some() {
            debug!(
                personality,
                channel_id, "ignored stale pending message clear for a newer request"
            );
        }
        removed
    }

    /// Number of armed marker expiry timers.
    pub fn expiry_timer_count(&self) -> usize {
        lock_or_recover(&self.expiry_timers).len()
    }

    /// Milliseconds to wait before the next send to `channel_id`.
    pub fn calculate_message_delay(&self, channel_id: &str) -> u64 {
        let now_ms = self.time.now_ms();
        let state = lock_or_recover(&self.state);
        match state.channel_last_sent_ms.get(channel_id) {
            Some(last_sent_ms) => self
                .config
                .min_message_delay_ms
                .saturating_sub(elapsed_ms(*last_sent_ms, now_ms)),
            None => 0,
        }
    }

    /// Records a successful send. Call once per delivered message, never per
    /// attempt.
    pub fn update_channel_last_message_time(&self, channel_id: &str) {
        let now_ms = self.time.now_ms();
        lock_or_recover(&self.state)
            .channel_last_sent_ms
            .insert(channel_id.to_string(), now_ms);
    }

    pub fn clear(&self) {
        {
            let mut state = lock_or_recover(&self.state);
            state.markers.clear();
            state.channel_last_sent_ms.clear();
        }
        lock_or_recover(&self.expiry_timers).clear();
    }
}
