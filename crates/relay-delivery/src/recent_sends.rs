//! Short-lived memory of delivered chunk texts, used to skip re-sending the
//! same text from the same sender into the same channel.

use std::collections::HashMap;
use std::sync::Mutex;

use relay_core::{elapsed_ms, lock_or_recover, TimeContext};
use sha2::{Digest, Sha256};

pub const DEFAULT_DUPLICATE_WINDOW_MS: u64 = 5_000;

type RecentSendKey = (String, String, String);

fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.trim().as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn recent_send_key(channel_id: &str, display_name: &str, text: &str) -> RecentSendKey {
    (
        channel_id.to_string(),
        display_name.to_string(),
        content_hash(text),
    )
}

pub struct RecentSendCache {
    window_ms: u64,
    time: TimeContext,
    entries: Mutex<HashMap<RecentSendKey, u64>>,
}

impl RecentSendCache {
    pub fn new(window_ms: u64, time: TimeContext) -> Self {
        Self {
            window_ms,
            time,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// True when the same text was recorded for the sender and channel within
    /// the window. Evicts expired entries as a side effect.
    pub fn is_recent_duplicate(&self, channel_id: &str, display_name: &str, text: &str) -> bool {
        if self.window_ms == 0 || text.trim().is_empty() {
            return false;
        }
        let now_ms = self.time.now_ms();
        let key = recent_send_key(channel_id, display_name, text);
        let mut entries = lock_or_recover(&self.entries);
        entries.retain(|_, sent_at_ms| elapsed_ms(*sent_at_ms, now_ms) < self.window_ms);
        entries.contains_key(&key)
    }

    pub fn record(&self, channel_id: &str, display_name: &str, text: &str) {
        if self.window_ms == 0 || text.trim().is_empty() {
            return;
        }
        let now_ms = self.time.now_ms();
        lock_or_recover(&self.entries).insert(recent_send_key(channel_id, display_name, text), now_ms);
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_or_recover(&self.entries).clear();
    }
}

#[cfg(test)]
mod tests {
    use relay_core::ManualTimers;

    use super::RecentSendCache;

    #[test]
    fn functional_duplicate_window_expires() {
        let timers = ManualTimers::new();
        let cache = RecentSendCache::new(5_000, timers.context());
        assert!(!cache.is_recent_duplicate("c1", "Lilith", "hello"));
        cache.record("c1", "Lilith", "hello");
        assert!(cache.is_recent_duplicate("c1", "Lilith", "hello"));
        assert!(cache.is_recent_duplicate("c1", "Lilith", "hello  "));

        timers.advance_ms(4_999);
        assert!(cache.is_recent_duplicate("c1", "Lilith", "hello"));
        timers.advance_ms(1);
        assert!(!cache.is_recent_duplicate("c1", "Lilith", "hello"));
        assert!(cache.is_empty());
    }

    #[test]
    fn unit_duplicate_key_includes_channel_and_sender() {
        let timers = ManualTimers::new();
        let cache = RecentSendCache::new(5_000, timers.context());
        cache.record("c1", "Lilith", "hello");
        assert!(!cache.is_recent_duplicate("c2", "Lilith", "hello"));
        assert!(!cache.is_recent_duplicate("c1", "Adam", "hello"));
        assert!(!cache.is_recent_duplicate("c1", "Lilith", "goodbye"));
    }

    #[test]
    fn unit_zero_window_disables_filter() {
        let timers = ManualTimers::new();
        let cache = RecentSendCache::new(0, timers.context());
        cache.record("c1", "Lilith", "hello");
        assert!(!cache.is_recent_duplicate("c1", "Lilith", "hello"));
        assert!(cache.is_empty());
    }
}
