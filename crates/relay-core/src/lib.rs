//! Foundational time and synchronisation utilities shared across relay crates.
//!
//! Provides the injectable [`Clock`]/[`TimerScheduler`] seams, the tokio-backed
//! production implementations, a deterministic [`ManualTimers`] double, and
//! small helpers for expiry arithmetic and poisoned-lock recovery.

pub mod manual_time;
pub mod sync;
pub mod time_utils;
pub mod timers;

pub use manual_time::ManualTimers;
pub use sync::lock_or_recover;
pub use time_utils::{current_unix_timestamp_ms, duration_to_ms, elapsed_ms, is_expired_unix_ms};
pub use timers::{
    Clock, SystemClock, TimeContext, TimerHandle, TimerScheduler, TimerTask, TokioTimers,
};
