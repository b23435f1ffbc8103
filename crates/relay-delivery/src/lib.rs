//! Paced, chunked delivery of responses across proxy-identity, thread and
//! direct-message channels.
//!
//! [`ChunkedDeliveryEngine`] splits a response into platform-sized chunks,
//! waits on [`DeliveryThrottler`] pacing, and walks each backend's ordered
//! strategy list until one send succeeds. The chat platform itself sits
//! behind the [`ChannelTransport`] trait.

pub mod backends;
pub mod chunking;
pub mod delivery_types;
pub mod engine;
pub mod recent_sends;
pub mod recording_transport;
pub mod throttle;
pub mod transport;

pub use backends::{
    backend_for_target, format_direct_content, sanitize_display_name, DeliveryBackend,
    DirectMessageBackend, ProxyIdentityBackend, SendStrategy, StrategyFailure, ThreadBackend,
};
pub use chunking::{build_message_chunks, split_message_content, MIN_CHUNK_CHARS};
pub use delivery_types::*;
pub use engine::{
    ChunkedDeliveryEngine, DeliveryError, EngineConfig, DEFAULT_CHUNK_DELAY_MS,
    DEFAULT_MEDIA_FOLLOWUP_DELAY_MS,
};
pub use recent_sends::{RecentSendCache, DEFAULT_DUPLICATE_WINDOW_MS};
pub use recording_transport::{RecordedOutcome, RecordedSend, RecordingTransport};
pub use throttle::{
    DeliveryThrottler, PendingMessageMarker, ThrottleConfig, DEFAULT_MAX_ERROR_WAIT_MS,
    DEFAULT_MIN_MESSAGE_DELAY_MS,
};
pub use transport::{
    BackendSendError, ChannelTransport, DirectMessage, ProxyInvocationMode, ProxyMessage,
};
