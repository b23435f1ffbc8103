use futures_util::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_REQUEST_TTL_MS: u64 = 30_000;
pub const DEFAULT_ERROR_BLACKOUT_MS: u64 = 60_000;
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Caller context fields that change generation output and therefore take part
/// in the request signature.
pub struct RequestContext {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    /// Whether the caller holds a per-user auth token. The token itself never
    /// enters the signature.
    #[serde(default)]
    pub has_user_auth: bool,
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedResponse {
    pub text: String,
}

impl GeneratedResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Failure reported by the generation collaborator.
///
/// Cloneable so a shared in-flight handle can hand the same failure to every
/// waiter.
pub enum GenerationError {
    #[error("generation failed: {0}")]
    Failed(String),
    #[error("generation returned an empty response")]
    EmptyResponse,
}

/// Shareable in-flight generation call. Every clone resolves to the same
/// outcome and the wrapped generation runs at most once.
pub type GenerationHandle = Shared<BoxFuture<'static, Result<GeneratedResponse, GenerationError>>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DedupError {
    #[error("request {signature} is in error blackout for another {retry_after_ms}ms")]
    Blackout {
        signature: String,
        retry_after_ms: u64,
    },
}

impl DedupError {
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            Self::Blackout { retry_after_ms, .. } => *retry_after_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Age after which an unsettled pending request is considered leaked.
    pub request_ttl_ms: u64,
    pub error_blackout_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            request_ttl_ms: DEFAULT_REQUEST_TTL_MS,
            error_blackout_ms: DEFAULT_ERROR_BLACKOUT_MS,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
        }
    }
}

#[derive(Clone)]
/// Result of the atomic check-or-register path.
pub enum DedupTicket {
    /// Another caller already owns the generation for this signature.
    Existing {
        signature: String,
        handle: GenerationHandle,
    },
    /// This caller registered the generation and is responsible for delivery.
    Registered {
        signature: String,
        handle: GenerationHandle,
    },
}

impl DedupTicket {
    pub fn signature(&self) -> &str {
        match self {
            Self::Existing { signature, .. } | Self::Registered { signature, .. } => signature,
        }
    }

    pub fn handle(&self) -> GenerationHandle {
        match self {
            Self::Existing { handle, .. } | Self::Registered { handle, .. } => handle.clone(),
        }
    }

    pub fn is_existing(&self) -> bool {
        matches!(self, Self::Existing { .. })
    }
}

impl std::fmt::Debug for DedupTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_existing() {
            "existing"
        } else {
            "registered"
        };
        f.debug_struct("DedupTicket")
            .field("kind", &kind)
            .field("signature", &self.signature())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub expired_pending: usize,
    pub expired_blackouts: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.expired_pending == 0 && self.expired_blackouts == 0
    }
}
