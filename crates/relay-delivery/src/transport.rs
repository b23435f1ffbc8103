//! Collaborator contract for the chat platform send primitives.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::delivery_types::{DeliveryTarget, OutboundFile, SentMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// How a proxy-identity send is invoked.
pub enum ProxyInvocationMode {
    /// Full payload: display name as given, avatar, files and embeds.
    Primary,
    /// Retry shape: sanitized display name and no embeds.
    Compat,
}

impl ProxyInvocationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Compat => "compat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// Message sent under an impersonated display name and avatar.
pub struct ProxyMessage {
    pub content: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub thread_id: Option<String>,
    pub files: Vec<OutboundFile>,
    pub embeds: Vec<Value>,
    pub mode: ProxyInvocationMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// Message sent as the bot itself.
pub struct DirectMessage {
    pub content: String,
    pub files: Vec<OutboundFile>,
    pub embeds: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("reason_code={reason_code} retryable={retryable} detail={detail}")]
/// One failed backend send.
pub struct BackendSendError {
    pub reason_code: String,
    pub detail: String,
    pub retryable: bool,
    pub http_status: Option<u16>,
}

impl BackendSendError {
    pub fn new(reason_code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.into(),
            detail: detail.into(),
            retryable: false,
            http_status: None,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }
}

#[async_trait]
/// Trait contract for `ChannelTransport` behavior.
pub trait ChannelTransport: Send + Sync {
    async fn send_proxy_identity(
        &self,
        target: &DeliveryTarget,
        message: ProxyMessage,
    ) -> Result<SentMessage, BackendSendError>;

    async fn send_direct(
        &self,
        target: &DeliveryTarget,
        message: DirectMessage,
    ) -> Result<SentMessage, BackendSendError>;
}
