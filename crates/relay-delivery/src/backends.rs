//! Delivery backends and their ordered fallback strategies.
//!
//! Each backend maps a chunk onto an ordered list of [`SendStrategy`] values.
//! The engine tries them in order and stops at the first success.

use async_trait::async_trait;
use serde::Serialize;

use crate::delivery_types::{ChannelKind, DeliveryTarget, MessageChunk, Persona, SentMessage};
use crate::transport::{
    BackendSendError, ChannelTransport, DirectMessage, ProxyInvocationMode, ProxyMessage,
};

/// Longest display name accepted for proxy-identity sends.
pub const MAX_PROXY_DISPLAY_NAME_CHARS: usize = 80;
const RESERVED_DISPLAY_NAME_TERMS: [&str; 2] = ["discord", "clyde"];
const FALLBACK_DISPLAY_NAME: &str = "Assistant";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", content = "mode", rename_all = "snake_case")]
pub enum SendStrategy {
    ProxyIdentity(ProxyInvocationMode),
    /// Plain channel send with the display name inlined in bold.
    DirectFormatted,
}

impl SendStrategy {
    pub fn label(self) -> &'static str {
        match self {
            Self::ProxyIdentity(ProxyInvocationMode::Primary) => "proxy_identity_primary",
            Self::ProxyIdentity(ProxyInvocationMode::Compat) => "proxy_identity_compat",
            Self::DirectFormatted => "direct_formatted",
        }
    }
}

const PROXY_STRATEGIES: [SendStrategy; 3] = [
    SendStrategy::ProxyIdentity(ProxyInvocationMode::Primary),
    SendStrategy::ProxyIdentity(ProxyInvocationMode::Compat),
    SendStrategy::DirectFormatted,
];
const DIRECT_MESSAGE_STRATEGIES: [SendStrategy; 1] = [SendStrategy::DirectFormatted];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyFailure {
    pub strategy: SendStrategy,
    pub error: BackendSendError,
}

/// Renders `"**DisplayName:** <text>"`, or just the bold name for text-less
/// chunks.
pub fn format_direct_content(display_name: &str, text: &str) -> String {
    if text.is_empty() {
        format!("**{display_name}:**")
    } else {
        format!("**{display_name}:** {text}")
    }
}

/// Coerces a display name into the platform's proxy-name rules.
pub fn sanitize_display_name(display_name: &str) -> String {
    let mut sanitized = display_name.trim().to_string();
    for term in RESERVED_DISPLAY_NAME_TERMS {
        sanitized = replace_case_insensitive(&sanitized, term);
    }
    let sanitized: String = sanitized
        .trim()
        .chars()
        .take(MAX_PROXY_DISPLAY_NAME_CHARS)
        .collect();
    if sanitized.trim().is_empty() {
        FALLBACK_DISPLAY_NAME.to_string()
    } else {
        sanitized.trim().to_string()
    }
}

fn replace_case_insensitive(haystack: &str, term: &str) -> String {
    let lowered = haystack.to_lowercase();
    if lowered.len() != haystack.len() || !lowered.contains(term) {
        return haystack.to_string();
    }
    let mut output = String::with_capacity(haystack.len());
    let mut cursor = 0usize;
    while let Some(offset) = lowered[cursor..].find(term) {
        let found = cursor + offset;
        output.push_str(&haystack[cursor..found]);
        // Break the reserved word with a zero-width space so it still reads
        // the same.
        let original = &haystack[found..found + term.len()];
        let mut chars = original.chars();
        if let Some(first) = chars.next() {
            output.push(first);
            output.push('\u{200b}');
            output.push_str(chars.as_str());
        }
        cursor = found + term.len();
    }
    output.push_str(&haystack[cursor..]);
    output
}

#[async_trait]
/// Trait contract for `DeliveryBackend` behavior.
pub trait DeliveryBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ordered fallback chain for one chunk.
    fn strategies(&self) -> &'static [SendStrategy];

    /// Whether media references ride inline on the last chunk. Backends that
    /// return false deliver media as follow-up messages.
    fn inlines_media(&self) -> bool {
        true
    }

    async fn attempt(
        &self,
        transport: &dyn ChannelTransport,
        target: &DeliveryTarget,
        persona: &Persona,
        chunk: &MessageChunk,
        strategy: SendStrategy,
    ) -> Result<SentMessage, BackendSendError>;
}

fn proxy_message(
    persona: &Persona,
    chunk: &MessageChunk,
    mode: ProxyInvocationMode,
    thread_id: Option<&str>,
) -> ProxyMessage {
    match mode {
        ProxyInvocationMode::Primary => ProxyMessage {
            content: chunk.text.clone(),
            display_name: persona.display_name.clone(),
            avatar_url: persona.avatar_url.clone(),
            thread_id: thread_id.map(str::to_string),
            files: chunk.files.clone(),
            embeds: chunk.embeds.clone(),
            mode,
        },
        ProxyInvocationMode::Compat => ProxyMessage {
            content: chunk.text.clone(),
            display_name: sanitize_display_name(&persona.display_name),
            avatar_url: persona.avatar_url.clone(),
            thread_id: thread_id.map(str::to_string),
            files: chunk.files.clone(),
            embeds: Vec::new(),
            mode,
        },
    }
}

fn direct_formatted_message(persona: &Persona, chunk: &MessageChunk) -> DirectMessage {
    DirectMessage {
        content: format_direct_content(&persona.display_name, &chunk.text),
        files: chunk.files.clone(),
        embeds: chunk.embeds.clone(),
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Guild channels: proxy identity, compat retry, then a formatted direct send.
pub struct ProxyIdentityBackend;

#[async_trait]
impl DeliveryBackend for ProxyIdentityBackend {
    fn name(&self) -> &'static str {
        "proxy_identity"
    }

    fn strategies(&self) -> &'static [SendStrategy] {
        &PROXY_STRATEGIES
    }

    async fn attempt(
        &self,
        transport: &dyn ChannelTransport,
        target: &DeliveryTarget,
        persona: &Persona,
        chunk: &MessageChunk,
        strategy: SendStrategy,
    ) -> Result<SentMessage, BackendSendError> {
        match strategy {
            SendStrategy::ProxyIdentity(mode) => {
                transport
                    .send_proxy_identity(target, proxy_message(persona, chunk, mode, None))
                    .await
            }
            SendStrategy::DirectFormatted => {
                transport
                    .send_direct(target, direct_formatted_message(persona, chunk))
                    .await
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Threads: the proxy-identity chain scoped to the thread id.
pub struct ThreadBackend;

#[async_trait]
impl DeliveryBackend for ThreadBackend {
    fn name(&self) -> &'static str {
        "thread"
    }

    fn strategies(&self) -> &'static [SendStrategy] {
        &PROXY_STRATEGIES
    }

    async fn attempt(
        &self,
        transport: &dyn ChannelTransport,
        target: &DeliveryTarget,
        persona: &Persona,
        chunk: &MessageChunk,
        strategy: SendStrategy,
    ) -> Result<SentMessage, BackendSendError> {
        let thread_id = target.thread_id().ok_or_else(|| {
            BackendSendError::new(
                "delivery_thread_id_missing",
                format!(
                    "thread backend selected for non-thread channel '{}'",
                    target.channel_id
                ),
            )
        })?;
        match strategy {
            SendStrategy::ProxyIdentity(mode) => {
                transport
                    .send_proxy_identity(target, proxy_message(persona, chunk, mode, Some(thread_id)))
                    .await
            }
            SendStrategy::DirectFormatted => {
                transport
                    .send_direct(target, direct_formatted_message(persona, chunk))
                    .await
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Direct-message channels: no proxy identity, always a formatted send.
pub struct DirectMessageBackend;

#[async_trait]
impl DeliveryBackend for DirectMessageBackend {
    fn name(&self) -> &'static str {
        "direct_message"
    }

    fn strategies(&self) -> &'static [SendStrategy] {
        &DIRECT_MESSAGE_STRATEGIES
    }

    fn inlines_media(&self) -> bool {
        false
    }

    async fn attempt(
        &self,
        transport: &dyn ChannelTransport,
        target: &DeliveryTarget,
        persona: &Persona,
        chunk: &MessageChunk,
        strategy: SendStrategy,
    ) -> Result<SentMessage, BackendSendError> {
        match strategy {
            SendStrategy::DirectFormatted => {
                transport
                    .send_direct(target, direct_formatted_message(persona, chunk))
                    .await
            }
            SendStrategy::ProxyIdentity(mode) => Err(BackendSendError::new(
                "delivery_strategy_unsupported",
                format!(
                    "direct-message channels cannot use proxy identity ({})",
                    mode.as_str()
                ),
            )),
        }
    }
}

/// Picks the backend implementation for a channel kind.
pub fn backend_for_target(target: &DeliveryTarget) -> &'static dyn DeliveryBackend {
    match target.kind {
        ChannelKind::Guild => &ProxyIdentityBackend,
        ChannelKind::Thread { .. } => &ThreadBackend,
        ChannelKind::DirectMessage => &DirectMessageBackend,
    }
}
