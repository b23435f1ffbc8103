//! Chunked, paced, multi-strategy delivery of one response.
//!
//! A call walks `preparing -> chunking -> sending(i) -> {sending(i+1) |
//! fallback(i) | done | failed}`; every transition is logged at `debug`.
//! Only chunk 0 can move the call to `failed`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relay_core::TimeContext;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backends::{backend_for_target, DeliveryBackend, StrategyFailure};
use crate::chunking::build_message_chunks;
use crate::delivery_types::{
    prioritize_media, DeliveryOptions, DeliveryResult, DeliveryTarget, MediaReference,
    MessageChunk, Persona, SentMessage, PLATFORM_MAX_MESSAGE_CHARS,
};
use crate::recent_sends::{RecentSendCache, DEFAULT_DUPLICATE_WINDOW_MS};
use crate::throttle::DeliveryThrottler;
use crate::transport::{ChannelTransport, DirectMessage};

pub const DEFAULT_CHUNK_DELAY_MS: u64 = 750;
pub const DEFAULT_MEDIA_FOLLOWUP_DELAY_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_message_chars: usize,
    pub chunk_delay_ms: u64,
    pub media_followup_delay_ms: u64,
    pub duplicate_window_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_message_chars: PLATFORM_MAX_MESSAGE_CHARS,
            chunk_delay_ms: DEFAULT_CHUNK_DELAY_MS,
            media_followup_delay_ms: DEFAULT_MEDIA_FOLLOWUP_DELAY_MS,
            duplicate_window_ms: DEFAULT_DUPLICATE_WINDOW_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("nothing to deliver: content and attachments are empty")]
    EmptyContent,
    #[error(
        "delivery to channel '{channel_id}' failed via {backend}: chunk {chunk_index} of {chunk_count} exhausted {} strategies",
        .attempts.len()
    )]
    TotalDeliveryFailure {
        backend: String,
        channel_id: String,
        chunk_index: usize,
        chunk_count: usize,
        attempts: Vec<StrategyFailure>,
    },
}

impl DeliveryError {
    pub fn attempts(&self) -> &[StrategyFailure] {
        match self {
            Self::EmptyContent => &[],
            Self::TotalDeliveryFailure { attempts, .. } => attempts,
        }
    }
}

enum ChunkOutcome {
    Sent(SentMessage),
    Failed(Vec<StrategyFailure>),
}

pub struct ChunkedDeliveryEngine {
    config: EngineConfig,
    time: TimeContext,
    transport: Arc<dyn ChannelTransport>,
    throttler: Arc<DeliveryThrottler>,
    recent_sends: RecentSendCache,
    virtual_sequence: AtomicU64,
}

impl ChunkedDeliveryEngine {
    pub fn new(
        config: EngineConfig,
        time: TimeContext,
        transport: Arc<dyn ChannelTransport>,
        throttler: Arc<DeliveryThrottler>,
    ) -> Self {
        let recent_sends = RecentSendCache::new(config.duplicate_window_ms, time.clone());
        Self {
            config,
            time,
            transport,
            throttler,
            recent_sends,
            virtual_sequence: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    pub fn throttler(&self) -> &Arc<DeliveryThrottler> {
        &self.throttler
    }

    /// Splits `content`, paces and sends every chunk in order with per-chunk
    /// fallback, then sends direct-message media follow-ups.
    pub async fn deliver(
        &self,
        target: &DeliveryTarget,
        content: &str,
        persona: &Persona,
        options: DeliveryOptions,
    ) -> Result<DeliveryResult, DeliveryError> {
        let backend = backend_for_target(target);
        let destination_id = target.destination_id().to_string();
        debug!(
            state = "preparing",
            channel_id = %destination_id,
            backend = backend.name(),
            persona = %persona.name,
            "delivery state transition"
        );

        let DeliveryOptions {
            mut files,
            embeds,
            media,
        } = options;
        let ordered_media = prioritize_media(&media);
        let followup_media = if backend.inlines_media() {
            files.extend(ordered_media.iter().map(MediaReference::to_outbound_file));
            Vec::new()
        } else {
            ordered_media
        };

        let mut chunks = build_message_chunks(content, self.config.max_message_chars, files, embeds);
        if chunks.is_empty() {
            if followup_media.is_empty() {
                return Err(DeliveryError::EmptyContent);
            }
            chunks.push(MessageChunk {
                index: 0,
                is_first: true,
                is_last: true,
                text: String::new(),
                files: Vec::new(),
                embeds: Vec::new(),
            });
        }
        let chunk_count = chunks.len();
        debug!(
            state = "chunking",
            channel_id = %destination_id,
            chunk_count,
            followup_media = followup_media.len(),
            "delivery state transition"
        );

        let mut first_message: Option<SentMessage> = None;
        let mut message_ids = Vec::new();
        let mut skipped_chunks = Vec::new();
        let mut failed_chunks = Vec::new();
        // Recorded after the loop so identical chunks of one response are not
        // filtered against each other.
        let mut delivered_texts: Vec<&str> = Vec::new();

        for chunk in &chunks {
            if !chunk.has_extras()
                && self
                    .recent_sends
                    .is_recent_duplicate(&destination_id, &persona.display_name, &chunk.text)
            {
                debug!(
                    channel_id = %destination_id,
                    chunk_index = chunk.index,
                    "skipping chunk already sent within duplicate window"
                );
                skipped_chunks.push(chunk.index);
                continue;
            }

            self.pace_before_chunk(&destination_id, chunk.index, first_message.is_some())
                .await;

            match self
                .send_chunk(backend, target, persona, chunk, &destination_id)
                .await
            {
                ChunkOutcome::Sent(sent) => {
                    self.throttler.update_channel_last_message_time(&destination_id);
                    delivered_texts.push(&chunk.text);
                    message_ids.push(sent.id.clone());
                    if first_message.is_none() {
                        first_message = Some(sent);
                    }
                }
                ChunkOutcome::Failed(attempts) if chunk.index == 0 => {
                    debug!(
                        state = "failed",
                        channel_id = %destination_id,
                        chunk_index = chunk.index,
                        "delivery state transition"
                    );
                    return Err(DeliveryError::TotalDeliveryFailure {
                        backend: backend.name().to_string(),
                        channel_id: destination_id,
                        chunk_index: chunk.index,
                        chunk_count,
                        attempts,
                    });
                }
                ChunkOutcome::Failed(attempts) => {
                    warn!(
                        channel_id = %destination_id,
                        chunk_index = chunk.index,
                        chunk_count,
                        attempts = attempts.len(),
                        "chunk delivery failed on every strategy; continuing with remaining chunks"
                    );
                    failed_chunks.push(chunk.index);
                }
            }
        }

        for text in delivered_texts {
            self.recent_sends
                .record(&destination_id, &persona.display_name, text);
        }

        for reference in &followup_media {
            self.time.sleep_ms(self.config.media_followup_delay_ms).await;
            let message = DirectMessage {
                content: String::new(),
                files: vec![reference.to_outbound_file()],
                embeds: Vec::new(),
            };
            match self.transport.send_direct(target, message).await {
                Ok(sent) => {
                    debug!(
                        channel_id = %destination_id,
                        media_kind = reference.kind.as_str(),
                        message_id = %sent.id,
                        "sent media follow-up"
                    );
                    self.throttler.update_channel_last_message_time(&destination_id);
                    message_ids.push(sent.id.clone());
                    if first_message.is_none() {
                        first_message = Some(sent);
                    }
                }
                Err(error) => {
                    warn!(
                        channel_id = %destination_id,
                        media_kind = reference.kind.as_str(),
                        reason_code = %error.reason_code,
                        "media follow-up failed"
                    );
                }
            }
        }

        // Only chunk 0 may fail the call. When it was skipped as a duplicate and
        // nothing else went out, the skipped chunk stands in for the delivery.
        let (first_message, is_virtual) = match first_message {
            Some(first_message) => (first_message, false),
            None => (self.virtual_message(&destination_id), true),
        };
        debug!(
            state = "done",
            channel_id = %destination_id,
            sent = message_ids.len(),
            skipped = skipped_chunks.len(),
            failed = failed_chunks.len(),
            is_virtual,
            "delivery state transition"
        );
        Ok(DeliveryResult {
            first_message,
            message_ids,
            is_virtual,
            skipped_chunks,
            failed_chunks,
        })
    }

    /// Channel pacing before the first sent message, fixed spacing after.
    async fn pace_before_chunk(&self, destination_id: &str, chunk_index: usize, sent_any: bool) {
        let wait_ms = if sent_any {
            self.config.chunk_delay_ms
        } else {
            self.throttler.calculate_message_delay(destination_id)
        };
        if wait_ms > 0 {
            debug!(
                channel_id = %destination_id,
                chunk_index,
                wait_ms,
                "pacing before chunk"
            );
            self.time.sleep_ms(wait_ms).await;
        }
    }

    async fn send_chunk(
        &self,
        backend: &dyn DeliveryBackend,
        target: &DeliveryTarget,
        persona: &Persona,
        chunk: &MessageChunk,
        destination_id: &str,
    ) -> ChunkOutcome {
        let mut attempts = Vec::new();
        for (attempt_index, strategy) in backend.strategies().iter().copied().enumerate() {
            let state = if attempt_index == 0 {
                "sending"
            } else {
                "fallback"
            };
            debug!(
                state,
                channel_id = %destination_id,
                chunk_index = chunk.index,
                strategy = strategy.label(),
                "delivery state transition"
            );
            match backend
                .attempt(self.transport.as_ref(), target, persona, chunk, strategy)
                .await
            {
                Ok(sent) => return ChunkOutcome::Sent(sent),
                Err(error) => {
                    warn!(
                        channel_id = %destination_id,
                        chunk_index = chunk.index,
                        strategy = strategy.label(),
                        reason_code = %error.reason_code,
                        retryable = error.retryable,
                        "delivery strategy failed"
                    );
                    attempts.push(StrategyFailure { strategy, error });
                }
            }
        }
        ChunkOutcome::Failed(attempts)
    }

    fn virtual_message(&self, destination_id: &str) -> SentMessage {
        let sequence = self.virtual_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        SentMessage {
            id: format!("virtual-{}-{sequence}", self.time.now_ms()),
            channel_id: destination_id.to_string(),
        }
    }

    pub fn clear(&self) {
        self.recent_sends.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use relay_core::ManualTimers;

    use super::{ChunkedDeliveryEngine, DeliveryError, EngineConfig};
    use crate::backends::SendStrategy;
    use crate::delivery_types::{
        DeliveryOptions, DeliveryTarget, MediaKind, MediaReference, Persona,
    };
    use crate::recording_transport::{RecordedSend, RecordingTransport};
    use crate::throttle::{DeliveryThrottler, ThrottleConfig};
    use crate::transport::{BackendSendError, ProxyInvocationMode};

    struct Harness {
        timers: Arc<ManualTimers>,
        transport: Arc<RecordingTransport>,
        engine: ChunkedDeliveryEngine,
    }

    fn harness() -> Harness {
        let timers = ManualTimers::starting_at(1_000_000);
        let transport = Arc::new(RecordingTransport::new());
        let throttler = Arc::new(DeliveryThrottler::new(
            ThrottleConfig::default(),
            timers.context(),
        ));
        let engine = ChunkedDeliveryEngine::new(
            EngineConfig::default(),
            timers.context(),
            transport.clone(),
            throttler,
        );
        Harness {
            timers,
            transport,
            engine,
        }
    }

    fn persona() -> Persona {
        Persona::new("lilith", "Lilith").with_avatar("https://cdn.example/lilith.png")
    }

    fn rejected(detail: &str) -> BackendSendError {
        BackendSendError::new("delivery_request_rejected", detail).with_http_status(400)
    }

    #[tokio::test]
    async fn functional_proxy_failures_fall_back_to_formatted_direct_send() {
        let harness = harness();
        harness.transport.push_proxy_failure(rejected("primary"));
        harness.transport.push_proxy_failure(rejected("compat"));

        let result = harness
            .engine
            .deliver(
                &DeliveryTarget::guild("c1"),
                "hello there",
                &persona(),
                DeliveryOptions::default(),
            )
            .await
            .expect("direct fallback delivers");

        let sends = harness.transport.sends();
        assert_eq!(sends.len(), 3);
        match &sends[1] {
            RecordedSend::ProxyIdentity { message, .. } => {
                assert_eq!(message.mode, ProxyInvocationMode::Compat);
                assert!(message.embeds.is_empty());
            }
            other => panic!("expected compat proxy send, got {other:?}"),
        }
        let direct: Vec<&RecordedSend> = sends.iter().filter(|send| send.is_direct()).collect();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].content(), "**Lilith:** hello there");
        assert_eq!(result.message_ids.len(), 1);
        assert!(!result.is_virtual);
    }

    #[tokio::test]
    async fn functional_first_chunk_failure_is_total_delivery_failure() {
        let harness = harness();
        harness.transport.fail_after(0, rejected("everything"));

        let error = harness
            .engine
            .deliver(
                &DeliveryTarget::guild("c1"),
                "hello",
                &persona(),
                DeliveryOptions::default(),
            )
            .await
            .expect_err("chunk 0 failure is fatal");
        match &error {
            DeliveryError::TotalDeliveryFailure {
                chunk_index,
                chunk_count,
                attempts,
                ..
            } => {
                assert_eq!(*chunk_index, 0);
                assert_eq!(*chunk_count, 1);
                let strategies: Vec<SendStrategy> =
                    attempts.iter().map(|attempt| attempt.strategy).collect();
                assert_eq!(
                    strategies,
                    vec![
                        SendStrategy::ProxyIdentity(ProxyInvocationMode::Primary),
                        SendStrategy::ProxyIdentity(ProxyInvocationMode::Compat),
                        SendStrategy::DirectFormatted,
                    ]
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn functional_later_chunk_failure_keeps_earlier_ids() {
        let harness = harness();
        harness.transport.fail_after(2, rejected("third chunk"));
        let content = "a".repeat(5_000);

        let result = harness
            .engine
            .deliver(
                &DeliveryTarget::guild("c1"),
                &content,
                &persona(),
                DeliveryOptions::default(),
            )
            .await
            .expect("later chunk failures are not fatal");
        assert_eq!(result.message_ids, vec!["recorded-1", "recorded-2"]);
        assert_eq!(result.first_message.id, "recorded-1");
        assert_eq!(result.failed_chunks, vec![2]);
    }

    #[tokio::test]
    async fn functional_duplicate_chunk_yields_virtual_result_without_backend_call() {
        let harness = harness();
        let target = DeliveryTarget::guild("c1");
        harness
            .engine
            .deliver(&target, "same words", &persona(), DeliveryOptions::default())
            .await
            .expect("first delivery");
        assert_eq!(harness.transport.send_count(), 1);

        harness.timers.advance_ms(1_000);
        let result = harness
            .engine
            .deliver(&target, "same words", &persona(), DeliveryOptions::default())
            .await
            .expect("duplicate is skipped");
        assert!(result.is_virtual);
        assert!(result.first_message.id.starts_with("virtual-"));
        assert!(result.message_ids.is_empty());
        assert_eq!(result.skipped_chunks, vec![0]);
        assert_eq!(harness.transport.send_count(), 1);
    }

    #[tokio::test]
    async fn regression_skipped_first_chunk_then_failed_chunk_is_not_fatal() {
        let harness = harness();
        let target = DeliveryTarget::guild("c1");
        let opening = "a".repeat(1_500);
        harness
            .engine
            .deliver(&target, &opening, &persona(), DeliveryOptions::default())
            .await
            .expect("first delivery");

        harness.timers.advance_ms(1_000);
        harness.transport.fail_after(1, rejected("second chunk"));
        let content = format!("{opening}\n\n{}", "b".repeat(1_500));
        let result = harness
            .engine
            .deliver(&target, &content, &persona(), DeliveryOptions::default())
            .await
            .expect("only chunk 0 may fail the call");
        assert!(result.is_virtual);
        assert!(result.first_message.id.starts_with("virtual-"));
        assert!(result.message_ids.is_empty());
        assert_eq!(result.skipped_chunks, vec![0]);
        assert_eq!(result.failed_chunks, vec![1]);
        assert_eq!(harness.transport.successful_sends().len(), 1);
    }

    #[tokio::test]
    async fn functional_pacing_waits_for_channel_then_spaces_chunks() {
        let harness = harness();
        let target = DeliveryTarget::guild("c1");
        harness
            .engine
            .deliver(&target, "first response", &persona(), DeliveryOptions::default())
            .await
            .expect("first delivery");
        harness.timers.advance_ms(1_000);

        let content = "b".repeat(4_500);
        harness
            .engine
            .deliver(&target, &content, &persona(), DeliveryOptions::default())
            .await
            .expect("second delivery");
        assert_eq!(
            harness.timers.recorded_sleeps(),
            vec![
                Duration::from_millis(2_000),
                Duration::from_millis(750),
                Duration::from_millis(750),
            ]
        );
    }

    #[tokio::test]
    async fn functional_direct_message_media_follows_audio_first() {
        let harness = harness();
        let options = DeliveryOptions {
            media: vec![
                MediaReference {
                    kind: MediaKind::Image,
                    url: "https://cdn.example/pic.png".to_string(),
                },
                MediaReference {
                    kind: MediaKind::Audio,
                    url: "https://cdn.example/voice.mp3".to_string(),
                },
            ],
            ..DeliveryOptions::default()
        };

        let result = harness
            .engine
            .deliver(
                &DeliveryTarget::direct_message("dm1"),
                "here you go",
                &persona(),
                options,
            )
            .await
            .expect("dm delivery");
        let sends = harness.transport.sends();
        assert_eq!(sends.len(), 3);
        assert!(sends.iter().all(RecordedSend::is_direct));
        assert_eq!(sends[0].content(), "**Lilith:** here you go");
        let follow_up_files: Vec<String> = sends[1..]
            .iter()
            .map(|send| match send {
                RecordedSend::Direct { message, .. } => message.files[0].name.clone(),
                other => panic!("unexpected send {other:?}"),
            })
            .collect();
        assert_eq!(follow_up_files, vec!["voice.mp3", "pic.png"]);
        assert_eq!(result.message_ids.len(), 3);
        assert_eq!(
            harness.timers.recorded_sleeps(),
            vec![Duration::from_millis(1_000), Duration::from_millis(1_000)]
        );
    }

    #[tokio::test]
    async fn unit_guild_media_rides_on_last_chunk() {
        let harness = harness();
        let options = DeliveryOptions {
            media: vec![MediaReference {
                kind: MediaKind::Image,
                url: "https://cdn.example/pic.png".to_string(),
            }],
            ..DeliveryOptions::default()
        };
        harness
            .engine
            .deliver(&DeliveryTarget::thread("c1", "t1"), "caption", &persona(), options)
            .await
            .expect("thread delivery");
        let sends = harness.transport.sends();
        assert_eq!(sends.len(), 1);
        match &sends[0] {
            RecordedSend::ProxyIdentity { message, .. } => {
                assert_eq!(message.thread_id.as_deref(), Some("t1"));
                assert_eq!(message.files.len(), 1);
            }
            other => panic!("expected proxy send, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unit_empty_content_is_rejected() {
        let harness = harness();
        let error = harness
            .engine
            .deliver(
                &DeliveryTarget::guild("c1"),
                "",
                &persona(),
                DeliveryOptions::default(),
            )
            .await
            .expect_err("nothing to send");
        assert_eq!(error, DeliveryError::EmptyContent);
        assert_eq!(harness.transport.send_count(), 0);
    }

    #[tokio::test]
    async fn regression_whitespace_only_content_is_rejected() {
        let harness = harness();
        let error = harness
            .engine
            .deliver(
                &DeliveryTarget::guild("c1"),
                "  \n ",
                &persona(),
                DeliveryOptions::default(),
            )
            .await
            .expect_err("blank content is not sent");
        assert_eq!(error, DeliveryError::EmptyContent);
        assert_eq!(harness.transport.send_count(), 0);
    }
}
