use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::TimeContext;
use relay_dedup::{
    DedupConfig, DedupError, DedupTicket, GeneratedResponse, GenerationError, RequestContext,
    RequestDeduplicator,
};
use relay_delivery::{
    ChannelTransport, ChunkedDeliveryEngine, DeliveryError, DeliveryOptions, DeliveryResult,
    DeliveryTarget, DeliveryThrottler, EngineConfig, Persona, ThrottleConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Produces the reply text for a persona. Failures are shared with every
/// request joined on the same signature.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(
        &self,
        persona: &Persona,
        content: &str,
        context: &RequestContext,
    ) -> Result<GeneratedResponse, GenerationError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dedup: DedupConfig,
    pub throttle: ThrottleConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRequest {
    pub persona: Persona,
    pub target: DeliveryTarget,
    pub content: String,
    pub context: RequestContext,
    pub options: DeliveryOptions,
}

impl ResponseRequest {
    pub fn new(persona: Persona, target: DeliveryTarget, content: impl Into<String>) -> Self {
        Self {
            persona,
            target,
            content: content.into(),
            context: RequestContext::default(),
            options: DeliveryOptions::default(),
        }
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_options(mut self, options: DeliveryOptions) -> Self {
        self.options = options;
        self
    }

    /// Context used for the signature; the channel defaults to the delivery
    /// destination so identical prompts in different channels stay distinct.
    fn signature_context(&self) -> RequestContext {
        let mut context = self.context.clone();
        if context.channel_id.is_none() {
            context.channel_id = Some(self.target.destination_id().to_string());
        }
        context
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespondOutcome {
    /// This request owned the generation and delivered it.
    Delivered {
        signature: String,
        result: DeliveryResult,
    },
    /// An identical request was already in flight; its owner delivers the
    /// response, so nothing was sent for this one.
    Joined { signature: String },
    /// Generation failed while a newer request for the same personality and
    /// channel is still producing a response, so no error is surfaced.
    Suppressed { signature: String },
}

impl RespondOutcome {
    pub fn signature(&self) -> &str {
        match self {
            Self::Delivered { signature, .. }
            | Self::Joined { signature }
            | Self::Suppressed { signature } => signature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Blackout(#[from] DedupError),
    #[error("response generation failed for {signature}: {source}")]
    Generation {
        signature: String,
        #[source]
        source: GenerationError,
    },
    #[error("response delivery failed for {signature}: {source}")]
    Delivery {
        signature: String,
        #[source]
        source: DeliveryError,
    },
}

impl PipelineError {
    /// Text suitable for posting back to the requesting user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Blackout(error) => {
                let seconds = error.retry_after_ms().div_ceil(1_000).max(1);
                format!(
                    "That request failed a moment ago. Please wait about {seconds}s before trying again."
                )
            }
            Self::Generation { .. } => {
                "Sorry, I couldn't come up with a response right now. Please try again shortly."
                    .to_string()
            }
            Self::Delivery { .. } => {
                "Sorry, I couldn't deliver my response to this channel.".to_string()
            }
        }
    }
}

/// End-to-end request handling: dedup, pending marker, generation, paced
/// chunked delivery.
pub struct ResponsePipeline {
    time: TimeContext,
    generator: Arc<dyn ResponseGenerator>,
    dedup: RequestDeduplicator,
    throttler: Arc<DeliveryThrottler>,
    engine: ChunkedDeliveryEngine,
    request_sequence: AtomicU64,
}

impl ResponsePipeline {
    pub fn new(
        config: PipelineConfig,
        time: TimeContext,
        generator: Arc<dyn ResponseGenerator>,
        transport: Arc<dyn ChannelTransport>,
    ) -> Self {
        let throttler = Arc::new(DeliveryThrottler::new(config.throttle, time.clone()));
        let engine = ChunkedDeliveryEngine::new(
            config.engine,
            time.clone(),
            transport,
            Arc::clone(&throttler),
        );
        Self {
            dedup: RequestDeduplicator::new(config.dedup, time.clone()),
            time,
            generator,
            throttler,
            engine,
            request_sequence: AtomicU64::new(0),
        }
    }

    pub fn dedup(&self) -> &RequestDeduplicator {
        &self.dedup
    }

    pub fn throttler(&self) -> &DeliveryThrottler {
        &self.throttler
    }

    pub fn engine(&self) -> &ChunkedDeliveryEngine {
        &self.engine
    }

    fn next_request_id(&self) -> String {
        let sequence = self.request_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("req-{}-{sequence}", self.time.now_ms())
    }

    pub async fn respond(&self, request: ResponseRequest) -> Result<RespondOutcome, PipelineError> {
        let context = request.signature_context();
        let generator = Arc::clone(&self.generator);
        let generation_persona = request.persona.clone();
        let generation_content = request.content.clone();
        let generation_context = context.clone();
        let ticket = self.dedup.check_or_register(
            &request.persona.name,
            &request.content,
            Some(&context),
            move || async move {
                let response = generator
                    .generate(&generation_persona, &generation_content, &generation_context)
                    .await?;
                if response.text.trim().is_empty() {
                    return Err(GenerationError::EmptyResponse);
                }
                Ok(response)
            },
        );
        let ticket = match ticket {
            Ok(ticket) => ticket,
            Err(error) => {
                info!(
                    persona = %request.persona.name,
                    retry_after_ms = error.retry_after_ms(),
                    "request rejected during error blackout"
                );
                return Err(PipelineError::Blackout(error));
            }
        };

        let (signature, handle) = match ticket {
            DedupTicket::Existing { signature, handle } => {
                debug!(signature = %signature, "waiting on in-flight generation owned by another request");
                if let Err(error) = handle.await {
                    debug!(signature = %signature, error = %error, "joined generation failed");
                }
                return Ok(RespondOutcome::Joined { signature });
            }
            DedupTicket::Registered { signature, handle } => (signature, handle),
        };

        let personality = request.persona.name.as_str();
        let channel_id = request.target.destination_id();
        let request_id = self.next_request_id();
        self.throttler
            .register_pending_message(personality, channel_id, &request_id);

        let response = match handle.await {
            Ok(response) => response,
            Err(error) => {
                self.throttler
                    .clear_pending_message(personality, channel_id, Some(&request_id));
                if self.throttler.has_pending_message(personality, channel_id) {
                    info!(
                        signature = %signature,
                        channel_id,
                        error = %error,
                        "suppressing generation failure while another response is pending"
                    );
                    return Ok(RespondOutcome::Suppressed { signature });
                }
                warn!(signature = %signature, channel_id, error = %error, "response generation failed");
                return Err(PipelineError::Generation {
                    signature,
                    source: error,
                });
            }
        };

        let delivered = self
            .engine
            .deliver(
                &request.target,
                &response.text,
                &request.persona,
                request.options,
            )
            .await;
        self.throttler
            .clear_pending_message(personality, channel_id, Some(&request_id));
        match delivered {
            Ok(result) => {
                debug!(
                    signature = %signature,
                    channel_id,
                    messages = result.message_ids.len(),
                    "response delivered"
                );
                Ok(RespondOutcome::Delivered { signature, result })
            }
            Err(error) => {
                warn!(signature = %signature, channel_id, error = %error, "response delivery failed");
                Err(PipelineError::Delivery {
                    signature,
                    source: error,
                })
            }
        }
    }

    /// Cancels timers and empties every map.
    pub fn shutdown(&self) {
        self.dedup.shutdown();
        self.throttler.clear();
        self.engine.clear();
    }
}
