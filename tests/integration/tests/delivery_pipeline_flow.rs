use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use httpmock::prelude::*;
use relay_core::ManualTimers;
use relay_dedup::{GeneratedResponse, GenerationError, RequestContext};
use relay_delivery::{
    BackendSendError, DeliveryTarget, Persona, ProxyInvocationMode, RecordedSend,
    RecordingTransport,
};
use relay_discord::{DiscordRestTransport, DiscordTransportConfig};
use relay_pipeline::{
    PipelineConfig, PipelineError, RespondOutcome, ResponseGenerator, ResponsePipeline,
    ResponseRequest,
};
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;

struct ScriptedGenerator {
    responses: AsyncMutex<VecDeque<Result<GeneratedResponse, GenerationError>>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    fn new(responses: Vec<Result<GeneratedResponse, GenerationError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: AsyncMutex::new(VecDeque::from(responses)),
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        _persona: &Persona,
        _content: &str,
        _context: &RequestContext,
    ) -> Result<GeneratedResponse, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(GenerationError::Failed("scripted queue exhausted".into())))
    }
}

fn lilith() -> Persona {
    Persona::new("lilith", "Lilith").with_avatar("https://cdn.example/lilith.png")
}

fn ask(content: &str, target: DeliveryTarget) -> ResponseRequest {
    ResponseRequest::new(lilith(), target, content).with_context(RequestContext {
        user_id: Some("user-1".to_string()),
        ..RequestContext::default()
    })
}

#[tokio::test]
async fn integration_long_response_falls_back_on_first_chunk_and_paces_the_rest() {
    let timers = ManualTimers::starting_at(10_000_000);
    let transport = Arc::new(RecordingTransport::new());
    transport.push_proxy_failure(
        BackendSendError::new("delivery_request_rejected", "unknown webhook").with_http_status(404),
    );
    transport.push_proxy_failure(
        BackendSendError::new("delivery_request_rejected", "unknown webhook").with_http_status(404),
    );
    let long_response = "lorem ".repeat(750).trim_end().to_string();
    let generator = ScriptedGenerator::new(vec![Ok(GeneratedResponse::new(long_response))]);
    let pipeline = ResponsePipeline::new(
        PipelineConfig::default(),
        timers.context(),
        generator.clone(),
        transport.clone(),
    );

    let outcome = pipeline
        .respond(ask("tell me a long story", DeliveryTarget::guild("general")))
        .await
        .expect("pipeline delivers");
    let RespondOutcome::Delivered { result, .. } = outcome else {
        panic!("expected delivered outcome, got {outcome:?}");
    };

    assert_eq!(result.message_ids.len(), 3);
    assert!(result.failed_chunks.is_empty());
    let sends = transport.sends();
    assert_eq!(sends.len(), 5);
    assert!(!sends[0].succeeded() && !sends[1].succeeded());
    assert!(sends[2].is_direct());
    assert!(sends[2].content().starts_with("**Lilith:** lorem"));
    for send in &sends[3..] {
        match send {
            RecordedSend::ProxyIdentity { message, .. } => {
                assert_eq!(message.mode, ProxyInvocationMode::Primary);
                assert!(message.content.chars().count() <= 2_000);
            }
            other => panic!("expected proxy send, got {other:?}"),
        }
    }
    assert_eq!(
        timers.recorded_sleeps(),
        vec![Duration::from_millis(750), Duration::from_millis(750)]
    );
    assert_eq!(generator.call_count(), 1);
    assert!(!pipeline.throttler().has_pending_message("lilith", "general"));
}

#[tokio::test]
async fn integration_failed_generation_blacks_out_then_sweep_clears_it() {
    let timers = ManualTimers::starting_at(10_000_000);
    let transport = Arc::new(RecordingTransport::new());
    let generator = ScriptedGenerator::new(vec![Err(GenerationError::Failed(
        "provider unavailable".into(),
    ))]);
    let pipeline = ResponsePipeline::new(
        PipelineConfig::default(),
        timers.context(),
        generator.clone(),
        transport.clone(),
    );

    let error = pipeline
        .respond(ask("hello", DeliveryTarget::direct_message("dm-1")))
        .await
        .expect_err("generation fails");
    assert!(matches!(error, PipelineError::Generation { .. }));

    let error = pipeline
        .respond(ask("  hello ", DeliveryTarget::direct_message("dm-1")))
        .await
        .expect_err("blackout");
    assert!(matches!(error, PipelineError::Blackout(_)));
    assert!(error.user_message().contains("Please wait"));
    assert_eq!(pipeline.dedup().blackout_count(), 1);
    assert!(pipeline.dedup().is_sweep_scheduled());

    timers.advance_ms(120_000);
    assert_eq!(pipeline.dedup().blackout_count(), 0);
    assert_eq!(generator.call_count(), 1);
    assert_eq!(transport.send_count(), 0);

    pipeline.shutdown();
    assert_eq!(timers.pending_timers(), 0);
}

#[tokio::test]
async fn integration_pipeline_over_discord_rest_falls_back_from_webhook_to_bot_send() {
    let server = MockServer::start();
    let webhook = server.mock(|when, then| {
        when.method(POST)
            .path("/webhooks/10/token")
            .query_param("wait", "true");
        then.status(500).body("upstream exploded");
    });
    let direct = server.mock(|when, then| {
        when.method(POST)
            .path("/channels/general/messages")
            .header("authorization", "Bot relay-token")
            .json_body_includes(json!({"content": "**Lilith:** the answer"}).to_string());
        then.status(200).json_body(json!({"id": "9001", "channel_id": "general"}));
    });

    let mut webhooks = BTreeMap::new();
    webhooks.insert("general".to_string(), server.url("/webhooks/10/token"));
    let transport = DiscordRestTransport::new(DiscordTransportConfig {
        api_base: server.base_url(),
        bot_token: Some("relay-token".to_string()),
        webhooks,
        ..DiscordTransportConfig::default()
    })
    .expect("transport");
    let timers = ManualTimers::starting_at(10_000_000);
    let generator = ScriptedGenerator::new(vec![Ok(GeneratedResponse::new("the answer"))]);
    let pipeline = ResponsePipeline::new(
        PipelineConfig::default(),
        timers.context(),
        generator,
        Arc::new(transport),
    );

    let outcome = pipeline
        .respond(ask("what is the answer", DeliveryTarget::guild("general")))
        .await
        .expect("fallback delivers");
    webhook.assert_calls(2);
    direct.assert_calls(1);
    let RespondOutcome::Delivered { result, .. } = outcome else {
        panic!("expected delivered outcome, got {outcome:?}");
    };
    assert_eq!(result.first_message.id, "9001");
    assert_eq!(result.message_ids, vec!["9001"]);
}
