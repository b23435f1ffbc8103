use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use relay_core::TimeContext;
use relay_dedup::{GeneratedResponse, GenerationError, RequestContext};
use relay_delivery::{
    build_message_chunks, ChannelTransport, DeliveryOptions, DeliveryTarget, Persona,
    RecordingTransport,
};
use relay_discord::{DiscordRestTransport, DiscordTransportConfig};
use relay_pipeline::{RespondOutcome, ResponseGenerator, ResponsePipeline, ResponseRequest};
use serde_json::{json, Value};
use tracing::info;

use crate::cli_args::{ChunkPreviewArgs, CliChannelKind, Command, DeliverArgs, TextSourceArgs};

/// Generator that hands back text supplied on the command line.
struct StaticResponseGenerator {
    text: String,
}

#[async_trait]
impl ResponseGenerator for StaticResponseGenerator {
    async fn generate(
        &self,
        _persona: &Persona,
        _content: &str,
        _context: &RequestContext,
    ) -> Result<GeneratedResponse, GenerationError> {
        Ok(GeneratedResponse::new(self.text.clone()))
    }
}

pub async fn run(command: Command) -> Result<()> {
    let report = match command {
        Command::Deliver(args) => execute_deliver(args).await?,
        Command::ChunkPreview(args) => execute_chunk_preview(&args)?,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to render report")?
    );
    Ok(())
}

fn load_text(source: &TextSourceArgs) -> Result<String> {
    match (&source.text, &source.text_file) {
        (Some(text), None) => Ok(text.clone()),
        (None, Some(path)) => read_text_file(path),
        (Some(_), Some(_)) => bail!("--text and --text-file are mutually exclusive"),
        (None, None) => bail!("one of --text or --text-file is required"),
    }
}

fn read_text_file(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read text file {}", path.display()))?;
    Ok(raw.trim_end_matches(['\n', '\r']).to_string())
}

fn build_target(args: &DeliverArgs) -> Result<DeliveryTarget> {
    let channel_id = args.channel_id.trim();
    if channel_id.is_empty() {
        bail!("--channel-id must be non-empty");
    }
    match args.channel_kind {
        CliChannelKind::Guild => Ok(DeliveryTarget::guild(channel_id)),
        CliChannelKind::Dm => Ok(DeliveryTarget::direct_message(channel_id)),
        CliChannelKind::Thread => {
            let thread_id = args
                .thread_id
                .as_deref()
                .map(str::trim)
                .filter(|thread_id| !thread_id.is_empty())
                .ok_or_else(|| anyhow!("--thread-id is required when --channel-kind=thread"))?;
            Ok(DeliveryTarget::thread(channel_id, thread_id))
        }
    }
}

fn build_persona(args: &DeliverArgs) -> Result<Persona> {
    let name = args.personality.trim();
    if name.is_empty() {
        bail!("--personality must be non-empty");
    }
    let display_name = args
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|display_name| !display_name.is_empty())
        .unwrap_or(name);
    let persona = Persona::new(name, display_name);
    Ok(match args.avatar_url.as_deref() {
        Some(avatar_url) if !avatar_url.trim().is_empty() => persona.with_avatar(avatar_url.trim()),
        _ => persona,
    })
}

pub(crate) async fn execute_deliver(args: DeliverArgs) -> Result<Value> {
    let text = load_text(&args.text)?;
    let target = build_target(&args)?;
    let persona = build_persona(&args)?;

    let recorder = Arc::new(RecordingTransport::new());
    let transport: Arc<dyn ChannelTransport> = if args.dry_run {
        recorder.clone()
    } else {
        Arc::new(DiscordRestTransport::new(DiscordTransportConfig {
            api_base: args.discord.discord_api_base.clone(),
            bot_token: args.discord.discord_bot_token.clone(),
            webhooks: args.discord.webhooks.iter().cloned().collect(),
            http_timeout_ms: args.discord.http_timeout_ms,
        })?)
    };

    let pipeline = ResponsePipeline::new(
        args.pipeline.to_config(),
        TimeContext::system(),
        Arc::new(StaticResponseGenerator { text: text.clone() }),
        transport,
    );
    let request = ResponseRequest::new(persona, target.clone(), text)
        .with_context(RequestContext {
            user_id: args.user_id.clone(),
            channel_id: None,
            has_user_auth: false,
            reply_to_message_id: args.reply_to_message_id.clone(),
        })
        .with_options(DeliveryOptions {
            media: args.media.clone(),
            ..DeliveryOptions::default()
        });

    let outcome = pipeline.respond(request).await;
    pipeline.shutdown();
    let outcome = outcome.map_err(|error| {
        eprintln!("{}", error.user_message());
        anyhow!(error)
    })?;

    let mut report = match &outcome {
        RespondOutcome::Delivered { signature, result } => json!({
            "outcome": "delivered",
            "signature": signature,
            "channel_id": target.destination_id(),
            "first_message_id": result.first_message.id,
            "message_ids": result.message_ids,
            "is_virtual": result.is_virtual,
            "skipped_chunks": result.skipped_chunks,
            "failed_chunks": result.failed_chunks,
        }),
        RespondOutcome::Joined { signature } => json!({
            "outcome": "joined",
            "signature": signature,
        }),
        RespondOutcome::Suppressed { signature } => json!({
            "outcome": "suppressed",
            "signature": signature,
        }),
    };
    if args.dry_run {
        report["recorded_sends"] =
            serde_json::to_value(recorder.sends()).context("failed to render recorded sends")?;
    }
    info!(
        channel_id = target.destination_id(),
        dry_run = args.dry_run,
        "relay deliver finished"
    );
    Ok(report)
}

pub(crate) fn execute_chunk_preview(args: &ChunkPreviewArgs) -> Result<Value> {
    let text = load_text(&args.text)?;
    let chunks = build_message_chunks(&text, args.max_message_chars, Vec::new(), Vec::new());
    let rendered: Vec<Value> = chunks
        .iter()
        .map(|chunk| {
            json!({
                "index": chunk.index,
                "is_first": chunk.is_first,
                "is_last": chunk.is_last,
                "chars": chunk.text.chars().count(),
                "text": chunk.text,
            })
        })
        .collect();
    Ok(json!({
        "max_message_chars": args.max_message_chars,
        "chunk_count": rendered.len(),
        "chunks": rendered,
    }))
}
