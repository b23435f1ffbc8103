use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use relay_dedup::{
    DedupConfig, DEFAULT_CLEANUP_INTERVAL_MS, DEFAULT_ERROR_BLACKOUT_MS, DEFAULT_REQUEST_TTL_MS,
};
use relay_delivery::{
    EngineConfig, MediaKind, MediaReference, ThrottleConfig, DEFAULT_CHUNK_DELAY_MS,
    DEFAULT_DUPLICATE_WINDOW_MS, DEFAULT_MAX_ERROR_WAIT_MS, DEFAULT_MEDIA_FOLLOWUP_DELAY_MS,
    DEFAULT_MIN_MESSAGE_DELAY_MS, PLATFORM_MAX_MESSAGE_CHARS,
};
use relay_discord::{DEFAULT_DISCORD_API_BASE, DEFAULT_HTTP_TIMEOUT_MS};
use relay_pipeline::PipelineConfig;

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_webhook_mapping(value: &str) -> Result<(String, String), String> {
    let (channel_id, url) = value
        .split_once('=')
        .ok_or_else(|| "expected <channel-id>=<webhook-url>".to_string())?;
    let channel_id = channel_id.trim();
    let url = url.trim();
    if channel_id.is_empty() || url.is_empty() {
        return Err("channel id and webhook url must be non-empty".to_string());
    }
    Ok((channel_id.to_string(), url.to_string()))
}

fn parse_media_reference(value: &str) -> Result<MediaReference, String> {
    let (kind, url) = value
        .split_once('=')
        .ok_or_else(|| "expected audio=<url> or image=<url>".to_string())?;
    let kind = match kind.trim().to_ascii_lowercase().as_str() {
        "audio" => MediaKind::Audio,
        "image" => MediaKind::Image,
        other => return Err(format!("unsupported media kind '{other}'")),
    };
    let url = url.trim();
    if url.is_empty() {
        return Err("media url must be non-empty".to_string());
    }
    Ok(MediaReference {
        kind,
        url: url.to_string(),
    })
}

#[derive(Debug, Parser)]
#[command(
    name = "relay",
    about = "Deduplicated, paced, chunked delivery of persona responses to Discord",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deliver a response through dedup, pacing and chunked fallback delivery.
    Deliver(DeliverArgs),
    /// Print how a response would be split into chunks.
    ChunkPreview(ChunkPreviewArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliChannelKind {
    Guild,
    Thread,
    Dm,
}

#[derive(Debug, Clone, Args)]
pub struct TextSourceArgs {
    #[arg(
        long,
        conflicts_with = "text_file",
        required_unless_present = "text_file",
        help = "Response text to deliver."
    )]
    pub text: Option<String>,

    #[arg(long = "text-file", help = "Read the response text from a file.")]
    pub text_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct DeliverArgs {
    #[command(flatten)]
    pub text: TextSourceArgs,

    #[arg(
        long,
        env = "RELAY_PERSONALITY",
        help = "Personality name used for deduplication and pending markers."
    )]
    pub personality: String,

    #[arg(
        long = "display-name",
        env = "RELAY_DISPLAY_NAME",
        help = "Display name shown on proxy-identity sends. Defaults to the personality name."
    )]
    pub display_name: Option<String>,

    #[arg(long = "avatar-url", env = "RELAY_AVATAR_URL")]
    pub avatar_url: Option<String>,

    #[arg(long = "channel-id", env = "RELAY_CHANNEL_ID")]
    pub channel_id: String,

    #[arg(
        long = "channel-kind",
        env = "RELAY_CHANNEL_KIND",
        value_enum,
        default_value = "guild"
    )]
    pub channel_kind: CliChannelKind,

    #[arg(
        long = "thread-id",
        env = "RELAY_THREAD_ID",
        help = "Thread id; required when --channel-kind=thread."
    )]
    pub thread_id: Option<String>,

    #[arg(
        long = "user-id",
        env = "RELAY_USER_ID",
        help = "Requesting user id; part of the request signature."
    )]
    pub user_id: Option<String>,

    #[arg(long = "reply-to-message-id")]
    pub reply_to_message_id: Option<String>,

    #[arg(
        long = "media",
        value_parser = parse_media_reference,
        help = "Media reference as audio=<url> or image=<url>. Repeatable."
    )]
    pub media: Vec<MediaReference>,

    #[arg(
        long = "dry-run",
        help = "Record sends in memory and print them instead of calling Discord."
    )]
    pub dry_run: bool,

    #[command(flatten)]
    pub discord: DiscordArgs,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

#[derive(Debug, Clone, Args)]
pub struct DiscordArgs {
    #[arg(
        long = "discord-api-base",
        env = "RELAY_DISCORD_API_BASE",
        default_value = DEFAULT_DISCORD_API_BASE
    )]
    pub discord_api_base: String,

    #[arg(long = "discord-bot-token", env = "RELAY_DISCORD_BOT_TOKEN", hide_env_values = true)]
    pub discord_bot_token: Option<String>,

    #[arg(
        long = "webhook",
        env = "RELAY_DISCORD_WEBHOOKS",
        value_delimiter = ',',
        value_parser = parse_webhook_mapping,
        hide_env_values = true,
        help = "Webhook for proxy-identity sends as <channel-id>=<url>. Repeatable."
    )]
    pub webhooks: Vec<(String, String)>,

    #[arg(
        long = "http-timeout-ms",
        env = "RELAY_HTTP_TIMEOUT_MS",
        default_value_t = DEFAULT_HTTP_TIMEOUT_MS,
        value_parser = parse_positive_u64
    )]
    pub http_timeout_ms: u64,
}

#[derive(Debug, Clone, Args)]
pub struct PipelineArgs {
    #[arg(
        long = "request-ttl-ms",
        env = "RELAY_REQUEST_TTL_MS",
        default_value_t = DEFAULT_REQUEST_TTL_MS,
        value_parser = parse_positive_u64
    )]
    pub request_ttl_ms: u64,

    #[arg(
        long = "error-blackout-ms",
        env = "RELAY_ERROR_BLACKOUT_MS",
        default_value_t = DEFAULT_ERROR_BLACKOUT_MS,
        value_parser = parse_positive_u64
    )]
    pub error_blackout_ms: u64,

    #[arg(
        long = "cleanup-interval-ms",
        env = "RELAY_CLEANUP_INTERVAL_MS",
        default_value_t = DEFAULT_CLEANUP_INTERVAL_MS,
        value_parser = parse_positive_u64
    )]
    pub cleanup_interval_ms: u64,

    #[arg(
        long = "max-error-wait-ms",
        env = "RELAY_MAX_ERROR_WAIT_MS",
        default_value_t = DEFAULT_MAX_ERROR_WAIT_MS,
        value_parser = parse_positive_u64
    )]
    pub max_error_wait_ms: u64,

    #[arg(
        long = "min-message-delay-ms",
        env = "RELAY_MIN_MESSAGE_DELAY_MS",
        default_value_t = DEFAULT_MIN_MESSAGE_DELAY_MS
    )]
    pub min_message_delay_ms: u64,

    #[arg(
        long = "chunk-delay-ms",
        env = "RELAY_CHUNK_DELAY_MS",
        default_value_t = DEFAULT_CHUNK_DELAY_MS
    )]
    pub chunk_delay_ms: u64,

    #[arg(
        long = "media-followup-delay-ms",
        env = "RELAY_MEDIA_FOLLOWUP_DELAY_MS",
        default_value_t = DEFAULT_MEDIA_FOLLOWUP_DELAY_MS
    )]
    pub media_followup_delay_ms: u64,

    #[arg(
        long = "duplicate-window-ms",
        env = "RELAY_DUPLICATE_WINDOW_MS",
        default_value_t = DEFAULT_DUPLICATE_WINDOW_MS,
        help = "Skip chunks repeated by the same sender within this window. 0 disables."
    )]
    pub duplicate_window_ms: u64,

    #[arg(
        long = "max-message-chars",
        env = "RELAY_MAX_MESSAGE_CHARS",
        default_value_t = PLATFORM_MAX_MESSAGE_CHARS,
        value_parser = parse_positive_usize
    )]
    pub max_message_chars: usize,
}

impl PipelineArgs {
    pub fn to_config(&self) -> PipelineConfig {
        PipelineConfig {
            dedup: DedupConfig {
                request_ttl_ms: self.request_ttl_ms,
                error_blackout_ms: self.error_blackout_ms,
                cleanup_interval_ms: self.cleanup_interval_ms,
            },
            throttle: ThrottleConfig {
                min_message_delay_ms: self.min_message_delay_ms,
                max_error_wait_ms: self.max_error_wait_ms,
            },
            engine: EngineConfig {
                max_message_chars: self.max_message_chars,
                chunk_delay_ms: self.chunk_delay_ms,
                media_followup_delay_ms: self.media_followup_delay_ms,
                duplicate_window_ms: self.duplicate_window_ms,
            },
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ChunkPreviewArgs {
    #[command(flatten)]
    pub text: TextSourceArgs,

    #[arg(
        long = "max-message-chars",
        env = "RELAY_MAX_MESSAGE_CHARS",
        default_value_t = PLATFORM_MAX_MESSAGE_CHARS,
        value_parser = parse_positive_usize
    )]
    pub max_message_chars: usize,
}
