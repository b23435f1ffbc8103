use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use relay_delivery::{
    BackendSendError, ChannelTransport, DeliveryTarget, DirectMessage, OutboundFile,
    ProxyInvocationMode, ProxyMessage, SentMessage,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

pub const DEFAULT_DISCORD_API_BASE: &str = "https://discord.com/api/v10";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5_000;

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordTransportConfig {
    pub api_base: String,
    pub bot_token: Option<String>,
    /// Webhook URL per parent channel id, used for proxy-identity sends.
    pub webhooks: BTreeMap<String, String>,
    pub http_timeout_ms: u64,
}

impl Default for DiscordTransportConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_DISCORD_API_BASE.to_string(),
            bot_token: None,
            webhooks: BTreeMap::new(),
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
        }
    }
}

impl std::fmt::Debug for DiscordTransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordTransportConfig")
            .field("api_base", &self.api_base)
            .field(
                "bot_token",
                &self.bot_token.as_ref().map(|_| "<redacted>"),
            )
            .field("webhook_channels", &self.webhooks.keys().collect::<Vec<_>>())
            .field("http_timeout_ms", &self.http_timeout_ms)
            .finish()
    }
}

#[derive(Debug, Clone)]
/// Discord REST implementation of [`ChannelTransport`].
///
/// Proxy-identity sends execute the channel's webhook; direct sends post to
/// the channel messages endpoint as the bot user.
pub struct DiscordRestTransport {
    config: DiscordTransportConfig,
    client: reqwest::Client,
}

impl DiscordRestTransport {
    pub fn new(config: DiscordTransportConfig) -> Result<Self> {
        if config.http_timeout_ms == 0 {
            return Err(anyhow!("discord transport requires http timeout > 0"));
        }
        if config.api_base.trim().is_empty() {
            return Err(anyhow!("discord transport requires a non-empty api base"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()
            .context("failed to build discord http client")?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &DiscordTransportConfig {
        &self.config
    }

    fn webhook_endpoint(
        &self,
        target: &DeliveryTarget,
        thread_id: Option<&str>,
    ) -> Result<String, BackendSendError> {
        let webhook = self
            .config
            .webhooks
            .get(&target.channel_id)
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                BackendSendError::new(
                    "delivery_webhook_unconfigured",
                    format!("no webhook configured for channel '{}'", target.channel_id),
                )
            })?;
        let separator = if webhook.contains('?') { '&' } else { '?' };
        let mut endpoint = format!("{webhook}{separator}wait=true");
        if let Some(thread_id) = thread_id {
            endpoint.push_str("&thread_id=");
            endpoint.push_str(&percent_encode_path_segment(thread_id));
        }
        Ok(endpoint)
    }

    fn channel_messages_endpoint(&self, channel_id: &str) -> String {
        format!(
            "{}/channels/{}/messages",
            self.config.api_base.trim_end_matches('/'),
            percent_encode_path_segment(channel_id)
        )
    }

    async fn post_json(
        &self,
        endpoint: &str,
        authorization: Option<String>,
        body: &Value,
        channel_id: &str,
    ) -> Result<SentMessage, BackendSendError> {
        let mut request = self.client.post(endpoint).json(body);
        if let Some(authorization) = authorization {
            request = request.header(reqwest::header::AUTHORIZATION, authorization);
        }
        let response = request.send().await.map_err(|error| {
            BackendSendError::new("delivery_transport_error", truncate_detail(&error.to_string()))
                .retryable()
        })?;
        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let (reason_code, retryable) = classify_provider_status(status);
            let mut error = BackendSendError::new(reason_code, truncate_detail(&raw))
                .with_http_status(status.as_u16());
            if retryable {
                error = error.retryable();
            }
            return Err(error);
        }
        let payload = serde_json::from_str::<Value>(&raw).unwrap_or(Value::Null);
        let id = match extract_message_id(&payload) {
            Some(id) => id,
            None => {
                warn!(
                    endpoint,
                    status = status.as_u16(),
                    "discord accepted message without returning an id"
                );
                "unknown".to_string()
            }
        };
        debug!(channel_id, message_id = %id, "discord message sent");
        Ok(SentMessage {
            id,
            channel_id: channel_id.to_string(),
        })
    }
}

#[async_trait]
impl ChannelTransport for DiscordRestTransport {
    async fn send_proxy_identity(
        &self,
        target: &DeliveryTarget,
        message: ProxyMessage,
    ) -> Result<SentMessage, BackendSendError> {
        let endpoint = self.webhook_endpoint(target, message.thread_id.as_deref())?;
        let body = proxy_identity_body(&message);
        self.post_json(&endpoint, None, &body, target.destination_id())
            .await
    }

    async fn send_direct(
        &self,
        target: &DeliveryTarget,
        message: DirectMessage,
    ) -> Result<SentMessage, BackendSendError> {
        let token = self
            .config
            .bot_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                BackendSendError::new(
                    "delivery_missing_bot_token",
                    "discord bot token is required for direct sends",
                )
            })?;
        let endpoint = self.channel_messages_endpoint(target.destination_id());
        let mut embeds = message.embeds;
        embeds.extend(message.files.iter().map(file_link_embed));
        let body = json!({
            "content": message.content,
            "embeds": embeds,
            "allowed_mentions": {"parse": []},
        });
        self.post_json(
            &endpoint,
            Some(format!("Bot {token}")),
            &body,
            target.destination_id(),
        )
        .await
    }
}

fn proxy_identity_body(message: &ProxyMessage) -> Value {
    let mut body = json!({
        "content": message.content,
        "username": message.display_name,
        "allowed_mentions": {"parse": []},
    });
    let avatar_url = match message.mode {
        ProxyInvocationMode::Primary => message.avatar_url.as_deref(),
        ProxyInvocationMode::Compat => message
            .avatar_url
            .as_deref()
            .filter(|url| is_valid_avatar_url(url)),
    };
    if let Some(avatar_url) = avatar_url {
        body["avatar_url"] = Value::String(avatar_url.to_string());
    }
    let mut embeds = message.embeds.clone();
    embeds.extend(message.files.iter().map(file_link_embed));
    if !embeds.is_empty() {
        body["embeds"] = Value::Array(embeds);
    }
    body
}

fn is_valid_avatar_url(url: &str) -> bool {
    reqwest::Url::parse(url)
        .map(|parsed| matches!(parsed.scheme(), "https" | "http") && parsed.host().is_some())
        .unwrap_or(false)
}

fn file_link_embed(file: &OutboundFile) -> Value {
    let mut embed = json!({
        "title": file.name,
        "url": file.url,
    });
    if file
        .content_type
        .as_deref()
        .is_some_and(|content_type| content_type.starts_with("image/"))
    {
        embed["image"] = json!({"url": file.url});
    }
    embed
}

fn classify_provider_status(status: StatusCode) -> (&'static str, bool) {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ("delivery_rate_limited", true);
    }
    if status.is_server_error() {
        return ("delivery_provider_unavailable", true);
    }
    if status.is_client_error() {
        return ("delivery_request_rejected", false);
    }
    ("delivery_unknown_http_failure", true)
}

fn extract_message_id(payload: &Value) -> Option<String> {
    payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn percent_encode_path_segment(value: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(value.len());
    for byte in value.as_bytes() {
        if matches!(byte, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~') {
            encoded.push(*byte as char);
        } else {
            encoded.push('%');
            encoded.push(HEX[(byte >> 4) as usize] as char);
            encoded.push(HEX[(byte & 0x0F) as usize] as char);
        }
    }
    encoded
}

fn truncate_detail(raw: &str) -> String {
    const LIMIT: usize = 512;
    let trimmed = raw.trim();
    if trimmed.chars().count() <= LIMIT {
        return trimmed.to_string();
    }
    let mut output: String = trimmed.chars().take(LIMIT).collect();
    output.push_str("...");
    output
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use httpmock::prelude::*;
    use relay_delivery::{
        ChannelTransport, DeliveryTarget, DirectMessage, OutboundFile, ProxyInvocationMode,
        ProxyMessage,
    };
    use serde_json::json;

    use super::{
        classify_provider_status, percent_encode_path_segment, truncate_detail,
        DiscordRestTransport, DiscordTransportConfig,
    };

    fn transport(server: &MockServer, bot_token: Option<&str>) -> DiscordRestTransport {
        let mut webhooks = BTreeMap::new();
        webhooks.insert("room-1".to_string(), server.url("/webhooks/77/secret"));
        DiscordRestTransport::new(DiscordTransportConfig {
            api_base: server.base_url(),
            bot_token: bot_token.map(str::to_string),
            webhooks,
            ..DiscordTransportConfig::default()
        })
        .expect("transport")
    }

    fn proxy_message(mode: ProxyInvocationMode, thread_id: Option<&str>) -> ProxyMessage {
        ProxyMessage {
            content: "hello from lilith".to_string(),
            display_name: "Lilith".to_string(),
            avatar_url: Some("https://cdn.example/lilith.png".to_string()),
            thread_id: thread_id.map(str::to_string),
            files: vec![OutboundFile {
                name: "voice.mp3".to_string(),
                url: "https://cdn.example/voice.mp3".to_string(),
                content_type: Some("audio/mpeg".to_string()),
            }],
            embeds: Vec::new(),
            mode,
        }
    }

    #[test]
    fn unit_classify_provider_status_matches_retry_policy() {
        assert_eq!(
            classify_provider_status(reqwest::StatusCode::TOO_MANY_REQUESTS),
            ("delivery_rate_limited", true)
        );
        assert_eq!(
            classify_provider_status(reqwest::StatusCode::BAD_GATEWAY),
            ("delivery_provider_unavailable", true)
        );
        assert_eq!(
            classify_provider_status(reqwest::StatusCode::FORBIDDEN),
            ("delivery_request_rejected", false)
        );
    }

    #[test]
    fn unit_truncate_detail_and_path_encoding() {
        let long = "x".repeat(600);
        let truncated = truncate_detail(&long);
        assert_eq!(truncated.chars().count(), 515);
        assert!(truncated.ends_with("..."));
        assert_eq!(percent_encode_path_segment("room 1/2"), "room%201%2F2");
    }

    #[test]
    fn regression_new_rejects_zero_timeout() {
        let error = DiscordRestTransport::new(DiscordTransportConfig {
            http_timeout_ms: 0,
            ..DiscordTransportConfig::default()
        })
        .expect_err("zero timeout");
        assert!(error.to_string().contains("http timeout"));
    }

    #[test]
    fn unit_debug_redacts_bot_token() {
        let config = DiscordTransportConfig {
            bot_token: Some("super-secret".to_string()),
            ..DiscordTransportConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn integration_proxy_identity_executes_webhook_with_thread_scope() {
        let server = MockServer::start();
        let webhook = server.mock(|when, then| {
            when.method(POST)
                .path("/webhooks/77/secret")
                .query_param("wait", "true")
                .query_param("thread_id", "thread-9")
                .json_body_includes(
                    json!({
                        "content": "hello from lilith",
                        "username": "Lilith",
                        "avatar_url": "https://cdn.example/lilith.png",
                        "embeds": [{"title": "voice.mp3", "url": "https://cdn.example/voice.mp3"}]
                    })
                    .to_string(),
                );
            then.status(200).json_body(json!({"id": "msg-100"}));
        });

        let sent = transport(&server, None)
            .send_proxy_identity(
                &DeliveryTarget::thread("room-1", "thread-9"),
                proxy_message(ProxyInvocationMode::Primary, Some("thread-9")),
            )
            .await
            .expect("webhook send");
        webhook.assert_calls(1);
        assert_eq!(sent.id, "msg-100");
        assert_eq!(sent.channel_id, "thread-9");
    }

    #[tokio::test]
    async fn integration_direct_send_posts_channel_message_as_bot() {
        let server = MockServer::start();
        let direct = server.mock(|when, then| {
            when.method(POST)
                .path("/channels/dm-5/messages")
                .header("authorization", "Bot discord-token")
                .json_body_includes(json!({"content": "**Lilith:** hi"}).to_string());
            then.status(200).json_body(json!({"id": "msg-7"}));
        });

        let sent = transport(&server, Some("discord-token"))
            .send_direct(
                &DeliveryTarget::direct_message("dm-5"),
                DirectMessage {
                    content: "**Lilith:** hi".to_string(),
                    files: Vec::new(),
                    embeds: Vec::new(),
                },
            )
            .await
            .expect("direct send");
        direct.assert_calls(1);
        assert_eq!(sent.id, "msg-7");
    }

    #[tokio::test]
    async fn integration_rate_limit_is_retryable_with_status() {
        let server = MockServer::start();
        let limited = server.mock(|when, then| {
            when.method(POST).path("/webhooks/77/secret");
            then.status(429)
                .json_body(json!({"message": "You are being rate limited.", "retry_after": 1.5}));
        });

        let error = transport(&server, None)
            .send_proxy_identity(
                &DeliveryTarget::guild("room-1"),
                proxy_message(ProxyInvocationMode::Primary, None),
            )
            .await
            .expect_err("rate limited");
        limited.assert_calls(1);
        assert_eq!(error.reason_code, "delivery_rate_limited");
        assert!(error.retryable);
        assert_eq!(error.http_status, Some(429));
        assert!(error.detail.contains("rate limited"));
    }

    #[tokio::test]
    async fn regression_compat_mode_drops_invalid_avatar() {
        let server = MockServer::start();
        let webhook = server.mock(|when, then| {
            when.method(POST)
                .path("/webhooks/77/secret")
                .body_excludes("avatar_url");
            then.status(200).json_body(json!({"id": "msg-3"}));
        });
        let mut message = proxy_message(ProxyInvocationMode::Compat, None);
        message.avatar_url = Some("not a url".to_string());

        transport(&server, None)
            .send_proxy_identity(&DeliveryTarget::guild("room-1"), message)
            .await
            .expect("compat send");
        webhook.assert_calls(1);
    }

    #[tokio::test]
    async fn regression_missing_webhook_and_token_fail_without_http() {
        let server = MockServer::start();
        let transport = transport(&server, None);

        let error = transport
            .send_proxy_identity(
                &DeliveryTarget::guild("room-unknown"),
                proxy_message(ProxyInvocationMode::Primary, None),
            )
            .await
            .expect_err("no webhook");
        assert_eq!(error.reason_code, "delivery_webhook_unconfigured");

        let error = transport
            .send_direct(
                &DeliveryTarget::guild("room-1"),
                DirectMessage {
                    content: "hi".to_string(),
                    files: Vec::new(),
                    embeds: Vec::new(),
                },
            )
            .await
            .expect_err("no token");
        assert_eq!(error.reason_code, "delivery_missing_bot_token");
        assert!(!error.retryable);
    }
}
