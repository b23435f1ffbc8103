use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard per-message content limit of the chat platform.
pub const PLATFORM_MAX_MESSAGE_CHARS: usize = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Identity a response is delivered under.
pub struct Persona {
    /// Stable personality name used for dedup and pending markers.
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Persona {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelKind {
    /// Regular guild text channel that supports proxy-identity sends.
    Guild,
    /// Thread under `DeliveryTarget::channel_id`.
    Thread { thread_id: String },
    DirectMessage,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guild => "guild",
            Self::Thread { .. } => "thread",
            Self::DirectMessage => "direct_message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    /// Channel id; for threads this is the parent channel.
    pub channel_id: String,
    pub kind: ChannelKind,
}

impl DeliveryTarget {
    pub fn guild(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            kind: ChannelKind::Guild,
        }
    }

    pub fn thread(parent_channel_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            channel_id: parent_channel_id.into(),
            kind: ChannelKind::Thread {
                thread_id: thread_id.into(),
            },
        }
    }

    pub fn direct_message(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            kind: ChannelKind::DirectMessage,
        }
    }

    pub fn thread_id(&self) -> Option<&str> {
        match &self.kind {
            ChannelKind::Thread { thread_id } => Some(thread_id.as_str()),
            _ => None,
        }
    }

    /// Channel the messages become visible in. Pacing and duplicate checks key
    /// on this id.
    pub fn destination_id(&self) -> &str {
        self.thread_id().unwrap_or(self.channel_id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// File referenced by URL; the transport decides how to upload or link it.
pub struct OutboundFile {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Image,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Image => "image",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Media detected in a response by an upstream collaborator.
pub struct MediaReference {
    pub kind: MediaKind,
    pub url: String,
}

impl MediaReference {
    pub fn file_name(&self) -> String {
        let tail = self
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .trim();
        if tail.is_empty() {
            format!("{}-attachment", self.kind.as_str())
        } else {
            tail.to_string()
        }
    }

    pub fn to_outbound_file(&self) -> OutboundFile {
        OutboundFile {
            name: self.file_name(),
            url: self.url.clone(),
            content_type: None,
        }
    }
}

/// Orders media so audio is delivered before images, preserving input order
/// within a kind.
pub fn prioritize_media(media: &[MediaReference]) -> Vec<MediaReference> {
    let mut ordered = media.to_vec();
    ordered.sort_by_key(|reference| reference.kind);
    ordered
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    #[serde(default)]
    pub files: Vec<OutboundFile>,
    #[serde(default)]
    pub embeds: Vec<Value>,
    #[serde(default)]
    pub media: Vec<MediaReference>,
}

impl DeliveryOptions {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.embeds.is_empty() && self.media.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// One platform-sized slice of a response.
pub struct MessageChunk {
    pub index: usize,
    pub is_first: bool,
    pub is_last: bool,
    pub text: String,
    pub files: Vec<OutboundFile>,
    pub embeds: Vec<Value>,
}

impl MessageChunk {
    pub fn has_extras(&self) -> bool {
        !self.files.is_empty() || !self.embeds.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    pub first_message: SentMessage,
    pub message_ids: Vec<String>,
    /// True when every chunk was skipped as a duplicate and `first_message` is
    /// synthetic.
    pub is_virtual: bool,
    pub skipped_chunks: Vec<usize>,
    pub failed_chunks: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::{prioritize_media, DeliveryTarget, MediaKind, MediaReference};

    #[test]
    fn unit_destination_id_prefers_thread() {
        assert_eq!(DeliveryTarget::guild("c1").destination_id(), "c1");
        assert_eq!(DeliveryTarget::thread("c1", "t9").destination_id(), "t9");
        assert_eq!(DeliveryTarget::direct_message("dm3").destination_id(), "dm3");
    }

    #[test]
    fn unit_prioritize_media_puts_audio_first() {
        let media = vec![
            MediaReference {
                kind: MediaKind::Image,
                url: "https://cdn.example/a.png".to_string(),
            },
            MediaReference {
                kind: MediaKind::Audio,
                url: "https://cdn.example/b.mp3".to_string(),
            },
            MediaReference {
                kind: MediaKind::Image,
                url: "https://cdn.example/c.png".to_string(),
            },
        ];
        let ordered = prioritize_media(&media);
        let urls: Vec<&str> = ordered.iter().map(|item| item.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://cdn.example/b.mp3",
                "https://cdn.example/a.png",
                "https://cdn.example/c.png"
            ]
        );
    }

    #[test]
    fn unit_media_file_name_strips_query() {
        let reference = MediaReference {
            kind: MediaKind::Audio,
            url: "https://cdn.example/voice/reply.mp3?sig=abc".to_string(),
        };
        assert_eq!(reference.file_name(), "reply.mp3");
        let bare = MediaReference {
            kind: MediaKind::Image,
            url: "https://cdn.example/".to_string(),
        };
        assert_eq!(bare.file_name(), "image-attachment");
    }
}
