//! Request signature derivation.
//!
//! The signature covers exactly: the personality name (trimmed, lower-cased),
//! the content (whitespace runs collapsed, trimmed), and the context fields
//! `user_id`, `channel_id`, `has_user_auth` and `reply_to_message_id`.

use sha2::{Digest, Sha256};

use crate::dedup_types::RequestContext;

const SIGNATURE_SCHEMA: &str = "relay-signature-v1";

pub fn normalize_personality_name(personality_name: &str) -> String {
    personality_name.trim().to_lowercase()
}

pub fn normalize_content(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Derives the dedup signature for one logical request.
pub fn request_signature(
    personality_name: &str,
    content: &str,
    context: Option<&RequestContext>,
) -> String {
    let default_context = RequestContext::default();
    let context = context.unwrap_or(&default_context);

    let mut hasher = Sha256::new();
    let mut field = |name: &str, value: &str| {
        hasher.update(name.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.len().to_le_bytes());
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    };
    field("schema", SIGNATURE_SCHEMA);
    field("personality", &normalize_personality_name(personality_name));
    field("content", &normalize_content(content));
    field("user_id", context.user_id.as_deref().unwrap_or_default().trim());
    field(
        "channel_id",
        context.channel_id.as_deref().unwrap_or_default().trim(),
    );
    field(
        "has_user_auth",
        if context.has_user_auth { "1" } else { "0" },
    );
    field(
        "reply_to_message_id",
        context
            .reply_to_message_id
            .as_deref()
            .unwrap_or_default()
            .trim(),
    );

    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{normalize_content, request_signature};
    use crate::dedup_types::RequestContext;

    fn context(user_id: &str, has_user_auth: bool) -> RequestContext {
        RequestContext {
            user_id: Some(user_id.to_string()),
            channel_id: Some("channel-1".to_string()),
            has_user_auth,
            reply_to_message_id: None,
        }
    }

    #[test]
    fn unit_normalize_content_collapses_whitespace() {
        assert_eq!(normalize_content("  hello \n\t there  "), "hello there");
    }

    #[test]
    fn unit_signature_is_case_insensitive_on_personality() {
        let ctx = context("user-1", true);
        assert_eq!(
            request_signature("Albert-Einstein", "hi", Some(&ctx)),
            request_signature("  albert-einstein ", "hi", Some(&ctx))
        );
    }

    #[test]
    fn unit_signature_ignores_whitespace_only_differences() {
        assert_eq!(
            request_signature("lilith", "what  is\nthis", None),
            request_signature("lilith", "what is this", None)
        );
    }

    #[test]
    fn unit_signature_separates_different_users() {
        assert_ne!(
            request_signature("lilith", "hi", Some(&context("user-1", true))),
            request_signature("lilith", "hi", Some(&context("user-2", true)))
        );
    }

    #[test]
    fn unit_signature_separates_auth_presence() {
        assert_ne!(
            request_signature("lilith", "hi", Some(&context("user-1", true))),
            request_signature("lilith", "hi", Some(&context("user-1", false)))
        );
    }

    #[test]
    fn unit_signature_treats_missing_context_as_default() {
        assert_eq!(
            request_signature("lilith", "hi", None),
            request_signature("lilith", "hi", Some(&RequestContext::default()))
        );
    }

    #[test]
    fn regression_signature_fields_do_not_bleed_into_each_other() {
        assert_ne!(
            request_signature("ab", "c", None),
            request_signature("a", "bc", None)
        );
    }

    #[test]
    fn unit_signature_is_hex_sha256() {
        let signature = request_signature("lilith", "hi", None);
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
