#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_dedup::{request_signature, RequestContext};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let (personality, content) = raw.split_once('\u{0}').unwrap_or(("lilith", raw.as_ref()));
    let context = RequestContext {
        user_id: Some("fuzz-user".to_string()),
        ..RequestContext::default()
    };

    let signature = request_signature(personality, content, Some(&context));
    assert_eq!(signature.len(), 64);
    assert!(signature.chars().all(|ch| ch.is_ascii_hexdigit()));

    let padded = format!("  {content}\n");
    assert_eq!(signature, request_signature(personality, &padded, Some(&context)));
    if personality.is_ascii() {
        let shouted = personality.to_ascii_uppercase();
        assert_eq!(signature, request_signature(&shouted, content, Some(&context)));
    }
    assert_ne!(signature, request_signature(personality, content, None));
});
