#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_delivery::{split_message_content, MIN_CHUNK_CHARS};

fuzz_target!(|data: &[u8]| {
    let Some((&width, rest)) = data.split_first() else {
        return;
    };
    let max_chars = (usize::from(width) * 8).max(MIN_CHUNK_CHARS);
    let content = String::from_utf8_lossy(rest);

    let chunks = split_message_content(&content, max_chars);
    if content.trim().is_empty() {
        assert!(chunks.len() <= 1);
        return;
    }
    assert!(!chunks.is_empty());
    for chunk in &chunks {
        assert!(chunk.chars().count() <= max_chars);
        assert!(!chunk.trim().is_empty());
    }
});
