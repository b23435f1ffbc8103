//! Splits long responses into platform-sized chunks.
//!
//! Breaks prefer paragraph, then line, then sentence, then word boundaries and
//! fall back to a hard split. A chunk never ends inside an open code fence:
//! the split moves in front of the fence, or, when the fenced block alone is
//! larger than a chunk, the fence is closed at the chunk end and reopened with
//! the same info string at the start of the next chunk.

use serde_json::Value;

use crate::delivery_types::{MessageChunk, OutboundFile};

/// Smallest chunk size accepted; leaves room for a reopened fence line.
pub const MIN_CHUNK_CHARS: usize = 32;

const FENCE: &str = "```";
const FENCE_CLOSE: &str = "\n```";
const MAX_CARRIED_FENCE_CHARS: usize = 16;

#[derive(Debug, Clone)]
struct FenceLine {
    start: usize,
    end: usize,
    opener: String,
}

struct ContentChars {
    chars: Vec<char>,
    fences: Vec<FenceLine>,
}

impl ContentChars {
    fn new(content: &str) -> Self {
        let chars: Vec<char> = content.chars().collect();
        let mut fences = Vec::new();
        let mut line_start = 0usize;
        while line_start < chars.len() {
            let line_end = chars[line_start..]
                .iter()
                .position(|ch| *ch == '\n')
                .map(|offset| line_start + offset)
                .unwrap_or(chars.len());
            let line: String = chars[line_start..line_end].iter().collect();
            let trimmed = line.trim();
            if trimmed.starts_with(FENCE) {
                fences.push(FenceLine {
                    start: line_start,
                    end: line_end,
                    opener: carried_opener(trimmed),
                });
            }
            line_start = line_end + 1;
        }
        Self { chars, fences }
    }

    fn len(&self) -> usize {
        self.chars.len()
    }

    fn text(&self, start: usize, end: usize) -> String {
        self.chars[start..end].iter().collect()
    }

    /// The fence line left open just before `index`, if any.
    fn open_fence_before(&self, index: usize) -> Option<&FenceLine> {
        let toggles: Vec<&FenceLine> = self
            .fences
            .iter()
            .filter(|fence| fence.start < index)
            .collect();
        if toggles.len() % 2 == 1 {
            toggles.last().copied()
        } else {
            None
        }
    }

    /// A fence line that `index` would cut through.
    fn fence_line_containing(&self, index: usize) -> Option<&FenceLine> {
        self.fences
            .iter()
            .find(|fence| fence.start < index && index < fence.end)
    }

    fn has_visible_text(&self, start: usize, end: usize) -> bool {
        self.chars[start..end].iter().any(|ch| !ch.is_whitespace())
    }

    /// Picks `(chunk_end, next_start)` for a window `[start, window_end)`.
    fn find_break(&self, start: usize, window_end: usize) -> (usize, usize) {
        let budget = window_end - start;
        let min_end = start + (budget / 4).max(1);
        let chars = &self.chars;

        let paragraph = (min_end..=window_end)
            .rev()
            .find(|&index| index + 1 < chars.len() && chars[index] == '\n' && chars[index + 1] == '\n');
        if let Some(index) = paragraph {
            return (index, index + 2);
        }
        let line = (min_end..=window_end)
            .rev()
            .find(|&index| index < chars.len() && chars[index] == '\n');
        if let Some(index) = line {
            return (index, index + 1);
        }
        let sentence = (min_end.saturating_sub(1)..window_end).rev().find(|&index| {
            index + 1 < chars.len()
                && index + 1 > min_end
                && matches!(chars[index], '.' | '!' | '?')
                && chars[index + 1].is_whitespace()
        });
        if let Some(index) = sentence {
            return (index + 1, index + 2);
        }
        let word = (min_end..=window_end)
            .rev()
            .find(|&index| index < chars.len() && chars[index].is_whitespace());
        if let Some(index) = word {
            return (index, index + 1);
        }
        (window_end, window_end)
    }
}

fn carried_opener(fence_line: &str) -> String {
    if fence_line.chars().count() > MAX_CARRIED_FENCE_CHARS {
        FENCE.to_string()
    } else {
        fence_line.to_string()
    }
}

/// Splits `content` into pieces of at most `max_chars` characters.
pub fn split_message_content(content: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(MIN_CHUNK_CHARS);
    if content.trim().is_empty() {
        return Vec::new();
    }
    let text = ContentChars::new(content);
    if text.len() <= max_chars {
        return vec![content.to_string()];
    }

    let close_len = FENCE_CLOSE.chars().count();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut reopen: Option<String> = None;

    while start < text.len() {
        let prefix = reopen
            .take()
            .map(|opener| format!("{opener}\n"))
            .unwrap_or_default();
        let budget = max_chars - prefix.chars().count();
        if text.len() - start <= budget {
            push_chunk(&mut chunks, prefix, text.text(start, text.len()), None);
            break;
        }

        let (mut end, mut next) = text.find_break(start, start + budget);
        if let Some(fence) = text.fence_line_containing(end) {
            if fence.start > start {
                end = fence.start;
                next = fence.start;
            }
        }

        match text.open_fence_before(end).cloned() {
            Some(fence) if fence.start >= start && text.has_visible_text(start, fence.start) => {
                push_chunk(&mut chunks, prefix, text.text(start, fence.start), None);
                start = fence.start;
            }
            Some(_) => {
                let (end, next) = text.find_break(start, start + budget - close_len);
                match text.open_fence_before(end).cloned() {
                    Some(fence) => {
                        push_chunk(
                            &mut chunks,
                            prefix,
                            text.text(start, end),
                            Some(FENCE_CLOSE),
                        );
                        reopen = Some(fence.opener);
                    }
                    None => push_chunk(&mut chunks, prefix, text.text(start, end), None),
                }
                start = next;
            }
            None => {
                push_chunk(&mut chunks, prefix, text.text(start, end), None);
                start = next;
            }
        }
    }
    chunks
}

fn push_chunk(chunks: &mut Vec<String>, prefix: String, body: String, suffix: Option<&str>) {
    let body = body.trim_end();
    if body.trim().is_empty() && suffix.is_none() {
        return;
    }
    let mut chunk = prefix;
    chunk.push_str(body);
    if let Some(suffix) = suffix {
        chunk.push_str(suffix);
    }
    chunks.push(chunk);
}

/// Splits content and lays out chunk flags; files and embeds ride on the last
/// chunk only. Extras with no text produce a single empty-text chunk.
pub fn build_message_chunks(
    content: &str,
    max_chars: usize,
    files: Vec<OutboundFile>,
    embeds: Vec<Value>,
) -> Vec<MessageChunk> {
    let mut texts = split_message_content(content, max_chars);
    if texts.is_empty() {
        if files.is_empty() && embeds.is_empty() {
            return Vec::new();
        }
        texts.push(String::new());
    }
    let last_index = texts.len() - 1;
    let mut files = Some(files);
    let mut embeds = Some(embeds);
    texts
        .into_iter()
        .enumerate()
        .map(|(index, text)| {
            let is_last = index == last_index;
            MessageChunk {
                index,
                is_first: index == 0,
                is_last,
                text,
                files: if is_last {
                    files.take().unwrap_or_default()
                } else {
                    Vec::new()
                },
                embeds: if is_last {
                    embeds.take().unwrap_or_default()
                } else {
                    Vec::new()
                },
            }
        })
        .collect()
}
