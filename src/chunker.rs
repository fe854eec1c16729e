//! Text chunking at semantic boundaries.
//!
//! Splits large documents into overlapping windows, preferring to cut at a
//! sentence end (`.`) or newline when one falls in the back half of the
//! window. Offsets are byte positions snapped to UTF-8 character
//! boundaries, so slicing is always safe on multilingual input.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// One window of the source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Dense 0-based position in the chunk sequence.
    pub index: u32,
    /// Trimmed window text. Never empty.
    pub text: String,
    /// Byte offset of the window start in the source.
    pub start: usize,
    /// Byte offset one past the window end in the source.
    pub end: usize,
}

/// Largest byte offset `<= at` that is a char boundary.
fn floor_char_boundary(text: &str, at: usize) -> usize {
    let mut at = at.min(text.len());
    while at > 0 && !text.is_char_boundary(at) {
        at -= 1;
    }
    at
}

/// Split `text` into chunks of at most `size` bytes with `overlap` bytes of
/// context carried between consecutive chunks.
///
/// Each window ends at the last `.` or `\n` in its back half when one
/// exists, otherwise at the size limit. Windows are trimmed before
/// emission and empty windows are dropped, so the concatenation of the
/// non-overlapping portions reproduces the input up to whitespace
/// trimming.
///
/// `overlap >= size` would rewind past the current window; the advance
/// clamps to the window end in that case so the loop always makes
/// progress.
pub fn chunk(text: &str, size: usize, overlap: usize) -> Vec<Chunk> {
    let len = text.len();
    if len == 0 || size == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < len {
        let mut end = floor_char_boundary(text, start + size);
        if end <= start {
            // A multi-byte char wider than the window; take it whole.
            end = text[start..]
                .chars()
                .next()
                .map(|c| start + c.len_utf8())
                .unwrap_or(len);
        }

        if end < len {
            if let Some(rel) = text[start..end].rfind(['.', '\n']) {
                let breakpoint = start + rel;
                if breakpoint > start + size / 2 {
                    end = breakpoint + 1; // '.' and '\n' are single-byte
                }
            }
        }

        let window = text[start..end].trim();
        if !window.is_empty() {
            chunks.push(Chunk {
                index: chunks.len() as u32,
                text: window.to_string(),
                start,
                end,
            });
        }

        if end >= len {
            break;
        }

        let next = floor_char_boundary(text, end.saturating_sub(overlap));
        start = if next <= start { end } else { next };
    }

    debug!(
        chunks = chunks.len(),
        bytes = len,
        size = size,
        overlap = overlap,
        "document chunked"
    );
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_yields_no_chunks() {
        assert!(chunk("", 100, 10).is_empty());
        assert!(chunk("   \n  ", 100, 10).is_empty());
    }

    #[test]
    fn test_short_input_is_a_single_chunk() {
        let chunks = chunk("hello world", 100, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(chunks[0].index, 0);
    }

    #[test]
    fn test_indexes_are_dense_and_zero_based() {
        let text = "a".repeat(1000);
        let chunks = chunk(&text, 100, 10);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index as usize, i);
        }
    }

    #[test]
    fn test_prefers_sentence_boundary_in_back_half() {
        // The '.' at byte 79 is past size/2 = 50, so the first chunk ends
        // just after it.
        let text = format!("{}. {}", "x".repeat(79), "y".repeat(100));
        let chunks = chunk(&text, 100, 0);
        assert!(chunks[0].text.ends_with('.'), "got: {:?}", chunks[0].text);
        assert_eq!(chunks[0].end, 80);
    }

    #[test]
    fn test_ignores_boundary_in_front_half() {
        // '.' at byte 9 is before size/2, so the cut is a hard cut at size.
        let text = format!("{}.{}", "x".repeat(9), "y".repeat(200));
        let chunks = chunk(&text, 100, 0);
        assert_eq!(chunks[0].end, 100);
    }

    #[test]
    fn test_every_chunk_within_size_budget() {
        let text = "word ".repeat(2000);
        for c in chunk(&text, 128, 32) {
            assert!(c.text.len() <= 128 + 32, "chunk too big: {}", c.text.len());
            assert!(c.end - c.start <= 128);
        }
    }

    #[test]
    fn test_no_empty_chunks_emitted() {
        let text = format!("para one.{}para two.", "\n".repeat(50));
        for c in chunk(&text, 40, 5) {
            assert!(!c.text.is_empty());
        }
    }

    #[test]
    fn test_chunks_cover_the_whole_document() {
        let text =
            "The quick brown fox. Jumps over the lazy dog. Again and again. ".repeat(50);
        let chunks = chunk(&text, 200, 20);
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, text.len());
        // Consecutive windows leave no gap
        for pair in chunks.windows(2) {
            assert!(pair[1].start <= pair[0].end, "gap between chunks");
        }
    }

    #[test]
    fn test_overlap_carries_context_between_chunks() {
        // No '.'/newline anywhere, so every cut is a hard cut at size.
        let text = "abcdefghij".repeat(30);
        let chunks = chunk(&text, 100, 20);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end - pair[1].start, 20, "expected 20-byte overlap");
        }
    }

    #[test]
    fn test_overlap_larger_than_size_still_terminates() {
        let text = "z".repeat(500);
        let chunks = chunk(&text, 50, 200);
        assert!(!chunks.is_empty());
        for pair in chunks.windows(2) {
            assert!(pair[1].start > pair[0].start, "progress must be monotonic");
        }
        assert_eq!(chunks.last().unwrap().end, text.len());
    }

    #[test]
    fn test_multibyte_input_never_splits_a_char() {
        let text = "héllo wörld—🦀 ".repeat(100);
        let chunks = chunk(&text, 64, 16);
        assert!(!chunks.is_empty());
        for c in &chunks {
            // Slicing at recorded offsets must not panic
            let _ = &text[c.start..c.end];
        }
    }

    #[test]
    fn test_reassembly_equals_input_modulo_whitespace() {
        let text = "one two three. four five six. seven eight nine. ".repeat(20);
        let chunks = chunk(&text, 120, 24);
        // Stitch the non-overlapping portions back together
        let mut rebuilt = String::new();
        let mut covered = 0usize;
        for c in &chunks {
            let from = c.start.max(covered);
            rebuilt.push_str(&text[from..c.end]);
            covered = c.end;
        }
        assert_eq!(
            rebuilt.split_whitespace().collect::<Vec<_>>(),
            text.split_whitespace().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_thirty_five_k_chars_at_sixteen_k_size_gives_three_chunks() {
        let sentence = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. ";
        let mut text = String::new();
        while text.len() < 35_000 {
            text.push_str(sentence);
        }
        let chunks = chunk(&text, 16_000, 800);
        assert_eq!(chunks.len(), 3, "35k chars at 16k size should be 3 chunks");
    }
}
