//! Paragraph-aware text chunker.
//!
//! Splits document text into chunks that respect a character budget.
//! Paragraphs (blank-line separated) are accumulated into a chunk until
//! adding the next one would exceed the budget; a paragraph is never split
//! across chunks unless it alone exceeds the budget, in which case it is
//! hard-split at the nearest newline or space boundary.
//!
//! The budget counts characters, not bytes, so CJK text is budgeted the
//! same way as ASCII.

/// Split text into paragraphs on blank-line boundaries.
///
/// A boundary is a line consisting only of whitespace. Returned slices
/// are trimmed; empty paragraphs are dropped.
pub fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut paragraphs = Vec::new();
    let mut start = 0;
    let mut cursor = 0;
    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            let para = text[start..cursor].trim();
            if !para.is_empty() {
                paragraphs.push(para);
            }
            start = cursor + line.len();
        }
        cursor += line.len();
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        paragraphs.push(tail);
    }
    paragraphs
}

/// Split text into chunks of at most `max_chars` characters each,
/// respecting paragraph boundaries where possible.
///
/// Whitespace-only input yields no chunks. Chunks joined from several
/// paragraphs keep a blank line between them.
pub fn chunk_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for para in split_paragraphs(text) {
        let para_chars = para.chars().count();

        if para_chars > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            hard_split(para, max_chars, &mut chunks);
            continue;
        }

        let joined = if current.is_empty() {
            para_chars
        } else {
            current_chars + 2 + para_chars
        };
        if joined > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
            current_chars += 2;
        }
        current.push_str(para);
        current_chars += para_chars;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Cut an oversized paragraph into budget-sized pieces, preferring to cut
/// just after a newline or space; if none exists in the window, cut at
/// exactly `max_chars` characters.
fn hard_split(para: &str, max_chars: usize, out: &mut Vec<String>) {
    let mut remaining = para;
    while !remaining.is_empty() {
        let remaining_chars = remaining.chars().count();
        if remaining_chars <= max_chars {
            out.push(remaining.trim().to_string());
            break;
        }

        // Byte offset of the character right past the budget window.
        let window_end = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());

        let window = &remaining[..window_end];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(window_end);

        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[cut..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_paragraphs("Hello, world.", 1000);
        assert_eq!(chunks, vec!["Hello, world."]);
    }

    #[test]
    fn whitespace_only_yields_nothing() {
        assert!(chunk_paragraphs("  \n\n   \n", 1000).is_empty());
    }

    #[test]
    fn paragraphs_accumulate_under_budget() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_paragraphs(text, 1000);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("First paragraph."));
        assert!(chunks[0].contains("Third paragraph."));
    }

    #[test]
    fn paragraphs_never_split_while_under_budget() {
        let text = "alpha beta gamma.\n\ndelta epsilon zeta.\n\neta theta iota.";
        let chunks = chunk_paragraphs(text, 20);
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 20);
        }
    }

    #[test]
    fn continuous_text_splits_into_exact_pieces() {
        // 2,500 characters, no blank lines, 1,000-char budget: exactly
        // three chunks, none above the budget.
        let text: String = std::iter::repeat('x').take(2500).collect();
        let chunks = chunk_paragraphs(&text, 1000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 1000);
        assert_eq!(chunks[1].chars().count(), 1000);
        assert_eq!(chunks[2].chars().count(), 500);
    }

    #[test]
    fn oversized_paragraph_prefers_space_boundary() {
        let word = "lorem ";
        let text: String = word.repeat(300); // 1,800 chars of words
        let chunks = chunk_paragraphs(&text, 1000);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 1000);
            assert!(!chunk.starts_with(' '));
        }
    }

    #[test]
    fn multibyte_text_budgeted_by_chars() {
        let text: String = std::iter::repeat('结').take(30).collect();
        let chunks = chunk_paragraphs(&text, 10);
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert_eq!(chunk.chars().count(), 10);
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        assert_eq!(chunk_paragraphs(text, 12), chunk_paragraphs(text, 12));
    }

    #[test]
    fn split_paragraphs_handles_ragged_blank_lines() {
        let text = "one\n \n\ntwo\nstill two\n\n\nthree";
        let paras = split_paragraphs(text);
        assert_eq!(paras, vec!["one", "two\nstill two", "three"]);
    }
}
