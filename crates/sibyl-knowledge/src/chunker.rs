//! Sentence-aligned text chunking.
//!
//! Target ≈800 tokens per chunk with ≈100 tokens of trailing overlap carried
//! into the next chunk. Sentences are never split unless a single sentence
//! alone exceeds the hard ceiling.

use sibyl_core::types::approx_tokens;

/// Target chunk size in tokens.
pub const TARGET_TOKENS: usize = 800;
/// Overlap carried between consecutive chunks, in tokens.
pub const OVERLAP_TOKENS: usize = 100;
/// A lone sentence longer than this is hard-split on whitespace.
const MAX_SENTENCE_TOKENS: usize = 1_000;

/// Split text into overlapping chunks respecting sentence boundaries.
pub fn chunk_text(text: &str) -> Vec<String> {
    chunk_with(text, TARGET_TOKENS, OVERLAP_TOKENS)
}

pub fn chunk_with(text: &str, target_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<String> = Vec::new();
    // Sentences pending for the current chunk; overlap re-seeds this between
    // chunks.
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0usize;

    for sentence in sentences {
        let tokens = approx_tokens(&sentence);
        if current_tokens + tokens > target_tokens && !current.is_empty() {
            chunks.push(current.join(" "));
            let carried = overlap_tail(&current, overlap_tokens);
            current_tokens = carried.iter().map(|s| approx_tokens(s)).sum();
            current = carried;
        }
        current.push(sentence);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        let tail = current.join(" ");
        // Drop a final chunk that is pure overlap of the previous one.
        if chunks.last().map(|prev| prev.ends_with(&tail)) != Some(true) {
            chunks.push(tail);
        }
    }
    chunks
}

/// Trailing sentences totalling at most `overlap_tokens`, oldest first.
fn overlap_tail(sentences: &[String], overlap_tokens: usize) -> Vec<String> {
    let mut carried: Vec<String> = Vec::new();
    let mut total = 0usize;
    for sentence in sentences.iter().rev() {
        let tokens = approx_tokens(sentence);
        if total + tokens > overlap_tokens {
            break;
        }
        total += tokens;
        carried.push(sentence.clone());
    }
    carried.reverse();
    carried
}

/// Sentence splitter: terminal punctuation followed by whitespace, or blank
/// lines. Oversized sentences are broken on whitespace at the hard ceiling.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences: Vec<String> = Vec::new();
    for paragraph in text.split("\n\n") {
        let mut start = 0usize;
        let bytes = paragraph.as_bytes();
        let mut i = 0usize;
        while i < bytes.len() {
            let c = bytes[i] as char;
            if matches!(c, '.' | '!' | '?') {
                // Consume trailing punctuation runs ("?!", "...").
                let mut end = i + 1;
                while end < bytes.len() && matches!(bytes[end] as char, '.' | '!' | '?') {
                    end += 1;
                }
                if end >= bytes.len() || (bytes[end] as char).is_whitespace() {
                    let s = paragraph[start..end].trim();
                    if !s.is_empty() {
                        sentences.push(s.to_string());
                    }
                    start = end;
                    i = end;
                    continue;
                }
            }
            i += 1;
        }
        let rest = paragraph[start..].trim();
        if !rest.is_empty() {
            sentences.push(rest.to_string());
        }
    }

    // Hard-split anything a single sentence couldn't fit.
    sentences
        .into_iter()
        .flat_map(|s| {
            if approx_tokens(&s) <= MAX_SENTENCE_TOKENS {
                vec![s]
            } else {
                hard_split(&s, MAX_SENTENCE_TOKENS)
            }
        })
        .collect()
}

fn hard_split(s: &str, max_tokens: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for word in s.split_whitespace() {
        if !current.is_empty() && approx_tokens(&current) + approx_tokens(word) > max_tokens {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("One sentence. Another sentence.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "One sentence. Another sentence.");
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(chunk_text("").is_empty());
        assert!(chunk_text("   \n\n  ").is_empty());
    }

    #[test]
    fn sentences_survive_splitting() {
        let sentences = split_sentences("Hello there! How are you? Fine. Versions like 1.2 stay.");
        assert_eq!(
            sentences,
            vec![
                "Hello there!",
                "How are you?",
                "Fine.",
                "Versions like 1.2 stay."
            ]
        );
    }

    #[test]
    fn paragraph_breaks_split() {
        let sentences = split_sentences("no terminal punctuation\n\nsecond paragraph");
        assert_eq!(sentences.len(), 2);
    }

    #[test]
    fn chunks_respect_target_and_overlap() {
        // 40 sentences of ~25 tokens each → ~1000 tokens total.
        let text: String = (0..40)
            .map(|i| format!("Sentence number {i} contains a fair amount of descriptive filler text to inflate its token count meaningfully."))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_with(&text, 200, 50);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(approx_tokens(c) <= 200 + 50, "chunk too large: {} tokens", approx_tokens(c));
        }
        // Overlap: some sentence from the end of chunk 0 reappears in chunk 1.
        let last_sentence = split_sentences(&chunks[0]).pop().unwrap();
        assert!(chunks[1].contains(&last_sentence));
    }

    #[test]
    fn oversized_sentence_is_hard_split() {
        let monster = "word ".repeat(6_000);
        let chunks = chunk_text(&monster);
        assert!(chunks.len() > 1);
    }
}
