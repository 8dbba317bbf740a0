//! Language-aware recursive text chunker.
//!
//! Splits documents into overlapping chunks no longer than
//! `chunk_size` characters. Splitting tries a priority ladder of separators,
//! so paragraph breaks are preferred over sentence breaks, and sentence
//! breaks over word breaks. In Chinese-aware mode the ladder carries the
//! full-width terminators; the mode is selected explicitly via config or
//! automatically when at least 30% of a document's characters are Chinese.
//!
//! Two overlap regimes:
//! - `respect_sentence_boundary = false`: a fixed sliding window; adjacent
//!   chunks from one source overlap by exactly `chunk_overlap` characters.
//! - `respect_sentence_boundary = true`: chunks are assembled from ladder
//!   fragments; the overlap carried into the next chunk is at most
//!   `chunk_overlap` characters, shrunk so that it starts just after the
//!   nearest sentence terminator inside the overlap window.

use std::collections::HashMap;

use crate::error::Result;
use crate::models::{Chunk, ChunkConfig, Document};

/// Separator ladder for general text.
const GENERAL_SEPARATORS: &[&str] = &["\n\n\n", "\n\n", "\n", ". ", " ", ""];

/// Separator ladder for Chinese-dominant text.
const CHINESE_SEPARATORS: &[&str] = &[
    "\n\n\n", "\n\n", "\n", "。", "？", "！", "；", "，", " ", "",
];

/// Auto-detection threshold: Chinese splitting kicks in at this ratio.
const CHINESE_RATIO_THRESHOLD: f64 = 0.3;

const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', '。', '！', '？', '；', ';', '\n'];

/// Split documents into chunks, preserving document order.
///
/// Each chunk carries `source` and a `chunk_index` that is monotone within
/// its source, even when a source spans several documents (PDF pages).
/// Empty documents produce no chunks.
pub fn split_documents(documents: &[Document], config: &ChunkConfig) -> Result<Vec<Chunk>> {
    config.validate()?;

    let mut next_index: HashMap<String, i64> = HashMap::new();
    let mut chunks = Vec::new();

    for doc in documents {
        let source = doc.source().to_string();
        let pieces = split_text(&doc.content, config);
        let counter = next_index.entry(source.clone()).or_insert(0);

        for piece in pieces {
            chunks.push(Chunk {
                content: piece,
                source: source.clone(),
                chunk_index: *counter,
                metadata: doc.metadata.clone(),
            });
            *counter += 1;
        }
    }

    Ok(chunks)
}

/// Split one text into chunk strings, each at most `chunk_size` characters.
pub fn split_text(text: &str, config: &ChunkConfig) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    if config.respect_sentence_boundary {
        split_with_sentence_boundaries(text, config)
    } else {
        split_fixed_window(text, config)
    }
}

/// Pick the separator ladder: explicit config wins, otherwise auto-detect.
fn separators_for(text: &str, config: &ChunkConfig) -> &'static [&'static str] {
    if config.chinese_aware || chinese_ratio(text) >= CHINESE_RATIO_THRESHOLD {
        CHINESE_SEPARATORS
    } else {
        GENERAL_SEPARATORS
    }
}

/// Ratio of CJK ideographs among non-whitespace characters.
pub fn chinese_ratio(text: &str) -> f64 {
    let mut total = 0usize;
    let mut chinese = 0usize;
    for c in text.chars() {
        if c.is_whitespace() {
            continue;
        }
        total += 1;
        if ('\u{4e00}'..='\u{9fff}').contains(&c) {
            chinese += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    chinese as f64 / total as f64
}

/// Fixed-stride character window. Every adjacent pair overlaps by exactly
/// `chunk_overlap` characters.
fn split_fixed_window(text: &str, config: &ChunkConfig) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let size = config.chunk_size;
    let step = size - config.chunk_overlap;

    if chars.len() <= size {
        return vec![text.to_string()];
    }

    let mut out = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + size).min(chars.len());
        out.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    out
}

/// Boundary-respecting split: cut the text into ladder fragments, then pack
/// fragments greedily, carrying a sentence-aligned overlap between chunks.
fn split_with_sentence_boundaries(text: &str, config: &ChunkConfig) -> Vec<String> {
    let separators = separators_for(text, config);
    let fragments = recursive_split(text, separators, config.chunk_size);

    let mut out: Vec<String> = Vec::new();
    let mut current: Vec<char> = Vec::new();

    for frag in fragments {
        let frag_chars: Vec<char> = frag.chars().collect();
        if current.len() + frag_chars.len() > config.chunk_size && !current.is_empty() {
            let finished: String = current.iter().collect();
            let carry = overlap_tail(&current, config.chunk_overlap);
            out.push(finished);
            current = carry;
            // The carry alone may leave no room for the fragment; drop it
            // rather than exceed the size bound.
            if current.len() + frag_chars.len() > config.chunk_size {
                current.clear();
            }
        }
        current.extend(frag_chars);
    }

    if !current.iter().all(|c| c.is_whitespace()) {
        out.push(current.iter().collect());
    }

    out
}

/// Tail of a finished chunk to carry into the next one: at most `overlap`
/// characters, shrunk to start just after the nearest sentence terminator
/// inside the window. Without any terminator in the window the raw tail is
/// used.
fn overlap_tail(chars: &[char], overlap: usize) -> Vec<char> {
    if overlap == 0 || chars.is_empty() {
        return Vec::new();
    }
    let window_start = chars.len().saturating_sub(overlap);

    // Earliest terminator at or after the window start wins: that yields the
    // longest sentence-aligned overlap not exceeding the budget.
    for i in window_start..chars.len() {
        if i > 0 && SENTENCE_TERMINATORS.contains(&chars[i - 1]) {
            let tail: Vec<char> = chars[i..].to_vec();
            if tail.iter().all(|c| c.is_whitespace()) {
                return Vec::new();
            }
            return tail;
        }
    }
    chars[window_start..].to_vec()
}

/// Cut text into fragments of at most `max_len` characters by trying each
/// separator in priority order. Separators stay attached to the preceding
/// fragment so terminators survive for overlap alignment.
fn recursive_split(text: &str, separators: &[&str], max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let (sep, rest) = match separators.split_first() {
        Some(pair) => pair,
        None => return hard_split(text, max_len),
    };

    if sep.is_empty() {
        return hard_split(text, max_len);
    }
    if !text.contains(sep) {
        return recursive_split(text, rest, max_len);
    }

    let mut fragments = Vec::new();
    let mut pieces = text.split(sep).peekable();
    while let Some(piece) = pieces.next() {
        let with_sep = if pieces.peek().is_some() {
            format!("{piece}{sep}")
        } else {
            piece.to_string()
        };
        if with_sep.is_empty() {
            continue;
        }
        if with_sep.chars().count() > max_len {
            fragments.extend(recursive_split(&with_sep, rest, max_len));
        } else {
            fragments.push(with_sep);
        }
    }
    fragments
}

/// Last resort: split on raw character boundaries.
fn hard_split(text: &str, max_len: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_len)
        .map(|c| c.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(size: usize, overlap: usize, sentence: bool, chinese: bool) -> ChunkConfig {
        ChunkConfig {
            chunk_size: size,
            chunk_overlap: overlap,
            respect_sentence_boundary: sentence,
            chinese_aware: chinese,
        }
    }

    fn doc(text: &str, source: &str) -> Document {
        Document::new(text, source)
    }

    #[test]
    fn empty_document_produces_no_chunks() {
        let chunks = split_documents(&[doc("", "a.txt")], &config(100, 10, true, false)).unwrap();
        assert!(chunks.is_empty());

        let chunks =
            split_documents(&[doc("   \n\n ", "a.txt")], &config(100, 10, true, false)).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn invalid_config_fails() {
        assert!(split_documents(&[], &config(10, 10, false, false)).is_err());
        assert!(split_documents(&[], &config(0, 0, false, false)).is_err());
    }

    #[test]
    fn every_chunk_within_size_bound() {
        let text = "Lorem ipsum dolor sit amet. ".repeat(40);
        for sentence in [true, false] {
            let cfg = config(120, 20, sentence, false);
            for piece in split_text(&text, &cfg) {
                assert!(
                    piece.chars().count() <= 120,
                    "chunk too long ({} chars, sentence={sentence})",
                    piece.chars().count()
                );
            }
        }
    }

    #[test]
    fn fixed_window_overlap_is_exact() {
        let text: String = ('a'..='z').cycle().take(1000).collect();
        let cfg = config(100, 25, false, false);
        let pieces = split_text(&text, &cfg);
        assert!(pieces.len() > 1);
        for pair in pieces.windows(2) {
            let a: Vec<char> = pair[0].chars().collect();
            let b: Vec<char> = pair[1].chars().collect();
            let tail: String = a[a.len() - 25..].iter().collect();
            let head: String = b[..25].iter().collect();
            assert_eq!(tail, head, "adjacent chunks must overlap by exactly 25");
        }
    }

    #[test]
    fn sentence_mode_overlap_bounded_and_aligned() {
        let text = "First sentence here. Second sentence follows. Third one now. \
                    Fourth statement next. Fifth remark ends. Sixth thought too. \
                    Seventh idea comes. Eighth point lands. Ninth line closes."
            .to_string();
        let cfg = config(80, 30, true, false);
        let pieces = split_text(&text, &cfg);
        assert!(pieces.len() > 1);
        for pair in pieces.windows(2) {
            let a = &pair[0];
            let b = &pair[1];
            // Find the longest suffix of a that prefixes b: that is the carry.
            let a_chars: Vec<char> = a.chars().collect();
            let b_chars: Vec<char> = b.chars().collect();
            let max = a_chars.len().min(b_chars.len());
            let mut carry = 0;
            for k in (1..=max).rev() {
                if a_chars[a_chars.len() - k..] == b_chars[..k] {
                    carry = k;
                    break;
                }
            }
            assert!(carry <= 30, "overlap {carry} exceeds configured 30");
        }
    }

    #[test]
    fn chinese_ratio_detection() {
        assert!(chinese_ratio("李小勇与张三合伙投资") > 0.9);
        assert_eq!(chinese_ratio("plain english text"), 0.0);
        let mixed = "abc 中文 def 内容"; // 4 Chinese of 10 non-space chars
        let r = chinese_ratio(mixed);
        assert!(r > 0.3 && r < 0.5, "got {r}");
        assert_eq!(chinese_ratio("   "), 0.0);
    }

    #[test]
    fn chinese_text_splits_on_fullwidth_terminators() {
        let sentence = "李小勇与张三合伙投资了甲乙丙科技有限公司。";
        let text = sentence.repeat(8);
        let cfg = config(60, 10, true, false);
        let pieces = split_text(&text, &cfg);
        assert!(pieces.len() > 1);
        // Ladder cuts at 。 so every piece but possibly the last ends with it.
        for piece in &pieces[..pieces.len() - 1] {
            assert!(
                piece.trim_end().ends_with('。'),
                "piece not sentence-aligned: {piece:?}"
            );
        }
    }

    #[test]
    fn short_text_single_chunk() {
        let pieces = split_text("Hello, world!", &config(100, 10, true, false));
        assert_eq!(pieces, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn chunk_index_monotone_within_source_across_documents() {
        let mut page1 = doc("First page content. ".repeat(30).as_str(), "report.pdf");
        page1
            .metadata
            .insert("page".to_string(), serde_json::json!(1));
        let mut page2 = doc("Second page content. ".repeat(30).as_str(), "report.pdf");
        page2
            .metadata
            .insert("page".to_string(), serde_json::json!(2));

        let chunks =
            split_documents(&[page1, page2], &config(100, 20, true, false)).unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as i64);
            assert_eq!(chunk.source, "report.pdf");
        }
    }

    #[test]
    fn independent_sources_count_separately() {
        let text = "Sentence one here. ".repeat(20);
        let chunks = split_documents(
            &[doc(&text, "a.txt"), doc(&text, "b.txt")],
            &config(80, 10, true, false),
        )
        .unwrap();
        let a_first = chunks.iter().find(|c| c.source == "a.txt").unwrap();
        let b_first = chunks.iter().find(|c| c.source == "b.txt").unwrap();
        assert_eq!(a_first.chunk_index, 0);
        assert_eq!(b_first.chunk_index, 0);
    }

    #[test]
    fn deterministic() {
        let text = "Alpha beta gamma. Delta epsilon zeta. Eta theta iota. ".repeat(10);
        let cfg = config(90, 15, true, false);
        assert_eq!(split_text(&text, &cfg), split_text(&text, &cfg));
    }

    #[test]
    fn oversize_word_hard_splits() {
        let text = "x".repeat(350);
        let cfg = config(100, 10, true, false);
        let pieces = split_text(&text, &cfg);
        assert_eq!(pieces.len(), 4);
        assert!(pieces.iter().all(|p| p.chars().count() <= 100));
        let rejoined: String = pieces.concat();
        assert_eq!(rejoined, text);
    }
}
