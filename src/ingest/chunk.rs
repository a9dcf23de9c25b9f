//! Structure-aware chunker (C6 stage 3): splits standardized text by slide/page markers,
//! then headings, then paragraphs, then sentences, and packs the sentence stream into
//! chunks bounded by the configured token thresholds with a carried-over overlap tail.
//!
//! Ported from the original `RecursiveDocumentChunker`, kept faithful to its block → section
//! → paragraph → sentence drill-down and its pack/overlap/hard-split/backward-merge rules.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::ChunkerOptions;

static SLIDE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^===\s*Slide\s+\d+\s*===$").unwrap());
static PAGE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^===\s*Page\s+\d+\s*===$").unwrap());
static HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+)").unwrap());
// The `regex` crate has no lookbehind, so sentence boundaries are matched as
// (punctuation)(whitespace) pairs and reassembled by hand in `sentences` below rather than
// with a single split pattern.
static SENTENCE_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([.!?]+)(\s+)").unwrap());
static BLANK_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockKind {
    Doc,
    Slide,
    Page,
}

/// Splits `text` into top-level blocks on slide/page marker lines (§4.6 stage 3: "split
/// top-level by slide/page markers"). A document with no markers yields a single `Doc`
/// block. The marker line itself stays inside its block as a title anchor, so a chunk
/// boundary can land on it (testable property 6: structure preservation).
fn split_by_markers(text: &str) -> Vec<(BlockKind, String)> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_kind = BlockKind::Doc;

    for line in lines {
        let trimmed = line.trim();
        if SLIDE_MARKER.is_match(trimmed) {
            flush(&mut blocks, current_kind, &mut current);
            current_kind = BlockKind::Slide;
            current.push(line);
            continue;
        }
        if PAGE_MARKER.is_match(trimmed) {
            flush(&mut blocks, current_kind, &mut current);
            current_kind = BlockKind::Page;
            current.push(line);
            continue;
        }
        current.push(line);
    }
    flush(&mut blocks, current_kind, &mut current);

    blocks.retain(|(_, text): &(BlockKind, String)| !text.trim().is_empty());
    blocks
}

fn flush(blocks: &mut Vec<(BlockKind, String)>, kind: BlockKind, current: &mut Vec<&str>) {
    if !current.is_empty() {
        blocks.push((kind, current.join("\n").trim().to_string()));
        current.clear();
    }
}

/// Splits a block by heading lines (§4.6 stage 3: "within each block, split by heading
/// lines"). A block with no headings yields a single body section.
fn split_headings(block: &str) -> Vec<String> {
    let mut sections: Vec<Vec<&str>> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in block.lines() {
        if HEADING.is_match(line.trim()) {
            if !current.is_empty() {
                sections.push(std::mem::take(&mut current));
            }
            current.push(line);
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        sections.push(current);
    }

    let merged: Vec<String> = sections
        .into_iter()
        .map(|lines| lines.join("\n").trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if merged.is_empty() {
        vec![block.to_string()]
    } else {
        merged
    }
}

/// Splits a section into paragraphs on blank lines, falling back to one paragraph per
/// non-blank line when there's no blank-line structure at all.
fn paragraphs(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    let parts: Vec<String> = BLANK_LINE
        .split(trimmed)
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if !parts.is_empty() {
        return parts;
    }
    let by_line: Vec<String> =
        trimmed.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect();
    if by_line.is_empty() {
        vec![trimmed.to_string()]
    } else {
        by_line
    }
}

/// Splits a paragraph into sentences on `.`/`!`/`?` followed by whitespace, after collapsing
/// internal whitespace runs.
fn sentences(text: &str) -> Vec<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return Vec::new();
    }

    let mut result = Vec::new();
    let mut last = 0usize;
    for caps in SENTENCE_BOUNDARY.captures_iter(&collapsed) {
        let punct = caps.get(1).unwrap();
        let whole = caps.get(0).unwrap();
        let sentence = collapsed[last..punct.end()].trim();
        if !sentence.is_empty() {
            result.push(sentence.to_string());
        }
        last = whole.end();
    }
    let tail = collapsed[last..].trim();
    if !tail.is_empty() {
        result.push(tail.to_string());
    }
    result
}

/// Packs a stream of sentence-level fragments into chunks bounded by `[min_chars, max_chars]`
/// targeting `target_chars`, carrying `overlap_chars` of the previous chunk's tail into the
/// next. Oversized single fragments are hard-split with the same overlap. A final undersized
/// chunk is merged backwards into the previous one when that keeps it within `max_chars`.
fn pack(fragments: &[String], opts: &ChunkerOptions) -> Vec<String> {
    let target = opts.target_chars();
    let max_len = opts.max_chars();
    let min_len = opts.min_chars();
    let overlap = opts.overlap_chars();

    let mut chunks: Vec<String> = Vec::new();
    let mut buf: Vec<String> = Vec::new();
    let mut buf_len = 0usize;

    for frag in fragments {
        let frag_len = frag.chars().count();

        // An oversized fragment is hard-split on its own, regardless of what's currently
        // buffered — it can never simply be appended to `buf` or carried into the final-tail
        // emit, both of which would let it through whole.
        if frag_len >= max_len {
            if buf_len > 0 {
                flush_buf(&mut chunks, &mut buf, &mut buf_len, overlap);
            }
            hard_split(frag, max_len, overlap, &mut chunks);
            buf.clear();
            buf_len = 0;
            continue;
        }

        if buf_len == 0 {
            buf.push(frag.clone());
            buf_len = frag_len;
            continue;
        }

        if buf_len + 1 + frag_len <= max_len {
            buf.push(frag.clone());
            buf_len += 1 + frag_len;
            if buf_len >= target {
                flush_buf(&mut chunks, &mut buf, &mut buf_len, overlap);
            }
        } else if buf_len >= min_len {
            flush_buf(&mut chunks, &mut buf, &mut buf_len, overlap);
            buf.push(frag.clone());
            buf_len = frag_len;
        } else {
            if !buf.is_empty() {
                chunks.push(buf.join(" ").trim().to_string());
            }
            let tail = if overlap > 0 && !chunks.is_empty() { tail_chars(chunks.last().unwrap(), overlap) } else { String::new() };
            buf = if tail.is_empty() { vec![frag.clone()] } else { vec![tail, frag.clone()] };
            buf_len = buf.join(" ").chars().count();
        }
    }

    if buf_len > 0 {
        let joined = buf.join(" ").trim().to_string();
        if joined.chars().count() >= max_len {
            hard_split(&joined, max_len, overlap, &mut chunks);
        } else if let Some(last) = chunks.last_mut() {
            if buf_len < min_len && last.chars().count() + 1 + joined.chars().count() <= max_len {
                last.push(' ');
                last.push_str(&joined);
            } else {
                chunks.push(joined);
            }
        } else {
            chunks.push(joined);
        }
    }

    chunks.into_iter().filter(|c| !c.trim().is_empty()).collect()
}

fn flush_buf(chunks: &mut Vec<String>, buf: &mut Vec<String>, buf_len: &mut usize, overlap: usize) {
    chunks.push(buf.join(" ").trim().to_string());
    let tail = if overlap > 0 { tail_chars(chunks.last().unwrap(), overlap) } else { String::new() };
    *buf_len = tail.chars().count();
    *buf = if tail.is_empty() { Vec::new() } else { vec![tail] };
}

fn tail_chars(s: &str, n: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= n {
        chars.into_iter().collect()
    } else {
        chars[chars.len() - n..].iter().collect()
    }
}

fn hard_split(frag: &str, max_len: usize, overlap: usize, out: &mut Vec<String>) {
    let chars: Vec<char> = frag.chars().collect();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + max_len).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        if !piece.trim().is_empty() {
            out.push(piece.trim().to_string());
        }
        start = if end < chars.len() { end.saturating_sub(overlap) } else { end };
        if start == 0 && end == chars.len() {
            break;
        }
    }
}

/// Chunks a standardized document's text into bounded fragments ready for embedding
/// (§4.6 stage 3). Returns an empty vec for empty input.
pub fn chunk_text(text: &str, opts: &ChunkerOptions) -> Vec<String> {
    let content = text.trim();
    if content.is_empty() {
        return Vec::new();
    }

    let mut result = Vec::new();
    for (_, block) in split_by_markers(content) {
        let sections = split_headings(&block);
        let mut sentence_stream = Vec::new();
        for section in &sections {
            for para in paragraphs(section) {
                sentence_stream.extend(sentences(&para));
            }
        }
        if sentence_stream.is_empty() {
            sentence_stream = sentences(&block);
        }
        if sentence_stream.is_empty() {
            sentence_stream = vec![block.clone()];
        }
        result.extend(pack(&sentence_stream, opts));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ChunkerOptions {
        ChunkerOptions::builder()
            .target_tokens(20)
            .max_tokens(30)
            .min_tokens(5)
            .overlap_tokens(3)
            .token_chars_ratio(1.0)
            .build()
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("", &opts()).is_empty());
    }

    #[test]
    fn chunk_bounds_are_respected() {
        let opts = ChunkerOptions::builder()
            .target_tokens(40)
            .max_tokens(60)
            .min_tokens(10)
            .overlap_tokens(5)
            .token_chars_ratio(1.0)
            .build();
        let text = "Sentence one is here. Sentence two follows along nicely. Sentence three rounds it out. Sentence four adds more content. Sentence five closes the paragraph out finally.";
        let chunks = chunk_text(text, &opts);
        assert!(!chunks.is_empty());
        for (i, c) in chunks.iter().enumerate() {
            let len = c.chars().count();
            assert!(len <= opts.max_chars(), "chunk {i} too long: {len}");
            if i + 1 < chunks.len() {
                assert!(len >= opts.min_chars() || len > 0, "chunk {i} unexpectedly tiny");
            }
        }
    }

    #[test]
    fn structure_preservation_marker_survives_as_boundary_anchor() {
        let text = "=== Slide 1 ===\nIntro content here.\n=== Slide 2 ===\nMore content on slide two.";
        let chunks = chunk_text(text, &opts());
        assert!(chunks.iter().any(|c| c.contains("Slide 1")));
        assert!(chunks.iter().any(|c| c.contains("Slide 2")));
    }

    #[test]
    fn oversized_fragment_is_hard_split_with_overlap() {
        let opts = ChunkerOptions::builder()
            .target_tokens(10)
            .max_tokens(15)
            .min_tokens(3)
            .overlap_tokens(2)
            .token_chars_ratio(1.0)
            .build();
        let long_word = "x".repeat(50);
        let chunks = chunk_text(&long_word, &opts);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= opts.max_chars());
        }
    }

    #[test]
    fn single_block_without_markers_is_one_doc_block() {
        let blocks = split_by_markers("just plain text\nwith two lines");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].0, BlockKind::Doc);
    }

    #[test]
    fn headings_split_into_separate_sections() {
        let sections = split_headings("# Intro\nhello\n## Details\nworld");
        assert_eq!(sections.len(), 2);
        assert!(sections[0].starts_with("# Intro"));
        assert!(sections[1].starts_with("## Details"));
    }

    #[test]
    fn sentence_split_keeps_terminal_punctuation() {
        let sents = sentences("One. Two! Three?");
        assert_eq!(sents, vec!["One.", "Two!", "Three?"]);
    }
}
