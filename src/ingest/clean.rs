//! Cleaning stage (C6 stage 2): strips common document-extraction artifacts before the
//! cleaned text reaches the chunker. A pure `&str -> String` function with no I/O, grounded
//! in the original standardizer's `_clean_extracted_text` pass.

use std::sync::LazyLock;

use regex::Regex;

static LATEXIT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<\s*latexit[^>]*>.*?<\s*/\s*latexit\s*>").unwrap());
static BASE64_BLOB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/=]{80,}").unwrap());
static HYPHEN_LINEBREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-\s*\n\s*").unwrap());
static INLINE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());
static ZERO_WIDTH: &[char] = &['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

/// Cleans raw standardized text: removes embedded LaTeX-artifact blocks, long base64-looking
/// blobs, zero-width characters; normalizes ligatures; joins hyphenated line-wrap breaks;
/// collapses runs of inline whitespace while preserving line structure (so marker lines used
/// by the chunker survive).
pub fn clean(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let text = LATEXIT_BLOCK.replace_all(text, " ");
    let text = BASE64_BLOB.replace_all(&text, " ");
    let text = text.replace('\u{FB01}', "fi").replace('\u{FB02}', "fl");
    let text: String = text.chars().filter(|c| !ZERO_WIDTH.contains(c)).collect();
    let text = HYPHEN_LINEBREAK.replace_all(&text, "");
    let text = INLINE_WHITESPACE.replace_all(&text, " ");

    text.lines().map(|line| line.trim_end()).collect::<Vec<_>>().join("\n")
}
