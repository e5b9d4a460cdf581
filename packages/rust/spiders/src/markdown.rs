//! HTML-to-Markdown conversion and paragraph-bounded chunking.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use wise_shared::{Result, WiseError};

/// One paragraph-bounded slice of an article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 0-based position within the article.
    pub index: usize,
    pub text: String,
    pub word_count: usize,
}

/// Convert extracted content HTML to cleaned-up Markdown.
pub fn to_markdown(html: &str) -> Result<String> {
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "nav", "iframe", "noscript", "svg"])
        .build();

    let raw = converter
        .convert(html)
        .map_err(|e| WiseError::parse(format!("htmd conversion failed: {e}")))?;

    Ok(cleanup(&raw))
}

/// Trim trailing whitespace per line and collapse runs of blank lines.
fn cleanup(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let trimmed: Vec<&str> = md.lines().map(str::trim_end).collect();
    let joined = trimmed.join("\n");
    MULTI_BLANK_RE
        .replace_all(joined.trim(), "\n\n")
        .into_owned()
}

/// Approximate word count, ignoring fenced code blocks.
///
/// CJK ideographs count one word each since they are not whitespace separated.
pub fn count_words(md: &str) -> usize {
    static CODE_BLOCK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("valid regex"));

    let without_code = CODE_BLOCK_RE.replace_all(md, "");
    without_code
        .split_whitespace()
        .map(|token| {
            let cjk = token.chars().filter(|c| is_cjk(*c)).count();
            let rest = token.chars().any(|c| c.is_alphanumeric() && !is_cjk(c));
            cjk + usize::from(rest)
        })
        .sum()
}

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '\u{F900}'..='\u{FAFF}')
}

/// Split Markdown into chunks of at most `max_chars` characters, cutting only
/// at blank-line paragraph boundaries. A paragraph longer than `max_chars`
/// becomes a chunk of its own.
pub fn split_paragraphs(md: &str, max_chars: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in md.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let projected = current.chars().count() + paragraph.chars().count() + 2;
        if !current.is_empty() && projected > max_chars {
            push_chunk(&mut chunks, std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        push_chunk(&mut chunks, current);
    }
    chunks
}

fn push_chunk(chunks: &mut Vec<Chunk>, text: String) {
    chunks.push(Chunk {
        index: chunks.len(),
        word_count: count_words(&text),
        text,
    });
}
