//! Text chunker.
//!
//! Splits a source's body text into [`ChunkPiece`]s on paragraph
//! boundaries, respecting a configurable `max_tokens` budget, carrying a
//! word-overlap tail forward into the next chunk so that a sentence split
//! across a chunk boundary still has surrounding context in both halves.
//! Markdown heading lines update a running breadcrumb (`heading_path`) so
//! callers can show readers where in the document a hit came from.
//!
//! Token counting is approximate (whitespace word count) rather than
//! model-specific — the exact tokenizer a given embedding model uses is
//! not this crate's concern.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub chunk_index: i64,
    pub heading_path: Option<String>,
    pub content: String,
    pub token_count: i64,
    pub content_hash: String,
}

struct HeadingStack {
    levels: Vec<(usize, String)>,
}

impl HeadingStack {
    fn new() -> Self {
        Self { levels: Vec::new() }
    }

    /// Update the breadcrumb if `line` is a markdown ATX heading
    /// (`# `..`###### `), popping any deeper or equal levels first.
    fn observe(&mut self, line: &str) {
        let trimmed = line.trim_start();
        let level = trimmed.chars().take_while(|&c| c == '#').count();
        if level == 0 || level > 6 {
            return;
        }
        let rest = trimmed[level..].trim();
        if rest.is_empty() || !trimmed[level..].starts_with(' ') {
            return;
        }
        self.levels.retain(|(l, _)| *l < level);
        self.levels.push((level, rest.to_string()));
    }

    fn path(&self) -> Option<String> {
        if self.levels.is_empty() {
            None
        } else {
            Some(
                self.levels
                    .iter()
                    .map(|(_, text)| text.as_str())
                    .collect::<Vec<_>>()
                    .join(" > "),
            )
        }
    }
}

fn word_count(text: &str) -> i64 {
    text.split_whitespace().count() as i64
}

fn overlap_tail(text: &str, overlap_words: usize) -> String {
    if overlap_words == 0 {
        return String::new();
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= overlap_words {
        return String::new();
    }
    words[words.len() - overlap_words..].join(" ")
}

fn hash_piece(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_piece(index: i64, heading_path: Option<String>, content: String) -> ChunkPiece {
    let content_hash = hash_piece(&content);
    let token_count = word_count(&content);
    ChunkPiece {
        chunk_index: index,
        heading_path,
        content,
        token_count,
        content_hash,
    }
}

/// A note's parsed YAML front matter plus the inline `#tag`s and
/// `[[wikilink]]`s found in its body, merged into the flat string map
/// `SourceItem::metadata` carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontMatter {
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub fields: HashMap<String, String>,
}

/// Split a leading `---\n...\n---` YAML block off `text`, returning the
/// parsed front matter (if any) and the remaining body with the block
/// stripped. Malformed YAML is treated the same as no front matter —
/// a note shouldn't fail to index because of a front matter typo.
pub fn extract_front_matter(text: &str) -> (Option<FrontMatter>, &str) {
    let Some(rest) = text.strip_prefix("---\n").or_else(|| text.strip_prefix("---\r\n")) else {
        return (None, text);
    };
    let Some(end) = rest.find("\n---").or_else(|| rest.find("\r\n---")) else {
        return (None, text);
    };
    let yaml = &rest[..end];
    let after_marker = &rest[end..];
    let body_start = after_marker
        .find('\n')
        .map(|i| i + 1)
        .unwrap_or(after_marker.len());
    let body = &after_marker[body_start.min(after_marker.len())..];

    let value: serde_yaml::Value = match serde_yaml::from_str(yaml) {
        Ok(v) => v,
        Err(_) => return (None, text),
    };
    let Some(map) = value.as_mapping() else {
        return (None, text);
    };

    let mut fm = FrontMatter::default();
    for (k, v) in map {
        let Some(key) = k.as_str() else { continue };
        match key {
            "title" => fm.title = v.as_str().map(|s| s.to_string()),
            "tags" | "tag" => fm.tags.extend(yaml_value_to_strings(v)),
            _ => {
                if let Some(s) = yaml_scalar_to_string(v) {
                    fm.fields.insert(key.to_string(), s);
                }
            }
        }
    }

    (Some(fm), body)
}

fn yaml_value_to_strings(value: &serde_yaml::Value) -> Vec<String> {
    match value {
        serde_yaml::Value::Sequence(items) => items.iter().filter_map(yaml_scalar_to_string).collect(),
        serde_yaml::Value::String(s) => s.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect(),
        other => yaml_scalar_to_string(other).into_iter().collect(),
    }
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Inline `#tag` occurrences (Obsidian-style: letters, digits, `/`, `_`,
/// `-`), excluding anything that looks like a markdown heading (`#` at the
/// start of a line followed by a space).
pub fn extract_inline_tags(text: &str) -> Vec<String> {
    let mut tags = Vec::new();
    for line in text.lines() {
        let bytes = line.as_bytes();
        for (i, c) in line.char_indices() {
            if c != '#' || i == 0 {
                continue;
            }
            let preceded_ok = matches!(bytes[i - 1], b' ' | b'\t' | b'(');
            if !preceded_ok {
                continue;
            }
            let rest = &line[i + 1..];
            let tag: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '/' || *c == '_' || *c == '-')
                .collect();
            if !tag.is_empty() && tag.chars().next().map(|c| c.is_alphabetic()).unwrap_or(false) {
                tags.push(tag);
            }
        }
    }
    tags.sort();
    tags.dedup();
    tags
}

/// `[[Target]]` and `[[Target|Alias]]` wikilinks, returning the target
/// (not the alias) of each.
pub fn extract_wikilinks(text: &str) -> Vec<String> {
    let mut links = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("[[") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("]]") else { break };
        let inner = &after[..end];
        let target = inner.split('|').next().unwrap_or(inner).trim();
        if !target.is_empty() {
            links.push(target.to_string());
        }
        rest = &after[end + 2..];
    }
    links.sort();
    links.dedup();
    links
}

/// Like [`chunk_text`], but every resulting piece's `heading_path` is
/// prefixed with `prefix` (joined with " > " when the piece already has a
/// breadcrumb). Used by the git indexer's structural code splitter, where
/// `prefix` is the enclosing symbol path (e.g. a file path or function
/// name) rather than anything derivable from markdown headings.
pub fn chunk_with_prefix(text: &str, prefix: &str, max_tokens: usize, overlap_words: usize) -> Vec<ChunkPiece> {
    let mut pieces = chunk_text(text, max_tokens, overlap_words);
    for piece in &mut pieces {
        piece.heading_path = Some(match &piece.heading_path {
            Some(existing) => format!("{prefix} > {existing}"),
            None => prefix.to_string(),
        });
    }
    pieces
}

/// Split `text` into chunks of at most `max_tokens` (approximated by chars
/// per token), carrying `overlap_words` words of trailing context from
/// each chunk into the next one.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_words: usize) -> Vec<ChunkPiece> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;

    if text.trim().is_empty() {
        return vec![make_piece(0, None, String::new())];
    }

    let mut headings = HeadingStack::new();
    let mut pieces = Vec::new();
    let mut current_buf = String::new();
    let mut current_heading: Option<String> = None;
    let mut chunk_index: i64 = 0;

    let mut flush = |buf: &mut String, heading: &mut Option<String>, index: &mut i64, pieces: &mut Vec<ChunkPiece>| {
        if buf.trim().is_empty() {
            return;
        }
        let tail = overlap_tail(buf, overlap_words);
        pieces.push(make_piece(*index, heading.take(), buf.trim().to_string()));
        *index += 1;
        buf.clear();
        if !tail.is_empty() {
            buf.push_str(&tail);
            buf.push_str("\n\n");
        }
    };

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        for line in trimmed.lines().take(1) {
            headings.observe(line);
        }
        if current_heading.is_none() {
            current_heading = headings.path();
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            flush(&mut current_buf, &mut current_heading, &mut chunk_index, &mut pieces);
            current_heading = headings.path();
        }

        if trimmed.len() > max_chars {
            if !current_buf.is_empty() {
                flush(&mut current_buf, &mut current_heading, &mut chunk_index, &mut pieces);
                current_heading = headings.path();
            }
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = remaining.len().min(max_chars);
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece_text = remaining[..actual_split].trim().to_string();
                pieces.push(make_piece(chunk_index, headings.path(), piece_text));
                chunk_index += 1;
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() && !current_buf.ends_with("\n\n") {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.trim().is_empty() {
        pieces.push(make_piece(chunk_index, current_heading, current_buf.trim().to_string()));
    }

    if pieces.is_empty() {
        pieces.push(make_piece(0, None, text.trim().to_string()));
    }

    pieces
}
