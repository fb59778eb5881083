//! Structural source-code splitter.
//!
//! Language-aware enough to split a file on function/type signature
//! boundaries instead of blank-line paragraphs: one regex per language
//! family matches a block-opening line (`fn`, `def`, `class`, `func`, a
//! JS/TS `function`/exported `const`, a Java/C#/Kotlin method signature).
//! Files whose extension isn't recognized, or where no signature line
//! matches, fall back to the shared paragraph chunker whole-file.

use regex::Regex;
use std::sync::OnceLock;

use crate::chunk::{chunk_with_prefix, ChunkPiece};

fn signature_regex(extension: &str) -> Option<&'static Regex> {
    static RUST: OnceLock<Regex> = OnceLock::new();
    static PY: OnceLock<Regex> = OnceLock::new();
    static JS: OnceLock<Regex> = OnceLock::new();
    static GO: OnceLock<Regex> = OnceLock::new();
    static JVM: OnceLock<Regex> = OnceLock::new();

    match extension {
        "rs" => Some(RUST.get_or_init(|| {
            Regex::new(r"^\s*(pub(\([^)]*\))?\s+)?(async\s+)?fn\s+\w+|^\s*(pub(\([^)]*\))?\s+)?(struct|enum|trait|impl)\s+\w+").unwrap()
        })),
        "py" => Some(PY.get_or_init(|| Regex::new(r"^\s*(async\s+)?def\s+\w+|^\s*class\s+\w+").unwrap())),
        "js" | "jsx" | "ts" | "tsx" => Some(JS.get_or_init(|| {
            Regex::new(r"^\s*(export\s+)?(default\s+)?(async\s+)?function\s+\w+|^\s*(export\s+)?class\s+\w+|^\s*(export\s+)?const\s+\w+\s*=\s*(async\s*)?\(").unwrap()
        })),
        "go" => Some(GO.get_or_init(|| Regex::new(r"^func\s+(\([^)]*\)\s*)?\w+|^type\s+\w+\s+(struct|interface)").unwrap())),
        "java" | "cs" | "kt" => Some(JVM.get_or_init(|| {
            Regex::new(r"^\s*(public|private|protected|internal|static|final|abstract|\s)+[\w<>\[\],\? ]+\s+\w+\s*\([^;{]*\)\s*\{?\s*$|^\s*(public|private|protected)?\s*class\s+\w+").unwrap()
        })),
        _ => None,
    }
}

/// Split `content` (the body of `file_label`, a source file with
/// `extension`) into chunks aligned to recognized signature boundaries.
/// Any text preceding the first signature (imports, file-level doc
/// comments) becomes its own leading chunk.
pub fn chunk_source_file(
    content: &str,
    file_label: &str,
    extension: &str,
    max_tokens: usize,
    overlap_words: usize,
) -> Vec<ChunkPiece> {
    let Some(re) = signature_regex(extension) else {
        return chunk_with_prefix(content, file_label, max_tokens, overlap_words);
    };

    let lines: Vec<&str> = content.lines().collect();
    let boundaries: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| re.is_match(line))
        .map(|(i, _)| i)
        .collect();

    if boundaries.is_empty() {
        return chunk_with_prefix(content, file_label, max_tokens, overlap_words);
    }

    let mut pieces = Vec::new();
    let mut next_index: i64 = 0;

    let mut push_block = |text: &str, prefix: &str, pieces: &mut Vec<ChunkPiece>, next_index: &mut i64| {
        if text.trim().is_empty() {
            return;
        }
        for mut piece in chunk_with_prefix(text, prefix, max_tokens, overlap_words) {
            piece.chunk_index = *next_index;
            *next_index += 1;
            pieces.push(piece);
        }
    };

    if boundaries[0] > 0 {
        let header = lines[..boundaries[0]].join("\n");
        push_block(&header, file_label, &mut pieces, &mut next_index);
    }

    for (b, &start) in boundaries.iter().enumerate() {
        let end = boundaries.get(b + 1).copied().unwrap_or(lines.len());
        let block = lines[start..end].join("\n");
        let symbol = lines[start].trim();
        let prefix = format!("{file_label} :: {symbol}");
        push_block(&block, &prefix, &mut pieces, &mut next_index);
    }

    pieces
}
