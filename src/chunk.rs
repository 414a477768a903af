//! Line-addressed text chunker.
//!
//! Splits file content into [`Chunk`]s that respect a configurable
//! `max_chars` limit. Splitting happens on line boundaries so every chunk can
//! be addressed by an inclusive `start_line..=end_line` range, and each chunk
//! after the first repeats the last few lines of its predecessor so context
//! survives the boundary.
//!
//! Chunking is a pure function of the input text: the same content always
//! yields the same boundaries, which is what lets the index be rebuilt from
//! the files at any time.

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Approximate chars-per-token ratio. Not a tokenizer.
const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of a piece of text.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN
}

/// A line (or a piece of an over-long line) waiting to be emitted.
#[derive(Clone)]
struct Piece {
    line_no: usize,
    text: String,
    chars: usize,
}

/// Split `content` into overlapping line-addressed chunks.
///
/// Empty content yields no chunks.
pub fn chunk_text(file_path: &str, content: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let max_chars = config.max_chars.max(1);
    let created_at = chrono::Utc::now().timestamp();

    if content.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut current: Vec<Piece> = Vec::new();
    let mut current_chars = 0usize;

    for (idx, line) in content.lines().enumerate() {
        for piece in split_line(idx + 1, line, max_chars) {
            let joined = if current.is_empty() {
                piece.chars
            } else {
                current_chars + 1 + piece.chars
            };

            if joined > max_chars && !current.is_empty() {
                chunks.push(make_chunk(file_path, &current, created_at));

                // Carry the tail of the flushed chunk forward, dropping
                // leading overlap lines until the next piece fits.
                let keep = config.overlap_lines.min(current.len());
                current.drain(..current.len() - keep);
                current_chars = joined_len(&current);
                while !current.is_empty() && current_chars + 1 + piece.chars > max_chars {
                    current.remove(0);
                    current_chars = joined_len(&current);
                }
            }

            current_chars = if current.is_empty() {
                piece.chars
            } else {
                current_chars + 1 + piece.chars
            };
            current.push(piece);
        }
    }

    if !current.is_empty() {
        chunks.push(make_chunk(file_path, &current, created_at));
    }

    chunks
}

/// Break a line into pieces of at most `max_chars` characters.
fn split_line(line_no: usize, line: &str, max_chars: usize) -> Vec<Piece> {
    let chars = line.chars().count();
    if chars <= max_chars {
        return vec![Piece {
            line_no,
            text: line.to_string(),
            chars,
        }];
    }

    let all: Vec<char> = line.chars().collect();
    all.chunks(max_chars)
        .map(|part| Piece {
            line_no,
            text: part.iter().collect(),
            chars: part.len(),
        })
        .collect()
}

fn joined_len(pieces: &[Piece]) -> usize {
    if pieces.is_empty() {
        return 0;
    }
    pieces.iter().map(|p| p.chars).sum::<usize>() + pieces.len() - 1
}

fn make_chunk(file_path: &str, pieces: &[Piece], created_at: i64) -> Chunk {
    let content = pieces
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    Chunk {
        file_path: file_path.to_string(),
        start_line: pieces[0].line_no,
        end_line: pieces[pieces.len() - 1].line_no,
        token_count: estimate_tokens(&content),
        content,
        created_at,
    }
}
