//! Sentence-respecting text chunker with overlap.
//!
//! Long property descriptions and knowledge documents are split into
//! overlapping chunks before embedding. The split preference is hierarchical:
//! paragraph breaks, then line breaks, then sentence punctuation (Latin and
//! Arabic), then commas, then spaces, then a hard character cut. Inputs at or
//! below the chunk size come back as a single chunk, unchanged.

// ─── Defaults ───────────────────────────────────────────────────────────────

/// Target chunk size in characters (~500 tokens).
pub const DEFAULT_CHUNK_SIZE: usize = 2_000;

/// Overlap carried from the tail of one chunk into the next.
pub const DEFAULT_OVERLAP: usize = 200;

/// Separator hierarchy, most preferred first.
const SEPARATORS: [&str; 9] = ["\n\n", "\n", ". ", "! ", "? ", "؟ ", "۔ ", "، ", ", "];

// ─── Chunker ────────────────────────────────────────────────────────────────

/// Splits text into overlapping, boundary-respecting chunks.
#[derive(Debug, Clone, Copy)]
pub struct TextChunker {
    chunk_size: usize,
    overlap: usize,
}

impl Default for TextChunker {
    fn default() -> Self {
        TextChunker {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

impl TextChunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        TextChunker {
            chunk_size: chunk_size.max(1),
            overlap: overlap.min(chunk_size / 2),
        }
    }

    /// Split `text` into chunks of at most `chunk_size + overlap` characters.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        if char_len(trimmed) <= self.chunk_size {
            return vec![trimmed.to_string()];
        }

        let segments = self.split_segments(trimmed, 0);
        let packed = self.pack(segments);
        self.with_overlap(packed)
    }

    /// Recursively split oversize text, trying each separator in order.
    fn split_segments(&self, text: &str, level: usize) -> Vec<String> {
        if char_len(text) <= self.chunk_size {
            return vec![text.to_string()];
        }
        if level >= SEPARATORS.len() {
            // Space, then hard character cut as the last resorts.
            if text.contains(' ') {
                return split_keeping_separator(text, " ")
                    .into_iter()
                    .flat_map(|piece| {
                        if char_len(&piece) <= self.chunk_size {
                            vec![piece]
                        } else {
                            hard_split(&piece, self.chunk_size)
                        }
                    })
                    .collect();
            }
            return hard_split(text, self.chunk_size);
        }

        let separator = SEPARATORS[level];
        if !text.contains(separator) {
            return self.split_segments(text, level + 1);
        }

        split_keeping_separator(text, separator)
            .into_iter()
            .flat_map(|piece| {
                if char_len(&piece) <= self.chunk_size {
                    vec![piece]
                } else {
                    self.split_segments(&piece, level + 1)
                }
            })
            .collect()
    }

    /// Greedily pack segments into chunks near the target size.
    fn pack(&self, segments: Vec<String>) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;

        for segment in segments {
            let seg_len = char_len(&segment);
            if current_len > 0 && current_len + seg_len > self.chunk_size {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            current.push_str(&segment);
            current_len += seg_len;
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    /// Prefix each chunk after the first with the previous chunk's tail.
    fn with_overlap(&self, chunks: Vec<String>) -> Vec<String> {
        if self.overlap == 0 || chunks.len() < 2 {
            return chunks;
        }
        let mut out = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            if i == 0 {
                out.push(chunk.clone());
            } else {
                let carry = tail_chars(&chunks[i - 1], self.overlap);
                out.push(format!("{carry}{chunk}"));
            }
        }
        out
    }
}

// ─── Char-boundary helpers ──────────────────────────────────────────────────

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split on `separator`, keeping the separator attached to the left piece so
/// no characters are lost on rejoin.
fn split_keeping_separator(text: &str, separator: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while let Some(idx) = rest.find(separator) {
        let cut = idx + separator.len();
        pieces.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

/// Hard split at char boundaries every `size` characters.
fn hard_split(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|c| c.iter().collect::<String>())
        .collect()
}

/// The last `n` characters of `s` (respecting UTF-8 boundaries).
fn tail_chars(s: &str, n: usize) -> &str {
    let total = char_len(s);
    if total <= n {
        return s;
    }
    let skip = total - n;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
