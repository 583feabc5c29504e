use crate::error::IndexError;

/// Chunk size and overlap, both measured in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    max_chars: usize,
    overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1500,
            overlap: 200,
        }
    }
}

impl ChunkingConfig {
    pub fn new(max_chars: usize, overlap: usize) -> Result<Self, IndexError> {
        if max_chars == 0 {
            return Err(IndexError::Config("chunk size must be > 0".into()));
        }
        if overlap >= max_chars {
            return Err(IndexError::Config(format!(
                "overlap ({overlap}) must be smaller than chunk size ({max_chars})"
            )));
        }
        Ok(Self { max_chars, overlap })
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split text into overlapping chunks, preferring line boundaries.
    ///
    /// Consecutive chunks share at most `overlap` characters: whole trailing
    /// lines when they fit, otherwise the tail of the previous chunk's last
    /// line, starting on a word where possible. Lines longer than
    /// `max_chars` are cut at char boundaries into slices that leave room
    /// for that tail.
    pub fn split(&self, text: &str) -> Vec<TextSpan> {
        let pieces = line_pieces(text, self.max_chars, self.max_chars - self.overlap);
        if pieces.is_empty() {
            return Vec::new();
        }

        let mut spans = Vec::new();
        let mut start = 0usize;
        // Where the chunk begins; may fall inside `pieces[start]`
        let mut start_byte = pieces[0].start;

        loop {
            let mut char_count = text[start_byte..pieces[start].end].chars().count();
            let mut end = start + 1;

            // Accumulate pieces until the next one would overflow
            while end < pieces.len() {
                let joined = pieces[end].chars + gap(text, &pieces, end);
                if char_count + joined > self.max_chars {
                    break;
                }
                char_count += joined;
                end += 1;
            }

            let last = &pieces[end - 1];
            let chunk = &text[start_byte..last.end];
            if !chunk.trim().is_empty() {
                spans.push(TextSpan {
                    text: chunk.to_string(),
                    start_byte,
                    end_byte: last.end,
                    start_line: pieces[start].line,
                    end_line: last.line,
                });
            }

            if end >= pieces.len() {
                break;
            }

            // Carried-over text must leave room for the next piece
            let next_len = pieces[end].chars + gap(text, &pieces, end);
            let budget = self.overlap.min(self.max_chars.saturating_sub(next_len));

            // Walk back from `end` while whole pieces fit the budget
            let mut overlap_chars = 0usize;
            let mut next_start = end;
            while next_start > start + 1 {
                let candidate = next_start - 1;
                let len = pieces[candidate].chars
                    + if next_start < end { gap(text, &pieces, next_start) } else { 0 };
                if overlap_chars + len > budget {
                    break;
                }
                overlap_chars += len;
                next_start = candidate;
            }

            if next_start < end {
                start = next_start;
                start_byte = pieces[start].start;
            } else if let Some(cut) = tail_start(text, &pieces[end - 1], start_byte, budget) {
                start = end - 1;
                start_byte = cut;
            } else {
                start = end;
                start_byte = pieces[end].start;
            }
        }

        spans
    }
}

/// A chunk of the source text with its location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub text: String,
    pub start_byte: usize,
    pub end_byte: usize,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
}

/// A line (or a slice of an overlong line), without its line terminator.
struct Piece {
    start: usize,
    end: usize,
    chars: usize,
    line: usize,
}

/// Characters between piece `i - 1` and piece `i` (line terminators).
fn gap(text: &str, pieces: &[Piece], i: usize) -> usize {
    text[pieces[i - 1].end..pieces[i].start].chars().count()
}

/// Byte offset of the last `budget` characters of `piece`, moved forward to
/// the next word start when the cut lands mid-word. `None` when nothing can
/// be carried over without restarting at or before `floor`.
fn tail_start(text: &str, piece: &Piece, floor: usize, budget: usize) -> Option<usize> {
    if budget == 0 {
        return None;
    }
    let from = piece.start.max(floor);
    let segment = &text[from..piece.end];
    let chars = segment.chars().count();
    if chars <= budget {
        return None;
    }

    let (offset, _) = segment.char_indices().nth(chars - budget)?;
    let mut cut = from + offset;

    let tail = &text[cut..piece.end];
    let mid_word = text[..cut].chars().next_back().is_some_and(|c| !c.is_whitespace())
        && tail.chars().next().is_some_and(|c| !c.is_whitespace());
    let word = if mid_word {
        tail.find(char::is_whitespace).map(|i| &tail[i..])
    } else {
        Some(tail)
    };
    if let Some(rest) = word.map(str::trim_start).filter(|r| !r.is_empty()) {
        cut = piece.end - rest.len();
    }
    Some(cut)
}

/// Lines longer than `max_chars` are cut into slices of `step` characters.
fn line_pieces(text: &str, max_chars: usize, step: usize) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut offset = 0usize;

    for (idx, raw) in text.split_inclusive('\n').enumerate() {
        let line = raw.trim_end_matches(['\n', '\r']);
        let line_no = idx + 1;
        let line_start = offset;
        offset += raw.len();

        let line_chars = line.chars().count();
        if line_chars <= max_chars {
            pieces.push(Piece {
                start: line_start,
                end: line_start + line.len(),
                chars: line_chars,
                line: line_no,
            });
            continue;
        }

        let mut seg_start = line_start;
        let mut seg_chars = 0usize;
        for (byte_idx, _) in line.char_indices() {
            if seg_chars == step {
                pieces.push(Piece {
                    start: seg_start,
                    end: line_start + byte_idx,
                    chars: seg_chars,
                    line: line_no,
                });
                seg_start = line_start + byte_idx;
                seg_chars = 0;
            }
            seg_chars += 1;
        }
        pieces.push(Piece {
            start: seg_start,
            end: line_start + line.len(),
            chars: seg_chars,
            line: line_no,
        });
    }

    pieces
}
