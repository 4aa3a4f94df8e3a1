//! Break point detection for chunking

/// Priority levels for break points
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BreakPriority {
    /// Word boundary (lowest)
    Word = 1,
    /// Sentence boundary
    Sentence = 2,
    /// Paragraph boundary (highest)
    Paragraph = 3,
}

/// A potential break point in text; `position` is the byte offset where the next piece starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakPoint {
    pub position: usize,
    pub priority: BreakPriority,
}

impl BreakPoint {
    pub fn new(position: usize, priority: BreakPriority) -> Self {
        Self { position, priority }
    }
}

/// All paragraph, sentence and word breaks, sorted by position, highest priority kept per position
pub fn find_break_points(text: &str) -> Vec<BreakPoint> {
    let mut points = Vec::new();
    let bytes = text.as_bytes();

    for (i, c) in text.char_indices() {
        if !c.is_whitespace() {
            continue;
        }
        let next = i + c.len_utf8();
        let priority = if c == '\n' && i > 0 && bytes[i - 1] == b'\n' {
            BreakPriority::Paragraph
        } else if i > 0 && matches!(bytes[i - 1], b'.' | b'?' | b'!') {
            BreakPriority::Sentence
        } else {
            BreakPriority::Word
        };
        points.push(BreakPoint::new(next, priority));
    }

    points.sort_by(|a, b| a.position.cmp(&b.position).then(b.priority.cmp(&a.priority)));
    points.dedup_by_key(|p| p.position);
    points
}

/// Detect fenced code block byte ranges (positions to avoid breaking)
pub fn find_code_blocks(text: &str) -> Vec<(usize, usize)> {
    let mut blocks = Vec::new();
    let mut block_start: Option<usize> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            match block_start.take() {
                Some(start) => blocks.push((start, offset + line.len())),
                None => block_start = Some(offset),
            }
        }
        offset += line.len();
    }

    // An unterminated fence runs to the end
    if let Some(start) = block_start {
        blocks.push((start, text.len()));
    }
    blocks
}

/// Check if a position is inside a code block
pub fn is_in_code_block(position: usize, code_blocks: &[(usize, usize)]) -> bool {
    code_blocks
        .iter()
        .any(|(start, end)| position > *start && position < *end)
}

/// Best break in `(min, max]`: highest priority first, then the latest position
pub fn best_break(
    points: &[BreakPoint],
    code_blocks: &[(usize, usize)],
    min: usize,
    max: usize,
) -> Option<usize> {
    points
        .iter()
        .filter(|p| p.position > min && p.position <= max)
        .filter(|p| !is_in_code_block(p.position, code_blocks))
        .max_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.position.cmp(&b.position))
        })
        .map(|p| p.position)
}

/// Byte offset `n` characters after `start`, or `None` when the rest is shorter
pub fn advance_chars(text: &str, start: usize, n: usize) -> Option<usize> {
    text[start..].char_indices().nth(n).map(|(i, _)| start + i)
}
