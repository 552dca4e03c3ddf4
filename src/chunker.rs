// Copyright 2026 Medrag Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::config::ChunkingConfig;
use crate::types::{Chunk, ChunkStrategy};

/// Section headers recognized by the clinical-sections strategy.
/// Matched ASCII-case-insensitively, followed by a colon.
const CLINICAL_SECTIONS: &[&str] = &[
    "findings",
    "impression",
    "recommendation",
    "recommendations",
    "diagnosis",
    "history",
    "chief complaint",
    "assessment",
    "plan",
    "medications",
    "allergies",
    "symptoms",
    "treatment",
    "examination",
    "comparison",
    "indication",
];

/// Adjacent-sentence similarity below this starts a new chunk in the
/// semantic strategy.
const SEMANTIC_DISCONTINUITY: f32 = 0.25;

/// Dimension of the hashed term-frequency vectors used for semantic splits.
/// Wide enough that unrelated sentences rarely collide into similarity.
const TF_DIM: usize = 256;

/// Splits one document into retrieval-sized chunks.
///
/// Pure: same text, strategy, and parameters always produce a byte-identical
/// chunk set. Chunk texts are exact slices of the source, so concatenating
/// chunks in offset order reproduces the source under the configured
/// overlap/boundary rules.
pub struct Chunker {
    max_chunk_size: usize,
    overlap: usize,
    min_chunk_size: usize,
}

impl Chunker {
    pub fn new(max_chunk_size: usize, overlap: usize, min_chunk_size: usize) -> Self {
        // An overlap >= chunk size would never advance.
        let overlap = overlap.min(max_chunk_size.saturating_sub(1));
        Self {
            max_chunk_size: max_chunk_size.max(1),
            overlap,
            min_chunk_size,
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(
            config.max_chunk_size,
            config.overlap,
            config.min_chunk_size,
        )
    }

    /// Chunk a document's text with the given strategy.
    ///
    /// Empty (or whitespace-only) documents yield an empty chunk list; a
    /// document shorter than `max_chunk_size` yields one chunk covering it
    /// entirely.
    pub fn chunk_document(
        &self,
        document_id: &str,
        text: &str,
        strategy: ChunkStrategy,
    ) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let spans = match strategy {
            ChunkStrategy::FixedSize => self.fixed_size_spans(text),
            ChunkStrategy::Sentence => self.pack_spans(text, sentence_spans(text)),
            ChunkStrategy::Paragraph => self.paragraph_chunk_spans(text),
            ChunkStrategy::Semantic => self.semantic_spans(text),
            ChunkStrategy::ClinicalSections => self.clinical_spans(text),
        };

        let spans = if strategy == ChunkStrategy::FixedSize {
            spans
        } else {
            self.merge_small(text, spans)
        };

        spans
            .into_iter()
            .filter(|span| !text[span.start..span.end].trim().is_empty())
            .map(|span| Chunk {
                id: uuid::Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                text: text[span.start..span.end].to_string(),
                start_offset: span.start,
                end_offset: span.end,
                strategy_used: strategy,
                oversized: span.oversized,
            })
            .collect()
    }

    /// Cut every `max_chunk_size` characters, stepping back by `overlap`.
    /// Offset ranges cover `[0, len)` with gaps only where overlaps rewind.
    fn fixed_size_spans(&self, text: &str) -> Vec<Span> {
        let positions = char_byte_positions(text);
        let n_chars = positions.len() - 1;

        let mut spans = Vec::new();
        let mut start = 0usize;

        loop {
            let end = (start + self.max_chunk_size).min(n_chars);
            spans.push(Span::new(positions[start], positions[end]));
            if end >= n_chars {
                break;
            }
            start = end - self.overlap;
        }

        spans
    }

    /// Greedily pack unit spans into chunks of at most `max_chunk_size`
    /// characters. A single unit longer than the limit is window-split so the
    /// size guarantee holds.
    fn pack_spans(&self, text: &str, units: Vec<(usize, usize)>) -> Vec<Span> {
        let mut spans = Vec::new();
        let mut current: Option<(usize, usize)> = None;

        for (start, end) in units {
            let unit_len = char_len(&text[start..end]);

            if unit_len > self.max_chunk_size {
                if let Some((cs, ce)) = current.take() {
                    spans.push(Span::new(cs, ce));
                }
                spans.extend(self.window_split(text, start, end));
                continue;
            }

            match current {
                None => current = Some((start, end)),
                Some((cs, ce)) => {
                    if char_len(&text[cs..end]) > self.max_chunk_size {
                        spans.push(Span::new(cs, ce));
                        current = Some((start, end));
                    } else {
                        current = Some((cs, end));
                    }
                }
            }
        }

        if let Some((cs, ce)) = current {
            spans.push(Span::new(cs, ce));
        }

        spans
    }

    /// Fixed windows over a slice, used when a single unit exceeds the limit.
    fn window_split(&self, text: &str, start: usize, end: usize) -> Vec<Span> {
        self.fixed_size_spans(&text[start..end])
            .into_iter()
            .map(|span| Span::new(span.start + start, span.end + start))
            .collect()
    }

    fn paragraph_chunk_spans(&self, text: &str) -> Vec<Span> {
        self.pack_spans(text, paragraph_spans(text))
    }

    /// Split where the hashed term-frequency similarity between adjacent
    /// sentences drops, indicating a topic shift. Deterministic and CPU-only.
    fn semantic_spans(&self, text: &str) -> Vec<Span> {
        let sentences = sentence_spans(text);
        if sentences.len() <= 1 {
            return self.pack_spans(text, sentences);
        }

        let vectors: Vec<[f32; TF_DIM]> = sentences
            .iter()
            .map(|&(s, e)| tf_vector(&text[s..e]))
            .collect();

        let mut spans = Vec::new();
        let mut group_start = sentences[0].0;
        let mut group_end = sentences[0].1;

        for i in 1..sentences.len() {
            let (s, e) = sentences[i];
            let similarity = cosine(&vectors[i - 1], &vectors[i]);
            let would_overflow = char_len(&text[group_start..e]) > self.max_chunk_size;

            if similarity < SEMANTIC_DISCONTINUITY || would_overflow {
                spans.push(Span::new(group_start, group_end));
                group_start = s;
            }
            group_end = e;
        }
        spans.push(Span::new(group_start, group_end));

        spans
    }

    /// Align chunk boundaries to recognized clinical section headers. A
    /// section whose atomic units still exceed the limit is kept whole and
    /// flagged oversized rather than split mid-finding.
    fn clinical_spans(&self, text: &str) -> Vec<Span> {
        let markers = section_markers(text);

        if markers.is_empty() {
            // No recognizable structure; fall back to sentence packing.
            return self.pack_spans(text, sentence_spans(text));
        }

        let mut boundaries = Vec::new();
        if markers[0] > 0 && !text[..markers[0]].trim().is_empty() {
            boundaries.push(0);
        }
        boundaries.extend_from_slice(&markers);
        boundaries.push(text.len());

        let mut spans = Vec::new();
        for pair in boundaries.windows(2) {
            let (start, end) = (pair[0], pair[1]);
            if char_len(&text[start..end]) <= self.max_chunk_size {
                spans.push(Span::new(start, end));
                continue;
            }

            // Section too large: split on sentences, flagging any sentence
            // that is itself an unsplittable oversized unit.
            for (s, e) in sentence_spans(&text[start..end]) {
                let (s, e) = (s + start, e + start);
                let oversized = char_len(&text[s..e]) > self.max_chunk_size;
                spans.push(Span {
                    start: s,
                    end: e,
                    oversized,
                });
            }
        }

        spans
    }

    /// Merge fragments shorter than `min_chunk_size` into their predecessor
    /// so boundary noise does not produce useless index entries.
    fn merge_small(&self, text: &str, spans: Vec<Span>) -> Vec<Span> {
        let mut merged: Vec<Span> = Vec::with_capacity(spans.len());

        for span in spans {
            let len = char_len(text[span.start..span.end].trim());
            match merged.last_mut() {
                Some(prev) if len < self.min_chunk_size && prev.end == span.start => {
                    prev.end = span.end;
                    prev.oversized |= span.oversized;
                }
                _ => merged.push(span),
            }
        }

        merged
    }
}

#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
    oversized: bool,
}

impl Span {
    fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            oversized: false,
        }
    }
}

/// Byte offsets of every char start, plus the text length as a sentinel.
fn char_byte_positions(text: &str) -> Vec<usize> {
    let mut positions: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    positions.push(text.len());
    positions
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split into sentence spans that tile the whole text: each span ends after
/// the terminator and its trailing whitespace run.
fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        let terminates = matches!(ch, '.' | '!' | '?' | ';' | '。' | '！' | '？' | '；');
        if !terminates {
            continue;
        }
        // Require whitespace or end-of-text after the terminator, so
        // decimals like "37.5" do not end a sentence.
        match chars.peek() {
            Some(&(_, next)) if !next.is_whitespace() => continue,
            _ => {}
        }

        let mut end = i + ch.len_utf8();
        while let Some(&(j, next)) = chars.peek() {
            if next.is_whitespace() {
                end = j + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        spans.push((start, end));
        start = end;
    }

    if start < text.len() {
        spans.push((start, text.len()));
    }

    spans
}

/// Split into paragraph spans that tile the whole text. A paragraph includes
/// its trailing blank lines.
fn paragraph_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    let bytes = text.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] == b'\n' {
            // Look ahead over whitespace for a second newline.
            let mut j = i + 1;
            let mut saw_blank = false;
            while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                if bytes[j] == b'\n' {
                    saw_blank = true;
                }
                j += 1;
            }
            if saw_blank {
                spans.push((start, j));
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }

    if start < text.len() {
        spans.push((start, text.len()));
    }

    spans
}

/// Byte offsets where a clinical section header begins.
fn section_markers(text: &str) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut markers = Vec::new();

    let mut i = 0usize;
    while i < bytes.len() {
        let at_word_start = i == 0 || (bytes[i - 1] as char).is_whitespace();
        if at_word_start {
            if let Some(len) = match_section_header(&text[i..]) {
                markers.push(i);
                i += len;
                continue;
            }
        }
        // Advance one full char, not one byte.
        i += text[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
    }

    markers
}

/// If `rest` starts with a known section header followed by a colon,
/// return the matched length in bytes.
fn match_section_header(rest: &str) -> Option<usize> {
    let rest_bytes = rest.as_bytes();
    for section in CLINICAL_SECTIONS {
        let name = section.as_bytes();
        if rest_bytes.len() <= name.len() {
            continue;
        }
        if !rest_bytes[..name.len()].eq_ignore_ascii_case(name) {
            continue;
        }
        // Optional spaces, then a colon.
        let mut j = name.len();
        while j < rest_bytes.len() && rest_bytes[j] == b' ' {
            j += 1;
        }
        if j < rest_bytes.len() && rest_bytes[j] == b':' {
            return Some(j + 1);
        }
    }
    None
}

/// Hashed term-frequency vector over lowercase alphanumeric tokens.
fn tf_vector(text: &str) -> [f32; TF_DIM] {
    let mut vector = [0.0f32; TF_DIM];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| !s.is_empty())
    {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        vector[(hasher.finish() % TF_DIM as u64) as usize] += 1.0;
    }
    vector
}

fn cosine(a: &[f32; TF_DIM], b: &[f32; TF_DIM]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> Chunker {
        Chunker::new(100, 20, 10)
    }

    #[test]
    fn test_empty_document_yields_no_chunks() {
        let chunks = chunker().chunk_document("d1", "", ChunkStrategy::FixedSize);
        assert!(chunks.is_empty());
        let chunks = chunker().chunk_document("d1", "   \n\n ", ChunkStrategy::Sentence);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_short_document_single_chunk() {
        let text = "Mild inflammation observed.";
        for strategy in [
            ChunkStrategy::FixedSize,
            ChunkStrategy::Sentence,
            ChunkStrategy::Paragraph,
            ChunkStrategy::Semantic,
        ] {
            let chunks = chunker().chunk_document("d1", text, strategy);
            assert_eq!(chunks.len(), 1, "strategy {:?}", strategy);
            assert_eq!(chunks[0].text, text);
            assert_eq!(chunks[0].start_offset, 0);
            assert_eq!(chunks[0].end_offset, text.len());
        }
    }

    #[test]
    fn test_fixed_size_covers_whole_document() {
        let text = "a".repeat(450);
        let chunks = chunker().chunk_document("d1", &text, ChunkStrategy::FixedSize);

        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks.last().unwrap().end_offset, text.len());

        // Each chunk starts exactly `overlap` before the previous one ended.
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].start_offset, pair[0].end_offset - 20);
        }
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 100);
        }
    }

    #[test]
    fn test_fixed_size_rechunk_is_idempotent() {
        let text = "The patient presented with acute chest pain. ".repeat(10);
        let a = chunker().chunk_document("d1", &text, ChunkStrategy::FixedSize);
        let b = chunker().chunk_document("d1", &text, ChunkStrategy::FixedSize);

        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.start_offset, y.start_offset);
            assert_eq!(x.end_offset, y.end_offset);
        }
    }

    #[test]
    fn test_fixed_size_respects_char_boundaries() {
        let text = "体温36.5度，脉搏80次每分，呼吸20次每分。".repeat(20);
        let chunks = chunker().chunk_document("d1", &text, ChunkStrategy::FixedSize);
        for chunk in &chunks {
            // Slicing at a non-boundary would have panicked already; check
            // the text round-trips.
            assert_eq!(&text[chunk.start_offset..chunk.end_offset], chunk.text);
        }
    }

    #[test]
    fn test_sentence_strategy_never_splits_sentences() {
        let text = "First sentence here. Second sentence follows. Third one ends it.";
        let chunks = Chunker::new(45, 0, 5).chunk_document("d1", text, ChunkStrategy::Sentence);

        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            let trimmed = chunk.text.trim_end();
            assert!(
                trimmed.ends_with('.'),
                "chunk does not end at a sentence boundary: {:?}",
                trimmed
            );
        }
    }

    #[test]
    fn test_sentence_spans_tile_text() {
        let text = "One. Two! Three? Temp was 37.5 overnight. End";
        let spans = sentence_spans(text);
        let mut pos = 0;
        for (start, end) in &spans {
            assert_eq!(*start, pos);
            pos = *end;
        }
        assert_eq!(pos, text.len());
        // The decimal point must not terminate a sentence.
        let texts: Vec<&str> = spans.iter().map(|&(s, e)| &text[s..e]).collect();
        assert!(texts.iter().any(|t| t.contains("37.5 overnight")));
    }

    #[test]
    fn test_paragraph_strategy_splits_on_blank_lines() {
        let text = "Paragraph one with enough text to stand alone.\n\nParagraph two with enough text to stand alone as well.\n\nParagraph three closes the report with more text.";
        let chunks = Chunker::new(60, 0, 10).chunk_document("d1", text, ChunkStrategy::Paragraph);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].text.starts_with("Paragraph one"));
        assert!(chunks[2].text.starts_with("Paragraph three"));
    }

    #[test]
    fn test_clinical_sections_scenario() {
        // The canonical two-section report must yield exactly two chunks.
        let text = "Findings: mild inflammation. Impression: likely viral infection.";
        let chunks = Chunker::new(512, 50, 10).chunk_document(
            "d1",
            text,
            ChunkStrategy::ClinicalSections,
        );

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.to_lowercase().starts_with("findings:"));
        assert!(chunks[1].text.to_lowercase().starts_with("impression:"));
        assert!(!chunks[0].oversized);
    }

    #[test]
    fn test_clinical_sections_multiline_report() {
        let text = "History: hypertension for five years, controlled by medication.\nFindings: ST depression with inverted T waves on the electrocardiogram.\nDiagnosis: unstable angina.\nPlan: antiplatelet therapy and coronary angiography if symptoms persist.";
        let chunks = Chunker::new(512, 50, 10).chunk_document(
            "d1",
            text,
            ChunkStrategy::ClinicalSections,
        );

        assert_eq!(chunks.len(), 4);
        let lowered: Vec<String> = chunks.iter().map(|c| c.text.to_lowercase()).collect();
        assert!(lowered[0].starts_with("history:"));
        assert!(lowered[1].starts_with("findings:"));
        assert!(lowered[2].starts_with("diagnosis:"));
        assert!(lowered[3].starts_with("plan:"));
    }

    #[test]
    fn test_clinical_oversized_section_is_flagged() {
        // One atomic finding far over the limit, with no sentence breaks.
        let finding = "x".repeat(300);
        let text = format!("Findings: {}", finding);
        let chunks =
            Chunker::new(100, 10, 5).chunk_document("d1", &text, ChunkStrategy::ClinicalSections);

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].oversized);
        assert!(chunks[0].text.chars().count() > 100);
    }

    #[test]
    fn test_clinical_without_headers_falls_back() {
        let text = "No structured headers in this note. Just narrative text across sentences. It should still be chunked.";
        let chunks =
            Chunker::new(60, 0, 10).chunk_document("d1", text, ChunkStrategy::ClinicalSections);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(!chunk.oversized);
        }
    }

    #[test]
    fn test_semantic_splits_on_topic_shift() {
        let text = "Cardiac enzymes were elevated on admission. Cardiac enzymes normalized by day three. \
                    Renal creatinine stayed stable throughout.";
        let chunks = Chunker::new(500, 0, 5).chunk_document("d1", text, ChunkStrategy::Semantic);
        // The renal sentence shares almost no vocabulary with the cardiac ones.
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn test_concatenation_reproduces_source() {
        let text = "History: stable. Findings: clear lungs, normal heart size on the radiograph. Impression: no acute disease process identified today.";
        for strategy in [
            ChunkStrategy::Sentence,
            ChunkStrategy::Paragraph,
            ChunkStrategy::Semantic,
            ChunkStrategy::ClinicalSections,
        ] {
            let chunks = Chunker::new(60, 0, 5).chunk_document("d1", text, strategy);
            let rebuilt: String = chunks.iter().map(|c| c.text.as_str()).collect();
            assert_eq!(rebuilt, text, "strategy {:?}", strategy);
        }
    }

    #[test]
    fn test_section_marker_detection() {
        assert!(match_section_header("Findings: abc").is_some());
        assert!(match_section_header("IMPRESSION : abc").is_some());
        assert!(match_section_header("finding-like: abc").is_none());
        assert!(match_section_header("Findings without colon").is_none());
    }
}
