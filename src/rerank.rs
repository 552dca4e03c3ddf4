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

use crate::config::SummarizeConfig;
use crate::types::RetrievalResult;

/// Re-order retrieval hits by blending the vector score with lexical
/// overlap between the query and the chunk text.
///
/// Output is always a permutation of the input: nothing is added, dropped,
/// or rewritten here.
pub fn rerank(query: &str, mut results: Vec<RetrievalResult>, lexical_weight: f32) -> Vec<RetrievalResult> {
    if results.len() <= 1 {
        return results;
    }

    let query_terms = tokenize(query);
    if query_terms.is_empty() {
        return results;
    }

    let lexical_weight = lexical_weight.clamp(0.0, 1.0);
    let mut keyed: Vec<(f32, usize)> = results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let overlap = lexical_overlap(&query_terms, &r.chunk_text);
            let combined = (1.0 - lexical_weight) * r.score + lexical_weight * overlap;
            (combined, i)
        })
        .collect();

    // Stable on the original order, so equal combined scores keep the
    // vector ranking.
    keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut taken: Vec<Option<RetrievalResult>> = results.drain(..).map(Some).collect();
    keyed
        .into_iter()
        .filter_map(|(_, i)| taken[i].take())
        .collect()
}

/// Fraction of query terms that occur in the text.
fn lexical_overlap(query_terms: &[String], text: &str) -> f32 {
    let text_terms = tokenize(text);
    if query_terms.is_empty() || text_terms.is_empty() {
        return 0.0;
    }
    let hits = query_terms
        .iter()
        .filter(|t| text_terms.contains(t))
        .count();
    hits as f32 / query_terms.len() as f32
}

pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 1)
        .map(|t| t.to_string())
        .collect()
}

/// Extractive context compression: keep the sentences most relevant to the
/// query, up to roughly `max_length` words per chunk.
///
/// A non-empty input never compresses to an empty string; when no sentence
/// matches the query, the text is truncated instead.
pub fn summarize_context(query: &str, text: &str, config: &SummarizeConfig) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    if word_count(text) <= config.max_length {
        return text.to_string();
    }

    let query_terms = tokenize(query);
    let sentences: Vec<&str> = split_sentences(text);

    let mut scored: Vec<(f32, usize)> = sentences
        .iter()
        .enumerate()
        .map(|(i, s)| (lexical_overlap(&query_terms, s), i))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut picked: Vec<usize> = Vec::new();
    let mut budget = config.max_length;
    for (score, i) in scored {
        if score <= 0.0 && !picked.is_empty() {
            break;
        }
        let words = word_count(sentences[i]);
        if words > budget && !picked.is_empty() {
            continue;
        }
        picked.push(i);
        budget = budget.saturating_sub(words);
        if budget == 0 {
            break;
        }
    }

    if picked.is_empty() {
        return truncate_words(text, config.max_length);
    }

    // Present picked sentences in their original order.
    picked.sort_unstable();
    let summary = picked
        .into_iter()
        .map(|i| sentences[i].trim())
        .collect::<Vec<_>>()
        .join(" ");

    if word_count(&summary) > config.max_length {
        truncate_words(&summary, config.max_length)
    } else {
        summary
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        if !matches!(ch, '.' | '!' | '?' | ';') {
            continue;
        }
        if let Some(&(_, next)) = chars.peek() {
            if !next.is_whitespace() {
                continue;
            }
        }
        let end = i + ch.len_utf8();
        if !text[start..end].trim().is_empty() {
            sentences.push(&text[start..end]);
        }
        start = end;
    }
    if !text[start..].trim().is_empty() {
        sentences.push(&text[start..]);
    }
    sentences
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn truncate_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().take(max_words.max(1)).collect();
    words.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn result(text: &str, score: f32) -> RetrievalResult {
        RetrievalResult {
            chunk_text: text.to_string(),
            score,
            distance: 1.0 - score,
            title: "t".to_string(),
            source: "s".to_string(),
            category: "general".to_string(),
            document_id: "d".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_rerank_is_a_permutation() {
        let input = vec![
            result("aspirin reduces fever", 0.9),
            result("unrelated gardening advice", 0.8),
            result("fever management with aspirin dosing", 0.7),
        ];
        let mut before: Vec<String> = input.iter().map(|r| r.chunk_text.clone()).collect();

        let output = rerank("aspirin fever", input, 0.3);
        let mut after: Vec<String> = output.iter().map(|r| r.chunk_text.clone()).collect();

        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn test_lexical_overlap_promotes_matching_chunk() {
        let input = vec![
            result("general wellness tips for winter months", 0.80),
            result("ibuprofen dosing for fever in children", 0.75),
        ];
        let output = rerank("ibuprofen fever dosing", input, 0.5);
        assert!(output[0].chunk_text.contains("ibuprofen"));
    }

    #[test]
    fn test_zero_weight_keeps_vector_order() {
        let input = vec![
            result("lexical match match match", 0.2),
            result("nothing shared here", 0.9),
        ];
        let output = rerank("match", input, 0.0);
        assert!(output[0].chunk_text.contains("nothing shared"));
    }

    #[test]
    fn test_summarize_short_text_unchanged() {
        let config = SummarizeConfig {
            max_length: 50,
            lexical_weight: 0.3,
        };
        let text = "Short clinical note.";
        assert_eq!(summarize_context("anything", text, &config), text);
    }

    #[test]
    fn test_summarize_never_empties_nonempty_input() {
        let config = SummarizeConfig {
            max_length: 10,
            lexical_weight: 0.3,
        };
        let text = "word ".repeat(200);
        let summary = summarize_context("zzz no overlap at all", &text, &config);
        assert!(!summary.trim().is_empty());
        assert!(word_count(&summary) <= 10);
    }

    #[test]
    fn test_summarize_keeps_relevant_sentences() {
        let config = SummarizeConfig {
            max_length: 20,
            lexical_weight: 0.3,
        };
        let text = "The clinic opens at eight in the morning on weekdays only. \
                    Metformin is the first line treatment for type two diabetes. \
                    Parking is available behind the main building for visitors. \
                    Metformin dosing starts at five hundred milligrams daily here.";
        let summary = summarize_context("metformin dosing diabetes", text, &config);
        assert!(summary.to_lowercase().contains("metformin"));
        assert!(!summary.contains("Parking"));
    }
}
