//! BM25 Okapi scoring engine.
//!
//! Scores documents against processed query terms using the BM25 formula with
//! configurable `k1` and `b` (defaults in [`crate::config`]). A query term
//! that occurs twice contributes twice.

use crate::bm25::inverted_index::InvertedIndex;
use crate::VectorId;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// One lexical match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LexicalHit {
    pub id: VectorId,
    pub score: f32,
    /// Distinct query terms found in the document, in query order.
    pub matched_terms: Vec<String>,
}

/// Inverse document frequency: `ln((N - df + 0.5) / (df + 0.5) + 1)`.
#[inline]
pub fn idf(doc_count: usize, df: usize) -> f32 {
    let n = doc_count as f64;
    let df = df as f64;
    ((n - df + 0.5) / (df + 0.5) + 1.0).ln() as f32
}

/// Saturated, length-normalized term frequency.
#[inline]
pub fn tf_component(tf: f32, doc_len: f32, avgdl: f32, k1: f32, b: f32) -> f32 {
    (tf * (k1 + 1.0)) / (tf + k1 * (1.0 - b + b * doc_len / avgdl))
}

/// Score every document sharing a term with `query_terms` and return the
/// best `k` with `score >= min_score`, by descending score then ascending id.
pub fn bm25_search<'q>(
    index: &InvertedIndex,
    query_terms: impl IntoIterator<Item = &'q str>,
    k1: f32,
    b: f32,
    k: usize,
    min_score: f32,
) -> Vec<LexicalHit> {
    let n = index.doc_count();
    if n == 0 || k == 0 {
        return Vec::new();
    }
    let avgdl = index.average_doc_length();

    let mut scores: HashMap<VectorId, (f32, Vec<&'q str>)> = HashMap::with_capacity(256.min(n));
    for term in query_terms {
        let Some(postings) = index.index.get(term) else {
            continue;
        };
        let term_idf = idf(n, postings.len());
        for posting in postings {
            let doc_len = index
                .documents
                .get(&posting.doc_id)
                .map_or(0.0, |d| d.length as f32);
            let score = term_idf * tf_component(posting.term_frequency as f32, doc_len, avgdl, k1, b);
            let entry = scores.entry(posting.doc_id).or_insert_with(|| (0.0, Vec::new()));
            entry.0 += score;
            if !entry.1.contains(&term) {
                entry.1.push(term);
            }
        }
    }

    // Partial sort: min-heap of size k keyed by (score, Reverse(id)).
    type Key = (OrderedFloat<f32>, Reverse<VectorId>);
    let mut heap: BinaryHeap<Reverse<Key>> = BinaryHeap::with_capacity(k + 1);
    let mut matched: HashMap<VectorId, Vec<&'q str>> = HashMap::new();
    for (id, (score, terms)) in scores {
        if score < min_score {
            continue;
        }
        heap.push(Reverse((OrderedFloat(score), Reverse(id))));
        matched.insert(id, terms);
        if heap.len() > k {
            if let Some(Reverse((_, Reverse(evicted)))) = heap.pop() {
                matched.remove(&evicted);
            }
        }
    }

    let mut results: Vec<LexicalHit> = heap
        .into_iter()
        .map(|Reverse((score, Reverse(id)))| LexicalHit {
            id,
            score: score.0,
            matched_terms: matched
                .remove(&id)
                .unwrap_or_default()
                .into_iter()
                .map(str::to_string)
                .collect(),
        })
        .collect();
    results.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bm25::inverted_index::Document;
    use crate::config::{BM25_B, BM25_K1};

    fn build_corpus(docs: &[&str]) -> InvertedIndex {
        let mut idx = InvertedIndex::new();
        for (i, text) in docs.iter().enumerate() {
            idx.insert(Document::from_tokens(i as u64, text, text.split_whitespace()));
        }
        idx
    }

    fn search(idx: &InvertedIndex, query: &str, k: usize) -> Vec<LexicalHit> {
        bm25_search(idx, query.split_whitespace(), BM25_K1, BM25_B, k, f32::MIN)
    }

    fn corpus() -> InvertedIndex {
        build_corpus(&[
            "rust programming systems language fast",
            "python programming scripting easy",
            "java enterprise programming verbose",
            "rust memory safety zero cost abstractions",
        ])
    }

    #[test]
    fn test_idf_matches_formula() {
        assert!((idf(10, 1) - (9.5f32 / 1.5 + 1.0).ln()).abs() < 1e-6);
        // Terms in every document still score positively.
        assert!(idf(4, 4) > 0.0);
    }

    #[test]
    fn test_bm25_empty_index() {
        let idx = InvertedIndex::new();
        assert!(search(&idx, "rust", 10).is_empty());
    }

    #[test]
    fn test_bm25_finds_matching_docs() {
        let results = search(&corpus(), "rust", 10);
        let ids: Vec<u64> = results.iter().map(|h| h.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&0), "doc 0 contains 'rust'");
        assert!(ids.contains(&3), "doc 3 contains 'rust'");
        assert!(results.iter().all(|h| h.matched_terms == vec!["rust"]));
    }

    #[test]
    fn test_bm25_ranking_order() {
        let idx = build_corpus(&["rust rust rust", "rust programming"]);
        let results = search(&idx, "rust", 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, 0, "doc with higher TF should rank first");
    }

    #[test]
    fn test_bm25_no_match() {
        assert!(search(&corpus(), "nonexistent_xyz_term", 10).is_empty());
    }

    #[test]
    fn test_bm25_k_truncation_keeps_best() {
        let idx = corpus();
        let all = search(&idx, "programming rust", 10);
        let top = search(&idx, "programming rust", 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top, all[..2].to_vec());
    }

    #[test]
    fn test_ties_break_by_id() {
        let idx = build_corpus(&["alpha beta", "alpha gamma", "alpha delta"]);
        let ids: Vec<u64> = search(&idx, "alpha", 10).iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_min_score_filter() {
        let idx = corpus();
        let all = search(&idx, "rust programming", 10);
        let cutoff = all[1].score;
        let filtered = bm25_search(&idx, ["rust", "programming"], BM25_K1, BM25_B, 10, cutoff);
        assert!(filtered.iter().all(|h| h.score >= cutoff));
        assert_eq!(filtered.len(), all.iter().filter(|h| h.score >= cutoff).count());
    }

    #[test]
    fn test_matched_terms_in_query_order() {
        let results = search(&corpus(), "programming rust", 10);
        assert_eq!(results[0].id, 0);
        assert_eq!(results[0].matched_terms, vec!["programming", "rust"]);
    }
}
