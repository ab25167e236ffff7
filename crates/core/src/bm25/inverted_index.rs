//! Inverted index for BM25 full-text search.
//!
//! Maps terms to postings lists (document id + term frequency) and keeps the
//! per-document term statistics needed to undo an insertion. Corpus
//! aggregates (document count, total term count) are updated incrementally.

use crate::VectorId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single entry in a term's postings list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: VectorId,
    /// Number of times the term appears in this document.
    pub term_frequency: u32,
}

/// Occurrences of one term inside one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TermStats {
    pub frequency: u32,
    /// Token positions, ascending.
    pub positions: Vec<u32>,
}

/// An indexed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: VectorId,
    /// Original text as supplied.
    pub content: String,
    /// Number of indexed tokens.
    pub length: u32,
    pub terms: HashMap<String, TermStats>,
}

impl Document {
    /// Build a document from its processed token stream.
    pub fn from_tokens<'a>(id: VectorId, content: &str, tokens: impl Iterator<Item = &'a str>) -> Self {
        let mut terms: HashMap<String, TermStats> = HashMap::new();
        let mut length = 0u32;
        for (pos, token) in tokens.enumerate() {
            let stats = terms.entry(token.to_string()).or_default();
            stats.frequency += 1;
            stats.positions.push(pos as u32);
            length += 1;
        }
        Self {
            id,
            content: content.to_string(),
            length,
            terms,
        }
    }
}

/// Inverted index mapping terms to postings lists.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InvertedIndex {
    /// term → list of postings, in insertion order
    pub index: HashMap<String, Vec<Posting>>,
    pub documents: HashMap<VectorId, Document>,
    /// Sum of all document lengths (for average calculation)
    pub total_terms: u64,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn doc_count(&self) -> usize {
        self.documents.len()
    }

    pub fn contains(&self, id: VectorId) -> bool {
        self.documents.contains_key(&id)
    }

    /// Number of documents containing `term`.
    pub fn document_frequency(&self, term: &str) -> usize {
        self.index.get(term).map_or(0, Vec::len)
    }

    /// Index a document. The caller has checked that its id is new.
    pub fn insert(&mut self, doc: Document) {
        for (term, stats) in &doc.terms {
            self.index.entry(term.clone()).or_default().push(Posting {
                doc_id: doc.id,
                term_frequency: stats.frequency,
            });
        }
        self.total_terms += doc.length as u64;
        self.documents.insert(doc.id, doc);
    }

    /// Remove a document and its postings, dropping emptied postings lists.
    pub fn remove(&mut self, id: VectorId) -> Option<Document> {
        let doc = self.documents.remove(&id)?;
        for term in doc.terms.keys() {
            if let Some(postings) = self.index.get_mut(term) {
                postings.retain(|p| p.doc_id != id);
                if postings.is_empty() {
                    self.index.remove(term);
                }
            }
        }
        self.total_terms -= doc.length as u64;
        Some(doc)
    }

    /// Returns the average document length across all indexed documents.
    pub fn average_doc_length(&self) -> f32 {
        if self.documents.is_empty() {
            return 0.0;
        }
        (self.total_terms as f64 / self.documents.len() as f64) as f32
    }
}
