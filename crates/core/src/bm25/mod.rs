//! BM25 full-text search engine.
//!
//! Provides tokenization, an inverted index, and BM25 Okapi scoring behind
//! [`LexicalEngine`], a thread-safe document store keyed by caller ids.

/// Inverted index mapping terms to document postings lists.
pub mod inverted_index;
/// BM25 Okapi scoring algorithm.
pub mod scorer;
/// Tokenizer with stop words and light stemming.
pub mod tokenizer;

pub use inverted_index::{Document, InvertedIndex, Posting, TermStats};
pub use scorer::{bm25_search, LexicalHit};
pub use tokenizer::{tokenize, Tokens};

use crate::config;
use crate::error::{Result, VdbError};
use crate::storage::{load_snapshot, save_snapshot};
use crate::VectorId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const SNAPSHOT_KIND: &str = "lexical-engine";

/// BM25 and tokenizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bm25Config {
    /// Term frequency saturation.
    pub k1: f32,
    /// Length normalization strength in `[0, 1]`.
    pub b: f32,
    pub case_sensitive: bool,
    pub use_stemming: bool,
    /// Shorter tokens are dropped, in characters.
    pub min_term_length: usize,
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self {
            k1: config::BM25_K1,
            b: config::BM25_B,
            case_sensitive: false,
            use_stemming: true,
            min_term_length: config::BM25_MIN_TERM_LENGTH,
        }
    }
}

impl Bm25Config {
    pub fn validate(&self) -> Result<()> {
        if !(self.k1.is_finite() && self.k1 >= 0.0) {
            return Err(VdbError::InvalidConfig(format!("k1 must be non-negative, got {}", self.k1)));
        }
        if !(0.0..=1.0).contains(&self.b) {
            return Err(VdbError::InvalidConfig(format!("b must be in [0, 1], got {}", self.b)));
        }
        if self.min_term_length == 0 {
            return Err(VdbError::InvalidConfig("min_term_length must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    config: Bm25Config,
    index: InvertedIndex,
}

/// Thread-safe BM25 document store.
///
/// Searches share a read lock; add, remove and update take the write lock.
#[derive(Debug)]
pub struct LexicalEngine {
    config: Bm25Config,
    index: RwLock<InvertedIndex>,
}

impl LexicalEngine {
    pub fn new(config: Bm25Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            index: RwLock::new(InvertedIndex::new()),
        })
    }

    pub fn config(&self) -> &Bm25Config {
        &self.config
    }

    /// Processed terms of `text` under this engine's tokenizer settings.
    pub fn analyze(&self, text: &str) -> Vec<String> {
        tokenize(text, &self.config).iter().map(str::to_string).collect()
    }

    fn build_document(&self, id: VectorId, content: &str) -> Result<Document> {
        let tokens = tokenize(content, &self.config);
        if tokens.is_empty() {
            return Err(VdbError::EmptyInput(format!("document {id} has no indexable terms")));
        }
        Ok(Document::from_tokens(id, content, tokens.iter()))
    }

    /// Index `content` under `id`.
    pub fn add_document(&self, id: VectorId, content: &str) -> Result<()> {
        let doc = self.build_document(id, content)?;
        let mut index = self.index.write();
        if index.contains(id) {
            return Err(VdbError::DuplicateId(id));
        }
        debug!(id, length = doc.length, "Indexed document");
        index.insert(doc);
        Ok(())
    }

    /// Remove `id` and update every aggregate.
    pub fn remove_document(&self, id: VectorId) -> Result<()> {
        self.index
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or(VdbError::NotFound(id))
    }

    /// Replace the text of `id`. The new text is checked before the old
    /// document is touched.
    pub fn update_document(&self, id: VectorId, content: &str) -> Result<()> {
        let doc = self.build_document(id, content)?;
        let mut index = self.index.write();
        if index.remove(id).is_none() {
            return Err(VdbError::NotFound(id));
        }
        index.insert(doc);
        Ok(())
    }

    /// Best `k` documents for `query` with `score >= min_score`.
    ///
    /// Fails with `EmptyInput` when the query has no indexable terms. An
    /// empty corpus yields no hits.
    pub fn search(&self, query: &str, k: usize, min_score: f32) -> Result<Vec<LexicalHit>> {
        let terms = tokenize(query, &self.config);
        if terms.is_empty() {
            return Err(VdbError::EmptyInput("query has no indexable terms".to_string()));
        }
        let index = self.index.read();
        Ok(bm25_search(
            &index,
            terms.iter(),
            self.config.k1,
            self.config.b,
            k,
            min_score,
        ))
    }

    pub fn get_document(&self, id: VectorId) -> Option<Document> {
        self.index.read().documents.get(&id).cloned()
    }

    pub fn contains(&self, id: VectorId) -> bool {
        self.index.read().contains(id)
    }

    pub fn document_count(&self) -> usize {
        self.index.read().doc_count()
    }

    /// Number of distinct indexed terms.
    pub fn term_count(&self) -> usize {
        self.index.read().index.len()
    }

    pub fn average_document_length(&self) -> f32 {
        self.index.read().average_doc_length()
    }

    /// Write a checksummed snapshot of the corpus and settings.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        #[derive(Serialize)]
        struct SnapshotRef<'a> {
            config: &'a Bm25Config,
            index: &'a InvertedIndex,
        }
        let index = self.index.read();
        save_snapshot(
            path,
            SNAPSHOT_KIND,
            &SnapshotRef {
                config: &self.config,
                index: &index,
            },
        )
    }

    /// Load a snapshot written by [`LexicalEngine::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let Snapshot { config, index } = load_snapshot(path, SNAPSHOT_KIND)?;
        config.validate()?;
        let total: u64 = index.documents.values().map(|d| d.length as u64).sum();
        if total != index.total_terms {
            return Err(VdbError::Corrupted("lexical snapshot: term totals disagree".to_string()));
        }
        let dangling = index
            .index
            .values()
            .flatten()
            .any(|p| !index.documents.contains_key(&p.doc_id));
        if dangling {
            return Err(VdbError::Corrupted("lexical snapshot: posting for unknown document".to_string()));
        }
        Ok(Self {
            config,
            index: RwLock::new(index),
        })
    }
}

impl Default for LexicalEngine {
    fn default() -> Self {
        Self {
            config: Bm25Config::default(),
            index: RwLock::new(InvertedIndex::new()),
        }
    }
}
