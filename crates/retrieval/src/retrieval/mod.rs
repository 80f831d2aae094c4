//! Hybrid candidate retrieval
//!
//! Four candidate-generation channels feed one fused ranking:
//! - Vector search (embedding similarity via pgvector)
//! - Graph search (technology, domain and customer patterns via Apache AGE)
//! - Keyword search (PostgreSQL full-text)
//! - Person-name search (exact, trigram, then model-assisted matching)
//!
//! Results are merged with weighted RRF and optionally reranked by a
//! reasoning model.

mod fusion;
mod graph_search;
mod hybrid;
mod keyword;
mod person;
mod rerank;
mod vector;

pub use fusion::{ChannelWeights, RRFusion, DEFAULT_RRF_K};
pub use graph_search::GraphSearchService;
pub use hybrid::{channel_weights, HybridRetrievalEngine};
pub use keyword::PgKeywordSearch;
pub use person::{is_trigram_unavailable, LlmNameMatcher, PgPersonNameLookup};
pub use rerank::{
    CandidateProfile, PgProfileSource, ProfileSource, ProjectSummary, RerankOutcome,
    SemanticReranker,
};
pub use vector::PgVectorSearch;

use async_trait::async_trait;
use expertmatch_common::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use validator::{Validate, ValidationError};

/// Candidate-generation channel. Ordering is the fusion tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Vector,
    Graph,
    Keyword,
    Person,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Vector, Channel::Graph, Channel::Keyword, Channel::Person];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Vector => "vector",
            Channel::Graph => "graph",
            Channel::Keyword => "keyword",
            Channel::Person => "person",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One vector-index hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    /// Document id (a work-experience record)
    pub id: String,

    /// Cosine similarity in [0, 1]
    pub similarity: f64,

    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl VectorHit {
    /// Owning expert: `employeeId` metadata when present, else the document id
    pub fn expert_id(&self) -> String {
        match self.metadata.get("employeeId") {
            Some(serde_json::Value::String(id)) if !id.is_empty() => id.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => self.id.clone(),
        }
    }
}

/// Embedding similarity search
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search_by_text(&self, text: &str, limit: usize, min_similarity: f64) -> Result<Vec<VectorHit>>;
}

/// Full-text search over work history
#[async_trait]
pub trait KeywordSearch: Send + Sync {
    async fn search_by_keywords(&self, terms: &[String], limit: usize) -> Result<Vec<String>>;
}

/// Expert lookup by person name
#[async_trait]
pub trait PersonNameLookup: Send + Sync {
    async fn find_by_name(&self, name: &str, limit: usize) -> Result<Vec<String>>;

    async fn find_by_similarity(&self, name: &str, threshold: f64, limit: usize) -> Result<Vec<String>>;
}

fn default_max_results() -> usize {
    10
}

fn not_blank(value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

/// A retrieval call
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalRequest {
    /// Free-text requirement, also used verbatim for reranking
    #[validate(length(min = 1, max = 4000), custom(function = "not_blank"))]
    pub query: String,

    #[serde(default = "default_max_results")]
    #[validate(range(min = 1, max = 500))]
    pub max_results: usize,

    #[serde(default)]
    pub rerank: bool,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>, max_results: usize) -> Self {
        Self {
            query: query.into(),
            max_results,
            rerank: false,
        }
    }

    pub fn with_rerank(mut self, rerank: bool) -> Self {
        self.rerank = rerank;
        self
    }
}

/// Final ranking. `scores` holds exactly the ids in `ordered_ids`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResult {
    pub ordered_ids: Vec<String>,
    pub scores: BTreeMap<String, f64>,

    /// False when scores are the fixed placeholder rather than model judgments
    pub reranked: bool,
}

impl RetrievalResult {
    pub fn len(&self) -> usize {
        self.ordered_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered_ids.is_empty()
    }
}

/// Keep the first occurrence of each id
pub(crate) fn dedupe(ids: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter()
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}
