//! ExpertMatch hybrid retrieval
//!
//! Candidate generation over four channels (vector, graph, keyword,
//! person name), weighted rank fusion and optional semantic reranking.

pub mod graph;
pub mod retrieval;

pub use retrieval::{
    Channel, ChannelWeights, HybridRetrievalEngine, RetrievalRequest, RetrievalResult,
};
