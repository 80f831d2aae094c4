//! ExpertMatch Common Library
//!
//! Shared code for the ExpertMatch retrieval crates:
//! - Configuration management
//! - Error types and handling
//! - Database connection pool
//! - Embedding and reasoning-model clients
//! - Query understanding types
//! - Metrics

pub mod config;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod llm;
pub mod metrics;
pub mod query;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::DbPool;
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use llm::ReasoningModel;
pub use query::{EntityExtractor, ExtractedEntities, ParsedQuery, QueryIntent, QueryParser};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
