//! Configuration management for ExpertMatch retrieval
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Property graph configuration
    #[serde(default)]
    pub graph: GraphConfig,

    /// Retrieval tunables
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Channel weights used by fusion
    #[serde(default)]
    pub weights: WeightsConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Reasoning model used for reranking
    #[serde(default)]
    pub reranking: RerankingConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphConfig {
    /// Name of the property graph
    #[serde(default = "default_graph_name")]
    pub name: String,

    /// Application schema appended to the search path
    #[serde(default = "default_graph_schema")]
    pub schema: String,

    /// Issue `LOAD 'age'` before each query
    #[serde(default = "default_true")]
    pub load_extension: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Vector similarity floor
    #[serde(default = "default_vector_min_similarity")]
    pub vector_min_similarity: f64,

    /// Trigram similarity threshold for person names
    #[serde(default = "default_person_similarity_threshold")]
    pub person_similarity_threshold: f64,

    /// Rank discount constant for reciprocal rank fusion
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,

    /// Score given to every result when reranking is off
    #[serde(default = "default_placeholder_score")]
    pub placeholder_score: f64,

    /// Score for ids the reasoning model did not judge
    #[serde(default = "default_missing_score")]
    pub missing_score: f64,

    /// Timeout per candidate-generation channel in milliseconds
    #[serde(default = "default_channel_timeout")]
    pub channel_timeout_ms: u64,

    /// Timeout for the whole retrieval in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Row cap applied inside graph queries
    #[serde(default = "default_graph_row_limit")]
    pub graph_row_limit: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WeightsConfig {
    #[serde(default = "default_vector_weight")]
    pub vector: f64,

    #[serde(default = "default_graph_weight")]
    pub graph: f64,

    #[serde(default = "default_keyword_weight")]
    pub keyword: f64,

    #[serde(default = "default_person_weight")]
    pub person: f64,

    /// Keyword weight when the query names technologies
    #[serde(default = "default_keyword_boosted")]
    pub keyword_with_technologies: f64,

    /// Graph weight for team formation queries
    #[serde(default = "default_graph_boosted")]
    pub graph_team_formation: f64,

    /// Person weight when a person entity was extracted
    #[serde(default = "default_person_boosted")]
    pub person_with_entities: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, mock
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RerankingConfig {
    /// Whether a reasoning model is configured at all
    #[serde(default)]
    pub enabled: bool,

    /// Chat completions endpoint
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    pub api_key: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,

    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Projects listed per candidate profile
    #[serde(default = "default_max_projects")]
    pub max_projects_per_profile: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_true")]
    pub json_logging: bool,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_true() -> bool { true }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_graph_name() -> String { "expertmatch_graph".to_string() }
fn default_graph_schema() -> String { "expertmatch".to_string() }
fn default_vector_min_similarity() -> f64 { 0.7 }
fn default_person_similarity_threshold() -> f64 { 0.3 }
fn default_rrf_k() -> f64 { 60.0 }
fn default_placeholder_score() -> f64 { 0.8 }
fn default_missing_score() -> f64 { 0.5 }
fn default_channel_timeout() -> u64 { 5_000 }
fn default_request_timeout() -> u64 { 30_000 }
fn default_graph_row_limit() -> usize { 100 }
fn default_vector_weight() -> f64 { 1.0 }
fn default_graph_weight() -> f64 { 0.8 }
fn default_keyword_weight() -> f64 { 0.6 }
fn default_person_weight() -> f64 { 2.0 }
fn default_keyword_boosted() -> f64 { 0.8 }
fn default_graph_boosted() -> f64 { 1.0 }
fn default_person_boosted() -> f64 { 3.0 }
fn default_embedding_provider() -> String { "openai".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_dimension() -> usize { 1536 }
fn default_embedding_timeout() -> u64 { 30 }
fn default_llm_endpoint() -> String { "https://api.openai.com/v1/chat/completions".to_string() }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_llm_temperature() -> f32 { 0.1 }
fn default_llm_max_tokens() -> u32 { 2048 }
fn default_llm_timeout() -> u64 { 60 }
fn default_max_projects() -> usize { 3 }
fn default_log_level() -> String { "info".to_string() }
fn default_service_name() -> String { "expertmatch-retrieval".to_string() }

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            name: default_graph_name(),
            schema: default_graph_schema(),
            load_extension: true,
        }
    }
}

impl RetrievalConfig {
    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_min_similarity: default_vector_min_similarity(),
            person_similarity_threshold: default_person_similarity_threshold(),
            rrf_k: default_rrf_k(),
            placeholder_score: default_placeholder_score(),
            missing_score: default_missing_score(),
            channel_timeout_ms: default_channel_timeout(),
            request_timeout_ms: default_request_timeout(),
            graph_row_limit: default_graph_row_limit(),
        }
    }
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            vector: default_vector_weight(),
            graph: default_graph_weight(),
            keyword: default_keyword_weight(),
            person: default_person_weight(),
            keyword_with_technologies: default_keyword_boosted(),
            graph_team_formation: default_graph_boosted(),
            person_with_entities: default_person_boosted(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl Default for RerankingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_llm_endpoint(),
            api_key: None,
            model: default_llm_model(),
            temperature: default_llm_temperature(),
            max_tokens: default_llm_max_tokens(),
            timeout_secs: default_llm_timeout(),
            max_projects_per_profile: default_max_projects(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: true,
            service_name: default_service_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            .set_default("database.url", "postgres://localhost/expertmatch")?
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // e.g., APP__GRAPH__NAME=staging_graph
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Reject settings that would produce broken queries or meaningless fusion
    pub fn validate(&self) -> Result<()> {
        if !is_sql_identifier(&self.graph.name) {
            return Err(AppError::Configuration {
                message: format!("graph name '{}' is not a plain identifier", self.graph.name),
            });
        }
        if !self.graph.schema.is_empty() && !is_sql_identifier(&self.graph.schema) {
            return Err(AppError::Configuration {
                message: format!("graph schema '{}' is not a plain identifier", self.graph.schema),
            });
        }

        let w = &self.weights;
        let weights = [
            ("vector", w.vector),
            ("graph", w.graph),
            ("keyword", w.keyword),
            ("person", w.person),
            ("keyword_with_technologies", w.keyword_with_technologies),
            ("graph_team_formation", w.graph_team_formation),
            ("person_with_entities", w.person_with_entities),
        ];
        for (name, value) in weights {
            if !(value.is_finite() && value > 0.0) {
                return Err(AppError::Configuration {
                    message: format!("weights.{} must be positive, got {}", name, value),
                });
            }
        }

        if self.retrieval.rrf_k < 0.0 {
            return Err(AppError::Configuration {
                message: "retrieval.rrf_k must not be negative".to_string(),
            });
        }

        Ok(())
    }
}

/// Letters, digits and underscores, not starting with a digit
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/expertmatch".to_string(),
                read_url: None,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
            },
            graph: GraphConfig::default(),
            retrieval: RetrievalConfig::default(),
            weights: WeightsConfig::default(),
            embedding: EmbeddingConfig::default(),
            reranking: RerankingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.graph.name, "expertmatch_graph");
        assert_eq!(config.retrieval.rrf_k, 60.0);
        assert_eq!(config.weights.person_with_entities, 3.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retrieval_timeouts() {
        let mut config = AppConfig::default();
        config.retrieval.channel_timeout_ms = 250;
        config.retrieval.request_timeout_ms = 1_500;
        assert_eq!(config.retrieval.channel_timeout(), Duration::from_millis(250));
        assert_eq!(config.retrieval.request_timeout(), Duration::from_millis(1_500));
    }

    #[test]
    fn test_rejects_quoted_graph_name() {
        let mut config = AppConfig::default();
        config.graph.name = "graph'; DROP TABLE x; --".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_weight() {
        let mut config = AppConfig::default();
        config.weights.keyword = 0.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("weights.keyword"));
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_sql_identifier("expertmatch_graph"));
        assert!(is_sql_identifier("_g1"));
        assert!(!is_sql_identifier("1graph"));
        assert!(!is_sql_identifier(""));
        assert!(!is_sql_identifier("my-graph"));
    }
}
