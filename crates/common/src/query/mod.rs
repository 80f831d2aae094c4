//! Query understanding types
//!
//! Produced upstream of retrieval by a query parser and an entity
//! extractor; retrieval only reads them.

use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Query intent classification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    /// Find individual experts
    #[default]
    ExpertSearch,
    /// Assemble a team covering several requirements
    TeamFormation,
    /// Answer a request for proposal
    RfpResponse,
    /// Anything the classifier could not place
    #[serde(other)]
    General,
}

/// Structured requirements extracted from a free-text query
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ParsedQuery {
    pub original_query: String,
    pub skills: Vec<String>,
    pub seniority_levels: Vec<String>,
    /// Required language proficiency, if any
    pub language: Option<String>,
    pub intent: QueryIntent,
    pub technologies: Vec<String>,
}

impl ParsedQuery {
    /// Skills followed by technologies not already listed
    pub fn keyword_terms(&self) -> Vec<String> {
        let mut terms: Vec<String> = Vec::with_capacity(self.skills.len() + self.technologies.len());
        for term in self.skills.iter().chain(self.technologies.iter()) {
            if !term.trim().is_empty() && !terms.contains(term) {
                terms.push(term.clone());
            }
        }
        terms
    }
}

/// Types of entities the extractor recognises
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Organization,
    Technology,
    Project,
    Domain,
}

/// A named entity, optionally resolved to an id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
}

impl Entity {
    pub fn new(entity_type: EntityType, name: impl Into<String>) -> Self {
        Self {
            entity_type,
            name: name.into(),
            id: None,
        }
    }
}

/// Entities grouped by type
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractedEntities {
    pub persons: Vec<Entity>,
    pub organizations: Vec<Entity>,
    pub technologies: Vec<Entity>,
    pub projects: Vec<Entity>,
    pub domains: Vec<Entity>,
}

impl ExtractedEntities {
    pub fn has_persons(&self) -> bool {
        self.persons.iter().any(|p| !p.name.trim().is_empty())
    }
}

/// Turns free text into structured requirements
#[async_trait]
pub trait QueryParser: Send + Sync {
    async fn parse(&self, text: &str) -> Result<ParsedQuery>;
}

/// Extracts named entities from free text
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<ExtractedEntities>;
}
