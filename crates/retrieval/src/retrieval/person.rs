//! Person-name search
//!
//! Lookups in order of strictness: case-insensitive substring match,
//! trigram similarity via `pg_trgm`, and, when `pg_trgm` is not
//! installed, a reasoning model choosing among substring candidates.

use super::PersonNameLookup;
use expertmatch_common::config::is_sql_identifier;
use expertmatch_common::errors::{sqlstate, AppError, Result, SQLSTATE_UNDEFINED_FUNCTION};
use expertmatch_common::llm::{strip_code_fences, ReasoningModel};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, DbErr, Statement};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Candidate names gathered for model-assisted matching
const MATCH_CANDIDATE_LIMIT: i64 = 100;

/// Whether a failure means the trigram functions are not installed
pub fn is_trigram_unavailable(err: &DbErr) -> bool {
    if sqlstate(err).as_deref() == Some(SQLSTATE_UNDEFINED_FUNCTION) {
        return true;
    }
    let message = err.to_string();
    ["function similarity", "function word_similarity", "pg_trgm"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// `%name%` with LIKE wildcards in the name escaped
fn contains_pattern(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len() + 2);
    escaped.push('%');
    for c in name.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Asks a reasoning model which candidate names refer to the queried person
pub struct LlmNameMatcher {
    model: Arc<dyn ReasoningModel>,
}

impl LlmNameMatcher {
    pub fn new(model: Arc<dyn ReasoningModel>) -> Self {
        Self { model }
    }

    fn prompt(query_name: &str, candidates: &[&String]) -> String {
        let names = candidates
            .iter()
            .map(|n| n.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Find the people from the candidate list whose name refers to the same person as \
             \"{query_name}\". Allow for typos, transliteration, nicknames and swapped first/last \
             names.\n\nCandidates:\n{names}\n\n\
             Respond with a JSON array of the matching candidate names exactly as written above, \
             best match first. Respond with [] if none match."
        )
    }

    /// Ids of the candidates the model picks; `candidates` maps a display
    /// name to every employee carrying it. Any failure yields an empty list.
    pub async fn match_names(
        &self,
        query_name: &str,
        candidates: &BTreeMap<String, Vec<String>>,
        limit: usize,
    ) -> Vec<String> {
        if candidates.is_empty() || limit == 0 {
            return Vec::new();
        }

        let names: Vec<&String> = candidates.keys().collect();
        let response = match self.model.complete(&Self::prompt(query_name, &names)).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!(name = query_name, "Empty response from model for name matching");
                return Vec::new();
            }
            Err(e) => {
                error!(name = query_name, error = %e, "Name matching call failed");
                return Vec::new();
            }
        };

        let matched: Vec<String> = match serde_json::from_str(strip_code_fences(&response)) {
            Ok(names) => names,
            Err(e) => {
                warn!(name = query_name, error = %e, "Name matching response is not a JSON array of names");
                return Vec::new();
            }
        };

        let ids = super::dedupe(
            matched
                .iter()
                .filter_map(|n| candidates.get(n))
                .flat_map(|ids| ids.iter().cloned()),
        );
        let ids: Vec<String> = ids.into_iter().take(limit).collect();
        info!(name = query_name, count = ids.len(), "Model name matching");
        ids
    }
}

/// Name lookups against the `employee` table
pub struct PgPersonNameLookup {
    conn: DatabaseConnection,
    schema: String,
    matcher: Option<LlmNameMatcher>,
}

impl PgPersonNameLookup {
    pub fn new(conn: DatabaseConnection, schema: &str) -> Result<Self> {
        if !is_sql_identifier(schema) {
            return Err(AppError::Configuration {
                message: format!("schema '{}' is not a plain identifier", schema),
            });
        }
        Ok(Self {
            conn,
            schema: schema.to_string(),
            matcher: None,
        })
    }

    /// Model used when trigram search is unavailable
    pub fn with_model(mut self, model: Arc<dyn ReasoningModel>) -> Self {
        self.matcher = Some(LlmNameMatcher::new(model));
        self
    }

    async fn ids(&self, sql: String, values: Vec<sea_orm::Value>) -> std::result::Result<Vec<String>, DbErr> {
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(DbBackend::Postgres, &sql, values))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String>("", "id").ok())
            .collect())
    }

    async fn match_with_model(&self, name: &str, limit: usize) -> Vec<String> {
        let Some(matcher) = &self.matcher else {
            debug!(name, "No reasoning model configured for name matching");
            return Vec::new();
        };

        let parts: Vec<&str> = name.split_whitespace().collect();
        let full = contains_pattern(name);
        let first = parts.first().map(|p| contains_pattern(p)).unwrap_or_else(|| full.clone());
        let last = if parts.len() > 1 {
            parts.last().map(|p| contains_pattern(p)).unwrap_or_else(|| full.clone())
        } else {
            full.clone()
        };

        let sql = format!(
            "SELECT id::text AS id, name FROM {}.employee \
             WHERE name ILIKE $1 OR name ILIKE $2 OR name ILIKE $3 \
             LIMIT {}",
            self.schema, MATCH_CANDIDATE_LIMIT
        );
        let rows = match self
            .conn
            .query_all(Statement::from_sql_and_values(
                DbBackend::Postgres,
                &sql,
                vec![full.into(), first.into(), last.into()],
            ))
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(name, error = %e, "Failed to gather name matching candidates");
                return Vec::new();
            }
        };

        let mut candidates: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in &rows {
            if let (Ok(id), Ok(candidate)) = (row.try_get::<String>("", "id"), row.try_get::<String>("", "name")) {
                candidates.entry(candidate).or_default().push(id);
            }
        }
        if candidates.is_empty() {
            debug!(name, "No candidate employees for model name matching");
            return Vec::new();
        }

        matcher.match_names(name, &candidates, limit).await
    }
}

#[async_trait::async_trait]
impl PersonNameLookup for PgPersonNameLookup {
    async fn find_by_name(&self, name: &str, limit: usize) -> Result<Vec<String>> {
        let name = name.trim();
        if name.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT id::text AS id FROM {}.employee WHERE name ILIKE $1 ORDER BY name LIMIT $2",
            self.schema
        );
        let ids = self
            .ids(sql, vec![contains_pattern(name).into(), (limit as i64).into()])
            .await?;
        debug!(name, count = ids.len(), "name search");
        Ok(ids)
    }

    async fn find_by_similarity(&self, name: &str, threshold: f64, limit: usize) -> Result<Vec<String>> {
        let name = name.trim();
        if name.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT id::text AS id
            FROM {}.employee
            WHERE similarity(LOWER(name), LOWER($1)) >= $2
               OR word_similarity(LOWER($1), LOWER(name)) >= $2
            ORDER BY GREATEST(
                similarity(LOWER(name), LOWER($1)),
                word_similarity(LOWER($1), LOWER(name))
            ) DESC
            LIMIT $3
            "#,
            self.schema
        );

        match self
            .ids(sql, vec![name.into(), threshold.into(), (limit as i64).into()])
            .await
        {
            Ok(ids) => {
                debug!(name, threshold, count = ids.len(), "trigram name search");
                Ok(ids)
            }
            Err(e) if is_trigram_unavailable(&e) => {
                info!(name, "pg_trgm not available, using model name matching");
                Ok(self.match_with_model(name, limit).await)
            }
            Err(e) => Err(AppError::Database(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedModel {
        answer: Option<String>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn answering(answer: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: Some(answer.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ReasoningModel for ScriptedModel {
        async fn complete(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.answer.clone().ok_or_else(|| AppError::LlmError {
                message: "unavailable".into(),
            })
        }
    }

    fn candidates_from(rows: &[(&str, &str)]) -> BTreeMap<String, Vec<String>> {
        let mut candidates: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, id) in rows {
            candidates.entry(name.to_string()).or_default().push(id.to_string());
        }
        candidates
    }

    fn candidates() -> BTreeMap<String, Vec<String>> {
        candidates_from(&[("Alice Smith", "E1"), ("Alicia Smyth", "E2"), ("Bob Jones", "E3")])
    }

    #[test]
    fn test_trigram_unavailable_by_message() {
        let err = DbErr::Custom("ERROR: function similarity(text, text) does not exist".into());
        assert!(is_trigram_unavailable(&err));
        let err = DbErr::Custom("relation \"employee\" does not exist".into());
        assert!(!is_trigram_unavailable(&err));
    }

    #[test]
    fn test_contains_pattern_escapes_wildcards() {
        assert_eq!(contains_pattern("Alice"), "%Alice%");
        assert_eq!(contains_pattern("100%_x"), "%100\\%\\_x%");
    }

    #[tokio::test]
    async fn test_match_names_maps_back_to_ids() {
        let model = ScriptedModel::answering("```json\n[\"Alicia Smyth\", \"Nobody\", \"Alice Smith\", \"Alicia Smyth\"]\n```");
        let matcher = LlmNameMatcher::new(model.clone());

        let ids = matcher.match_names("Alice Smyth", &candidates(), 10).await;
        assert_eq!(ids, vec!["E2", "E1"]);

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains("Alice Smith\nAlicia Smyth\nBob Jones"));
    }

    #[test]
    fn test_match_names_respects_limit() {
        let matcher = LlmNameMatcher::new(ScriptedModel::answering("[\"Alice Smith\", \"Alicia Smyth\"]"));
        let ids = tokio_test::block_on(matcher.match_names("Alice", &candidates(), 1));
        assert_eq!(ids, vec!["E1"]);
    }

    #[tokio::test]
    async fn test_match_names_keeps_namesakes() {
        let namesakes = candidates_from(&[("Alice Smith", "E1"), ("Alice Smith", "E2"), ("Bob Jones", "E3")]);
        let matcher = LlmNameMatcher::new(ScriptedModel::answering("[\"Alice Smith\", \"Alice Smith\"]"));

        let ids = matcher.match_names("Alice Smith", &namesakes, 10).await;
        assert_eq!(ids, vec!["E1", "E2"]);

        let ids = matcher.match_names("Alice Smith", &namesakes, 1).await;
        assert_eq!(ids, vec!["E1"]);
    }

    #[tokio::test]
    async fn test_match_names_failures_are_empty() {
        let matcher = LlmNameMatcher::new(ScriptedModel::answering("{\"names\": []}"));
        assert!(matcher.match_names("Alice", &candidates(), 5).await.is_empty());

        let matcher = LlmNameMatcher::new(ScriptedModel::answering("   "));
        assert!(matcher.match_names("Alice", &candidates(), 5).await.is_empty());

        let failing = Arc::new(ScriptedModel {
            answer: None,
            prompts: Mutex::new(Vec::new()),
        });
        let matcher = LlmNameMatcher::new(failing);
        assert!(matcher.match_names("Alice", &candidates(), 5).await.is_empty());
    }
}
