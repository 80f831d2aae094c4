//! Semantic reranking with a reasoning model
//!
//! Candidates are described by short profiles and the model returns a
//! JSON array of `{id, score, reason}`. The answer is only trusted when
//! it is an array naming input ids; otherwise the input order stands.
//! Output is always a permutation of the input (truncated to the limit).

use async_trait::async_trait;
use expertmatch_common::config::{is_sql_identifier, RerankingConfig, RetrievalConfig};
use expertmatch_common::errors::{AppError, Result};
use expertmatch_common::llm::{strip_code_fences, ReasoningModel};
use expertmatch_common::metrics;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One project line of a candidate profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub name: String,
    pub role: Option<String>,
    pub technologies: Vec<String>,
}

/// What the model sees about one candidate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub id: String,
    pub name: String,
    pub seniority: Option<String>,
    pub projects: Vec<ProjectSummary>,
}

impl CandidateProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Prompt block, at most `max_projects` projects
    pub fn render(&self, max_projects: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Expert ID: {}", self.id);
        let _ = writeln!(out, "Name: {}", self.name);
        let _ = writeln!(out, "Seniority: {}", self.seniority.as_deref().unwrap_or("N/A"));
        if !self.projects.is_empty() && max_projects > 0 {
            out.push_str("Projects:\n");
            for project in self.projects.iter().take(max_projects) {
                let _ = write!(out, "  - {}", project.name);
                if let Some(role) = project.role.as_deref().filter(|r| !r.is_empty()) {
                    let _ = write!(out, " ({})", role);
                }
                if !project.technologies.is_empty() {
                    let _ = write!(out, " - Technologies: {}", project.technologies.join(", "));
                }
                out.push('\n');
            }
        }
        out.push('\n');
        out
    }
}

/// Loads candidate profiles for reranking
#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// Profiles for the ids that exist; unknown ids are omitted
    async fn load_profiles(&self, ids: &[String], max_projects: usize) -> Result<Vec<CandidateProfile>>;
}

/// Profiles from `employee` and `work_experience`
pub struct PgProfileSource {
    conn: DatabaseConnection,
    schema: String,
}

impl PgProfileSource {
    pub fn new(conn: DatabaseConnection, schema: &str) -> Result<Self> {
        if !is_sql_identifier(schema) {
            return Err(AppError::Configuration {
                message: format!("schema '{}' is not a plain identifier", schema),
            });
        }
        Ok(Self {
            conn,
            schema: schema.to_string(),
        })
    }
}

/// `$start..$start+count-1` as a comma-separated placeholder list
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn split_technologies(joined: &str) -> Vec<String> {
    joined
        .split('|')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

#[async_trait]
impl ProfileSource for PgProfileSource {
    async fn load_profiles(&self, ids: &[String], max_projects: usize) -> Result<Vec<CandidateProfile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let s = &self.schema;
        let values: Vec<sea_orm::Value> = ids.iter().map(|id| id.clone().into()).collect();

        let employees = self
            .conn
            .query_all(Statement::from_sql_and_values(
                DbBackend::Postgres,
                &format!(
                    "SELECT id::text AS id, name, seniority FROM {s}.employee WHERE id::text IN ({})",
                    placeholders(1, ids.len())
                ),
                values.clone(),
            ))
            .await?;

        let mut profiles: HashMap<String, CandidateProfile> = HashMap::new();
        for row in &employees {
            let id: String = row.try_get("", "id")?;
            let mut profile = CandidateProfile::new(id.clone(), row.try_get::<String>("", "name")?);
            profile.seniority = row.try_get("", "seniority").ok().flatten();
            profiles.insert(id, profile);
        }

        if max_projects > 0 && !profiles.is_empty() {
            let mut project_values = values;
            project_values.push((max_projects as i64).into());
            let sql = format!(
                r#"
                SELECT employee_id, project_name, role, technologies FROM (
                    SELECT we.employee_id::text AS employee_id,
                           we.project_name,
                           we.role,
                           array_to_string(we.technologies, '|') AS technologies,
                           ROW_NUMBER() OVER (
                               PARTITION BY we.employee_id
                               ORDER BY we.start_date DESC NULLS LAST, we.project_name
                           ) AS rn
                    FROM {s}.work_experience we
                    WHERE we.employee_id::text IN ({})
                      AND we.project_name IS NOT NULL
                ) ranked
                WHERE rn <= ${}
                ORDER BY employee_id, rn
                "#,
                placeholders(1, ids.len()),
                ids.len() + 1
            );
            let rows = self
                .conn
                .query_all(Statement::from_sql_and_values(DbBackend::Postgres, &sql, project_values))
                .await?;

            for row in &rows {
                let employee_id: String = row.try_get("", "employee_id")?;
                if let Some(profile) = profiles.get_mut(&employee_id) {
                    profile.projects.push(ProjectSummary {
                        name: row.try_get("", "project_name")?,
                        role: row.try_get("", "role").ok().flatten(),
                        technologies: row
                            .try_get::<Option<String>>("", "technologies")
                            .ok()
                            .flatten()
                            .map(|joined| split_technologies(&joined))
                            .unwrap_or_default(),
                    });
                }
            }
        }

        // Input order, unknown ids dropped
        Ok(ids.iter().filter_map(|id| profiles.remove(id)).collect())
    }
}

/// Reranked ids with their relevance scores
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RerankOutcome {
    pub ordered_ids: Vec<String>,
    pub scores: BTreeMap<String, f64>,

    /// False when the model was not consulted or its answer was discarded
    pub judged: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct Judgment {
    #[serde(alias = "expertId")]
    id: String,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    reason: Option<String>,
}

/// How far a model answer can be trusted
#[derive(Debug)]
enum Verdict {
    Judged(Vec<Judgment>),
    /// A JSON object instead of an array: keep the input order
    NoReordering,
    Untrusted(&'static str),
}

fn judge(response: &str, candidates: &HashSet<&str>) -> Verdict {
    let body = strip_code_fences(response);
    if body.is_empty() {
        return Verdict::Untrusted("empty");
    }

    let items = match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) if items.is_empty() => return Verdict::Untrusted("empty"),
        Ok(Value::Array(items)) => items,
        Ok(Value::Object(_)) => return Verdict::NoReordering,
        Ok(_) | Err(_) => return Verdict::Untrusted("invalid_json"),
    };

    let mut judgments = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<Judgment>(item) {
            Ok(j) => judgments.push(j),
            Err(_) => return Verdict::Untrusted("invalid_json"),
        }
    }

    if let Some(foreign) = judgments.iter().find(|j| !candidates.contains(j.id.as_str())) {
        warn!(id = %foreign.id, "Reranker returned an id outside the candidate set, keeping original order");
        return Verdict::Untrusted("foreign_id");
    }

    Verdict::Judged(judgments)
}

/// Reorders candidates by model-judged relevance
pub struct SemanticReranker {
    model: Option<Arc<dyn ReasoningModel>>,
    profiles: Arc<dyn ProfileSource>,
    placeholder_score: f64,
    missing_score: f64,
    max_projects: usize,
}

impl SemanticReranker {
    pub fn new(
        model: Option<Arc<dyn ReasoningModel>>,
        profiles: Arc<dyn ProfileSource>,
        retrieval: &RetrievalConfig,
        reranking: &RerankingConfig,
    ) -> Self {
        Self {
            model,
            profiles,
            placeholder_score: retrieval.placeholder_score,
            missing_score: retrieval.missing_score,
            max_projects: reranking.max_projects_per_profile,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.model.is_some()
    }

    /// Candidates reordered by relevance, at most `max_results`
    pub async fn rerank(&self, query: &str, candidate_ids: &[String], max_results: usize) -> Result<Vec<String>> {
        Ok(self
            .rerank_with_scores(query, candidate_ids, max_results)
            .await?
            .ordered_ids)
    }

    /// Relevance per candidate in [0, 1], in input order
    pub async fn score_relevance(&self, query: &str, candidate_ids: &[String]) -> Result<BTreeMap<String, f64>> {
        if candidate_ids.is_empty() {
            validate_query(query)?;
            return Ok(BTreeMap::new());
        }
        Ok(self
            .rerank_with_scores(query, candidate_ids, candidate_ids.len())
            .await?
            .scores)
    }

    /// Order and scores from a single model call
    pub async fn rerank_with_scores(
        &self,
        query: &str,
        candidate_ids: &[String],
        max_results: usize,
    ) -> Result<RerankOutcome> {
        validate_query(query)?;
        if max_results < 1 {
            return Err(AppError::validation("max_results", "must be at least 1"));
        }

        let candidates = super::dedupe(candidate_ids.iter().cloned());
        if candidates.is_empty() {
            return Ok(RerankOutcome::default());
        }

        let Some(model) = &self.model else {
            debug!("Reranking not configured, keeping fused order");
            return Ok(self.placeholder(candidates, max_results));
        };

        let profiles = match self.profiles.load_profiles(&candidates, self.max_projects).await {
            Ok(profiles) => profiles,
            Err(e) => {
                warn!(error = %e, "Failed to load candidate profiles, keeping fused order");
                metrics::record_rerank_fallback("error");
                return Ok(self.placeholder(candidates, max_results));
            }
        };

        let prompt = self.prompt(query, &candidates, &profiles);
        let response = match model.complete(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Reranking call failed, keeping fused order");
                metrics::record_rerank_fallback("error");
                return Ok(self.placeholder(candidates, max_results));
            }
        };

        let members: HashSet<&str> = candidates.iter().map(String::as_str).collect();
        let judgments = match judge(&response, &members) {
            Verdict::Judged(judgments) => judgments,
            Verdict::NoReordering => {
                debug!("Reranker answered with an object, keeping fused order");
                return Ok(self.placeholder(candidates, max_results));
            }
            Verdict::Untrusted(reason) => {
                metrics::record_rerank_fallback(reason);
                return Ok(self.placeholder(candidates, max_results));
            }
        };

        let outcome = self.apply(candidates, judgments, max_results);
        info!(count = outcome.ordered_ids.len(), "Reranked candidates");
        Ok(outcome)
    }

    /// Model order by score, then unjudged candidates in input order
    fn apply(&self, candidates: Vec<String>, judgments: Vec<Judgment>, max_results: usize) -> RerankOutcome {
        let mut judged: Vec<(String, f64)> = Vec::with_capacity(judgments.len());
        for j in judgments {
            if judged.iter().any(|(id, _)| *id == j.id) {
                continue;
            }
            let score = j.score.filter(|s| s.is_finite()).unwrap_or(self.missing_score);
            if let Some(reason) = &j.reason {
                debug!(id = %j.id, score, reason = %reason, "rerank judgment");
            }
            judged.push((j.id, score.clamp(0.0, 1.0)));
        }
        // Stable: equal scores keep the model's order
        judged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let seen: HashSet<String> = judged.iter().map(|(id, _)| id.clone()).collect();
        let mut ordered: Vec<(String, f64)> = judged;
        ordered.extend(
            candidates
                .into_iter()
                .filter(|id| !seen.contains(id))
                .map(|id| (id, self.missing_score)),
        );
        ordered.truncate(max_results);

        RerankOutcome {
            ordered_ids: ordered.iter().map(|(id, _)| id.clone()).collect(),
            scores: ordered.into_iter().collect(),
            judged: true,
        }
    }

    fn placeholder(&self, mut candidates: Vec<String>, max_results: usize) -> RerankOutcome {
        candidates.truncate(max_results);
        RerankOutcome {
            scores: candidates
                .iter()
                .map(|id| (id.clone(), self.placeholder_score))
                .collect(),
            ordered_ids: candidates,
            judged: false,
        }
    }

    fn prompt(&self, query: &str, candidates: &[String], profiles: &[CandidateProfile]) -> String {
        let by_id: HashMap<&str, &CandidateProfile> = profiles.iter().map(|p| (p.id.as_str(), p)).collect();

        let mut out = String::new();
        let _ = writeln!(out, "Rank the following experts by how well they match the request.\n");
        let _ = writeln!(out, "Request: {}\n", query.trim());
        out.push_str("Experts:\n\n");
        for id in candidates {
            match by_id.get(id.as_str()) {
                Some(profile) => out.push_str(&profile.render(self.max_projects)),
                None => out.push_str(&CandidateProfile::new(id.clone(), "N/A").render(0)),
            }
        }
        out.push_str(
            "Respond with a JSON array ordered from most to least relevant. Each element must be \
             {\"id\": \"<Expert ID>\", \"score\": <relevance from 0.0 to 1.0>, \"reason\": \"<short reason>\"}. \
             Use only the Expert IDs listed above.",
        );
        out
    }
}

fn validate_query(query: &str) -> Result<()> {
    if query.trim().is_empty() {
        return Err(AppError::validation("query", "query text must not be blank"));
    }
    Ok(())
}
