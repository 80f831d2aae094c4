//! Hybrid retrieval engine
//!
//! Runs the four channels concurrently, fuses their candidate lists with
//! query-dependent weights and optionally reranks the fused list. A
//! failing or slow channel contributes nothing; only invalid input or the
//! request deadline fail the call.

use super::fusion::{ChannelWeights, RRFusion};
use super::graph_search::GraphSearchService;
use super::rerank::SemanticReranker;
use super::{dedupe, Channel, KeywordSearch, PersonNameLookup, RetrievalRequest, RetrievalResult, VectorSearch};
use expertmatch_common::config::{AppConfig, RetrievalConfig, WeightsConfig};
use expertmatch_common::errors::{AppError, Result};
use expertmatch_common::metrics;
use expertmatch_common::query::{ExtractedEntities, ParsedQuery, QueryIntent};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use validator::Validate;

/// Fusion weights for one query.
///
/// Technology terms lift keyword, team formation lifts graph and a named
/// person lifts the person channel.
pub fn channel_weights(
    config: &WeightsConfig,
    parsed: &ParsedQuery,
    entities: &ExtractedEntities,
) -> ChannelWeights {
    let mut weights = ChannelWeights::base(config);

    if parsed.technologies.iter().any(|t| !t.trim().is_empty()) {
        weights.set(Channel::Keyword, config.keyword_with_technologies);
    }
    if parsed.intent == QueryIntent::TeamFormation {
        weights.set(Channel::Graph, config.graph_team_formation);
    }
    if entities.has_persons() {
        weights.set(Channel::Person, config.person_with_entities);
    }

    weights
}

/// Orchestrates candidate generation, fusion and reranking
pub struct HybridRetrievalEngine {
    vector: Arc<dyn VectorSearch>,
    graph: GraphSearchService,
    keyword: Arc<dyn KeywordSearch>,
    person: Arc<dyn PersonNameLookup>,
    reranker: SemanticReranker,
    fusion: RRFusion,
    weights: WeightsConfig,
    settings: RetrievalConfig,
}

impl HybridRetrievalEngine {
    pub fn new(
        vector: Arc<dyn VectorSearch>,
        graph: GraphSearchService,
        keyword: Arc<dyn KeywordSearch>,
        person: Arc<dyn PersonNameLookup>,
        reranker: SemanticReranker,
        config: &AppConfig,
    ) -> Self {
        Self {
            vector,
            graph,
            keyword,
            person,
            reranker,
            fusion: RRFusion::new(config.retrieval.rrf_k),
            weights: config.weights.clone(),
            settings: config.retrieval.clone(),
        }
    }

    /// Ranked expert ids for a request and its parsed form.
    ///
    /// Fails only on invalid input or when the request deadline passes;
    /// in-flight channel work is dropped with the deadline.
    pub async fn retrieve(
        &self,
        request: &RetrievalRequest,
        parsed: &ParsedQuery,
        entities: &ExtractedEntities,
    ) -> Result<RetrievalResult> {
        request.validate()?;

        let timeout_ms = self.settings.request_timeout_ms;
        match tokio::time::timeout(self.settings.request_timeout(), self.run(request, parsed, entities)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms, "Retrieval timed out");
                Err(AppError::Timeout {
                    operation: "retrieval".to_string(),
                    timeout_ms,
                })
            }
        }
    }

    async fn run(
        &self,
        request: &RetrievalRequest,
        parsed: &ParsedQuery,
        entities: &ExtractedEntities,
    ) -> Result<RetrievalResult> {
        let started = Instant::now();
        let query = request.query.trim();
        let limit = request.max_results;

        let (vector, graph, keyword, person) = tokio::join!(
            self.channel(Channel::Vector, limit, self.vector_candidates(query, limit)),
            self.channel(Channel::Graph, limit, self.graph_candidates(parsed, entities, limit)),
            self.channel(Channel::Keyword, limit, self.keyword_candidates(parsed, limit)),
            self.channel(Channel::Person, limit, self.person_candidates(entities, limit)),
        );

        let lists: BTreeMap<Channel, Vec<String>> = [
            (Channel::Vector, vector),
            (Channel::Graph, graph),
            (Channel::Keyword, keyword),
            (Channel::Person, person),
        ]
        .into_iter()
        .collect();

        let weights = channel_weights(&self.weights, parsed, entities);
        let fused = self.fusion.fuse(&lists, &weights);
        debug!(fused = fused.len(), ?weights, "fused candidates");

        let result = if request.rerank && !fused.is_empty() {
            self.rerank(query, fused, limit).await
        } else {
            self.placeholder(fused, limit)
        };

        metrics::record_retrieval(started.elapsed().as_secs_f64(), result.reranked, result.len());
        info!(
            results = result.len(),
            reranked = result.reranked,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Retrieval complete"
        );
        Ok(result)
    }

    /// Bound one channel by the channel timeout; failure or timeout is an empty list
    async fn channel<F>(&self, channel: Channel, limit: usize, work: F) -> Vec<String>
    where
        F: Future<Output = Result<Vec<String>>>,
    {
        let started = Instant::now();
        let timeout = self.settings.channel_timeout();

        let (ids, failed) = match tokio::time::timeout(timeout, work).await {
            Ok(Ok(ids)) => {
                let mut ids = dedupe(ids);
                ids.truncate(limit);
                (ids, false)
            }
            Ok(Err(e)) => {
                warn!(channel = %channel, error = %e, "Channel failed, continuing without it");
                (Vec::new(), true)
            }
            Err(_) => {
                warn!(channel = %channel, timeout_ms = self.settings.channel_timeout_ms, "Channel timed out");
                (Vec::new(), true)
            }
        };

        metrics::record_channel(channel.as_str(), started.elapsed().as_secs_f64(), ids.len(), failed);
        debug!(channel = %channel, count = ids.len(), "channel candidates");
        ids
    }

    async fn vector_candidates(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let hits = self
            .vector
            .search_by_text(query, limit, self.settings.vector_min_similarity)
            .await?;
        Ok(hits.iter().map(|hit| hit.expert_id()).collect())
    }

    async fn graph_candidates(
        &self,
        parsed: &ParsedQuery,
        entities: &ExtractedEntities,
        limit: usize,
    ) -> Result<Vec<String>> {
        let terms = parsed.keyword_terms();
        let technologies = dedupe(parsed.technologies.iter().map(|t| t.trim().to_string()));
        let domains = dedupe(entities.domains.iter().map(|d| d.name.trim().to_string()));

        let mut ids: Vec<String> = Vec::new();

        // Experts holding every technology first; they are the closest fit
        if technologies.len() > 1 {
            ids.extend(self.graph.find_experts_by_technologies(&technologies).await);
        }

        let per_term = join_all(terms.iter().map(|t| self.graph.find_experts_by_technology(t))).await;
        ids.extend(per_term.into_iter().flatten());

        let per_domain = join_all(domains.iter().map(|d| self.graph.find_experts_by_domain(d))).await;
        ids.extend(per_domain.into_iter().flatten());

        let mut ids = dedupe(ids);
        ids.truncate(limit);
        Ok(ids)
    }

    async fn keyword_candidates(&self, parsed: &ParsedQuery, limit: usize) -> Result<Vec<String>> {
        let terms = parsed.keyword_terms();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        self.keyword.search_by_keywords(&terms, limit).await
    }

    async fn person_candidates(&self, entities: &ExtractedEntities, limit: usize) -> Result<Vec<String>> {
        let names = dedupe(entities.persons.iter().map(|p| p.name.trim().to_string()));
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for name in &names {
            let mut found = self.person.find_by_name(name, limit).await?;
            if found.is_empty() {
                found = self
                    .person
                    .find_by_similarity(name, self.settings.person_similarity_threshold, limit)
                    .await?;
            }
            debug!(name = %name, count = found.len(), "person lookup");
            ids.extend(found);
        }
        Ok(ids)
    }

    async fn rerank(&self, query: &str, fused: Vec<String>, limit: usize) -> RetrievalResult {
        match self.reranker.rerank_with_scores(query, &fused, limit).await {
            Ok(outcome) if !outcome.ordered_ids.is_empty() => {
                let reranked = outcome.judged;
                // Scores only for the ids that survived
                let scores = outcome
                    .ordered_ids
                    .iter()
                    .map(|id| {
                        let score = outcome
                            .scores
                            .get(id)
                            .copied()
                            .unwrap_or(self.settings.missing_score);
                        (id.clone(), score)
                    })
                    .collect();
                RetrievalResult {
                    ordered_ids: outcome.ordered_ids,
                    scores,
                    reranked,
                }
            }
            Ok(_) => {
                warn!("Reranking returned nothing for a non-empty candidate list, using fused order");
                metrics::record_rerank_fallback("empty");
                self.placeholder(fused, limit)
            }
            Err(e) => {
                warn!(error = %e, "Reranking failed, using fused order");
                metrics::record_rerank_fallback("error");
                self.placeholder(fused, limit)
            }
        }
    }

    /// Fused order with the fixed placeholder score; not a relevance signal
    fn placeholder(&self, mut ids: Vec<String>, limit: usize) -> RetrievalResult {
        ids.truncate(limit);
        let scores = ids
            .iter()
            .map(|id| (id.clone(), self.settings.placeholder_score))
            .collect();
        RetrievalResult {
            ordered_ids: ids,
            scores,
            reranked: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphCatalog, GraphExecutor, GraphParams, GraphRow};
    use crate::retrieval::rerank::{CandidateProfile, ProfileSource};
    use crate::retrieval::VectorHit;
    use async_trait::async_trait;
    use expertmatch_common::llm::ReasoningModel;
    use expertmatch_common::query::{Entity, EntityType};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FixedVector(Vec<&'static str>);

    #[async_trait]
    impl VectorSearch for FixedVector {
        async fn search_by_text(&self, _text: &str, limit: usize, _min: f64) -> Result<Vec<VectorHit>> {
            Ok(self
                .0
                .iter()
                .take(limit)
                .map(|id| VectorHit {
                    id: format!("WE-{id}"),
                    similarity: 0.9,
                    metadata: [("employeeId".to_string(), json!(id))].into_iter().collect(),
                })
                .collect())
        }
    }

    struct FailingVector;

    #[async_trait]
    impl VectorSearch for FailingVector {
        async fn search_by_text(&self, _text: &str, _limit: usize, _min: f64) -> Result<Vec<VectorHit>> {
            Err(AppError::EmbeddingError {
                message: "embedding service unavailable".into(),
            })
        }
    }

    struct SlowVector;

    #[async_trait]
    impl VectorSearch for SlowVector {
        async fn search_by_text(&self, _text: &str, _limit: usize, _min: f64) -> Result<Vec<VectorHit>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    struct FixedKeyword {
        ids: Vec<&'static str>,
        seen: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl KeywordSearch for FixedKeyword {
        async fn search_by_keywords(&self, terms: &[String], _limit: usize) -> Result<Vec<String>> {
            self.seen.lock().unwrap().push(terms.to_vec());
            Ok(self.ids.iter().map(|s| s.to_string()).collect())
        }
    }

    /// Exact names and fuzzy names map to ids
    struct Directory {
        exact: Vec<(&'static str, &'static str)>,
        fuzzy: Vec<(&'static str, &'static str)>,
        similarity_calls: Mutex<Vec<(String, f64)>>,
    }

    #[async_trait]
    impl PersonNameLookup for Directory {
        async fn find_by_name(&self, name: &str, _limit: usize) -> Result<Vec<String>> {
            Ok(self
                .exact
                .iter()
                .filter(|(n, _)| *n == name)
                .map(|(_, id)| id.to_string())
                .collect())
        }

        async fn find_by_similarity(&self, name: &str, threshold: f64, _limit: usize) -> Result<Vec<String>> {
            self.similarity_calls.lock().unwrap().push((name.to_string(), threshold));
            Ok(self
                .fuzzy
                .iter()
                .filter(|(n, _)| *n == name)
                .map(|(_, id)| id.to_string())
                .collect())
        }
    }

    /// Technology name -> experts, AND semantics for lists
    struct TechGraph(Vec<(&'static str, Vec<&'static str>)>);

    #[async_trait]
    impl GraphExecutor for TechGraph {
        async fn execute(&self, _query: &str, params: &GraphParams) -> Result<Vec<GraphRow>> {
            let matches = |wanted: Vec<&str>| -> Vec<GraphRow> {
                self.0
                    .iter()
                    .filter(|(_, techs)| wanted.iter().all(|w| techs.contains(w)))
                    .map(|(id, _)| GraphRow::single(json!(id)))
                    .collect()
            };
            if let Some(tech) = params.get("technology").and_then(|v| v.as_str()) {
                return Ok(matches(vec![tech]));
            }
            if let Some(list) = params.get("technologies").and_then(|v| v.as_array()) {
                return Ok(matches(list.iter().filter_map(|v| v.as_str()).collect()));
            }
            Ok(Vec::new())
        }
    }

    struct Present;

    #[async_trait]
    impl GraphCatalog for Present {
        async fn graph_exists(&self) -> bool {
            true
        }
    }

    struct NamedProfiles;

    #[async_trait]
    impl ProfileSource for NamedProfiles {
        async fn load_profiles(&self, ids: &[String], _max: usize) -> Result<Vec<CandidateProfile>> {
            Ok(ids.iter().map(|id| CandidateProfile::new(id.clone(), id.clone())).collect())
        }
    }

    struct CannedModel(String);

    #[async_trait]
    impl ReasoningModel for CannedModel {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct Fixture {
        vector: Arc<dyn VectorSearch>,
        keyword: Arc<FixedKeyword>,
        person: Arc<Directory>,
        graph: Vec<(&'static str, Vec<&'static str>)>,
        model: Option<Arc<dyn ReasoningModel>>,
        config: AppConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let mut config: AppConfig = serde_json::from_value(json!({
                "database": {"url": "postgres://localhost/test"}
            }))
            .unwrap();
            config.retrieval.channel_timeout_ms = 200;
            config.retrieval.request_timeout_ms = 2_000;

            Self {
                vector: Arc::new(FixedVector(vec!["E2", "E3", "E4"])),
                keyword: Arc::new(FixedKeyword {
                    ids: vec!["E4", "E2", "E3"],
                    seen: Mutex::new(Vec::new()),
                }),
                person: Arc::new(Directory {
                    exact: vec![("Alice Smith", "E1")],
                    fuzzy: vec![("Alise Smit", "E1")],
                    similarity_calls: Mutex::new(Vec::new()),
                }),
                graph: vec![
                    ("E3", vec!["Java", "AWS"]),
                    ("E2", vec!["Java"]),
                    ("E5", vec!["AWS"]),
                ],
                model: None,
                config,
            }
        }

        fn engine(&self) -> HybridRetrievalEngine {
            let graph = GraphSearchService::new(Arc::new(TechGraph(self.graph.clone())), Arc::new(Present), 100);
            let reranker = SemanticReranker::new(
                self.model.clone(),
                Arc::new(NamedProfiles),
                &self.config.retrieval,
                &self.config.reranking,
            );
            HybridRetrievalEngine::new(
                self.vector.clone(),
                graph,
                self.keyword.clone(),
                self.person.clone(),
                reranker,
                &self.config,
            )
        }
    }

    fn java_aws() -> ParsedQuery {
        ParsedQuery {
            original_query: "Need a senior Java and AWS expert".into(),
            technologies: vec!["Java".into(), "AWS".into()],
            seniority_levels: vec!["senior".into()],
            ..Default::default()
        }
    }

    fn alice() -> ExtractedEntities {
        ExtractedEntities {
            persons: vec![Entity::new(EntityType::Person, "Alice Smith")],
            ..Default::default()
        }
    }

    fn assert_consistent(result: &RetrievalResult) {
        assert_eq!(result.ordered_ids.len(), result.scores.len());
        for id in &result.ordered_ids {
            assert!(result.scores.contains_key(id), "no score for {id}");
        }
    }

    #[test]
    fn test_weight_policy() {
        let config = WeightsConfig::default();

        let plain = channel_weights(&config, &ParsedQuery::default(), &ExtractedEntities::default());
        assert_eq!(plain.get(Channel::Vector), 1.0);
        assert_eq!(plain.get(Channel::Graph), 0.8);
        assert_eq!(plain.get(Channel::Keyword), 0.6);
        assert_eq!(plain.get(Channel::Person), 2.0);

        let boosted = channel_weights(
            &config,
            &ParsedQuery {
                technologies: vec!["Java".into()],
                intent: QueryIntent::TeamFormation,
                ..Default::default()
            },
            &alice(),
        );
        assert_eq!(boosted.get(Channel::Keyword), 0.8);
        assert_eq!(boosted.get(Channel::Graph), 1.0);
        assert_eq!(boosted.get(Channel::Person), 3.0);
        assert_eq!(boosted.get(Channel::Vector), 1.0);
    }

    #[tokio::test]
    async fn test_named_person_ranks_first() {
        let fixture = Fixture::new();
        let request = RetrievalRequest::new(
            "Need a senior Java and AWS expert, ideally someone like Alice Smith",
            10,
        );

        let result = fixture.engine().retrieve(&request, &java_aws(), &alice()).await.unwrap();

        assert_eq!(result.ordered_ids[0], "E1");
        assert!(!result.reranked);
        assert!(result.scores.values().all(|s| *s == 0.8));
        assert_consistent(&result);

        let mut sorted = result.ordered_ids.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["E1", "E2", "E3", "E4", "E5"]);
    }

    #[tokio::test]
    async fn test_fuzzy_lookup_only_without_exact_match() {
        let fixture = Fixture::new();
        let entities = ExtractedEntities {
            persons: vec![
                Entity::new(EntityType::Person, "Alice Smith"),
                Entity::new(EntityType::Person, "Alise Smit"),
            ],
            ..Default::default()
        };

        let result = fixture
            .engine()
            .retrieve(&RetrievalRequest::new("Alice", 5), &ParsedQuery::default(), &entities)
            .await
            .unwrap();
        assert_eq!(result.ordered_ids[0], "E1");

        let calls = fixture.person.similarity_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("Alise Smit".to_string(), 0.3));
    }

    #[tokio::test]
    async fn test_keyword_terms_are_skills_and_technologies() {
        let fixture = Fixture::new();
        let parsed = ParsedQuery {
            skills: vec!["Microservices".into()],
            technologies: vec!["Java".into()],
            ..Default::default()
        };
        fixture
            .engine()
            .retrieve(&RetrievalRequest::new("Java microservices", 5), &parsed, &ExtractedEntities::default())
            .await
            .unwrap();

        let seen = fixture.keyword.seen.lock().unwrap();
        assert_eq!(seen[0], vec!["Microservices".to_string(), "Java".to_string()]);
    }

    #[tokio::test]
    async fn test_keyword_skipped_without_terms() {
        let fixture = Fixture::new();
        fixture
            .engine()
            .retrieve(&RetrievalRequest::new("someone good", 5), &ParsedQuery::default(), &ExtractedEntities::default())
            .await
            .unwrap();
        assert!(fixture.keyword.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_channel_is_isolated() {
        let mut fixture = Fixture::new();
        fixture.vector = Arc::new(FailingVector);

        let result = fixture
            .engine()
            .retrieve(&RetrievalRequest::new("Java and AWS", 10), &java_aws(), &ExtractedEntities::default())
            .await
            .unwrap();
        assert!(!result.is_empty());
        assert!(result.ordered_ids.contains(&"E3".to_string()));
    }

    #[tokio::test]
    async fn test_slow_channel_times_out_to_empty() {
        let mut fixture = Fixture::new();
        fixture.vector = Arc::new(SlowVector);

        let result = fixture
            .engine()
            .retrieve(&RetrievalRequest::new("Java and AWS", 10), &java_aws(), &ExtractedEntities::default())
            .await
            .unwrap();
        assert!(!result.is_empty());
    }

    #[tokio::test]
    async fn test_request_deadline_fails_the_call() {
        let mut fixture = Fixture::new();
        fixture.vector = Arc::new(SlowVector);
        fixture.config.retrieval.channel_timeout_ms = 10_000;
        fixture.config.retrieval.request_timeout_ms = 50;

        let err = fixture
            .engine()
            .retrieve(&RetrievalRequest::new("Java", 10), &java_aws(), &ExtractedEntities::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let fixture = Fixture::new();
        let engine = fixture.engine();
        let none = ExtractedEntities::default();

        let err = engine
            .retrieve(&RetrievalRequest::new("  ", 10), &ParsedQuery::default(), &none)
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = engine
            .retrieve(&RetrievalRequest::new("Java", 0), &ParsedQuery::default(), &none)
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_results_truncate_to_max() {
        let fixture = Fixture::new();
        let result = fixture
            .engine()
            .retrieve(&RetrievalRequest::new("Java and AWS", 2), &java_aws(), &alice())
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert_consistent(&result);
    }

    #[tokio::test]
    async fn test_rerank_uses_model_order_and_scores() {
        let mut fixture = Fixture::new();
        fixture.model = Some(Arc::new(CannedModel(
            r#"[{"id": "E5", "score": 0.9, "reason": "AWS"}, {"id": "E3", "score": 0.7, "reason": "Java"}]"#.into(),
        )));

        let request = RetrievalRequest::new("Java and AWS", 3).with_rerank(true);
        let result = fixture
            .engine()
            .retrieve(&request, &java_aws(), &ExtractedEntities::default())
            .await
            .unwrap();

        assert!(result.reranked);
        assert_eq!(&result.ordered_ids[..2], &["E5".to_string(), "E3".to_string()]);
        assert_eq!(result.len(), 3);
        assert_eq!(result.scores["E5"], 0.9);
        assert_consistent(&result);
    }

    #[tokio::test]
    async fn test_rerank_with_foreign_id_keeps_fused_order() {
        let mut fixture = Fixture::new();
        let request = RetrievalRequest::new("Java and AWS", 10);
        let fused = fixture
            .engine()
            .retrieve(&request, &java_aws(), &ExtractedEntities::default())
            .await
            .unwrap();

        fixture.model = Some(Arc::new(CannedModel(r#"[{"id": "E42", "score": 1.0}]"#.into())));
        let reranked = fixture
            .engine()
            .retrieve(&request.clone().with_rerank(true), &java_aws(), &ExtractedEntities::default())
            .await
            .unwrap();

        assert_eq!(reranked.ordered_ids, fused.ordered_ids);
        assert!(!reranked.reranked);
    }

    #[tokio::test]
    async fn test_nothing_found() {
        let mut fixture = Fixture::new();
        fixture.vector = Arc::new(FixedVector(Vec::new()));
        fixture.keyword = Arc::new(FixedKeyword {
            ids: Vec::new(),
            seen: Mutex::new(Vec::new()),
        });

        let result = fixture
            .engine()
            .retrieve(
                &RetrievalRequest::new("Cobol mainframe", 10).with_rerank(true),
                &ParsedQuery::default(),
                &ExtractedEntities::default(),
            )
            .await
            .unwrap();
        assert!(result.is_empty());
        assert!(result.scores.is_empty());
    }
}
