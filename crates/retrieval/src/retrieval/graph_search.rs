//! Graph search over the expert graph
//!
//! Domain questions expressed as Cypher patterns. Every lookup except
//! collaborator search degrades to an empty list when the graph is
//! missing or the query fails: graph results enrich retrieval but are
//! never required for it.

use crate::graph::{params, GraphCatalog, GraphExecutor, GraphParams};
use expertmatch_common::errors::Result;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

const EXPERT_ID: &str = "expertId";
const COLLABORATOR_LIMIT: usize = 50;

/// Expert lookups by technology, domain, customer and collaboration
#[derive(Clone)]
pub struct GraphSearchService {
    graph: Arc<dyn GraphExecutor>,
    catalog: Arc<dyn GraphCatalog>,
    row_limit: usize,
}

impl GraphSearchService {
    pub fn new(graph: Arc<dyn GraphExecutor>, catalog: Arc<dyn GraphCatalog>, row_limit: usize) -> Self {
        Self {
            graph,
            catalog,
            row_limit: row_limit.max(1),
        }
    }

    /// Experts on a project that uses the technology
    pub async fn find_experts_by_technology(&self, technology: &str) -> Vec<String> {
        let query = format!(
            "MATCH (e:Expert)-[:PARTICIPATED_IN]->(p:Project)-[:USES]->(t:Technology) \
             WHERE t.name = $technology \
             RETURN DISTINCT e.id as expertId LIMIT {}",
            self.row_limit
        );
        self.lookup("technology", &query, params([("technology", json!(technology))]))
            .await
    }

    /// Experts connected to every one of the technologies
    pub async fn find_experts_by_technologies(&self, technologies: &[String]) -> Vec<String> {
        let mut names: Vec<&str> = Vec::with_capacity(technologies.len());
        for name in technologies.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        if names.is_empty() {
            return Vec::new();
        }

        let query = format!(
            "MATCH (e:Expert)-[:PARTICIPATED_IN]->(p:Project)-[:USES]->(t:Technology) \
             WHERE t.name IN $technologies \
             WITH e, COUNT(DISTINCT t.name) as techCount \
             WHERE techCount = $techCount \
             RETURN DISTINCT e.id as expertId LIMIT {}",
            self.row_limit
        );
        let p = params([
            ("technologies", json!(names)),
            ("techCount", json!(names.len())),
        ]);
        self.lookup("technologies", &query, p).await
    }

    /// Experts on a project in the domain
    pub async fn find_experts_by_domain(&self, domain: &str) -> Vec<String> {
        let query = format!(
            "MATCH (e:Expert)-[:PARTICIPATED_IN]->(p:Project)-[:IN_DOMAIN]->(d:Domain) \
             WHERE d.name = $domain \
             RETURN DISTINCT e.id as expertId LIMIT {}",
            self.row_limit
        );
        self.lookup("domain", &query, params([("domain", json!(domain))]))
            .await
    }

    /// Experts who shared a project with `expert_id`, excluding itself.
    ///
    /// Unlike the other lookups, query failures are returned to the caller.
    pub async fn find_collaborating_experts(&self, expert_id: &str) -> Result<Vec<String>> {
        if !self.catalog.graph_exists().await {
            debug!("Graph does not exist, skipping collaborator search");
            return Ok(Vec::new());
        }

        let query = format!(
            "MATCH (e1:Expert)-[:PARTICIPATED_IN]->(p:Project)<-[:PARTICIPATED_IN]-(e2:Expert) \
             WHERE e1.id = $expertId AND e1.id <> e2.id \
             RETURN DISTINCT e2.id as expertId LIMIT {}",
            COLLABORATOR_LIMIT
        );
        self.graph
            .execute_and_extract(&query, &params([("expertId", json!(expert_id))]), EXPERT_ID)
            .await
    }

    /// Experts on projects of the given type
    pub async fn find_experts_by_project_type(&self, project_type: &str) -> Vec<String> {
        let query = format!(
            "MATCH (e:Expert)-[:PARTICIPATED_IN]->(p:Project) \
             WHERE p.projectType = $projectType \
             RETURN DISTINCT e.id as expertId LIMIT {}",
            self.row_limit
        );
        self.lookup("project_type", &query, params([("projectType", json!(project_type))]))
            .await
    }

    /// Experts who worked for the customer. The name filter sits after
    /// `WITH`; AGE cannot compare it reliably inside the pattern.
    pub async fn find_experts_by_customer(&self, customer_name: &str) -> Vec<String> {
        let query = format!(
            "MATCH (e:Expert)-[:WORKED_FOR]->(c:Customer) \
             WITH e, c \
             WHERE c.name = $customerName \
             RETURN DISTINCT e.id as expertId LIMIT {}",
            self.row_limit
        );
        self.lookup("customer", &query, params([("customerName", json!(customer_name))]))
            .await
    }

    /// Experts who worked for the customer on a project using the technology
    pub async fn find_experts_by_customer_and_technology(
        &self,
        customer_name: &str,
        technology: &str,
    ) -> Vec<String> {
        let query = format!(
            "MATCH (e:Expert)-[:WORKED_FOR]->(c:Customer) \
             MATCH (e)-[:PARTICIPATED_IN]->(p:Project)-[:USES]->(t:Technology) \
             WITH e, c, t \
             WHERE c.name = $customerName AND t.name = $technology \
             RETURN DISTINCT e.id as expertId LIMIT {}",
            self.row_limit
        );
        let p = params([
            ("customerName", json!(customer_name)),
            ("technology", json!(technology)),
        ]);
        self.lookup("customer_technology", &query, p).await
    }

    async fn lookup(&self, kind: &'static str, query: &str, params: GraphParams) -> Vec<String> {
        if !self.catalog.graph_exists().await {
            debug!(kind, "Graph does not exist, skipping graph search");
            return Vec::new();
        }

        match self.graph.execute_and_extract(query, &params, EXPERT_ID).await {
            Ok(ids) => {
                debug!(kind, count = ids.len(), "graph search");
                ids
            }
            Err(e) => {
                warn!(kind, "Graph search failed, returning no experts");
                debug!(kind, error = %e, "graph search failure details");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphRow;
    use async_trait::async_trait;
    use expertmatch_common::errors::{AppError, QueryPhase};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct Catalog(AtomicBool);

    #[async_trait]
    impl GraphCatalog for Catalog {
        async fn graph_exists(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// In-memory graph: expert -> technologies used on their projects
    struct FakeGraph {
        experts: Vec<(&'static str, Vec<&'static str>)>,
        fail_on: Option<&'static str>,
        seen: Mutex<Vec<(String, GraphParams)>>,
    }

    impl FakeGraph {
        fn new(experts: Vec<(&'static str, Vec<&'static str>)>) -> Self {
            Self {
                experts,
                fail_on: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing_on(mut self, technology: &'static str) -> Self {
            self.fail_on = Some(technology);
            self
        }
    }

    #[async_trait]
    impl GraphExecutor for FakeGraph {
        async fn execute(&self, query: &str, params: &GraphParams) -> Result<Vec<GraphRow>> {
            self.seen.lock().unwrap().push((query.to_string(), params.clone()));

            let rows = |ids: Vec<&str>| {
                ids.into_iter()
                    .map(|id| GraphRow::single(json!({ "expertId": id })))
                    .collect::<Vec<_>>()
            };

            if let Some(tech) = params.get("technology").and_then(|v| v.as_str()) {
                if Some(tech) == self.fail_on {
                    return Err(AppError::GraphQuery {
                        phase: QueryPhase::Executing,
                        query: query.to_string(),
                        message: "agtype comparison not supported".into(),
                    });
                }
                let ids = self
                    .experts
                    .iter()
                    .filter(|(_, techs)| techs.contains(&tech))
                    .map(|(id, _)| *id)
                    .collect();
                return Ok(rows(ids));
            }

            if let Some(list) = params.get("technologies").and_then(|v| v.as_array()) {
                let wanted: Vec<&str> = list.iter().filter_map(|v| v.as_str()).collect();
                let count = params["techCount"].as_u64().unwrap() as usize;
                let ids = self
                    .experts
                    .iter()
                    .filter(|(_, techs)| wanted.iter().filter(|w| techs.contains(*w)).count() == count)
                    .map(|(id, _)| *id)
                    .collect();
                return Ok(rows(ids));
            }

            Ok(Vec::new())
        }
    }

    fn service(graph: Arc<FakeGraph>, exists: bool) -> GraphSearchService {
        GraphSearchService::new(graph, Arc::new(Catalog(AtomicBool::new(exists))), 100)
    }

    fn sample() -> Vec<(&'static str, Vec<&'static str>)> {
        vec![
            ("E1", vec!["Java", "AWS"]),
            ("E2", vec!["Java"]),
            ("E3", vec!["AWS", "Python"]),
            ("E4", vec!["Java", "AWS", "Kubernetes"]),
        ]
    }

    #[tokio::test]
    async fn test_find_by_technology() {
        let svc = service(Arc::new(FakeGraph::new(sample())), true);
        assert_eq!(svc.find_experts_by_technology("Java").await, vec!["E1", "E2", "E4"]);
    }

    #[tokio::test]
    async fn test_multiple_technologies_require_all() {
        let graph = Arc::new(FakeGraph::new(sample()));
        let svc = service(graph.clone(), true);

        let ids = svc
            .find_experts_by_technologies(&["Java".to_string(), "AWS".to_string(), "Java".to_string()])
            .await;
        assert_eq!(ids, vec!["E1", "E4"]);

        let seen = graph.seen.lock().unwrap();
        let (query, p) = &seen[0];
        assert!(query.contains("COUNT(DISTINCT t.name)"));
        assert_eq!(p["techCount"], json!(2));
    }

    #[tokio::test]
    async fn test_empty_technologies_skip_query() {
        let graph = Arc::new(FakeGraph::new(sample()));
        let svc = service(graph.clone(), true);
        assert!(svc.find_experts_by_technologies(&[" ".to_string()]).await.is_empty());
        assert!(graph.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_call() {
        let graph = Arc::new(FakeGraph::new(sample()).failing_on("Java"));
        let svc = service(graph, true);

        assert!(svc.find_experts_by_technology("Java").await.is_empty());
        assert_eq!(svc.find_experts_by_technology("AWS").await, vec!["E1", "E3", "E4"]);
    }

    #[tokio::test]
    async fn test_missing_graph_returns_empty_without_querying() {
        let graph = Arc::new(FakeGraph::new(sample()));
        let svc = service(graph.clone(), false);

        assert!(svc.find_experts_by_technology("Java").await.is_empty());
        assert!(svc.find_experts_by_domain("Banking").await.is_empty());
        assert!(svc.find_collaborating_experts("E1").await.unwrap().is_empty());
        assert!(graph.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_customer_filter_follows_with() {
        let graph = Arc::new(FakeGraph::new(sample()));
        let svc = service(graph.clone(), true);
        svc.find_experts_by_customer("Acme").await;

        let seen = graph.seen.lock().unwrap();
        let (query, p) = &seen[0];
        let with = query.find("WITH e, c").unwrap();
        let filter = query.find("c.name = $customerName").unwrap();
        assert!(with < filter);
        assert_eq!(p["customerName"], json!("Acme"));
    }

    struct BrokenGraph;

    #[async_trait]
    impl GraphExecutor for BrokenGraph {
        async fn execute(&self, query: &str, _params: &GraphParams) -> Result<Vec<GraphRow>> {
            Err(AppError::GraphQuery {
                phase: QueryPhase::Executing,
                query: query.to_string(),
                message: "connection reset".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_collaborators_propagate_errors() {
        let svc = GraphSearchService::new(
            Arc::new(BrokenGraph),
            Arc::new(Catalog(AtomicBool::new(true))),
            100,
        );
        assert!(svc.find_collaborating_experts("E1").await.is_err());
        assert!(svc.find_experts_by_project_type("Migration").await.is_empty());
    }
}
