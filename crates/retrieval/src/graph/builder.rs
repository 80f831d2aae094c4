//! Graph construction from relational work history
//!
//! A build reads one [`GraphSnapshot`] from a [`GraphSource`], creates all
//! vertices, then creates edges in `UNWIND` batches. State that only lives
//! for one build (project name to id resolution, counters) is held in a
//! [`BuildContext`] owned by that `build()` call.

use async_trait::async_trait;
use expertmatch_common::config::is_sql_identifier;
use expertmatch_common::errors::{AppError, Result};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, QueryResult, Statement};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::adapter::GraphExecutor;
use super::admin::{GraphAdmin, GraphCatalog};
use super::cypher::{params, GraphParams};

/// Edges per `UNWIND` statement
pub const EDGE_BATCH_SIZE: usize = 1000;

const DEFAULT_ROLE: &str = "Developer";

#[derive(Debug, Clone, PartialEq)]
pub struct ExpertRecord {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub seniority: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectRecord {
    pub id: Option<String>,
    pub name: String,
    pub project_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomerRecord {
    pub id: String,
    pub name: Option<String>,
}

/// A project reference that may lack an id and must be resolved by name
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectRef {
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Participation {
    pub expert_id: String,
    pub project: ProjectRef,
    pub role: Option<String>,
}

/// Everything needed to build the graph
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSnapshot {
    pub experts: Vec<ExpertRecord>,
    pub projects: Vec<ProjectRecord>,
    pub technologies: Vec<String>,
    pub domains: Vec<String>,
    pub customers: Vec<CustomerRecord>,
    pub participations: Vec<Participation>,
    /// (expert id, customer id)
    pub expert_customers: Vec<(String, String)>,
    /// (project, technology name)
    pub project_technologies: Vec<(ProjectRef, String)>,
    /// (project, domain name)
    pub project_domains: Vec<(ProjectRef, String)>,
    /// (project, customer id)
    pub project_customers: Vec<(ProjectRef, String)>,
}

/// Relational data the graph is derived from
#[async_trait]
pub trait GraphSource: Send + Sync {
    async fn load(&self) -> Result<GraphSnapshot>;
}

/// Per-build state
#[derive(Debug, Default)]
pub struct BuildContext {
    project_ids: HashMap<String, String>,
    generated: usize,
    pub summary: BuildSummary,
}

impl BuildContext {
    /// Register a project and return the id its vertex gets
    fn register_project(&mut self, project: &ProjectRecord) -> String {
        if let Some(existing) = self.project_ids.get(&project.name) {
            return existing.clone();
        }
        let id = match project.id.as_deref().filter(|id| !id.trim().is_empty()) {
            Some(id) => id.to_string(),
            None => {
                self.generated += 1;
                format!("generated-project-{}", self.generated)
            }
        };
        self.project_ids.insert(project.name.clone(), id.clone());
        id
    }

    /// Resolve a reference to a vertex id, preferring the name registered in this build
    fn resolve(&self, project: &ProjectRef) -> Option<String> {
        self.project_ids
            .get(&project.name)
            .cloned()
            .or_else(|| project.id.clone().filter(|id| !id.trim().is_empty()))
    }
}

/// Counts reported after a build
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildSummary {
    pub experts: usize,
    pub projects: usize,
    pub technologies: usize,
    pub domains: usize,
    pub customers: usize,
    pub participations: usize,
    pub expert_customers: usize,
    pub project_technologies: usize,
    pub project_domains: usize,
    pub project_customers: usize,
    pub skipped_edges: usize,
    pub duration_ms: u64,
}

/// Builds the expert graph
pub struct GraphBuilder {
    graph: Arc<dyn GraphExecutor>,
    catalog: Arc<dyn GraphCatalog>,
    admin: Option<GraphAdmin>,
    source: Arc<dyn GraphSource>,
}

impl GraphBuilder {
    pub fn new(
        graph: Arc<dyn GraphExecutor>,
        catalog: Arc<dyn GraphCatalog>,
        source: Arc<dyn GraphSource>,
    ) -> Self {
        Self {
            graph,
            catalog,
            admin: None,
            source,
        }
    }

    /// Enable graph creation and index maintenance
    pub fn with_admin(mut self, admin: GraphAdmin) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Remove every vertex and edge. Falls back to deleting edges then vertices.
    pub async fn clear(&self) -> Result<()> {
        if !self.catalog.graph_exists().await {
            debug!("Graph does not exist, nothing to clear");
            return Ok(());
        }

        info!("Clearing graph data...");
        if let Err(e) = self.graph.execute("MATCH (n) DETACH DELETE n", &GraphParams::new()).await {
            warn!(error = %e, "Single-query clear failed, trying edges then nodes");
            self.graph
                .execute("MATCH ()-[r]->() DELETE r", &GraphParams::new())
                .await?;
            self.graph.execute("MATCH (n) DELETE n", &GraphParams::new()).await?;
        }
        info!("Graph cleared");
        Ok(())
    }

    /// Rebuild the graph from the source
    pub async fn build(&self) -> Result<BuildSummary> {
        let start = Instant::now();
        info!("Starting graph build");

        if self.catalog.graph_exists().await {
            self.clear().await?;
        } else {
            match &self.admin {
                Some(admin) => admin.create_graph().await?,
                None => {
                    return Err(AppError::Configuration {
                        message: "graph does not exist and no admin connection was supplied".to_string(),
                    })
                }
            }
        }

        let snapshot = self.source.load().await?;
        let mut ctx = BuildContext::default();

        self.create_vertices(&snapshot, &mut ctx).await?;

        if let Some(admin) = &self.admin {
            admin.create_property_indexes().await;
        }

        self.create_edges(&snapshot, &mut ctx).await?;

        ctx.summary.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            experts = ctx.summary.experts,
            projects = ctx.summary.projects,
            skipped_edges = ctx.summary.skipped_edges,
            duration_ms = ctx.summary.duration_ms,
            "Graph build completed"
        );
        Ok(ctx.summary)
    }

    async fn create_vertices(&self, snapshot: &GraphSnapshot, ctx: &mut BuildContext) -> Result<()> {
        for expert in &snapshot.experts {
            self.graph
                .execute(
                    "CREATE (e:Expert {id: $expertId, name: $name, email: $email, seniority: $seniority})",
                    &params([
                        ("expertId", json!(expert.id)),
                        ("name", json!(expert.name)),
                        ("email", json!(expert.email)),
                        ("seniority", json!(expert.seniority)),
                    ]),
                )
                .await?;
        }
        ctx.summary.experts = snapshot.experts.len();
        debug!(count = ctx.summary.experts, "expert vertices created");

        for project in &snapshot.projects {
            if ctx.project_ids.contains_key(&project.name) {
                continue;
            }
            let id = ctx.register_project(project);
            self.graph
                .execute(
                    "CREATE (p:Project {id: $projectId, name: $projectName, projectType: $projectType})",
                    &params([
                        ("projectId", json!(id)),
                        ("projectName", json!(project.name)),
                        ("projectType", json!(project.project_type)),
                    ]),
                )
                .await?;
            ctx.summary.projects += 1;
        }
        debug!(count = ctx.summary.projects, "project vertices created");

        for technology in &snapshot.technologies {
            self.graph
                .execute(
                    "MERGE (t:Technology {name: $technologyName})",
                    &params([("technologyName", json!(technology))]),
                )
                .await?;
        }
        ctx.summary.technologies = snapshot.technologies.len();

        for domain in &snapshot.domains {
            self.graph
                .execute(
                    "MERGE (d:Domain {name: $domainName})",
                    &params([("domainName", json!(domain))]),
                )
                .await?;
        }
        ctx.summary.domains = snapshot.domains.len();

        for customer in &snapshot.customers {
            self.graph
                .execute(
                    "MERGE (c:Customer {id: $customerId}) SET c.name = $customerName",
                    &params([
                        ("customerId", json!(customer.id)),
                        ("customerName", json!(customer.name)),
                    ]),
                )
                .await?;
        }
        ctx.summary.customers = snapshot.customers.len();

        Ok(())
    }

    async fn create_edges(&self, snapshot: &GraphSnapshot, ctx: &mut BuildContext) -> Result<()> {
        let mut skipped = 0;

        let participations: Vec<Value> = snapshot
            .participations
            .iter()
            .filter_map(|p| match ctx.resolve(&p.project) {
                Some(project_id) => Some(json!({
                    "expertId": p.expert_id,
                    "projectId": project_id,
                    "role": p.role.as_deref().unwrap_or(DEFAULT_ROLE),
                })),
                None => {
                    skipped += 1;
                    None
                }
            })
            .collect();
        ctx.summary.participations = self
            .unwind(
                "UNWIND $rows AS rel \
                 MATCH (e:Expert {id: rel.expertId}) \
                 MATCH (p:Project {id: rel.projectId}) \
                 MERGE (e)-[r:PARTICIPATED_IN]->(p) \
                 SET r.role = rel.role",
                participations,
            )
            .await?;

        let expert_customers: Vec<Value> = snapshot
            .expert_customers
            .iter()
            .map(|(expert_id, customer_id)| json!({"expertId": expert_id, "customerId": customer_id}))
            .collect();
        ctx.summary.expert_customers = self
            .unwind(
                "UNWIND $rows AS rel \
                 MATCH (e:Expert {id: rel.expertId}) \
                 MATCH (c:Customer {id: rel.customerId}) \
                 MERGE (e)-[:WORKED_FOR]->(c)",
                expert_customers,
            )
            .await?;

        let uses = resolve_pairs(ctx, &snapshot.project_technologies, "technologyName", &mut skipped);
        ctx.summary.project_technologies = self
            .unwind(
                "UNWIND $rows AS rel \
                 MATCH (p:Project {id: rel.projectId}) \
                 MERGE (t:Technology {name: rel.technologyName}) \
                 MERGE (p)-[:USES]->(t)",
                uses,
            )
            .await?;

        let in_domain = resolve_pairs(ctx, &snapshot.project_domains, "domainName", &mut skipped);
        ctx.summary.project_domains = self
            .unwind(
                "UNWIND $rows AS rel \
                 MATCH (p:Project {id: rel.projectId}) \
                 MERGE (d:Domain {name: rel.domainName}) \
                 MERGE (p)-[:IN_DOMAIN]->(d)",
                in_domain,
            )
            .await?;

        let for_customer = resolve_pairs(ctx, &snapshot.project_customers, "customerId", &mut skipped);
        ctx.summary.project_customers = self
            .unwind(
                "UNWIND $rows AS rel \
                 MATCH (p:Project {id: rel.projectId}) \
                 MATCH (c:Customer {id: rel.customerId}) \
                 MERGE (p)-[:FOR_CUSTOMER]->(c)",
                for_customer,
            )
            .await?;

        if skipped > 0 {
            warn!(skipped, "edges skipped because their project could not be resolved");
        }
        ctx.summary.skipped_edges = skipped;
        Ok(())
    }

    /// Run `query` once per batch with the batch bound to `$rows`
    async fn unwind(&self, query: &str, rows: Vec<Value>) -> Result<usize> {
        let total = rows.len();
        let mut processed = 0;
        for batch in rows.chunks(EDGE_BATCH_SIZE) {
            self.graph
                .execute(query, &params([("rows", Value::Array(batch.to_vec()))]))
                .await?;
            processed += batch.len();
            debug!(processed, total, "edge batch written");
        }
        Ok(total)
    }
}

fn resolve_pairs(
    ctx: &BuildContext,
    pairs: &[(ProjectRef, String)],
    key: &str,
    skipped: &mut usize,
) -> Vec<Value> {
    pairs
        .iter()
        .filter_map(|(project, value)| match ctx.resolve(project) {
            Some(project_id) => {
                let mut row = serde_json::Map::new();
                row.insert("projectId".to_string(), json!(project_id));
                row.insert(key.to_string(), json!(value));
                Some(Value::Object(row))
            }
            None => {
                *skipped += 1;
                None
            }
        })
        .collect()
}

/// Reads the snapshot from the `employee` and `work_experience` tables
pub struct PgGraphSource {
    conn: DatabaseConnection,
    schema: String,
}

impl PgGraphSource {
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

    async fn rows(&self, sql: String) -> Result<Vec<QueryResult>> {
        self.conn
            .query_all(Statement::from_string(DbBackend::Postgres, sql))
            .await
            .map_err(AppError::Database)
    }
}

fn text(row: &QueryResult, column: &str) -> Option<String> {
    row.try_get::<Option<String>>("", column)
        .ok()
        .flatten()
        .filter(|s| !s.trim().is_empty())
}

fn project_ref(row: &QueryResult) -> Option<ProjectRef> {
    Some(ProjectRef {
        id: text(row, "project_id"),
        name: text(row, "project_name")?,
    })
}

#[async_trait]
impl GraphSource for PgGraphSource {
    async fn load(&self) -> Result<GraphSnapshot> {
        let s = &self.schema;
        let mut snapshot = GraphSnapshot::default();

        for row in self.rows(format!("SELECT id, name, email, seniority FROM {s}.employee")).await? {
            if let (Some(id), Some(name)) = (text(&row, "id"), text(&row, "name")) {
                snapshot.experts.push(ExpertRecord {
                    id,
                    name,
                    email: text(&row, "email"),
                    seniority: text(&row, "seniority"),
                });
            }
        }

        for row in self
            .rows(format!(
                "SELECT DISTINCT ON (project_name) project_id, project_name, project_type \
                 FROM {s}.work_experience WHERE project_name IS NOT NULL \
                 ORDER BY project_name, project_id NULLS LAST"
            ))
            .await?
        {
            if let Some(project) = project_ref(&row) {
                snapshot.projects.push(ProjectRecord {
                    id: project.id,
                    name: project.name,
                    project_type: text(&row, "project_type"),
                });
            }
        }

        for row in self
            .rows(format!(
                "SELECT DISTINCT unnest(technologies) AS name FROM {s}.work_experience ORDER BY name"
            ))
            .await?
        {
            snapshot.technologies.extend(text(&row, "name"));
        }

        for row in self
            .rows(format!(
                "SELECT DISTINCT industry AS name FROM {s}.work_experience \
                 WHERE industry IS NOT NULL ORDER BY name"
            ))
            .await?
        {
            snapshot.domains.extend(text(&row, "name"));
        }

        for row in self
            .rows(format!(
                "SELECT DISTINCT ON (customer_id) customer_id, customer_name FROM {s}.work_experience \
                 WHERE customer_id IS NOT NULL ORDER BY customer_id"
            ))
            .await?
        {
            if let Some(id) = text(&row, "customer_id") {
                snapshot.customers.push(CustomerRecord {
                    id,
                    name: text(&row, "customer_name"),
                });
            }
        }

        for row in self
            .rows(format!(
                "SELECT DISTINCT employee_id, project_id, project_name, role FROM {s}.work_experience \
                 WHERE project_name IS NOT NULL"
            ))
            .await?
        {
            if let (Some(expert_id), Some(project)) = (text(&row, "employee_id"), project_ref(&row)) {
                snapshot.participations.push(Participation {
                    expert_id,
                    project,
                    role: text(&row, "role"),
                });
            }
        }

        for row in self
            .rows(format!(
                "SELECT DISTINCT employee_id, customer_id FROM {s}.work_experience \
                 WHERE customer_id IS NOT NULL"
            ))
            .await?
        {
            if let (Some(expert), Some(customer)) = (text(&row, "employee_id"), text(&row, "customer_id")) {
                snapshot.expert_customers.push((expert, customer));
            }
        }

        for (column, target) in [
            ("unnest(technologies)", &mut snapshot.project_technologies),
            ("industry", &mut snapshot.project_domains),
            ("customer_id", &mut snapshot.project_customers),
        ] {
            let sql = format!(
                "SELECT DISTINCT project_id, project_name, {column} AS value FROM {s}.work_experience \
                 WHERE project_name IS NOT NULL"
            );
            for row in self.rows(sql).await? {
                if let (Some(project), Some(value)) = (project_ref(&row), text(&row, "value")) {
                    target.push((project, value));
                }
            }
        }

        Ok(snapshot)
    }
}
