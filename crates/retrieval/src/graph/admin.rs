//! Graph administration and statistics

use async_trait::async_trait;
use expertmatch_common::errors::{AppError, Result};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::adapter::GraphExecutor;
use super::cypher::GraphParams;

/// Vertex labels maintained by the graph builder
pub const VERTEX_LABELS: [&str; 5] = ["Expert", "Project", "Technology", "Domain", "Customer"];

/// Edge types maintained by the graph builder
pub const EDGE_TYPES: [&str; 5] = ["PARTICIPATED_IN", "WORKED_FOR", "USES", "IN_DOMAIN", "FOR_CUSTOMER"];

/// Whether the named graph is present in the store
#[async_trait]
pub trait GraphCatalog: Send + Sync {
    async fn graph_exists(&self) -> bool;
}

/// Catalogue and DDL operations against `ag_catalog`
#[derive(Clone)]
pub struct GraphAdmin {
    conn: DatabaseConnection,
    graph_name: String,
}

impl GraphAdmin {
    pub fn new(conn: DatabaseConnection, graph_name: impl Into<String>) -> Self {
        Self {
            conn,
            graph_name: graph_name.into(),
        }
    }

    /// Create the graph; an existing graph is success
    pub async fn create_graph(&self) -> Result<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT * FROM ag_catalog.create_graph($1::name)",
            vec![self.graph_name.clone().into()],
        );

        match self.conn.execute(stmt).await {
            Ok(_) => {
                info!(graph = %self.graph_name, "Graph created");
                Ok(())
            }
            Err(e) if e.to_string().contains("already exists") => {
                debug!(graph = %self.graph_name, "Graph already exists");
                Ok(())
            }
            Err(e) => {
                warn!(graph = %self.graph_name, error = %e, "Failed to create graph");
                Err(AppError::Database(e))
            }
        }
    }

    /// Whether a vertex label table exists in this graph
    pub async fn vertex_label_exists(&self, label: &str) -> bool {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            SELECT EXISTS (
                SELECT 1 FROM ag_catalog.ag_label l
                JOIN ag_catalog.ag_graph g ON l.graph = g.graphid
                WHERE g.name = $1 AND l.name = $2 AND l.kind = 'v'
            ) AS present
            "#,
            vec![self.graph_name.clone().into(), label.into()],
        );

        match self.conn.query_one(stmt).await {
            Ok(Some(row)) => row.try_get::<bool>("", "present").unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                debug!(label, error = %e, "Failed to check vertex label");
                false
            }
        }
    }

    /// GIN indexes on vertex properties. Skipped before the first build;
    /// individual index failures are logged and ignored.
    pub async fn create_property_indexes(&self) {
        if !self.vertex_label_exists("Expert").await {
            debug!("Graph tables do not exist yet, skipping index creation");
            return;
        }

        for label in ["Expert", "Project", "Technology", "Customer"] {
            let index = format!("idx_{}_{}_props", self.graph_name, label.to_ascii_lowercase());
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS {index} ON \"{graph}\".\"{label}\" USING gin (properties)",
                graph = self.graph_name,
            );
            if let Err(e) = self.conn.execute_unprepared(&sql).await {
                debug!(index = %index, error = %e, "Could not create index");
            }
        }
        debug!("Graph indexes created");
    }
}

#[async_trait]
impl GraphCatalog for GraphAdmin {
    async fn graph_exists(&self) -> bool {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT COUNT(*) AS graphs FROM ag_catalog.ag_graph WHERE name = $1",
            vec![self.graph_name.clone().into()],
        );

        match self.conn.query_one(stmt).await {
            Ok(Some(row)) => row.try_get::<i64>("", "graphs").map(|n| n > 0).unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                debug!(error = %e, "Graph check failed (AGE may not be available)");
                false
            }
        }
    }
}

/// Vertex and edge counts
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphStatistics {
    pub vertices: BTreeMap<String, i64>,
    pub edges: BTreeMap<String, i64>,
}

impl GraphStatistics {
    pub fn total_vertices(&self) -> i64 {
        self.vertices.values().sum()
    }

    pub fn total_edges(&self) -> i64 {
        self.edges.values().sum()
    }
}

/// Count vertices per label and edges per type; failed counts read as zero
pub async fn graph_statistics(graph: &dyn GraphExecutor) -> GraphStatistics {
    let mut stats = GraphStatistics::default();

    for label in VERTEX_LABELS {
        let query = format!("MATCH (n:{label}) RETURN count(n)");
        stats.vertices.insert(label.to_string(), count_of(graph, &query).await);
    }
    for edge in EDGE_TYPES {
        let query = format!("MATCH ()-[r:{edge}]->() RETURN count(r)");
        stats.edges.insert(edge.to_string(), count_of(graph, &query).await);
    }

    stats
}

async fn count_of(graph: &dyn GraphExecutor, query: &str) -> i64 {
    match graph.execute(query, &GraphParams::new()).await {
        Ok(rows) => rows
            .first()
            .and_then(|row| row.field_i64(super::cypher::SINGLE_COLUMN))
            .unwrap_or(0),
        Err(e) => {
            debug!(query, error = %e, "count query failed");
            0
        }
    }
}
