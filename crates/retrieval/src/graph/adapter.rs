//! Graph Query Adapter
//!
//! Runs Cypher against Apache AGE through plain SQL. Each call goes
//! through: building the query, embedding parameters, inferring the output
//! columns, then executing inside its own transaction with the extension
//! loaded and the search path set. An aborted-transaction signal from the
//! backend becomes an empty result; every other failure is a
//! [`AppError::GraphQuery`] carrying the query text.

use async_trait::async_trait;
use expertmatch_common::config::GraphConfig;
use expertmatch_common::errors::{is_transaction_aborted, AppError, QueryPhase, Result};
use expertmatch_common::metrics;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr, Statement,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use super::cypher::{build_statement, CypherStatement, GraphParams};
use super::row::{parse_agtype, GraphRow};

/// The one opaque primitive: run a translated statement, return rows
#[async_trait]
pub trait GraphBackend: Send + Sync {
    async fn query(&self, statement: &CypherStatement) -> std::result::Result<Vec<GraphRow>, DbErr>;
}

/// Executes parameterized Cypher and returns rows
#[async_trait]
pub trait GraphExecutor: Send + Sync {
    async fn execute(&self, query: &str, params: &GraphParams) -> Result<Vec<GraphRow>>;

    /// Distinct non-null string values of `field`, in first-seen order
    async fn execute_and_extract(
        &self,
        query: &str,
        params: &GraphParams,
        field: &str,
    ) -> Result<Vec<String>> {
        let rows = self.execute(query, params).await?;
        let mut values: Vec<String> = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(value) = row.field_string(field) {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }
        Ok(values)
    }
}

/// PostgreSQL + AGE backend
pub struct PgGraphBackend {
    conn: DatabaseConnection,
    load_extension: bool,
    search_path: String,
}

impl PgGraphBackend {
    pub fn new(conn: DatabaseConnection, config: &GraphConfig) -> Self {
        let mut search_path = "ag_catalog, \"$user\", public".to_string();
        if !config.schema.is_empty() {
            search_path.push_str(", ");
            search_path.push_str(&config.schema);
        }
        Self {
            conn,
            load_extension: config.load_extension,
            search_path,
        }
    }

    async fn run(
        &self,
        txn: &DatabaseTransaction,
        statement: &CypherStatement,
    ) -> std::result::Result<Vec<GraphRow>, DbErr> {
        if self.load_extension {
            // Nested transaction = savepoint; a failed LOAD must not abort the outer one
            let load = txn.begin().await?;
            match load.execute_unprepared("LOAD 'age'").await {
                Ok(_) => {
                    load.commit().await?;
                    trace!("AGE extension loaded");
                }
                Err(e) => {
                    load.rollback().await?;
                    debug!(error = %e, "Could not LOAD 'age' (may already be preloaded)");
                }
            }
        }

        txn.execute_unprepared(&format!("SET LOCAL search_path = {}", self.search_path))
            .await?;

        let rows = txn
            .query_all(Statement::from_string(DbBackend::Postgres, statement.sql.clone()))
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut graph_row = GraphRow::new();
            for column in &statement.columns {
                let raw: Option<String> = row.try_get("", column)?;
                let value = raw
                    .as_deref()
                    .map(parse_agtype)
                    .unwrap_or(serde_json::Value::Null);
                graph_row.insert(column.clone(), value);
            }
            out.push(graph_row);
        }
        Ok(out)
    }
}

#[async_trait]
impl GraphBackend for PgGraphBackend {
    async fn query(&self, statement: &CypherStatement) -> std::result::Result<Vec<GraphRow>, DbErr> {
        let txn = self.conn.begin().await?;
        match self.run(&txn, statement).await {
            Ok(rows) => {
                txn.commit().await?;
                Ok(rows)
            }
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    debug!(error = %rollback, "rollback after failed graph query");
                }
                Err(e)
            }
        }
    }
}

/// Cypher front-end over a [`GraphBackend`]
#[derive(Clone)]
pub struct GraphQueryAdapter {
    backend: Arc<dyn GraphBackend>,
    graph_name: String,
}

impl GraphQueryAdapter {
    pub fn new(backend: Arc<dyn GraphBackend>, graph_name: impl Into<String>) -> Self {
        Self {
            backend,
            graph_name: graph_name.into(),
        }
    }

    /// Adapter over a live connection
    pub fn postgres(conn: DatabaseConnection, config: &GraphConfig) -> Self {
        Self::new(Arc::new(PgGraphBackend::new(conn, config)), config.name.clone())
    }

    pub fn graph_name(&self) -> &str {
        &self.graph_name
    }
}

#[async_trait]
impl GraphExecutor for GraphQueryAdapter {
    async fn execute(&self, query: &str, params: &GraphParams) -> Result<Vec<GraphRow>> {
        let statement = build_statement(&self.graph_name, query, params)?;
        trace!(columns = statement.columns.len(), cypher = %statement.cypher, "executing graph query");

        match self.backend.query(&statement).await {
            Ok(rows) => {
                debug!(count = rows.len(), "graph query succeeded");
                Ok(rows)
            }
            Err(err) if is_transaction_aborted(&err) => {
                warn!(query = %query, "Graph query hit an aborted transaction, returning empty result");
                debug!(error = %err, "aborted transaction details");
                metrics::record_graph_transient_abort();
                Ok(Vec::new())
            }
            Err(err) => {
                error!(query = %query, error = %err, "Failed to execute Cypher query");
                Err(AppError::GraphQuery {
                    phase: QueryPhase::Executing,
                    query: query.to_string(),
                    message: err.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Backend that records statements and replays canned outcomes
    pub(crate) struct ScriptedBackend {
        pub seen: Mutex<Vec<CypherStatement>>,
        outcome: Box<dyn Fn(&CypherStatement) -> std::result::Result<Vec<GraphRow>, DbErr> + Send + Sync>,
    }

    impl ScriptedBackend {
        pub(crate) fn new(
            outcome: impl Fn(&CypherStatement) -> std::result::Result<Vec<GraphRow>, DbErr> + Send + Sync + 'static,
        ) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                outcome: Box::new(outcome),
            }
        }
    }

    #[async_trait]
    impl GraphBackend for ScriptedBackend {
        async fn query(&self, statement: &CypherStatement) -> std::result::Result<Vec<GraphRow>, DbErr> {
            self.seen.lock().unwrap().push(statement.clone());
            (self.outcome)(statement)
        }
    }

    fn adapter(backend: Arc<ScriptedBackend>) -> GraphQueryAdapter {
        GraphQueryAdapter::new(backend, "expertmatch_graph")
    }

    #[tokio::test]
    async fn test_execute_embeds_and_returns_rows() {
        let backend = Arc::new(ScriptedBackend::new(|_| {
            Ok(vec![GraphRow::single(json!("E1")), GraphRow::single(json!("E2"))])
        }));
        let graph = adapter(backend.clone());

        let p = crate::graph::params([("technology", json!("Java"))]);
        let rows = graph
            .execute("MATCH (t:Technology) WHERE t.name = $technology RETURN t.name", &p)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let seen = backend.seen.lock().unwrap();
        assert!(seen[0].cypher.contains("t.name = 'Java'"));
        assert_eq!(seen[0].columns, vec!["result"]);
    }

    #[tokio::test]
    async fn test_transaction_aborted_becomes_empty() {
        let backend = Arc::new(ScriptedBackend::new(|_| {
            Err(DbErr::Custom(
                "error returned from database: current transaction is aborted, commands ignored until end of transaction block".into(),
            ))
        }));
        let rows = adapter(backend)
            .execute("MATCH (e:Expert) RETURN e.id", &GraphParams::new())
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_other_failure_carries_query() {
        let backend = Arc::new(ScriptedBackend::new(|_| {
            Err(DbErr::Custom("syntax error at or near \"RETRUN\"".into()))
        }));
        let err = adapter(backend)
            .execute("MATCH (e:Expert) RETRUN e.id", &GraphParams::new())
            .await
            .unwrap_err();
        match err {
            AppError::GraphQuery { phase, query, .. } => {
                assert_eq!(phase, QueryPhase::Executing);
                assert_eq!(query, "MATCH (e:Expert) RETRUN e.id");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_parameter_never_reaches_backend() {
        let backend = Arc::new(ScriptedBackend::new(|_| Ok(Vec::new())));
        let err = adapter(backend.clone())
            .execute("MATCH (d:Domain) WHERE d.name = $domain RETURN d", &GraphParams::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::GraphParameter { .. }));
        assert!(backend.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extract_is_distinct_and_skips_nulls() {
        let backend = Arc::new(ScriptedBackend::new(|_| {
            Ok(vec![
                GraphRow::single(json!("E1")),
                GraphRow::single(serde_json::Value::Null),
                GraphRow::single(json!("E2")),
                GraphRow::single(json!("E1")),
            ])
        }));
        let ids = adapter(backend)
            .execute_and_extract("MATCH (e:Expert) RETURN e.id as expertId", &GraphParams::new(), "expertId")
            .await
            .unwrap();
        assert_eq!(ids, vec!["E1", "E2"]);
    }
}
