//! Vector similarity search using pgvector
//!
//! Embeds the query text and ranks work-experience records by cosine
//! similarity.

use super::{VectorHit, VectorSearch};
use expertmatch_common::config::is_sql_identifier;
use expertmatch_common::embeddings::Embedder;
use expertmatch_common::errors::{is_transaction_aborted, AppError, Result};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, QueryResult, Statement};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Vector search over `work_experience.embedding`
pub struct PgVectorSearch {
    conn: DatabaseConnection,
    embedder: Arc<dyn Embedder>,
    schema: String,
}

impl PgVectorSearch {
    pub fn new(conn: DatabaseConnection, embedder: Arc<dyn Embedder>, schema: &str) -> Result<Self> {
        if !is_sql_identifier(schema) {
            return Err(AppError::Configuration {
                message: format!("schema '{}' is not a plain identifier", schema),
            });
        }
        Ok(Self {
            conn,
            embedder,
            schema: schema.to_string(),
        })
    }
}

/// Cosine ranking over one schema's work history; `$1` floor, `$2` limit
fn vector_query(schema: &str, embedding: &[f32]) -> String {
    let vector = vector_literal(embedding);
    format!(
        r#"
        SELECT
            we.id::text AS document_id,
            we.employee_id::text AS employee_id,
            we.project_name,
            we.role,
            1 - (we.embedding <=> '{vector}'::vector) AS similarity
        FROM {schema}.work_experience we
        WHERE we.embedding IS NOT NULL
          AND 1 - (we.embedding <=> '{vector}'::vector) >= $1
        ORDER BY we.embedding <=> '{vector}'::vector
        LIMIT $2
        "#,
    )
}

/// pgvector text form: `[0.1,0.2,0.3]`
fn vector_literal(embedding: &[f32]) -> String {
    format!(
        "[{}]",
        embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

fn hit_from_row(row: &QueryResult) -> Option<VectorHit> {
    let id: String = row.try_get("", "document_id").ok()?;
    let similarity: f64 = row.try_get("", "similarity").ok()?;

    let mut metadata = BTreeMap::new();
    if let Ok(Some(employee_id)) = row.try_get::<Option<String>>("", "employee_id") {
        metadata.insert("employeeId".to_string(), json!(employee_id));
    }
    if let Ok(Some(project)) = row.try_get::<Option<String>>("", "project_name") {
        metadata.insert("projectName".to_string(), json!(project));
    }
    if let Ok(Some(role)) = row.try_get::<Option<String>>("", "role") {
        metadata.insert("role".to_string(), json!(role));
    }

    Some(VectorHit {
        id,
        similarity,
        metadata,
    })
}

#[async_trait::async_trait]
impl VectorSearch for PgVectorSearch {
    async fn search_by_text(&self, text: &str, limit: usize, min_similarity: f64) -> Result<Vec<VectorHit>> {
        if text.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(text).await?;
        let sql = vector_query(&self.schema, &embedding);

        let rows = match self
            .conn
            .query_all(Statement::from_sql_and_values(
                DbBackend::Postgres,
                &sql,
                vec![min_similarity.into(), (limit as i64).into()],
            ))
            .await
        {
            Ok(rows) => rows,
            Err(e) if is_transaction_aborted(&e) => {
                warn!("Vector search hit an aborted transaction, returning no hits");
                return Ok(Vec::new());
            }
            Err(e) => return Err(AppError::Database(e)),
        };

        let hits: Vec<VectorHit> = rows
            .iter()
            .filter_map(hit_from_row)
            .filter(|hit| hit.similarity >= min_similarity)
            .collect();

        debug!(count = hits.len(), min_similarity, "vector search");
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_format() {
        assert_eq!(vector_literal(&[0.1, 0.2, 0.3]), "[0.1,0.2,0.3]");
        assert_eq!(vector_literal(&[]), "[]");
    }

    #[test]
    fn test_query_orders_by_distance() {
        let sql = vector_query("expertmatch", &[0.5, 0.25]);

        assert!(sql.contains("FROM expertmatch.work_experience we"));
        assert!(sql.contains("ORDER BY we.embedding <=> '[0.5,0.25]'::vector"));
        assert!(sql.contains(">= $1"));
    }
}
