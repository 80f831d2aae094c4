//! Keyword search using PostgreSQL full-text search
//!
//! Each term becomes its own `plainto_tsquery` and the queries are OR-ed,
//! so a multi-word term ("Spring Boot") must match as a whole while
//! distinct terms widen the result. Experts rank by their best-matching
//! work-experience record.

use super::KeywordSearch;
use expertmatch_common::config::is_sql_identifier;
use expertmatch_common::errors::{is_transaction_aborted, AppError, Result};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement};
use tracing::{debug, warn};

/// Text searched per work-experience record
const DOCUMENT: &str = "to_tsvector('english', \
    coalesce(we.project_name, '') || ' ' || \
    coalesce(we.project_summary, '') || ' ' || \
    coalesce(we.role, '') || ' ' || \
    coalesce(array_to_string(we.technologies, ' '), ''))";

/// Full-text search over `work_experience`
pub struct PgKeywordSearch {
    conn: DatabaseConnection,
    schema: String,
}

impl PgKeywordSearch {
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

/// Trimmed, non-empty, case-insensitively distinct terms
fn prepare_terms(terms: &[String]) -> Vec<String> {
    let mut prepared: Vec<String> = Vec::new();
    for term in terms.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        if !prepared.iter().any(|p| p.eq_ignore_ascii_case(term)) {
            prepared.push(term.to_string());
        }
    }
    prepared
}

/// SQL for `term_count` terms bound as `$1..$n`, limit bound last
fn keyword_query(schema: &str, term_count: usize) -> String {
    let tsquery = (1..=term_count)
        .map(|i| format!("plainto_tsquery('english', ${i})"))
        .collect::<Vec<_>>()
        .join(" || ");
    let limit = term_count + 1;

    format!(
        r#"
        SELECT we.employee_id::text AS employee_id,
               MAX(ts_rank({DOCUMENT}, q.query)) AS rank
        FROM {schema}.work_experience we,
             (SELECT {tsquery} AS query) q
        WHERE {DOCUMENT} @@ q.query
        GROUP BY we.employee_id
        ORDER BY rank DESC, employee_id
        LIMIT ${limit}
        "#
    )
}

#[async_trait::async_trait]
impl KeywordSearch for PgKeywordSearch {
    async fn search_by_keywords(&self, terms: &[String], limit: usize) -> Result<Vec<String>> {
        let terms = prepare_terms(terms);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let sql = keyword_query(&self.schema, terms.len());
        let mut values: Vec<sea_orm::Value> = terms.iter().map(|t| t.clone().into()).collect();
        values.push((limit as i64).into());

        let rows = match self
            .conn
            .query_all(Statement::from_sql_and_values(DbBackend::Postgres, &sql, values))
            .await
        {
            Ok(rows) => rows,
            Err(e) if is_transaction_aborted(&e) => {
                warn!("Keyword search hit an aborted transaction, returning no experts");
                return Ok(Vec::new());
            }
            Err(e) => return Err(AppError::Database(e)),
        };

        let ids: Vec<String> = rows
            .iter()
            .filter_map(|row| row.try_get::<String>("", "employee_id").ok())
            .collect();

        debug!(terms = terms.len(), count = ids.len(), "keyword search");
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_terms() {
        let terms = vec![
            " Java ".to_string(),
            "java".to_string(),
            "".to_string(),
            "Spring Boot".to_string(),
        ];
        assert_eq!(prepare_terms(&terms), vec!["Java", "Spring Boot"]);
    }

    #[test]
    fn test_query_binds_each_term() {
        let sql = keyword_query("expertmatch", 3);
        assert!(sql.contains(
            "plainto_tsquery('english', $1) || plainto_tsquery('english', $2) || plainto_tsquery('english', $3)"
        ));
        assert!(sql.contains("LIMIT $4"));
        assert!(sql.contains("FROM expertmatch.work_experience we"));
        assert!(sql.contains("ts_rank("));
    }
}
