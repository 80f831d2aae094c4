//! Cypher to SQL translation for Apache AGE
//!
//! AGE only accepts a Cypher query as one opaque string argument to
//! `ag_catalog.cypher(...)`, so parameters are embedded as literals and the
//! output column list is inferred from the `RETURN` clause.

use expertmatch_common::errors::{AppError, QueryPhase, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// Named parameters for `$name` placeholders
pub type GraphParams = BTreeMap<String, Value>;

/// Build a parameter map from `(name, value)` pairs
pub fn params<I, K>(pairs: I) -> GraphParams
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Single output column name used when `RETURN` has one item
pub const SINGLE_COLUMN: &str = "result";

const DOLLAR_TAG: &str = "cypher_q";

/// A fully translated query ready to run against PostgreSQL
#[derive(Debug, Clone, PartialEq)]
pub struct CypherStatement {
    /// Cypher text with parameters embedded
    pub cypher: String,
    /// Output column names, in order
    pub columns: Vec<String>,
    /// The SQL wrapping `ag_catalog.cypher`
    pub sql: String,
}

/// Translate a parameterized Cypher query into executable SQL
pub fn build_statement(graph_name: &str, query: &str, params: &GraphParams) -> Result<CypherStatement> {
    if query.trim().is_empty() {
        return Err(AppError::GraphQuery {
            phase: QueryPhase::BuildingQuery,
            query: String::new(),
            message: "Cypher query cannot be empty".to_string(),
        });
    }

    let cypher = embed_parameters(query, params)?;
    let columns = output_columns(&cypher);
    let tag = unique_dollar_tag(&cypher);

    let select = columns
        .iter()
        .map(|c| format!("{c}::text AS {c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let definitions = columns
        .iter()
        .map(|c| format!("{c} ag_catalog.agtype"))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "SELECT {select} FROM ag_catalog.cypher('{graph_name}'::name, ${tag}${cypher}${tag}$::cstring) AS t({definitions})"
    );

    Ok(CypherStatement { cypher, columns, sql })
}

/// Replace every `$name` placeholder outside string literals with a literal.
///
/// A placeholder with no matching parameter is an error.
pub fn embed_parameters(query: &str, params: &GraphParams) -> Result<String> {
    let chars: Vec<char> = query.chars().collect();
    let mut out = String::with_capacity(query.len());
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if let Some(q) = quote {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                out.push(c);
                i += 1;
            }
            '$' if i + 1 < chars.len() && is_ident_start(chars[i + 1]) => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_ident_part(chars[end]) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let value = params.get(&name).ok_or_else(|| AppError::GraphParameter {
                    name: name.clone(),
                    message: "no value supplied for placeholder".to_string(),
                })?;
                out.push_str(&format_value(value));
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(out)
}

/// Render a value as a Cypher literal
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_string(s),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(format_value).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", format_key(k), format_value(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

/// Single-quoted Cypher string with backslash, quote and control characters escaped
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn format_key(key: &str) -> String {
    let mut chars = key.chars();
    let plain = matches!(chars.next(), Some(c) if is_ident_start(c)) && chars.all(is_ident_part);
    if plain {
        key.to_string()
    } else {
        format!("`{}`", key.replace('`', "``"))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_part(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Number of items in the first top-level `RETURN` clause.
///
/// Commas inside string literals or nested in `()`, `[]` or `{}` do not
/// count, and the clause ends at a top-level `ORDER`, `SKIP`, `LIMIT` or
/// `UNION`. A query without `RETURN` still yields one column.
pub fn return_arity(query: &str) -> usize {
    let chars: Vec<char> = query.chars().collect();
    let Some(start) = find_top_level_keyword(&chars, 0, &["RETURN"]).map(|(_, end)| end) else {
        return 1;
    };

    let stop = find_top_level_keyword(&chars, start, &["ORDER", "SKIP", "LIMIT", "UNION"])
        .map(|(pos, _)| pos)
        .unwrap_or(chars.len());

    let mut commas = 0;
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;
    let mut i = start;

    while i < stop {
        let c = chars[i];
        if let Some(q) = quote {
            if c == '\\' {
                i += 2;
                continue;
            }
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => commas += 1,
            _ => {}
        }
        i += 1;
    }

    commas + 1
}

/// Column names for a query: `result` for one item, otherwise `c0..cN`
pub fn output_columns(query: &str) -> Vec<String> {
    match return_arity(query) {
        1 => vec![SINGLE_COLUMN.to_string()],
        n => (0..n).map(|i| format!("c{i}")).collect(),
    }
}

/// Locate the first of `keywords` appearing as a whole word outside strings
/// and brackets, scanning from `from`. Returns its start and end positions.
fn find_top_level_keyword(chars: &[char], from: usize, keywords: &[&str]) -> Option<(usize, usize)> {
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;
    let mut i = from;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            if c == '\\' {
                i += 2;
                continue;
            }
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                i += 1;
            }
            '(' | '[' | '{' => {
                depth += 1;
                i += 1;
            }
            ')' | ']' | '}' => {
                depth -= 1;
                i += 1;
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < chars.len() && is_ident_part(chars[i]) {
                    i += 1;
                }
                let boundary = start == 0 || !matches!(chars[start - 1], '$' | '.') && !is_ident_part(chars[start - 1]);
                if depth == 0 && boundary {
                    let word: String = chars[start..i].iter().collect();
                    if keywords.iter().any(|k| word.eq_ignore_ascii_case(k)) {
                        return Some((start, i));
                    }
                }
            }
            _ => i += 1,
        }
    }
    None
}

/// A dollar-quote tag that does not occur in the query text
fn unique_dollar_tag(cypher: &str) -> String {
    let mut tag = DOLLAR_TAG.to_string();
    let mut n = 0;
    while cypher.contains(&format!("${tag}$")) || cypher.ends_with(&format!("${tag}")) {
        n += 1;
        tag = format!("{DOLLAR_TAG}{n}");
    }
    tag
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_arity_single_item() {
        assert_eq!(return_arity("MATCH (e:Expert) RETURN e.id"), 1);
        assert_eq!(output_columns("MATCH (e:Expert) RETURN e.id"), vec!["result"]);
    }

    #[test]
    fn test_arity_three_items() {
        let query = "MATCH (a)-[r]->(b) RETURN a, r, b";
        assert_eq!(output_columns(query), vec!["c0", "c1", "c2"]);
    }

    #[test]
    fn test_arity_ignores_commas_in_function_call() {
        assert_eq!(return_arity("MATCH (a) RETURN collect(a.x, a.y)"), 1);
        assert_eq!(return_arity("MATCH (a) RETURN [a.x, a.y], {k: 1, j: 2}"), 2);
    }

    #[test]
    fn test_arity_ignores_commas_in_string_literal() {
        assert_eq!(return_arity("MATCH (a) RETURN \"a,b\", c"), 2);
        assert_eq!(return_arity("MATCH (a) RETURN 'x, \\'y, z', c"), 2);
    }

    #[test]
    fn test_arity_stops_at_order_by_and_limit() {
        let query = "MATCH (e:Expert) RETURN DISTINCT e.id as expertId ORDER BY e.name, e.id LIMIT 100";
        assert_eq!(return_arity(query), 1);
    }

    #[test]
    fn test_arity_without_return() {
        assert_eq!(return_arity("CREATE (e:Expert {id: 'E1'})"), 1);
    }

    #[test]
    fn test_arity_ignores_keyword_inside_identifier_and_string() {
        let query = "MATCH (e:Expert) WHERE e.name = 'RETURN, me' RETURN e.returnValue, e.id";
        assert_eq!(return_arity(query), 2);
    }

    #[test]
    fn test_embed_escapes_strings() {
        let p = params([("name", json!("O'Brien\\\n\r\t"))]);
        let out = embed_parameters("MATCH (e) WHERE e.name = $name RETURN e", &p).unwrap();
        assert_eq!(out, "MATCH (e) WHERE e.name = 'O\\'Brien\\\\\\n\\r\\t' RETURN e");
    }

    #[test]
    fn test_embed_scalars_and_lists() {
        let p = params([
            ("techs", json!(["Java", "AWS"])),
            ("count", json!(2)),
            ("flag", json!(true)),
            ("missing", Value::Null),
        ]);
        let out = embed_parameters("$techs $count $flag $missing", &p).unwrap();
        assert_eq!(out, "['Java', 'AWS'] 2 true null");
    }

    #[test]
    fn test_embed_map_literal() {
        let p = params([("row", json!({"full name": "A", "id": "E1"}))]);
        let out = embed_parameters("CREATE (e:Expert $row)", &p).unwrap();
        assert_eq!(out, "CREATE (e:Expert {`full name`: 'A', id: 'E1'})");
    }

    #[test]
    fn test_embed_prefix_names_do_not_collide() {
        let p = params([("tech", json!("Go")), ("techCount", json!(3))]);
        let out = embed_parameters("WHERE t = $tech AND n = $techCount", &p).unwrap();
        assert_eq!(out, "WHERE t = 'Go' AND n = 3");
    }

    #[test]
    fn test_embed_skips_placeholders_in_literals() {
        let p = params([("a", json!(1))]);
        let out = embed_parameters("RETURN '$b', $a", &p).unwrap();
        assert_eq!(out, "RETURN '$b', 1");
    }

    #[test]
    fn test_missing_parameter_fails_fast() {
        let err = embed_parameters("MATCH (t) WHERE t.name = $technology RETURN t", &GraphParams::new())
            .unwrap_err();
        match err {
            AppError::GraphParameter { name, .. } => assert_eq!(name, "technology"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_injection_stays_inside_literal() {
        let p = params([("name", json!("x' }) DETACH DELETE (n) //"))]);
        let out = embed_parameters("MATCH (t {name: $name}) RETURN t", &p).unwrap();
        assert_eq!(out, "MATCH (t {name: 'x\\' }) DETACH DELETE (n) //'}) RETURN t");
    }

    #[test]
    fn test_build_statement_sql() {
        let p = params([("technology", json!("Java"))]);
        let stmt = build_statement(
            "expertmatch_graph",
            "MATCH (t:Technology) WHERE t.name = $technology RETURN t.name",
            &p,
        )
        .unwrap();
        assert_eq!(stmt.columns, vec!["result"]);
        assert_eq!(
            stmt.sql,
            "SELECT result::text AS result FROM ag_catalog.cypher('expertmatch_graph'::name, \
             $cypher_q$MATCH (t:Technology) WHERE t.name = 'Java' RETURN t.name$cypher_q$::cstring) \
             AS t(result ag_catalog.agtype)"
        );
    }

    #[test]
    fn test_dollar_tag_avoids_collision() {
        let p = params([("v", json!("$cypher_q$"))]);
        let stmt = build_statement("g", "RETURN $v", &p).unwrap();
        assert!(stmt.sql.contains("$cypher_q1$RETURN '$cypher_q$'$cypher_q1$"));
    }

    #[test]
    fn test_empty_query_rejected() {
        let err = build_statement("g", "   ", &GraphParams::new()).unwrap_err();
        assert!(matches!(
            err,
            AppError::GraphQuery { phase: QueryPhase::BuildingQuery, .. }
        ));
    }
}
