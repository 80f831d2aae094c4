//! Graph result rows and agtype decoding

use serde_json::Value;
use std::collections::BTreeMap;

use super::cypher::SINGLE_COLUMN;

/// One row returned by a graph query, keyed by output column name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphRow {
    columns: BTreeMap<String, Value>,
}

impl GraphRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.columns.insert(column.into(), value);
        self
    }

    /// A row holding a single `result` column
    pub fn single(value: Value) -> Self {
        Self::new().with(SINGLE_COLUMN, value)
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.columns.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.columns.iter()
    }

    /// Look up `field` as a column, or as a property of a map or vertex in
    /// the single `result` column, or fall back to a scalar `result`.
    pub fn field(&self, field: &str) -> Option<&Value> {
        if let Some(v) = self.columns.get(field) {
            return Some(v);
        }
        let result = self.columns.get(SINGLE_COLUMN)?;
        match result {
            Value::Object(map) => map.get(field).or_else(|| {
                map.get("properties")
                    .and_then(|p| p.as_object())
                    .and_then(|p| p.get(field))
            }),
            Value::Null => None,
            other => Some(other),
        }
    }

    /// String form of a field; numbers and booleans are stringified
    pub fn field_string(&self, field: &str) -> Option<String> {
        self.field(field).and_then(value_to_string)
    }

    pub fn field_i64(&self, field: &str) -> Option<i64> {
        match self.field(field)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Stringify a scalar value; `null` and containers yield `None`
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Decode agtype text into JSON.
///
/// Type annotations such as `::vertex`, `::edge`, `::path` or `::numeric`
/// are removed outside string literals. Text that still is not valid JSON
/// is returned as a plain string.
pub fn parse_agtype(raw: &str) -> Value {
    let stripped = strip_type_annotations(raw);
    match serde_json::from_str(&stripped) {
        Ok(value) => value,
        Err(_) => Value::String(raw.trim().to_string()),
    }
}

fn strip_type_annotations(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
        } else if c == ':' && chars.get(i + 1) == Some(&':') {
            i += 2;
            while i < chars.len() && chars[i].is_ascii_alphabetic() {
                i += 1;
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}
