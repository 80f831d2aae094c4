//! Property graph access over Apache AGE
//!
//! - `cypher`: parameter embedding, arity inference, SQL wrapping
//! - `row`: result rows and agtype decoding
//! - `adapter`: execution with transient-abort suppression
//! - `admin`: graph catalogue, DDL and statistics
//! - `builder`: rebuilding the graph from work history

mod adapter;
mod admin;
mod builder;
mod cypher;
mod row;

pub use adapter::{GraphBackend, GraphExecutor, GraphQueryAdapter, PgGraphBackend};
pub use admin::{graph_statistics, GraphAdmin, GraphCatalog, GraphStatistics, EDGE_TYPES, VERTEX_LABELS};
pub use builder::{
    BuildContext, BuildSummary, CustomerRecord, ExpertRecord, GraphBuilder, GraphSnapshot,
    GraphSource, Participation, PgGraphSource, ProjectRecord, ProjectRef, EDGE_BATCH_SIZE,
};
pub use cypher::{
    build_statement, embed_parameters, format_value, output_columns, params, quote_string,
    return_arity, CypherStatement, GraphParams, SINGLE_COLUMN,
};
pub use row::{parse_agtype, value_to_string, GraphRow};
