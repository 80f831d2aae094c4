//! ExpertMatch Retrieval
//!
//! Runs hybrid retrieval from the command line:
//! - `retrieval` (default): reads a JSON request on stdin, prints the
//!   ranked result as JSON
//! - `retrieval build-graph`: rebuilds the expert graph from work history
//! - `retrieval graph-stats`: prints vertex and edge counts

use anyhow::Context;
use expertmatch_common::{
    config::AppConfig,
    db::DbPool,
    embeddings::create_embedder,
    llm::create_reasoning_model,
    metrics,
    query::{ExtractedEntities, ParsedQuery},
    VERSION,
};
use expertmatch_retrieval::graph::{graph_statistics, GraphAdmin, GraphBuilder, GraphQueryAdapter, PgGraphSource};
use expertmatch_retrieval::retrieval::{
    GraphSearchService, HybridRetrievalEngine, PgKeywordSearch, PgPersonNameLookup, PgProfileSource,
    PgVectorSearch, RetrievalRequest, SemanticReranker,
};
use serde::Deserialize;
use std::io::Read;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// stdin payload: the request plus the upstream query analysis
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrievalInput {
    #[serde(flatten)]
    request: RetrievalRequest,

    #[serde(default)]
    parsed_query: Option<ParsedQuery>,

    #[serde(default)]
    entities: ExtractedEntities,
}

fn init_tracing(config: &AppConfig) {
    // Logs go to stderr; stdout carries the result
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.observability.log_level.clone()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("failed to load configuration")?;
    init_tracing(&config);
    config.validate()?;

    info!(service = %config.observability.service_name, "Starting ExpertMatch Retrieval v{}", VERSION);
    metrics::register_metrics();

    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    let graph = Arc::new(GraphQueryAdapter::postgres(db.write().clone(), &config.graph));
    let admin = GraphAdmin::new(db.write().clone(), config.graph.name.clone());

    let command = std::env::args().nth(1).unwrap_or_default();
    match command.as_str() {
        "build-graph" => {
            let source = Arc::new(PgGraphSource::new(db.read().clone(), &config.graph.schema)?);
            let builder = GraphBuilder::new(graph, Arc::new(admin.clone()), source).with_admin(admin);
            let summary = builder.build().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        "graph-stats" => {
            let stats = graph_statistics(graph.as_ref()).await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        "" | "retrieve" => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("failed to read request from stdin")?;
            let input: RetrievalInput = serde_json::from_str(&raw).context("invalid retrieval request")?;

            let engine = build_engine(&config, &db, graph, admin)?;
            let parsed = input.parsed_query.unwrap_or_else(|| ParsedQuery {
                original_query: input.request.query.clone(),
                ..Default::default()
            });

            let result = engine.retrieve(&input.request, &parsed, &input.entities).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        other => anyhow::bail!("unknown command '{other}' (expected retrieve, build-graph or graph-stats)"),
    }

    Ok(())
}

fn build_engine(
    config: &AppConfig,
    db: &DbPool,
    graph: Arc<GraphQueryAdapter>,
    admin: GraphAdmin,
) -> anyhow::Result<HybridRetrievalEngine> {
    let schema = &config.graph.schema;
    let read = db.read().clone();

    let embedder = create_embedder(&config.embedding)?;
    info!(model = %embedder.model_name(), dimension = embedder.dimension(), "Embedder initialized");

    let model = create_reasoning_model(&config.reranking)?;
    info!(reranking = model.is_some(), "Reasoning model initialized");

    let mut person = PgPersonNameLookup::new(read.clone(), schema)?;
    if let Some(model) = model.clone() {
        person = person.with_model(model);
    }

    let reranker = SemanticReranker::new(
        model,
        Arc::new(PgProfileSource::new(read.clone(), schema)?),
        &config.retrieval,
        &config.reranking,
    );

    Ok(HybridRetrievalEngine::new(
        Arc::new(PgVectorSearch::new(read.clone(), embedder, schema)?),
        GraphSearchService::new(graph, Arc::new(admin), config.retrieval.graph_row_limit),
        Arc::new(PgKeywordSearch::new(read, schema)?),
        Arc::new(person),
        reranker,
        config,
    ))
}
