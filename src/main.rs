//! Field Extractor - hybrid template+LLM PDF field extraction server.

mod batch;
mod cache;
mod config;
mod error;
mod extract;
mod fingerprint;
mod llm;
mod model;
mod orchestrator;
mod parser;
mod stopwords;
mod template;
mod validator;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use clap::Parser;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use batch::{run_batch, BatchItem};
use cache::CacheStats;
use config::Settings;
use llm::OpenRouterExtractor;
use model::{ExtractionRequest, ExtractionResult, Schema};
use orchestrator::Orchestrator;
use parser::LopdfTextParser;
use template::TemplateSummary;

/// Hybrid template+LLM PDF field extraction — server or one-shot CLI mode.
#[derive(Parser, Debug)]
#[command(name = "field-extractor", version)]
struct Cli {
    /// Run the HTTP server instead of a one-shot local extraction.
    #[arg(long)]
    serve: bool,

    /// Path to a PDF file to extract (one-shot mode).
    file: Option<PathBuf>,

    /// Document label (one-shot mode).
    #[arg(long, default_value = "default")]
    label: String,

    /// Path to a JSON file mapping field name -> description (one-shot mode).
    #[arg(long)]
    schema: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    settings: Arc<Settings>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "field_extractor=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    let orchestrator = Arc::new(build_orchestrator(&settings)?);

    if cli.serve {
        serve(orchestrator, settings).await
    } else {
        run_once(orchestrator, cli).await
    }
}

fn build_orchestrator(settings: &Settings) -> anyhow::Result<Orchestrator> {
    std::fs::create_dir_all(&settings.cache_l2_dir)?;
    let cache = cache::Cache::open(settings.cache_l1_capacity, &settings.cache_l2_dir)?;

    let templates_dir = settings.cache_l2_dir.with_file_name(
        format!(
            "{}_templates",
            settings
                .cache_l2_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("cache_l2")
        ),
    );
    std::fs::create_dir_all(&templates_dir)?;
    let templates_db = sled::open(&templates_dir)?;
    let templates = template::store::TemplateStore::open(&templates_db, settings.template_max_per_label)?;

    let parser = Box::new(LopdfTextParser::new());
    let llm = Box::new(OpenRouterExtractor::from_env()?);

    Ok(Orchestrator::new(cache, templates, parser, llm, settings.clone()))
}

async fn run_once(orchestrator: Arc<Orchestrator>, cli: Cli) -> anyhow::Result<()> {
    let path = cli
        .file
        .ok_or_else(|| anyhow::anyhow!("a file path is required in one-shot mode (or pass --serve)"))?;
    let pdf_bytes = std::fs::read(&path)?;

    let schema = match cli.schema {
        Some(schema_path) => {
            let raw = std::fs::read_to_string(&schema_path)?;
            Schema::from_json_str(&raw)?
        }
        None => Schema::new(vec![("text".to_string(), "The document's full text".to_string())])?,
    };

    let request = ExtractionRequest::new(pdf_bytes, cli.label, schema)?;
    let result = orchestrator.extract(request, CancellationToken::new()).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn serve(orchestrator: Arc<Orchestrator>, settings: Settings) -> anyhow::Result<()> {
    let state = AppState {
        orchestrator,
        settings: Arc::new(settings),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/extract", post(extract_handler))
        .route("/extract/batch", post(extract_batch_handler))
        .route("/cache/stats", get(cache_stats_handler))
        .route("/templates/:label", get(templates_handler))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3100".to_string());
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

async fn cache_stats_handler(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.orchestrator.cache().stats())
}

async fn templates_handler(
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> Result<Json<Vec<TemplateSummary>>, (StatusCode, String)> {
    let templates = state
        .orchestrator
        .templates()
        .list(&label)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(templates.iter().map(TemplateSummary::from).collect()))
}

/// `POST /extract` (§4.9): multipart `file` + `label` + `schema`, runs the
/// pipeline synchronously and returns the `ExtractionResult` as JSON.
async fn extract_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ExtractionResult>, (StatusCode, String)> {
    let mut file_data: Option<Vec<u8>> = None;
    let mut label: Option<String> = None;
    let mut schema_json: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("multipart error: {}", e)))?
    {
        match field.name() {
            Some("file") => {
                file_data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| (StatusCode::BAD_REQUEST, format!("failed to read file: {}", e)))?
                        .to_vec(),
                );
            }
            Some("label") => {
                label = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| (StatusCode::BAD_REQUEST, format!("failed to read label: {}", e)))?,
                );
            }
            Some("schema") => {
                schema_json = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| (StatusCode::BAD_REQUEST, format!("failed to read schema: {}", e)))?,
                );
            }
            _ => {}
        }
    }

    let pdf_bytes = file_data.ok_or_else(|| (StatusCode::BAD_REQUEST, "missing multipart 'file' field".to_string()))?;
    let label = label.ok_or_else(|| (StatusCode::BAD_REQUEST, "missing multipart 'label' field".to_string()))?;
    let schema_json = schema_json.ok_or_else(|| (StatusCode::BAD_REQUEST, "missing multipart 'schema' field".to_string()))?;

    let schema = Schema::from_json_str(&schema_json).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let request = ExtractionRequest::new(pdf_bytes, label, schema).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let result = state.orchestrator.extract(request, CancellationToken::new()).await;
    Ok(Json(result))
}

/// `POST /extract/batch` (§4.9): multipart upload of multiple files (each
/// part named `file` carries its own `label`/`schema` sibling text parts
/// sharing the same numeric suffix, e.g. `file0`/`label0`/`schema0`) and
/// returns an SSE stream: one `result` frame per completed item, one
/// closing `complete` frame with aggregate stats.
async fn extract_batch_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>>, (StatusCode, String)> {
    let mut by_index: std::collections::BTreeMap<usize, (Option<Vec<u8>>, Option<String>, Option<String>)> =
        std::collections::BTreeMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("multipart error: {}", e)))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let (prefix, suffix) = split_trailing_digits(&name);
        let Ok(index) = suffix.parse::<usize>() else {
            continue;
        };
        let entry = by_index.entry(index).or_insert((None, None, None));
        match prefix {
            "file" => {
                entry.0 = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| (StatusCode::BAD_REQUEST, format!("failed to read file: {}", e)))?
                        .to_vec(),
                )
            }
            "label" => {
                entry.1 = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| (StatusCode::BAD_REQUEST, format!("failed to read label: {}", e)))?,
                )
            }
            "schema" => {
                entry.2 = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| (StatusCode::BAD_REQUEST, format!("failed to read schema: {}", e)))?,
                )
            }
            _ => {}
        }
    }

    let mut items = Vec::new();
    for (index, (bytes, label, schema_json)) in by_index {
        let (Some(bytes), Some(label), Some(schema_json)) = (bytes, label, schema_json) else {
            continue;
        };
        let schema = Schema::from_json_str(&schema_json)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid schema JSON at index {}: {}", index, e)))?;
        items.push(BatchItem {
            file_index: index,
            pdf_bytes: bytes,
            label,
            schema,
        });
    }

    let max_workers = state.settings.batch_max_workers;
    let cancel = CancellationToken::new();
    let rx = run_batch(state.orchestrator.clone(), items, max_workers, cancel);

    let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(|event| {
        let (event_name, payload) = match &event {
            batch::BatchEvent::Result { .. } => ("result", &event),
            batch::BatchEvent::Complete { .. } => ("complete", &event),
        };
        let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(event_name).data(json))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn split_trailing_digits(name: &str) -> (&str, &str) {
    let digit_start = name
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)
        .unwrap_or(name.len());
    name.split_at(digit_start)
}
