//! Stock Screener - condition-based A-share screening
//!
//! Usage:
//!   stock-screener serve --port 3001                          - Launch the HTTP API
//!   stock-screener run --conditions '{"field":"pe","op":"<","value":15}'
//!   stock-screener import --snapshots snapshots.json          - Load data into the store

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use engine::condition::deserialize_conditions;
use engine::{
    Condition, FieldValue, ScreenedRow, ScreeningConfig, ScreeningError, ScreeningRequest,
    IndustrySummary, ScreeningResponse, ScreeningService, SortDirection, SortKey,
    SqliteMarketStore,
};
use persistence::repository::{
    BarRecord, BarRepository, QuoteRecord, QuoteRepository, SnapshotRecord, SnapshotRepository,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "stock-screener")]
#[command(about = "Condition-based stock screener with indicator-aware evaluation", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the screening web server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Run one screen from the CLI
    Run {
        /// Condition tree or list as JSON, or @path to a JSON file
        #[arg(long)]
        conditions: String,
        /// Sort keys as field[:asc|desc] (comma-separated)
        #[arg(long, value_delimiter = ',', value_parser = parse_sort_key)]
        order_by: Vec<SortKey>,
        /// Page size
        #[arg(long)]
        limit: Option<u64>,
        /// Page offset
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Market code; "all" disables the filter
        #[arg(long, default_value = "CN")]
        market: String,
        /// As-of date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Evaluate per symbol even when the store could answer
        #[arg(long)]
        no_pushdown: bool,
        /// Print the raw JSON response instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List screenable fields with live statistics
    Fields,
    /// Validate a condition tree without running it
    Validate {
        /// Condition tree or list as JSON, or @path to a JSON file
        #[arg(long)]
        conditions: String,
    },
    /// Load JSON arrays of snapshots, bars and quotes into the store
    Import {
        #[arg(long)]
        snapshots: Option<String>,
        #[arg(long)]
        bars: Option<String>,
        #[arg(long)]
        quotes: Option<String>,
    },
}

#[derive(Clone)]
struct AppState {
    service: Arc<ScreeningService>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // RUST_LOG (possibly from .env) wins unless --verbose is given
    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,persistence=debug,stock_screener=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,engine=info,persistence=info,stock_screener=info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

/// Inline JSON, or `@path` to read it from a file
fn read_json_arg(raw: &str) -> anyhow::Result<String> {
    match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path, e)),
        None => Ok(raw.to_string()),
    }
}

fn parse_conditions(raw: &str) -> anyhow::Result<Condition> {
    let json = read_json_arg(raw)?;
    let mut de = serde_json::Deserializer::from_str(&json);
    deserialize_conditions(&mut de).map_err(|e| anyhow::anyhow!("Invalid conditions: {}", e))
}

/// `field[:asc|desc]`, descending when no direction is given
fn parse_sort_key(s: &str) -> Result<SortKey, String> {
    let (field, direction) = match s.split_once(':') {
        Some((field, dir)) => (field, dir.parse::<SortDirection>()?),
        None => (s, SortDirection::Desc),
    };
    if field.is_empty() {
        return Err(format!("missing field name in sort key '{s}'"));
    }
    Ok(SortKey {
        field: field.to_string(),
        direction,
    })
}

async fn open_service() -> anyhow::Result<(ScreeningService, persistence::Database)> {
    let config = ScreeningConfig::from_env();
    let db = persistence::Database::new(&config.db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", config.db_path);

    let service = ScreeningService::with_sqlite(SqliteMarketStore::from_database(&db), config);
    Ok((service, db))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
        Commands::Run {
            conditions,
            order_by,
            limit,
            offset,
            market,
            date,
            no_pushdown,
            json,
        } => {
            let mut request = ScreeningRequest::new(parse_conditions(&conditions)?);
            request.order_by = order_by;
            request.limit = limit;
            request.offset = offset;
            request.market = market;
            request.as_of = date;
            request.prefer_pushdown = !no_pushdown;
            cmd_run(request, json).await?;
        }
        Commands::Fields => {
            cmd_fields().await?;
        }
        Commands::Validate { conditions } => {
            cmd_validate(&conditions).await?;
        }
        Commands::Import {
            snapshots,
            bars,
            quotes,
        } => {
            cmd_import(snapshots, bars, quotes).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Serve command - Axum web server
// ============================================================================

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Stock Screener v{} starting...", APP_VERSION);

    let (service, _db) = open_service().await?;
    let db_path = service.config().db_path.clone();
    let state = AppState {
        service: Arc::new(service),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/screening/run", post(api_run_screening))
        .route("/screening/fields", get(api_fields))
        .route("/screening/fields/:name", get(api_field))
        .route("/screening/validate", post(api_validate))
        .route("/screening/industries", get(api_industries))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Stock Screener v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health                    - Health check");
    println!("  POST /api/screening/run             - Run a screen");
    println!("  GET  /api/screening/fields          - Field catalog with statistics");
    println!("  GET  /api/screening/fields/:name    - One field");
    println!("  POST /api/screening/validate        - Validate conditions");
    println!("  GET  /api/screening/industries      - Industries with symbol counts");
    println!("\n  Database: {}", db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Run / fields / validate commands - CLI mode
// ============================================================================

async fn cmd_run(request: ScreeningRequest, json: bool) -> anyhow::Result<()> {
    let (service, _db) = open_service().await?;

    let response = match service.run(&request).await {
        Ok(r) => r,
        Err(ScreeningError::Validation(errors)) => {
            for issue in errors.issues() {
                println!("  {:<28} {}", issue.path, issue.message);
            }
            anyhow::bail!("{} invalid condition(s)", errors.0.len());
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_results(&response);
    }
    Ok(())
}

fn cell(row: &ScreenedRow, field: &str) -> String {
    match row.get(field) {
        Some(FieldValue::Number(n)) => format!("{:.2}", n),
        Some(FieldValue::Text(s)) => s.clone(),
        None => "-".to_string(),
    }
}

fn print_results(response: &ScreeningResponse) {
    println!(
        "\n{} match(es), showing {} from offset {} [{}; {} ms{}]",
        response.total,
        response.items.len(),
        response.offset,
        response.routing_used,
        response.took_ms,
        if response.partial { "; PARTIAL" } else { "" },
    );
    println!(
        "  {:>3}  {:<8} {:<12} {:>10} {:>8} {:>12} {:>8}",
        "#", "Symbol", "Name", "Close", "Chg%", "MktCap(亿)", "PE"
    );
    println!("  {}", "-".repeat(70));
    for (i, row) in response.items.iter().enumerate() {
        println!(
            "  {:>3}  {:<8} {:<12} {:>10} {:>8} {:>12} {:>8}",
            response.offset as usize + i + 1,
            row.symbol,
            cell(row, "name"),
            cell(row, "close"),
            cell(row, "pct_chg"),
            cell(row, "total_mv"),
            cell(row, "pe"),
        );
    }
}

async fn cmd_fields() -> anyhow::Result<()> {
    let (service, _db) = open_service().await?;
    let infos = service.field_info().await;

    println!(
        "\n  {:<14} {:<12} {:<12} {:>12} {:>12}  Operators",
        "Field", "Category", "Unit", "Min", "Max"
    );
    println!("  {}", "-".repeat(90));
    for info in infos {
        let d = &info.descriptor;
        let stat = |v: Option<f64>| v.map(|n| format!("{:.2}", n)).unwrap_or_else(|| "-".into());
        let (min, max) = match &d.statistics {
            Some(s) => (stat(s.min), stat(s.max)),
            None => ("-".into(), "-".into()),
        };
        let ops: Vec<&str> = d.supported_operators.iter().map(|o| o.as_str()).collect();
        println!(
            "  {:<14} {:<12} {:<12} {:>12} {:>12}  {}",
            d.name,
            format!("{:?}", d.category).to_lowercase(),
            d.unit.as_deref().unwrap_or("-"),
            min,
            max,
            ops.join(" "),
        );
    }
    Ok(())
}

async fn cmd_validate(raw: &str) -> anyhow::Result<()> {
    let conditions = parse_conditions(raw)?;
    let (service, _db) = open_service().await?;
    let report = service.validate(&conditions);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.valid {
        anyhow::bail!("{} invalid condition(s)", report.errors.len());
    }
    Ok(())
}

// ============================================================================
// Import command - load data into the store
// ============================================================================

fn read_records<T: serde::de::DeserializeOwned>(path: &str) -> anyhow::Result<Vec<T>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path, e))?;
    serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path, e))
}

async fn cmd_import(
    snapshots: Option<String>,
    bars: Option<String>,
    quotes: Option<String>,
) -> anyhow::Result<()> {
    if snapshots.is_none() && bars.is_none() && quotes.is_none() {
        warn!("Nothing to import: pass --snapshots, --bars and/or --quotes");
        return Ok(());
    }

    let config = ScreeningConfig::from_env();
    let db = persistence::Database::new(&config.db_path)
        .await
        .map_err(|e| anyhow::anyhow!("Database initialization failed: {}", e))?;
    info!("Database opened: {}", config.db_path);

    if let Some(path) = snapshots {
        let records: Vec<SnapshotRecord> = read_records(&path)?;
        let repo = SnapshotRepository::new(db.pool());
        for record in &records {
            repo.upsert(record).await?;
        }
        info!("Imported {} snapshots from {}", records.len(), path);
    }

    if let Some(path) = bars {
        let records: Vec<BarRecord> = read_records(&path)?;
        let written = BarRepository::new(db.pool()).upsert_many(&records).await?;
        info!("Imported {} bars from {}", written, path);
    }

    if let Some(path) = quotes {
        let records: Vec<QuoteRecord> = read_records(&path)?;
        let repo = QuoteRepository::new(db.pool());
        for record in &records {
            repo.upsert(record).await?;
        }
        info!("Imported {} quotes from {}", records.len(), path);
    }

    Ok(())
}

// ============================================================================
// API Handlers - Screening
// ============================================================================

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "stock-screener",
        "version": APP_VERSION,
    }))
}

/// POST /api/screening/run - validate, route and execute one screen
async fn api_run_screening(
    State(state): State<AppState>,
    Json(request): Json<ScreeningRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.service.run(&request).await {
        Ok(response) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "data": response,
            })),
        ),
        Err(ScreeningError::Validation(errors)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "success": false,
                "error": errors.to_string(),
                "errors": errors.issues(),
            })),
        ),
        Err(e) if e.is_client_error() => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "success": false,
                "error": e.to_string(),
            })),
        ),
        Err(e) => {
            error!("Screening failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "success": false,
                    "error": format!("Screening failed: {}", e),
                })),
            )
        }
    }
}

/// GET /api/screening/fields - field catalog for client-side form generation
async fn api_fields(State(state): State<AppState>) -> Json<serde_json::Value> {
    let fields = state.service.field_info().await;
    Json(serde_json::json!({
        "success": true,
        "total": fields.len(),
        "fields": fields,
    }))
}

/// GET /api/screening/fields/:name - one field, by canonical name or alias
async fn api_field(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let field = state.service.field(&name).await.ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "field": field,
    })))
}

#[derive(Deserialize)]
struct ValidateBody {
    #[serde(deserialize_with = "deserialize_conditions")]
    conditions: Condition,
}

/// POST /api/screening/validate - report errors and warnings without running
async fn api_validate(
    State(state): State<AppState>,
    Json(body): Json<ValidateBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let report = state.service.validate(&body.conditions);
    let status = if report.valid {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (
        status,
        Json(serde_json::json!({
            "success": report.valid,
            "report": report,
        })),
    )
}

/// GET /api/screening/industries - industries with symbol counts
async fn api_industries(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    industries_response(state.service.industries().await)
}

fn industries_response(
    result: Result<Vec<IndustrySummary>, ScreeningError>,
) -> (StatusCode, Json<serde_json::Value>) {
    match result {
        Ok(industries) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "industries": industries,
            })),
        ),
        Err(e) => {
            error!("Failed to list industries: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "success": false,
                    "error": format!("Failed to list industries: {}", e),
                })),
            )
        }
    }
}
