//! JSON reporting API over the FLR datastore.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flr_storage::{
    BankDetailView, Datastore, FarmerQuery, LandQuery, LandUpdate, Paging, StoreError,
};
use flr_sync::SyncConfig;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "flr-web";

const UNKNOWN_BANK: &str = "Unknown Bank";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub datastore_path: PathBuf,
    pub bank_directory: Option<PathBuf>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        let sync = SyncConfig::from_env();
        Self {
            port: std::env::var("FLR_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
            datastore_path: sync.datastore_path(),
            bank_directory: std::env::var("FLR_BANK_DIRECTORY").ok().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct BankEntry {
    #[serde(rename = "BankId")]
    bank_id: i64,
    #[serde(rename = "BankName")]
    bank_name: String,
}

/// Bank id to display name.
#[derive(Debug, Clone, Default)]
pub struct BankDirectory {
    names: HashMap<i64, String>,
}

impl BankDirectory {
    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let entries: Vec<BankEntry> = serde_json::from_str(text).context("parsing bank directory")?;
        Ok(Self {
            names: entries.into_iter().map(|e| (e.bank_id, e.bank_name)).collect(),
        })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn name_for(&self, bank_id: Option<i64>) -> String {
        bank_id
            .and_then(|id| self.names.get(&id).cloned())
            .unwrap_or_else(|| UNKNOWN_BANK.to_string())
    }

    fn label(&self, detail: &mut BankDetailView) {
        detail.bank_name = Some(self.name_for(detail.bank_id));
    }
}

#[derive(Clone)]
pub struct AppState {
    pub datastore: Datastore,
    pub banks: BankDirectory,
}

impl AppState {
    pub fn new(datastore: Datastore, banks: BankDirectory) -> Self {
        Self { datastore, banks }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/farmers", get(farmers_handler))
        .route("/api/farmer/{id}", get(farmer_detail_handler))
        .route("/api/lands", get(lands_handler))
        .route("/api/land/{id}", get(land_detail_handler))
        .route("/api/land/update/{id}", post(land_update_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let banks = match &config.bank_directory {
        Some(path) => BankDirectory::load(path)?,
        None => {
            warn!("no bank directory configured; bank names will be reported as unknown");
            BankDirectory::default()
        }
    };
    let state = AppState::new(Datastore::new(&config.datastore_path), banks);
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, datastore = %config.datastore_path.display(), "serving reporting api");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(WebConfig::from_env()).await
}

/// Query values arrive as text; anything unparsable falls back to page 1.
fn parse_page(page: Option<&str>) -> Option<usize> {
    page.and_then(|p| p.trim().parse().ok())
}

#[derive(Debug, Default, Deserialize)]
struct FarmersParams {
    page: Option<String>,
    search: Option<String>,
    source_api: Option<String>,
    total_area: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LandsParams {
    page: Option<String>,
    search: Option<String>,
}

async fn farmers_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FarmersParams>,
) -> Response {
    let query = FarmerQuery {
        paging: Paging {
            page: parse_page(params.page.as_deref()),
            per_page: None,
        },
        search: params.search,
        source_api: params.source_api,
        without_land: params.total_area.as_deref().map(str::trim) == Some("0"),
    };
    match state.datastore.list_farmers(&query).await {
        Ok(mut page) => {
            for farmer in &mut page.data {
                if let Some(bank) = farmer.bank_detail.as_mut() {
                    state.banks.label(bank);
                }
            }
            Json(page).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn farmer_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.datastore.get_farmer(id).await {
        Ok(Some(mut farmer)) => {
            if let Some(bank) = farmer.bank_detail.as_mut() {
                state.banks.label(bank);
            }
            Json(farmer).into_response()
        }
        Ok(None) => not_found("Farmer not found"),
        Err(err) => server_error(err),
    }
}

async fn lands_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LandsParams>,
) -> Response {
    let query = LandQuery {
        paging: Paging {
            page: parse_page(params.page.as_deref()),
            per_page: None,
        },
        search: params.search,
    };
    match state.datastore.list_lands(&query).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error(err),
    }
}

async fn land_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.datastore.get_land(id).await {
        Ok(Some(land)) => Json(land).into_response(),
        Ok(None) => not_found("Land record not found"),
        Err(err) => server_error(err),
    }
}

/// The body must be a non-empty JSON object of editable land fields.
fn parse_land_update(body: &[u8]) -> Option<LandUpdate> {
    let value: JsonValue = serde_json::from_slice(body).ok()?;
    match &value {
        JsonValue::Object(map) if !map.is_empty() => serde_json::from_value(value).ok(),
        _ => None,
    }
}

async fn land_update_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    body: Bytes,
) -> Response {
    let Some(update) = parse_land_update(&body) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "Invalid data"}))).into_response();
    };
    match state.datastore.update_land(id, &update).await {
        Ok(true) => {
            info!(land_id = id, "land record updated");
            Json(json!({"success": true})).into_response()
        }
        Ok(false) => not_found("Land record not found"),
        Err(err) => server_error(err),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.datastore.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err),
    }
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": message}))).into_response()
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}
