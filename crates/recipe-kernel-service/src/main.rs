use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use recipe_kernel_api::{
    kernel_error, AddCategoryRequest, AddItemRequest, AddRecipeRequest, AddSlotsRequest,
    BestMatchRequest, CatalogListing, ConfirmRequest, ConfirmResult, MatchResult, MigrateResult,
    RecipeKernelApi, RemoveSlotsRequest, SlotChangeResult, SlotSpec, API_CONTRACT_VERSION,
};
use recipe_kernel_core::{Category, Item, KernelError, RecipeId, RecipeTemplate, SlotId};
use recipe_kernel_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: RecipeKernelApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct SlotsBody {
    slots: Vec<SlotSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoveSlotsBody {
    slot_ids: Vec<SlotId>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Parser)]
#[command(name = "recipe-kernel-service")]
#[command(about = "Local HTTP service for Recipe Kernel")]
struct Args {
    #[arg(long, default_value = "./recipe_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    #[allow(clippy::needless_pass_by_value)]
    fn from_api(err: anyhow::Error) -> Self {
        let status = match kernel_error(&err) {
            Some(KernelError::Query(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        tracing::warn!(status = status.as_u16(), error = %format!("{err:#}"), "request rejected");
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: format!("{err:#}") }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn parse_recipe_id(raw: &str) -> Result<RecipeId, ServiceError> {
    raw.parse::<RecipeId>().map_err(|err| ServiceError::bad_request(err.to_string()))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/catalog", get(catalog_list))
        .route("/v1/catalog/categories", post(catalog_add_category))
        .route("/v1/catalog/items", post(catalog_add_item))
        .route("/v1/recipes", post(recipe_add))
        .route("/v1/recipes/:recipe_id", get(recipe_show))
        .route("/v1/recipes/:recipe_id/slots", post(recipe_add_slots))
        .route("/v1/recipes/:recipe_id/slots/remove", post(recipe_remove_slots))
        .route("/v1/recipes/:recipe_id/slots/clear", post(recipe_clear_slots))
        .route("/v1/match/confirm", post(match_confirm))
        .route("/v1/match/best", post(match_best))
        .with_state(state)
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let state = ServiceState { api: RecipeKernelApi::new(args.db.clone()) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "recipe kernel service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(ServiceError::from_api)?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(ServiceError::from_api)?;
    Ok(Json(envelope(result)))
}

async fn catalog_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<CatalogListing>>, ServiceError> {
    let listing = state.api.list_catalog().map_err(ServiceError::from_api)?;
    Ok(Json(envelope(listing)))
}

async fn catalog_add_category(
    State(state): State<ServiceState>,
    Json(request): Json<AddCategoryRequest>,
) -> Result<Json<ServiceEnvelope<Category>>, ServiceError> {
    let category = state.api.add_category(request).map_err(ServiceError::from_api)?;
    Ok(Json(envelope(category)))
}

async fn catalog_add_item(
    State(state): State<ServiceState>,
    Json(request): Json<AddItemRequest>,
) -> Result<Json<ServiceEnvelope<Item>>, ServiceError> {
    let item = state.api.add_item(request).map_err(ServiceError::from_api)?;
    Ok(Json(envelope(item)))
}

async fn recipe_add(
    State(state): State<ServiceState>,
    Json(request): Json<AddRecipeRequest>,
) -> Result<Json<ServiceEnvelope<RecipeTemplate>>, ServiceError> {
    let recipe = state.api.add_recipe(request).map_err(ServiceError::from_api)?;
    Ok(Json(envelope(recipe)))
}

async fn recipe_show(
    State(state): State<ServiceState>,
    Path(recipe_id): Path<String>,
) -> Result<Json<ServiceEnvelope<RecipeTemplate>>, ServiceError> {
    let recipe_id = parse_recipe_id(&recipe_id)?;
    let recipe = state.api.get_recipe(recipe_id).map_err(ServiceError::from_api)?;
    Ok(Json(envelope(recipe)))
}

async fn recipe_add_slots(
    State(state): State<ServiceState>,
    Path(recipe_id): Path<String>,
    Json(body): Json<SlotsBody>,
) -> Result<Json<ServiceEnvelope<SlotChangeResult>>, ServiceError> {
    let recipe_id = parse_recipe_id(&recipe_id)?;
    let result = state
        .api
        .add_slots(AddSlotsRequest { recipe_id, slots: body.slots })
        .map_err(ServiceError::from_api)?;
    Ok(Json(envelope(result)))
}

async fn recipe_remove_slots(
    State(state): State<ServiceState>,
    Path(recipe_id): Path<String>,
    Json(body): Json<RemoveSlotsBody>,
) -> Result<Json<ServiceEnvelope<SlotChangeResult>>, ServiceError> {
    let recipe_id = parse_recipe_id(&recipe_id)?;
    let result = state
        .api
        .remove_slots(RemoveSlotsRequest { recipe_id, slot_ids: body.slot_ids })
        .map_err(ServiceError::from_api)?;
    Ok(Json(envelope(result)))
}

async fn recipe_clear_slots(
    State(state): State<ServiceState>,
    Path(recipe_id): Path<String>,
) -> Result<Json<ServiceEnvelope<SlotChangeResult>>, ServiceError> {
    let recipe_id = parse_recipe_id(&recipe_id)?;
    let result = state.api.clear_slots(recipe_id).map_err(ServiceError::from_api)?;
    Ok(Json(envelope(result)))
}

async fn match_confirm(
    State(state): State<ServiceState>,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<ServiceEnvelope<ConfirmResult>>, ServiceError> {
    let result = state.api.confirm(request).map_err(ServiceError::from_api)?;
    Ok(Json(envelope(result)))
}

async fn match_best(
    State(state): State<ServiceState>,
    Json(request): Json<BestMatchRequest>,
) -> Result<Json<ServiceEnvelope<MatchResult>>, ServiceError> {
    let result = state.api.best_match(request).map_err(ServiceError::from_api)?;
    Ok(Json(envelope(result)))
}
