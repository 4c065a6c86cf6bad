//! Ragtime HTTP API
//!
//! Thin JSON transport over the engine. Every handler maps its request onto
//! one engine operation and reports failures as `{"error": message}` with the
//! status from [`RagtimeErrorExt::status_code`].
//!
//! # Endpoints
//!
//! - POST /api/start-experiment - Run an experiment end to end
//! - GET /api/experiments - List stored experiments
//! - GET /api/experiment/:name - One experiment document
//! - DELETE /api/delete-experiment/:name - Delete an experiment
//! - GET /api/experiment-results?path= - Experiment document by path
//! - GET /api/validation-sets - List validation sets
//! - GET /api/validation-set/:name - One validation set
//! - POST /api/save-validation-set - Store a validation set
//! - PUT /api/update-validation-set - Rename or rewrite a validation set
//! - DELETE /api/delete-validation-set/:name - Delete a validation set
//! - POST /api/generate-answers - Answer questions with one model
//! - POST /api/generate-facts - Extract facts from reference answers
//! - GET /api/available-models - Registered models
//! - GET /api/available-retrievers - Registered retrievers
//! - GET|POST /api/user/api-keys - Stored API keys
//! - GET /api/user/api-keys/availability - Which providers have a key
//! - POST /api/user/api-keys/refresh - Reload keys from the database
//! - GET /api/user/api-keys/default/:key_name - Environment value of a key
//! - GET /api/status - Server status

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use ragtime_engine::config::Config;
use ragtime_engine::db::ApiKey;
use ragtime_engine::pipeline::{items_to_qas, ExperimentConfig, Orchestrator, DEFAULT_MODEL};
use ragtime_engine::secrets::CredentialStore;
use ragtime_engine::store::validation::parse_file_name;
use ragtime_engine::store::{ExperimentStore, FileExperimentStore, ValidationSetStore};
use sdk::errors::{EngineError, RagtimeErrorExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    experiments: Arc<FileExperimentStore>,
    validation_sets: ValidationSetStore,
    credentials: Arc<CredentialStore>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        experiments: Arc<FileExperimentStore>,
        validation_sets: ValidationSetStore,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            orchestrator,
            experiments,
            validation_sets,
            credentials,
        }
    }

    /// File stores and default registries from `config`
    pub fn from_config(config: &Config, credentials: Arc<CredentialStore>) -> Self {
        let experiments = Arc::new(FileExperimentStore::new(&config.storage.experiments_dir));
        let validation_sets = ValidationSetStore::new(&config.storage.validation_sets_dir);
        let orchestrator = Orchestrator::new(
            experiments.clone(),
            validation_sets.clone(),
            Arc::new(ragtime_engine::llm::LLMRegistry::with_defaults(
                config,
                credentials.clone(),
            )),
            Arc::new(ragtime_engine::retriever::RetrieverRegistry::with_defaults(
                config,
                credentials.clone(),
            )),
        );
        Self::new(Arc::new(orchestrator), experiments, validation_sets, credentials)
    }
}

/// Engine error carried to the client
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `Json` body whose rejection is reported like any other bad request
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError(EngineError::Config(rejection.body_text())))?;
        Ok(Self(value))
    }
}

fn bad_request(message: &str) -> ApiError {
    ApiError(EngineError::Config(message.to_string()))
}

/// Build the router with all endpoints
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/start-experiment", post(start_experiment))
        .route("/api/experiments", get(list_experiments))
        .route("/api/experiment/:name", get(get_experiment))
        .route("/api/delete-experiment/:name", delete(delete_experiment))
        .route("/api/experiment-results", get(experiment_results))
        .route("/api/validation-sets", get(list_validation_sets))
        .route("/api/validation-set/:name", get(get_validation_set))
        .route("/api/save-validation-set", post(save_validation_set))
        .route("/api/update-validation-set", put(update_validation_set))
        .route(
            "/api/delete-validation-set/:name",
            delete(delete_validation_set),
        )
        .route("/api/generate-answers", post(generate_answers))
        .route("/api/generate-facts", post(generate_facts))
        .route("/api/available-models", get(available_models))
        .route("/api/available-retrievers", get(available_retrievers))
        .route("/api/user/api-keys", get(list_api_keys).post(save_api_keys))
        .route("/api/user/api-keys/availability", get(key_availability))
        .route("/api/user/api-keys/refresh", post(refresh_api_keys))
        .route("/api/user/api-keys/default/:key_name", get(default_api_key))
        .route("/api/status", get(status_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            refresh_credentials,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Reload stored API keys so keys saved by another process are picked up
async fn refresh_credentials(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Err(e) = state.credentials.refresh().await {
        tracing::warn!("Could not refresh API keys: {}", e);
    }
    next.run(request).await
}

async fn start_experiment(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<Value>,
) -> ApiResult<Json<Value>> {
    let config = ExperimentConfig::from_json(body)?;
    let results_path = state.orchestrator.run(&config).await?;
    Ok(Json(json!({
        "message": "Experiment completed successfully",
        "results_path": results_path,
    })))
}

async fn list_experiments(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let summaries = state.experiments.summaries().await?;
    Ok(Json(json!(summaries)))
}

async fn get_experiment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.experiments.load_value(&name).await?))
}

async fn delete_experiment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    state.experiments.delete(&name).await?;
    Ok(Json(json!({ "message": "Experiment deleted successfully" })))
}

#[derive(Debug, Deserialize)]
struct ResultsQuery {
    path: Option<String>,
}

async fn experiment_results(
    State(state): State<AppState>,
    Query(query): Query<ResultsQuery>,
) -> ApiResult<Json<Value>> {
    let path = query
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| bad_request("No results path provided"))?;
    Ok(Json(state.experiments.load_path(&PathBuf::from(path)).await?))
}

async fn list_validation_sets(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let summaries = state.validation_sets.list().await?;
    Ok(Json(json!(summaries)))
}

async fn get_validation_set(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.validation_sets.load(&name).await?))
}

async fn save_validation_set(
    State(state): State<AppState>,
    ApiJson(document): ApiJson<Value>,
) -> ApiResult<Json<Value>> {
    let path = state.validation_sets.save(&document).await?;
    Ok(Json(json!({
        "message": "Validation set saved successfully",
        "path": path,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateValidationSetRequest {
    data: Option<Value>,
    new_filename: Option<String>,
    old_filename: Option<String>,
}

/// Set name from a requested file name, with or without the count suffix
fn set_name(file_name: &str) -> String {
    let file_name = file_name.trim();
    match parse_file_name(file_name) {
        Some((name, _, _)) => name,
        None => file_name.trim_end_matches(".json").to_string(),
    }
}

async fn update_validation_set(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<UpdateValidationSetRequest>,
) -> ApiResult<Json<Value>> {
    let (Some(data), Some(new_filename), Some(old_filename)) =
        (request.data, request.new_filename, request.old_filename)
    else {
        return Err(bad_request("Missing data, new filename, or old filename"));
    };
    let items = match data.get("items") {
        Some(Value::Array(items)) => items.clone(),
        _ => return Err(bad_request("Validation set must contain items")),
    };

    let path = state
        .validation_sets
        .rename(&set_name(&old_filename), &set_name(&new_filename), items)
        .await?;
    Ok(Json(json!({
        "message": "File updated successfully",
        "path": path,
    })))
}

async fn delete_validation_set(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    state.validation_sets.delete(&set_name(&name)).await?;
    Ok(Json(json!({ "message": "Validation set deleted successfully" })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(default)]
    items: Option<Vec<Value>>,

    /// Single question, as `{"text": ...}`
    #[serde(default)]
    question: Option<Value>,

    #[serde(default)]
    model: Option<String>,

    #[serde(default)]
    use_retriever: bool,

    #[serde(default)]
    retriever_type: Option<String>,
}

impl GenerateRequest {
    fn model(&self) -> &str {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MODEL)
    }
}

async fn generate_answers(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<GenerateRequest>,
) -> ApiResult<Json<Value>> {
    let items = match (&request.items, &request.question) {
        (Some(items), _) => items.clone(),
        (None, Some(question)) => vec![json!({ "question": question })],
        (None, None) => return Err(bad_request("Invalid request format")),
    };
    let qas = items_to_qas(items)?;

    let expe = state
        .orchestrator
        .generate_answers(
            qas,
            request.model(),
            request.use_retriever,
            request.retriever_type.as_deref(),
        )
        .await?;

    let items: Vec<Value> = expe
        .items
        .iter()
        .map(|qa| json!({ "question": qa.question, "answers": qa.answers }))
        .collect();
    Ok(Json(json!({ "items": items })))
}

async fn generate_facts(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<GenerateRequest>,
) -> ApiResult<Json<Value>> {
    let Some(items) = request.items.clone() else {
        return Err(bad_request("Invalid request format"));
    };
    let qas = items_to_qas(items)?;

    let expe = state
        .orchestrator
        .generate_facts(qas, request.model())
        .await?;

    let items: Vec<Value> = expe
        .items
        .iter()
        .map(|qa| json!({ "question": qa.question, "facts": qa.facts }))
        .collect();
    Ok(Json(json!({ "items": items })))
}

async fn available_models(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.orchestrator.llms().describe()))
}

async fn available_retrievers(State(state): State<AppState>) -> Json<Value> {
    let names: Vec<String> = state
        .orchestrator
        .retrievers()
        .describe()
        .into_iter()
        .map(|info| info.name)
        .collect();
    Json(json!(names))
}

async fn list_api_keys(State(state): State<AppState>) -> Json<Value> {
    let keys: Vec<Value> = state
        .credentials
        .stored()
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value.unsecure() }))
        .collect();
    Json(json!(keys))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveApiKeysRequest {
    #[serde(default)]
    api_keys: Vec<ApiKey>,

    #[serde(default)]
    deleted_keys: Vec<String>,
}

async fn save_api_keys(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SaveApiKeysRequest>,
) -> ApiResult<Json<Value>> {
    state
        .credentials
        .replace_all(&request.api_keys, &request.deleted_keys)
        .await?;
    Ok(Json(json!({ "message": "API keys saved and deleted successfully" })))
}

async fn key_availability(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.credentials.availability()))
}

async fn refresh_api_keys(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.credentials.refresh().await?;
    Ok(Json(json!(state.credentials.availability())))
}

async fn default_api_key(
    State(state): State<AppState>,
    Path(key_name): Path<String>,
) -> Json<Value> {
    let value = state.credentials.default_value(&key_name).unwrap_or_default();
    Json(json!({ "value": value }))
}

async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "models": state.orchestrator.llms().describe().len(),
        "retrievers": state.orchestrator.retrievers().describe().len(),
    }))
}
