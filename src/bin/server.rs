//! Repfit development API server
//!
//! Accepts the changes the `repfit` CLI drains from its offline queue and
//! assigns server ids to newly created entities. Everything is kept in
//! memory, so a restart forgets all data.
//!
//! # Configuration
//!
//! Environment variables:
//! - `REPFIT_PORT`: Port to listen on (default: 8080)
//! - `REPFIT_SERVER_CONFIG`: Path to config file (default: ~/.config/repfit-server/config.yaml)
//!
//! # Config File Format
//!
//! ```yaml
//! api_keys:
//!   - key: "your-secret-key-here"
//!     name: "phone"
//! ```
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint (no auth required)
//! - `POST /{collection}`: Create an entity, the response carries its new `id`
//! - `GET /{collection}/{id}`: Fetch an entity
//! - `PUT /{collection}/{id}`: Replace an entity
//! - `DELETE /{collection}/{id}`: Delete an entity
//!
//! Collections: `routines`, `routine-exercises`, `sets`, `sessions`,
//! `food-entries`, `custom-products`, `custom-meals`.

use axum::{
    extract::{rejection::JsonRejection, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use repfit_core::{is_temporary, Entity, EntityKind};

// ============================================================================
// Configuration
// ============================================================================

/// API key entry in config
#[derive(Debug, Clone, Deserialize)]
struct ApiKeyEntry {
    key: String,
    name: String,
}

/// Config file structure
#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    api_keys: Vec<ApiKeyEntry>,
}

/// Server configuration
#[derive(Debug, Clone)]
struct Config {
    /// Port to listen on
    port: u16,
    /// Path to config file
    config_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("REPFIT_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let config_path = std::env::var("REPFIT_SERVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("repfit-server")
                    .join("config.yaml")
            });

        Self { port, config_path }
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Authenticated client, added to request extensions after auth
#[derive(Debug, Clone)]
struct AuthClient {
    name: String,
}

/// API key store - maps key -> client
#[derive(Debug, Clone, Default)]
struct ApiKeyStore {
    keys: HashMap<String, AuthClient>,
}

impl ApiKeyStore {
    fn from_entries(entries: Vec<ApiKeyEntry>) -> Self {
        let keys = entries
            .into_iter()
            .map(|entry| (entry.key, AuthClient { name: entry.name }))
            .collect();
        Self { keys }
    }

    /// Load API keys from config file
    fn load(config_path: &FsPath) -> Self {
        let store = match std::fs::read_to_string(config_path) {
            Ok(contents) => match serde_yaml::from_str::<ConfigFile>(&contents) {
                Ok(config) => Self::from_entries(config.api_keys),
                Err(e) => {
                    tracing::warn!("Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read config file {}: {}",
                    config_path.display(),
                    e
                );
                Self::default()
            }
        };

        if store.keys.is_empty() {
            tracing::warn!("No API keys loaded - all authenticated requests will fail");
        } else {
            tracing::info!("Loaded {} API key(s)", store.keys.len());
        }
        store
    }

    fn validate(&self, key: &str) -> Option<AuthClient> {
        self.keys.get(key).cloned()
    }
}

// ============================================================================
// Storage
// ============================================================================

/// In-memory entity collections. Ids are sequential integers rendered as
/// strings.
#[derive(Default)]
struct Collections {
    next_id: AtomicU64,
    entities: RwLock<HashMap<EntityKind, HashMap<String, Value>>>,
}

impl Collections {
    fn assign_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    api_keys: Arc<ApiKeyStore>,
    collections: Arc<Collections>,
}

impl AppState {
    fn new(api_keys: ApiKeyStore) -> Self {
        Self {
            api_keys: Arc::new(api_keys),
            collections: Arc::new(Collections::default()),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error response body
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

enum ApiError {
    Unauthorized(&'static str, &'static str),
    NotFound(String),
    Unprocessable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized(error, message) => {
                (StatusCode::UNAUTHORIZED, error, message.to_string())
            }
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            ApiError::Unprocessable(message) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid_body", message)
            }
        };
        (status, Json(ErrorBody { error, message })).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Unprocessable(rejection.body_text())
    }
}

/// Authentication middleware
async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let api_key = match auth_header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        Some(_) => {
            return ApiError::Unauthorized(
                "invalid_auth",
                "Authorization header must use Bearer scheme",
            )
            .into_response();
        }
        None => {
            return ApiError::Unauthorized("missing_auth", "Authorization header required")
                .into_response();
        }
    };

    match state.api_keys.validate(api_key) {
        Some(client) => {
            request.extensions_mut().insert(client);
            next.run(request).await
        }
        None => ApiError::Unauthorized("invalid_key", "Invalid API key").into_response(),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint (no auth required)
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn collection_kind(collection: &str) -> Result<EntityKind, ApiError> {
    EntityKind::from_collection(collection)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown collection: {}", collection)))
}

/// Check a body against the entity model and return its canonical form.
fn validate(kind: EntityKind, body: Value, id: &str) -> Result<Value, ApiError> {
    let Value::Object(mut fields) = body else {
        return Err(ApiError::Unprocessable(
            "Body must be a JSON object".to_string(),
        ));
    };
    fields.insert("id".to_string(), Value::String(id.to_string()));

    let entity: Entity = serde_json::from_value(json!({ "type": kind.as_str(), "data": fields }))
        .map_err(|e| ApiError::Unprocessable(format!("Invalid {}: {}", kind, e)))?;

    if let Some(temp) = entity.references().into_iter().find(|r| is_temporary(r)) {
        return Err(ApiError::Unprocessable(format!(
            "Unresolved temporary id: {}",
            temp
        )));
    }
    Ok(entity.to_body())
}

async fn create_entity(
    State(state): State<AppState>,
    Extension(client): Extension<AuthClient>,
    Path(collection): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let kind = collection_kind(&collection)?;
    let Json(body) = body?;

    let id = state.collections.assign_id();
    let stored = validate(kind, body, &id)?;

    state
        .collections
        .entities
        .write()
        .await
        .entry(kind)
        .or_default()
        .insert(id.clone(), stored.clone());

    tracing::info!(client = %client.name, "Created {} {}", kind, id);
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_entity(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let kind = collection_kind(&collection)?;
    let entities = state.collections.entities.read().await;

    entities
        .get(&kind)
        .and_then(|items| items.get(&id))
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("{} not found: {}", kind, id)))
}

async fn update_entity(
    State(state): State<AppState>,
    Extension(client): Extension<AuthClient>,
    Path((collection, id)): Path<(String, String)>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let kind = collection_kind(&collection)?;
    if is_temporary(&id) {
        return Err(ApiError::Unprocessable(format!(
            "Unresolved temporary id: {}",
            id
        )));
    }
    let Json(body) = body?;
    let stored = validate(kind, body, &id)?;

    let mut entities = state.collections.entities.write().await;
    let slot = entities
        .get_mut(&kind)
        .and_then(|items| items.get_mut(&id))
        .ok_or_else(|| ApiError::NotFound(format!("{} not found: {}", kind, id)))?;
    *slot = stored.clone();

    tracing::info!(client = %client.name, "Updated {} {}", kind, id);
    Ok(Json(stored))
}

async fn delete_entity(
    State(state): State<AppState>,
    Extension(client): Extension<AuthClient>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let kind = collection_kind(&collection)?;

    let removed = state
        .collections
        .entities
        .write()
        .await
        .get_mut(&kind)
        .and_then(|items| items.remove(&id));

    match removed {
        Some(_) => {
            tracing::info!(client = %client.name, "Deleted {} {}", kind, id);
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(ApiError::NotFound(format!("{} not found: {}", kind, id))),
    }
}

fn app(state: AppState) -> Router {
    // Public routes (no auth)
    let public_routes = Router::new().route("/health", get(health));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/{collection}", post(create_entity))
        .route(
            "/{collection}/{id}",
            get(get_entity).put(update_entity).delete(delete_entity),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "repfit_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!("Config file: {}", config.config_path.display());

    let state = AppState::new(ApiKeyStore::load(&config.config_path));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app(state)).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    const KEY: &str = "test-key";

    fn test_state() -> AppState {
        AppState::new(ApiKeyStore::from_entries(vec![ApiKeyEntry {
            key: KEY.to_string(),
            name: "tests".to_string(),
        }]))
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> HttpRequest<Body> {
        let builder = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", KEY));
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(state: &AppState, request: HttpRequest<Body>) -> (StatusCode, Value) {
        let response = app(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn routine_body(title: &str) -> Value {
        json!({ "title": title, "updated_at": "2025-06-01T10:00:00Z" })
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let response = app(test_state())
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_requires_bearer_key() {
        let state = test_state();
        let missing = HttpRequest::post("/routines")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(routine_body("Leg Day").to_string()))
            .unwrap();
        let (status, body) = send(&state, missing).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_auth");

        let wrong = HttpRequest::post("/routines")
            .header(header::AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&state, wrong).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_key");
    }

    #[tokio::test]
    async fn test_create_assigns_id() {
        let state = test_state();

        let (status, body) = send(
            &state,
            request("POST", "/routines", Some(routine_body("Leg Day"))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], "1");
        assert_eq!(body["title"], "Leg Day");

        let (status, body) = send(&state, request("GET", "/routines/1", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Leg Day");
    }

    #[test]
    fn test_every_entity_kind_has_a_collection() {
        for kind in EntityKind::ALL {
            assert_eq!(collection_kind(kind.collection()).ok(), Some(kind));
        }
        assert!(collection_kind("routine_exercises").is_err());
    }

    #[tokio::test]
    async fn test_unknown_collection_is_not_found() {
        let (status, _) = send(
            &test_state(),
            request("POST", "/dishes", Some(routine_body("Leg Day"))),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_bodies_are_unprocessable() {
        let state = test_state();

        let (status, _) = send(
            &state,
            request("POST", "/routines", Some(json!({ "name": "no title" }))),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let not_json = HttpRequest::post("/routines")
            .header(header::AUTHORIZATION, format!("Bearer {}", KEY))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{oops"))
            .unwrap();
        let (status, body) = send(&state, not_json).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "invalid_body");
    }

    #[tokio::test]
    async fn test_temporary_references_are_rejected() {
        let body = json!({
            "routine_id": "local_0123456789abcdef0123456789abcdef",
            "name": "Squat",
            "position": 0,
            "updated_at": "2025-06-01T10:00:00Z"
        });
        let (status, body) = send(
            &test_state(),
            request("POST", "/routine-exercises", Some(body)),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("temporary id"));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let state = test_state();

        let (status, _) = send(
            &state,
            request("PUT", "/routines/9", Some(routine_body("Push Day"))),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        send(
            &state,
            request("POST", "/routines", Some(routine_body("Leg Day"))),
        )
        .await;
        let (status, body) = send(
            &state,
            request("PUT", "/routines/1", Some(routine_body("Leg Day II"))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Leg Day II");
        assert_eq!(body["id"], "1");

        let (status, _) = send(&state, request("DELETE", "/routines/1", None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&state, request("DELETE", "/routines/1", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_engine_drains_into_server() {
        use repfit_core::{
            HttpRemoteClient, LocalStore, ManualNetworkMonitor, Operation, RoutineExercise,
            Routine, SyncEngine, SyncSettings,
        };
        use std::time::Duration;

        let state = test_state();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = LocalStore::open(temp_dir.path().join("test.db")).await.unwrap();
        let remote = HttpRemoteClient::new(
            format!("http://{}", addr),
            Some(KEY.to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        let engine = SyncEngine::new(
            store,
            remote,
            ManualNetworkMonitor::default(),
            SyncSettings::default(),
        );

        let routine = Routine::new("Leg Day");
        let exercise = RoutineExercise::new(routine.id.clone(), "Squat");
        engine.queue().record(Operation::create(routine)).await.unwrap();
        engine.queue().record(Operation::create(exercise)).await.unwrap();

        let report = engine.drain().await;
        assert_eq!(report.success, 2);
        assert_eq!(report.failed, 0);
        assert!(engine.queue().is_empty().await.unwrap());

        let entities = state.collections.entities.read().await;
        let exercises = &entities[&EntityKind::RoutineExercise];
        assert_eq!(exercises.len(), 1);
        let stored = exercises.values().next().unwrap();
        assert_eq!(stored["routine_id"], "1");
    }
}
