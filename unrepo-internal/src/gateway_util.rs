use std::sync::Arc;
use std::time::Duration;

use axum::extract::{rejection::JsonRejection, FromRequest, Json, Request};
use axum::routing::{delete, get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Client;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use tracing::instrument;

use crate::auth::{require_credential, CredentialGate};
use crate::clock::Clock;
use crate::config::Config;
use crate::credential::ServiceClass;
use crate::endpoints;
use crate::error::{Error, ErrorDetails};
use crate::observability::RouterExt;
use crate::quota::QuotaEngine;
use crate::store::{MemoryStore, Stores};

pub const REDIS_URL_ENV_VAR: &str = "UNREPO_REDIS_URL";

/// Upstream calls may run long (model inference), but never forever.
pub const DEFAULT_HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub http_client: Client,
    pub stores: Stores,
    pub engine: Arc<QuotaEngine>,
    pub metrics_handle: PrometheusHandle,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub fn new(
        config: Arc<Config>,
        stores: Stores,
        clock: Arc<dyn Clock>,
        metrics_handle: PrometheusHandle,
    ) -> Result<Self, Error> {
        let engine = Arc::new(QuotaEngine::new(&stores, &config, clock));
        Ok(Self {
            config,
            http_client: setup_http_client()?,
            stores,
            engine,
            metrics_handle,
        })
    }
}

/// Connects to Redis when `UNREPO_REDIS_URL` is set, otherwise falls back to a
/// process-local store.
pub async fn setup_stores(
    config: &Config,
    redis_url: Option<SecretString>,
) -> Result<Stores, Error> {
    match redis_url {
        Some(url) => Stores::redis(&url, &config.redis).await,
        None => {
            tracing::warn!(
                "`{REDIS_URL_ENV_VAR}` is not set; using the in-memory store. Quotas will not be shared across gateway instances and are lost on restart."
            );
            Ok(Stores::memory(MemoryStore::new()))
        }
    }
}

pub fn redis_url_from_env() -> Option<SecretString> {
    std::env::var(REDIS_URL_ENV_VAR)
        .ok()
        .filter(|url| !url.trim().is_empty())
        .map(SecretString::from)
}

pub fn setup_http_client() -> Result<Client, Error> {
    Client::builder()
        .timeout(DEFAULT_HTTP_CLIENT_TIMEOUT)
        .build()
        .map_err(|e| {
            Error::new(ErrorDetails::AppState {
                message: format!("Failed to build HTTP client: {e}"),
            })
        })
}

/// All routes, with the quota gate applied to the service routes.
pub fn build_router(app_state: AppStateData) -> Router {
    let analysis_routes = Router::new()
        .route("/v1/research", post(endpoints::services::analysis_handler))
        .route_layer(axum::middleware::from_fn_with_state(
            CredentialGate::new(app_state.engine.clone(), ServiceClass::Analysis),
            require_credential,
        ));

    let chat_routes = Router::new()
        .route("/v1/chatbot", post(endpoints::services::chat_handler))
        .route_layer(axum::middleware::from_fn_with_state(
            CredentialGate::new(app_state.engine.clone(), ServiceClass::Chat),
            require_credential,
        ));

    let key_routes = Router::new()
        .route(
            "/v1/keys",
            post(endpoints::keys::create_key_handler).get(endpoints::keys::list_keys_handler),
        )
        .route("/v1/keys/usage", get(endpoints::keys::usage_handler))
        .route("/v1/keys/{key_id}", delete(endpoints::keys::revoke_key_handler));

    let public_routes = Router::new()
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler))
        .route("/metrics", get(endpoints::status::metrics_handler));

    Router::new()
        .merge(analysis_routes)
        .merge(chat_routes)
        .merge(key_routes)
        .merge(public_routes)
        .fallback(endpoints::fallback::handle_404)
        .apply_http_trace_layer()
        .with_state(app_state)
}

/// JSON body extractor that reports the failing field path on bad input and does
/// not require a `Content-Type` header.
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = bytes::Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::InvalidRequest {
                message: format!("{} ({})", e, e.status()),
            })
        })?;

        let value = Json::<serde_json::Value>::from_bytes(&bytes)
            .map_err(|e| {
                Error::new(ErrorDetails::InvalidRequest {
                    message: format!("{} ({})", e, e.status()),
                })
            })?
            .0;

        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::InvalidRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}
