use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::credential::ServiceClass;
use crate::quota::{Grant, QuotaEngine, QuotaVerdict};
use crate::rate_limit::RateLimitHeaders;

pub const API_KEY_HEADER: &str = "x-api-key";
/// Set by the session layer in front of the gateway for key-management routes.
pub const ACCOUNT_ID_HEADER: &str = "x-unrepo-account-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

fn auth_error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": status.as_u16()
        }
    });
    (status, axum::Json(body)).into_response()
}

/// `x-api-key` wins over `Authorization: Bearer`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
    {
        return Some(key.to_string());
    }
    let value = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?
        .trim();
    let key = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim();
    (!key.is_empty()).then(|| key.to_string())
}

/// Renders a denied verdict with its status, message and rate headers.
pub fn denial_response(verdict: &QuotaVerdict, headers: &RateLimitHeaders) -> Response {
    let Some(reason) = verdict.reason else {
        return auth_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Allowed verdict rendered as a denial",
        );
    };
    let mut response =
        auth_error_response(reason.status_code(), reason.error_type(), reason.message());
    if verdict.limit.is_some() {
        response.headers_mut().extend(headers.to_header_map());
    }
    response
}

/// Audit metadata stored with the usage record. The caller's `x-request-id`
/// is kept when present, otherwise a fresh id is assigned.
pub fn request_metadata(request: &Request) -> serde_json::Value {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map_or_else(|| Uuid::now_v7().to_string(), str::to_string);
    serde_json::json!({
        "method": request.method().as_str(),
        "request_id": request_id,
    })
}

/// The outcome of a successful check, available to handlers as a request extension.
#[derive(Debug, Clone)]
pub struct Authorized {
    pub grant: Grant,
    pub headers: RateLimitHeaders,
}

/// State for [`require_credential`]: which service class the wrapped routes serve.
#[derive(Clone)]
pub struct CredentialGate {
    pub engine: Arc<QuotaEngine>,
    pub service_class: ServiceClass,
}

impl CredentialGate {
    pub fn new(engine: Arc<QuotaEngine>, service_class: ServiceClass) -> Self {
        Self {
            engine,
            service_class,
        }
    }
}

/// Runs the quota decision for the presented key. Denials and store failures
/// short-circuit; the wrapped handler only runs for allowed calls.
pub async fn require_credential(
    State(gate): State<CredentialGate>,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let Some(key) = extract_api_key(request.headers()) else {
        return Err(auth_error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            "API key is required in x-api-key header",
        ));
    };
    let route = request.uri().path().to_string();
    let metadata = request_metadata(&request);

    let verdict = gate
        .engine
        .check_and_record_with_metadata(&key, gate.service_class, &route, Some(metadata))
        .await
        .map_err(IntoResponse::into_response)?;
    let headers = verdict.headers(gate.engine.clock().now());

    let Some(grant) = verdict.grant.clone().filter(|_| verdict.allowed) else {
        tracing::debug!(
            route = %route,
            reason = ?verdict.reason,
            "request denied"
        );
        return Err(denial_response(&verdict, &headers));
    };

    tracing::debug!(
        route = %route,
        credential_id = %grant.credential_id,
        tier = %grant.tier,
        remaining = %verdict.remaining,
        "request authorized"
    );
    request.extensions_mut().insert(Authorized {
        grant,
        headers: headers.clone(),
    });

    let mut response = next.run(request).await;
    response.headers_mut().extend(headers.to_header_map());
    Ok(response)
}

/// The caller's account, read from [`ACCOUNT_ID_HEADER`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for AccountId {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(ACCOUNT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| AccountId(id.to_string()))
            .ok_or_else(|| {
                auth_error_response(
                    StatusCode::UNAUTHORIZED,
                    "invalid_request_error",
                    "Unauthorized",
                )
            })
    }
}
