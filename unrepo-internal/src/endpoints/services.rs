//! The gated service routes. By the time a handler runs, `require_credential`
//! has already counted the call, so the handler only forwards it.

use axum::extract::{Extension, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use crate::auth::{Authorized, ACCOUNT_ID_HEADER};
use crate::credential::ServiceClass;
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData, StructuredJson};

pub const CREDENTIAL_ID_HEADER: &str = "x-unrepo-credential-id";
pub const TIER_HEADER: &str = "x-unrepo-tier";

/// POST /v1/research
pub async fn analysis_handler(
    State(app_state): AppState,
    Extension(authorized): Extension<Authorized>,
    StructuredJson(body): StructuredJson<Value>,
) -> Result<Response, Error> {
    forward(&app_state, ServiceClass::Analysis, &authorized, body).await
}

/// POST /v1/chatbot
pub async fn chat_handler(
    State(app_state): AppState,
    Extension(authorized): Extension<Authorized>,
    StructuredJson(body): StructuredJson<Value>,
) -> Result<Response, Error> {
    forward(&app_state, ServiceClass::Chat, &authorized, body).await
}

async fn forward(
    app_state: &AppStateData,
    service_class: ServiceClass,
    authorized: &Authorized,
    body: Value,
) -> Result<Response, Error> {
    let url = app_state
        .config
        .upstreams
        .for_class(service_class)
        .ok_or_else(|| {
            Error::new(ErrorDetails::UpstreamNotConfigured {
                service_class: service_class.to_string(),
            })
        })?;

    let grant = &authorized.grant;
    let response = app_state
        .http_client
        .post(url.clone())
        .header(ACCOUNT_ID_HEADER, grant.account_id.as_str())
        .header(CREDENTIAL_ID_HEADER, grant.credential_id.as_str())
        .header(TIER_HEADER, grant.tier.as_ref())
        .json(&body)
        .send()
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::Upstream {
                message: e.to_string(),
                status_code: None,
            })
        })?;

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response.headers().get(http::header::CONTENT_TYPE).cloned();
    let bytes = response.bytes().await.map_err(|e| {
        Error::new(ErrorDetails::Upstream {
            message: format!("Failed to read upstream response: {e}"),
            status_code: None,
        })
    })?;

    if !status.is_success() {
        tracing::warn!(
            status = %status,
            service_class = %service_class,
            credential_id = %grant.credential_id,
            "upstream returned an error"
        );
    }

    let mut response = (status, bytes).into_response();
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        content_type.unwrap_or_else(|| HeaderValue::from_static("application/json")),
    );
    Ok(response)
}
