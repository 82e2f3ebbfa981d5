use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::json;

pub async fn handle_404(uri: Uri) -> Response {
    tracing::debug!(path = %uri.path(), "no route matched");
    (
        StatusCode::NOT_FOUND,
        axum::Json(json!({
            "error": {
                "message": format!("Route not found: {}", uri.path()),
                "type": "not_found_error",
                "code": "route_not_found"
            }
        })),
    )
        .into_response()
}
