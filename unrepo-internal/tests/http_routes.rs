use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::{json, Value};
use tower::ServiceExt;
use unrepo_internal::clock::ManualClock;
use unrepo_internal::config::Config;
use unrepo_internal::credential::{
    CreateOutcome, Credential, CredentialStore, NewCredential, ServiceClass,
};
use unrepo_internal::error::{Error, ErrorDetails};
use unrepo_internal::gateway_util::{build_router, AppStateData};
use unrepo_internal::quota::QUOTA_DECISIONS_METRIC;
use unrepo_internal::store::{MemoryStore, Stores};

fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

async fn echo_upstream(headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    let account = headers
        .get("x-unrepo-account-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let tier = headers
        .get("x-unrepo-tier")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Json(json!({ "echo": body, "account": account, "tier": tier }))
}

async fn spawn_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/v1/research", post(echo_upstream))
        .route("/v1/chatbot", post(echo_upstream));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn upstream_config() -> Config {
    let upstream = spawn_upstream().await;
    Config::from_toml_str(&format!(
        r#"
[upstreams]
analysis = "http://{upstream}/v1/research"
chat = "http://{upstream}/v1/chatbot"
"#
    ))
    .unwrap()
}

async fn app_with_upstream() -> (Router, AppStateData) {
    app_with_stores(upstream_config().await, Stores::memory(MemoryStore::new()))
}

fn app_with_stores(config: Config, stores: Stores) -> (Router, AppStateData) {
    let handle = PrometheusBuilder::new().build_recorder().handle();
    app_with_metrics(config, stores, handle)
}

fn app_with_metrics(
    config: Config,
    stores: Stores,
    metrics_handle: PrometheusHandle,
) -> (Router, AppStateData) {
    let mut state = AppStateData::new(
        Arc::new(config),
        stores,
        Arc::new(ManualClock::new(start())),
        metrics_handle,
    )
    .unwrap();
    state.http_client = reqwest::Client::builder().no_proxy().build().unwrap();
    (build_router(state.clone()), state)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response: Response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

fn decision_count(rendered: &str, reason: &str) -> u64 {
    let label = format!("reason=\"{reason}\"");
    rendered
        .lines()
        .filter(|line| line.starts_with(QUOTA_DECISIONS_METRIC) && line.contains(&label))
        .filter_map(|line| line.rsplit(' ').next()?.parse::<u64>().ok())
        .sum()
}

fn create_key(account: &str, key_type: &str, name: &str) -> Request<Body> {
    Request::post("/v1/keys")
        .header("x-unrepo-account-id", account)
        .header("content-type", "application/json")
        .body(Body::from(json!({ "type": key_type, "name": name }).to_string()))
        .unwrap()
}

fn call_service(path: &str, token: &str) -> Request<Body> {
    Request::post(path)
        .header("x-api-key", token)
        .body(Body::from(json!({ "query": "market cap of unrepo" }).to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_key_lifecycle_and_free_tier_exhaustion() {
    let (router, _) = app_with_upstream().await;

    let (status, _, created) = send(&router, create_key("acct_1", "ANALYSIS", "  research ")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["name"], "research");
    assert_eq!(created["type"], "ANALYSIS");
    let token = created["key"].as_str().unwrap().to_string();
    assert!(token.starts_with("unrepo_analysis_"));

    let (status, _, again) = send(&router, create_key("acct_1", "ANALYSIS", "other")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["key"], created["key"]);
    assert_eq!(again["created"], false);

    for expected in ["4", "3", "2", "1", "0"] {
        let (status, headers, body) = send(&router, call_service("/v1/research", &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "5");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), expected);
        assert!(headers.get("x-ratelimit-reset").is_none());
        assert_eq!(body["echo"]["query"], "market cap of unrepo");
        assert_eq!(body["account"], "acct_1");
        assert_eq!(body["tier"], "free");
    }

    let (status, headers, body) = send(&router, call_service("/v1/research", &token)).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
    assert_eq!(body["error"]["type"], "insufficient_quota");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Upgrade to continue"));

    let usage_request = Request::get("/v1/keys/usage")
        .header("x-unrepo-account-id", "acct_1")
        .body(Body::empty())
        .unwrap();
    let (status, _, usage) = send(&router, usage_request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(usage["total_requests"], 5);
    assert_eq!(usage["requests_last_24h"], 5);
    assert_eq!(usage["active_keys"], 1);
    assert_eq!(usage["by_route"][0]["route"], "/v1/research");
    assert_eq!(usage["by_route"][0]["method"], "POST");
    assert_eq!(usage["by_route"][0]["count"], 5);
}

#[tokio::test]
async fn test_upgrade_switches_to_premium_window_headers() {
    let (router, state) = app_with_upstream().await;
    let (_, _, created) = send(&router, create_key("acct_2", "CHAT", "bot")).await;
    let token = created["key"].as_str().unwrap().to_string();

    state
        .engine
        .tiers()
        .set_payment_verified("acct_2", true)
        .await
        .unwrap();

    let (status, headers, body) = send(&router, call_service("/v1/chatbot", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tier"], "premium");
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "200");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "199");
    let reset = (start() + chrono::Duration::hours(1)).timestamp().to_string();
    assert_eq!(headers.get("x-ratelimit-reset").unwrap(), reset.as_str());

    let list_request = Request::get("/v1/keys")
        .header("x-unrepo-account-id", "acct_2")
        .body(Body::empty())
        .unwrap();
    let (status, _, listing) = send(&router, list_request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["account"]["tier"], "premium");
    assert_eq!(listing["account"]["payment_verified"], true);
    assert_eq!(listing["keys"][0]["usage_count"], 1);
    let masked = listing["keys"][0]["masked_key"].as_str().unwrap();
    assert_ne!(masked, token);
    assert!(masked.contains("..."));
}

#[tokio::test]
async fn test_denials_map_to_distinct_statuses() {
    let (router, _) = app_with_upstream().await;
    let (_, _, created) = send(&router, create_key("acct_3", "CHAT", "bot")).await;
    let chat_token = created["key"].as_str().unwrap().to_string();

    let missing = Request::post("/v1/research").body(Body::empty()).unwrap();
    let (status, _, body) = send(&router, missing).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        body["error"]["message"],
        "API key is required in x-api-key header"
    );

    let (status, _, body) = send(&router, call_service("/v1/research", "sk-not-ours")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["message"], "Invalid API key format");

    let (status, _, body) = send(&router, call_service("/v1/research", &chat_token)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body["error"]["message"],
        "This API key is not valid for this service"
    );

    let bearer = Request::post("/v1/chatbot")
        .header("authorization", format!("Bearer {chat_token}"))
        .body(Body::from("{}"))
        .unwrap();
    let (status, _, _) = send(&router, bearer).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_revoke_requires_ownership() {
    let (router, _) = app_with_upstream().await;
    let (_, _, created) = send(&router, create_key("acct_4", "CHAT", "bot")).await;
    let id = created["id"].as_str().unwrap().to_string();
    let token = created["key"].as_str().unwrap().to_string();

    let foreign = Request::delete(format!("/v1/keys/{id}"))
        .header("x-unrepo-account-id", "someone_else")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&router, foreign).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let own = Request::delete(format!("/v1/keys/{id}"))
        .header("x-unrepo-account-id", "acct_4")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&router, own).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked"], true);

    let (status, _, body) = send(&router, call_service("/v1/chatbot", &token)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        body["error"]["message"],
        "Invalid, inactive, or expired API key"
    );

    let (status, _, replacement) = send(&router, create_key("acct_4", "CHAT", "bot 2")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_ne!(replacement["key"], created["key"]);
}

#[tokio::test]
async fn test_key_requests_are_validated() {
    let (router, _) = app_with_upstream().await;

    let anonymous = Request::post("/v1/keys")
        .body(Body::from(json!({ "type": "CHAT", "name": "x" }).to_string()))
        .unwrap();
    let (status, _, _) = send(&router, anonymous).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, body) = send(&router, create_key("acct_5", "VIDEO", "x")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let (status, _, _) = send(&router, create_key("acct_5", "CHAT", "   ")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing_name = Request::post("/v1/keys")
        .header("x-unrepo-account-id", "acct_5")
        .body(Body::from(json!({ "type": "CHAT" }).to_string()))
        .unwrap();
    let (status, _, body) = send(&router, missing_name).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("name"));
}

fn get(path: &str) -> Request<Body> {
    Request::get(path).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_status_health_metrics_and_fallback() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let _guard = metrics::set_default_local_recorder(&recorder);
    let (router, _) = app_with_metrics(
        upstream_config().await,
        Stores::memory(MemoryStore::new()),
        recorder.handle(),
    );

    let (status, _, body) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (_, _, created) = send(&router, create_key("acct_6", "CHAT", "bot")).await;
    let token = created["key"].as_str().unwrap().to_string();
    send(&router, call_service("/v1/chatbot", &token)).await;
    send(&router, call_service("/v1/research", &token)).await;

    let (status, _, body) = send(&router, get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store_backend"], "memory");
    assert_eq!(body["rate_limiter"]["checks"], 1);

    let response = router.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let rendered = String::from_utf8(bytes.to_vec()).unwrap();
    assert_eq!(decision_count(&rendered, "allowed"), 1);
    assert_eq!(decision_count(&rendered, "wrong_credential_class"), 1);

    let (status, _, body) = send(&router, get("/v2/nothing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "route_not_found");
}

#[tokio::test]
async fn test_allowed_call_without_upstream_is_service_unavailable() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let _guard = metrics::set_default_local_recorder(&recorder);
    let (router, _) = app_with_metrics(
        Config::default(),
        Stores::memory(MemoryStore::new()),
        recorder.handle(),
    );
    let (_, _, created) = send(&router, create_key("acct_7", "ANALYSIS", "x")).await;
    let token = created["key"].as_str().unwrap().to_string();

    let (status, _, body) = send(&router, call_service("/v1/research", &token)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "upstream_not_configured");
    assert_eq!(decision_count(&recorder.handle().render(), "allowed"), 1);
}

/// Delegates to a memory store, but lookups fail or stall on demand.
struct FlakyCredentials {
    inner: MemoryStore,
    delay: Option<StdDuration>,
    fail: bool,
}

#[async_trait]
impl CredentialStore for FlakyCredentials {
    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<Credential>, Error> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(Error::new(ErrorDetails::Store {
                message: "connection refused".to_string(),
            }));
        }
        self.inner.find_by_token_hash(token_hash).await
    }

    async fn get(&self, credential_id: &str) -> Result<Option<Credential>, Error> {
        CredentialStore::get(&self.inner, credential_id).await
    }

    async fn create(&self, new: NewCredential, now: DateTime<Utc>) -> Result<CreateOutcome, Error> {
        self.inner.create(new, now).await
    }

    async fn record_use(&self, credential_id: &str, now: DateTime<Utc>) -> Result<u64, Error> {
        self.inner.record_use(credential_id, now).await
    }

    async fn try_record_use(
        &self,
        credential_id: &str,
        cap: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, Error> {
        self.inner.try_record_use(credential_id, cap, now).await
    }

    async fn deactivate(&self, credential_id: &str, account_id: &str) -> Result<bool, Error> {
        self.inner.deactivate(credential_id, account_id).await
    }

    async fn list_for_account(&self, account_id: &str) -> Result<Vec<Credential>, Error> {
        self.inner.list_for_account(account_id).await
    }
}

fn flaky_stores(delay: Option<StdDuration>, fail: bool) -> Stores {
    let memory = MemoryStore::new();
    let mut stores = Stores::memory(memory.clone());
    stores.credentials = Arc::new(FlakyCredentials {
        inner: memory,
        delay,
        fail,
    });
    stores
}

#[tokio::test]
async fn test_store_failure_is_retryable_not_a_denial() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let _guard = metrics::set_default_local_recorder(&recorder);
    let (router, _) = app_with_metrics(
        Config::default(),
        flaky_stores(None, true),
        recorder.handle(),
    );
    let (_, _, created) = send(&router, create_key("acct_8", "CHAT", "x")).await;
    let token = created["key"].as_str().unwrap().to_string();

    let (status, headers, body) = send(&router, call_service("/v1/chatbot", &token)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers.get("retry-after").unwrap(), "1");
    assert_eq!(body["error"]["type"], "service_unavailable");

    let rendered = recorder.handle().render();
    assert_eq!(decision_count(&rendered, "system_error"), 1);
    assert_eq!(decision_count(&rendered, "invalid_credential"), 0);
}

#[tokio::test]
async fn test_slow_store_times_out_closed() {
    let config = Config::from_toml_str(
        r#"
[gateway]
decision_timeout_ms = 20

[redis]
timeout_ms = 10
"#,
    )
    .unwrap();
    let stores = flaky_stores(Some(StdDuration::from_millis(500)), false);
    let recorder = PrometheusBuilder::new().build_recorder();
    let _guard = metrics::set_default_local_recorder(&recorder);
    let (router, _) = app_with_metrics(config, stores, recorder.handle());
    let (_, _, created) = send(&router, create_key("acct_9", "CHAT", "x")).await;
    let token = created["key"].as_str().unwrap().to_string();

    let (status, _, body) = send(&router, call_service("/v1/chatbot", &token)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "decision_timeout");
    let rendered = recorder.handle().render();
    assert_eq!(decision_count(&rendered, "decision_timeout"), 1);
    assert_eq!(decision_count(&rendered, "allowed"), 0);
}
