//! HTTP surface: `POST /api/chat`, its CORS preflight, and `GET /healthz`.
//!
//! Every chat response, success or failure, carries the same CORS and
//! diagnostic headers so browser clients never see an opaque network error
//! where a JSON body was possible.

use crate::admission::{client_key, AdmissionFilter, RateLimitStore};
use crate::cache::{self, PromptCacheStore};
use crate::config::GatewayConfig;
use crate::error::ChatError;
use crate::llm::gemini::GeminiClient;
use crate::normalize::normalize_assistant_payload;
use crate::orchestrator::{Budget, ChatTurn, HistoryEntry, HistoryRole, ModelOrchestrator};
use crate::persona;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use warp::http::header::HeaderValue;
use warp::http::{Response, StatusCode};
use warp::hyper::Body;
use warp::{Filter, Rejection, Reply};

/// Request bodies beyond this are rejected before JSON decoding.
const MAX_BODY_BYTES: u64 = 1024 * 1024;

/// Diagnostic marker identifying this gateway revision in responses.
const GATEWAY_TAG: &str = "chat-v4";

// ── Wire types ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryMessage {
    #[serde(default)]
    pub role: Option<String>,
    /// Either a plain string or an object whose `response` field carries
    /// the spoken text (the UI sends assistant turns in payload shape).
    #[serde(default)]
    pub content: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub user_message: Option<String>,
    #[serde(default)]
    pub message_history: Vec<HistoryMessage>,
    #[serde(default)]
    pub character_id: Option<String>,
    #[serde(default)]
    pub cached_content: Option<String>,
}

// ── Application state ──────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    filter: AdmissionFilter,
    limiter: Arc<RateLimitStore>,
    orchestrator: Arc<ModelOrchestrator>,
}

impl AppState {
    /// `base_url` override points the upstream client at a mock server.
    pub fn new(config: GatewayConfig, base_url: Option<String>) -> Self {
        let config = Arc::new(config);
        let filter = AdmissionFilter::from_config(&config);
        let limiter = Arc::new(RateLimitStore::new(
            config.rate_limit.window,
            config.rate_limit.max_requests,
        ));
        let client = GeminiClient::new(
            config.api_key.clone().unwrap_or_default(),
            base_url,
            config.model_name.clone(),
        );
        let orchestrator = Arc::new(ModelOrchestrator::new(
            client,
            config.clone(),
            Arc::new(PromptCacheStore::new()),
        ));
        Self {
            config,
            filter,
            limiter,
            orchestrator,
        }
    }
}

// ── Routes ─────────────────────────────────────────────────

pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let with_state = {
        let state = state.clone();
        warp::any().map(move || state.clone())
    };

    let chat_path = warp::path("api").and(warp::path("chat")).and(warp::path::end());

    let chat = chat_path
        .and(warp::post())
        .and(warp::header::optional::<String>("origin"))
        .and(warp::header::optional::<String>("x-forwarded-for"))
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_state.clone())
        .and_then(handle_chat);

    let preflight = chat_path
        .and(warp::options())
        .and(warp::header::optional::<String>("origin"))
        .and(with_state.clone())
        .and_then(handle_preflight);

    let health = warp::path("healthz")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::json(&json!({ "ok": true })));

    let api = chat.or(preflight).or(health);

    // Rejection replies (404/400/405/413) bypass the handlers, so the
    // header contract is enforced once more on the way out.
    warp::header::optional::<String>("origin")
        .and(with_state)
        .and(api.recover(handle_rejection))
        .map(apply_contract_headers)
}

fn apply_contract_headers<R: Reply>(
    origin: Option<String>,
    state: AppState,
    reply: R,
) -> warp::reply::Response {
    ensure_contract_headers(origin, &state, reply.into_response())
}

// ── Handlers ───────────────────────────────────────────────

async fn handle_chat(
    origin: Option<String>,
    forwarded_for: Option<String>,
    request: ChatRequest,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let started = Instant::now();

    let origin_ok = state.filter.origin_allowed(origin.as_deref());
    let acao = allow_origin_value(origin_ok, origin.as_deref());
    if !origin_ok {
        tracing::info!(origin = origin.as_deref(), "origin rejected");
        let err = ChatError::OriginRejected;
        return Ok(error_response(&err, &acao, started, None));
    }

    let key = client_key(forwarded_for.as_deref(), origin.as_deref());
    let decision = state.limiter.check(&key);
    if !decision.allowed {
        let retry_after = retry_after_secs(decision.retry_after);
        tracing::info!(client = %key, retry_after, "rate limited");
        let err = ChatError::RateLimited {
            retry_after_secs: retry_after,
        };
        return Ok(error_response(&err, &acao, started, Some(retry_after)));
    }

    if state.config.api_key.is_none() {
        let err = ChatError::MissingApiKey;
        tracing::error!("chat call with no upstream API key configured");
        return Ok(error_response(&err, &acao, started, None));
    }

    let user_message = request
        .user_message
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_string();
    if user_message.is_empty() {
        let err = ChatError::InvalidRequest("userMessage is required.".to_string());
        return Ok(error_response(&err, &acao, started, None));
    }

    let character_id = request
        .character_id
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    let turn = ChatTurn {
        character_id: character_id.clone(),
        system_prompt: request
            .system_prompt
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_string(),
        user_message,
        history: history_entries(&request.message_history),
        client_handle: request
            .cached_content
            .as_deref()
            .and_then(cache::parse_cached_content_name),
    };

    let budget = Budget::start(state.config.total_timeout, state.config.timeout_guard);

    match state.orchestrator.invoke(&turn, &budget).await {
        Ok(outcome) => {
            let payload = normalize_assistant_payload(&outcome.raw_text);
            let text = serde_json::to_string(&payload).unwrap_or_default();
            let body = json!({
                "text": text,
                "cachedContent": outcome.cached_content,
            });
            tracing::info!(
                character_id = %character_id,
                cached = outcome.cached_content.is_some(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "chat handled"
            );
            Ok(build_response(StatusCode::OK, &acao, &body, started, None))
        }
        Err(err) if err.is_degradable() => {
            // The user still gets an answer in the character's own voice;
            // the wire code tells the UI what actually happened.
            let payload = persona::upstream_fallback_payload(&character_id);
            let text = serde_json::to_string(&payload).unwrap_or_default();
            let mut body = json!({
                "text": text,
                "cachedContent": Value::Null,
            });
            if let (Some(code), Some(map)) = (err.error_code(), body.as_object_mut()) {
                map.insert("error_code".to_string(), json!(code));
            }
            tracing::warn!(
                character_id = %character_id,
                code = err.error_code(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                %err,
                "degraded to persona fallback"
            );
            Ok(build_response(StatusCode::OK, &acao, &body, started, None))
        }
        Err(err) => {
            tracing::error!(
                character_id = %character_id,
                code = err.error_code(),
                %err,
                "chat failed"
            );
            Ok(error_response(&err, &acao, started, None))
        }
    }
}

async fn handle_preflight(
    origin: Option<String>,
    state: AppState,
) -> Result<warp::reply::Response, Infallible> {
    let started = Instant::now();
    let origin_ok = state.filter.origin_allowed(origin.as_deref());
    let acao = allow_origin_value(origin_ok, origin.as_deref());
    if !origin_ok {
        let err = ChatError::OriginRejected;
        return Ok(error_response(&err, &acao, started, None));
    }
    Ok(build_response(
        StatusCode::OK,
        &acao,
        &Value::Null,
        started,
        None,
    ))
}

async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if rejection
        .find::<warp::filters::body::BodyDeserializeError>()
        .is_some()
    {
        (StatusCode::BAD_REQUEST, "Invalid JSON body.".to_string())
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large.".to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        let err = ChatError::MethodRejected;
        (err.status(), err.to_string())
    } else {
        tracing::error!(?rejection, "unhandled rejection");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "error": message })),
        status,
    ))
}

// ── Response assembly ──────────────────────────────────────

/// `Access-Control-Allow-Origin` value: echoed origin when admitted, `*`
/// for origin-less callers, `null` when rejected.
fn allow_origin_value(origin_ok: bool, origin: Option<&str>) -> String {
    if !origin_ok {
        return "null".to_string();
    }
    match origin {
        Some(origin) => origin.to_string(),
        None => "*".to_string(),
    }
}

/// Whole seconds, rounded up, never zero.
fn retry_after_secs(retry_after: std::time::Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

fn error_response(
    err: &ChatError,
    acao: &str,
    started: Instant,
    retry_after: Option<u64>,
) -> warp::reply::Response {
    let mut body = json!({ "error": err.to_string() });
    if let (Some(code), Some(map)) = (err.error_code(), body.as_object_mut()) {
        map.insert("error_code".to_string(), json!(code));
    }
    build_response(err.status(), acao, &body, started, retry_after)
}

fn build_response(
    status: StatusCode,
    acao: &str,
    body: &Value,
    started: Instant,
    retry_after: Option<u64>,
) -> warp::reply::Response {
    let bytes = if body.is_null() {
        String::new()
    } else {
        body.to_string()
    };

    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", acao)
        .header("Access-Control-Allow-Headers", "Content-Type")
        .header("Access-Control-Allow-Methods", "POST, OPTIONS")
        .header("Vary", "Origin")
        .header("X-Persona-Gateway", GATEWAY_TAG)
        .header(
            "X-Elapsed-Ms",
            (started.elapsed().as_millis() as u64).to_string(),
        );
    if let Some(secs) = retry_after {
        builder = builder.header("Retry-After", secs.to_string());
    }

    // A hostile Origin header can contain bytes invalid in a header value;
    // fall back to a bare JSON reply rather than panicking.
    builder.body(Body::from(bytes)).unwrap_or_else(|_| {
        warp::reply::with_status(warp::reply::json(body), status).into_response()
    })
}

/// Attach the CORS/diagnostic header set to replies that bypassed
/// `build_response` (rejection replies and `/healthz`). Replies that
/// already carry `Access-Control-Allow-Origin` pass through untouched.
fn ensure_contract_headers(
    origin: Option<String>,
    state: &AppState,
    mut response: warp::reply::Response,
) -> warp::reply::Response {
    if response.headers().contains_key("access-control-allow-origin") {
        return response;
    }

    let origin_ok = state.filter.origin_allowed(origin.as_deref());
    let acao = allow_origin_value(origin_ok, origin.as_deref());
    let headers = response.headers_mut();
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_str(&acao).unwrap_or_else(|_| HeaderValue::from_static("null")),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert("vary", HeaderValue::from_static("Origin"));
    headers.insert("x-persona-gateway", HeaderValue::from_static(GATEWAY_TAG));
    if !headers.contains_key("x-elapsed-ms") {
        // Rejections never reach the model; no meaningful elapsed time.
        headers.insert("x-elapsed-ms", HeaderValue::from_static("0"));
    }
    response
}

/// Decode history turns, tolerating both string and payload-object content.
/// Empty turns are dropped.
fn history_entries(messages: &[HistoryMessage]) -> Vec<HistoryEntry> {
    messages
        .iter()
        .filter_map(|message| {
            let role = match message.role.as_deref() {
                Some("assistant") | Some("model") => HistoryRole::Assistant,
                _ => HistoryRole::User,
            };
            let text = match &message.content {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Object(map)) => map
                    .get("response")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_default(),
                _ => String::new(),
            };
            let text = text.trim().to_string();
            (!text.is_empty()).then_some(HistoryEntry { role, text })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextCacheConfig, RateLimitConfig, RetryConfig};
    use crate::normalize::NormalizedPayload;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            api_key: Some("test-key".to_string()),
            port: 0,
            allow_all_origins: false,
            allowed_origins: vec!["http://localhost:5173".to_string()],
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(60),
                max_requests: 30,
            },
            model_name: "gemini-test".to_string(),
            history_messages: 8,
            max_part_chars: 700,
            max_system_prompt_chars: 1800,
            model_timeout: Duration::from_millis(300),
            total_timeout: Duration::from_secs(5),
            timeout_guard: Duration::from_millis(50),
            context_cache: ContextCacheConfig {
                enabled: true,
                ttl_seconds: 600,
                create_timeout: Duration::from_millis(300),
                warmup_min_chars: 1200,
                auto_create: false,
            },
            retry: RetryConfig {
                without_cache: true,
                network_recovery: true,
                recovery_timeout: Duration::from_millis(300),
                empty_response: true,
            },
            max_output_tokens: 320,
        }
    }

    fn chat_body(character_id: &str) -> Value {
        json!({
            "systemPrompt": "You are a persona.",
            "userMessage": "안녕",
            "messageHistory": [],
            "characterId": character_id,
        })
    }

    fn success_template() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {
                    "parts": [{ "text": "{\"emotion\":\"happy\",\"response\":\"만나서 반가워!\"}" }]
                }
            }]
        }))
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let routes = routes(AppState::new(test_config(), None));
        let resp = warp::test::request()
            .method("GET")
            .path("/healthz")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn unknown_path_is_a_json_404() {
        let routes = routes(AppState::new(test_config(), None));
        let resp = warp::test::request()
            .method("GET")
            .path("/api/nothing")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error"], "Not found");
    }

    #[tokio::test]
    async fn invalid_json_body_keeps_the_header_contract() {
        let routes = routes(AppState::new(test_config(), None));
        let resp = warp::test::request()
            .method("POST")
            .path("/api/chat")
            .header("origin", "http://localhost:5173")
            .header("content-type", "application/json")
            .body("{not json")
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            resp.headers()["access-control-allow-origin"],
            "http://localhost:5173",
            "a browser on an allowed origin must be able to read the error"
        );
        assert_eq!(resp.headers()["x-persona-gateway"], "chat-v4");
        assert_eq!(resp.headers()["vary"], "Origin");
        assert!(resp.headers().contains_key("x-elapsed-ms"));
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error"], "Invalid JSON body.");
    }

    #[tokio::test]
    async fn wrong_method_gets_405_with_the_header_contract() {
        let routes = routes(AppState::new(test_config(), None));
        let resp = warp::test::request()
            .method("GET")
            .path("/api/chat")
            .header("origin", "http://localhost:5173")
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            resp.headers()["access-control-allow-origin"],
            "http://localhost:5173"
        );
        assert_eq!(resp.headers()["x-persona-gateway"], "chat-v4");
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error"], "Method not allowed");
    }

    #[tokio::test]
    async fn rejected_origin_gets_403_with_null_acao() {
        let routes = routes(AppState::new(test_config(), None));
        let resp = warp::test::request()
            .method("POST")
            .path("/api/chat")
            .header("origin", "https://evil.example.com")
            .json(&chat_body("mika"))
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(resp.headers()["access-control-allow-origin"], "null");
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error"], "Origin is not allowed.");
    }

    #[tokio::test]
    async fn preflight_echoes_admitted_origin() {
        let routes = routes(AppState::new(test_config(), None));
        let resp = warp::test::request()
            .method("OPTIONS")
            .path("/api/chat")
            .header("origin", "http://localhost:5173")
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["access-control-allow-origin"],
            "http://localhost:5173"
        );
        assert_eq!(
            resp.headers()["access-control-allow-methods"],
            "POST, OPTIONS"
        );
    }

    #[tokio::test]
    async fn over_ceiling_requests_get_429_with_retry_after() {
        let mut config = test_config();
        config.rate_limit.max_requests = 1;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(success_template())
            .mount(&server)
            .await;
        let routes = routes(AppState::new(config, Some(server.uri())));

        let first = warp::test::request()
            .method("POST")
            .path("/api/chat")
            .header("origin", "http://localhost:5173")
            .header("x-forwarded-for", "203.0.113.9")
            .json(&chat_body("mika"))
            .reply(&routes)
            .await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = warp::test::request()
            .method("POST")
            .path("/api/chat")
            .header("origin", "http://localhost:5173")
            .header("x-forwarded-for", "203.0.113.9")
            .json(&chat_body("mika"))
            .reply(&routes)
            .await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = second.headers()["retry-after"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1 && retry_after <= 60);
    }

    #[tokio::test]
    async fn missing_api_key_is_a_500_with_wire_code() {
        let mut config = test_config();
        config.api_key = None;
        let routes = routes(AppState::new(config, None));

        let resp = warp::test::request()
            .method("POST")
            .path("/api/chat")
            .header("origin", "http://localhost:5173")
            .json(&chat_body("mika"))
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error_code"], "MISSING_API_KEY");
    }

    #[tokio::test]
    async fn empty_user_message_is_a_400() {
        let routes = routes(AppState::new(test_config(), None));
        let resp = warp::test::request()
            .method("POST")
            .path("/api/chat")
            .header("origin", "http://localhost:5173")
            .json(&json!({ "userMessage": "   ", "characterId": "mika" }))
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error"], "userMessage is required.");
    }

    #[tokio::test]
    async fn successful_chat_returns_encoded_payload_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(success_template())
            .mount(&server)
            .await;
        let routes = routes(AppState::new(test_config(), Some(server.uri())));

        let resp = warp::test::request()
            .method("POST")
            .path("/api/chat")
            .header("origin", "http://localhost:5173")
            .json(&chat_body("mika"))
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-persona-gateway"], "chat-v4");
        assert_eq!(
            resp.headers()["access-control-allow-origin"],
            "http://localhost:5173"
        );
        assert!(resp.headers().contains_key("x-elapsed-ms"));

        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["cachedContent"], Value::Null);
        assert!(body.get("error_code").is_none());
        let payload: NormalizedPayload =
            serde_json::from_str(body["text"].as_str().unwrap()).unwrap();
        assert_eq!(payload.response, "만나서 반가워!");
    }

    #[tokio::test]
    async fn double_timeout_degrades_to_alice_fallback_with_wire_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(success_template().set_delay(Duration::from_millis(800)))
            .mount(&server)
            .await;
        let routes = routes(AppState::new(test_config(), Some(server.uri())));

        let resp = warp::test::request()
            .method("POST")
            .path("/api/chat")
            .header("origin", "http://localhost:5173")
            .json(&chat_body("alice"))
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::OK, "degradation keeps HTTP 200");
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error_code"], "UPSTREAM_TIMEOUT");
        assert_eq!(body["cachedContent"], Value::Null);
        let payload: NormalizedPayload =
            serde_json::from_str(body["text"].as_str().unwrap()).unwrap();
        assert!(
            payload.response.contains("전해주겠는가"),
            "alice answers in her formal register"
        );
    }

    #[tokio::test]
    async fn provider_auth_error_surfaces_as_a_real_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "code": 400, "message": "API key not valid." }
            })))
            .mount(&server)
            .await;
        let routes = routes(AppState::new(test_config(), Some(server.uri())));

        let resp = warp::test::request()
            .method("POST")
            .path("/api/chat")
            .header("origin", "http://localhost:5173")
            .json(&chat_body("mika"))
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error_code"], "UPSTREAM_MODEL_ERROR");
        assert!(body.get("text").is_none(), "hard failures carry no payload");
    }

    #[test]
    fn history_entries_accept_string_and_object_content() {
        let messages = vec![
            HistoryMessage {
                role: Some("user".to_string()),
                content: Some(json!("hello")),
            },
            HistoryMessage {
                role: Some("assistant".to_string()),
                content: Some(json!({ "emotion": "happy", "response": "hi there" })),
            },
            HistoryMessage {
                role: Some("assistant".to_string()),
                content: Some(json!({ "emotion": "happy" })),
            },
            HistoryMessage {
                role: None,
                content: None,
            },
        ];

        let entries = history_entries(&messages);
        assert_eq!(entries.len(), 2, "empty turns are dropped");
        assert_eq!(entries[0].role, HistoryRole::User);
        assert_eq!(entries[0].text, "hello");
        assert_eq!(entries[1].role, HistoryRole::Assistant);
        assert_eq!(entries[1].text, "hi there");
    }

    #[test]
    fn retry_after_rounds_up_and_never_reports_zero() {
        assert_eq!(retry_after_secs(Duration::from_millis(100)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1_500)), 2);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }
}
