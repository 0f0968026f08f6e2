//! Gemini API client: `generateContent` chat calls and `cachedContents`
//! context-cache creation, over a shared reqwest client.
//!
//! This layer reports transport facts only (timeout / connection / body
//! shape); deciding what a failure means is the orchestrator's job.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

// ── Wire types ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Part {
    pub text: String,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part { text: text.into() }],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![Part { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_mime_type: String,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandidatePart {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandidateContent {
    #[serde(default)]
    pub parts: Option<Vec<CandidatePart>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<CandidateContent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Option<Vec<Candidate>>,
    #[serde(default)]
    pub error: Option<ApiError>,
}

impl GenerateResponse {
    /// First candidate's first non-empty text part, if any.
    pub fn first_text(&self) -> Option<&str> {
        let text = self
            .candidates
            .as_ref()?
            .first()?
            .content
            .as_ref()?
            .parts
            .as_ref()?
            .first()?
            .text
            .as_deref()?;
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemInstruction {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateCachedContentRequest {
    model: String,
    display_name: String,
    /// Seconds with an `s` suffix, e.g. `"21600s"`.
    ttl: String,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedContentResponse {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    expire_time: Option<String>,
    #[serde(default)]
    error: Option<ApiError>,
}

// ── Client ─────────────────────────────────────────────────

/// Transport-level failure of a single upstream call.
#[derive(Debug, Clone, PartialEq)]
pub enum GeminiCallError {
    /// The per-attempt deadline elapsed.
    Timeout,
    /// DNS/TCP/TLS failure before or during the exchange.
    Connection(String),
    /// The provider answered but the body was not decodable JSON.
    InvalidBody,
}

/// An HTTP exchange that produced a decodable body (success or error).
#[derive(Debug, Clone)]
pub struct GeminiReply {
    pub status: reqwest::StatusCode,
    pub body: GenerateResponse,
}

pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiClient {
    /// `base_url` override is for tests against a mock server.
    pub fn new(api_key: String, base_url: Option<String>, model: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One `generateContent` exchange with an explicit per-attempt deadline.
    /// Exceeding the deadline aborts this call only, never the whole request.
    pub async fn generate_content(
        &self,
        request: &GenerateRequest,
        timeout: Duration,
    ) -> Result<GeminiReply, GeminiCallError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(request)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let body: GenerateResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                GeminiCallError::Timeout
            } else {
                GeminiCallError::InvalidBody
            }
        })?;

        Ok(GeminiReply { status, body })
    }

    /// Best-effort creation of a provider-side primed context. Any error or
    /// timeout is swallowed — the pipeline proceeds unprimed.
    pub async fn create_cached_content(
        &self,
        character_id: &str,
        system_prompt: &str,
        ttl_seconds: u64,
        cache_key: &str,
        timeout: Duration,
    ) -> Option<(String, SystemTime)> {
        let url = format!("{}/cachedContents?key={}", self.base_url, self.api_key);
        let ttl_seconds = ttl_seconds.max(300);
        let suffix_start = cache_key.len().saturating_sub(8);

        let request = CreateCachedContentRequest {
            model: format!("models/{}", self.model),
            display_name: format!("persona-{}-{}", character_id, &cache_key[suffix_start..]),
            ttl: format!("{}s", ttl_seconds),
            system_instruction: SystemInstruction {
                role: "system".to_string(),
                parts: vec![Part {
                    text: system_prompt.to_string(),
                }],
            },
        };

        let response = match self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(error = %e, "context-cache creation failed, proceeding unprimed");
                return None;
            }
        };

        let ok = response.status().is_success();
        let body: CachedContentResponse = match response.json().await {
            Ok(body) => body,
            Err(_) => return None,
        };

        if !ok || body.error.is_some() {
            tracing::debug!(character_id, "provider rejected context-cache creation");
            return None;
        }

        let name = body.name?;
        let expires_at = body
            .expire_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| SystemTime::from(t))
            .unwrap_or_else(|| SystemTime::now() + Duration::from_secs(ttl_seconds));

        Some((name, expires_at))
    }
}

fn classify_transport_error(e: reqwest::Error) -> GeminiCallError {
    if e.is_timeout() {
        GeminiCallError::Timeout
    } else {
        GeminiCallError::Connection(e.to_string())
    }
}
