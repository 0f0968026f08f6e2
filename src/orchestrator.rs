//! Model invocation orchestrator: budget arithmetic plus a bounded
//! attempt/classify/decide state machine.
//!
//! Every retry category fires at most once per request — the total
//! deadline is on the order of seconds, so repeated backoff rounds would
//! blow straight through it. The loop below is bounded by its one-shot
//! retry flags.

use crate::cache::{self, PromptCacheStore};
use crate::config::GatewayConfig;
use crate::error::ChatError;
use crate::llm::gemini::{
    Content, GeminiCallError, GeminiClient, GenerateRequest, GenerationConfig,
};
use crate::persona;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Headroom required beyond the guard before an inline cache-creation
/// round-trip is worth attempting (it must not starve the primary call).
const CACHE_CREATE_RESERVE: Duration = Duration::from_secs(3);

/// Fixed acknowledgement turn inserted after an inlined system prompt.
const SYSTEM_ACK: &str = "Understood. I will respond in the specified JSON format.";

// ── Budget ─────────────────────────────────────────────────

/// A single shrinking "time remaining" value derived from a fixed total
/// deadline. Attempt timeouts are computed from it, never the other way
/// around.
#[derive(Debug, Clone)]
pub struct Budget {
    started_at: Instant,
    total: Duration,
    guard: Duration,
}

impl Budget {
    pub fn start(total: Duration, guard: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            total,
            guard,
        }
    }

    /// A budget that already has `elapsed` behind it. Used by tests to
    /// exercise exhaustion without sleeping.
    pub fn with_elapsed(total: Duration, guard: Duration, elapsed: Duration) -> Self {
        Self {
            started_at: Instant::now()
                .checked_sub(elapsed)
                .unwrap_or_else(Instant::now),
            total,
            guard,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.started_at.elapsed())
    }

    /// Per-attempt timeout: `min(cap, remaining - guard)`, or `None` when
    /// that would be non-positive. An attempt is never started on `None`.
    pub fn attempt_timeout(&self, cap: Duration) -> Option<Duration> {
        let available = self.remaining().checked_sub(self.guard)?;
        let timeout = cap.min(available);
        if timeout.is_zero() {
            None
        } else {
            Some(timeout)
        }
    }

    fn has_headroom(&self, extra: Duration) -> bool {
        self.remaining() > self.guard + extra
    }
}

// ── Conversation input ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRole {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub text: String,
}

/// One decoded chat turn, ready for assembly. Validation (non-empty user
/// message, handle pattern) happens before this is built.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub character_id: String,
    pub system_prompt: String,
    pub user_message: String,
    pub history: Vec<HistoryEntry>,
    pub client_handle: Option<String>,
}

impl ChatTurn {
    fn is_first_turn(&self) -> bool {
        self.history.is_empty()
    }
}

/// Successful invocation: raw model text plus the handle that served it
/// (None when the winning attempt ran uncached).
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub raw_text: String,
    pub cached_content: Option<String>,
}

// ── Orchestrator ───────────────────────────────────────────

/// Classified result of a single upstream attempt.
enum AttemptOutcome {
    Success(String),
    /// Provider says the attached handle is stale or missing.
    CacheStale { status: u16, message: String },
    ModelError { status: u16, message: String },
    Timeout { timeout_ms: u64 },
    Connection,
    Empty,
    InvalidBody,
}

pub struct ModelOrchestrator {
    client: GeminiClient,
    config: Arc<GatewayConfig>,
    cache: Arc<PromptCacheStore>,
}

impl ModelOrchestrator {
    pub fn new(client: GeminiClient, config: Arc<GatewayConfig>, cache: Arc<PromptCacheStore>) -> Self {
        Self {
            client,
            config,
            cache,
        }
    }

    /// Run the attempt state machine for one turn within `budget`.
    pub async fn invoke(
        &self,
        turn: &ChatTurn,
        budget: &Budget,
    ) -> Result<InvocationOutcome, ChatError> {
        let cache_cfg = &self.config.context_cache;
        let cache_eligible = cache_cfg.enabled
            && !turn.system_prompt.is_empty()
            && persona::is_supported(&turn.character_id);
        let key = cache_eligible.then(|| cache::cache_key(&turn.character_id, &turn.system_prompt));

        // Lookup order: client-supplied handle, then the local store.
        let mut handle = if let Some(key) = key.as_deref() {
            turn.client_handle
                .clone()
                .or_else(|| self.cache.get_valid(key))
        } else {
            None
        };

        // Lazy creation: first turn, long enough prompt, enough budget that
        // the creation round-trip cannot starve the primary call.
        if handle.is_none()
            && cache_cfg.auto_create
            && turn.is_first_turn()
            && turn.system_prompt.chars().count() >= cache_cfg.warmup_min_chars
            && budget.has_headroom(CACHE_CREATE_RESERVE)
        {
            if let Some(key) = key.as_deref() {
                let clamped =
                    clamp_chars(&turn.system_prompt, self.config.max_system_prompt_chars);
                if let Some((name, expires_at)) = self
                    .client
                    .create_cached_content(
                        &turn.character_id,
                        &clamped,
                        cache_cfg.ttl_seconds,
                        key,
                        cache_cfg.create_timeout,
                    )
                    .await
                {
                    tracing::info!(character_id = %turn.character_id, "primed context created");
                    self.cache.insert(key, name.clone(), expires_at);
                    handle = Some(name);
                }
            }
        }

        let bare = self.turn_contents(turn);
        let full = self.with_system_prompt(turn, &bare);
        let minimized = self.minimized_contents(turn);

        let mut allow_cache_retry = self.config.retry.without_cache;
        let mut allow_recovery = self.config.retry.network_recovery;
        let mut allow_empty_retry = self.config.retry.empty_response;
        let mut minimized_mode = false;
        let mut max_tokens = self.config.max_output_tokens;

        loop {
            let cap = if minimized_mode {
                self.config.retry.recovery_timeout
            } else {
                self.config.model_timeout
            };
            let timeout = budget.attempt_timeout(cap).ok_or(ChatError::BudgetExceeded)?;

            let contents = if minimized_mode {
                minimized.clone()
            } else if handle.is_some() {
                bare.clone()
            } else {
                full.clone()
            };

            tracing::debug!(
                cached = handle.is_some(),
                minimized = minimized_mode,
                timeout_ms = timeout.as_millis() as u64,
                "model attempt"
            );

            match self
                .attempt(contents, handle.as_deref(), timeout, max_tokens)
                .await
            {
                AttemptOutcome::Success(text) => {
                    if let (Some(key), Some(name)) = (key.as_deref(), handle.as_ref()) {
                        // Refresh the local entry so later turns reuse it.
                        let ttl = Duration::from_secs(cache_cfg.ttl_seconds.max(300));
                        self.cache.insert(key, name.clone(), SystemTime::now() + ttl);
                    }
                    return Ok(InvocationOutcome {
                        raw_text: text,
                        cached_content: handle,
                    });
                }
                AttemptOutcome::CacheStale { status, message } => {
                    if let Some(key) = key.as_deref() {
                        self.cache.remove(key);
                    }
                    tracing::info!("stale cached context evicted");
                    handle = None;
                    if allow_cache_retry {
                        allow_cache_retry = false;
                        continue;
                    }
                    return Err(model_error(status, message));
                }
                AttemptOutcome::Timeout { timeout_ms } => {
                    if allow_recovery
                        && budget
                            .attempt_timeout(self.config.retry.recovery_timeout)
                            .is_some()
                    {
                        tracing::warn!(timeout_ms, "attempt timed out, trying minimized recovery");
                        allow_recovery = false;
                        minimized_mode = true;
                        handle = None;
                        continue;
                    }
                    return Err(ChatError::UpstreamTimeout {
                        model: self.client.model().to_string(),
                        timeout_ms,
                    });
                }
                AttemptOutcome::Connection => {
                    if allow_recovery
                        && budget
                            .attempt_timeout(self.config.retry.recovery_timeout)
                            .is_some()
                    {
                        tracing::warn!("connection failed, trying minimized recovery");
                        allow_recovery = false;
                        minimized_mode = true;
                        handle = None;
                        continue;
                    }
                    return Err(ChatError::UpstreamConnection);
                }
                AttemptOutcome::Empty => {
                    if allow_empty_retry {
                        tracing::warn!("empty model response, retrying with smaller prompt");
                        allow_empty_retry = false;
                        minimized_mode = true;
                        handle = None;
                        max_tokens = (max_tokens / 2).max(32);
                        continue;
                    }
                    return Err(ChatError::UpstreamEmpty);
                }
                AttemptOutcome::ModelError { status, message } => {
                    return Err(model_error(status, message));
                }
                AttemptOutcome::InvalidBody => {
                    return Err(ChatError::UpstreamInvalidResponse);
                }
            }
        }
    }

    async fn attempt(
        &self,
        contents: Vec<Content>,
        cached: Option<&str>,
        timeout: Duration,
        max_tokens: u32,
    ) -> AttemptOutcome {
        let request = GenerateRequest {
            contents,
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
                max_output_tokens: max_tokens,
            },
            cached_content: cached.map(str::to_string),
        };

        match self.client.generate_content(&request, timeout).await {
            Err(GeminiCallError::Timeout) => AttemptOutcome::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            },
            Err(GeminiCallError::Connection(error)) => {
                tracing::warn!(%error, "upstream connection failed");
                AttemptOutcome::Connection
            }
            Err(GeminiCallError::InvalidBody) => AttemptOutcome::InvalidBody,
            Ok(reply) => {
                if reply.status.is_success() && reply.body.error.is_none() {
                    match reply.body.first_text() {
                        Some(text) => AttemptOutcome::Success(text.to_string()),
                        None => AttemptOutcome::Empty,
                    }
                } else {
                    let status = reply.status.as_u16();
                    let message = reply
                        .body
                        .error
                        .as_ref()
                        .and_then(|e| e.message.clone())
                        .unwrap_or_else(|| "Model call failed".to_string());
                    if cached.is_some() && is_cache_lookup_error(&message) {
                        AttemptOutcome::CacheStale { status, message }
                    } else {
                        AttemptOutcome::ModelError { status, message }
                    }
                }
            }
        }
    }

    // ── Content assembly ───────────────────────────────────

    /// History (most recent N, clamped) plus the current user message.
    fn turn_contents(&self, turn: &ChatTurn) -> Vec<Content> {
        let max_parts = self.config.max_part_chars;
        let skip = turn.history.len().saturating_sub(self.config.history_messages);

        let mut contents: Vec<Content> = turn.history[skip..]
            .iter()
            .map(|entry| {
                let text = clamp_chars(&entry.text, max_parts);
                match entry.role {
                    HistoryRole::User => Content::user(text),
                    HistoryRole::Assistant => Content::model(text),
                }
            })
            .collect();

        contents.push(Content::user(clamp_chars(&turn.user_message, max_parts)));
        contents
    }

    /// The same turn with the system prompt inlined as a leading exchange
    /// (used whenever no primed context is in play).
    fn with_system_prompt(&self, turn: &ChatTurn, bare: &[Content]) -> Vec<Content> {
        if turn.system_prompt.is_empty() {
            return bare.to_vec();
        }
        let mut contents = Vec::with_capacity(bare.len() + 2);
        contents.push(Content::user(clamp_chars(
            &turn.system_prompt,
            self.config.max_system_prompt_chars,
        )));
        contents.push(Content::model(SYSTEM_ACK));
        contents.extend_from_slice(bare);
        contents
    }

    /// Recovery shape: heavily truncated system prompt, no history. Small
    /// enough to maximize the odds of finishing inside a short deadline.
    fn minimized_contents(&self, turn: &ChatTurn) -> Vec<Content> {
        let mut contents = Vec::with_capacity(3);
        if !turn.system_prompt.is_empty() {
            contents.push(Content::user(clamp_chars(
                &turn.system_prompt,
                self.config.max_system_prompt_chars / 3,
            )));
            contents.push(Content::model(SYSTEM_ACK));
        }
        contents.push(Content::user(clamp_chars(
            &turn.user_message,
            self.config.max_part_chars,
        )));
        contents
    }
}

/// Char-boundary-safe truncation.
fn clamp_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn is_cache_lookup_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("cachedcontent")
        || lower.contains("cached content")
        || lower.contains("not found")
        || lower.contains("expired")
}

/// Map a terminal provider error to the taxonomy, rewriting the messages
/// operators actually need to act on (auth, quota, region).
fn model_error(status: u16, message: String) -> ChatError {
    let location_unsupported = message.contains("location is not supported");
    let message = if message.contains("API_KEY") || message.contains("API key") {
        "Invalid or expired API key. Please check your GOOGLE_API_KEY configuration.".to_string()
    } else if message.to_lowercase().contains("quota") {
        "API quota exceeded. Please check your Google Cloud billing.".to_string()
    } else if location_unsupported {
        "Gemini API is not available in this server region. Deploy the gateway in a supported region or switch provider."
            .to_string()
    } else {
        message
    };
    ChatError::UpstreamModel {
        status,
        message,
        location_unsupported,
    }
}
