//! Gateway configuration resolved from environment variables,
//! with safe defaults for every knob except the upstream API key.

use std::time::Duration;

/// Default CORS allowlist used when `ALLOWED_ORIGINS` is unset (local dev).
const DEFAULT_ALLOWED_ORIGINS: [&str; 4] = [
    "http://localhost:5173",
    "http://127.0.0.1:5173",
    "http://localhost:8888",
    "http://127.0.0.1:8888",
];

/// Admission-control knobs: fixed window length and per-client ceiling.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

/// Context-cache knobs for the provider-side primed prompt cache.
#[derive(Debug, Clone)]
pub struct ContextCacheConfig {
    pub enabled: bool,
    /// TTL requested on creation; the provider enforces a 300s floor.
    pub ttl_seconds: u64,
    pub create_timeout: Duration,
    /// Prompts shorter than this are not worth the priming round-trip.
    pub warmup_min_chars: usize,
    pub auto_create: bool,
}

/// Feature flags for each bounded-retry category. Every retry here fires
/// at most once per request — the total deadline is too tight for backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retry once with the full prompt inlined when the cached handle is stale.
    pub without_cache: bool,
    /// Retry once with a minimized prompt after a timeout/connection failure.
    pub network_recovery: bool,
    /// Fixed per-attempt cap for the recovery retry.
    pub recovery_timeout: Duration,
    /// Retry once with a lower token ceiling when the model returns no text.
    pub empty_response: bool,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upstream key. `None` surfaces as a 500 on chat calls, not at startup.
    pub api_key: Option<String>,
    pub port: u16,
    pub allow_all_origins: bool,
    /// Normalized allowlist (trailing slashes stripped).
    pub allowed_origins: Vec<String>,
    pub rate_limit: RateLimitConfig,
    pub model_name: String,
    /// History is truncated to the most recent N entries before use.
    pub history_messages: usize,
    pub max_part_chars: usize,
    pub max_system_prompt_chars: usize,
    /// Per-attempt cap for the primary model call.
    pub model_timeout: Duration,
    /// Hard wall-clock budget for the whole request.
    pub total_timeout: Duration,
    /// Safety margin kept free before the host runtime's own deadline.
    pub timeout_guard: Duration,
    pub context_cache: ContextCacheConfig,
    pub retry: RetryConfig,
    pub max_output_tokens: u32,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: env_string("GOOGLE_API_KEY"),
            port: env_u64("PORT", 8080) as u16,
            allow_all_origins: env_bool("ALLOW_ALL_ORIGINS", false),
            allowed_origins: parse_allowed_origins(env_string("ALLOWED_ORIGINS")),
            rate_limit: RateLimitConfig {
                window: Duration::from_millis(env_u64("RATE_LIMIT_WINDOW_MS", 60_000)),
                max_requests: env_u64("RATE_LIMIT_MAX_REQUESTS", 30) as u32,
            },
            model_name: env_string("GEMINI_MODEL_NAME")
                .unwrap_or_else(|| "gemini-3-flash-preview".to_string()),
            history_messages: env_u64("GEMINI_HISTORY_MESSAGES", 8) as usize,
            max_part_chars: env_u64("GEMINI_MAX_PART_CHARS", 700) as usize,
            max_system_prompt_chars: env_u64("GEMINI_MAX_SYSTEM_PROMPT_CHARS", 1800) as usize,
            model_timeout: Duration::from_millis(env_u64("GEMINI_MODEL_TIMEOUT_MS", 10_000)),
            total_timeout: Duration::from_millis(env_u64("FUNCTION_TOTAL_TIMEOUT_MS", 13_000)),
            timeout_guard: Duration::from_millis(env_u64("FUNCTION_TIMEOUT_GUARD_MS", 1_200)),
            context_cache: ContextCacheConfig {
                enabled: env_bool("GEMINI_CONTEXT_CACHE_ENABLED", true),
                ttl_seconds: env_u64("GEMINI_CONTEXT_CACHE_TTL_SECONDS", 21_600),
                create_timeout: Duration::from_millis(env_u64(
                    "GEMINI_CONTEXT_CACHE_CREATE_TIMEOUT_MS",
                    1_800,
                )),
                warmup_min_chars: env_u64("GEMINI_CONTEXT_CACHE_WARMUP_MIN_CHARS", 1_200) as usize,
                auto_create: env_bool("GEMINI_CONTEXT_CACHE_AUTO_CREATE", false),
            },
            retry: RetryConfig {
                without_cache: env_bool("GEMINI_RETRY_WITHOUT_CACHE", true),
                network_recovery: env_bool("GEMINI_NETWORK_RECOVERY_RETRY", true),
                recovery_timeout: Duration::from_millis(env_u64(
                    "GEMINI_RECOVERY_TIMEOUT_MS",
                    4_000,
                )),
                empty_response: env_bool("GEMINI_EMPTY_RESPONSE_RETRY", true),
            },
            max_output_tokens: env_u64("GEMINI_MAX_OUTPUT_TOKENS", 320) as u32,
        }
    }
}

/// Read a non-empty env string.
fn env_string(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

/// Read a numeric env var, falling back to the default on absence or parse failure.
fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

/// Read a boolean env var: "true"/"1" and "false"/"0" are recognized
/// (case-insensitive); anything else keeps the default.
fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Split the comma-separated allowlist, stripping trailing slashes.
/// Falls back to the local-dev origins when unset.
fn parse_allowed_origins(raw: Option<String>) -> Vec<String> {
    match raw {
        Some(list) => list
            .split(',')
            .map(|origin| origin.trim().trim_end_matches('/').to_string())
            .filter(|origin| !origin.is_empty())
            .collect(),
        None => DEFAULT_ALLOWED_ORIGINS
            .iter()
            .map(|s| s.to_string())
            .collect(),
    }
}
