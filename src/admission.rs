//! Admission filter: CORS origin allowlist and per-client rate limiting.
//!
//! The rate limiter is a fixed-window counter, not a true sliding window:
//! the counter and its reset timestamp reset together when the window
//! elapses, which permits up to 2x the nominal rate across a window
//! boundary. State is process-local and resets on redeploy.

use crate::config::GatewayConfig;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Strip whitespace and trailing slashes so `https://a.example/` and
/// `https://a.example` compare equal.
pub fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_string()
}

/// Derive the rate-limit key: first forwarded IP hop, else the request
/// origin, else a shared anonymous bucket.
pub fn client_key(forwarded_for: Option<&str>, origin: Option<&str>) -> String {
    if let Some(forwarded) = forwarded_for {
        let ip = forwarded.split(',').next().unwrap_or("").trim();
        if !ip.is_empty() {
            return format!("ip:{}", ip);
        }
    }
    if let Some(origin) = origin {
        let normalized = normalize_origin(origin);
        if !normalized.is_empty() {
            return format!("origin:{}", normalized);
        }
    }
    "anonymous".to_string()
}

// ── Origin allowlist ───────────────────────────────────────

/// CORS origin check against the configured allowlist.
#[derive(Debug, Clone)]
pub struct AdmissionFilter {
    allow_all: bool,
    allowlist: HashSet<String>,
}

impl AdmissionFilter {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            allow_all: config.allow_all_origins,
            allowlist: config
                .allowed_origins
                .iter()
                .map(|o| normalize_origin(o))
                .collect(),
        }
    }

    /// A missing Origin header is a server-to-server or health call and
    /// is always admitted; browsers always send one.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allow_all {
            return true;
        }
        match origin {
            None => true,
            Some(origin) => {
                let normalized = normalize_origin(origin);
                normalized.is_empty() || self.allowlist.contains(&normalized)
            }
        }
    }
}

// ── Rate limiting ──────────────────────────────────────────

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    reset_at: Instant,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after: Duration,
}

/// Process-wide keyed store of fixed-window counters. Injected into the
/// handler so tests can use a fresh store per test.
pub struct RateLimitStore {
    window: Duration,
    max_requests: u32,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimitStore {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    /// Window-reset-then-increment is atomic under the store lock; no
    /// await happens while it is held.
    fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let entry = entries.get(key).cloned();
        match entry {
            Some(existing) if now <= existing.reset_at => {
                if existing.count >= self.max_requests {
                    return RateDecision {
                        allowed: false,
                        remaining: 0,
                        retry_after: existing.reset_at.saturating_duration_since(now),
                    };
                }
                let count = existing.count + 1;
                entries.insert(
                    key.to_string(),
                    RateLimitEntry {
                        count,
                        reset_at: existing.reset_at,
                    },
                );
                RateDecision {
                    allowed: true,
                    remaining: self.max_requests.saturating_sub(count),
                    retry_after: existing.reset_at.saturating_duration_since(now),
                }
            }
            _ => {
                // Fresh window: count and reset timestamp start over together.
                entries.insert(
                    key.to_string(),
                    RateLimitEntry {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
                RateDecision {
                    allowed: true,
                    remaining: self.max_requests.saturating_sub(1),
                    retry_after: self.window,
                }
            }
        }
    }
}
