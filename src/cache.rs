//! Context cache manager: maps (persona, prompt-hash) to a provider-side
//! primed-context handle with a TTL.
//!
//! Cache absence is always a valid outcome — entries are a latency/cost
//! optimization, never a correctness requirement. Entries age out via
//! timestamp checks; nothing is torn down on shutdown.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Provider handles always carry this prefix.
pub const HANDLE_PREFIX: &str = "cachedContents/";

/// Entries within this slack of expiry are treated as already gone, so we
/// never race the provider's own expiry mid-call.
const EXPIRY_SLACK: Duration = Duration::from_secs(15);

/// Stable hash of a system prompt: hex SHA-256 truncated to 24 chars.
pub fn prompt_hash(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..24].to_string()
}

/// Composite store key: persona identifier + prompt hash.
pub fn cache_key(character_id: &str, system_prompt: &str) -> String {
    format!("{}:{}", character_id, prompt_hash(system_prompt))
}

/// Validate a client-supplied handle against the strict naming pattern.
/// Anything outside `cachedContents/[A-Za-z0-9/_-.]+` is discarded rather
/// than forwarded upstream.
pub fn parse_cached_content_name(value: &str) -> Option<String> {
    let text = value.trim();
    let rest = text.strip_prefix(HANDLE_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    let valid = text
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '.'));
    if valid {
        Some(text.to_string())
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct PromptCacheEntry {
    /// Opaque provider handle (`cachedContents/...`).
    pub name: String,
    pub expires_at: SystemTime,
}

/// Process-wide keyed store of primed-context handles. Injected into the
/// orchestrator; tests substitute a fresh store.
pub struct PromptCacheStore {
    entries: Mutex<HashMap<String, PromptCacheEntry>>,
}

impl Default for PromptCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptCacheStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return a live handle for the key, dropping entries that are expired
    /// or inside the expiry slack.
    pub fn get_valid(&self, key: &str) -> Option<String> {
        self.get_valid_at(key, SystemTime::now())
    }

    fn get_valid_at(&self, key: &str, now: SystemTime) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if now + EXPIRY_SLACK < entry.expires_at => Some(entry.name.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert or supersede an entry. Concurrent writers for the same key
    /// simply last-write-wins; both handles are valid upstream.
    pub fn insert(&self, key: &str, name: String, expires_at: SystemTime) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), PromptCacheEntry { name, expires_at });
    }

    /// Evict a handle the provider reported as stale or missing.
    pub fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(key)
    }
}
