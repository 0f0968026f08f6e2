//! Output normalizer: repairs raw model text into the fixed payload shape
//! the UI renders. Never fails — every input produces a valid payload.
//!
//! Parsing is an ordered cascade of strategies, each tried only when the
//! previous one gives up: strict JSON, loose repair, balanced-brace
//! candidate scan, then a plain-prose path for non-JSON answers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed emotion set the UI can render. Unrecognized values coerce to
/// `Normal` rather than erroring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    #[default]
    Normal,
    Happy,
    Angry,
}

impl Emotion {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "happy" => Emotion::Happy,
            "angry" => Emotion::Angry,
            _ => Emotion::Normal,
        }
    }
}

/// The fixed-shape payload the UI contract requires. `response` is never
/// empty; absent monologue/narration collapse to empty strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPayload {
    pub emotion: Emotion,
    pub inner_heart: String,
    pub response: String,
    pub narration: String,
}

/// Filler spoken line used when no usable response text exists at all.
pub const UNSTABLE_FORMAT_FILLER: &str = "잠시 응답 형식이 불안정했어요. 한 번만 다시 말해줘.";

fn filler_payload() -> NormalizedPayload {
    NormalizedPayload {
        emotion: Emotion::Normal,
        inner_heart: String::new(),
        response: UNSTABLE_FORMAT_FILLER.to_string(),
        narration: String::new(),
    }
}

/// Normalize raw model output into a payload. Always returns a value.
pub fn normalize_assistant_payload(raw: &str) -> NormalizedPayload {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return filler_payload();
    }

    let fenceless = strip_code_fences(trimmed);

    // 1. Strict parse of the whole (fence-stripped) text.
    if let Some(value) = parse_strict(&fenceless) {
        return payload_from_value(&value);
    }

    // 2. Loose repair: smart quotes, bare keys, single quotes, trailing commas.
    if let Some(value) = parse_loose(&fenceless) {
        return payload_from_value(&value);
    }

    // 3. Balanced-brace candidates embedded in surrounding text.
    for candidate in balanced_object_candidates(&fenceless) {
        if let Some(value) = parse_strict(candidate).or_else(|| parse_loose(candidate)) {
            return payload_from_value(&value);
        }
    }

    // 4. Broken JSON we could not salvage: fail closed rather than leaking
    //    partial JSON into the chat bubble.
    if looks_like_broken_json(&fenceless) {
        return filler_payload();
    }

    // 5. Plain prose: the only path where non-JSON output is a valid answer.
    match prose_response(trimmed) {
        Some(response) => NormalizedPayload {
            emotion: Emotion::Normal,
            inner_heart: String::new(),
            response,
            narration: String::new(),
        },
        None => filler_payload(),
    }
}

// ── Field coercion ─────────────────────────────────────────

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn payload_from_value(value: &Value) -> NormalizedPayload {
    let emotion = value
        .get("emotion")
        .and_then(Value::as_str)
        .map(Emotion::from_label)
        .unwrap_or_default();

    let response = {
        let text = string_field(value, "response");
        if text.is_empty() {
            UNSTABLE_FORMAT_FILLER.to_string()
        } else {
            text
        }
    };

    NormalizedPayload {
        emotion,
        inner_heart: string_field(value, "inner_heart"),
        response,
        narration: string_field(value, "narration"),
    }
}

// ── Parse strategies ───────────────────────────────────────

fn strip_code_fences(text: &str) -> String {
    let stripped = text
        .replace("```json", "")
        .replace("```JSON", "")
        .replace("```Json", "")
        .replace("```", "");
    stripped.trim().to_string()
}

/// Strict parse; only JSON objects are usable payload shapes.
fn parse_strict(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(Value::is_object)
}

fn parse_loose(text: &str) -> Option<Value> {
    parse_strict(&repair_json(&normalize_smart_quotes(text)))
}

fn normalize_smart_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect()
}

/// Single-pass repair of the JSON-ish dialects models actually emit:
/// bare object keys, single-quoted strings, trailing commas. String and
/// escape state is tracked so content is never rewritten.
fn repair_json(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut expect_key = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => {
                out.push('"');
                i += 1;
                while i < chars.len() {
                    let d = chars[i];
                    out.push(d);
                    i += 1;
                    if d == '\\' && i < chars.len() {
                        out.push(chars[i]);
                        i += 1;
                    } else if d == '"' {
                        break;
                    }
                }
                expect_key = false;
            }
            '\'' => {
                // Re-quote a single-quoted string, escaping embedded quotes.
                out.push('"');
                i += 1;
                while i < chars.len() {
                    let d = chars[i];
                    if d == '\\' && i + 1 < chars.len() {
                        let next = chars[i + 1];
                        if next == '\'' {
                            out.push('\'');
                        } else {
                            out.push('\\');
                            out.push(next);
                        }
                        i += 2;
                        continue;
                    }
                    if d == '\'' {
                        i += 1;
                        break;
                    }
                    if d == '"' {
                        out.push('\\');
                    }
                    out.push(d);
                    i += 1;
                }
                out.push('"');
                expect_key = false;
            }
            '{' => {
                stack.push('{');
                out.push(c);
                expect_key = true;
                i += 1;
            }
            '[' => {
                stack.push('[');
                out.push(c);
                expect_key = false;
                i += 1;
            }
            '}' | ']' => {
                stack.pop();
                out.push(c);
                expect_key = false;
                i += 1;
            }
            ',' => {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                    // Trailing comma before a closing bracket: drop it.
                    i += 1;
                } else {
                    out.push(',');
                    expect_key = matches!(stack.last(), Some('{'));
                    i += 1;
                }
            }
            ':' => {
                out.push(':');
                expect_key = false;
                i += 1;
            }
            c if c.is_whitespace() => {
                out.push(c);
                i += 1;
            }
            c if expect_key && (c.is_alphanumeric() || c == '_' || c == '$') => {
                // Bare key: quote the identifier if a colon follows.
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ':' {
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                } else {
                    out.push_str(&ident);
                }
                expect_key = false;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Scan for top-level `{...}` substrings, respecting string/escape state.
fn balanced_object_candidates(text: &str) -> Vec<&str> {
    let mut candidates = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escape = false;

    for (idx, c) in text.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            candidates.push(&text[s..idx + c.len_utf8()]);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    candidates
}

/// Heuristic: the text was meant to be our JSON contract but is beyond
/// repair. Such text must not reach the user as-is.
fn looks_like_broken_json(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with('{')
        || trimmed.starts_with('[')
        || (text.contains("inner_heart") && text.contains("response"))
}

/// Treat the text as prose: drop a "here is the json" style preamble line
/// and collapse whitespace.
fn prose_response(raw: &str) -> Option<String> {
    let stripped = strip_code_fences(raw);
    let mut lines: Vec<&str> = stripped.lines().collect();

    if let Some(first) = lines.first() {
        let lower = first.to_lowercase();
        let is_preamble = (lower.contains("here") && lower.contains("json"))
            || lower.trim() == "json"
            || lower.trim_end().ends_with("json:");
        if is_preamble && lines.len() > 1 {
            lines.remove(0);
        }
    }

    let collapsed = lines
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ── Cascade steps ──────────────────────────────────────

    #[test]
    fn clean_json_parses_strictly() {
        let payload = normalize_assistant_payload(
            r#"{"emotion":"happy","inner_heart":"x","response":"y"}"#,
        );
        assert_eq!(payload.emotion, Emotion::Happy);
        assert_eq!(payload.inner_heart, "x");
        assert_eq!(payload.response, "y");
        assert_eq!(payload.narration, "");
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let raw = "```json\n{\"emotion\":\"angry\",\"inner_heart\":\"hmm\",\"response\":\"no\"}\n```";
        let payload = normalize_assistant_payload(raw);
        assert_eq!(payload.emotion, Emotion::Angry);
        assert_eq!(payload.response, "no");
    }

    #[test]
    fn single_quotes_bare_keys_and_trailing_comma_are_repaired() {
        let raw = "{emotion: 'happy', inner_heart: 'it\\'s fine', response: 'ok', }";
        let payload = normalize_assistant_payload(raw);
        assert_eq!(payload.emotion, Emotion::Happy);
        assert_eq!(payload.inner_heart, "it's fine");
        assert_eq!(payload.response, "ok");
    }

    #[test]
    fn smart_quotes_are_normalized() {
        let raw = "{\u{201C}emotion\u{201D}: \u{201C}happy\u{201D}, \u{201C}response\u{201D}: \u{201C}hey\u{201D}}";
        let payload = normalize_assistant_payload(raw);
        assert_eq!(payload.emotion, Emotion::Happy);
        assert_eq!(payload.response, "hey");
    }

    #[test]
    fn embedded_object_is_found_by_brace_scan() {
        let raw = "Sure! The answer is {\"emotion\":\"normal\",\"inner_heart\":\"\",\"response\":\"found me\"} hope that helps";
        let payload = normalize_assistant_payload(raw);
        assert_eq!(payload.response, "found me");
    }

    #[test]
    fn brace_scan_ignores_braces_inside_strings() {
        let raw = "noise {\"emotion\":\"happy\",\"response\":\"curly {not a block}\"} tail";
        let payload = normalize_assistant_payload(raw);
        assert_eq!(payload.response, "curly {not a block}");
    }

    #[test]
    fn broken_json_falls_back_to_filler_not_leak() {
        let raw = "{\"emotion\": \"happy\", \"inner_heart\": \"truncated";
        let payload = normalize_assistant_payload(raw);
        assert_eq!(payload.response, UNSTABLE_FORMAT_FILLER);
        assert!(!payload.response.contains("inner_heart"));
    }

    #[test]
    fn plain_prose_becomes_the_response() {
        let payload = normalize_assistant_payload("Good   morning!\nHow are you?");
        assert_eq!(payload.emotion, Emotion::Normal);
        assert_eq!(payload.response, "Good morning! How are you?");
        assert_eq!(payload.inner_heart, "");
    }

    #[test]
    fn json_preamble_line_is_stripped_from_prose() {
        let payload = normalize_assistant_payload("Here is the JSON you asked for:\nhello there");
        assert_eq!(payload.response, "hello there");
    }

    #[test]
    fn empty_input_yields_filler() {
        let payload = normalize_assistant_payload("   ");
        assert_eq!(payload.response, UNSTABLE_FORMAT_FILLER);
    }

    // ── Field coercion ─────────────────────────────────────

    #[test]
    fn unknown_emotion_coerces_to_normal() {
        let payload =
            normalize_assistant_payload(r#"{"emotion":"ECSTATIC","response":"hi"}"#);
        assert_eq!(payload.emotion, Emotion::Normal);
    }

    #[test]
    fn emotion_is_case_insensitive() {
        let payload = normalize_assistant_payload(r#"{"emotion":" Happy ","response":"hi"}"#);
        assert_eq!(payload.emotion, Emotion::Happy);
    }

    #[test]
    fn non_string_fields_default_to_empty() {
        let payload = normalize_assistant_payload(
            r#"{"emotion":"happy","inner_heart":42,"response":"hi","narration":null}"#,
        );
        assert_eq!(payload.inner_heart, "");
        assert_eq!(payload.narration, "");
    }

    #[test]
    fn empty_response_field_gets_filler() {
        let payload = normalize_assistant_payload(r#"{"emotion":"happy","response":"  "}"#);
        assert_eq!(payload.response, UNSTABLE_FORMAT_FILLER);
    }

    #[test]
    fn payload_serializes_lowercase_emotion() {
        let payload = normalize_assistant_payload(r#"{"emotion":"happy","response":"hi"}"#);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["emotion"], "happy");
    }

    // ── Never-fails property ───────────────────────────────

    proptest! {
        #[test]
        fn normalizer_always_returns_non_empty_response(raw in ".*") {
            let payload = normalize_assistant_payload(&raw);
            prop_assert!(!payload.response.trim().is_empty());
        }

        #[test]
        fn normalizer_handles_brace_heavy_noise(raw in "[{}\\[\\]\"',: a-z0-9]*") {
            let payload = normalize_assistant_payload(&raw);
            prop_assert!(!payload.response.is_empty());
        }
    }
}
