//! In-character degradation payloads.
//!
//! When the upstream model cannot be reached within budget, the user still
//! gets a message in the character's own voice asking them to resend — the
//! boundary between "system failure" and "the character speaking" stays
//! invisible. Pure functions, no failure modes.

use crate::normalize::{Emotion, NormalizedPayload};

/// Personas with scripted prompts (and context-cache eligibility).
pub const SUPPORTED_CHARACTERS: [&str; 3] = ["mika", "alice", "kael"];

pub fn is_supported(character_id: &str) -> bool {
    SUPPORTED_CHARACTERS.contains(&character_id)
}

/// Static fallback payload for an unreachable upstream, voiced per persona.
/// Unrecognized identifiers get a persona-neutral polite line.
pub fn upstream_fallback_payload(character_id: &str) -> NormalizedPayload {
    let (inner_heart, response) = match character_id {
        "mika" => (
            "선생님이 기다렸을 텐데... 잠깐 숨 고르고 다시 집중하자.",
            "선생님, 방금 신호가 살짝 흔들렸어. 한 번만 다시 말해줘. 이번엔 제대로 들을게.",
        ),
        "alice" => (
            "연결이 순간 흔들렸군. 침착하게 다시 정비하면 된다.",
            "통신이 잠시 불안정했다. 같은 내용을 한 번 더 전해주겠는가.",
        ),
        "kael" => (
            "아... 튕겼네. 기다리게 해서 미안한데 다시 받으면 된다.",
            "지금 신호 잠깐 튐. 한 번만 다시 보내줘.",
        ),
        _ => (
            "응답 연결이 잠시 불안정했다.",
            "연결이 잠시 흔들렸어요. 같은 내용을 한 번만 다시 보내주세요.",
        ),
    };

    NormalizedPayload {
        emotion: Emotion::Normal,
        inner_heart: inner_heart.to_string(),
        response: response.to_string(),
        narration: String::new(),
    }
}
