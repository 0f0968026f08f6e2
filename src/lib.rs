//! Resilience gateway between a browser chat UI and the Gemini API:
//! admission control, context-cache reuse, budgeted bounded retries,
//! output normalization, and in-character degradation.

pub mod admission;
pub mod cache;
pub mod config;
pub mod error;
pub mod llm;
pub mod normalize;
pub mod orchestrator;
pub mod persona;
pub mod server;
