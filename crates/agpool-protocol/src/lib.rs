//! Wire types for agpool.
//!
//! Downstream dialects (OpenAI chat completions, Anthropic messages, Gemini
//! generateContent) plus the canonical upstream envelope that all three are
//! translated through. The translator crate owns the conversions; this crate
//! only owns shapes and serde.

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod sse;
pub mod upstream;
