//! Embedding provider port.
//!
//! The engine never talks to an embedding service directly; it goes through
//! this trait so domain logic stays testable without a live model. The
//! Ollama-backed implementation lives in [`crate::ollama`].

use anyhow::Result;

/// External collaborator producing a vector embedding for a piece of text.
///
/// Implementations must bound their calls with a timeout; a failed or
/// timed-out lookup is an `Err`, which callers treat as "no embedding
/// available" and degrade to the lexical strategy.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
