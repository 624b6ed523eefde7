//! Ollama HTTP client and the trait adapters built on it.
//!
//! `client` holds the blocking HTTP client with retry and timeout handling;
//! `adapters` implements the engine's collaborator ports (embeddings,
//! semantic extraction, relevance assessment) on top of it.
mod adapters;
mod client;

pub use adapters::{OllamaAssessor, OllamaEmbedding, OllamaExtractor};
pub use client::{OllamaClient, OllamaClientBuilder, OllamaClientTrait, OllamaError};
