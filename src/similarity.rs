//! Similarity scoring between short strings and between embedding vectors.
//!
//! Two interchangeable strategies: a lexical fallback (Jaccard similarity
//! over character sets) that is always available, and cosine similarity over
//! embeddings when a provider is configured and responds. An embedding
//! failure degrades silently to the lexical strategy for that call and emits
//! a non-fatal warning.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use crate::embeddings::EmbeddingProvider;

/// Which strategy actually produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Lexical,
    Vector,
}

/// A similarity score together with the strategy that computed it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub value: f64,
    pub strategy: Strategy,
}

/// Configuration for similarity matching.
///
/// Parsed from environment variables at call time with fallback defaults.
/// The threshold applies to whichever strategy executed; it is a single
/// tunable rather than a per-strategy constant.
#[derive(Debug, Clone)]
pub struct SimilarityConfig {
    /// Minimum score for a fuzzy match (default 0.7).
    pub threshold: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self { threshold: 0.7 }
    }
}

impl SimilarityConfig {
    /// Parses configuration from environment variables.
    ///
    /// Falls back to defaults when env vars are not set or invalid.
    ///
    /// # Environment Variables
    ///
    /// - `TAXO_SIMILARITY_THRESHOLD` (f64, default 0.7)
    pub fn from_env() -> Self {
        let threshold = std::env::var("TAXO_SIMILARITY_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.7);

        Self { threshold }
    }
}

/// Normalized Jaccard similarity over the character sets of two strings.
///
/// Cheap and always available. Returns 1.0 for two empty strings.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<char> = a.chars().collect();
    let set_b: HashSet<char> = b.chars().collect();

    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();

    intersection as f64 / union as f64
}

/// Cosine similarity between two embedding vectors.
///
/// Returns 0.0 for mismatched dimensions or zero-magnitude vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Scores similarity between items, preferring embeddings when available.
#[derive(Clone, Default)]
pub struct SimilarityIndex {
    provider: Option<Arc<dyn EmbeddingProvider>>,
}

impl SimilarityIndex {
    /// An index using only the lexical strategy.
    pub fn lexical() -> Self {
        Self { provider: None }
    }

    /// An index that tries the embedding provider first and falls back to
    /// the lexical strategy when a lookup fails.
    pub fn with_provider(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    /// Scores two short strings.
    ///
    /// When a provider is configured, both strings are embedded and compared
    /// by cosine similarity. Any lookup failure degrades to Jaccard for this
    /// call and logs a degraded-mode warning; execution continues.
    pub fn score(&self, a: &str, b: &str) -> Similarity {
        if let Some(provider) = &self.provider {
            match provider.embed(a).and_then(|va| {
                let vb = provider.embed(b)?;
                Ok((va, vb))
            }) {
                Ok((va, vb)) => {
                    return Similarity {
                        value: cosine(&va, &vb),
                        strategy: Strategy::Vector,
                    };
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        "embedding lookup failed, degrading to lexical similarity"
                    );
                }
            }
        }

        Similarity {
            value: jaccard(a, b),
            strategy: Strategy::Lexical,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::testing::{FailingProvider, StaticProvider};
    use serial_test::serial;

    #[test]
    fn jaccard_identical_strings_score_one() {
        assert_eq!(jaccard("rust", "rust"), 1.0);
    }

    #[test]
    fn jaccard_disjoint_strings_score_zero() {
        assert_eq!(jaccard("abc", "xyz"), 0.0);
    }

    #[test]
    fn jaccard_partial_overlap() {
        // sets {a,b,c} and {b,c,d}: intersection 2, union 4
        assert!((jaccard("abc", "bcd") - 0.5).abs() < 1e-12);
    }

    #[test]
    fn jaccard_empty_strings_score_one() {
        assert_eq!(jaccard("", ""), 1.0);
    }

    #[test]
    fn cosine_parallel_vectors_score_one() {
        let score = cosine(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_orthogonal_vectors_score_zero() {
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_mismatched_dimensions_score_zero() {
        assert_eq!(cosine(&[1.0, 0.0], &[1.0]), 0.0);
    }

    #[test]
    fn index_uses_vector_strategy_when_provider_succeeds() {
        let provider = StaticProvider::new(vec![
            ("kubernetes", vec![1.0, 0.0]),
            ("k8s", vec![1.0, 0.0]),
        ]);
        let index = SimilarityIndex::with_provider(Arc::new(provider));

        let sim = index.score("kubernetes", "k8s");
        assert_eq!(sim.strategy, Strategy::Vector);
        assert!((sim.value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn index_degrades_to_lexical_on_provider_failure() {
        let index = SimilarityIndex::with_provider(Arc::new(FailingProvider));

        let sim = index.score("rust", "rust");
        assert_eq!(sim.strategy, Strategy::Lexical);
        assert_eq!(sim.value, 1.0);
    }

    #[test]
    fn lexical_index_never_touches_a_provider() {
        let sim = SimilarityIndex::lexical().score("abc", "bcd");
        assert_eq!(sim.strategy, Strategy::Lexical);
    }

    #[test]
    #[serial]
    fn config_reads_threshold_from_env() {
        // SAFETY: test-only env mutation, serialized via serial_test.
        unsafe { std::env::set_var("TAXO_SIMILARITY_THRESHOLD", "0.85") };
        let config = SimilarityConfig::from_env();
        assert_eq!(config.threshold, 0.85);
        unsafe { std::env::remove_var("TAXO_SIMILARITY_THRESHOLD") };
    }

    #[test]
    #[serial]
    fn config_falls_back_to_default() {
        unsafe { std::env::remove_var("TAXO_SIMILARITY_THRESHOLD") };
        let config = SimilarityConfig::from_env();
        assert_eq!(config.threshold, 0.7);
    }
}
