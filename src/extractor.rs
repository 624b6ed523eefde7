//! Semantic analysis port for untagged content.
//!
//! The tagging pass asks a [`SemanticExtractor`] for the concepts and
//! entities a document is about, then resolves each concept through the
//! registry. Implementations that cannot analyze (endpoint down, garbled
//! output) return an empty analysis so tagging degrades instead of failing.

/// A topic the document is about, with how central it is.
#[derive(Debug, Clone, PartialEq)]
pub struct Concept {
    pub name: String,
    /// Centrality in `[0.0, 1.0]`, used as the attachment confidence.
    pub importance: f64,
    pub description: Option<String>,
}

/// A named thing mentioned in the document.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub name: String,
    /// Free-form kind, e.g. "person", "technology", "organization".
    pub kind: String,
    pub description: Option<String>,
}

/// Everything an extractor found in one piece of content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    pub concepts: Vec<Concept>,
    pub entities: Vec<Entity>,
}

impl Analysis {
    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty() && self.entities.is_empty()
    }
}

/// Pulls concepts and entities out of raw text.
pub trait SemanticExtractor: Send + Sync {
    fn analyze(&self, text: &str) -> anyhow::Result<Analysis>;
}
