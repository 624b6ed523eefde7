use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::TagId;

/// A canonical tag with optional synonyms.
///
/// Tags use a SKOS-inspired vocabulary model where `name` is the preferred
/// label and `synonyms` are alternative labels resolving to the same concept
/// during normalization. Names are unique case-insensitively; synonyms are
/// the 0.95-confidence resolution path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    id: TagId,
    name: String,
    description: Option<String>,
    synonyms: Vec<String>,
    usage_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}

impl Tag {
    pub fn new(
        id: TagId,
        name: impl Into<String>,
        description: Option<String>,
        synonyms: Vec<String>,
        usage_count: i64,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            description,
            synonyms,
            usage_count,
            created_at,
        }
    }

    /// Returns the tag's unique identifier.
    pub fn id(&self) -> TagId {
        self.id
    }

    /// Returns the preferred label for this tag.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the alternative labels for this tag.
    pub fn synonyms(&self) -> &[String] {
        &self.synonyms
    }

    /// Returns how many documents currently reference this tag.
    /// Never negative.
    pub fn usage_count(&self) -> i64 {
        self.usage_count
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, synonyms: Vec<String>) -> Tag {
        Tag::new(
            TagId::new(1),
            name,
            None,
            synonyms,
            0,
            OffsetDateTime::now_utc(),
        )
    }

    #[test]
    fn new_creates_tag_with_accessors() {
        let tag = sample("rust", vec![]);

        assert_eq!(tag.id(), TagId::new(1));
        assert_eq!(tag.name(), "rust");
        assert!(tag.synonyms().is_empty());
        assert_eq!(tag.usage_count(), 0);
        assert_eq!(tag.description(), None);
    }

    #[test]
    fn synonyms_are_preserved() {
        let tag = sample(
            "kubernetes",
            vec!["k8s".to_string(), "kube".to_string()],
        );

        assert_eq!(tag.synonyms(), &["k8s", "kube"]);
    }
}
