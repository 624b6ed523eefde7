use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed relationship between a tag and another tag or a category.
///
/// A fixed enumeration rather than free-form relation strings: `ChildOf`
/// links a tag to a broader parent tag (the chain must stay acyclic),
/// `BelongsTo` links a tag to a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    ChildOf,
    BelongsTo,
}

impl EdgeType {
    /// Stable storage name for the edge type column.
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeType::ChildOf => "child_of",
            EdgeType::BelongsTo => "belongs_to",
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_names_are_stable() {
        assert_eq!(EdgeType::ChildOf.as_str(), "child_of");
        assert_eq!(EdgeType::BelongsTo.as_str(), "belongs_to");
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&EdgeType::ChildOf).unwrap();
        assert_eq!(json, "\"child_of\"");
    }
}
