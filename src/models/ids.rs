use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        ///
        /// Wraps a database ID to provide type safety and prevent accidental
        /// mixing of different ID types.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            /// Returns the underlying ID value.
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id! {
    /// Unique identifier for a canonical tag.
    TagId
}

define_id! {
    /// Unique identifier for a classification category.
    CategoryId
}

define_id! {
    /// Unique identifier for a document.
    DocumentId
}

define_id! {
    /// Unique identifier for a document cluster.
    ///
    /// Cluster ids are not stable across clustering passes; only membership
    /// partitions are meaningful.
    ClusterId
}
