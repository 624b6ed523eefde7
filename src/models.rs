//! Domain types for the tagging engine.
//!
//! All entities use newtype ids wrapping database row ids, and confidence
//! scores are `f64` values in `[0.0, 1.0]` validated at the write boundary.

mod category;
mod document;
mod edge;
mod ids;
mod tag;

pub use category::Category;
pub use document::{Document, DocumentTag, TagAttachmentSource};
pub(crate) use document::{embedding_from_bytes, embedding_to_bytes};
pub use edge::EdgeType;
pub use ids::{CategoryId, ClusterId, DocumentId, TagId};
pub use tag::Tag;
