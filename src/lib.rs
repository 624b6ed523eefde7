pub mod classifier;
pub mod clusterer;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod models;
pub mod ollama;
pub mod refiner;
pub mod registry;
pub mod similarity;
pub mod store;
pub mod tagging;

pub use classifier::CategoryClassifier;
pub use clusterer::DocumentClusterer;
pub use db::Database;
pub use error::{Error, Result};
pub use models::{Category, Document, DocumentTag, Tag, TagAttachmentSource};
pub use refiner::TagRefiner;
pub use registry::TagRegistry;
pub use similarity::SimilarityIndex;
pub use store::DocumentStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_accessible_from_crate_root() {
        let db = Database::in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn components_accessible_from_crate_root() {
        use std::sync::Arc;

        let db = Arc::new(Database::in_memory().unwrap());
        let registry = TagRegistry::new(Arc::clone(&db));
        let resolved = registry.normalize_tag("Rust").unwrap();
        assert!(resolved.is_new);

        let store = DocumentStore::new(Arc::clone(&db));
        assert_eq!(store.document_count().unwrap(), 0);

        let _clusterer = DocumentClusterer::new(Arc::clone(&db));
        let _classifier = CategoryClassifier::new(db);
    }
}
