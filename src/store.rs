//! Document and category persistence.
//!
//! Owns document CRUD and the write paths for tag attachments and category
//! assignments, so the other components only touch the fields they are
//! responsible for (the clusterer writes cluster ids, the classifier writes
//! category assignments, the registry and refiner write tag attachments).

use std::sync::Arc;

use rusqlite::{OptionalExtension, params};
use time::OffsetDateTime;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{
    Category, CategoryId, ClusterId, Document, DocumentId, DocumentTag, TagAttachmentSource,
    TagId, embedding_from_bytes, embedding_to_bytes,
};

/// Shared persistence service for documents and categories.
pub struct DocumentStore {
    db: Arc<Database>,
}

impl DocumentStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Inserts a document, optionally with its embedding.
    pub fn add_document(&self, content: &str, embedding: Option<&[f32]>) -> Result<Document> {
        if content.trim().is_empty() {
            return Err(Error::Validation(
                "document content cannot be empty".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let blob = embedding.map(embedding_to_bytes);

        let conn = self.db.connection();
        conn.execute(
            "INSERT INTO documents (content, embedding, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![content, blob, now, now],
        )?;
        let id = DocumentId::new(conn.last_insert_rowid());

        Ok(Document::new(
            id,
            content,
            embedding.map(<[f32]>::to_vec),
            None,
            None,
            Vec::new(),
            OffsetDateTime::from_unix_timestamp(now)?,
            OffsetDateTime::from_unix_timestamp(now)?,
        ))
    }

    /// Loads a document with its tags, category and cluster assignment.
    ///
    /// Returns `None` for an unknown id; that is not an error condition.
    pub fn get_document(&self, id: DocumentId) -> Result<Option<Document>> {
        let conn = self.db.connection();

        let row: Option<(String, Option<Vec<u8>>, Option<i64>, i64, i64)> = conn
            .query_row(
                "SELECT content, embedding, cluster_id, created_at, updated_at
                 FROM documents WHERE id = ?1",
                [id.get()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((content, blob, cluster_id, created_at, updated_at)) = row else {
            return Ok(None);
        };

        let category: Option<(i64, f64)> = conn
            .query_row(
                "SELECT category_id, confidence FROM document_categories WHERE document_id = ?1",
                [id.get()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let mut stmt = conn.prepare(
            "SELECT tag_id, confidence, source, created_at FROM document_tags
             WHERE document_id = ?1 ORDER BY created_at, tag_id",
        )?;
        let rows = stmt.query_map([id.get()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut tags = Vec::new();
        for row in rows {
            let (tag_id, confidence, source, attached_at) = row?;
            tags.push(DocumentTag {
                tag_id: TagId::new(tag_id),
                confidence,
                source: TagAttachmentSource::parse(&source),
                attached_at: OffsetDateTime::from_unix_timestamp(attached_at)?,
            });
        }

        Ok(Some(Document::new(
            id,
            content,
            blob.as_deref().map(embedding_from_bytes),
            cluster_id.map(ClusterId::new),
            category.map(|(cat, conf)| (CategoryId::new(cat), conf)),
            tags,
            OffsetDateTime::from_unix_timestamp(created_at)?,
            OffsetDateTime::from_unix_timestamp(updated_at)?,
        )))
    }

    /// Stores or replaces a document's embedding.
    pub fn set_embedding(&self, id: DocumentId, embedding: &[f32]) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let updated = self.db.connection().execute(
            "UPDATE documents SET embedding = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.get(), embedding_to_bytes(embedding), now],
        )?;
        if updated == 0 {
            return Err(Error::not_found("document", id));
        }
        Ok(())
    }

    /// Attaches a tag to a document, replacing a prior attachment of the
    /// same tag. Confidence must be in `[0.0, 1.0]`.
    pub fn attach_tag(
        &self,
        document_id: DocumentId,
        tag_id: TagId,
        confidence: f64,
        source: TagAttachmentSource,
    ) -> Result<()> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(Error::Validation(format!(
                "confidence {confidence} out of range [0, 1]"
            )));
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let conn = self.db.connection();

        if !exists(&conn, "documents", document_id.get())? {
            return Err(Error::not_found("document", document_id));
        }
        if !exists(&conn, "tags", tag_id.get())? {
            return Err(Error::not_found("tag", tag_id));
        }

        conn.execute(
            "INSERT OR REPLACE INTO document_tags
             (document_id, tag_id, confidence, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                document_id.get(),
                tag_id.get(),
                confidence,
                source.as_str(),
                now
            ],
        )?;
        Ok(())
    }

    /// Detaches a tag from a document. Idempotent.
    pub fn remove_tag(&self, document_id: DocumentId, tag_id: TagId) -> Result<()> {
        self.db.connection().execute(
            "DELETE FROM document_tags WHERE document_id = ?1 AND tag_id = ?2",
            params![document_id.get(), tag_id.get()],
        )?;
        Ok(())
    }

    /// Records a category prediction for a document, replacing any prior
    /// assignment.
    pub fn assign_category(
        &self,
        document_id: DocumentId,
        category_id: CategoryId,
        confidence: f64,
    ) -> Result<()> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(Error::Validation(format!(
                "confidence {confidence} out of range [0, 1]"
            )));
        }

        let conn = self.db.connection();
        if !exists(&conn, "documents", document_id.get())? {
            return Err(Error::not_found("document", document_id));
        }
        if !exists(&conn, "categories", category_id.get())? {
            return Err(Error::not_found("category", category_id));
        }

        conn.execute(
            "INSERT OR REPLACE INTO document_categories (document_id, category_id, confidence)
             VALUES (?1, ?2, ?3)",
            params![document_id.get(), category_id.get(), confidence],
        )?;
        Ok(())
    }

    /// Creates a category bucket. Names are unique; a duplicate loses with a
    /// conflict.
    pub fn create_category(&self, name: &str, description: Option<&str>) -> Result<Category> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation(
                "category name cannot be empty".to_string(),
            ));
        }

        let conn = self.db.connection();
        conn.execute(
            "INSERT INTO categories (name, description) VALUES (?1, ?2)",
            params![name, description],
        )
        .map_err(|e| Error::from_insert(e, &format!("category '{name}'")))?;

        Ok(Category::new(
            CategoryId::new(conn.last_insert_rowid()),
            name,
            description.map(str::to_string),
        ))
    }

    /// All categories, ordered by name.
    pub fn list_categories(&self) -> Result<Vec<Category>> {
        let conn = self.db.connection();
        let mut stmt =
            conn.prepare("SELECT id, name, description FROM categories ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(Category::new(
                CategoryId::new(row.get(0)?),
                row.get::<_, String>(1)?,
                row.get(2)?,
            ))
        })?;

        let mut categories = Vec::new();
        for row in rows {
            categories.push(row?);
        }
        Ok(categories)
    }

    /// Number of stored documents.
    pub fn document_count(&self) -> Result<i64> {
        Ok(self
            .db
            .connection()
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?)
    }
}

fn exists(conn: &rusqlite::Connection, table: &str, id: i64) -> Result<bool> {
    // Table names come from call sites above, never from input.
    let sql = format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)");
    Ok(conn.query_row(&sql, [id], |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> DocumentStore {
        DocumentStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn tag_id(store: &DocumentStore, name: &str) -> TagId {
        let conn = store.db.connection();
        conn.execute(
            "INSERT INTO tags (name, created_at) VALUES (?1, 0)",
            [name],
        )
        .unwrap();
        TagId::new(conn.last_insert_rowid())
    }

    #[test]
    fn add_and_get_document_round_trip() {
        let store = store();
        let embedding = vec![0.1_f32, 0.2, 0.3];

        let doc = store
            .add_document("A note on Rust ownership", Some(&embedding))
            .unwrap();
        let loaded = store.get_document(doc.id()).unwrap().unwrap();

        assert_eq!(loaded.content(), "A note on Rust ownership");
        assert_eq!(loaded.embedding(), Some(embedding.as_slice()));
        assert_eq!(loaded.cluster_id(), None);
        assert_eq!(loaded.category(), None);
    }

    #[test]
    fn empty_content_is_rejected() {
        let store = store();
        let err = store.add_document("   ", None).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn get_unknown_document_returns_none() {
        let store = store();
        assert_eq!(store.get_document(DocumentId::new(404)).unwrap(), None);
    }

    #[test]
    fn attach_tag_validates_confidence_range() {
        let store = store();
        let doc = store.add_document("content", None).unwrap();
        let tag = tag_id(&store, "rust");

        let err = store
            .attach_tag(doc.id(), tag, 1.5, TagAttachmentSource::User)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn attach_and_remove_tag() {
        let store = store();
        let doc = store.add_document("content", None).unwrap();
        let tag = tag_id(&store, "rust");

        store
            .attach_tag(doc.id(), tag, 0.85, TagAttachmentSource::Refinement)
            .unwrap();

        let loaded = store.get_document(doc.id()).unwrap().unwrap();
        assert_eq!(loaded.tags().len(), 1);
        assert_eq!(loaded.tags()[0].tag_id, tag);
        assert_eq!(loaded.tags()[0].confidence, 0.85);
        assert_eq!(loaded.tags()[0].source, TagAttachmentSource::Refinement);

        store.remove_tag(doc.id(), tag).unwrap();
        // Removing again is idempotent.
        store.remove_tag(doc.id(), tag).unwrap();

        let loaded = store.get_document(doc.id()).unwrap().unwrap();
        assert!(loaded.tags().is_empty());
    }

    #[test]
    fn reattach_replaces_confidence() {
        let store = store();
        let doc = store.add_document("content", None).unwrap();
        let tag = tag_id(&store, "rust");

        store
            .attach_tag(doc.id(), tag, 0.5, TagAttachmentSource::Extraction)
            .unwrap();
        store
            .attach_tag(doc.id(), tag, 0.9, TagAttachmentSource::User)
            .unwrap();

        let loaded = store.get_document(doc.id()).unwrap().unwrap();
        assert_eq!(loaded.tags().len(), 1);
        assert_eq!(loaded.tags()[0].confidence, 0.9);
    }

    #[test]
    fn assign_category_round_trip() {
        let store = store();
        let doc = store.add_document("content", None).unwrap();
        let category = store.create_category("engineering", None).unwrap();

        store
            .assign_category(doc.id(), category.id(), 0.7)
            .unwrap();

        let loaded = store.get_document(doc.id()).unwrap().unwrap();
        assert_eq!(loaded.category(), Some((category.id(), 0.7)));
    }

    #[test]
    fn duplicate_category_name_conflicts() {
        let store = store();
        store.create_category("Engineering", None).unwrap();

        let err = store.create_category("engineering", None).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn set_embedding_on_unknown_document_fails() {
        let store = store();
        let err = store
            .set_embedding(DocumentId::new(404), &[0.1])
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
