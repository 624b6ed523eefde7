use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

use super::{CategoryId, ClusterId, DocumentId, TagId};

/// Where a document-tag attachment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagAttachmentSource {
    /// Attached by a human or an ingestion caller.
    User,
    /// Attached from semantic extraction of the document content.
    Extraction,
    /// Attached by the periodic refinement pass.
    Refinement,
}

impl TagAttachmentSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TagAttachmentSource::User => "user",
            TagAttachmentSource::Extraction => "extraction",
            TagAttachmentSource::Refinement => "refinement",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "extraction" => TagAttachmentSource::Extraction,
            "refinement" => TagAttachmentSource::Refinement,
            _ => TagAttachmentSource::User,
        }
    }
}

impl fmt::Display for TagAttachmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tag attached to a document with its confidence and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTag {
    pub tag_id: TagId,
    /// Certainty of the attachment, in `[0.0, 1.0]`.
    pub confidence: f64,
    pub source: TagAttachmentSource,
    #[serde(with = "time::serde::rfc3339")]
    pub attached_at: OffsetDateTime,
}

/// A unit of content with its current assignments.
///
/// Tag attachments are written by the registry and refiner, the cluster id
/// by the clusterer, the category by the classifier. A document with no
/// cluster id is a noise point from the last clustering pass (or has no
/// embedding).
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    id: DocumentId,
    content: String,
    embedding: Option<Vec<f32>>,
    cluster_id: Option<ClusterId>,
    category: Option<(CategoryId, f64)>,
    tags: Vec<DocumentTag>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl Document {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: DocumentId,
        content: impl Into<String>,
        embedding: Option<Vec<f32>>,
        cluster_id: Option<ClusterId>,
        category: Option<(CategoryId, f64)>,
        tags: Vec<DocumentTag>,
        created_at: OffsetDateTime,
        updated_at: OffsetDateTime,
    ) -> Self {
        Self {
            id,
            content: content.into(),
            embedding,
            cluster_id,
            category,
            tags,
            created_at,
            updated_at,
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }

    pub fn cluster_id(&self) -> Option<ClusterId> {
        self.cluster_id
    }

    /// Returns the assigned category and its confidence, if any.
    pub fn category(&self) -> Option<(CategoryId, f64)> {
        self.category
    }

    pub fn tags(&self) -> &[DocumentTag] {
        &self.tags
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }
}

/// Encodes an embedding as little-endian f32 bytes for BLOB storage.
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decodes a BLOB back into an embedding vector.
pub(crate) fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
