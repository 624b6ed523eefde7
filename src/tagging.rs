//! The automatic tagging pass for a stored document.
//!
//! Runs the semantic extractor over the document's content, resolves each
//! concept through the registry, and attaches the result with the concept's
//! importance as confidence. Extractor failure degrades to an empty
//! analysis, leaving the document untouched rather than failing the pass.

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::extractor::SemanticExtractor;
use crate::models::{DocumentId, TagAttachmentSource};
use crate::registry::TagRegistry;
use crate::store::DocumentStore;

/// Counts from one tagging pass.
#[derive(Debug, Clone)]
pub struct TaggingReport {
    /// Concepts the extractor produced.
    pub concept_count: usize,
    /// Tags actually attached (existing attachments are replaced, not
    /// double-counted).
    pub attached_count: usize,
}

/// Tags a document from its content.
pub fn tag_document(
    registry: &TagRegistry,
    store: &DocumentStore,
    extractor: &dyn SemanticExtractor,
    document_id: DocumentId,
) -> Result<TaggingReport> {
    let document = store
        .get_document(document_id)?
        .ok_or_else(|| Error::not_found("document", document_id))?;

    let analysis = match extractor.analyze(document.content()) {
        Ok(analysis) => analysis,
        Err(err) => {
            warn!(document = %document_id, error = %err, "extractor failed, tagging with empty analysis");
            Default::default()
        }
    };

    let mut attached_count = 0;
    for concept in &analysis.concepts {
        let (tag, _created) = registry.ensure_tag(&concept.name)?;
        store.attach_tag(
            document_id,
            tag.id(),
            concept.importance.clamp(0.0, 1.0),
            TagAttachmentSource::Extraction,
        )?;
        registry.increment_usage(tag.id())?;
        attached_count += 1;
    }

    info!(
        document = %document_id,
        concepts = analysis.concepts.len(),
        attached = attached_count,
        "tagged document"
    );
    Ok(TaggingReport {
        concept_count: analysis.concepts.len(),
        attached_count,
    })
}
