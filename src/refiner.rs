//! Tag set refinement for already-tagged documents.
//!
//! A [`RelevanceAssessor`] judges each attached tag and proposes additions;
//! the refiner applies the verdicts: low-relevance tags come off, highly
//! relevant suggestions go on, resolved through the registry so spelling
//! variants never mint duplicates. Refinement serializes per document but
//! distinct documents refine in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::OptionalExtension;
use serde::Deserialize;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{DocumentId, TagAttachmentSource, TagId};
use crate::registry::TagRegistry;
use crate::store::DocumentStore;

/// Confidence recorded when a suggestion resolves to an existing tag.
const EXISTING_TAG_CONFIDENCE: f64 = 0.85;
/// Confidence recorded when a suggestion mints a new tag.
const NEW_TAG_CONFIDENCE: f64 = 0.75;

/// Assessor verdict for a single tag or suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relevance {
    High,
    Medium,
    Low,
}

/// Verdict on a tag currently attached to the document.
#[derive(Debug, Clone)]
pub struct TagJudgment {
    pub tag_id: TagId,
    pub relevance: Relevance,
}

/// A tag the assessor thinks the document should carry.
#[derive(Debug, Clone)]
pub struct TagSuggestion {
    pub name: String,
    pub relevance: Relevance,
    pub reasoning: String,
}

/// Full assessment of a document's tag set.
#[derive(Debug, Clone, Default)]
pub struct Assessment {
    pub tag_judgments: Vec<TagJudgment>,
    pub suggestions: Vec<TagSuggestion>,
}

/// Judges how well a document's tags fit its content.
pub trait RelevanceAssessor: Send + Sync {
    fn assess(&self, content: &str, current_tags: &[(TagId, String)])
    -> anyhow::Result<Assessment>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineStatus {
    Refined,
    /// Nothing to do or the assessor was unavailable; the document's tags
    /// are untouched.
    Skipped,
}

/// Counts reported by one refinement pass.
#[derive(Debug, Clone)]
pub struct RefineReport {
    pub status: RefineStatus,
    pub removed_count: usize,
    pub added_count: usize,
}

impl RefineReport {
    fn skipped() -> Self {
        Self {
            status: RefineStatus::Skipped,
            removed_count: 0,
            added_count: 0,
        }
    }
}

/// One co-occurring tag in a related-tags query.
#[derive(Debug, Clone)]
pub struct RelatedTag {
    pub tag_id: TagId,
    pub name: String,
    pub co_occurrence_count: u64,
    /// Share of the queried tag's documents that also carry this tag.
    pub frequency: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelatedStatus {
    Computed,
    /// The tag exists but no document carries it.
    Skipped,
}

/// Result of a co-occurrence query for one tag.
#[derive(Debug, Clone)]
pub struct RelatedTags {
    pub status: RelatedStatus,
    pub tag_name: String,
    /// How many documents carry the queried tag.
    pub document_count: u64,
    pub related: Vec<RelatedTag>,
}

/// Applies assessor verdicts to document tag sets.
pub struct TagRefiner {
    db: Arc<Database>,
    registry: Arc<TagRegistry>,
    store: DocumentStore,
    assessor: Arc<dyn RelevanceAssessor>,
    // One lock per in-flight document id, so refinement never races with
    // itself on the same document.
    locks: Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>,
}

impl TagRefiner {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<TagRegistry>,
        assessor: Arc<dyn RelevanceAssessor>,
    ) -> Self {
        let store = DocumentStore::new(Arc::clone(&db));
        Self {
            db,
            registry,
            store,
            assessor,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Re-evaluates a document's tags against its content.
    ///
    /// Low-relevance tags are detached; highly relevant suggestions are
    /// resolved through the registry and attached (existing tags at 0.85,
    /// newly minted ones at 0.75, both marked as refinement-sourced).
    /// Medium relevance changes nothing in either direction. A missing
    /// document, an empty tag set, empty content, or an assessor failure
    /// all skip the pass without touching the document.
    pub fn refine_document_tags(&self, document_id: DocumentId) -> Result<RefineReport> {
        let doc_lock = self.lock_for(document_id);
        let result = {
            let _guard = doc_lock.lock().expect("document lock poisoned");
            self.refine_locked(document_id)
        };
        drop(doc_lock);
        self.release_lock(document_id);
        result
    }

    fn refine_locked(&self, document_id: DocumentId) -> Result<RefineReport> {
        let Some(document) = self.store.get_document(document_id)? else {
            info!(document = %document_id, "skipping refinement, document not found");
            return Ok(RefineReport::skipped());
        };
        if document.content().trim().is_empty() || document.tags().is_empty() {
            info!(document = %document_id, "skipping refinement, nothing to assess");
            return Ok(RefineReport::skipped());
        }

        let mut current_tags = Vec::with_capacity(document.tags().len());
        for attached in document.tags() {
            // Tags deleted since attachment drop out of the assessment.
            if let Some(tag) = self.registry.get_tag(attached.tag_id)? {
                current_tags.push((attached.tag_id, tag.name().to_string()));
            }
        }
        if current_tags.is_empty() {
            return Ok(RefineReport::skipped());
        }

        let assessment = match self.assessor.assess(document.content(), &current_tags) {
            Ok(assessment) => assessment,
            Err(err) => {
                warn!(document = %document_id, error = %err, "assessor unavailable, skipping refinement");
                return Ok(RefineReport::skipped());
            }
        };

        let mut removed_count = 0;
        let mut attached: Vec<TagId> = current_tags.iter().map(|(id, _)| *id).collect();
        for judgment in &assessment.tag_judgments {
            if judgment.relevance == Relevance::Low && attached.contains(&judgment.tag_id) {
                self.store.remove_tag(document_id, judgment.tag_id)?;
                attached.retain(|id| *id != judgment.tag_id);
                removed_count += 1;
            }
        }

        let mut added_count = 0;
        for suggestion in &assessment.suggestions {
            if suggestion.relevance != Relevance::High {
                continue;
            }
            let (tag, created) = self.registry.ensure_tag(&suggestion.name)?;
            if attached.contains(&tag.id()) {
                continue;
            }
            let confidence = if created {
                NEW_TAG_CONFIDENCE
            } else {
                EXISTING_TAG_CONFIDENCE
            };
            self.store.attach_tag(
                document_id,
                tag.id(),
                confidence,
                TagAttachmentSource::Refinement,
            )?;
            self.registry.increment_usage(tag.id())?;
            attached.push(tag.id());
            added_count += 1;
        }

        info!(
            document = %document_id,
            removed = removed_count,
            added = added_count,
            "refined document tags"
        );
        Ok(RefineReport {
            status: RefineStatus::Refined,
            removed_count,
            added_count,
        })
    }

    /// Tags that co-occur with the given tag, ranked by how many documents
    /// carry both.
    pub fn suggest_related_tags(&self, tag_id: TagId, limit: usize) -> Result<RelatedTags> {
        let conn = self.db.connection();

        let tag_name: Option<String> = conn
            .query_row("SELECT name FROM tags WHERE id = ?1", [tag_id.get()], |r| {
                r.get(0)
            })
            .optional()?;
        let tag_name = tag_name.ok_or_else(|| Error::not_found("tag", tag_id))?;

        let document_count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM document_tags WHERE tag_id = ?1",
            [tag_id.get()],
            |r| r.get(0),
        )?;
        if document_count == 0 {
            return Ok(RelatedTags {
                status: RelatedStatus::Skipped,
                tag_name,
                document_count: 0,
                related: Vec::new(),
            });
        }

        let mut stmt = conn.prepare(
            "SELECT dt2.tag_id, t.name, COUNT(*) AS occurrences
             FROM document_tags dt1
             JOIN document_tags dt2
               ON dt2.document_id = dt1.document_id AND dt2.tag_id != dt1.tag_id
             JOIN tags t ON t.id = dt2.tag_id
             WHERE dt1.tag_id = ?1
             GROUP BY dt2.tag_id
             ORDER BY occurrences DESC, t.name ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![tag_id.get(), limit as i64],
            |row| {
                let count: u64 = row.get(2)?;
                Ok(RelatedTag {
                    tag_id: TagId::new(row.get(0)?),
                    name: row.get(1)?,
                    co_occurrence_count: count,
                    frequency: count as f64 / document_count as f64,
                })
            },
        )?;

        let mut related = Vec::new();
        for row in rows {
            related.push(row?);
        }
        Ok(RelatedTags {
            status: RelatedStatus::Computed,
            tag_name,
            document_count,
            related,
        })
    }

    fn lock_for(&self, document_id: DocumentId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        Arc::clone(locks.entry(document_id).or_default())
    }

    /// Drops the map entry once no refinement holds the lock, so the map
    /// stays bounded by the number of in-flight documents.
    fn release_lock(&self, document_id: DocumentId) {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        if locks
            .get(&document_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&document_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tag;
    use crate::registry::TagDraft;

    struct FixedAssessor(Assessment);

    impl RelevanceAssessor for FixedAssessor {
        fn assess(
            &self,
            _content: &str,
            _current_tags: &[(TagId, String)],
        ) -> anyhow::Result<Assessment> {
            Ok(self.0.clone())
        }
    }

    struct FailingAssessor;

    impl RelevanceAssessor for FailingAssessor {
        fn assess(
            &self,
            _content: &str,
            _current_tags: &[(TagId, String)],
        ) -> anyhow::Result<Assessment> {
            anyhow::bail!("model endpoint unreachable")
        }
    }

    struct Fixture {
        db: Arc<Database>,
        registry: Arc<TagRegistry>,
        store: DocumentStore,
    }

    impl Fixture {
        fn new() -> Self {
            let db = Arc::new(Database::in_memory().expect("in-memory database"));
            let registry = Arc::new(TagRegistry::new(Arc::clone(&db)));
            let store = DocumentStore::new(Arc::clone(&db));
            Self {
                db,
                registry,
                store,
            }
        }

        fn refiner(&self, assessor: impl RelevanceAssessor + 'static) -> TagRefiner {
            TagRefiner::new(
                Arc::clone(&self.db),
                Arc::clone(&self.registry),
                Arc::new(assessor),
            )
        }

        fn tag(&self, name: &str) -> Tag {
            self.registry.create_tag(TagDraft::named(name)).unwrap()
        }
    }

    #[test]
    fn low_tags_removed_high_suggestions_added() {
        let fx = Fixture::new();
        let weak = fx.tag("blockchain");
        let kept = fx.tag("databases");
        let existing = fx.tag("sqlite");

        let doc = fx.store.add_document("notes on sqlite indexing", None).unwrap();
        fx.store
            .attach_tag(doc.id(), weak.id(), 0.9, TagAttachmentSource::Extraction)
            .unwrap();
        fx.store
            .attach_tag(doc.id(), kept.id(), 0.9, TagAttachmentSource::User)
            .unwrap();

        let refiner = fx.refiner(FixedAssessor(Assessment {
            tag_judgments: vec![
                TagJudgment {
                    tag_id: weak.id(),
                    relevance: Relevance::Low,
                },
                TagJudgment {
                    tag_id: kept.id(),
                    relevance: Relevance::High,
                },
            ],
            suggestions: vec![
                TagSuggestion {
                    name: "SQLite".to_string(),
                    relevance: Relevance::High,
                    reasoning: "document is about sqlite".to_string(),
                },
                TagSuggestion {
                    name: "query planning".to_string(),
                    relevance: Relevance::High,
                    reasoning: "discusses index selection".to_string(),
                },
            ],
        }));

        let report = refiner.refine_document_tags(doc.id()).unwrap();

        assert_eq!(report.status, RefineStatus::Refined);
        assert_eq!(report.removed_count, 1);
        assert_eq!(report.added_count, 2);

        let refreshed = fx.store.get_document(doc.id()).unwrap().unwrap();
        let ids: Vec<TagId> = refreshed.tags().iter().map(|t| t.tag_id).collect();
        assert!(!ids.contains(&weak.id()));
        assert!(ids.contains(&kept.id()));
        assert!(ids.contains(&existing.id()));

        // Existing resolution attaches at 0.85, a freshly minted tag at 0.75.
        let sqlite_attachment = refreshed
            .tags()
            .iter()
            .find(|t| t.tag_id == existing.id())
            .unwrap();
        assert_eq!(sqlite_attachment.confidence, 0.85);
        assert_eq!(sqlite_attachment.source, TagAttachmentSource::Refinement);

        let minted = fx.registry.normalize_tag("query planning").unwrap();
        let minted_attachment = refreshed
            .tags()
            .iter()
            .find(|t| Some(t.tag_id) == minted.tag_id)
            .unwrap();
        assert_eq!(minted_attachment.confidence, 0.75);
    }

    #[test]
    fn medium_relevance_changes_nothing() {
        let fx = Fixture::new();
        let tag = fx.tag("rust");
        let doc = fx.store.add_document("some content", None).unwrap();
        fx.store
            .attach_tag(doc.id(), tag.id(), 0.6, TagAttachmentSource::User)
            .unwrap();

        let refiner = fx.refiner(FixedAssessor(Assessment {
            tag_judgments: vec![TagJudgment {
                tag_id: tag.id(),
                relevance: Relevance::Medium,
            }],
            suggestions: vec![TagSuggestion {
                name: "maybe-relevant".to_string(),
                relevance: Relevance::Medium,
                reasoning: "tangential".to_string(),
            }],
        }));

        let report = refiner.refine_document_tags(doc.id()).unwrap();

        assert_eq!(report.removed_count, 0);
        assert_eq!(report.added_count, 0);
        // Medium suggestions never mint tags.
        assert!(fx.registry.normalize_tag("maybe-relevant").unwrap().is_new);
    }

    #[test]
    fn assessor_failure_skips_without_changes() {
        let fx = Fixture::new();
        let tag = fx.tag("rust");
        let doc = fx.store.add_document("content", None).unwrap();
        fx.store
            .attach_tag(doc.id(), tag.id(), 0.6, TagAttachmentSource::User)
            .unwrap();

        let refiner = fx.refiner(FailingAssessor);
        let report = refiner.refine_document_tags(doc.id()).unwrap();

        assert_eq!(report.status, RefineStatus::Skipped);
        let refreshed = fx.store.get_document(doc.id()).unwrap().unwrap();
        assert_eq!(refreshed.tags().len(), 1);
    }

    #[test]
    fn untagged_document_is_skipped() {
        let fx = Fixture::new();
        let doc = fx.store.add_document("content", None).unwrap();

        let refiner = fx.refiner(FixedAssessor(Assessment::default()));
        let report = refiner.refine_document_tags(doc.id()).unwrap();
        assert_eq!(report.status, RefineStatus::Skipped);
    }

    #[test]
    fn missing_document_is_skipped() {
        let fx = Fixture::new();
        let refiner = fx.refiner(FixedAssessor(Assessment::default()));

        let report = refiner.refine_document_tags(DocumentId::new(404)).unwrap();
        assert_eq!(report.status, RefineStatus::Skipped);
    }

    #[test]
    fn duplicate_high_suggestion_attaches_once() {
        let fx = Fixture::new();
        let tag = fx.tag("rust");
        let doc = fx.store.add_document("rust content", None).unwrap();
        fx.store
            .attach_tag(doc.id(), tag.id(), 0.9, TagAttachmentSource::User)
            .unwrap();

        // The suggestion resolves to a tag the document already carries.
        let refiner = fx.refiner(FixedAssessor(Assessment {
            tag_judgments: vec![],
            suggestions: vec![TagSuggestion {
                name: "Rust".to_string(),
                relevance: Relevance::High,
                reasoning: "already there".to_string(),
            }],
        }));

        let report = refiner.refine_document_tags(doc.id()).unwrap();
        assert_eq!(report.added_count, 0);

        let refreshed = fx.store.get_document(doc.id()).unwrap().unwrap();
        let attachment = &refreshed.tags()[0];
        // The original attachment survives untouched.
        assert_eq!(attachment.confidence, 0.9);
        assert_eq!(attachment.source, TagAttachmentSource::User);
    }

    #[test]
    fn lock_map_empties_once_refinements_finish() {
        let fx = Fixture::new();
        let tag = fx.tag("rust");
        let refiner = fx.refiner(FixedAssessor(Assessment::default()));

        for i in 0..3 {
            let doc = fx
                .store
                .add_document(&format!("doc {i}"), None)
                .unwrap();
            fx.store
                .attach_tag(doc.id(), tag.id(), 0.9, TagAttachmentSource::User)
                .unwrap();
            refiner.refine_document_tags(doc.id()).unwrap();
        }
        // Skipped passes release their entry too.
        refiner.refine_document_tags(DocumentId::new(404)).unwrap();

        assert!(refiner.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn related_tags_ranked_by_co_occurrence() {
        let fx = Fixture::new();
        let rust = fx.tag("rust");
        let tokio = fx.tag("tokio");
        let serde = fx.tag("serde");

        // rust+tokio on two documents, rust+serde on one.
        for i in 0..2 {
            let doc = fx
                .store
                .add_document(&format!("async doc {i}"), None)
                .unwrap();
            fx.store
                .attach_tag(doc.id(), rust.id(), 0.9, TagAttachmentSource::User)
                .unwrap();
            fx.store
                .attach_tag(doc.id(), tokio.id(), 0.9, TagAttachmentSource::User)
                .unwrap();
        }
        let doc = fx.store.add_document("serialization doc", None).unwrap();
        fx.store
            .attach_tag(doc.id(), rust.id(), 0.9, TagAttachmentSource::User)
            .unwrap();
        fx.store
            .attach_tag(doc.id(), serde.id(), 0.9, TagAttachmentSource::User)
            .unwrap();

        let refiner = fx.refiner(FixedAssessor(Assessment::default()));
        let related = refiner.suggest_related_tags(rust.id(), 10).unwrap();

        assert_eq!(related.status, RelatedStatus::Computed);
        assert_eq!(related.document_count, 3);
        assert_eq!(related.related.len(), 2);
        assert_eq!(related.related[0].name, "tokio");
        assert_eq!(related.related[0].co_occurrence_count, 2);
        assert!((related.related[0].frequency - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(related.related[1].name, "serde");
    }

    #[test]
    fn related_tags_respects_limit() {
        let fx = Fixture::new();
        let hub = fx.tag("hub");
        let doc = fx.store.add_document("content", None).unwrap();
        fx.store
            .attach_tag(doc.id(), hub.id(), 0.9, TagAttachmentSource::User)
            .unwrap();
        for name in ["aa", "bb", "cc"] {
            let tag = fx.tag(name);
            fx.store
                .attach_tag(doc.id(), tag.id(), 0.9, TagAttachmentSource::User)
                .unwrap();
        }

        let refiner = fx.refiner(FixedAssessor(Assessment::default()));
        let related = refiner.suggest_related_tags(hub.id(), 2).unwrap();
        assert_eq!(related.related.len(), 2);
    }

    #[test]
    fn related_tags_unknown_tag_fails_not_found() {
        let fx = Fixture::new();
        let refiner = fx.refiner(FixedAssessor(Assessment::default()));

        let err = refiner.suggest_related_tags(TagId::new(404), 10).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn related_tags_zero_carriers_is_skipped() {
        let fx = Fixture::new();
        let orphan = fx.tag("orphan");

        let refiner = fx.refiner(FixedAssessor(Assessment::default()));
        let related = refiner.suggest_related_tags(orphan.id(), 10).unwrap();

        assert_eq!(related.status, RelatedStatus::Skipped);
        assert!(related.related.is_empty());
    }
}
