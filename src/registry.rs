//! Canonical tag store: normalization, creation, merging, fuzzy lookup.
//!
//! The registry owns every write to tags, synonyms and tag edges. Callers
//! resolve free-form candidate strings through [`TagRegistry::normalize_tag`]
//! and either adopt the resolved tag or create a new one.

mod normalize;

pub use normalize::{normalize_label, normalize_labels};

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, params};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{CategoryId, EdgeType, Tag, TagId};
use crate::similarity::{SimilarityConfig, SimilarityIndex};

/// Confidence assigned to an exact synonym match.
const SYNONYM_CONFIDENCE: f64 = 0.95;

/// Result of resolving a candidate string against the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTag {
    /// The resolved tag, when one matched.
    pub tag_id: Option<TagId>,
    /// Canonical name of the match, or the normalized candidate when new.
    pub name: String,
    /// 1.0 exact, 0.95 synonym, similarity score for fuzzy, 0.0 for new.
    pub confidence: f64,
    /// True when no known tag or synonym cleared the threshold. The caller
    /// decides whether to create the suggested name.
    pub is_new: bool,
}

/// A fuzzy match from [`TagRegistry::find_similar_tags`].
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarTag {
    pub tag_id: TagId,
    /// Canonical tag name.
    pub name: String,
    /// The label (name or synonym) that produced the score.
    pub matched_label: String,
    pub similarity: f64,
}

/// Input for explicit tag creation.
#[derive(Debug, Clone, Default)]
pub struct TagDraft {
    pub name: String,
    pub description: Option<String>,
    pub synonyms: Vec<String>,
    pub parent_ids: Vec<TagId>,
    pub category_ids: Vec<CategoryId>,
}

impl TagDraft {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A name or synonym that can win a fuzzy match.
struct CandidateLabel {
    label: String,
    tag_id: i64,
    name: String,
    usage_count: i64,
    created_at: i64,
}

/// Canonical tag store with fuzzy normalization.
pub struct TagRegistry {
    db: Arc<Database>,
    index: SimilarityIndex,
    config: SimilarityConfig,
}

impl TagRegistry {
    /// Creates a registry using the lexical similarity strategy and the
    /// environment-derived threshold.
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_index(db, SimilarityIndex::lexical(), SimilarityConfig::from_env())
    }

    pub fn with_index(db: Arc<Database>, index: SimilarityIndex, config: SimilarityConfig) -> Self {
        Self { db, index, config }
    }

    /// Resolves a free-form candidate against known tags.
    ///
    /// Resolution order, first match wins:
    /// 1. exact case-insensitive name match, confidence 1.0
    /// 2. exact synonym match, confidence 0.95
    /// 3. similarity search over all names and synonyms at the configured
    ///    threshold; best similarity wins, ties broken by higher usage
    ///    count, then earlier creation
    ///
    /// Anything else comes back as `is_new` with the normalized candidate as
    /// the suggested name. Read-only; safe for unrestricted concurrency.
    pub fn normalize_tag(&self, candidate: &str) -> Result<NormalizedTag> {
        let label = normalize_label(candidate);
        if label.is_empty() {
            return Err(Error::Validation(format!(
                "candidate '{candidate}' normalizes to an empty label"
            )));
        }

        {
            let conn = self.db.connection();
            if let Some(resolved) = exact_or_synonym(&conn, &label)? {
                return Ok(resolved);
            }
        }

        // Similarity pass runs without the connection lock: the embedding
        // provider may be slow.
        let mut matches: Vec<(f64, CandidateLabel)> = self
            .candidate_labels()?
            .into_iter()
            .filter_map(|candidate| {
                let value = self.index.score(&label, &candidate.label).value;
                (value >= self.config.threshold).then_some((value, candidate))
            })
            .collect();

        matches.sort_by(|(va, a), (vb, b)| {
            vb.partial_cmp(va)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.usage_count.cmp(&a.usage_count))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.tag_id.cmp(&b.tag_id))
        });

        if let Some((value, best)) = matches.into_iter().next() {
            return Ok(NormalizedTag {
                tag_id: Some(TagId::new(best.tag_id)),
                name: best.name,
                confidence: value,
                is_new: false,
            });
        }

        Ok(NormalizedTag {
            tag_id: None,
            name: label,
            confidence: 0.0,
            is_new: true,
        })
    }

    /// Creates a new canonical tag.
    ///
    /// Rejected with a validation error when the name already resolves
    /// exactly or via a synonym; a merely similar existing tag does not
    /// block creation. Parent and category references must exist. A
    /// concurrent duplicate creation loses with [`Error::Conflict`] and
    /// should retry `normalize_tag` to adopt the winner.
    pub fn create_tag(&self, draft: TagDraft) -> Result<Tag> {
        let label = normalize_label(&draft.name);
        if label.is_empty() {
            return Err(Error::Validation(format!(
                "name '{}' normalizes to an empty label",
                draft.name
            )));
        }
        {
            let conn = self.db.connection();
            if let Some(resolved) = exact_or_synonym(&conn, &label)? {
                return Err(Error::Validation(format!(
                    "'{}' already resolves to tag '{}'",
                    draft.name, resolved.name
                )));
            }
        }
        let synonyms = normalize_labels(&draft.synonyms);
        let now = OffsetDateTime::now_utc().unix_timestamp();

        let mut conn = self.db.connection();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO tags (name, description, usage_count, created_at) VALUES (?1, ?2, 0, ?3)",
            params![label, draft.description, now],
        )
        .map_err(|e| Error::from_insert(e, &format!("tag '{label}'")))?;
        let tag_id = TagId::new(tx.last_insert_rowid());

        for synonym in &synonyms {
            if synonym.eq_ignore_ascii_case(&label) {
                continue;
            }
            tx.execute(
                "INSERT INTO tag_synonyms (synonym, tag_id, created_at) VALUES (?1, ?2, ?3)",
                params![synonym, tag_id.get(), now],
            )
            .map_err(|e| Error::from_insert(e, &format!("synonym '{synonym}'")))?;
        }

        for parent in &draft.parent_ids {
            if !tag_exists(&tx, *parent)? {
                return Err(Error::not_found("parent tag", parent));
            }
            // A freshly inserted tag has no descendants, so no cycle walk is
            // needed here.
            tx.execute(
                "INSERT INTO tag_edges (edge_type, source_tag_id, target_id)
                 VALUES (?1, ?2, ?3)",
                params![EdgeType::ChildOf.as_str(), tag_id.get(), parent.get()],
            )?;
        }

        for category in &draft.category_ids {
            if !category_exists(&tx, *category)? {
                return Err(Error::not_found("category", category));
            }
            tx.execute(
                "INSERT INTO tag_edges (edge_type, source_tag_id, target_id)
                 VALUES (?1, ?2, ?3)",
                params![EdgeType::BelongsTo.as_str(), tag_id.get(), category.get()],
            )?;
        }

        tx.commit()?;
        info!(tag = %label, id = %tag_id, "created tag");

        Ok(Tag::new(
            tag_id,
            label,
            draft.description,
            synonyms,
            0,
            OffsetDateTime::from_unix_timestamp(now)?,
        ))
    }

    /// Resolves a name to a tag, creating it when nothing matches.
    ///
    /// Returns the tag and whether it was created by this call. A lost
    /// creation race is retried through normalization so the caller always
    /// adopts the winner's tag id.
    pub fn ensure_tag(&self, name: &str) -> Result<(Tag, bool)> {
        for _ in 0..2 {
            let resolved = self.normalize_tag(name)?;
            if let Some(id) = resolved.tag_id {
                let tag = self
                    .get_tag(id)?
                    .ok_or_else(|| Error::not_found("tag", id))?;
                return Ok((tag, false));
            }
            match self.create_tag(TagDraft::named(&resolved.name)) {
                Ok(tag) => return Ok((tag, true)),
                Err(Error::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(format!(
            "could not resolve tag '{name}' after losing a creation race"
        )))
    }

    /// Atomically increments a tag's usage count.
    ///
    /// An unknown tag id is logged and ignored.
    pub fn increment_usage(&self, tag_id: TagId) -> Result<()> {
        let updated = self.db.connection().execute(
            "UPDATE tags SET usage_count = usage_count + 1 WHERE id = ?1",
            [tag_id.get()],
        )?;
        if updated == 0 {
            warn!(%tag_id, "usage increment for unknown tag, ignoring");
        }
        Ok(())
    }

    /// Finds tags whose name or any synonym scores at or above `threshold`.
    ///
    /// Results are ordered by similarity descending; each tag appears at
    /// most once (its best-scoring label). Never returns an entry strictly
    /// below the threshold.
    pub fn find_similar_tags(&self, name: &str, threshold: f64) -> Result<Vec<SimilarTag>> {
        let label = normalize_label(name);
        if label.is_empty() {
            return Ok(Vec::new());
        }

        let mut best_per_tag: std::collections::HashMap<i64, SimilarTag> =
            std::collections::HashMap::new();
        for candidate in self.candidate_labels()? {
            let value = self.index.score(&label, &candidate.label).value;
            if value < threshold {
                continue;
            }
            let entry = SimilarTag {
                tag_id: TagId::new(candidate.tag_id),
                name: candidate.name,
                matched_label: candidate.label,
                similarity: value,
            };
            best_per_tag
                .entry(candidate.tag_id)
                .and_modify(|current| {
                    if entry.similarity > current.similarity {
                        *current = entry.clone();
                    }
                })
                .or_insert(entry);
        }

        let mut results: Vec<SimilarTag> = best_per_tag.into_values().collect();
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tag_id.cmp(&b.tag_id))
        });
        Ok(results)
    }

    /// Merges `source` into `target`: every tag edge and document-tag
    /// relation referencing the source is repointed at the target, the
    /// source is deleted, and its name becomes a synonym of the target so
    /// old-name normalization deterministically resolves to the target.
    /// A repointed parent edge that would close a `child_of` cycle is
    /// dropped; the hierarchy stays acyclic.
    pub fn merge_tag(&self, source: TagId, target: TagId) -> Result<()> {
        if source == target {
            return Err(Error::Validation(
                "cannot merge a tag into itself".to_string(),
            ));
        }

        let mut conn = self.db.connection();
        let tx = conn.transaction()?;

        let source_row: Option<(String, i64)> = tx
            .query_row(
                "SELECT name, usage_count FROM tags WHERE id = ?1",
                [source.get()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (source_name, source_usage) =
            source_row.ok_or_else(|| Error::not_found("tag", source))?;
        if !tag_exists(&tx, target)? {
            return Err(Error::not_found("tag", target));
        }

        // Repoint, dropping rows that would collide with an existing
        // target-side row (a document tagged with both keeps one row).
        tx.execute(
            "UPDATE OR IGNORE document_tags SET tag_id = ?2 WHERE tag_id = ?1",
            params![source.get(), target.get()],
        )?;
        tx.execute(
            "DELETE FROM document_tags WHERE tag_id = ?1",
            [source.get()],
        )?;

        tx.execute(
            "UPDATE OR IGNORE tag_edges SET source_tag_id = ?2 WHERE source_tag_id = ?1",
            params![source.get(), target.get()],
        )?;
        tx.execute(
            "DELETE FROM tag_edges WHERE source_tag_id = ?1",
            [source.get()],
        )?;
        tx.execute(
            "UPDATE OR IGNORE tag_edges SET target_id = ?2
             WHERE edge_type = ?3 AND target_id = ?1",
            params![source.get(), target.get(), EdgeType::ChildOf.as_str()],
        )?;
        tx.execute(
            "DELETE FROM tag_edges WHERE edge_type = ?2 AND target_id = ?1",
            params![source.get(), EdgeType::ChildOf.as_str()],
        )?;

        // Repointing can fold an ancestor chain onto the target and leave a
        // parent loop through it. Drop any child_of edge that now cycles
        // back on itself.
        let repointed: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT source_tag_id, target_id FROM tag_edges
                 WHERE edge_type = ?1 AND (source_tag_id = ?2 OR target_id = ?2)
                 ORDER BY source_tag_id, target_id",
            )?;
            let rows = stmt.query_map(
                params![EdgeType::ChildOf.as_str(), target.get()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let mut edges = Vec::new();
            for row in rows {
                edges.push(row?);
            }
            edges
        };
        for (child, parent) in repointed {
            if is_ancestor(&tx, TagId::new(parent), TagId::new(child))? {
                tx.execute(
                    "DELETE FROM tag_edges
                     WHERE edge_type = ?1 AND source_tag_id = ?2 AND target_id = ?3",
                    params![EdgeType::ChildOf.as_str(), child, parent],
                )?;
                warn!(child, parent, "dropped parent relation that closed a cycle after merge");
            }
        }

        tx.execute(
            "UPDATE OR IGNORE tag_synonyms SET tag_id = ?2 WHERE tag_id = ?1",
            params![source.get(), target.get()],
        )?;
        tx.execute(
            "DELETE FROM tag_synonyms WHERE tag_id = ?1",
            [source.get()],
        )?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        tx.execute(
            "INSERT OR IGNORE INTO tag_synonyms (synonym, tag_id, created_at) VALUES (?1, ?2, ?3)",
            params![source_name, target.get(), now],
        )?;
        tx.execute(
            "UPDATE tags SET usage_count = usage_count + ?2 WHERE id = ?1",
            params![target.get(), source_usage],
        )?;
        tx.execute("DELETE FROM tags WHERE id = ?1", [source.get()])?;

        tx.commit()?;
        info!(%source, %target, retired_name = %source_name, "merged tag");
        Ok(())
    }

    /// Adds a broader-parent relation, rejecting cycles.
    pub fn add_parent(&self, tag_id: TagId, parent_id: TagId) -> Result<()> {
        if tag_id == parent_id {
            return Err(Error::Validation(
                "a tag cannot be its own parent".to_string(),
            ));
        }

        let conn = self.db.connection();
        if !tag_exists(&conn, tag_id)? {
            return Err(Error::not_found("tag", tag_id));
        }
        if !tag_exists(&conn, parent_id)? {
            return Err(Error::not_found("parent tag", parent_id));
        }
        if is_ancestor(&conn, parent_id, tag_id)? {
            return Err(Error::Validation(format!(
                "parent relation {tag_id} -> {parent_id} would create a cycle"
            )));
        }

        conn.execute(
            "INSERT OR IGNORE INTO tag_edges (edge_type, source_tag_id, target_id)
             VALUES (?1, ?2, ?3)",
            params![EdgeType::ChildOf.as_str(), tag_id.get(), parent_id.get()],
        )?;
        Ok(())
    }

    /// Links a tag to a category bucket.
    pub fn assign_to_category(&self, tag_id: TagId, category_id: CategoryId) -> Result<()> {
        let conn = self.db.connection();
        if !tag_exists(&conn, tag_id)? {
            return Err(Error::not_found("tag", tag_id));
        }
        if !category_exists(&conn, category_id)? {
            return Err(Error::not_found("category", category_id));
        }
        conn.execute(
            "INSERT OR IGNORE INTO tag_edges (edge_type, source_tag_id, target_id)
             VALUES (?1, ?2, ?3)",
            params![EdgeType::BelongsTo.as_str(), tag_id.get(), category_id.get()],
        )?;
        Ok(())
    }

    /// Loads a tag with its synonyms.
    pub fn get_tag(&self, tag_id: TagId) -> Result<Option<Tag>> {
        let conn = self.db.connection();
        load_tag(&conn, tag_id)
    }

    /// Parent tag ids of a tag (direct `child_of` targets).
    pub fn parent_ids(&self, tag_id: TagId) -> Result<Vec<TagId>> {
        let conn = self.db.connection();
        let mut stmt = conn.prepare(
            "SELECT target_id FROM tag_edges
             WHERE edge_type = ?1 AND source_tag_id = ?2
             ORDER BY target_id",
        )?;
        let rows = stmt.query_map(
            params![EdgeType::ChildOf.as_str(), tag_id.get()],
            |row| row.get::<_, i64>(0),
        )?;
        let mut parents = Vec::new();
        for row in rows {
            parents.push(TagId::new(row?));
        }
        Ok(parents)
    }

    /// All tags, ordered by name.
    pub fn list_tags(&self) -> Result<Vec<Tag>> {
        let ids: Vec<i64> = {
            let conn = self.db.connection();
            let mut stmt = conn.prepare("SELECT id FROM tags ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        let mut tags = Vec::new();
        for id in ids {
            if let Some(tag) = self.get_tag(TagId::new(id))? {
                tags.push(tag);
            }
        }
        Ok(tags)
    }

    fn candidate_labels(&self) -> Result<Vec<CandidateLabel>> {
        let conn = self.db.connection();
        let mut candidates = Vec::new();

        let mut stmt =
            conn.prepare("SELECT id, name, usage_count, created_at FROM tags ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(CandidateLabel {
                label: row.get(1)?,
                tag_id: row.get(0)?,
                name: row.get(1)?,
                usage_count: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        for row in rows {
            candidates.push(row?);
        }

        let mut stmt = conn.prepare(
            "SELECT s.synonym, t.id, t.name, t.usage_count, t.created_at
             FROM tag_synonyms s JOIN tags t ON s.tag_id = t.id
             ORDER BY t.id, s.synonym",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CandidateLabel {
                label: row.get(0)?,
                tag_id: row.get(1)?,
                name: row.get(2)?,
                usage_count: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        for row in rows {
            candidates.push(row?);
        }

        Ok(candidates)
    }
}

/// Exact name or synonym lookup for an already-normalized label.
fn exact_or_synonym(conn: &Connection, label: &str) -> Result<Option<NormalizedTag>> {
    let exact: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, name FROM tags WHERE name = ?1 COLLATE NOCASE",
            [label],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    if let Some((id, name)) = exact {
        return Ok(Some(NormalizedTag {
            tag_id: Some(TagId::new(id)),
            name,
            confidence: 1.0,
            is_new: false,
        }));
    }

    let synonym: Option<(i64, String)> = conn
        .query_row(
            "SELECT t.id, t.name FROM tag_synonyms s
             JOIN tags t ON s.tag_id = t.id
             WHERE s.synonym = ?1 COLLATE NOCASE",
            [label],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(synonym.map(|(id, name)| NormalizedTag {
        tag_id: Some(TagId::new(id)),
        name,
        confidence: SYNONYM_CONFIDENCE,
        is_new: false,
    }))
}

fn tag_exists(conn: &Connection, tag_id: TagId) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM tags WHERE id = ?1)",
        [tag_id.get()],
        |row| row.get(0),
    )?)
}

fn category_exists(conn: &Connection, category_id: CategoryId) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM categories WHERE id = ?1)",
        [category_id.get()],
        |row| row.get(0),
    )?)
}

/// Walks `child_of` edges upward from `start`, looking for `needle`.
fn is_ancestor(conn: &Connection, start: TagId, needle: TagId) -> Result<bool> {
    let mut queue = vec![start];
    let mut seen = HashSet::new();

    while let Some(current) = queue.pop() {
        if current == needle {
            return Ok(true);
        }
        if !seen.insert(current) {
            continue;
        }
        let mut stmt = conn.prepare(
            "SELECT target_id FROM tag_edges
             WHERE edge_type = ?1 AND source_tag_id = ?2",
        )?;
        let rows = stmt.query_map(
            params![EdgeType::ChildOf.as_str(), current.get()],
            |row| row.get::<_, i64>(0),
        )?;
        for row in rows {
            queue.push(TagId::new(row?));
        }
    }
    Ok(false)
}

fn load_tag(conn: &Connection, tag_id: TagId) -> Result<Option<Tag>> {
    let row: Option<(String, Option<String>, i64, i64)> = conn
        .query_row(
            "SELECT name, description, usage_count, created_at FROM tags WHERE id = ?1",
            [tag_id.get()],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                ))
            },
        )
        .optional()?;

    let Some((name, description, usage_count, created_at)) = row else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT synonym FROM tag_synonyms WHERE tag_id = ?1 ORDER BY synonym")?;
    let rows = stmt.query_map([tag_id.get()], |row| row.get::<_, String>(0))?;
    let mut synonyms = Vec::new();
    for row in rows {
        synonyms.push(row?);
    }

    Ok(Some(Tag::new(
        tag_id,
        name,
        description,
        synonyms,
        usage_count,
        OffsetDateTime::from_unix_timestamp(created_at)?,
    )))
}
