//! Density-based document clustering over stored embeddings.
//!
//! Each pass is a full recomputation: prior cluster ids are discarded and
//! membership is rewritten wholesale. Cluster identity is not stable across
//! runs; only membership partitions are, for a fixed input order and fixed
//! parameters.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use tracing::info;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::DocumentId;
use crate::similarity::cosine;

/// Counts reported by a clustering pass. Never a bare success boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterReport {
    /// Embedding-bearing documents considered.
    pub total_documents: usize,
    pub clusters_found: usize,
    /// Documents assigned to no cluster.
    pub noise_documents: usize,
}

/// A nearest-neighbor hit from [`DocumentClusterer::find_similar_documents`].
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarDocument {
    pub document_id: DocumentId,
    pub similarity: f64,
}

/// Pluggable clustering algorithm.
///
/// Returns one label per input embedding, in input order: `Some(cluster
/// index)` or `None` for noise. Implementations must be deterministic for a
/// fixed input order and fixed parameters.
pub trait ClusteringStrategy: Send + Sync {
    fn assign(&self, embeddings: &[Vec<f32>], eps: f64, min_pts: usize) -> Vec<Option<usize>>;
}

/// Density-based clustering (DBSCAN).
///
/// Two documents are reachable when their embedding distance is at most
/// `eps`; a document is a core point when it has at least `min_pts`
/// reachable neighbors including itself. Clusters are transitive closures of
/// core points plus their reachable neighbors; everything else is noise.
pub struct DbscanStrategy;

impl ClusteringStrategy for DbscanStrategy {
    fn assign(&self, embeddings: &[Vec<f32>], eps: f64, min_pts: usize) -> Vec<Option<usize>> {
        let n = embeddings.len();

        let mut neighbors: Vec<Vec<usize>> = Vec::with_capacity(n);
        for i in 0..n {
            let mut reachable = Vec::new();
            for j in 0..n {
                if euclidean(&embeddings[i], &embeddings[j]) <= eps {
                    reachable.push(j);
                }
            }
            neighbors.push(reachable);
        }

        let core: Vec<bool> = neighbors.iter().map(|r| r.len() >= min_pts).collect();
        let mut labels: Vec<Option<usize>> = vec![None; n];
        let mut visited = vec![false; n];
        let mut next_cluster = 0;

        // Seeds are taken in input order, which keeps border-point
        // assignment deterministic.
        for seed in 0..n {
            if visited[seed] || !core[seed] {
                continue;
            }
            visited[seed] = true;
            labels[seed] = Some(next_cluster);

            let mut queue = VecDeque::from([seed]);
            while let Some(point) = queue.pop_front() {
                // Only core points expand the cluster; border points join
                // but do not recruit.
                if !core[point] {
                    continue;
                }
                for &other in &neighbors[point] {
                    if !visited[other] {
                        visited[other] = true;
                        labels[other] = Some(next_cluster);
                        queue.push_back(other);
                    }
                }
            }
            next_cluster += 1;
        }

        labels
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Partitions the embedding-bearing document set into density-connected
/// groups and owns all writes to `documents.cluster_id`.
pub struct DocumentClusterer {
    db: Arc<Database>,
    strategy: Box<dyn ClusteringStrategy>,
    /// Single-flight guard: overlapping recomputations must never
    /// interleave writes.
    running: Mutex<()>,
}

impl DocumentClusterer {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_strategy(db, Box::new(DbscanStrategy))
    }

    pub fn with_strategy(db: Arc<Database>, strategy: Box<dyn ClusteringStrategy>) -> Self {
        Self {
            db,
            strategy,
            running: Mutex::new(()),
        }
    }

    /// Recomputes cluster membership from scratch.
    ///
    /// A second call while one is in progress is rejected immediately with a
    /// conflict. All writes happen in one transaction, so a failure leaves
    /// the previous assignment untouched.
    pub fn update_clusters(&self, eps: f64, min_pts: usize) -> Result<ClusterReport> {
        let _flight = self
            .running
            .try_lock()
            .map_err(|_| Error::Conflict("cluster update already running".to_string()))?;

        let (ids, embeddings) = self.load_embeddings()?;
        let labels = self.strategy.assign(&embeddings, eps, min_pts);

        let clusters_found = labels.iter().flatten().copied().max().map_or(0, |m| m + 1);
        let noise_documents = labels.iter().filter(|l| l.is_none()).count();

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut conn = self.db.connection();
        let tx = conn.transaction()?;

        tx.execute("UPDATE documents SET cluster_id = NULL", [])?;
        tx.execute("DELETE FROM clusters", [])?;

        let mut cluster_rows = Vec::with_capacity(clusters_found);
        for _ in 0..clusters_found {
            tx.execute(
                "INSERT INTO clusters (created_at, updated_at) VALUES (?1, ?1)",
                [now],
            )?;
            cluster_rows.push(tx.last_insert_rowid());
        }

        for (doc_id, label) in ids.iter().zip(&labels) {
            if let Some(label) = label {
                tx.execute(
                    "UPDATE documents SET cluster_id = ?2 WHERE id = ?1",
                    [doc_id.get(), cluster_rows[*label]],
                )?;
            }
        }

        tx.commit()?;

        let report = ClusterReport {
            total_documents: ids.len(),
            clusters_found,
            noise_documents,
        };
        info!(
            total = report.total_documents,
            clusters = report.clusters_found,
            noise = report.noise_documents,
            eps,
            min_pts,
            "recomputed cluster membership"
        );
        Ok(report)
    }

    /// Nearest-neighbor search over embeddings, independent of cluster
    /// assignment.
    ///
    /// Returns up to `limit` documents scoring at or above `threshold` by
    /// cosine similarity, best first, excluding the query document.
    pub fn find_similar_documents(
        &self,
        document_id: DocumentId,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarDocument>> {
        let (ids, embeddings) = self.load_embeddings()?;

        let query = ids
            .iter()
            .position(|id| *id == document_id)
            .map(|idx| &embeddings[idx]);
        let Some(query) = query else {
            // Distinguish an unknown document from one without an embedding.
            let known: bool = self.db.connection().query_row(
                "SELECT EXISTS(SELECT 1 FROM documents WHERE id = ?1)",
                [document_id.get()],
                |row| row.get(0),
            )?;
            if known {
                return Err(Error::Validation(format!(
                    "document {document_id} has no embedding"
                )));
            }
            return Err(Error::not_found("document", document_id));
        };

        let mut hits: Vec<SimilarDocument> = ids
            .iter()
            .zip(&embeddings)
            .filter(|(id, _)| **id != document_id)
            .filter_map(|(id, embedding)| {
                let similarity = cosine(query, embedding);
                (similarity >= threshold).then_some(SimilarDocument {
                    document_id: *id,
                    similarity,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Loads ids and embeddings for every embedding-bearing document, in id
    /// order (the fixed input order for determinism).
    fn load_embeddings(&self) -> Result<(Vec<DocumentId>, Vec<Vec<f32>>)> {
        let conn = self.db.connection();
        let mut stmt = conn.prepare(
            "SELECT id, embedding FROM documents WHERE embedding IS NOT NULL ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut ids = Vec::new();
        let mut embeddings = Vec::new();
        for row in rows {
            let (id, blob) = row?;
            ids.push(DocumentId::new(id));
            embeddings.push(crate::models::embedding_from_bytes(&blob));
        }
        Ok((ids, embeddings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocumentStore;

    fn fixture() -> (Arc<Database>, DocumentStore, DocumentClusterer) {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = DocumentStore::new(Arc::clone(&db));
        let clusterer = DocumentClusterer::new(Arc::clone(&db));
        (db, store, clusterer)
    }

    fn add(store: &DocumentStore, embedding: &[f32]) -> DocumentId {
        store
            .add_document("doc", Some(embedding))
            .unwrap()
            .id()
    }

    #[test]
    fn dbscan_labels_dense_group_and_noise() {
        let strategy = DbscanStrategy;
        let embeddings = vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![0.0, 0.1],
            vec![10.0, 10.0],
        ];

        let labels = strategy.assign(&embeddings, 0.5, 3);

        assert_eq!(labels[0], Some(0));
        assert_eq!(labels[1], Some(0));
        assert_eq!(labels[2], Some(0));
        assert_eq!(labels[3], None);
    }

    #[test]
    fn dbscan_point_below_min_pts_is_always_noise() {
        let strategy = DbscanStrategy;
        // Two close points cannot form a cluster with min_pts = 3.
        let embeddings = vec![vec![0.0], vec![0.1]];

        let labels = strategy.assign(&embeddings, 0.5, 3);
        assert_eq!(labels, vec![None, None]);
    }

    #[test]
    fn six_near_identical_documents_form_one_cluster_with_four_noise() {
        let (_db, store, clusterer) = fixture();

        for i in 0..6 {
            add(&store, &[1.0 + 0.001 * i as f32, 1.0]);
        }
        add(&store, &[50.0, 0.0]);
        add(&store, &[0.0, 50.0]);
        add(&store, &[-50.0, 0.0]);
        add(&store, &[0.0, -50.0]);

        let report = clusterer.update_clusters(0.1, 3).unwrap();

        assert_eq!(report.total_documents, 10);
        assert_eq!(report.clusters_found, 1);
        assert_eq!(report.noise_documents, 4);
    }

    #[test]
    fn noise_documents_carry_no_cluster_id() {
        let (_db, store, clusterer) = fixture();
        for i in 0..3 {
            add(&store, &[0.01 * i as f32]);
        }
        let lonely = add(&store, &[100.0]);

        clusterer.update_clusters(0.5, 3).unwrap();

        let doc = store.get_document(lonely).unwrap().unwrap();
        assert_eq!(doc.cluster_id(), None);
    }

    #[test]
    fn clustered_documents_share_a_cluster_id() {
        let (_db, store, clusterer) = fixture();
        let a = add(&store, &[0.0]);
        let b = add(&store, &[0.01]);
        let c = add(&store, &[0.02]);

        clusterer.update_clusters(0.5, 3).unwrap();

        let ca = store.get_document(a).unwrap().unwrap().cluster_id();
        let cb = store.get_document(b).unwrap().unwrap().cluster_id();
        let cc = store.get_document(c).unwrap().unwrap().cluster_id();
        assert!(ca.is_some());
        assert_eq!(ca, cb);
        assert_eq!(cb, cc);
    }

    #[test]
    fn repeated_passes_produce_identical_membership_partitions() {
        let (_db, store, clusterer) = fixture();
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(add(&store, &[0.02 * i as f32, 0.0]));
        }
        for i in 0..4 {
            ids.push(add(&store, &[5.0 + 0.02 * i as f32, 3.0]));
        }

        let partition = |store: &DocumentStore| -> Vec<Vec<DocumentId>> {
            let mut groups: std::collections::BTreeMap<i64, Vec<DocumentId>> = Default::default();
            for id in &ids {
                if let Some(cluster) = store.get_document(*id).unwrap().unwrap().cluster_id() {
                    groups.entry(cluster.get()).or_default().push(*id);
                }
            }
            groups.into_values().collect()
        };

        let first_report = clusterer.update_clusters(0.1, 3).unwrap();
        let first = partition(&store);
        let second_report = clusterer.update_clusters(0.1, 3).unwrap();
        let second = partition(&store);

        assert_eq!(first_report, second_report);
        // Cluster ids may differ between runs; the grouping must not.
        assert_eq!(first, second);
    }

    #[test]
    fn overlapping_update_is_rejected() {
        let (_db, store, clusterer) = fixture();
        add(&store, &[0.0]);

        let _in_flight = clusterer.running.lock().unwrap();
        let err = clusterer.update_clusters(0.5, 2).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn find_similar_excludes_query_and_respects_threshold() {
        let (_db, store, clusterer) = fixture();
        let query = add(&store, &[1.0, 0.0]);
        let close = add(&store, &[0.9, 0.1]);
        let _orthogonal = add(&store, &[0.0, 1.0]);

        let hits = clusterer.find_similar_documents(query, 0.8, 10).unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, close);
        assert!(hits[0].similarity >= 0.8);
    }

    #[test]
    fn find_similar_caps_results_at_limit() {
        let (_db, store, clusterer) = fixture();
        let query = add(&store, &[1.0, 0.0]);
        for _ in 0..5 {
            add(&store, &[1.0, 0.01]);
        }

        let hits = clusterer.find_similar_documents(query, 0.5, 2).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn find_similar_unknown_document_fails_not_found() {
        let (_db, _store, clusterer) = fixture();
        let err = clusterer
            .find_similar_documents(DocumentId::new(404), 0.5, 10)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn find_similar_without_embedding_is_a_validation_error() {
        let (_db, store, clusterer) = fixture();
        let doc = store.add_document("no embedding", None).unwrap();

        let err = clusterer
            .find_similar_documents(doc.id(), 0.5, 10)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
