//! Document-to-category classification.
//!
//! A bag-of-terms vectorizer feeds a multi-class probabilistic model behind
//! the [`ClassifierStrategy`] seam, so the model family is swappable without
//! touching document domain logic. Training commits a new model atomically;
//! readers of [`CategoryClassifier::predict_category`] never observe a
//! partially-swapped model.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{CategoryId, DocumentId};

/// Configuration for training.
///
/// Parsed from environment variables at call time with fallback defaults.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Minimum labeled examples before training proceeds (default 20).
    pub min_examples: usize,
    /// Vocabulary cap for the bag-of-terms vectorizer (default 5000).
    pub vocab_size: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_examples: 20,
            vocab_size: 5000,
        }
    }
}

impl ClassifierConfig {
    /// # Environment Variables
    ///
    /// - `TAXO_MIN_TRAINING_EXAMPLES` (usize, default 20)
    /// - `TAXO_VOCAB_SIZE` (usize, default 5000)
    pub fn from_env() -> Self {
        let min_examples = std::env::var("TAXO_MIN_TRAINING_EXAMPLES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(20);
        let vocab_size = std::env::var("TAXO_VOCAB_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);

        Self {
            min_examples,
            vocab_size,
        }
    }
}

/// Outcome of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingStatus {
    Trained,
    /// Below the configured minimum; the previously committed model, if
    /// any, remains authoritative and unchanged.
    InsufficientData,
}

/// Counts and metrics reported by a training run.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub status: TrainingStatus,
    pub accuracy: Option<f64>,
    pub categories: Option<Vec<String>>,
    pub data_point_count: usize,
}

/// One entry of a prediction, ordered by descending probability.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryScore {
    pub category_id: CategoryId,
    pub name: String,
    pub probability: f64,
}

/// A ground-truth training pair.
#[derive(Debug, Clone)]
pub struct LabeledExample {
    pub text: String,
    pub category_id: CategoryId,
}

/// Fixed-size bag-of-terms feature extraction.
///
/// The vocabulary is selected by term frequency across the training corpus,
/// capped at a configured size, and sorted so feature indices are
/// deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermVectorizer {
    vocabulary: Vec<String>,
}

impl TermVectorizer {
    /// Builds a vocabulary from the corpus, keeping the `cap` most frequent
    /// terms (ties broken alphabetically) and storing them sorted.
    pub fn fit<S: AsRef<str>>(corpus: &[S], cap: usize) -> Self {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for text in corpus {
            for term in tokenize(text.as_ref()) {
                *counts.entry(term).or_insert(0) += 1;
            }
        }

        let mut terms: Vec<(String, usize)> = counts.into_iter().collect();
        terms.sort_by(|(ta, ca), (tb, cb)| cb.cmp(ca).then_with(|| ta.cmp(tb)));
        terms.truncate(cap);

        let mut vocabulary: Vec<String> = terms.into_iter().map(|(t, _)| t).collect();
        vocabulary.sort();
        Self { vocabulary }
    }

    /// Maps text to a term-count vector over the fixed vocabulary.
    pub fn transform(&self, text: &str) -> Vec<f64> {
        let mut features = vec![0.0; self.vocabulary.len()];
        for term in tokenize(text) {
            if let Ok(idx) = self.vocabulary.binary_search(&term) {
                features[idx] += 1.0;
            }
        }
        features
    }

    pub fn vocabulary(&self) -> &[String] {
        &self.vocabulary
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(str::to_string)
        .collect::<Vec<_>>()
        .into_iter()
}

/// A trained multi-class model ready to score feature vectors.
pub trait FittedClassifier: Send + Sync {
    /// Probability per class, summing to 1.0, indexed like the category
    /// list the model was trained with.
    fn predict_proba(&self, features: &[f64]) -> Vec<f64>;

    /// Serializable weights for persistence.
    fn weights(&self) -> Result<serde_json::Value>;
}

/// Pluggable model family.
pub trait ClassifierStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn fit(
        &self,
        features: &[Vec<f64>],
        labels: &[usize],
        class_count: usize,
    ) -> Box<dyn FittedClassifier>;

    fn load(&self, weights: &serde_json::Value) -> Result<Box<dyn FittedClassifier>>;
}

/// Multinomial naive Bayes with Laplace smoothing.
pub struct MultinomialNaiveBayes;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NaiveBayesWeights {
    class_log_prior: Vec<f64>,
    /// `[class][term]` log-likelihoods.
    feature_log_prob: Vec<Vec<f64>>,
}

impl FittedClassifier for NaiveBayesWeights {
    fn predict_proba(&self, features: &[f64]) -> Vec<f64> {
        let log_posterior: Vec<f64> = self
            .class_log_prior
            .iter()
            .zip(&self.feature_log_prob)
            .map(|(prior, term_probs)| {
                prior
                    + features
                        .iter()
                        .zip(term_probs)
                        .map(|(count, log_prob)| count * log_prob)
                        .sum::<f64>()
            })
            .collect();

        // Shift by the max before exponentiating to avoid underflow, then
        // normalize so the distribution sums to 1.0.
        let max = log_posterior.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let unnormalized: Vec<f64> = log_posterior.iter().map(|lp| (lp - max).exp()).collect();
        let total: f64 = unnormalized.iter().sum();
        unnormalized.into_iter().map(|p| p / total).collect()
    }

    fn weights(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

impl ClassifierStrategy for MultinomialNaiveBayes {
    fn name(&self) -> &'static str {
        "multinomial_naive_bayes"
    }

    fn fit(
        &self,
        features: &[Vec<f64>],
        labels: &[usize],
        class_count: usize,
    ) -> Box<dyn FittedClassifier> {
        let vocab_size = features.first().map_or(0, Vec::len);
        let total = labels.len() as f64;

        let mut class_counts = vec![0usize; class_count];
        let mut term_counts = vec![vec![0.0f64; vocab_size]; class_count];
        for (feature, label) in features.iter().zip(labels) {
            class_counts[*label] += 1;
            for (slot, count) in term_counts[*label].iter_mut().zip(feature) {
                *slot += count;
            }
        }

        let class_log_prior = class_counts
            .iter()
            .map(|c| ((*c as f64).max(f64::MIN_POSITIVE) / total).ln())
            .collect();

        let feature_log_prob = term_counts
            .iter()
            .map(|counts| {
                let class_total: f64 = counts.iter().sum();
                counts
                    .iter()
                    .map(|c| ((c + 1.0) / (class_total + vocab_size as f64)).ln())
                    .collect()
            })
            .collect();

        Box::new(NaiveBayesWeights {
            class_log_prior,
            feature_log_prob,
        })
    }

    fn load(&self, weights: &serde_json::Value) -> Result<Box<dyn FittedClassifier>> {
        let weights: NaiveBayesWeights = serde_json::from_value(weights.clone())?;
        Ok(Box::new(weights))
    }
}

/// Persisted form of a committed model.
#[derive(Serialize, Deserialize)]
struct ModelArtifact {
    strategy: String,
    vectorizer: TermVectorizer,
    categories: Vec<(i64, String)>,
    weights: serde_json::Value,
    accuracy: f64,
    trained_at: i64,
}

/// A fully assembled model: vectorizer, category list and fitted weights.
/// Swapped in as a unit.
struct CommittedModel {
    vectorizer: TermVectorizer,
    categories: Vec<(CategoryId, String)>,
    fitted: Box<dyn FittedClassifier>,
    accuracy: f64,
    trained_at: i64,
}

/// Trains and serves the category classifier.
pub struct CategoryClassifier {
    db: Arc<Database>,
    strategy: Arc<dyn ClassifierStrategy>,
    committed: RwLock<Option<Arc<CommittedModel>>>,
    config: ClassifierConfig,
}

impl CategoryClassifier {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_strategy(db, Arc::new(MultinomialNaiveBayes), ClassifierConfig::from_env())
    }

    pub fn with_strategy(
        db: Arc<Database>,
        strategy: Arc<dyn ClassifierStrategy>,
        config: ClassifierConfig,
    ) -> Self {
        Self {
            db,
            strategy,
            committed: RwLock::new(None),
            config,
        }
    }

    /// Trains a model and atomically commits it on success.
    ///
    /// When `examples` is omitted, pulls every document carrying a category
    /// assignment as ground truth. Below the configured minimum the run
    /// reports `InsufficientData` and leaves the committed model untouched.
    /// Concurrent predictions keep reading the previous model until the
    /// swap.
    pub fn train_model(&self, examples: Option<Vec<LabeledExample>>) -> Result<TrainingReport> {
        let examples = match examples {
            Some(examples) => examples,
            None => self.labeled_documents()?,
        };
        let data_point_count = examples.len();

        if data_point_count < self.config.min_examples {
            info!(
                examples = data_point_count,
                minimum = self.config.min_examples,
                "insufficient labeled data, keeping committed model"
            );
            return Ok(TrainingReport {
                status: TrainingStatus::InsufficientData,
                accuracy: None,
                categories: None,
                data_point_count,
            });
        }

        let categories = self.resolve_categories(&examples)?;
        let class_index: HashMap<CategoryId, usize> = categories
            .iter()
            .enumerate()
            .map(|(idx, (id, _))| (*id, idx))
            .collect();

        let texts: Vec<&str> = examples.iter().map(|e| e.text.as_str()).collect();
        let vectorizer = TermVectorizer::fit(&texts, self.config.vocab_size);

        let features: Vec<Vec<f64>> = texts.iter().map(|t| vectorizer.transform(t)).collect();
        let labels: Vec<usize> = examples
            .iter()
            .map(|e| class_index[&e.category_id])
            .collect();

        // Deterministic 80/20 split: every fifth example validates.
        let is_validation = |idx: usize| idx % 5 == 4;
        let train_features: Vec<Vec<f64>> = features
            .iter()
            .enumerate()
            .filter(|(i, _)| !is_validation(*i))
            .map(|(_, f)| f.clone())
            .collect();
        let train_labels: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(i, _)| !is_validation(*i))
            .map(|(_, l)| *l)
            .collect();

        let fitted = self
            .strategy
            .fit(&train_features, &train_labels, categories.len());

        let validation: Vec<(usize, &Vec<f64>)> = features
            .iter()
            .enumerate()
            .filter(|(i, _)| is_validation(*i))
            .map(|(i, f)| (labels[i], f))
            .collect();
        let accuracy = if validation.is_empty() {
            evaluate(fitted.as_ref(), &train_features, &train_labels)
        } else {
            let (v_labels, v_features): (Vec<usize>, Vec<Vec<f64>>) = validation
                .into_iter()
                .map(|(l, f)| (l, f.clone()))
                .unzip();
            evaluate(fitted.as_ref(), &v_features, &v_labels)
        };

        let trained_at = OffsetDateTime::now_utc().unix_timestamp();
        let artifact = ModelArtifact {
            strategy: self.strategy.name().to_string(),
            vectorizer: vectorizer.clone(),
            categories: categories.iter().map(|(id, n)| (id.get(), n.clone())).collect(),
            weights: fitted.weights()?,
            accuracy,
            trained_at,
        };
        self.persist(&artifact)?;

        let category_names: Vec<String> = categories.iter().map(|(_, n)| n.clone()).collect();
        let committed = Arc::new(CommittedModel {
            vectorizer,
            categories,
            fitted,
            accuracy,
            trained_at,
        });
        *self.committed.write().expect("model lock poisoned") = Some(committed);

        info!(
            examples = data_point_count,
            accuracy,
            categories = category_names.len(),
            "committed new classifier model"
        );
        Ok(TrainingReport {
            status: TrainingStatus::Trained,
            accuracy: Some(accuracy),
            categories: Some(category_names),
            data_point_count,
        })
    }

    /// Scores text against every known category.
    ///
    /// Probabilities sum to 1.0 and come back sorted descending. Fails with
    /// [`Error::NotTrained`] before any model was committed.
    pub fn predict_category(&self, text: &str) -> Result<Vec<CategoryScore>> {
        let model = self
            .committed
            .read()
            .expect("model lock poisoned")
            .clone()
            .ok_or(Error::NotTrained)?;

        let features = model.vectorizer.transform(text);
        let probabilities = model.fitted.predict_proba(&features);

        let mut scores: Vec<CategoryScore> = model
            .categories
            .iter()
            .zip(probabilities)
            .map(|((id, name), probability)| CategoryScore {
                category_id: *id,
                name: name.clone(),
                probability,
            })
            .collect();
        scores.sort_by(|a, b| {
            b.probability
                .partial_cmp(&a.probability)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.category_id.cmp(&b.category_id))
        });
        Ok(scores)
    }

    /// Predicts and records the top category for a stored document.
    pub fn classify_document(&self, document_id: DocumentId) -> Result<CategoryScore> {
        let content: Option<String> = self
            .db
            .connection()
            .query_row(
                "SELECT content FROM documents WHERE id = ?1",
                [document_id.get()],
                |row| row.get(0),
            )
            .optional()?;
        let content = content.ok_or_else(|| Error::not_found("document", document_id))?;

        let scores = self.predict_category(&content)?;
        let top = scores
            .into_iter()
            .next()
            .ok_or_else(|| Error::Validation("model has no categories".to_string()))?;

        self.db.connection().execute(
            "INSERT OR REPLACE INTO document_categories (document_id, category_id, confidence)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![document_id.get(), top.category_id.get(), top.probability],
        )?;
        Ok(top)
    }

    /// Restores the persisted model at process start.
    ///
    /// Returns false when no artifact has ever been committed.
    pub fn load_committed(&self) -> Result<bool> {
        let artifact: Option<String> = self
            .db
            .connection()
            .query_row(
                "SELECT artifact FROM classifier_models WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(artifact) = artifact else {
            return Ok(false);
        };

        let artifact: ModelArtifact = serde_json::from_str(&artifact)?;
        if artifact.strategy != self.strategy.name() {
            return Err(Error::Validation(format!(
                "persisted model was trained with strategy '{}', expected '{}'",
                artifact.strategy,
                self.strategy.name()
            )));
        }

        let fitted = self.strategy.load(&artifact.weights)?;
        let committed = Arc::new(CommittedModel {
            vectorizer: artifact.vectorizer,
            categories: artifact
                .categories
                .into_iter()
                .map(|(id, name)| (CategoryId::new(id), name))
                .collect(),
            fitted,
            accuracy: artifact.accuracy,
            trained_at: artifact.trained_at,
        });
        *self.committed.write().expect("model lock poisoned") = Some(committed);
        Ok(true)
    }

    /// Accuracy of the committed model, if any.
    pub fn committed_accuracy(&self) -> Option<f64> {
        self.committed
            .read()
            .expect("model lock poisoned")
            .as_ref()
            .map(|m| m.accuracy)
    }

    fn labeled_documents(&self) -> Result<Vec<LabeledExample>> {
        let conn = self.db.connection();
        let mut stmt = conn.prepare(
            "SELECT d.content, dc.category_id
             FROM documents d
             JOIN document_categories dc ON dc.document_id = d.id
             ORDER BY d.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(LabeledExample {
                text: row.get(0)?,
                category_id: CategoryId::new(row.get(1)?),
            })
        })?;

        let mut examples = Vec::new();
        for row in rows {
            examples.push(row?);
        }
        Ok(examples)
    }

    /// Distinct categories present in the training set, in id order, with
    /// their names resolved.
    fn resolve_categories(&self, examples: &[LabeledExample]) -> Result<Vec<(CategoryId, String)>> {
        let mut ids: Vec<CategoryId> = examples.iter().map(|e| e.category_id).collect();
        ids.sort();
        ids.dedup();

        let conn = self.db.connection();
        let mut categories = Vec::with_capacity(ids.len());
        for id in ids {
            let name: Option<String> = conn
                .query_row(
                    "SELECT name FROM categories WHERE id = ?1",
                    [id.get()],
                    |row| row.get(0),
                )
                .optional()?;
            let name = name.ok_or_else(|| Error::not_found("category", id))?;
            categories.push((id, name));
        }
        Ok(categories)
    }

    fn persist(&self, artifact: &ModelArtifact) -> Result<()> {
        let json = serde_json::to_string(artifact)?;
        self.db.connection().execute(
            "INSERT OR REPLACE INTO classifier_models (id, artifact, trained_at) VALUES (1, ?1, ?2)",
            rusqlite::params![json, artifact.trained_at],
        )?;
        Ok(())
    }
}

fn evaluate(model: &dyn FittedClassifier, features: &[Vec<f64>], labels: &[usize]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = features
        .iter()
        .zip(labels)
        .filter(|(feature, label)| {
            let probs = model.predict_proba(feature);
            let predicted = probs
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(idx, _)| idx);
            predicted == Some(**label)
        })
        .count();
    correct as f64 / labels.len() as f64
}
