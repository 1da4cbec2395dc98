//! Centroid-based text classification for support conversations.
//!
//! Each label dimension (service type, category) gets its own model: a
//! TF-IDF vectoriser over unigrams and bigrams, and one L2-normalised
//! centroid per label. A conversation is scored by cosine similarity to every
//! centroid, and the similarities become probabilities through a
//! temperature softmax.
//!
//! Distributions only cover labels seen during fit. Argmax ties resolve to
//! whichever tied label comes first in fit order; callers must not rely on
//! that.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use autotag_core::{Category, LabelPair, ServiceType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::corpus::TrainingCorpus;

/// Softmax temperature applied to cosine similarities.
const SOFTMAX_TEMPERATURE: f32 = 0.1;

const SERVICE_ARTIFACT: &str = "svc_type.json";
const CATEGORY_ARTIFACT: &str = "category.json";

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("failed to load training corpus: {0:#}")]
    Corpus(anyhow::Error),

    #[error("training corpus is empty")]
    EmptyCorpus,

    #[error("model artifact I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("model artifact {path} is not valid: {source}")]
    Artifact {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Probability per label, in fit order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Distribution<L> {
    entries: Vec<(L, f64)>,
}

impl<L: Copy + PartialEq> Distribution<L> {
    pub fn new(entries: Vec<(L, f64)>) -> Self {
        Self { entries }
    }

    /// Probability assigned to `label`; `None` if the label was never seen
    /// during fit.
    pub fn get(&self, label: L) -> Option<f64> {
        self.entries
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, p)| *p)
    }

    /// Argmax label. The first of several tied labels wins.
    pub fn top(&self) -> Option<L> {
        let mut best: Option<(L, f64)> = None;
        for &(label, p) in &self.entries {
            match best {
                Some((_, best_p)) if p <= best_p => {}
                _ => best = Some((label, p)),
            }
        }
        best.map(|(l, _)| l)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(L, f64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Full classifier output for one text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub service: Distribution<ServiceType>,
    pub category: Distribution<Category>,
}

impl Prediction {
    /// Argmax label per dimension.
    pub fn top_guess(&self) -> LabelPair {
        LabelPair {
            service_type: self.service.top(),
            category: self.category.top(),
        }
    }
}

/// Fit quality on the training corpus, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrainingMetrics {
    pub service_macro_f1: f64,
    pub service_micro_f1: f64,
    pub category_macro_f1: f64,
    pub category_micro_f1: f64,
    pub records: usize,
}

/// Predict-probabilities contract consumed by the fusion policy.
pub trait TextClassifier: Send + Sync {
    fn predict(&self, text: &str) -> Prediction;

    /// Refit from the corpus. After this returns `Ok`, [`predict`](Self::predict)
    /// reflects the new model.
    fn retrain(&self) -> Result<TrainingMetrics, ClassifierError>;
}

// ── TF-IDF ──

/// TF-IDF vectoriser with smoothed idf: `ln((1 + n) / (1 + df)) + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Vectorizer {
    vocab: HashMap<String, usize>,
    idf: Vec<f32>,
}

impl Vectorizer {
    fn fit(docs: &[&str]) -> Self {
        let mut vocab: HashMap<String, usize> = HashMap::new();
        let mut df: Vec<usize> = Vec::new();

        for doc in docs {
            let mut seen = std::collections::HashSet::new();
            for term in terms(doc) {
                let next = vocab.len();
                let idx = *vocab.entry(term).or_insert(next);
                if idx == df.len() {
                    df.push(0);
                }
                if seen.insert(idx) {
                    df[idx] += 1;
                }
            }
        }

        let n = docs.len() as f32;
        let idf = df
            .iter()
            .map(|&d| ((1.0 + n) / (1.0 + d as f32)).ln() + 1.0)
            .collect();

        Self { vocab, idf }
    }

    fn dim(&self) -> usize {
        self.idf.len()
    }

    /// Dense, L2-normalised TF-IDF vector. Unknown terms are ignored.
    fn transform(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim()];
        for term in terms(text) {
            if let Some(&idx) = self.vocab.get(&term) {
                v[idx] += 1.0;
            }
        }
        for (x, idf) in v.iter_mut().zip(&self.idf) {
            *x *= idf;
        }
        normalize(&mut v);
        v
    }
}

/// Lower-cased word tokens of two or more characters, plus adjacent bigrams.
fn terms(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 2)
        .collect();

    let mut out: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
    out.extend(tokens.windows(2).map(|w| format!("{} {}", w[0], w[1])));
    out
}

// ── Centroid model ──

/// One label dimension: vectoriser plus a centroid per label.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CentroidModel<L> {
    vectorizer: Vectorizer,
    labels: Vec<L>,
    centroids: Vec<Vec<f32>>,
}

impl<L: Copy + PartialEq> CentroidModel<L> {
    /// Fit on parallel `texts` / `labels`. Labels keep first-seen order.
    fn build(texts: &[&str], labels: &[L]) -> Self {
        let vectorizer = Vectorizer::fit(texts);
        let dim = vectorizer.dim();

        // Accumulate: label → (sum_vector, count).
        let mut order: Vec<L> = Vec::new();
        let mut accum: Vec<(Vec<f32>, usize)> = Vec::new();

        for (text, &label) in texts.iter().zip(labels) {
            let emb = vectorizer.transform(text);
            let slot = match order.iter().position(|l| *l == label) {
                Some(i) => i,
                None => {
                    order.push(label);
                    accum.push((vec![0.0f32; dim], 0));
                    order.len() - 1
                }
            };
            let entry = &mut accum[slot];
            for (acc, &val) in entry.0.iter_mut().zip(&emb) {
                *acc += val;
            }
            entry.1 += 1;
        }

        let centroids = accum.into_iter().map(finalize_centroid).collect();

        Self {
            vectorizer,
            labels: order,
            centroids,
        }
    }

    fn distribution(&self, text: &str) -> Distribution<L> {
        let v = self.vectorizer.transform(text);
        let sims: Vec<f32> = self.centroids.iter().map(|c| cosine_sim(&v, c)).collect();
        let probs = softmax(&sims, SOFTMAX_TEMPERATURE);
        Distribution::new(self.labels.iter().copied().zip(probs).collect())
    }
}

fn finalize_centroid((mut sum, count): (Vec<f32>, usize)) -> Vec<f32> {
    if count > 0 {
        for v in &mut sum {
            *v /= count as f32;
        }
        normalize(&mut sum);
    }
    sum
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// L2-normalize a vector in place.
fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn softmax(scores: &[f32], temperature: f32) -> Vec<f64> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f64> = scores
        .iter()
        .map(|s| (((s - max) / temperature) as f64).exp())
        .collect();
    let total: f64 = exps.iter().sum();
    if total > 0.0 {
        exps.into_iter().map(|e| e / total).collect()
    } else {
        exps
    }
}

// ── Model pair ──

/// Fitted models for both dimensions.
#[derive(Debug, Clone)]
pub struct ModelPair {
    service: CentroidModel<ServiceType>,
    category: CentroidModel<Category>,
}

impl ModelPair {
    pub fn fit(corpus: &TrainingCorpus) -> Result<Self, ClassifierError> {
        if corpus.is_empty() {
            return Err(ClassifierError::EmptyCorpus);
        }
        let texts = corpus.texts();
        Ok(Self {
            service: CentroidModel::build(&texts, &corpus.service_labels()),
            category: CentroidModel::build(&texts, &corpus.category_labels()),
        })
    }

    pub fn predict(&self, text: &str) -> Prediction {
        Prediction {
            service: self.service.distribution(text),
            category: self.category.distribution(text),
        }
    }

    /// Score the pair against the corpus it was fit on.
    pub fn evaluate(&self, corpus: &TrainingCorpus) -> TrainingMetrics {
        let mut svc_pred = Vec::with_capacity(corpus.len());
        let mut cat_pred = Vec::with_capacity(corpus.len());
        for record in &corpus.records {
            let guess = self.predict(&record.text).top_guess();
            svc_pred.push(guess.service_type);
            cat_pred.push(guess.category);
        }
        let svc_true: Vec<Option<ServiceType>> =
            corpus.service_labels().into_iter().map(Some).collect();
        let cat_true: Vec<Option<Category>> =
            corpus.category_labels().into_iter().map(Some).collect();

        TrainingMetrics {
            service_macro_f1: macro_f1(&svc_true, &svc_pred),
            service_micro_f1: micro_f1(&svc_true, &svc_pred),
            category_macro_f1: macro_f1(&cat_true, &cat_pred),
            category_micro_f1: micro_f1(&cat_true, &cat_pred),
            records: corpus.len(),
        }
    }

    fn save(&self, models_dir: &Path) -> Result<(), ClassifierError> {
        std::fs::create_dir_all(models_dir).map_err(|source| ClassifierError::Io {
            path: models_dir.to_path_buf(),
            source,
        })?;
        write_artifact(&models_dir.join(SERVICE_ARTIFACT), &self.service)?;
        write_artifact(&models_dir.join(CATEGORY_ARTIFACT), &self.category)?;
        Ok(())
    }

    fn load(models_dir: &Path) -> Result<Self, ClassifierError> {
        Ok(Self {
            service: read_artifact(&models_dir.join(SERVICE_ARTIFACT))?,
            category: read_artifact(&models_dir.join(CATEGORY_ARTIFACT))?,
        })
    }
}

fn write_artifact<T: Serialize>(path: &Path, value: &T) -> Result<(), ClassifierError> {
    let json = serde_json::to_vec(value).map_err(|source| ClassifierError::Artifact {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, json).map_err(|source| ClassifierError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_artifact<T: DeserializeOwned>(path: &Path) -> Result<T, ClassifierError> {
    let bytes = std::fs::read(path).map_err(|source| ClassifierError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ClassifierError::Artifact {
        path: path.to_path_buf(),
        source,
    })
}

// ── F1 ──

/// Micro F1 for single-label multiclass data, which equals accuracy.
fn micro_f1<L: PartialEq>(truth: &[Option<L>], pred: &[Option<L>]) -> f64 {
    if truth.is_empty() {
        return 0.0;
    }
    let correct = truth.iter().zip(pred).filter(|(t, p)| t == p).count();
    correct as f64 / truth.len() as f64
}

/// Unweighted mean of per-label F1 over every label present in truth or
/// prediction. Labels with no support and no predictions score 0.
fn macro_f1<L: Copy + Eq + Hash>(truth: &[Option<L>], pred: &[Option<L>]) -> f64 {
    let mut labels: Vec<L> = Vec::new();
    for l in truth.iter().chain(pred).flatten() {
        if !labels.contains(l) {
            labels.push(*l);
        }
    }
    if labels.is_empty() {
        return 0.0;
    }

    let total: f64 = labels
        .iter()
        .map(|&label| {
            let mut tp = 0usize;
            let mut fp = 0usize;
            let mut fn_ = 0usize;
            for (t, p) in truth.iter().zip(pred) {
                let is_t = *t == Some(label);
                let is_p = *p == Some(label);
                match (is_t, is_p) {
                    (true, true) => tp += 1,
                    (false, true) => fp += 1,
                    (true, false) => fn_ += 1,
                    (false, false) => {}
                }
            }
            let denom = 2 * tp + fp + fn_;
            if denom == 0 {
                0.0
            } else {
                (2 * tp) as f64 / denom as f64
            }
        })
        .sum();

    total / labels.len() as f64
}

// ── Classifier ──

/// Shared classifier with atomic hot-swap on retrain.
///
/// Predictions clone the current `Arc<ModelPair>` under a short read lock, so
/// a concurrent retrain never exposes a half-built model: the replacement is
/// fit completely before the pointer is swapped.
pub struct CentroidClassifier {
    models_dir: PathBuf,
    corpus_path: PathBuf,
    model: RwLock<Arc<ModelPair>>,
}

impl CentroidClassifier {
    /// Load persisted artifacts, or train from the corpus when they are
    /// missing or unreadable.
    pub fn load_or_train(models_dir: &Path, corpus_path: &Path) -> Result<Self, ClassifierError> {
        let model = match ModelPair::load(models_dir) {
            Ok(model) => {
                info!(models_dir = %models_dir.display(), "loaded classifier artifacts");
                model
            }
            Err(ClassifierError::Io { path, .. }) if !path.exists() => {
                info!(models_dir = %models_dir.display(), "no classifier artifacts, training");
                Self::fit_and_save(models_dir, corpus_path)?.0
            }
            Err(e) => {
                warn!(error = %e, "classifier artifacts unusable, retraining");
                Self::fit_and_save(models_dir, corpus_path)?.0
            }
        };

        Ok(Self {
            models_dir: models_dir.to_path_buf(),
            corpus_path: corpus_path.to_path_buf(),
            model: RwLock::new(Arc::new(model)),
        })
    }

    fn fit_and_save(
        models_dir: &Path,
        corpus_path: &Path,
    ) -> Result<(ModelPair, TrainingMetrics), ClassifierError> {
        let corpus = TrainingCorpus::from_jsonl(corpus_path).map_err(ClassifierError::Corpus)?;
        let model = ModelPair::fit(&corpus)?;
        let metrics = model.evaluate(&corpus);
        model.save(models_dir)?;
        let shape = corpus.summary();
        info!(
            records = metrics.records,
            service_types = shape.distinct_service_types,
            categories = shape.distinct_categories,
            label_pairs = shape.distinct_pairs,
            service_macro_f1 = metrics.service_macro_f1,
            category_macro_f1 = metrics.category_macro_f1,
            "trained classifier"
        );
        Ok((model, metrics))
    }

    fn current(&self) -> Arc<ModelPair> {
        // Only whole Arcs are ever stored, so a poisoned lock still holds a
        // complete model.
        match self.model.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap(&self, model: ModelPair) {
        let mut guard = match self.model.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(model);
    }
}

impl TextClassifier for CentroidClassifier {
    fn predict(&self, text: &str) -> Prediction {
        self.current().predict(text)
    }

    fn retrain(&self) -> Result<TrainingMetrics, ClassifierError> {
        let (model, metrics) = Self::fit_and_save(&self.models_dir, &self.corpus_path)?;
        self.swap(model);
        Ok(metrics)
    }
}
