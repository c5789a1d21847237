//! Example retrieval for few-shot prompts.
//!
//! The example bank is a JSON array of finished questions. Each record is indexed by an
//! embedding of its `question` text; embeddings are cached in SQLite so restarts only
//! embed new or edited records. Search is a linear cosine scan, which is plenty for a
//! bank of a few hundred questions.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::domain::de_flexible_bool;
use crate::error::AppResult;
use crate::llm::LanguageModel;
use crate::store::{CachedEmbedding, Database};

const INDEX_BATCH: usize = 64;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ExampleRecord {
  #[serde(default)]
  pub question: String,
  #[serde(default)]
  pub question_html: String,
  #[serde(default)]
  pub server_js: String,
  #[serde(default)]
  pub server_py: String,
  #[serde(default)]
  pub solution_html: String,
  #[serde(deserialize_with = "de_flexible_bool", default)]
  pub is_adaptive: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExampleField {
  Question,
  QuestionHtml,
  ServerJs,
  ServerPy,
  SolutionHtml,
}

impl ExampleField {
  pub fn of(self, rec: &ExampleRecord) -> &str {
    match self {
      ExampleField::Question => &rec.question,
      ExampleField::QuestionHtml => &rec.question_html,
      ExampleField::ServerJs => &rec.server_js,
      ExampleField::ServerPy => &rec.server_py,
      ExampleField::SolutionHtml => &rec.solution_html,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hit {
  pub index: usize,
  pub score: f32,
}

/// Cosine similarity; zero when either vector has no magnitude or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
  if a.len() != b.len() || a.is_empty() {
    return 0.0;
  }
  let mut dot = 0.0f32;
  let mut na = 0.0f32;
  let mut nb = 0.0f32;
  for (x, y) in a.iter().zip(b) {
    dot += x * y;
    na += x * x;
    nb += y * y;
  }
  if na == 0.0 || nb == 0.0 {
    return 0.0;
  }
  dot / (na.sqrt() * nb.sqrt())
}

fn term_counts(text: &str) -> HashMap<String, f32> {
  let mut counts = HashMap::new();
  for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
    *counts.entry(word.to_lowercase()).or_insert(0.0) += 1.0;
  }
  counts
}

/// Bag-of-words cosine, used when no embeddings are available.
pub fn lexical_similarity(a: &str, b: &str) -> f32 {
  let ta = term_counts(a);
  let tb = term_counts(b);
  let dot: f32 = ta.iter().filter_map(|(w, x)| tb.get(w).map(|y| x * y)).sum();
  let na: f32 = ta.values().map(|x| x * x).sum::<f32>().sqrt();
  let nb: f32 = tb.values().map(|x| x * x).sum::<f32>().sqrt();
  if na == 0.0 || nb == 0.0 { 0.0 } else { dot / (na * nb) }
}

fn content_hash(text: &str) -> String {
  hex::encode(Sha256::digest(text.as_bytes()))
}

fn rank(mut hits: Vec<Hit>, k: usize) -> Vec<Hit> {
  hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal).then(a.index.cmp(&b.index)));
  hits.truncate(k);
  hits
}

pub struct ExampleStore {
  records: Vec<ExampleRecord>,
  /// One vector per record once indexing has finished.
  index: RwLock<Option<Vec<Vec<f32>>>>,
}

impl ExampleStore {
  pub fn new(records: Vec<ExampleRecord>) -> Self {
    Self { records, index: RwLock::new(None) }
  }

  /// Load the bank from a JSON file. A missing or unreadable bank yields an empty store.
  pub fn load(path: &Path) -> Self {
    let records = match std::fs::read_to_string(path) {
      Ok(s) => match serde_json::from_str::<Vec<ExampleRecord>>(&s) {
        Ok(r) => r,
        Err(e) => {
          warn!(target: "retrieval", path = %path.display(), error = %e, "Example bank is not valid JSON; continuing without examples");
          Vec::new()
        }
      },
      Err(e) => {
        warn!(target: "retrieval", path = %path.display(), error = %e, "Example bank not found; continuing without examples");
        Vec::new()
      }
    };
    info!(target: "retrieval", count = records.len(), adaptive = records.iter().filter(|r| r.is_adaptive).count(), "Loaded example bank");
    Self::new(records)
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub async fn is_indexed(&self) -> bool {
    self.index.read().await.is_some()
  }

  /// Embed every record's question, reusing cached vectors whose content hash still matches.
  /// Returns the number of records embedded in this call.
  #[instrument(level = "info", skip(self, llm, db), fields(records = self.records.len()))]
  pub async fn build_index(&self, llm: &dyn LanguageModel, db: &Database, model: &str) -> AppResult<usize> {
    let cached = db.load_embeddings(model)?;
    let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(self.records.len());
    let mut stale: Vec<(usize, String)> = Vec::new();

    for (i, rec) in self.records.iter().enumerate() {
      let hash = content_hash(&rec.question);
      match cached.get(&i) {
        Some(c) if c.content_hash == hash => vectors.push(Some(c.vector.clone())),
        _ => {
          vectors.push(None);
          stale.push((i, hash));
        }
      }
    }
    debug!(target: "retrieval", cached = self.records.len() - stale.len(), stale = stale.len(), "Embedding cache checked");

    for batch in stale.chunks(INDEX_BATCH) {
      let inputs: Vec<String> = batch.iter().map(|(i, _)| self.records[*i].question.clone()).collect();
      let embedded = llm.embed(&inputs).await?;
      let mut rows = Vec::with_capacity(batch.len());
      for ((i, hash), vector) in batch.iter().zip(embedded) {
        vectors[*i] = Some(vector.clone());
        rows.push((*i, CachedEmbedding { content_hash: hash.clone(), vector }));
      }
      db.save_embeddings(model, &rows)?;
    }

    let ready: Vec<Vec<f32>> = vectors.into_iter().map(|v| v.unwrap_or_default()).collect();
    *self.index.write().await = Some(ready);
    info!(target: "retrieval", embedded = stale.len(), "Example index ready");
    Ok(stale.len())
  }

  fn candidates(&self, filter: Option<bool>) -> impl Iterator<Item = (usize, &ExampleRecord)> {
    self.records.iter().enumerate().filter(move |(_, r)| filter.map_or(true, |f| r.is_adaptive == f))
  }

  fn lexical_search(&self, query: &str, k: usize, filter: Option<bool>) -> Vec<Hit> {
    let hits = self
      .candidates(filter)
      .map(|(index, r)| Hit { index, score: lexical_similarity(query, &r.question) })
      .collect();
    rank(hits, k)
  }

  /// Top `k` records most similar to `query`, optionally restricted by adaptivity.
  #[instrument(level = "debug", skip(self, llm, query), fields(query_len = query.len()))]
  pub async fn search(&self, llm: Option<&dyn LanguageModel>, query: &str, k: usize, filter: Option<bool>) -> Vec<Hit> {
    if k == 0 || self.records.is_empty() {
      return Vec::new();
    }
    let index = self.index.read().await;
    let (Some(llm), Some(vectors)) = (llm, index.as_ref()) else {
      return self.lexical_search(query, k, filter);
    };

    let query_vec = match llm.embed(&[query.to_string()]).await {
      Ok(mut v) if !v.is_empty() => v.swap_remove(0),
      Ok(_) => return self.lexical_search(query, k, filter),
      Err(e) => {
        warn!(target: "retrieval", error = %e, "Query embedding failed; using lexical search");
        return self.lexical_search(query, k, filter);
      }
    };

    let hits = self
      .candidates(filter)
      .map(|(index, _)| Hit { index, score: cosine_similarity(&query_vec, &vectors[index]) })
      .collect();
    rank(hits, k)
  }

  /// `base` followed by one `Input:`/`Output:` pair per retrieved example.
  pub async fn build_prompt(
    &self,
    llm: Option<&dyn LanguageModel>,
    base: &str,
    fields: (ExampleField, ExampleField),
    query: &str,
    k: usize,
    filter: Option<bool>,
  ) -> String {
    let hits = self.search(llm, query, k, filter).await;
    let mut out = format!("{base}\n");
    for hit in &hits {
      let rec = &self.records[hit.index];
      out.push_str(&format!("Input: {}\nOutput: {}\n", fields.0.of(rec), fields.1.of(rec)));
    }
    debug!(target: "retrieval", examples = hits.len(), "Built few-shot prompt");
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::llm::testing::ScriptedModel;

  fn rec(question: &str, html: &str, adaptive: bool) -> ExampleRecord {
    ExampleRecord { question: question.into(), question_html: html.into(), is_adaptive: adaptive, ..Default::default() }
  }

  fn bank() -> ExampleStore {
    ExampleStore::new(vec![
      rec("A ball is thrown upward at 12 m/s", "<p>ball</p>", true),
      rec("Explain Newton's third law", "<p>newton</p>", false),
      rec("A car accelerates at 3 m/s^2 from rest", "<p>car</p>", true),
    ])
  }

  /// Two-dimensional toy embedding: (mentions motion, mentions laws).
  fn toy_embedder() -> ScriptedModel {
    ScriptedModel::new().with_embedder(|s: &str| {
      let s = s.to_lowercase();
      let motion = if s.contains("m/s") || s.contains("speed") { 1.0 } else { 0.0 };
      let laws = if s.contains("law") { 1.0 } else { 0.0 };
      vec![motion, laws, 0.1]
    })
  }

  #[test]
  fn cosine_handles_degenerate_vectors() {
    assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
  }

  #[test]
  fn records_accept_string_flags() {
    let r: Vec<ExampleRecord> =
      serde_json::from_str(r#"[{"question":"q","question_html":"h","is_adaptive":"True"}]"#).unwrap();
    assert!(r[0].is_adaptive);
    assert_eq!(r[0].server_js, "");
  }

  #[test]
  fn missing_bank_is_empty() {
    let store = ExampleStore::load(Path::new("/nonexistent/examples.json"));
    assert!(store.is_empty());
  }

  #[tokio::test]
  async fn lexical_search_without_model() {
    let hits = bank().search(None, "thrown ball upward", 2, None).await;
    assert_eq!(hits[0].index, 0);
    assert!(hits.len() <= 2);
  }

  #[tokio::test]
  async fn filter_restricts_to_adaptive_flag() {
    let hits = bank().search(None, "law", 5, Some(false)).await;
    assert_eq!(hits.iter().map(|h| h.index).collect::<Vec<_>>(), vec![1]);
  }

  #[tokio::test]
  async fn ties_break_by_index() {
    let store = ExampleStore::new(vec![rec("same", "a", true), rec("same", "b", true), rec("same", "c", true)]);
    let hits = store.search(None, "same", 2, None).await;
    assert_eq!(hits.iter().map(|h| h.index).collect::<Vec<_>>(), vec![0, 1]);
  }

  #[tokio::test]
  async fn embedding_search_after_indexing_and_cache_reuse() {
    let db = Database::open_in_memory().unwrap();
    let model = toy_embedder();
    let store = bank();
    assert!(!store.is_indexed().await);
    assert_eq!(store.build_index(&model, &db, "toy").await.unwrap(), 3);
    assert!(store.is_indexed().await);

    let hits = store.search(Some(&model), "What is the speed?", 1, Some(true)).await;
    assert!(hits[0].index == 0 || hits[0].index == 2);

    let hits = store.search(Some(&model), "Which law applies", 1, None).await;
    assert_eq!(hits[0].index, 1);

    // Second build finds every vector in the cache.
    let again = bank();
    assert_eq!(again.build_index(&model, &db, "toy").await.unwrap(), 0);
  }

  #[tokio::test]
  async fn edited_record_is_re_embedded() {
    let db = Database::open_in_memory().unwrap();
    let model = toy_embedder();
    bank().build_index(&model, &db, "toy").await.unwrap();

    let edited = ExampleStore::new(vec![
      rec("A ball is thrown upward at 15 m/s", "<p>ball</p>", true),
      rec("Explain Newton's third law", "<p>newton</p>", false),
      rec("A car accelerates at 3 m/s^2 from rest", "<p>car</p>", true),
    ]);
    assert_eq!(edited.build_index(&model, &db, "toy").await.unwrap(), 1);
  }

  #[tokio::test]
  async fn prompt_lists_examples_as_input_output_pairs() {
    let prompt = bank()
      .build_prompt(None, "Convert the question.", (ExampleField::Question, ExampleField::QuestionHtml), "car accelerates", 1, Some(true))
      .await;
    assert_eq!(prompt, "Convert the question.\nInput: A car accelerates at 3 m/s^2 from rest\nOutput: <p>car</p>\n");
  }
}
