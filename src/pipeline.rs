//! Question generation graph.
//!
//! ```text
//! metadata -> question_html -> { solution_html, server_js*, server_py* } -> adaptive_combine* -> final_combine
//! ```
//! Nodes marked `*` only run for adaptive questions. Every node is retried up to
//! `graph_max_attempts` times before the whole run fails.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::config::{Prompts, Settings};
use crate::domain::{CodeLanguage, FilesData, InitialMetadata, QuestionMetadata, QuestionPackage, QuestionPayload};
use crate::error::AppResult;
use crate::llm::{complete_json, ChatRequest, LanguageModel, ModelTier, Step};
use crate::retrieval::{ExampleField, ExampleStore};
use crate::util::{fill_template, strip_code_fences};

/// Run `f` until it succeeds or `attempts` runs have failed.
pub(crate) async fn retry<T, F, Fut>(step: Step, attempts: u32, mut f: F) -> AppResult<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = AppResult<T>>,
{
  let attempts = attempts.max(1);
  let mut attempt = 1;
  loop {
    match f().await {
      Ok(v) => return Ok(v),
      Err(e) if attempt < attempts => {
        warn!(target: "pipeline", %step, attempt, error = %e, "Step failed; retrying");
        attempt += 1;
      }
      Err(e) => {
        warn!(target: "pipeline", %step, attempt, error = %e, "Step failed");
        return Err(e);
      }
    }
  }
}

#[derive(Deserialize)]
struct CodeResponse {
  code: String,
}

/// One few-shot code generation request.
struct CodeTask<'a> {
  step: Step,
  tier: ModelTier,
  template: &'a str,
  fields: (ExampleField, ExampleField),
  query: &'a str,
  k: usize,
  filter: Option<bool>,
  guidance: Option<&'a QuestionPayload>,
}

fn append_guidance(prompt: &mut String, payload: &QuestionPayload) {
  if let Some(guide) = payload.solution_guide.as_deref().filter(|s| !s.trim().is_empty()) {
    prompt.push_str(&format!(
      "\nSolution Guide: {guide}\nUse this guide to aid in the creation of the code by following its logic."
    ));
  }
  if let Some(extra) = payload.additional_instructions.as_deref().filter(|s| !s.trim().is_empty()) {
    prompt.push_str(&format!("\nAdditional Instructions: {extra}\nAnalyze these and implement if possible."));
  }
}

/// Metadata file contents: question metadata overlaid by the caller's initial metadata.
pub fn final_metadata(pkg: &QuestionPackage) -> Map<String, Value> {
  let mut out = Map::new();
  for value in [
    pkg.question_metadata.as_ref().and_then(|m| serde_json::to_value(m).ok()),
    pkg.initial_metadata.as_ref().and_then(|m| serde_json::to_value(m).ok()),
  ]
  .into_iter()
  .flatten()
  {
    if let Value::Object(map) = value {
      out.extend(map);
    }
  }
  out
}

pub struct QuestionPipeline {
  llm: Arc<dyn LanguageModel>,
  examples: Arc<ExampleStore>,
  prompts: Prompts,
  max_attempts: u32,
  pub(crate) extraction_attempts: u32,
  default_created_by: String,
}

impl QuestionPipeline {
  pub fn new(llm: Arc<dyn LanguageModel>, examples: Arc<ExampleStore>, prompts: Prompts, settings: &Settings) -> Self {
    Self {
      llm,
      examples,
      prompts,
      max_attempts: settings.graph_max_attempts,
      extraction_attempts: settings.extraction_max_attempts,
      default_created_by: settings.default_created_by.clone(),
    }
  }

  pub(crate) fn llm(&self) -> &dyn LanguageModel {
    self.llm.as_ref()
  }

  pub(crate) fn prompts(&self) -> &Prompts {
    &self.prompts
  }

  /// Run the full graph for one question.
  #[instrument(level = "info", skip_all, fields(question_len = payload.question.len()))]
  pub async fn run(&self, payload: QuestionPayload, initial: Option<InitialMetadata>) -> AppResult<QuestionPackage> {
    let started = Instant::now();
    let initial = initial.unwrap_or_else(|| InitialMetadata::for_creator(&self.default_created_by));
    let mut pkg = QuestionPackage::new(payload, Some(initial));

    let metadata = retry(Step::Metadata, self.max_attempts, || self.generate_metadata(&pkg.question_payload)).await?;
    info!(target: "pipeline", title = %metadata.title, adaptive = metadata.is_adaptive, "Metadata generated");
    pkg.question_metadata = Some(metadata);

    let question_html = retry(Step::QuestionHtml, self.max_attempts, || self.generate_question_html(&pkg)).await?;
    pkg.files = std::mem::take(&mut pkg.files).merge(FilesData { question_html, ..Default::default() });

    let adaptive = pkg.is_adaptive();
    let (solution_html, server_js, server_py) = tokio::join!(
      retry(Step::SolutionHtml, self.max_attempts, || self.generate_solution_html(&pkg)),
      self.maybe_server(&pkg, adaptive, CodeLanguage::Javascript),
      self.maybe_server(&pkg, adaptive, CodeLanguage::Python),
    );
    let branch = FilesData {
      solution_html: solution_html?,
      server_js: server_js?.unwrap_or_default(),
      server_py: server_py?.unwrap_or_default(),
      ..Default::default()
    };
    pkg.files = std::mem::take(&mut pkg.files).merge(branch);

    if adaptive {
      let solution_html = retry(Step::AdaptiveCombine, self.max_attempts, || self.adaptive_combine(&pkg)).await?;
      pkg.files = std::mem::take(&mut pkg.files).merge(FilesData { solution_html, ..Default::default() });
    }

    pkg.files.metadata = final_metadata(&pkg);
    info!(target: "pipeline", title = %pkg.title(), adaptive, elapsed = ?started.elapsed(), "Question package complete");
    Ok(pkg)
  }

  async fn generate_metadata(&self, payload: &QuestionPayload) -> AppResult<QuestionMetadata> {
    let user = fill_template(&self.prompts.metadata_user_template, &[("question", &payload.question)]);
    let req = ChatRequest::json(Step::Metadata, ModelTier::Fast, self.prompts.metadata_system.as_str(), user);
    complete_json(self.llm(), req).await
  }

  async fn generate_code(&self, task: CodeTask<'_>) -> AppResult<String> {
    let mut prompt = self
      .examples
      .build_prompt(Some(self.llm()), task.template, task.fields, task.query, task.k, task.filter)
      .await;
    prompt.push_str(&format!("Input: {}\nOutput:", task.query));
    if let Some(payload) = task.guidance {
      append_guidance(&mut prompt, payload);
    }
    let req = ChatRequest::json(task.step, task.tier, self.prompts.code_system.as_str(), prompt);
    let res: CodeResponse = complete_json(self.llm(), req).await?;
    Ok(strip_code_fences(&res.code))
  }

  async fn generate_question_html(&self, pkg: &QuestionPackage) -> AppResult<String> {
    self
      .generate_code(CodeTask {
        step: Step::QuestionHtml,
        tier: ModelTier::Fast,
        template: &self.prompts.question_html_template,
        fields: (ExampleField::Question, ExampleField::QuestionHtml),
        query: &pkg.question_payload.question,
        k: 2,
        filter: Some(pkg.is_adaptive()),
        guidance: None,
      })
      .await
  }

  async fn generate_solution_html(&self, pkg: &QuestionPackage) -> AppResult<String> {
    self
      .generate_code(CodeTask {
        step: Step::SolutionHtml,
        tier: ModelTier::Fast,
        template: &self.prompts.solution_html_template,
        fields: (ExampleField::QuestionHtml, ExampleField::SolutionHtml),
        query: &pkg.files.question_html,
        k: 2,
        filter: Some(pkg.is_adaptive()),
        guidance: Some(&pkg.question_payload),
      })
      .await
  }

  async fn generate_server(&self, pkg: &QuestionPackage, lang: CodeLanguage) -> AppResult<String> {
    let (step, template, field) = match lang {
      CodeLanguage::Javascript => (Step::ServerJs, &self.prompts.server_js_template, ExampleField::ServerJs),
      CodeLanguage::Python => (Step::ServerPy, &self.prompts.server_py_template, ExampleField::ServerPy),
    };
    self
      .generate_code(CodeTask {
        step,
        tier: ModelTier::Strong,
        template,
        fields: (ExampleField::QuestionHtml, field),
        query: &pkg.files.question_html,
        k: 1,
        filter: None,
        guidance: Some(&pkg.question_payload),
      })
      .await
  }

  async fn maybe_server(&self, pkg: &QuestionPackage, adaptive: bool, lang: CodeLanguage) -> AppResult<Option<String>> {
    if !adaptive {
      return Ok(None);
    }
    let step = match lang {
      CodeLanguage::Javascript => Step::ServerJs,
      CodeLanguage::Python => Step::ServerPy,
    };
    retry(step, self.max_attempts, || self.generate_server(pkg, lang)).await.map(Some)
  }

  async fn adaptive_combine(&self, pkg: &QuestionPackage) -> AppResult<String> {
    let lang = pkg.codelang();
    let (preferred, other) = match lang {
      CodeLanguage::Javascript => (&pkg.files.server_js, &pkg.files.server_py),
      CodeLanguage::Python => (&pkg.files.server_py, &pkg.files.server_js),
    };
    let code = if preferred.trim().is_empty() { other } else { preferred };
    let user = fill_template(
      &self.prompts.adaptive_combine_template,
      &[("codelang", lang.name()), ("solution_html", &pkg.files.solution_html), ("code", code)],
    );
    let req = ChatRequest::json(Step::AdaptiveCombine, ModelTier::Fast, self.prompts.code_system.as_str(), user);
    let res: CodeResponse = complete_json(self.llm(), req).await?;
    Ok(strip_code_fences(&res.code))
  }
}
