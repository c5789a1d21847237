//! Language model seam used by the generation pipeline and example retrieval.
//!
//! The production implementation is [`crate::openai::OpenAI`]; tests drive the
//! pipeline with scripted models implementing the same trait.

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{AppError, AppResult};
use crate::util::strip_code_fences;

/// Which configured model a request should go to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelTier {
  /// Short structured tasks (metadata, HTML, solution).
  Fast,
  /// Long-context reasoning (generator code).
  Strong,
  /// Image understanding.
  Vision,
}

/// Named node of the generation graph issuing a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
  Metadata,
  QuestionHtml,
  ServerJs,
  ServerPy,
  SolutionHtml,
  AdaptiveCombine,
  ExtractQuestions,
}

impl Step {
  pub fn as_str(self) -> &'static str {
    match self {
      Step::Metadata => "generate_metadata",
      Step::QuestionHtml => "generate_question_html",
      Step::ServerJs => "generate_js",
      Step::ServerPy => "generate_py",
      Step::SolutionHtml => "generate_solution_html",
      Step::AdaptiveCombine => "adaptive_combine",
      Step::ExtractQuestions => "extract_questions",
    }
  }
}

impl fmt::Display for Step {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Base64-encoded image attached to a request.
#[derive(Clone, Debug)]
pub struct ImageInput {
  pub mime: String,
  pub base64: String,
}

impl ImageInput {
  pub fn from_bytes(bytes: &[u8], mime: Option<&str>) -> Self {
    use base64::Engine as _;
    let mime = match mime {
      Some(m) if m.starts_with("image/") => m.to_string(),
      _ => "image/jpeg".to_string(),
    };
    Self { mime, base64: base64::engine::general_purpose::STANDARD.encode(bytes) }
  }

  pub fn data_url(&self) -> String {
    format!("data:{};base64,{}", self.mime, self.base64)
  }
}

#[derive(Clone, Debug)]
pub struct ChatRequest {
  pub step: Step,
  pub tier: ModelTier,
  pub system: String,
  pub user: String,
  pub images: Vec<ImageInput>,
  pub temperature: f32,
  /// Ask the provider for a JSON object response.
  pub json: bool,
}

impl ChatRequest {
  pub fn json(step: Step, tier: ModelTier, system: impl Into<String>, user: impl Into<String>) -> Self {
    Self {
      step,
      tier,
      system: system.into(),
      user: user.into(),
      images: Vec::new(),
      temperature: 0.2,
      json: true,
    }
  }

  pub fn with_images(mut self, images: Vec<ImageInput>) -> Self {
    self.images = images;
    self
  }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
  /// Chat completion; returns the raw text of the first choice.
  async fn complete(&self, req: ChatRequest) -> AppResult<String>;

  /// One embedding vector per input, in input order.
  async fn embed(&self, inputs: &[String]) -> AppResult<Vec<Vec<f32>>>;
}

/// Decode a JSON completion, tolerating markdown fences around the object.
pub fn decode_json<T: DeserializeOwned>(step: Step, text: &str) -> AppResult<T> {
  serde_json::from_str::<T>(text.trim())
    .or_else(|_| serde_json::from_str::<T>(&strip_code_fences(text)))
    .map_err(|e| AppError::Llm(format!("{step}: JSON parse error: {e}")))
}

pub async fn complete_json<T: DeserializeOwned>(llm: &dyn LanguageModel, req: ChatRequest) -> AppResult<T> {
  let step = req.step;
  let text = llm.complete(req).await?;
  decode_json(step, &text)
}
