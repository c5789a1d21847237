//! Questions extracted from uploaded images, each run through the generation graph.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::domain::{InitialMetadata, QuestionPackage, QuestionPayload};
use crate::error::{AppError, AppResult};
use crate::llm::{complete_json, ChatRequest, ImageInput, ModelTier, Step};
use crate::pipeline::{retry, QuestionPipeline};

/// One uploaded image.
#[derive(Clone, Debug)]
pub struct UploadedImage {
  pub file_name: String,
  pub mime: Option<String>,
  pub bytes: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct ExtractionResult {
  #[serde(default)]
  questions_payload: Vec<QuestionPayload>,
  #[serde(default)]
  num_extracted: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ImageExtraction {
  pub image_names: Vec<String>,
  pub question_packages: Vec<QuestionPackage>,
  pub num_extracted: usize,
}

impl QuestionPipeline {
  async fn extract_questions(&self, images: &[UploadedImage]) -> AppResult<ExtractionResult> {
    let inputs: Vec<ImageInput> = images.iter().map(|i| ImageInput::from_bytes(&i.bytes, i.mime.as_deref())).collect();
    let req = ChatRequest::json(Step::ExtractQuestions, ModelTier::Vision, "", self.prompts().extract_questions_prompt.as_str())
      .with_images(inputs);
    complete_json(self.llm(), req).await
  }

  /// Extract every question shown in `images` and generate a package for each, concurrently.
  #[instrument(level = "info", skip_all, fields(images = images.len()))]
  pub async fn run_images(&self, images: Vec<UploadedImage>, initial: Option<InitialMetadata>) -> AppResult<ImageExtraction> {
    if images.is_empty() {
      return Err(AppError::BadRequest("At least one image is required".into()));
    }
    let extracted = retry(Step::ExtractQuestions, self.extraction_attempts, || self.extract_questions(&images)).await?;
    let found = extracted.questions_payload.len();
    info!(target: "pipeline", found, reported = ?extracted.num_extracted, "Questions extracted from images");

    let question_packages =
      try_join_all(extracted.questions_payload.into_iter().map(|payload| self.run(payload, initial.clone()))).await?;

    Ok(ImageExtraction {
      image_names: images.into_iter().map(|i| i.file_name).collect(),
      question_packages,
      num_extracted: extracted.num_extracted.unwrap_or(found),
    })
  }
}
