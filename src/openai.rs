//! Minimal OpenAI client for our use-cases.
//!
//! We call chat.completions (optionally with image parts and a JSON-object response format)
//! and embeddings. Calls are instrumented and log model names, latencies, and usage (not contents).
//!
//! NOTE: We never log the API key.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, instrument};

use crate::error::{AppError, AppResult};
use crate::llm::{ChatRequest, LanguageModel, ModelTier};

const EMBED_BATCH: usize = 64;

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub fast_model: String,
  pub strong_model: String,
  pub vision_model: String,
  pub embedding_model: String,
}

impl OpenAI {
  /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env() -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty())?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let fast_model =
      std::env::var("OPENAI_FAST_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
    let strong_model =
      std::env::var("OPENAI_STRONG_MODEL").unwrap_or_else(|_| "gpt-4o".into());
    let vision_model =
      std::env::var("OPENAI_VISION_MODEL").unwrap_or_else(|_| "gpt-4o-2024-08-06".into());
    let embedding_model =
      std::env::var("OPENAI_EMBEDDING_MODEL").unwrap_or_else(|_| "text-embedding-3-large".into());

    // Generator code for long questions can take a while to stream back.
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(120))
      .build()
      .ok()?;

    Some(Self {
      client,
      api_key,
      base_url: base_url.trim_end_matches('/').to_string(),
      fast_model,
      strong_model,
      vision_model,
      embedding_model,
    })
  }

  fn model_for(&self, tier: ModelTier) -> &str {
    match tier {
      ModelTier::Fast => &self.fast_model,
      ModelTier::Strong => &self.strong_model,
      ModelTier::Vision => &self.vision_model,
    }
  }

  async fn post<T, B>(&self, path: &str, body: &B) -> AppResult<T>
  where
    T: for<'a> Deserialize<'a>,
    B: Serialize + ?Sized + Sync,
  {
    let url = format!("{}/{}", self.base_url, path);
    let res = self.client.post(&url)
      .header(USER_AGENT, "gestalt-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(body).send().await.map_err(|e| AppError::Llm(e.to_string()))?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let msg = extract_openai_error(&body).unwrap_or(body);
      return Err(AppError::Llm(format!("OpenAI HTTP {}: {}", status, msg)));
    }

    res.json::<T>().await.map_err(|e| AppError::Llm(e.to_string()))
  }
}

/// User message content: plain text, or text followed by image parts.
fn user_content(req: &ChatRequest) -> Value {
  if req.images.is_empty() {
    return Value::String(req.user.clone());
  }
  let mut parts = vec![json!({ "type": "text", "text": req.user })];
  for img in &req.images {
    parts.push(json!({
      "type": "image_url",
      "image_url": { "url": img.data_url(), "detail": "high" }
    }));
  }
  Value::Array(parts)
}

fn build_chat_request(model: &str, req: &ChatRequest) -> ChatCompletionRequest {
  let mut messages = Vec::with_capacity(2);
  if !req.system.is_empty() {
    messages.push(ChatMessageReq { role: "system".into(), content: Value::String(req.system.clone()) });
  }
  messages.push(ChatMessageReq { role: "user".into(), content: user_content(req) });
  ChatCompletionRequest {
    model: model.to_string(),
    messages,
    temperature: req.temperature,
    response_format: req.json.then(|| ResponseFormat { r#type: "json_object".into() }),
    max_tokens: None,
  }
}

#[async_trait]
impl LanguageModel for OpenAI {
  #[instrument(level = "info", skip(self, req), fields(step = %req.step, model = %self.model_for(req.tier), images = req.images.len()))]
  async fn complete(&self, req: ChatRequest) -> AppResult<String> {
    let body = build_chat_request(self.model_for(req.tier), &req);
    let start = Instant::now();
    let result = self.post::<ChatCompletionResponse, _>("chat/completions", &body).await;
    let elapsed = start.elapsed();

    let body = match result {
      Ok(b) => b,
      Err(e) => {
        error!(?elapsed, error = %e, "Model call failed");
        return Err(e);
      }
    };
    if let Some(usage) = &body.usage {
      info!(?elapsed, prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
    }
    let text = body.choices.first()
      .and_then(|c| c.message.content.clone())
      .unwrap_or_default().trim().to_string();
    if text.is_empty() {
      return Err(AppError::Llm(format!("{}: empty completion", req.step)));
    }
    Ok(text)
  }

  #[instrument(level = "info", skip(self, inputs), fields(model = %self.embedding_model, n = inputs.len()))]
  async fn embed(&self, inputs: &[String]) -> AppResult<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(inputs.len());
    for chunk in inputs.chunks(EMBED_BATCH) {
      let req = EmbeddingRequest { model: self.embedding_model.clone(), input: chunk.to_vec() };
      let mut res: EmbeddingResponse = self.post("embeddings", &req).await?;
      if res.data.len() != chunk.len() {
        return Err(AppError::Llm(format!("embeddings: expected {} vectors, got {}", chunk.len(), res.data.len())));
      }
      res.data.sort_by_key(|d| d.index);
      out.extend(res.data.into_iter().map(|d| d.embedding));
    }
    Ok(out)
  }
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
  #[serde(skip_serializing_if = "Option::is_none")]
  max_tokens: Option<u32>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: Value }
#[derive(Serialize)]
struct ResponseFormat { #[serde(rename = "type")] r#type: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

// --- Embedding DTOs ---

#[derive(Serialize)]
struct EmbeddingRequest { model: String, input: Vec<String> }
#[derive(Deserialize)]
struct EmbeddingResponse { data: Vec<EmbeddingData> }
#[derive(Deserialize)]
struct EmbeddingData {
  #[serde(default)] index: usize,
  embedding: Vec<f32>,
}

/// Try to extract a clean error message from OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  match serde_json::from_str::<EWrap>(body) {
    Ok(w) => Some(w.error.message),
    Err(_) => None,
  }
}
