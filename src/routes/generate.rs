//! Generation endpoints: text questions and image uploads, stored or previewed.

use std::sync::Arc;

use axum::{
  extract::{Multipart, State},
  Json,
};
use tracing::{info, instrument};

use crate::domain::{InitialMetadata, QuestionPackage};
use crate::error::{AppError, AppResult};
use crate::images::{ImageExtraction, UploadedImage};
use crate::protocol::GenerateIn;
use crate::state::AppState;

#[instrument(level = "info", skip(state, body), fields(question_len = body.question.len(), folder = ?body.folder_name))]
pub async fn http_generate(
  State(state): State<Arc<AppState>>,
  Json(body): Json<GenerateIn>,
) -> AppResult<Json<QuestionPackage>> {
  let pkg = state.pipeline()?.run(body.payload(), body.initial_metadata.clone()).await?;
  let title = body.folder_name.as_deref().filter(|s| !s.trim().is_empty()).unwrap_or(pkg.title());
  let module = state.save_generated(title, std::slice::from_ref(&pkg))?;
  info!(target: "gestalt_backend", module_id = module.id, %title, "Generated question stored");
  Ok(Json(pkg))
}

#[instrument(level = "info", skip(state, body), fields(question_len = body.question.len()))]
pub async fn http_preview(
  State(state): State<Arc<AppState>>,
  Json(body): Json<GenerateIn>,
) -> AppResult<Json<QuestionPackage>> {
  let pkg = state.pipeline()?.run(body.payload(), body.initial_metadata.clone()).await?;
  Ok(Json(pkg))
}

/// Parts of an image upload form.
struct ImageForm {
  images: Vec<UploadedImage>,
  title: Option<String>,
  initial_metadata: Option<InitialMetadata>,
}

fn bad_multipart(e: impl std::fmt::Display) -> AppError {
  AppError::BadRequest(format!("invalid multipart body: {e}"))
}

async fn read_image_form(mut multipart: Multipart) -> AppResult<ImageForm> {
  let mut form = ImageForm { images: Vec::new(), title: None, initial_metadata: None };
  while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
    match field.name().unwrap_or_default() {
      "title" => form.title = Some(field.text().await.map_err(bad_multipart)?),
      "initial_metadata" => {
        let text = field.text().await.map_err(bad_multipart)?;
        let meta = serde_json::from_str(&text)
          .map_err(|e| AppError::BadRequest(format!("initial_metadata is not valid: {e}")))?;
        form.initial_metadata = Some(meta);
      }
      _ => {
        let file_name = field.file_name().unwrap_or("image").to_string();
        let mime = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(bad_multipart)?;
        if !bytes.is_empty() {
          form.images.push(UploadedImage { file_name, mime, bytes: bytes.to_vec() });
        }
      }
    }
  }
  Ok(form)
}

#[instrument(level = "info", skip_all)]
pub async fn http_generate_images(
  State(state): State<Arc<AppState>>,
  multipart: Multipart,
) -> AppResult<Json<ImageExtraction>> {
  let pipeline = state.pipeline()?;
  let form = read_image_form(multipart).await?;
  let initial = form
    .initial_metadata
    .unwrap_or_else(|| InitialMetadata::for_creator(&state.settings.default_created_by));
  let out = pipeline.run_images(form.images, Some(initial)).await?;

  let title = form.title.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| "Module".into());
  let module = state.save_generated(&title, &out.question_packages)?;
  info!(target: "gestalt_backend", module_id = module.id, %title, questions = out.question_packages.len(), "Image module stored");
  Ok(Json(out))
}

#[instrument(level = "info", skip_all)]
pub async fn http_preview_images(
  State(state): State<Arc<AppState>>,
  multipart: Multipart,
) -> AppResult<Json<ImageExtraction>> {
  let pipeline = state.pipeline()?;
  let form = read_image_form(multipart).await?;
  Ok(Json(pipeline.run_images(form.images, form.initial_metadata).await?))
}

#[cfg(test)]
mod tests {
  use axum::body::Body;
  use axum::http::{Request, StatusCode};
  use serde_json::json;

  use crate::llm::Step;
  use crate::pipeline::tests::scripted;
  use crate::routes::build_router;
  use crate::routes::test_support::*;
  use crate::state::tests::{state_with, state_without_llm};

  use super::*;

  const BOUNDARY: &str = "gestalt-test-boundary";

  fn multipart_request(uri: &str, parts: &[(&str, Option<&str>, &str)]) -> Request<Body> {
    let mut body = String::new();
    for (name, file_name, content) in parts {
      body.push_str(&format!("--{BOUNDARY}\r\n"));
      match file_name {
        Some(f) => body.push_str(&format!(
          "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\nContent-Type: image/png\r\n\r\n"
        )),
        None => body.push_str(&format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n")),
      }
      body.push_str(content);
      body.push_str("\r\n");
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));
    Request::builder()
      .method("POST")
      .uri(uri)
      .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
      .body(Body::from(body))
      .unwrap()
  }

  #[tokio::test]
  async fn generation_without_model_is_503() {
    let app = build_router(Arc::new(state_without_llm()));
    let res = send(app, post_json("/api/v1/generate", json!({ "question": "q" }))).await;
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
  }

  #[tokio::test]
  async fn generate_stores_module_named_after_folder() {
    let state = Arc::new(state_with(scripted(true)));
    let app = build_router(state.clone());
    let body = json!({ "question": "A ball falls 20 m.", "folder_name": "Week 3" });
    let (status, pkg) = json_of(send(app, post_json("/api/v1/generate", body)).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pkg["question_metadata"]["title"], "Ball from a roof");

    let modules = state.db.list_packages(0, 10).unwrap();
    assert_eq!(modules[0].title, "Week 3");
    let files = state.db.first_folder_files(modules[0].id).unwrap();
    let names: Vec<&str> = files.iter().map(|f| f.save_name.as_str()).collect();
    assert_eq!(names, vec!["question.html", "server.js", "server.py", "solution.html", "info.json"]);
  }

  #[tokio::test]
  async fn preview_does_not_store() {
    let state = Arc::new(state_with(scripted(false)));
    let app = build_router(state.clone());
    let (status, pkg) =
      json_of(send(app, post_json("/api/v1/generate/preview", json!({ "question": "Define work." }))).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pkg["files"]["server_js"], "");
    assert!(state.db.list_packages(0, 10).unwrap().is_empty());
  }

  #[tokio::test]
  async fn image_upload_stores_titled_module() {
    let model = scripted(false)
      .reply(Step::ExtractQuestions, json!({ "questions_payload": [{ "question": "Define torque." }] }).to_string());
    let state = Arc::new(state_with(model));
    let app = build_router(state.clone());
    let req = multipart_request(
      "/api/v1/generate/images",
      &[("files", Some("page.png"), "PNGDATA"), ("title", None, "Rotation")],
    );
    let (status, out) = json_of(send(app, req).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["num_extracted"], 1);
    assert_eq!(out["image_names"], json!(["page.png"]));

    let modules = state.db.list_packages(0, 10).unwrap();
    assert_eq!(modules[0].title, "Rotation");
    assert_eq!(state.db.package_folders(modules[0].id).unwrap()[0].created_by.as_deref(), Some("gestalt"));
  }

  #[tokio::test]
  async fn image_upload_without_files_is_400() {
    let state = Arc::new(state_with(scripted(false)));
    let req = multipart_request("/api/v1/generate/images/preview", &[("title", None, "x")]);
    let res = send(build_router(state), req).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
  }
}
