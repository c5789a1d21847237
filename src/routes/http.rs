//! HTTP endpoint handlers for packages, folders, files and downloads.
//! Each handler is instrumented and logs its parameters and basic result info.

use std::sync::Arc;

use axum::{
  extract::{Path, Query, State},
  http::header,
  response::{IntoResponse, Response},
  Json,
};
use tracing::{info, instrument};

use crate::archive::{folder_zip, package_zip};
use crate::error::AppResult;
use crate::protocol::*;
use crate::state::AppState;
use crate::store::{Package, QuestionFile, QuestionFolder};
use crate::util::safe_file_stem;

fn zip_response(bytes: Vec<u8>, filename: &str) -> Response {
  (
    [
      (header::CONTENT_TYPE, "application/zip".to_string()),
      (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
    ],
    bytes,
  )
    .into_response()
}

#[instrument(level = "info", skip(state))]
pub async fn http_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(HealthOut { ok: true, llm: state.llm_enabled(), examples_indexed: state.examples.is_indexed().await })
}

#[instrument(level = "info", skip(state, body), fields(title = %body.title))]
pub async fn http_create_package(
  State(state): State<Arc<AppState>>,
  Json(body): Json<PackageIn>,
) -> AppResult<Json<Package>> {
  let pkg = state.db.create_package(&body.title)?;
  info!(target: "gestalt_backend", id = pkg.id, "Package created");
  Ok(Json(pkg))
}

#[instrument(level = "info", skip(state))]
pub async fn http_list_packages(
  State(state): State<Arc<AppState>>,
  Query(q): Query<Pagination>,
) -> AppResult<Json<Vec<Package>>> {
  Ok(Json(state.db.list_packages(q.skip, q.limit)?))
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_package(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> AppResult<Json<Package>> {
  Ok(Json(state.db.get_package(id)?))
}

#[instrument(level = "info", skip(state, body), fields(title = %body.folder.title, package_id = ?body.folder.package_id, files = body.files_content.len()))]
pub async fn http_create_folder(
  State(state): State<Arc<AppState>>,
  Json(body): Json<FolderCreateIn>,
) -> AppResult<Json<QuestionFolder>> {
  let folder = state.db.create_folder(&body.folder, &body.files())?;
  info!(target: "gestalt_backend", id = folder.id, "Folder created");
  Ok(Json(folder))
}

#[instrument(level = "info", skip(state))]
pub async fn http_package_folders(
  State(state): State<Arc<AppState>>,
  Path(id): Path<i64>,
) -> AppResult<Json<Vec<QuestionFolder>>> {
  Ok(Json(state.db.package_folders(id)?))
}

#[instrument(level = "info", skip(state))]
pub async fn http_list_folders(
  State(state): State<Arc<AppState>>,
  Query(q): Query<Pagination>,
) -> AppResult<Json<Vec<QuestionFolder>>> {
  Ok(Json(state.db.list_folders(q.skip, q.limit)?))
}

#[instrument(level = "info", skip(state))]
pub async fn http_folder_files(
  State(state): State<Arc<AppState>>,
  Path((id, folder_id)): Path<(i64, i64)>,
) -> AppResult<Json<Vec<QuestionFile>>> {
  Ok(Json(state.db.folder_files(id, folder_id)?))
}

#[instrument(level = "info", skip(state))]
pub async fn http_download_folder(
  State(state): State<Arc<AppState>>,
  Path((id, folder_id)): Path<(i64, i64)>,
) -> AppResult<Response> {
  state.db.get_package(id)?;
  let folder = state.db.folder_in_package(id, folder_id)?;
  let files = state.db.files_of(folder.id)?;
  let bytes = folder_zip(&files)?;
  info!(target: "gestalt_backend", folder_id, files = files.len(), bytes = bytes.len(), "Folder archive built");
  Ok(zip_response(bytes, &format!("{}.zip", safe_file_stem(&folder.title))))
}

#[instrument(level = "info", skip(state))]
pub async fn http_download_package(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> AppResult<Response> {
  let folders = state.db.package_folders(id)?;
  let mut contents = Vec::with_capacity(folders.len());
  for folder in folders {
    let files = state.db.files_of(folder.id)?;
    contents.push((folder, files));
  }
  let bytes = package_zip(&contents)?;
  info!(target: "gestalt_backend", id, folders = contents.len(), bytes = bytes.len(), "Package archive built");
  Ok(zip_response(bytes, &format!("module_{id}_folders.zip")))
}

#[instrument(level = "info", skip(state))]
pub async fn http_first_folder(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> AppResult<Json<QuestionFolder>> {
  Ok(Json(state.db.first_folder(id)?))
}

#[instrument(level = "info", skip(state))]
pub async fn http_first_folder_files(
  State(state): State<Arc<AppState>>,
  Path(id): Path<i64>,
) -> AppResult<Json<Vec<QuestionFile>>> {
  Ok(Json(state.db.first_folder_files(id)?))
}

#[instrument(level = "info", skip(state))]
pub async fn http_file_content(
  State(state): State<Arc<AppState>>,
  Path((id, file_id)): Path<(i64, i64)>,
) -> AppResult<Json<String>> {
  Ok(Json(state.db.file_content(id, file_id)?))
}

#[instrument(level = "info", skip(state, body), fields(html_len = body.html.len()))]
pub async fn http_convert_html(State(state): State<Arc<AppState>>, Json(body): Json<HtmlIn>) -> impl IntoResponse {
  Json(HtmlOut { html: state.replacer.rewrite(&body.html) })
}
