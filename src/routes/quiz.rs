use std::sync::Arc;

use axum::{
  extract::{Path, Query, State},
  response::Html,
};
use tracing::instrument;

use crate::error::AppResult;
use crate::protocol::QuizQuery;
use crate::quiz::render_quiz;
use crate::state::AppState;

#[instrument(level = "info", skip(state))]
pub async fn http_render_quiz(
  State(state): State<Arc<AppState>>,
  Path(package_id): Path<i64>,
  Query(q): Query<QuizQuery>,
) -> AppResult<Html<String>> {
  let html = render_quiz(&state.db, &state.runner, &state.replacer, package_id, q.folder_id).await?;
  Ok(Html(html))
}

#[cfg(test)]
mod tests {
  use axum::http::{header, StatusCode};

  use crate::routes::build_router;
  use crate::routes::test_support::*;
  use crate::state::tests::state_without_llm;
  use crate::store::FolderSpec;

  use super::*;

  #[tokio::test]
  async fn renders_selected_folder_as_html() {
    let state = Arc::new(state_without_llm());
    let pkg = state
      .db
      .create_package_with_folders(
        "Waves",
        &[
          (FolderSpec { title: "a".into(), ..Default::default() }, vec![("question_html".into(), "<p>first</p>".into())]),
          (
            FolderSpec { title: "b".into(), ..Default::default() },
            vec![("question_html".into(), "<pl-hint level=\"1\">second</pl-hint>".into())],
          ),
        ],
      )
      .unwrap();
    let second = state.db.package_folders(pkg.id).unwrap()[1].id;
    let app = build_router(state);

    let res = send(app.clone(), post_json(&format!("/api/v1/quiz/{}?folder_id={second}", pkg.id), serde_json::json!({}))).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers()[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/html"));
    let body = String::from_utf8(body_bytes(res).await).unwrap();
    assert_eq!(body, r#"<div class="alert alert-warning p-3" data-level="1">second</div>"#);

    let res = send(app, post_json(&format!("/api/v1/quiz/{}", pkg.id), serde_json::json!({}))).await;
    assert_eq!(String::from_utf8(body_bytes(res).await).unwrap(), "<p>first</p>");
  }

  #[tokio::test]
  async fn unknown_package_is_404() {
    let app = build_router(Arc::new(state_without_llm()));
    let res = send(app, post_json("/api/v1/quiz/5", serde_json::json!({}))).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
  }
}
