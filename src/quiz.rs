//! Live quiz rendering of a stored adaptive question.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::domain::archive_name;
use crate::error::{AppError, AppResult};
use crate::html::TagReplacer;
use crate::runner::{CodeRunner, GeneratorOutput, Runtime};
use crate::store::{Database, QuestionFile};

fn placeholder_re() -> Option<&'static Regex> {
  static RE: OnceLock<Option<Regex>> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"\{\{\{?\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}?\}\}").ok())
    .as_ref()
}

fn lookup<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
  path.split('.').try_fold(ctx, |cur, seg| match cur {
    Value::Object(m) => m.get(seg),
    Value::Array(a) => seg.parse::<usize>().ok().and_then(|i| a.get(i)),
    _ => None,
  })
}

fn display(v: &Value) -> String {
  match v {
    Value::String(s) => s.clone(),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}

/// Substitute `{{ params.x }}` and `{{ correct_answers.y }}` style placeholders.
/// Triple braces are accepted; unknown names render as empty text.
pub fn render_template(html: &str, data: &GeneratorOutput) -> String {
  let Some(re) = placeholder_re() else { return html.to_string() };
  let ctx = json!({ "params": data.params, "correct_answers": data.correct_answers });
  re.replace_all(html, |caps: &Captures<'_>| lookup(&ctx, &caps[1]).map(display).unwrap_or_default())
    .into_owned()
}

fn find<'a>(files: &'a [QuestionFile], name: &str) -> Option<&'a QuestionFile> {
  files.iter().find(|f| f.name == name)
}

/// Generator to run for a folder: `server_js` when present, else `server_py`.
fn pick_generator(files: &[QuestionFile]) -> AppResult<Option<(Runtime, &str)>> {
  for name in ["server_js", "server_py"] {
    if let Some(f) = find(files, name).filter(|f| !f.content.trim().is_empty()) {
      return Ok(Some((Runtime::for_file(archive_name(&f.name))?, f.content.as_str())));
    }
  }
  Ok(None)
}

/// Render the question of a stored folder with freshly generated parameters.
#[instrument(level = "info", skip(db, runner, replacer))]
pub async fn render_quiz(
  db: &Database,
  runner: &CodeRunner,
  replacer: &TagReplacer,
  package_id: i64,
  folder_id: Option<i64>,
) -> AppResult<String> {
  db.get_package(package_id)?;
  let folder = match folder_id {
    Some(id) => db.folder_in_package(package_id, id)?,
    None => db.first_folder(package_id)?,
  };
  let files = db.files_of(folder.id)?;
  let html = find(&files, "question_html")
    .map(|f| f.content.clone())
    .ok_or_else(|| AppError::not_found("question.html not found in this folder"))?;

  let data = match pick_generator(&files)? {
    Some((runtime, code)) => runner.run(runtime, code).await?,
    None => GeneratorOutput::default(),
  };
  let rendered = render_template(&replacer.rewrite(&html), &data);
  info!(target: "gestalt_backend", folder_id = folder.id, params = data.params.len(), "Rendered quiz");
  Ok(rendered)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Settings;
  use crate::store::FolderSpec;
  use serde_json::Map;

  fn output(params: Value, answers: Value) -> GeneratorOutput {
    let as_map = |v: Value| match v {
      Value::Object(m) => m,
      _ => Map::new(),
    };
    GeneratorOutput { params: as_map(params), correct_answers: as_map(answers), extra: Map::new() }
  }

  #[test]
  fn substitutes_nested_params_and_answers() {
    let data = output(json!({ "v": 12, "unit": { "speed": "m/s" } }), json!({ "t": "1.22" }));
    let html = "<p>{{ params.v }} {{params.unit.speed}}; t = {{{ correct_answers.t }}}</p>";
    assert_eq!(render_template(html, &data), "<p>12 m/s; t = 1.22</p>");
  }

  #[test]
  fn missing_names_render_empty() {
    let data = output(json!({}), json!({}));
    assert_eq!(render_template("[{{ params.nope }}]", &data), "[]");
  }

  #[test]
  fn non_placeholder_braces_are_left_alone() {
    let data = output(json!({ "a": [1, 2] }), json!({}));
    assert_eq!(render_template("{ x } {{ params.a }} {{ params.a.1 }}", &data), "{ x } [1,2] 2");
  }

  #[test]
  fn generator_prefers_javascript() {
    let file = |name: &str, content: &str| QuestionFile {
      id: 0,
      name: name.into(),
      content: content.into(),
      save_name: String::new(),
      question_folder_id: 0,
    };
    let files = vec![file("server_py", "def generate(): pass"), file("server_js", "  ")];
    assert_eq!(pick_generator(&files).unwrap().map(|(r, _)| r), Some(Runtime::Python));
    let files = vec![file("server_py", "x"), file("server_js", "y")];
    assert_eq!(pick_generator(&files).unwrap().map(|(r, _)| r), Some(Runtime::Node));
    assert!(pick_generator(&[]).unwrap().is_none());
  }

  #[tokio::test]
  async fn static_question_renders_without_generator() {
    let db = Database::open_in_memory().unwrap();
    let pkg = db
      .create_package_with_folders(
        "Statics",
        &[(
          FolderSpec { title: "Beam".into(), ..Default::default() },
          vec![("question_html".into(), "<pl-question-panel>Load {{ params.F }}</pl-question-panel>".into())],
        )],
      )
      .unwrap();
    let html = render_quiz(&db, &CodeRunner::new(&Settings::default()), &TagReplacer::default(), pkg.id, None)
      .await
      .unwrap();
    assert_eq!(html, r#"<div class="card mb-4 p-3 bg-light">Load </div>"#);
  }

  #[tokio::test]
  async fn folder_without_html_is_not_found() {
    let db = Database::open_in_memory().unwrap();
    let pkg = db
      .create_package_with_folders("p", &[(FolderSpec { title: "f".into(), ..Default::default() }, vec![])])
      .unwrap();
    let err = render_quiz(&db, &CodeRunner::new(&Settings::default()), &TagReplacer::default(), pkg.id, None)
      .await
      .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
  }
}
