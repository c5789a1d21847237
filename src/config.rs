//! Loading service configuration (settings, prompts, tag rules) from TOML.
//!
//! Every section is optional; missing sections fall back to the built-in defaults below.
//! `DATABASE_PATH` overrides `settings.database_path` after loading.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::{error, info};

use crate::html::TagRule;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct GestaltConfig {
  #[serde(default)]
  pub settings: Settings,
  #[serde(default)]
  pub prompts: Prompts,
  /// Replaces the built-in PrairieLearn tag rules entirely when present.
  #[serde(default)]
  pub tag_rules: Option<Vec<TagRule>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub database_path: PathBuf,
  pub examples_path: PathBuf,
  pub node_bin: String,
  pub python_bin: String,
  pub runner_timeout_secs: u64,
  pub graph_max_attempts: u32,
  pub extraction_max_attempts: u32,
  /// Empty means any origin.
  pub cors_origins: Vec<String>,
  pub default_created_by: String,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      database_path: PathBuf::from("gestalt.db"),
      examples_path: PathBuf::from("data/question_examples.json"),
      node_bin: "node".into(),
      python_bin: "python3".into(),
      runner_timeout_secs: 20,
      graph_max_attempts: 1,
      extraction_max_attempts: 3,
      cors_origins: Vec::new(),
      default_created_by: "gestalt".into(),
    }
  }
}

/// Prompts for each generation step. Code-producing steps share `code_system`
/// and are answered as `{"code": "..."}`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  pub metadata_system: String,
  pub metadata_user_template: String,
  pub code_system: String,
  pub question_html_template: String,
  pub server_js_template: String,
  pub server_py_template: String,
  pub solution_html_template: String,
  pub adaptive_combine_template: String,
  pub extract_questions_prompt: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      metadata_system: "You analyze physics and engineering questions and describe them for a question bank. Respond ONLY with strict JSON.".into(),
      metadata_user_template: "Question: {question}\n\nReturn JSON with fields: title (short, descriptive), question (the full standalone question), stem (the question without numeric values), topic (one topic), tags (array of strings), prereqs (array of prerequisite concepts), isAdaptive (\"True\" if the question has numeric values that can be randomized, otherwise \"False\").".into(),
      code_system: "You write source files for PrairieLearn-style questions. Respond ONLY with strict JSON of the form {\"code\": string}. The code field holds the complete file contents and nothing else.".into(),
      question_html_template: "Convert the input question into a question.html file. Use pl-question-panel for the statement, pl-number-input (numeric) or pl-multiple-choice/pl-checkbox (conceptual) for answers, and reference randomized values as {{params.name}} when the question is adaptive. Follow the style of the examples.".into(),
      server_js_template: "Write a server.js file for the input question.html. It must export a generate() function returning {params, correct_answers, nDigits, sigfigs}; every {{params.name}} used in the HTML must be produced by params. Use module.exports = { generate }. Follow the style of the example.".into(),
      server_py_template: "Write a server.py file for the input question.html. It must define generate() returning a dict with params, correct_answers, nDigits and sigfigs; every {{params.name}} used in the HTML must be produced by params. Follow the style of the example.".into(),
      solution_html_template: "Write a solution.html file for the input question.html: a pl-solution-panel with a step-by-step worked solution that references the same {{params.name}} values. Follow the style of the examples.".into(),
      adaptive_combine_template: "You are tasked with analyzing the following solution guide and its corresponding {codelang} code file. The values exported in the params data structure of the code are injected into the solution guide, so variable names, units, value formatting and logical flow must agree between both. Fix any discrepancy or missing element that would break the integration.\n\n---\nSolution HTML:\n{solution_html}\n\n---\nCode:\n{code}\n\n---\nReturn the improved solution HTML.".into(),
      extract_questions_prompt: "Extract every complete question shown in the images. For each question return question (standalone text including all given values), solution_guide (worked steps if shown, else null) and additional_instructions (null unless the image states constraints). Respond ONLY with JSON {\"questions_payload\": [...], \"num_extracted\": number}.".into(),
    }
  }
}

/// Attempt to load `GestaltConfig` from GESTALT_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_config_from_env() -> Option<GestaltConfig> {
  let path = std::env::var("GESTALT_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match toml::from_str::<GestaltConfig>(&s) {
      Ok(cfg) => {
        info!(target: "gestalt_backend", %path, "Loaded config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "gestalt_backend", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "gestalt_backend", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

/// Config file (or defaults) with environment overrides applied.
pub fn resolve_config() -> GestaltConfig {
  let mut cfg = load_config_from_env().unwrap_or_default();
  if let Ok(p) = std::env::var("DATABASE_PATH") {
    cfg.settings.database_path = PathBuf::from(p);
  }
  cfg
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_toml_keeps_defaults() {
    let cfg: GestaltConfig = toml::from_str(
      r#"
      [settings]
      graph_max_attempts = 3

      [prompts]
      code_system = "custom"
      "#,
    ).unwrap();
    assert_eq!(cfg.settings.graph_max_attempts, 3);
    assert_eq!(cfg.settings.runner_timeout_secs, 20);
    assert_eq!(cfg.prompts.code_system, "custom");
    assert!(cfg.prompts.metadata_user_template.contains("{question}"));
    assert!(cfg.tag_rules.is_none());
  }

  #[test]
  fn tag_rules_parse_in_order() {
    let cfg: GestaltConfig = toml::from_str(
      r#"
      [[tag_rules]]
      target_tag = "pl-figure"
      replacement_tag = "img"
      attributes = [{ name = "class", value = "fig" }]
      mapping = [{ from = "file-name", to = "src" }]
      "#,
    ).unwrap();
    let rules = cfg.tag_rules.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].mapping[0].to, "src");
    assert_eq!(rules[0].attributes[0].value, "fig");
  }
}
