//! Domain models: question payloads, generated metadata, generated files and the package
//! that flows through the generation graph.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Accepts `true`/`false` as well as the `"True"`/`"False"` strings models tend to emit.
pub fn de_flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Raw {
    Bool(bool),
    Text(String),
    Int(i64),
  }
  match Raw::deserialize(deserializer)? {
    Raw::Bool(b) => Ok(b),
    Raw::Int(i) => Ok(i != 0),
    Raw::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
      "true" | "yes" | "1" => Ok(true),
      "false" | "no" | "0" | "" => Ok(false),
      other => Err(serde::de::Error::custom(format!("expected a boolean, got '{other}'"))),
    },
  }
}

/// Question submitted by a user (or extracted from an image).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct QuestionPayload {
  pub question: String,
  #[serde(default)]
  pub solution_guide: Option<String>,
  #[serde(default)]
  pub additional_instructions: Option<String>,
}

/// Metadata the model derives from the question text.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct QuestionMetadata {
  pub title: String,
  #[serde(default)]
  pub question: String,
  #[serde(default)]
  pub stem: String,
  #[serde(default)]
  pub topic: String,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub prereqs: Vec<String>,
  #[serde(rename = "isAdaptive", deserialize_with = "de_flexible_bool", default)]
  pub is_adaptive: bool,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CodeLanguage {
  #[default]
  Javascript,
  Python,
}

/// Case-insensitive: `"JavaScript"`, `"PYTHON"`, `"js"` and `"py"` all decode.
impl<'de> Deserialize<'de> for CodeLanguage {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_ascii_lowercase().as_str() {
      "javascript" | "js" => Ok(CodeLanguage::Javascript),
      "python" | "py" => Ok(CodeLanguage::Python),
      other => Err(serde::de::Error::custom(format!("unknown code language '{other}'"))),
    }
  }
}

impl CodeLanguage {
  pub fn name(self) -> &'static str {
    match self {
      CodeLanguage::Javascript => "javascript",
      CodeLanguage::Python => "python",
    }
  }
}

/// Bookkeeping metadata supplied by the caller rather than the model.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InitialMetadata {
  #[serde(rename = "createdBy", default)]
  pub created_by: String,
  #[serde(default = "default_qtype")]
  pub qtype: String,
  #[serde(rename = "nSteps", default = "default_n_steps")]
  pub n_steps: u32,
  #[serde(rename = "updatedBy", default)]
  pub updated_by: String,
  #[serde(default)]
  pub codelang: CodeLanguage,
  #[serde(deserialize_with = "de_flexible_bool", default)]
  pub reviewed: bool,
  #[serde(deserialize_with = "de_flexible_bool", default = "default_true")]
  pub ai_generated: bool,
}

fn default_qtype() -> String { "num".into() }
fn default_n_steps() -> u32 { 1 }
fn default_true() -> bool { true }

impl InitialMetadata {
  pub fn for_creator(created_by: &str) -> Self {
    Self {
      created_by: created_by.to_string(),
      qtype: default_qtype(),
      n_steps: default_n_steps(),
      updated_by: String::new(),
      codelang: CodeLanguage::Javascript,
      reviewed: false,
      ai_generated: true,
    }
  }
}

/// Generated file contents of one question.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FilesData {
  #[serde(default)]
  pub question_html: String,
  #[serde(default)]
  pub server_js: String,
  #[serde(default)]
  pub server_py: String,
  #[serde(default)]
  pub solution_html: String,
  #[serde(default)]
  pub metadata: Map<String, Value>,
}

impl FilesData {
  /// Non-empty fields of `newer` win over the fields of `self`.
  pub fn merge(self, newer: FilesData) -> FilesData {
    fn pick(old: String, new: String) -> String {
      if new.is_empty() { old } else { new }
    }
    FilesData {
      question_html: pick(self.question_html, newer.question_html),
      server_js: pick(self.server_js, newer.server_js),
      server_py: pick(self.server_py, newer.server_py),
      solution_html: pick(self.solution_html, newer.solution_html),
      metadata: if newer.metadata.is_empty() { self.metadata } else { newer.metadata },
    }
  }

  /// Logical file name -> content pairs, skipping files that were never generated.
  pub fn non_empty_entries(&self) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, content) in [
      ("question_html", &self.question_html),
      ("server_js", &self.server_js),
      ("server_py", &self.server_py),
      ("solution_html", &self.solution_html),
    ] {
      if !content.trim().is_empty() {
        out.push((name.to_string(), content.clone()));
      }
    }
    if !self.metadata.is_empty() {
      out.push(("metadata".to_string(), Value::Object(self.metadata.clone()).to_string()));
    }
    out
  }
}

/// State carried through the generation graph.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct QuestionPackage {
  pub question_payload: QuestionPayload,
  #[serde(default)]
  pub question_metadata: Option<QuestionMetadata>,
  #[serde(default)]
  pub files: FilesData,
  #[serde(default)]
  pub initial_metadata: Option<InitialMetadata>,
}

impl QuestionPackage {
  pub fn new(question_payload: QuestionPayload, initial_metadata: Option<InitialMetadata>) -> Self {
    Self { question_payload, question_metadata: None, files: FilesData::default(), initial_metadata }
  }

  pub fn is_adaptive(&self) -> bool {
    self.question_metadata.as_ref().map(|m| m.is_adaptive).unwrap_or(false)
  }

  pub fn codelang(&self) -> CodeLanguage {
    self.initial_metadata.as_ref().map(|m| m.codelang).unwrap_or_default()
  }

  pub fn title(&self) -> &str {
    self.question_metadata.as_ref().map(|m| m.title.as_str()).unwrap_or("Untitled")
  }
}

/// Archive file name for a stored logical file name.
pub fn archive_name(logical: &str) -> &str {
  match logical {
    "question_txt" => "question.txt",
    "question_html" => "question.html",
    "server_js" => "server.js",
    "server_py" => "server.py",
    "solution_html" => "solution.html",
    "metadata" => "info.json",
    other => other,
  }
}
