//! Public request/response structs for the HTTP API (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{InitialMetadata, QuestionPayload};
use crate::store::FolderSpec;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthOut {
    pub ok: bool,
    pub llm: bool,
    /// Whether example retrieval has switched from lexical to embedding search.
    pub examples_indexed: bool,
}

/// Text generation request.
#[derive(Debug, Deserialize)]
pub struct GenerateIn {
    pub question: String,
    #[serde(default)]
    pub folder_name: Option<String>,
    #[serde(default)]
    pub solution_guide: Option<String>,
    #[serde(default)]
    pub additional_instructions: Option<String>,
    #[serde(default)]
    pub initial_metadata: Option<InitialMetadata>,
}

impl GenerateIn {
    pub fn payload(&self) -> QuestionPayload {
        QuestionPayload {
            question: self.question.clone(),
            solution_guide: self.solution_guide.clone(),
            additional_instructions: self.additional_instructions.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PackageIn {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    10
}

#[derive(Debug, Deserialize)]
pub struct FolderCreateIn {
    pub folder: FolderSpec,
    /// Logical file name -> content. Non-string values are stored JSON-encoded.
    #[serde(default)]
    pub files_content: Map<String, Value>,
}

impl FolderCreateIn {
    pub fn files(&self) -> Vec<(String, String)> {
        self.files_content
            .iter()
            .map(|(name, value)| {
                let content = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.clone(), content)
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct QuizQuery {
    #[serde(default)]
    pub folder_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HtmlIn {
    pub html: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HtmlOut {
    pub html: String,
}
