//! Application state: database, example bank, optional language model, and the services built on them.
//!
//! This module owns:
//!   - the SQLite database handle
//!   - the example bank and its background embedding index
//!   - the generation pipeline (only when OPENAI_API_KEY is set)
//!   - tag rewriting rules and the generator runner used for quizzes

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::config::{resolve_config, GestaltConfig, Settings};
use crate::domain::QuestionPackage;
use crate::error::{AppError, AppResult};
use crate::html::{default_rules, TagReplacer};
use crate::llm::LanguageModel;
use crate::openai::OpenAI;
use crate::pipeline::QuestionPipeline;
use crate::retrieval::ExampleStore;
use crate::runner::CodeRunner;
use crate::store::{Database, FolderSpec, Package};

/// A configured language model together with the embedding model name used for cache keys.
pub struct ModelHandle {
    pub llm: Arc<dyn LanguageModel>,
    pub embedding_model: String,
}

pub struct AppState {
    pub db: Arc<Database>,
    pub settings: Settings,
    pub examples: Arc<ExampleStore>,
    pub model: Option<ModelHandle>,
    pub pipeline: Option<QuestionPipeline>,
    pub replacer: TagReplacer,
    pub runner: CodeRunner,
}

impl AppState {
    /// Build state from env: load config, open the database, load examples, init OpenAI.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> AppResult<Self> {
        let cfg = resolve_config();
        let db = Database::open(&cfg.settings.database_path)?;

        let model = OpenAI::from_env().map(|oa| {
            info!(target: "gestalt_backend", base_url = %oa.base_url, fast_model = %oa.fast_model, strong_model = %oa.strong_model, vision_model = %oa.vision_model, "OpenAI enabled.");
            let embedding_model = oa.embedding_model.clone();
            ModelHandle { llm: Arc::new(oa) as Arc<dyn LanguageModel>, embedding_model }
        });
        if model.is_none() {
            warn!(target: "gestalt_backend", "OpenAI disabled (no OPENAI_API_KEY). Generation routes will answer 503.");
        }

        let examples = ExampleStore::load(&cfg.settings.examples_path);
        Ok(Self::from_parts(cfg, db, examples, model))
    }

    /// Assemble state from already-built parts.
    pub fn from_parts(cfg: GestaltConfig, db: Database, examples: ExampleStore, model: Option<ModelHandle>) -> Self {
        let examples = Arc::new(examples);
        let pipeline = model
            .as_ref()
            .map(|m| QuestionPipeline::new(m.llm.clone(), examples.clone(), cfg.prompts.clone(), &cfg.settings));
        let replacer = TagReplacer::new(cfg.tag_rules.unwrap_or_else(default_rules));
        info!(target: "gestalt_backend", tag_rules = replacer.rules().len(), examples = examples.len(), "State assembled");

        Self {
            db: Arc::new(db),
            runner: CodeRunner::new(&cfg.settings),
            settings: cfg.settings,
            examples,
            model,
            pipeline,
            replacer,
        }
    }

    pub fn llm_enabled(&self) -> bool {
        self.model.is_some()
    }

    /// The generation pipeline, or 503 when no model is configured.
    pub fn pipeline(&self) -> AppResult<&QuestionPipeline> {
        self.pipeline
            .as_ref()
            .ok_or_else(|| AppError::Unavailable("Question generation is unavailable: OPENAI_API_KEY is not set".into()))
    }

    /// Embed the example bank in the background; search stays lexical until this finishes.
    pub fn spawn_example_indexing(self: &Arc<Self>) {
        let Some(model) = &self.model else { return };
        if self.examples.is_empty() {
            return;
        }
        let state = Arc::clone(self);
        let llm = model.llm.clone();
        let embedding_model = model.embedding_model.clone();
        tokio::spawn(async move {
            if let Err(e) = state.examples.build_index(llm.as_ref(), &state.db, &embedding_model).await {
                error!(target: "retrieval", error = %e, "Example indexing failed; falling back to lexical search");
            }
        });
    }

    /// Store generated packages as one module, one folder per question.
    #[instrument(level = "info", skip(self, packages), fields(count = packages.len()))]
    pub fn save_generated(&self, title: &str, packages: &[QuestionPackage]) -> AppResult<Package> {
        let folders: Vec<(FolderSpec, Vec<(String, String)>)> = packages
            .iter()
            .map(|pkg| {
                let mut spec = FolderSpec::from_generated(pkg);
                if spec.created_by.is_none() {
                    spec.created_by = Some(self.settings.default_created_by.clone());
                }
                (spec, pkg.files.non_empty_entries())
            })
            .collect();
        self.db.create_package_with_folders(title, &folders)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::{QuestionMetadata, QuestionPayload};
    use crate::llm::testing::ScriptedModel;

    pub(crate) fn state_without_llm() -> AppState {
        AppState::from_parts(
            GestaltConfig::default(),
            Database::open_in_memory().unwrap(),
            ExampleStore::new(vec![]),
            None,
        )
    }

    pub(crate) fn state_with(model: ScriptedModel) -> AppState {
        let handle = ModelHandle { llm: Arc::new(model), embedding_model: "test-embedding".into() };
        AppState::from_parts(
            GestaltConfig::default(),
            Database::open_in_memory().unwrap(),
            ExampleStore::new(vec![]),
            Some(handle),
        )
    }

    #[test]
    fn pipeline_unavailable_without_model() {
        let state = state_without_llm();
        assert!(!state.llm_enabled());
        assert!(matches!(state.pipeline(), Err(AppError::Unavailable(_))));
    }

    #[test]
    fn pipeline_available_with_model() {
        let state = state_with(ScriptedModel::new());
        assert!(state.llm_enabled());
        assert!(state.pipeline().is_ok());
    }

    #[test]
    fn save_generated_creates_one_folder_per_package() {
        let state = state_without_llm();
        let mut pkg = QuestionPackage::new(QuestionPayload { question: "q".into(), ..Default::default() }, None);
        pkg.question_metadata = Some(QuestionMetadata { title: "Pulley".into(), ..Default::default() });
        pkg.files.question_html = "<p>q</p>".into();

        let module = state.save_generated("Mechanics", &[pkg.clone(), pkg]).unwrap();
        let folders = state.db.package_folders(module.id).unwrap();
        assert_eq!(folders.len(), 2);
        assert_eq!(folders[0].title, "Pulley");
        assert_eq!(folders[0].created_by.as_deref(), Some("gestalt"));
        assert_eq!(state.db.files_of(folders[0].id).unwrap().len(), 1);
    }
}
