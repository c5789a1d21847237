//! SQLite persistence for packages (modules), question folders and question files,
//! plus the embedding cache used by example retrieval.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::domain::{archive_name, QuestionPackage};
use crate::error::{AppError, AppResult};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Package {
  pub id: i64,
  pub title: String,
  pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QuestionFolder {
  pub id: i64,
  pub title: String,
  pub topic: Option<Vec<String>>,
  pub tags: Option<Vec<String>>,
  pub pre_reqs: Option<Vec<String>>,
  pub is_adaptive: Option<bool>,
  pub ai_generated: Option<bool>,
  pub created_by: Option<String>,
  pub reviewers: Option<Vec<String>>,
  pub reviewed: Option<bool>,
  pub package_id: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QuestionFile {
  pub id: i64,
  pub name: String,
  pub content: String,
  pub save_name: String,
  pub question_folder_id: i64,
}

/// Folder fields supplied on creation.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FolderSpec {
  pub title: String,
  pub topic: Option<Vec<String>>,
  pub tags: Option<Vec<String>>,
  pub pre_reqs: Option<Vec<String>>,
  pub is_adaptive: Option<bool>,
  pub ai_generated: Option<bool>,
  pub created_by: Option<String>,
  pub reviewers: Option<Vec<String>>,
  pub reviewed: Option<bool>,
  pub package_id: Option<i64>,
}

impl FolderSpec {
  /// Folder describing a generated question, titled after its metadata.
  pub fn from_generated(pkg: &QuestionPackage) -> Self {
    let meta = pkg.question_metadata.as_ref();
    let initial = pkg.initial_metadata.as_ref();
    Self {
      title: pkg.title().to_string(),
      topic: meta.filter(|m| !m.topic.is_empty()).map(|m| vec![m.topic.clone()]),
      tags: meta.map(|m| m.tags.clone()),
      pre_reqs: meta.map(|m| m.prereqs.clone()),
      is_adaptive: meta.map(|m| m.is_adaptive),
      ai_generated: Some(initial.map(|i| i.ai_generated).unwrap_or(true)),
      created_by: initial.map(|i| i.created_by.clone()).filter(|s| !s.is_empty()),
      reviewers: None,
      reviewed: Some(initial.map(|i| i.reviewed).unwrap_or(false)),
      package_id: None,
    }
  }
}

/// Cached embedding of one example-bank record.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedEmbedding {
  pub content_hash: String,
  pub vector: Vec<f32>,
}

fn to_json_list(v: &Option<Vec<String>>) -> Option<String> {
  v.as_ref().and_then(|l| serde_json::to_string(l).ok())
}

fn from_json_list(s: Option<String>) -> Option<Vec<String>> {
  s.and_then(|s| serde_json::from_str(&s).ok())
}

const FOLDER_COLUMNS: &str =
  "id, title, topic, tags, pre_reqs, is_adaptive, ai_generated, created_by, reviewers, reviewed, package_id";

fn folder_from_row(row: &Row<'_>) -> rusqlite::Result<QuestionFolder> {
  Ok(QuestionFolder {
    id: row.get(0)?,
    title: row.get(1)?,
    topic: from_json_list(row.get(2)?),
    tags: from_json_list(row.get(3)?),
    pre_reqs: from_json_list(row.get(4)?),
    is_adaptive: row.get(5)?,
    ai_generated: row.get(6)?,
    created_by: row.get(7)?,
    reviewers: from_json_list(row.get(8)?),
    reviewed: row.get(9)?,
    package_id: row.get(10)?,
  })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<QuestionFile> {
  Ok(QuestionFile {
    id: row.get(0)?,
    name: row.get(1)?,
    content: row.get(2)?,
    save_name: row.get(3)?,
    question_folder_id: row.get(4)?,
  })
}

fn package_from_row(row: &Row<'_>) -> rusqlite::Result<Package> {
  Ok(Package { id: row.get(0)?, title: row.get(1)?, created_at: row.get(2)? })
}

fn insert_package(conn: &Connection, title: &str) -> AppResult<Package> {
  let created_at = chrono::Utc::now().to_rfc3339();
  conn.execute("INSERT INTO packages (title, created_at) VALUES (?1, ?2)", params![title, created_at])?;
  Ok(Package { id: conn.last_insert_rowid(), title: title.to_string(), created_at })
}

fn insert_folder(
  conn: &Connection,
  package_id: i64,
  spec: &FolderSpec,
  files: &[(String, String)],
) -> AppResult<QuestionFolder> {
  conn.execute(
    "INSERT INTO question_folders
       (title, topic, tags, pre_reqs, is_adaptive, ai_generated, created_by, reviewers, reviewed, package_id)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    params![
      spec.title,
      to_json_list(&spec.topic),
      to_json_list(&spec.tags),
      to_json_list(&spec.pre_reqs),
      spec.is_adaptive,
      spec.ai_generated.or(Some(true)),
      spec.created_by,
      to_json_list(&spec.reviewers),
      spec.reviewed.or(Some(false)),
      package_id,
    ],
  )?;
  let folder_id = conn.last_insert_rowid();
  for (name, content) in files {
    conn.execute(
      "INSERT INTO question_files (name, content, save_name, question_folder_id) VALUES (?1, ?2, ?3, ?4)",
      params![name, content, archive_name(name), folder_id],
    )?;
  }
  debug!(target: "store", folder_id, package_id, files = files.len(), "Inserted question folder");
  conn
    .query_row(&format!("SELECT {FOLDER_COLUMNS} FROM question_folders WHERE id = ?1"), [folder_id], folder_from_row)
    .map_err(AppError::from)
}

/// Database manager. Operations are short, so a single mutex-guarded connection is enough.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database file.
  pub fn open(path: &Path) -> AppResult<Self> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }
    let conn = Connection::open(path)?;
    let db = Self::from_connection(conn)?;
    info!(target: "store", path = %path.display(), "Database ready");
    Ok(db)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> AppResult<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> AppResult<Self> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    let db = Self { conn: Mutex::new(conn) };
    db.init_tables()?;
    Ok(db)
  }

  fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|_| AppError::Io(std::io::Error::other("database lock poisoned")))
  }

  fn init_tables(&self) -> AppResult<()> {
    self.lock()?.execute_batch(
      r#"
      CREATE TABLE IF NOT EXISTS packages (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          title TEXT NOT NULL,
          created_at TEXT NOT NULL
      );

      CREATE TABLE IF NOT EXISTS question_folders (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          title TEXT NOT NULL,
          topic TEXT,
          tags TEXT,
          pre_reqs TEXT,
          is_adaptive INTEGER,
          ai_generated INTEGER,
          created_by TEXT,
          reviewers TEXT,
          reviewed INTEGER,
          package_id INTEGER NOT NULL REFERENCES packages(id) ON DELETE CASCADE
      );

      CREATE TABLE IF NOT EXISTS question_files (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL,
          content TEXT NOT NULL,
          save_name TEXT NOT NULL,
          question_folder_id INTEGER NOT NULL REFERENCES question_folders(id) ON DELETE CASCADE
      );

      CREATE TABLE IF NOT EXISTS example_embeddings (
          example_index INTEGER NOT NULL,
          model TEXT NOT NULL,
          content_hash TEXT NOT NULL,
          vector TEXT NOT NULL,
          PRIMARY KEY (example_index, model)
      );

      CREATE INDEX IF NOT EXISTS idx_folders_package ON question_folders(package_id);
      CREATE INDEX IF NOT EXISTS idx_files_folder ON question_files(question_folder_id);
      "#,
    )?;
    Ok(())
  }

  // --- packages ---

  #[instrument(level = "debug", skip(self))]
  pub fn create_package(&self, title: &str) -> AppResult<Package> {
    let conn = self.lock()?;
    insert_package(&conn, title)
  }

  pub fn get_package(&self, id: i64) -> AppResult<Package> {
    let conn = self.lock()?;
    conn
      .query_row("SELECT id, title, created_at FROM packages WHERE id = ?1", [id], package_from_row)
      .optional()?
      .ok_or_else(|| AppError::not_found("Package not found"))
  }

  pub fn list_packages(&self, skip: i64, limit: i64) -> AppResult<Vec<Package>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT id, title, created_at FROM packages ORDER BY id LIMIT ?2 OFFSET ?1")?;
    let rows = stmt.query_map(params![skip.max(0), limit.max(0)], package_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
  }

  /// Create a package and all of its folders in one transaction.
  #[instrument(level = "info", skip(self, folders), fields(folders = folders.len()))]
  pub fn create_package_with_folders(
    &self,
    title: &str,
    folders: &[(FolderSpec, Vec<(String, String)>)],
  ) -> AppResult<Package> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let package = insert_package(&tx, title)?;
    for (spec, files) in folders {
      insert_folder(&tx, package.id, spec, files)?;
    }
    tx.commit()?;
    info!(target: "store", package_id = package.id, %title, "Stored package");
    Ok(package)
  }

  // --- folders ---

  /// Create a folder (and its files) inside an existing package.
  #[instrument(level = "info", skip(self, spec, files), fields(title = %spec.title))]
  pub fn create_folder(&self, spec: &FolderSpec, files: &[(String, String)]) -> AppResult<QuestionFolder> {
    let package_id = spec
      .package_id
      .ok_or_else(|| AppError::BadRequest("folder.package_id is required".into()))?;
    self.get_package(package_id)?;
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let folder = insert_folder(&tx, package_id, spec, files)?;
    tx.commit()?;
    Ok(folder)
  }

  pub fn package_folders(&self, package_id: i64) -> AppResult<Vec<QuestionFolder>> {
    self.get_package(package_id)?;
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {FOLDER_COLUMNS} FROM question_folders WHERE package_id = ?1 ORDER BY id"
    ))?;
    let folders = stmt.query_map([package_id], folder_from_row)?.collect::<Result<Vec<_>, _>>()?;
    if folders.is_empty() {
      return Err(AppError::not_found("Question folders not found"));
    }
    Ok(folders)
  }

  pub fn list_folders(&self, skip: i64, limit: i64) -> AppResult<Vec<QuestionFolder>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {FOLDER_COLUMNS} FROM question_folders ORDER BY id LIMIT ?2 OFFSET ?1"
    ))?;
    let rows = stmt.query_map(params![skip.max(0), limit.max(0)], folder_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
  }

  pub fn folder_in_package(&self, package_id: i64, folder_id: i64) -> AppResult<QuestionFolder> {
    let conn = self.lock()?;
    conn
      .query_row(
        &format!("SELECT {FOLDER_COLUMNS} FROM question_folders WHERE id = ?1 AND package_id = ?2"),
        params![folder_id, package_id],
        folder_from_row,
      )
      .optional()?
      .ok_or_else(|| AppError::not_found("Question folder not found"))
  }

  pub fn first_folder(&self, package_id: i64) -> AppResult<QuestionFolder> {
    let conn = self.lock()?;
    conn
      .query_row(
        &format!("SELECT {FOLDER_COLUMNS} FROM question_folders WHERE package_id = ?1 ORDER BY id LIMIT 1"),
        [package_id],
        folder_from_row,
      )
      .optional()?
      .ok_or_else(|| AppError::not_found("Question folder not found"))
  }

  // --- files ---

  pub fn files_of(&self, folder_id: i64) -> AppResult<Vec<QuestionFile>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT id, name, content, save_name, question_folder_id FROM question_files
       WHERE question_folder_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([folder_id], file_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
  }

  pub fn folder_files(&self, package_id: i64, folder_id: i64) -> AppResult<Vec<QuestionFile>> {
    self.get_package(package_id)?;
    let folder = self.folder_in_package(package_id, folder_id)?;
    self.files_of(folder.id)
  }

  pub fn first_folder_files(&self, package_id: i64) -> AppResult<Vec<QuestionFile>> {
    let folder = self.first_folder(package_id)?;
    self.files_of(folder.id)
  }

  pub fn file_content(&self, package_id: i64, file_id: i64) -> AppResult<String> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT f.content FROM question_files f
         JOIN question_folders d ON f.question_folder_id = d.id
         WHERE f.id = ?1 AND d.package_id = ?2",
        params![file_id, package_id],
        |row| row.get::<_, String>(0),
      )
      .optional()?
      .ok_or_else(|| AppError::not_found("Question file not found in this package"))
  }

  // --- embedding cache ---

  pub fn load_embeddings(&self, model: &str) -> AppResult<HashMap<usize, CachedEmbedding>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT example_index, content_hash, vector FROM example_embeddings WHERE model = ?1")?;
    let rows = stmt.query_map([model], |row| {
      Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
    })?;
    let mut out = HashMap::new();
    for row in rows {
      let (idx, content_hash, vector) = row?;
      // Unreadable rows are simply recomputed.
      if let Ok(vector) = serde_json::from_str::<Vec<f32>>(&vector) {
        out.insert(idx as usize, CachedEmbedding { content_hash, vector });
      }
    }
    Ok(out)
  }

  pub fn save_embeddings(&self, model: &str, rows: &[(usize, CachedEmbedding)]) -> AppResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    for (idx, emb) in rows {
      tx.execute(
        "INSERT OR REPLACE INTO example_embeddings (example_index, model, content_hash, vector)
         VALUES (?1, ?2, ?3, ?4)",
        params![*idx as i64, model, emb.content_hash, serde_json::to_string(&emb.vector)?],
      )?;
    }
    tx.commit()?;
    debug!(target: "store", %model, rows = rows.len(), "Saved example embeddings");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{InitialMetadata, QuestionMetadata, QuestionPayload};

  fn files(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs.iter().map(|(n, c)| (n.to_string(), c.to_string())).collect()
  }

  fn seeded() -> (Database, Package) {
    let db = Database::open_in_memory().unwrap();
    let folders = vec![
      (FolderSpec { title: "Projectile".into(), ..Default::default() },
       files(&[("question_html", "<p>q1</p>"), ("metadata", "{}")])),
      (FolderSpec { title: "Incline".into(), ..Default::default() },
       files(&[("question_html", "<p>q2</p>")])),
    ];
    let pkg = db.create_package_with_folders("Kinematics", &folders).unwrap();
    (db, pkg)
  }

  #[test]
  fn packages_paginate_in_insert_order() {
    let db = Database::open_in_memory().unwrap();
    for t in ["a", "b", "c"] {
      db.create_package(t).unwrap();
    }
    let page: Vec<String> = db.list_packages(1, 1).unwrap().into_iter().map(|p| p.title).collect();
    assert_eq!(page, vec!["b"]);
    assert_eq!(db.list_packages(0, 10).unwrap().len(), 3);
  }

  #[test]
  fn missing_package_is_not_found() {
    let db = Database::open_in_memory().unwrap();
    let err = db.get_package(42).unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(err.to_string(), "Package not found");
  }

  #[test]
  fn package_with_folders_sets_save_names() {
    let (db, pkg) = seeded();
    let folders = db.package_folders(pkg.id).unwrap();
    assert_eq!(folders.len(), 2);
    assert_eq!(folders[0].title, "Projectile");
    assert_eq!(folders[0].ai_generated, Some(true));

    let files = db.folder_files(pkg.id, folders[0].id).unwrap();
    let names: Vec<&str> = files.iter().map(|f| f.save_name.as_str()).collect();
    assert_eq!(names, vec!["question.html", "info.json"]);
  }

  #[test]
  fn empty_package_has_no_folders() {
    let db = Database::open_in_memory().unwrap();
    let pkg = db.create_package("empty").unwrap();
    let err = db.package_folders(pkg.id).unwrap_err();
    assert_eq!(err.to_string(), "Question folders not found");
  }

  #[test]
  fn folder_must_belong_to_package() {
    let (db, pkg) = seeded();
    let other = db.create_package("other").unwrap();
    let folder = db.first_folder(pkg.id).unwrap();
    assert!(db.folder_files(other.id, folder.id).is_err());
    assert!(db.folder_files(pkg.id, folder.id).is_ok());
  }

  #[test]
  fn create_folder_requires_existing_package() {
    let db = Database::open_in_memory().unwrap();
    let spec = FolderSpec { title: "x".into(), package_id: Some(9), ..Default::default() };
    assert!(matches!(db.create_folder(&spec, &[]), Err(AppError::NotFound(_))));

    let spec = FolderSpec { title: "x".into(), package_id: None, ..Default::default() };
    assert!(matches!(db.create_folder(&spec, &[]), Err(AppError::BadRequest(_))));
  }

  #[test]
  fn create_folder_round_trips_lists() {
    let db = Database::open_in_memory().unwrap();
    let pkg = db.create_package("p").unwrap();
    let spec = FolderSpec {
      title: "Work".into(),
      tags: Some(vec!["energy".into(), "work".into()]),
      reviewers: Some(vec!["ta@example.edu".into()]),
      package_id: Some(pkg.id),
      ..Default::default()
    };
    let folder = db.create_folder(&spec, &files(&[("server_js", "module.exports = {}")])).unwrap();
    assert_eq!(folder.tags, Some(vec!["energy".to_string(), "work".to_string()]));
    assert_eq!(folder.reviewed, Some(false));
    assert_eq!(db.files_of(folder.id).unwrap()[0].save_name, "server.js");
  }

  #[test]
  fn file_content_is_scoped_to_package() {
    let (db, pkg) = seeded();
    let file = &db.first_folder_files(pkg.id).unwrap()[0];
    assert_eq!(db.file_content(pkg.id, file.id).unwrap(), "<p>q1</p>");
    let other = db.create_package("other").unwrap();
    let err = db.file_content(other.id, file.id).unwrap_err();
    assert_eq!(err.to_string(), "Question file not found in this package");
  }

  #[test]
  fn folders_list_across_packages() {
    let (db, _) = seeded();
    let all = db.list_folders(0, 10).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(db.list_folders(1, 10).unwrap()[0].title, "Incline");
  }

  #[test]
  fn folder_spec_from_generated_package() {
    let mut pkg = QuestionPackage::new(
      QuestionPayload { question: "q".into(), ..Default::default() },
      Some(InitialMetadata::for_creator("prof@example.edu")),
    );
    pkg.question_metadata = Some(QuestionMetadata {
      title: "Falling ball".into(),
      topic: "Kinematics".into(),
      tags: vec!["gravity".into()],
      is_adaptive: true,
      ..Default::default()
    });
    let spec = FolderSpec::from_generated(&pkg);
    assert_eq!(spec.title, "Falling ball");
    assert_eq!(spec.topic, Some(vec!["Kinematics".to_string()]));
    assert_eq!(spec.is_adaptive, Some(true));
    assert_eq!(spec.created_by.as_deref(), Some("prof@example.edu"));
  }

  #[test]
  fn embeddings_cache_overwrites_per_model() {
    let db = Database::open_in_memory().unwrap();
    let e = |h: &str, v: f32| CachedEmbedding { content_hash: h.into(), vector: vec![v, 0.5] };
    db.save_embeddings("m1", &[(0, e("a", 1.0)), (1, e("b", 2.0))]).unwrap();
    db.save_embeddings("m1", &[(1, e("c", 3.0))]).unwrap();
    db.save_embeddings("m2", &[(0, e("z", 9.0))]).unwrap();

    let m1 = db.load_embeddings("m1").unwrap();
    assert_eq!(m1.len(), 2);
    assert_eq!(m1[&1].content_hash, "c");
    assert_eq!(m1[&1].vector, vec![3.0, 0.5]);
    assert_eq!(db.load_embeddings("m2").unwrap().len(), 1);
  }

  #[test]
  fn open_creates_parent_dirs() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("nested").join("gestalt.db");
    let db = Database::open(&path).unwrap();
    db.create_package("p").unwrap();
    assert!(path.exists());
  }
}
