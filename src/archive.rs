//! ZIP packaging of stored question folders.

use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::domain::archive_name;
use crate::error::AppResult;
use crate::store::{QuestionFile, QuestionFolder};
use crate::util::safe_file_stem;

fn options() -> SimpleFileOptions {
  SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn entry_name(file: &QuestionFile) -> String {
  if file.save_name.is_empty() { archive_name(&file.name).to_string() } else { file.save_name.clone() }
}

/// Archive of one folder: one entry per file, named by its archive name.
pub fn folder_zip(files: &[QuestionFile]) -> AppResult<Vec<u8>> {
  let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
  for file in files {
    zip.start_file(entry_name(file), options())?;
    zip.write_all(file.content.as_bytes())?;
  }
  Ok(zip.finish()?.into_inner())
}

/// Name of a folder's nested archive inside a package download.
pub fn nested_zip_name(folder: &QuestionFolder) -> String {
  format!("{}_{}.zip", safe_file_stem(&folder.title), folder.id)
}

/// Master archive holding one nested folder archive per folder.
pub fn package_zip(folders: &[(QuestionFolder, Vec<QuestionFile>)]) -> AppResult<Vec<u8>> {
  let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
  for (folder, files) in folders {
    let inner = folder_zip(files)?;
    zip.start_file(nested_zip_name(folder), options())?;
    zip.write_all(&inner)?;
  }
  Ok(zip.finish()?.into_inner())
}
