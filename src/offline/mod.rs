//! Offline cache files: one UTF-8 JSON array of documents per collection.
//!
//! The worker debounces persist requests and hands snapshots to a short
//! background thread for the actual write; reads happen on the worker when
//! the caller restores.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::core::document::{Document, DocumentError};

#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("cache io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cache payload is not a json array")]
    NotAnArray,
    #[error("cached entry is not a document: {0}")]
    Document(#[from] DocumentError),
}

pub fn cache_file(dir: &Path, collection: &str) -> PathBuf {
    dir.join(format!("{collection}.cache"))
}

/// Serialize the snapshot, creating the cache directory on first use.
pub fn write_cache(dir: &Path, collection: &str, docs: &[Document]) -> Result<(), OfflineError> {
    fs::create_dir_all(dir)?;
    let array = Value::Array(docs.iter().map(Document::to_value).collect());
    fs::write(cache_file(dir, collection), serde_json::to_vec(&array)?)?;
    Ok(())
}

/// Read a collection's cache; `Ok(None)` when no file exists.
pub fn read_cache(dir: &Path, collection: &str) -> Result<Option<Vec<Document>>, OfflineError> {
    let path = cache_file(dir, collection);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value: Value = serde_json::from_slice(&bytes)?;
    let Value::Array(items) = value else {
        return Err(OfflineError::NotAnArray);
    };
    let docs = items
        .into_iter()
        .map(Document::from_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(docs))
}

/// Delete a collection's cache file; absence is not an error.
pub fn delete_cache(dir: &Path, collection: &str) -> Result<(), OfflineError> {
    match fs::remove_file(cache_file(dir, collection)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(id: &str) -> Document {
        Document::from_value(json!({"_id": id, "n": 1})).unwrap()
    }

    #[test]
    fn write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let docs = vec![doc("a"), doc("b")];
        write_cache(dir.path(), "tasks", &docs).unwrap();

        let loaded = read_cache(dir.path(), "tasks").unwrap().unwrap();
        assert_eq!(loaded, docs);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_cache(dir.path(), "tasks").unwrap().is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_cache(dir.path(), "tasks", &[doc("a")]).unwrap();
        delete_cache(dir.path(), "tasks").unwrap();
        delete_cache(dir.path(), "tasks").unwrap();
        assert!(!cache_file(dir.path(), "tasks").exists());
    }

    #[test]
    fn malformed_payloads_are_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(cache_file(dir.path(), "bad"), b"{\"not\":\"array\"}").unwrap();
        assert!(matches!(
            read_cache(dir.path(), "bad"),
            Err(OfflineError::NotAnArray)
        ));

        fs::write(cache_file(dir.path(), "worse"), b"[{\"no_id\":1}]").unwrap();
        assert!(matches!(
            read_cache(dir.path(), "worse"),
            Err(OfflineError::Document(_))
        ));
    }
}
