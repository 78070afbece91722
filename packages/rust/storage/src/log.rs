//! Append-only JSONL logs (merge decisions, provenance).

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use loreforge_artifacts::{append_jsonl, count_lines, read_jsonl};
use loreforge_shared::Result;

/// A JSONL file that is only ever appended to.
///
/// There is no API to rewrite or truncate the file.
#[derive(Debug, Clone)]
pub struct AppendLog<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> AppendLog<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries written so far (0 if the file does not exist yet).
    pub fn len(&self) -> Result<usize> {
        count_lines(&self.path)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl<T: Serialize> AppendLog<T> {
    /// Append one entry and sync it to disk.
    pub fn append(&self, entry: &T) -> Result<()> {
        append_jsonl(&self.path, std::slice::from_ref(entry))?;
        Ok(())
    }
}

impl<T: DeserializeOwned> AppendLog<T> {
    /// Read every entry in write order.
    pub fn read_all(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        read_jsonl(&self.path)
    }
}
