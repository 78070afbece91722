//! Stage artifact I/O.
//!
//! Every stage hands its complete output to the next stage as a JSON Lines
//! file (one record per line). This crate owns that format:
//! - [`read_jsonl`] / [`write_jsonl`] for whole-file stage artifacts
//! - [`append_jsonl`] for append-only logs (never truncates)
//! - [`read_json`] / [`write_json`] for single-document reports
//! - [`ArtifactRef`] checksums recorded in run manifests
//! - [`StageArtifacts`]: the file layout used by an end-to-end run

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use loreforge_shared::{LoreforgeError, Result};

// ---------------------------------------------------------------------------
// JSON Lines
// ---------------------------------------------------------------------------

/// Read every record of a JSONL file. Blank lines are ignored.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).map_err(|e| LoreforgeError::io(path, e))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| LoreforgeError::io(path, e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = serde_json::from_str(trimmed).map_err(|e| {
            LoreforgeError::parse(format!("{}:{}: {e}", path.display(), idx + 1))
        })?;
        records.push(record);
    }

    debug!(path = %path.display(), records = records.len(), "read jsonl");
    Ok(records)
}

/// Replace `path` with the given records.
///
/// Writes to a sibling temp file and renames it into place, so readers never
/// observe a half-written artifact.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)
            .map_err(|e| LoreforgeError::parse(format!("serialize record: {e}")))?;
        buf.push(b'\n');
    }
    write_atomic(path, &buf)?;
    debug!(path = %path.display(), records = records.len(), "wrote jsonl");
    Ok(())
}

/// Append records to a JSONL log, creating it if needed. Existing lines are
/// never touched. Returns the number of records appended.
pub fn append_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<usize> {
    if records.is_empty() {
        return Ok(0);
    }
    ensure_parent(path)?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LoreforgeError::io(path, e))?;
    let mut writer = BufWriter::new(file);

    for record in records {
        serde_json::to_writer(&mut writer, record)
            .map_err(|e| LoreforgeError::parse(format!("serialize record: {e}")))?;
        writer
            .write_all(b"\n")
            .map_err(|e| LoreforgeError::io(path, e))?;
    }

    let file = writer
        .into_inner()
        .map_err(|e| LoreforgeError::io(path, e.into_error()))?;
    file.sync_data().map_err(|e| LoreforgeError::io(path, e))?;
    Ok(records.len())
}

/// Count non-blank lines in a JSONL file (0 if it does not exist).
pub fn count_lines(path: &Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let file = File::open(path).map_err(|e| LoreforgeError::io(path, e))?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| LoreforgeError::io(path, e))?;
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// JSON documents
// ---------------------------------------------------------------------------

/// Read a single JSON document.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| LoreforgeError::io(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| LoreforgeError::parse(format!("{}: {e}", path.display())))
}

/// Atomically write a pretty-printed JSON document.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_vec_pretty(value)
        .map_err(|e| LoreforgeError::parse(format!("serialize {}: {e}", path.display())))?;
    buf.push(b'\n');
    write_atomic(path, &buf)
}

/// Write `bytes` to `path` via temp file + rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| LoreforgeError::validation(format!("not a file path: {}", path.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    {
        let mut file = File::create(&tmp).map_err(|e| LoreforgeError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| LoreforgeError::io(&tmp, e))?;
        file.sync_all().map_err(|e| LoreforgeError::io(&tmp, e))?;
    }

    std::fs::rename(&tmp, path).map_err(|e| LoreforgeError::io(path, e))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| LoreforgeError::io(parent, e))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Artifact references
// ---------------------------------------------------------------------------

/// A written artifact as recorded in a run manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: String,
    pub records: usize,
    /// SHA-256 of the file contents.
    pub sha256: String,
}

impl ArtifactRef {
    /// Describe an existing JSONL artifact.
    pub fn describe(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| LoreforgeError::io(path, e))?;
        let records = bytes
            .split(|b| *b == b'\n')
            .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
            .count();
        Ok(Self {
            path: path.display().to_string(),
            records,
            sha256: format!("{:x}", Sha256::digest(&bytes)),
        })
    }
}

// ---------------------------------------------------------------------------
// Run layout
// ---------------------------------------------------------------------------

/// Intermediate file layout for one end-to-end run.
#[derive(Debug, Clone)]
pub struct StageArtifacts {
    pub dir: PathBuf,
}

impl StageArtifacts {
    /// Layout rooted at `<work_dir>/<run_id>/`.
    pub fn in_dir(work_dir: &Path, run_id: &str) -> Self {
        Self {
            dir: work_dir.join(run_id),
        }
    }

    pub fn seeds(&self) -> PathBuf {
        self.dir.join("seeds.jsonl")
    }

    pub fn pages(&self) -> PathBuf {
        self.dir.join("pages.jsonl")
    }

    pub fn crawl_skips(&self) -> PathBuf {
        self.dir.join("crawl_skips.jsonl")
    }

    pub fn candidates(&self) -> PathBuf {
        self.dir.join("candidates.jsonl")
    }

    pub fn normalize_skips(&self) -> PathBuf {
        self.dir.join("normalize_skips.jsonl")
    }

    pub fn evaluations(&self) -> PathBuf {
        self.dir.join("evaluations.jsonl")
    }

    pub fn evaluation_report(&self) -> PathBuf {
        self.dir.join("evaluation_report.json")
    }
}

/// Path of the companion file for a stage output (e.g. `pages.skips.jsonl`).
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".into());
    path.with_file_name(format!("{stem}.{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: u32,
        name: String,
    }

    fn tmp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lf-artifacts-{tag}-{}", uuid::Uuid::now_v7()))
    }

    #[test]
    fn write_then_read_preserves_order() {
        let dir = tmp_dir("rw");
        let path = dir.join("rows.jsonl");
        let rows = vec![
            Row { id: 2, name: "Vault 13".into() },
            Row { id: 1, name: "Shady Sands".into() },
        ];

        write_jsonl(&path, &rows).expect("write");
        let read: Vec<Row> = read_jsonl(&path).expect("read");
        assert_eq!(read, rows);
        assert!(!dir.join("rows.jsonl.tmp").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn read_skips_blank_lines_and_reports_bad_line() {
        let dir = tmp_dir("bad");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rows.jsonl");
        std::fs::write(&path, "{\"id\":1,\"name\":\"a\"}\n\n{not json}\n").unwrap();

        let err = read_jsonl::<Row>(&path).unwrap_err();
        assert!(err.to_string().contains(":3:"), "unexpected: {err}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn append_only_grows() {
        let dir = tmp_dir("append");
        let path = dir.join("log.jsonl");

        append_jsonl(&path, &[Row { id: 1, name: "first".into() }]).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();
        append_jsonl(
            &path,
            &[Row { id: 2, name: "second".into() }, Row { id: 3, name: "third".into() }],
        )
        .unwrap();
        let after = std::fs::read_to_string(&path).unwrap();

        assert!(after.starts_with(&before));
        assert_eq!(count_lines(&path).unwrap(), 3);
        assert_eq!(append_jsonl::<Row>(&path, &[]).unwrap(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = read_jsonl::<Row>(Path::new("/nonexistent/lf/rows.jsonl")).unwrap_err();
        assert!(matches!(err, LoreforgeError::Io { .. }));
        assert_eq!(count_lines(Path::new("/nonexistent/lf/rows.jsonl")).unwrap(), 0);
    }

    #[test]
    fn artifact_ref_counts_and_hashes() {
        let dir = tmp_dir("ref");
        let path = dir.join("rows.jsonl");
        write_jsonl(&path, &[Row { id: 1, name: "x".into() }]).unwrap();

        let r = ArtifactRef::describe(&path).unwrap();
        assert_eq!(r.records, 1);
        assert_eq!(r.sha256.len(), 64);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn sibling_paths() {
        let p = sibling_with_suffix(Path::new("out/pages.jsonl"), "skips.jsonl");
        assert_eq!(p, PathBuf::from("out/pages.skips.jsonl"));

        let layout = StageArtifacts::in_dir(Path::new("tmp"), "run-1");
        assert_eq!(layout.candidates(), PathBuf::from("tmp/run-1/candidates.jsonl"));
    }
}
