//! Account persistence
//!
//! One pretty-printed JSON file per account under the accounts
//! directory, plus a merge step that folds them into a single array.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A registered account. Written once, never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub email: String,
    pub password: String,
    pub token: String,
    pub cookie: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of [`merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Files read successfully.
    pub files: usize,
    /// Records written to the output.
    pub merged: usize,
    /// Files that could not be read or parsed.
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AccountStore {
    dir: PathBuf,
}

impl AccountStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Where the record for `email` lives.
    #[must_use]
    pub fn path_for(&self, email: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(email)))
    }

    /// Write `record` to its own file.
    ///
    /// # Errors
    ///
    /// [`Error::Write`] when the directory cannot be created, the file
    /// already exists, or writing fails.
    pub fn save(&self, record: &AccountRecord) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|source| Error::Write {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.path_for(&record.email);
        let json = serde_json::to_string_pretty(record)?;

        let write = || -> std::io::Result<()> {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()
        };
        write().map_err(|source| Error::Write {
            path: path.clone(),
            source,
        })?;

        info!("Saved account {} to {}", record.email, path.display());
        Ok(path)
    }

    /// Read one record back.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a record.
    pub fn load(path: &Path) -> Result<AccountRecord> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Filesystem-safe, injective name for an email address.
///
/// Lowercases, keeps `[a-z0-9.-]` and hex-escapes every other byte as
/// `_xx`, so `_` itself becomes `_5f` and `@` becomes `_40`. A leading
/// `.` is escaped too, keeping the file visible.
#[must_use]
pub fn file_stem(email: &str) -> String {
    let lower = email.to_lowercase();
    let mut out = String::with_capacity(lower.len() + 4);
    for (i, byte) in lower.bytes().enumerate() {
        let keep = byte.is_ascii_lowercase()
            || byte.is_ascii_digit()
            || byte == b'-'
            || (byte == b'.' && i > 0);
        if keep {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("_{byte:02x}"));
        }
    }
    out
}

/// Fold every `*.json` file in `records_dir` into one array at
/// `output`.
///
/// Files are read in name order; each may hold a single object or an
/// array of objects. The output file itself is never read as input.
/// The same inputs always produce the same bytes.
///
/// # Errors
///
/// Returns an error if the directory cannot be listed or the output
/// cannot be written. Unreadable input files are skipped and reported.
pub fn merge(records_dir: &Path, output: &Path) -> Result<MergeReport> {
    let output_canonical = output.canonicalize().ok();
    let mut paths: Vec<PathBuf> = fs::read_dir(records_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .filter(|p| {
            output_canonical.is_none()
                || p.canonicalize().ok().as_ref() != output_canonical.as_ref()
        })
        .collect();
    paths.sort();

    let mut report = MergeReport::default();
    let mut merged: Vec<Value> = Vec::new();

    for path in paths {
        match read_records(&path) {
            Ok(records) => {
                debug!("{}: {} records", path.display(), records.len());
                report.files += 1;
                merged.extend(records);
            }
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                report.skipped.push(path);
            }
        }
    }
    report.merged = merged.len();

    let mut json = serde_json::to_string_pretty(&merged)?;
    json.push('\n');
    fs::write(output, json).map_err(|source| Error::Write {
        path: output.to_path_buf(),
        source,
    })?;

    info!(
        "Merged {} records from {} files into {} ({} skipped)",
        report.merged,
        report.files,
        output.display(),
        report.skipped.len()
    );
    Ok(report)
}

fn read_records(path: &Path) -> Result<Vec<Value>> {
    let data = fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&data)? {
        Value::Array(items) if items.iter().all(Value::is_object) => Ok(items),
        object @ Value::Object(_) => Ok(vec![object]),
        _ => Err(Error::Io(std::io::Error::new(
            ErrorKind::InvalidData,
            "expected an object or an array of objects",
        ))),
    }
}
