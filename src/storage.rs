use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const WRITE_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Write JSON through a temp file and atomic rename so concurrent readers
/// never observe a partial file. Transient rename errors (anti-virus holds
/// on Windows) are retried.
pub fn safe_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(value).context("serializing value")?;
    let tmp = path.with_extension("tmp");

    let mut last_err = None;
    for attempt in 0..WRITE_RETRIES {
        let result = (|| -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(json.as_bytes())?;
            f.sync_all()?;
            fs::rename(&tmp, path)?;
            Ok(())
        })();

        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                if attempt + 1 < WRITE_RETRIES {
                    std::thread::sleep(RETRY_DELAY);
                }
                last_err = Some(e);
            }
        }
    }

    let source = last_err.unwrap();
    warn!("safe_write_json gave up on {}: {}", path.display(), source);
    Err(crate::error::BotError::DiskContention {
        path: path.display().to_string(),
        source,
    }
    .into())
}

/// Read JSON written by `safe_write_json`. A missing file is DataMissing,
/// not a crash.
pub fn safe_read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|_| {
        crate::error::BotError::DataMissing(format!("{} not found", path.display()))
    })?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Append one JSON value as a line to a JSONL log.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let line = serde_json::to_string(value).context("serializing jsonl row")?;
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    writeln!(f, "{}", line).with_context(|| format!("appending to {}", path.display()))?;
    Ok(())
}

/// Read every row of a JSONL log; rows that fail to parse are skipped with
/// a warning.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = fs::read_to_string(path).map_err(|_| {
        crate::error::BotError::DataMissing(format!("{} not found", path.display()))
    })?;
    let mut rows = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(v) => rows.push(v),
            Err(e) => warn!("{}:{} skipped malformed row: {}", path.display(), i + 1, e),
        }
    }
    Ok(rows)
}

/// Remove a file if present. Used by the end-of-day reconciler for
/// transient artifacts; idempotent.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}
