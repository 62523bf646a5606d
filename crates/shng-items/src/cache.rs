//! Per-item cache files
//!
//! Each cached item owns one JSON file named after its path:
//! `{"changed": "<rfc3339>", "value": <value>}`. Files holding any other JSON
//! document are read as a bare value with the file modification time as the
//! change time.

use crate::error::{ItemError, ItemResult};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// A value restored from a cache file
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub changed: DateTime<Tz>,
}

#[derive(Serialize)]
struct CacheDocument<'a> {
    changed: String,
    value: &'a Value,
}

#[derive(Deserialize)]
struct StoredDocument {
    changed: String,
    value: Value,
}

/// Read a cache file
///
/// Returns `Ok(None)` when there is nothing usable: the file is missing, or
/// it was empty or corrupt (such files are deleted).
pub fn read_cache(file: &Path, tz: Tz) -> ItemResult<Option<CacheEntry>> {
    let content = match fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ItemError::Cache {
                file: file.to_path_buf(),
                source,
            })
        }
    };

    if content.trim().is_empty() {
        warn!(file = %file.display(), "Cache file is empty, removing it");
        remove_cache(file);
        return Ok(None);
    }

    let document: Value = match serde_json::from_str(&content) {
        Ok(document) => document,
        Err(e) => {
            warn!(file = %file.display(), error = %e, "Cache file is corrupt, removing it");
            remove_cache(file);
            return Ok(None);
        }
    };

    if let Ok(stored) = serde_json::from_value::<StoredDocument>(document.clone()) {
        if let Ok(changed) = DateTime::parse_from_rfc3339(&stored.changed) {
            return Ok(Some(CacheEntry {
                value: stored.value,
                changed: changed.with_timezone(&tz),
            }));
        }
    }

    debug!(file = %file.display(), "Reading legacy cache file");
    let modified = fs::metadata(file)
        .and_then(|meta| meta.modified())
        .map_err(|source| ItemError::Cache {
            file: file.to_path_buf(),
            source,
        })?;
    Ok(Some(CacheEntry {
        value: document,
        changed: DateTime::<Utc>::from(modified).with_timezone(&tz),
    }))
}

/// Rewrite a cache file, going through a uniquely named temporary file in
/// the same directory and a rename
pub fn write_cache(file: &Path, value: &Value, changed: &DateTime<Tz>) -> ItemResult<()> {
    let to_error = |source: io::Error| ItemError::Cache {
        file: file.to_path_buf(),
        source,
    };
    let dir = match file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(to_error)?;
    let document = CacheDocument {
        changed: changed.to_rfc3339(),
        value,
    };
    let content = serde_json::to_string(&document)
        .map_err(|e| to_error(io::Error::new(io::ErrorKind::InvalidData, e)))?;

    let mut temp = NamedTempFile::new_in(dir).map_err(to_error)?;
    temp.write_all(content.as_bytes()).map_err(to_error)?;
    temp.persist(file).map_err(|e| to_error(e.error))?;
    Ok(())
}

/// Delete a cache file, logging failures
pub fn remove_cache(file: &Path) {
    if let Err(e) = fs::remove_file(file) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(file = %file.display(), error = %e, "Unable to remove cache file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn make_test_setup() -> (TempDir, DateTime<Tz>) {
        let dir = TempDir::new().unwrap();
        let changed = Tz::Europe__Berlin
            .with_ymd_and_hms(2024, 5, 1, 12, 30, 0)
            .unwrap();
        (dir, changed)
    }

    #[test]
    fn test_write_then_read() {
        let (dir, changed) = make_test_setup();
        let file = dir.path().join("living.temp");
        write_cache(&file, &json!(21.5), &changed).unwrap();

        let entry = read_cache(&file, Tz::Europe__Berlin).unwrap().unwrap();
        assert_eq!(entry.value, json!(21.5));
        assert_eq!(entry.changed, changed);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_missing_file() {
        let (dir, _) = make_test_setup();
        assert!(read_cache(&dir.path().join("nothing"), Tz::UTC).unwrap().is_none());
    }

    #[test]
    fn test_empty_and_corrupt_files_are_removed() {
        let (dir, _) = make_test_setup();
        let empty = dir.path().join("empty");
        fs::write(&empty, "").unwrap();
        assert!(read_cache(&empty, Tz::UTC).unwrap().is_none());
        assert!(!empty.exists());

        let corrupt = dir.path().join("corrupt");
        fs::write(&corrupt, "{\"value\": ").unwrap();
        assert!(read_cache(&corrupt, Tz::UTC).unwrap().is_none());
        assert!(!corrupt.exists());
    }

    #[test]
    fn test_legacy_value_uses_mtime() {
        let (dir, _) = make_test_setup();
        let file = dir.path().join("legacy");
        fs::write(&file, "[1, 2, 3]").unwrap();
        let entry = read_cache(&file, Tz::UTC).unwrap().unwrap();
        assert_eq!(entry.value, json!([1, 2, 3]));
        let age = Utc::now().signed_duration_since(entry.changed.with_timezone(&Utc));
        assert!(age.num_seconds().abs() < 60);
    }
}
