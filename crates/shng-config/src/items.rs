//! Item tree and struct template files
//!
//! Item definitions live in `items/*.yaml`; every file contributes top-level
//! items and the files are merged in name order, so a later file can add
//! children to or override attributes of an item defined earlier.
//!
//! Struct templates live in `etc/struct.yaml` (plain names) and
//! `etc/struct_<prefix>.yaml` (names `my.<prefix>.<name>`).

use crate::error::{ConfigError, ConfigResult};
use crate::loader::{yaml_to_json, YamlLoader};
use serde_json::{Map, Value};
use shng_items::StructRegistry;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Load and merge all item files of a directory
#[instrument(skip_all, fields(dir = ?dir.as_ref()))]
pub fn load_items(dir: impl AsRef<Path>) -> ConfigResult<Value> {
    let dir = dir.as_ref();
    let mut loader = YamlLoader::new(dir);
    let mut tree = Map::new();

    for file in yaml_files(dir)? {
        let document = yaml_to_json(loader.load_file(&file)?);
        match document {
            Value::Object(items) => {
                debug!(file = ?file, items = items.len(), "Merging item file");
                merge_into(&mut tree, items);
            }
            Value::Null => debug!(file = ?file, "Empty item file"),
            _ => warn!(file = ?file, "Item file does not hold a mapping, ignoring it"),
        }
    }

    info!(items = tree.len(), "Loaded top-level items");
    Ok(Value::Object(tree))
}

/// Load `struct.yaml` and `struct_<prefix>.yaml` from the `etc` directory
///
/// Missing files are fine; the registry is returned unresolved.
#[instrument(skip_all, fields(dir = ?etc_dir.as_ref()))]
pub fn load_structs(etc_dir: impl AsRef<Path>) -> ConfigResult<StructRegistry> {
    let etc_dir = etc_dir.as_ref();
    let mut loader = YamlLoader::new(etc_dir);
    let mut structs = StructRegistry::new();

    if !etc_dir.is_dir() {
        return Ok(structs);
    }

    let main = etc_dir.join("struct.yaml");
    if main.is_file() {
        add_struct_file(&mut structs, &mut loader, &main, None)?;
    }

    for file in yaml_files(etc_dir)? {
        let Some(prefix) = file
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("struct_"))
            .map(str::to_string)
        else {
            continue;
        };
        if file.extension().map(|e| e == "yaml").unwrap_or(false) {
            add_struct_file(&mut structs, &mut loader, &file, Some(&prefix))?;
        }
    }

    info!(structs = structs.len(), "Loaded struct definitions");
    Ok(structs)
}

fn add_struct_file(
    structs: &mut StructRegistry,
    loader: &mut YamlLoader,
    file: &Path,
    prefix: Option<&str>,
) -> ConfigResult<()> {
    match yaml_to_json(loader.load_file(file)?) {
        Value::Object(definitions) => structs.add_file(prefix, definitions),
        Value::Null => debug!(file = ?file, "Empty struct file"),
        _ => warn!(file = ?file, "Struct file does not hold a mapping, ignoring it"),
    }
    Ok(())
}

/// Deep merge, `source` wins on conflicting leaves
pub fn merge_into(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_into(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// `*.yaml` and `*.yml` files of a directory, sorted by name
fn yaml_files(dir: &Path) -> ConfigResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(ConfigError::MissingDirectory {
            path: dir.to_path_buf(),
        });
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| ConfigError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false)
        })
        .collect();

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_into_is_deep() {
        let mut target = match json!({"living": {"light": {"type": "bool"}, "temp": {"type": "num"}}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let source = match json!({"living": {"light": {"cache": true}, "temp": 5}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        merge_into(&mut target, source);
        assert_eq!(
            Value::Object(target),
            json!({"living": {"light": {"type": "bool", "cache": true}, "temp": 5}})
        );
    }
}
