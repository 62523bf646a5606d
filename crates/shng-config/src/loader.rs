//! YAML loading with `!include` and `!env_var` tags
//!
//! - `!include path` - Replace the node by the content of another YAML file,
//!   resolved relative to the including file
//! - `!env_var VAR` - Replace the node by the value of an environment variable
//!
//! Documents are handed to the core as `serde_json::Value`; [`yaml_to_json`]
//! does the conversion.

use crate::error::{ConfigError, ConfigResult};
use serde_json::{Map, Number};
use serde_yaml::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// YAML loader resolving the custom tags
pub struct YamlLoader {
    /// Base directory for relative paths
    base_dir: PathBuf,
    /// Files currently being loaded, to detect include cycles
    include_stack: HashSet<PathBuf>,
}

impl YamlLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            include_stack: HashSet::new(),
        }
    }

    /// Load and process a YAML file
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.resolve_path(path.as_ref());
        debug!("Loading YAML file: {:?}", path);

        if self.include_stack.contains(&path) {
            return Err(ConfigError::IncludeCycle { path });
        }

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            path: path.clone(),
            source: e,
        })?;

        self.include_stack.insert(path.clone());
        let result = self.load_string(&content, &path);
        self.include_stack.remove(&path);

        result
    }

    /// Load and process YAML from a string
    ///
    /// A document without content (blank or comments only) yields `Null`.
    pub fn load_string(&mut self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        let blank = content
            .lines()
            .map(str::trim)
            .all(|line| line.is_empty() || line.starts_with('#'));
        if blank {
            return Ok(Value::Null);
        }
        let value: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::Yaml {
            path: source_path.to_path_buf(),
            source: e,
        })?;

        self.process_value(value, source_path)
    }

    fn process_value(&mut self, value: Value, source_path: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.process_tagged(*tagged, source_path),
            Value::Mapping(map) => {
                let mut result = serde_yaml::Mapping::new();
                for (k, v) in map {
                    let v = self.process_value(v, source_path)?;
                    result.insert(k, v);
                }
                Ok(Value::Mapping(result))
            }
            Value::Sequence(seq) => seq
                .into_iter()
                .map(|v| self.process_value(v, source_path))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            _ => Ok(value),
        }
    }

    fn process_tagged(
        &mut self,
        tagged: serde_yaml::value::TaggedValue,
        source_path: &Path,
    ) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!("Processing tag '{}' with value {:?}", tag, tagged.value);

        match tag.as_str() {
            "!include" => {
                let include_path = self.value_to_path(&tagged.value, source_path)?;
                debug!("Including file: {:?}", include_path);
                self.load_file(&include_path)
            }
            "!env_var" => process_env_var(tagged.value),
            _ => {
                warn!(tag = %tag, file = ?source_path, "Unknown YAML tag, using the plain value");
                self.process_value(tagged.value, source_path)
            }
        }
    }

    /// A tag argument as a path, relative to the file it appears in
    fn value_to_path(&self, value: &Value, source_path: &Path) -> ConfigResult<PathBuf> {
        let Value::String(path) = value else {
            return Err(ConfigError::Include {
                argument: format!("{:?}", value),
                reason: "path must be a string".to_string(),
            });
        };
        let path = Path::new(path);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        let base_dir = source_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(&self.base_dir);
        Ok(base_dir.join(path))
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

fn process_env_var(value: Value) -> ConfigResult<Value> {
    let Value::String(var) = value else {
        return Err(ConfigError::TagArgument {
            tag: "!env_var",
            reason: "environment variable name must be a string".to_string(),
        });
    };
    let var = var.trim().to_string();
    let env_value =
        std::env::var(&var).map_err(|_| ConfigError::EnvVar { var: var.clone() })?;
    debug!("Substituted env var: {}", var);
    Ok(Value::String(env_value))
}

/// Load a YAML file with tag processing
pub fn load_yaml(base_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(base_dir).load_file(file)
}

/// Convert a YAML document to JSON
///
/// Mapping keys are stringified; NaN and infinite floats become `null`.
pub fn yaml_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                serde_json::Value::from(u)
            } else {
                n.as_f64()
                    .and_then(Number::from_f64)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
        Value::String(s) => serde_json::Value::String(s),
        Value::Sequence(seq) => serde_json::Value::Array(seq.into_iter().map(yaml_to_json).collect()),
        Value::Mapping(map) => {
            let mut result = Map::new();
            for (k, v) in map {
                result.insert(key_string(k), yaml_to_json(v));
            }
            serde_json::Value::Object(result)
        }
        Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

fn key_string(key: Value) -> String {
    match key {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(&other)
            .unwrap_or_default()
            .trim()
            .to_string(),
    }
}
