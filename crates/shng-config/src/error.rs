//! Errors raised while reading a deployment directory

use std::path::{Path, PathBuf};
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `items/` or another required directory is absent
    #[error("missing directory {path}")]
    MissingDirectory { path: PathBuf },

    #[error("bad !include argument {argument}: {reason}")]
    Include { argument: String, reason: String },

    /// A file includes itself, directly or through other files
    #[error("include cycle through {path}")]
    IncludeCycle { path: PathBuf },

    #[error("bad {tag} argument: {reason}")]
    TagArgument { tag: &'static str, reason: String },

    #[error("environment variable {var} is not set")]
    EnvVar { var: String },

    #[error("unknown timezone {name}")]
    Timezone { name: String },

    /// `etc/smarthome.yaml` does not deserialize into the core settings
    #[error("invalid core settings in {file}: {reason}")]
    CoreSettings { file: String, reason: String },
}

impl ConfigError {
    /// File or directory the error is about, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Io { path, .. }
            | ConfigError::Yaml { path, .. }
            | ConfigError::MissingDirectory { path }
            | ConfigError::IncludeCycle { path } => Some(path),
            _ => None,
        }
    }
}
