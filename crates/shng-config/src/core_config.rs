//! Core settings from `etc/smarthome.yaml`

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use shng_items::RegistryOptions;
use shng_scheduler::SchedulerConfig;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::load_yaml;

/// Name of the core settings file inside `etc/`
pub const CORE_CONFIG_FILE: &str = "smarthome.yaml";

/// Item tree settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemsConfig {
    /// Replace an item whose path is already taken instead of rejecting it
    pub allow_collisions: bool,
}

/// Core runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// IANA timezone the clock and cron expressions use
    #[serde(default = "default_tz")]
    pub tz: String,

    /// Cache directory, relative paths are taken from the base directory
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub items: ItemsConfig,
}

fn default_tz() -> String {
    "UTC".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("var/cache")
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tz: default_tz(),
            cache_dir: default_cache_dir(),
            scheduler: SchedulerConfig::default(),
            items: ItemsConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load `etc/smarthome.yaml` below `base_dir`
    ///
    /// A missing file yields the defaults.
    pub fn load(base_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let etc_dir = base_dir.as_ref().join("etc");
        if !etc_dir.join(CORE_CONFIG_FILE).is_file() {
            debug!("No {} in {:?}, using defaults", CORE_CONFIG_FILE, etc_dir);
            return Ok(Self::default());
        }
        let yaml = load_yaml(&etc_dir, CORE_CONFIG_FILE)?;
        Self::from_yaml(yaml)
    }

    /// Parse the settings from a YAML document, `null` yields the defaults
    pub fn from_yaml(yaml: Value) -> ConfigResult<Self> {
        match yaml {
            Value::Null => Ok(Self::default()),
            Value::Mapping(_) => {
                serde_yaml::from_value(yaml).map_err(|e| ConfigError::CoreSettings {
                    file: CORE_CONFIG_FILE.to_string(),
                    reason: e.to_string(),
                })
            }
            _ => Err(ConfigError::CoreSettings {
                file: CORE_CONFIG_FILE.to_string(),
                reason: "configuration must be a mapping".to_string(),
            }),
        }
    }

    pub fn timezone(&self) -> ConfigResult<Tz> {
        self.tz
            .parse::<Tz>()
            .map_err(|_| ConfigError::Timezone {
                name: self.tz.clone(),
            })
    }

    /// The cache directory resolved against `base_dir`
    pub fn cache_path(&self, base_dir: impl AsRef<Path>) -> PathBuf {
        if self.cache_dir.is_absolute() {
            self.cache_dir.clone()
        } else {
            base_dir.as_ref().join(&self.cache_dir)
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            allow_collisions: self.items.allow_collisions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shng_scheduler::ExhaustionPolicy;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.tz, "UTC");
        assert_eq!(config.cache_dir, PathBuf::from("var/cache"));
        assert_eq!(config.scheduler.worker_num, 5);
        assert_eq!(config.scheduler.worker_max, 20);
        assert_eq!(config.scheduler.worker_delta, 60);
        assert_eq!(config.scheduler.restart_on_num_workers, 30);
        assert!(!config.items.allow_collisions);
    }

    #[test]
    fn test_parse_from_yaml() {
        let yaml: Value = serde_yaml::from_str(
            r#"
tz: Europe/Berlin
lat: 52.52
cache_dir: /var/lib/smarthome/cache
scheduler:
  worker_num: 2
  exhaustion_policy: shed_load
items:
  allow_collisions: true
"#,
        )
        .unwrap();

        let config = CoreConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.timezone().unwrap(), chrono_tz::Europe::Berlin);
        assert_eq!(config.scheduler.worker_num, 2);
        assert_eq!(config.scheduler.worker_max, 20);
        assert_eq!(config.scheduler.exhaustion_policy, ExhaustionPolicy::ShedLoad);
        assert!(config.registry_options().allow_collisions);
        assert_eq!(
            config.cache_path("/opt/smarthome"),
            PathBuf::from("/var/lib/smarthome/cache")
        );
    }

    #[test]
    fn test_relative_cache_dir() {
        let config = CoreConfig::default();
        assert_eq!(
            config.cache_path("/opt/smarthome"),
            PathBuf::from("/opt/smarthome/var/cache")
        );
    }

    #[test]
    fn test_invalid_timezone() {
        let yaml: Value = serde_yaml::from_str("tz: Mars/Olympus\n").unwrap();
        let config = CoreConfig::from_yaml(yaml).unwrap();
        assert!(matches!(
            config.timezone(),
            Err(ConfigError::Timezone { .. })
        ));
    }

    #[test]
    fn test_not_a_mapping() {
        let yaml: Value = serde_yaml::from_str("- tz\n").unwrap();
        assert!(matches!(
            CoreConfig::from_yaml(yaml),
            Err(ConfigError::CoreSettings { .. })
        ));
    }
}
