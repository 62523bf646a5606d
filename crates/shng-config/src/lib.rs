//! Configuration loading for the SmartHome runtime
//!
//! A deployment is a base directory holding:
//!
//! - `etc/smarthome.yaml` - core settings ([`CoreConfig`])
//! - `etc/struct.yaml`, `etc/struct_<prefix>.yaml` - struct templates
//! - `items/*.yaml` - the item tree, merged in file name order
//!
//! YAML documents support two custom tags:
//!
//! - `!include path` - Include another YAML file
//! - `!env_var VAR` - Environment variable substitution
//!
//! # Example
//!
//! ```ignore
//! use shng_config::{load_items, load_structs, CoreConfig};
//!
//! let core = CoreConfig::load("/opt/smarthome")?;
//! let structs = load_structs("/opt/smarthome/etc")?;
//! let tree = load_items("/opt/smarthome/items")?;
//! ```

mod core_config;
mod error;
mod items;
mod loader;

pub use core_config::{CoreConfig, ItemsConfig, CORE_CONFIG_FILE};
pub use error::{ConfigError, ConfigResult};
pub use items::{load_items, load_structs, merge_into};
pub use loader::{load_yaml, yaml_to_json, YamlLoader};
