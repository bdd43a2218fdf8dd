//! TOML configuration loading for the device engine.
//!
//! ```toml
//! log_level = "debug"
//!
//! [server]
//! port = 4321
//!
//! [capture]
//! frame_rate = 24
//! attach_policy = "exclusive"
//! ```
//!
//! Every field has a serde default, so any subset of the file is valid.

use std::path::Path;

use tracing::{debug, info};

use crate::domain::config::{ConfigError, DeviceConfig};

/// Loads and validates `DeviceConfig` from `path`.
///
/// Returns `DeviceConfig::default()` if the file does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] for malformed TOML, and [`ConfigError::Invalid`]
/// when a value is out of range.
pub fn load_config(path: &Path) -> Result<DeviceConfig, ConfigError> {
    let cfg = match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: DeviceConfig = toml::from_str(&content)?;
            info!("loaded configuration from {}", path.display());
            cfg
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} not found; using defaults", path.display());
            DeviceConfig::default()
        }
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    cfg.validate()?;
    Ok(cfg)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
