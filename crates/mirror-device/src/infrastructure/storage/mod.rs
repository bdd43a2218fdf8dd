//! Storage infrastructure: configuration file loading.
//!
//! The `config` sub-module reads the TOML file named on the command line (or
//! in `MIRROR_CONFIG`) into a [`DeviceConfig`](crate::domain::DeviceConfig).
//! A missing file is not an error; the device then runs on defaults.

pub mod config;

pub use config::load_config;
