//! Configuration Module
//!
//! Connection parameters, global SSH preferences and `~/.ssh/config` resolution.

pub mod params;
pub mod preferences;
pub mod ssh_config;

pub use params::{ConnectionParams, ParamStore, ParamValue, ParamsError};
pub use preferences::Preferences;
pub use ssh_config::{
    default_ssh_config_path, load_host_config, resolve_host_config, SshConfigError, SshConfigHost,
};
