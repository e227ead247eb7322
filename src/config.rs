//! Application configuration
//!
//! Read from `--config <path>` or `$XDG_CONFIG_HOME/iptsync/config.json`.
//! Every field has a default, and a missing or unreadable file yields the
//! defaults. Command-line flags override the loaded values.

use crate::core::iptables::{IptablesCommand, PersistCommand};
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory holding the default pre/post rule files.
///
/// Distro packagers can relocate it at build time with `IPTSYNC_SYSTEM_CONF_DIR`.
const SYSTEM_CONF_DIR: &str = match option_env!("IPTSYNC_SYSTEM_CONF_DIR") {
    Some(dir) => dir,
    None => "/etc/iptsync",
};

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Rules placed before the declared rules of each table
    pub pre_file: PathBuf,
    /// Rules placed after the declared rules of each table
    pub post_file: PathBuf,
    /// Directory containing `iptables` and `iptables-save` (default: `PATH` lookup)
    pub iptables_dir: Option<PathBuf>,
    /// Overrides platform detection, e.g. `["service", "iptables", "save"]`
    pub persist_command: Option<Vec<String>>,
    /// Append an audit event for every applied run
    pub audit: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pre_file: Path::new(SYSTEM_CONF_DIR).join("pre.iptables"),
            post_file: Path::new(SYSTEM_CONF_DIR).join("post.iptables"),
            iptables_dir: None,
            persist_command: None,
            audit: true,
        }
    }
}

impl AppConfig {
    /// Process backend for the configured binary location.
    pub fn backend(&self) -> IptablesCommand {
        self.iptables_dir
            .as_deref()
            .map_or_else(IptablesCommand::new, IptablesCommand::with_dir)
    }

    /// The configured persistence command, else the detected one.
    pub fn persist_command(&self) -> Option<PersistCommand> {
        match &self.persist_command {
            Some(argv) => {
                let command = PersistCommand::from_argv(argv);
                if command.is_none() {
                    warn!("Empty \"persist_command\" in config, rules will not be saved");
                }
                command
            }
            None => PersistCommand::detect(),
        }
    }
}

/// Default location of the config file.
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads the config from `path` (or the default location), or returns the
/// defaults if not found.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn load_config(path: Option<&Path>) -> AppConfig {
    let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) else {
        return AppConfig::default();
    };

    match tokio::fs::read_to_string(&path).await {
        Ok(json) => match serde_json::from_str::<AppConfig>(&json) {
            Ok(config) => {
                debug!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("Ignoring invalid config {}: {e}", path.display());
                AppConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => {
            warn!("Cannot read config {}: {e}", path.display());
            AppConfig::default()
        }
    }
}
