//! Server configuration.

use std::path::PathBuf;

/// Settings for the TCP server binary. Defaults are development-friendly;
/// each field can be overridden through the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub bind_addr: String,
    /// Where the state snapshot is read on boot and written after every
    /// mutating command. `None` disables persistence.
    pub snapshot_path: Option<PathBuf>,
    /// Run the invariant auditor after every mutation.
    pub audit: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8888".to_string(),
            snapshot_path: Some(PathBuf::from("exchange_state.json")),
            audit: true,
        }
    }
}

impl ServerConfig {
    /// Overrides: `EXCHANGE_ADDR`, `EXCHANGE_SNAPSHOT` (empty disables
    /// persistence), `EXCHANGE_AUDIT` (`0` disables the auditor).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("EXCHANGE_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("EXCHANGE_SNAPSHOT") {
            config.snapshot_path = if path.is_empty() { None } else { Some(PathBuf::from(path)) };
        }
        if let Ok(audit) = std::env::var("EXCHANGE_AUDIT") {
            config.audit = audit != "0";
        }
        config
    }
}
