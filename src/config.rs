//! Typed configuration structures (spec.md 6).
//!
//! The crate never loads YAML off disk itself — that loader is an
//! out-of-scope collaborator — but these types are `serde::Deserialize`
//! so `Config::from_str` can turn any already-read text into the
//! pre-parsed structure the rest of the core consumes, the same way the
//! teacher treats a `TcpStream` as already connected by the time it
//! reaches `Connection::new`.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};

/// `write` truncates the log file on open; `append` keeps prior runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggerMode {
    Write,
    Append,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct LoggerConfig {
    pub path: String,
    pub date_format: String,
    pub mode: LoggerMode,
    pub raw_log: bool,
    pub error_log_stack: bool,
}

/// Describes which transport binding to dial and how (spec.md 6:
/// "`CONNECTION_DESC {io_type, variant}`"). The concrete binding lives
/// outside this crate; this is only the descriptor passed to it.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionDesc {
    pub io_type: String,
    pub variant: String,
}

/// One entry of a device's `CONNECTION_HOPS` table: the command used to
/// reach `to_state` from whichever state this entry is nested under.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct HopConfig {
    pub execute_command: String,
    #[serde(default)]
    pub command_params: HashMap<String, String>,
}

/// `{ from_state: { to_state: HopConfig } }`, deserialized directly from
/// the nested mapping spec.md 6 describes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ConnectionHops(pub HashMap<String, HashMap<String, HopConfig>>);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DeviceConfig {
    pub device_class: String,
    pub initial_state: String,
    #[serde(default)]
    pub cloned_from: Option<String>,
    #[serde(default)]
    pub connection_desc: Option<ConnectionDesc>,
    #[serde(default)]
    pub connection_hops: ConnectionHops,
    #[serde(default)]
    pub lazy_cmds_events: bool,
    #[serde(default)]
    pub additional_params: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    pub logger: LoggerConfig,
    #[serde(default)]
    pub devices: HashMap<String, DeviceConfig>,
    #[serde(default)]
    pub default_connection: Option<ConnectionDesc>,
}

impl Config {
    /// Deserialize a pre-read configuration document (spec.md 6: "a
    /// mapping", not necessarily a file). Accepts YAML; the crate does
    /// not care how the text reached the caller.
    pub fn from_str(text: &str) -> Result<Config> {
        serde_yaml::from_str(text).map_err(|e| Error::Internal(format!("invalid configuration: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
LOGGER:
  PATH: /tmp/moler.log
  DATE_FORMAT: "%H:%M:%S"
  MODE: append
  RAW_LOG: true
  ERROR_LOG_STACK: false
DEVICES:
  UNIX_LOCAL:
    DEVICE_CLASS: moler.unix_local.UnixLocal
    INITIAL_STATE: NOT_CONNECTED
    CONNECTION_DESC:
      io_type: terminal
      variant: bash
    CONNECTION_HOPS:
      NOT_CONNECTED:
        UNIX_LOCAL:
          EXECUTE_COMMAND: open_connection
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.logger.path, "/tmp/moler.log");
        assert_eq!(config.logger.mode, LoggerMode::Append);
        let device = &config.devices["UNIX_LOCAL"];
        assert_eq!(device.device_class, "moler.unix_local.UnixLocal");
        let hop = &device.connection_hops.0["NOT_CONNECTED"]["UNIX_LOCAL"];
        assert_eq!(hop.execute_command, "open_connection");
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(Config::from_str("not: [valid").is_err());
    }
}
