//! Wires `tracing` targets onto the three log streams spec.md 6 describes
//! (main log, raw inbound log, process-wide aggregate) via a
//! `tracing-subscriber` layer builder, the same shape as the teacher's
//! `bin/server.rs::set_up_logging` but parameterized by [`LoggerConfig`]
//! instead of hardcoded to stdout.
//!
//! This module is a thin helper for whatever binary wires the core up;
//! packaging and CLI entry points themselves stay out of scope.

use std::fmt;
use std::fs::OpenOptions;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use crate::config::LoggerConfig;
use crate::error::{Error, Result};

/// Renders `HH:MM:SS.mmm` in UTC from the wall clock (spec.md 6: "Log
/// lines carry `HH:MM:SS.mmm` timestamps").
pub struct ClockTime;

impl FormatTime for ClockTime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let total_ms = now.as_millis();
        let ms = total_ms % 1000;
        let total_secs = total_ms / 1000;
        let secs = total_secs % 60;
        let mins = (total_secs / 60) % 60;
        let hours = (total_secs / 3600) % 24;
        write!(w, "{hours:02}:{mins:02}:{secs:02}.{ms:03}")
    }
}

/// Installs a process-wide `tracing` subscriber writing to `config.path`,
/// honoring `RAW_LOG`/`ERROR_LOG_STACK` as filter directives on the
/// `moler_core::raw` and error-span targets. Call once, at process start.
pub fn init(config: &LoggerConfig) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(matches!(config.mode, crate::config::LoggerMode::Append))
        .truncate(matches!(config.mode, crate::config::LoggerMode::Write))
        .open(&config.path)
        .map_err(|e| Error::Internal(format!("opening log file {}: {e}", config.path)))?;

    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if !config.raw_log {
        filter = filter.add_directive(
            "moler_core::raw=off"
                .parse()
                .expect("static directive always parses"),
        );
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ClockTime)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .try_init()
        .map_err(|e| Error::Internal(format!("logging already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_time_formats_as_hh_mm_ss_mmm() {
        let mut buf = String::new();
        let mut writer = Writer::new(&mut buf);
        ClockTime.format_time(&mut writer).unwrap();
        assert_eq!(buf.len(), "HH:MM:SS.mmm".len());
        assert_eq!(buf.as_bytes()[2], b':');
        assert_eq!(buf.as_bytes()[5], b':');
        assert_eq!(buf.as_bytes()[8], b'.');
    }
}
