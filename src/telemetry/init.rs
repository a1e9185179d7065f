// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subscriber initialization.

use std::io::{self, IsTerminal};

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Configuration for telemetry initialization.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Level for foreman's own targets when `RUST_LOG` is not set.
    pub default_level: Level,

    /// Whether to include span close events with timings.
    pub include_span_events: bool,

    pub include_file_line: bool,

    pub include_target: bool,

    pub ansi_colors: bool,

    pub compact: bool,

    /// Custom filter directive (overrides `default_level`, not `RUST_LOG`).
    pub filter_directive: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::WARN,
            include_span_events: false,
            include_file_line: false,
            include_target: false,
            ansi_colors: io::stderr().is_terminal(),
            compact: true,
            filter_directive: None,
        }
    }
}

impl TelemetryConfig {
    /// Interactive commands: `-v` for info, `-vv` or `--debug` for debug,
    /// `-vvv` for trace.
    pub fn from_verbosity(verbose: u8, debug: bool) -> Self {
        let default_level = match (verbose, debug) {
            (0, false) => Level::WARN,
            (1, false) => Level::INFO,
            (0..=2, _) => Level::DEBUG,
            _ => Level::TRACE,
        };
        Self {
            default_level,
            include_file_line: debug,
            include_span_events: debug,
            ..Self::default()
        }
    }

    /// Long-running daemons: info by default, full format with targets.
    pub fn daemon(verbose: u8, debug: bool) -> Self {
        let base = Self::from_verbosity(verbose, debug);
        Self {
            default_level: base.default_level.max(Level::INFO),
            include_target: true,
            compact: false,
            ..base
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_directive = Some(filter.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi_colors = ansi;
        self
    }

    /// Directive used when `RUST_LOG` is unset: dependencies stay at warn.
    pub fn directive(&self) -> String {
        match &self.filter_directive {
            Some(directive) => directive.clone(),
            None => format!("warn,foreman={}", self.default_level.as_str().to_lowercase()),
        }
    }
}

/// Keep alive for the duration of the program.
pub struct TelemetryGuard {
    _private: (),
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// config. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directive()))
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.as_str()));

    let span_events = if config.include_span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_file(config.include_file_line)
        .with_line_number(config.include_file_line)
        .with_span_events(span_events);

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.compact {
        registry.with(fmt_layer.compact()).try_init()
    } else {
        registry.with(fmt_layer).try_init()
    };
    installed.map_err(|e| io::Error::other(e.to_string()))?;

    Ok(TelemetryGuard { _private: () })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(TelemetryConfig::from_verbosity(0, false).default_level, Level::WARN);
        assert_eq!(TelemetryConfig::from_verbosity(1, false).default_level, Level::INFO);
        assert_eq!(TelemetryConfig::from_verbosity(2, false).default_level, Level::DEBUG);
        assert_eq!(TelemetryConfig::from_verbosity(0, true).default_level, Level::DEBUG);
        assert_eq!(TelemetryConfig::from_verbosity(3, false).default_level, Level::TRACE);
    }

    #[test]
    fn test_daemon_is_at_least_info() {
        let config = TelemetryConfig::daemon(0, false);
        assert_eq!(config.default_level, Level::INFO);
        assert!(config.include_target);
        assert!(!config.compact);
        assert_eq!(TelemetryConfig::daemon(0, true).default_level, Level::DEBUG);
    }

    #[test]
    fn test_directive() {
        let config = TelemetryConfig::default().with_level(Level::DEBUG);
        assert_eq!(config.directive(), "warn,foreman=debug");
        assert_eq!(config.with_filter("foreman::queue=trace").directive(), "foreman::queue=trace");
    }
}
