//! Logging settings for processes embedding the bus.
//!
//! Every field can be overridden from the environment; see
//! [`TelemetryConfig::from_env`].

use std::env;

const DEFAULT_SERVICE_NAME: &str = "wire-bus";
const DEFAULT_FILTER: &str = "info";

/// How bus events are filtered and written.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Reported in the start-up and shutdown events.
    pub service_name: String,

    /// `EnvFilter` directive, e.g. `info` or `wire_bus=debug,warn`.
    pub log_level: String,

    /// Write events to stdout. With this off no subscriber output is produced.
    pub console_output: bool,

    /// One JSON object per event instead of the human-readable format.
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            log_level: DEFAULT_FILTER.to_string(),
            console_output: true,
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    /// Read the settings from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `WIREBUS_SERVICE_NAME`: service name (default: wire-bus)
    /// - `WIREBUS_LOG_LEVEL`, then `RUST_LOG`: filter directive (default: info)
    /// - `WIREBUS_CONSOLE_OUTPUT`: `false`/`0` silences stdout (default: on)
    /// - `WIREBUS_JSON_LOGS`: `true`/`1` switches to JSON (default: on inside
    ///   Kubernetes or Docker, off otherwise)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Settings resolved through `lookup` instead of the real environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let in_container =
            lookup("KUBERNETES_SERVICE_HOST").is_some() || lookup("DOCKER_CONTAINER").is_some();

        Self {
            service_name: lookup("WIREBUS_SERVICE_NAME")
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            log_level: lookup("WIREBUS_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            console_output: lookup("WIREBUS_CONSOLE_OUTPUT")
                .map_or(true, |v| !is_false(&v)),
            json_logs: lookup("WIREBUS_JSON_LOGS").map_or(in_container, |v| is_true(&v)),
        }
    }

    /// Settings for `service_name`; everything else from the environment.
    pub fn for_service(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            ..Self::from_env()
        }
    }
}

fn is_true(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

fn is_false(value: &str) -> bool {
    value.eq_ignore_ascii_case("false") || value == "0"
}
