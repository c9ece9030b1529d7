//! Shared tracing/logging initialization.
//!
//! The master, the agent worker and the app workers all use the same
//! pattern: `tracing_subscriber` with an env-filter and optional JSON
//! output. Logs always go to stderr because stdout carries IPC envelopes
//! in worker processes.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Env var overriding the master log level.
pub const MASTER_LEVEL_ENV: &str = "TROUPE_MASTER_LOGGER_LEVEL";
/// Env var overriding the agent worker log level.
pub const AGENT_LEVEL_ENV: &str = "TROUPE_AGENT_WORKER_LOGGER_LEVEL";
/// Env var overriding the app worker log level.
pub const APP_LEVEL_ENV: &str = "TROUPE_APP_WORKER_LOGGER_LEVEL";

/// Map a logger level name (`ALL`, `DEBUG`, `INFO`, `WARN`, `ERROR`,
/// `NONE`, case-insensitive) to a tracing filter directive.
///
/// Unknown names fall back to `info`.
pub fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "ALL" | "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" => "warn",
        "ERROR" => "error",
        "NONE" | "OFF" => "off",
        _ => "info",
    }
}

/// Build the default filter for one crate from a role's level env var.
///
/// `fallback` is used when the env var is unset (e.g. `"INFO"`).
pub fn role_filter(targets: &[&str], level_env: &str, fallback: &str) -> String {
    let level = std::env::var(level_env).unwrap_or_else(|_| fallback.to_string());
    let directive = level_directive(&level);
    targets
        .iter()
        .map(|target| format!("{target}={directive}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"troupe_cluster=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_directives() {
        assert_eq!(level_directive("ALL"), "trace");
        assert_eq!(level_directive("debug"), "debug");
        assert_eq!(level_directive("INFO"), "info");
        assert_eq!(level_directive("Warn"), "warn");
        assert_eq!(level_directive("ERROR"), "error");
        assert_eq!(level_directive("NONE"), "off");
        assert_eq!(level_directive("chatty"), "info");
    }

    #[test]
    fn role_filter_covers_every_target() {
        let filter = role_filter(
            &["troupe_cluster", "troupe_core"],
            "TROUPE_TEST_LEVEL_THAT_IS_NEVER_SET",
            "WARN",
        );
        assert_eq!(filter, "troupe_cluster=warn,troupe_core=warn");
    }
}
