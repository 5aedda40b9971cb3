//! Structured logging initialization.
//!
//! Overlay tasks log through `tracing` with `peer` and `session` fields and
//! run inside `router`, `peer_manager`, `session` and `discovery` spans.
//! Applications that do not install their own subscriber can call
//! [`init_logging`].

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directive for `level`, used when `RUST_LOG` is unset.
pub fn default_filter(level: &str) -> String {
    format!("weft_p2p={level},weft_protocol={level}")
}

/// Initialize the global subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Returns false if a global
/// subscriber was already installed.
///
/// # Example
///
/// ```rust,no_run
/// use weft_p2p::observability::init_logging;
///
/// init_logging("debug", true);
/// ```
pub fn init_logging(level: &str, json_format: bool) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()
            .is_ok()
    } else {
        registry.with(fmt::layer().pretty()).try_init().is_ok()
    };

    if installed {
        tracing::info!(
            level = %level,
            format = if json_format { "json" } else { "pretty" },
            "Logging initialized"
        );
    }
    installed
}
