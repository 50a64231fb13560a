use tracing_subscriber::{fmt, EnvFilter};

use crate::config::RelayConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Calling this again after a
/// subscriber is installed (tests, embedding) is a no-op.
pub fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Already set, ignore
    let _ = if config.log_json {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_target(false)
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
    };
}
