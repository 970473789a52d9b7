use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PYLON_LOG";

/// Installs the global tracing subscriber.
///
/// `PYLON_LOG` takes precedence over `RUST_LOG`. Without either, the level is
/// `info`, or `debug` when `debug` is set. Logs go to stderr because stdout
/// may carry published telemetry.
pub fn init_tracing(debug: bool, json: bool) -> Result<()> {
    let fallback = if debug { "debug" } else { "info" };

    let filter = match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); defaulting to {fallback}");
            EnvFilter::new(fallback)
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("installing log subscriber: {e}"))
}
