use crate::cli::error::CliError;
use tracing::Level;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initializes logging (through the tracing crate) for the cli. Logs are written to the standard error so the
/// standard output only holds the probe result. `RUST_LOG` directives take precedence over `log_level`.
pub fn init(log_level: Level) -> Result<(), CliError> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(log_level).into())
        .from_env_lossy();
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|err| CliError::Tracing(format!("unable to set the global tracer: {err}")))
}
