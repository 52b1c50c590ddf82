use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "IDHINI_LOG";

/// Logs go to stderr so command output on stdout stays clean.
pub fn init(default_level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("Invalid log filter")?;

    let plain = (!json).then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));
    let structured = json.then(|| fmt::layer().json().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(structured)
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(())
}
