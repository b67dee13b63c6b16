// Tracing setup
use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Diagnostics stay off unless `verbose` is set or an explicit filter is given.
pub fn init(verbose: bool, level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(l) => EnvFilter::try_new(l)?,
        None if verbose => EnvFilter::new("debug"),
        None => EnvFilter::new("off"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging init: {e}"))
}
