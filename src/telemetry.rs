//! Optional tracing subscriber installation.
//!
//! Library code only emits `tracing` events; hosts that have no subscriber of
//! their own can install this one.

use tracing_subscriber::EnvFilter;

/// Install a stderr subscriber filtered by verbosity and the `DDP_LOG`
/// environment variable. Safe to call when a global subscriber is already
/// set; the call is then a no-op.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("DDP_LOG")
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_env_filter(filter)
        .try_init();
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}
