//! Tracing subscriber setup for the CLI.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Logs go to stderr so stdout stays usable.
/// `RUST_LOG` wins over the verbosity flag when set.
pub fn init(verbose: bool) {
    let default_level = if verbose { "sast_triage=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
