//! Diagnostic logging to stderr. Stdout is reserved for command output.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "AGENTBOARD_LOG";

/// Installs the global subscriber once. `AGENTBOARD_LOG` (EnvFilter syntax)
/// wins over the `-v` count; later calls are no-ops.
pub fn init(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(format!("agentboard={}", default_level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
