//! Tracing subscriber setup shared by the binaries.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise verbosity maps `-v` to debug and
/// `-vv` to trace for this crate while keeping dependencies at warn.
pub fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(format!("warn,ethexplorer={level}"))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
