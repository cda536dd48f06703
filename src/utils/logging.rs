//! Tracing setup shared by the server binary and the test suites.

use tracing_subscriber::EnvFilter;

/// Map a configured level name onto a filter directive. Unknown names fall
/// back to `info`.
fn level_directive(level: &str) -> &'static str {
    match level.trim().to_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}

/// Initialize tracing for the application at `default_level`.
///
/// `RUST_LOG` overrides the configured level when it is set. Socket-level
/// crates are held at `warn` so per-frame handshake noise stays out of the
/// relay's own logs.
pub fn init(default_level: &str) {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        format!(
            "{},tungstenite=warn,tokio_tungstenite=warn,rustls=warn",
            level_directive(default_level)
        )
    });
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"));

    // try_init: tests call this repeatedly
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
