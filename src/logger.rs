//! Logging setup for the cusparse-solver binaries and benches
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to executables, which call [`init_logger`] once at startup.

use tracing::Level;

/// Initialize the tracing subscriber with the default INFO level
///
/// Output format: `<time> <LEVEL> <target>: <message>`.
///
/// # Example
/// ```no_run
/// use cusparse_solver::init_logger;
///
/// init_logger();
/// tracing::info!("Application started");
/// ```
///
/// # Environment Variables
/// Override the default log level using `RUST_LOG`:
/// ```bash
/// RUST_LOG=debug cargo run --bin solve_chain
/// RUST_LOG=cusparse_solver::linalg=trace cargo run --bin solve_chain
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// `RUST_LOG` still takes precedence. Calling this twice is harmless: the
/// second subscriber is not installed.
pub fn init_logger_with_level(default_level: Level) {
    use tracing_subscriber::fmt::time::SystemTime;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}
