use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install a formatted `tracing` subscriber.
///
/// Defaults to `INFO`, or `DEBUG` when `GEMMA_DEBUG` contains `1`. Directives in `RUST_LOG`
/// take precedence. Calling this more than once is harmless.
pub fn initialize_logging() {
    let is_debug = std::env::var("GEMMA_DEBUG")
        .unwrap_or_default()
        .contains('1');

    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
