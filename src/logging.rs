use tracing_subscriber::EnvFilter;

/// Crawl progress at info; sqlx only speaks up when a statement goes wrong.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// `RUST_LOG` if it parses, else `fallback`, else [`DEFAULT_FILTER`].
pub fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global fmt subscriber on stderr, leaving stdout to the
/// `status` report. Fails if a subscriber is already set.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_filter))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}
