use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Installs the logfmt subscriber on stderr.
///
/// An explicit level (from `LOG_LEVEL`) wins over `RUST_LOG`; an unparseable
/// directive falls back to `info`.
pub fn init_logging(level: Option<&str>) {
    tracing_subscriber::registry()
        .with(build_filter(level))
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn build_filter(level: Option<&str>) -> EnvFilter {
    match level.map(str::trim).filter(|level| !level.is_empty()) {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    }
}
