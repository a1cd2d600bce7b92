use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber.
///
/// Defaults to INFO; `RUST_LOG` overrides per the usual env-filter syntax.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
