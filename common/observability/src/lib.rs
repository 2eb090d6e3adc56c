use tracing_subscriber::EnvFilter;

/// Initialise the process-wide tracing subscriber.
///
/// `RUST_LOG` overrides the default filter. Set `LOG_FORMAT=json` for
/// machine-readable output in container environments.
pub fn init_tracing(service: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{service}=debug")));

    let json = std::env::var("LOG_FORMAT")
        .map(|value| value.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
