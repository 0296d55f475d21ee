use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber from the logging section.
///
/// `RUST_LOG` takes precedence over the configured level. Returns `false` if a
/// subscriber was already installed.
pub fn install_tracing_from_config(cfg: &pgque_config::LoggingConfig) -> bool {
    use tracing_subscriber::fmt::time::ChronoUtc;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cfg.level.clone());
    let env_filter = tracing_subscriber::EnvFilter::new(&filter);

    // The two branches build different subscriber types.
    if cfg.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .finish()
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_timer(ChronoUtc::rfc_3339())
            .finish()
            .try_init()
            .is_ok()
    }
}
