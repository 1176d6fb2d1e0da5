pub mod config;
pub mod hub;
pub mod model;
pub mod server;

/// Process-wide utility functions
pub mod util {
    use tracing_subscriber::EnvFilter;

    /// Install the global tracing subscriber. `RUST_LOG` wins over the
    /// configured directive. Records from the `log` crate (actix's request
    /// logger) are forwarded as well.
    pub fn init_tracing(directive: &str) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
