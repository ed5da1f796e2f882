//! Structured logging setup.
//!
//! Diagnostics go to **stderr** through `tracing`, filtered by
//! [`LOG_ENV`] (`RUST_LOG` syntax, e.g. `OPTIMAKE_LOG=optimake=debug`).
//! Stdout stays reserved for command summaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "OPTIMAKE_LOG";

const DEFAULT_FILTER: &str = "warn,optimake=info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}
