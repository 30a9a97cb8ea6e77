//! Logger initialisation

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Level selected by a repeated `-v` count
pub fn level_for_verbosity(count: u8) -> Level {
    match count {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn filter_for(count: u8) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("testgrid={}", level_for_verbosity(count))))
}

/// Install the global subscriber. `RUST_LOG` wins over `-v` when set.
pub fn init_logger(verbosity: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(verbosity))
        .with_target(false)
        .with_thread_names(verbosity > 1)
        .compact()
        .init();
}
