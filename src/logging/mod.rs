// Logging setup
//
// tracing with an EnvFilter; RUST_LOG wins over the level stored in
// global.json. When file logging is enabled the fmt layer writes through
// a daily-rotating appender under <data_root>/logs and the guard is
// returned so the buffer flushes on shutdown.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::models::GlobalConfig;
use crate::paths;

/// Initialize the global subscriber. Returns the appender guard when file
/// logging is on; hold it for the life of the process.
pub fn init(config: &GlobalConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = format!("duckcoding={}", config.log.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    if config.log.to_file {
        let appender = tracing_appender::rolling::daily(paths::log_dir(), "duckcoding.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        None
    }
}
