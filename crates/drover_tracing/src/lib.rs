mod event_logger;

pub use event_logger::{EventLogger, MemorySink, Sink, Source};
pub use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the diagnostics subscriber. Writes to stderr so it never
/// interleaves with the lifecycle event stream on stdout.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = fmt::format().with_level(true).with_target(false).compact();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .event_format(format)
        .try_init()
        .ok();
}
