use std::env;
use tracing_subscriber::{fmt, EnvFilter};

/// Modules that log once per firehose operation or request; at the default
/// level their chatter would bury feed-lifecycle events.
const NOISY_TARGETS: &[&str] = &["atmosfeed::firehose", "tower_http", "aws_config"];

pub fn setup_logging() {
    let level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    // RUST_LOG wins outright; the fallback filter runs the crate at the
    // requested level with the per-event targets demoted to warn.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        NOISY_TARGETS.iter().fold(
            EnvFilter::new(format!("atmosfeed={}", level)),
            |filter, target| filter.add_directive(format!("{}=warn", target).parse().unwrap()),
        )
    });

    fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .init();
}
