// Tracing subscriber setup for the router binary.
//
// Library code only emits `tracing` events; installing a subscriber is left
// to the binary so tests and embedding processes keep their own.

use tracing::error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the fmt subscriber with file/line locations and a `RUST_LOG`
/// filter, and log panics before exiting.
pub fn setup_log() {
    std::panic::set_hook(Box::new(|info| {
        error!(target: "shade_router", "panic: {info}");
        std::process::exit(1);
    }));

    setup_log_no_panic_hook();
}

pub fn setup_log_no_panic_hook() {
    let _ = SubscriberBuilder::default()
        .with_line_number(true)
        .with_file(true)
        .with_span_events(FmtSpan::NONE)
        .with_env_filter(EnvFilter::from_default_env())
        .finish()
        .try_init();
}
