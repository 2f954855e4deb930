use std::sync::Once;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Install a fmt subscriber that writes through the test harness's captured
/// output. Safe to call from every test; only the first call does anything.
///
/// Honours `RUST_LOG`, defaulting to `warn`.
pub fn init_test_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_line_number(true),
            )
            // Another subscriber may already be installed by the embedding test binary
            .try_init();
    });
}
