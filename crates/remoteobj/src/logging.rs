//! Tracing subscriber setup for binaries and tests that want log output.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter directive for a `REMOTEOBJ_LOG` level.
fn filter_directive(level: Option<&str>) -> String {
    let base_level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("remoteobj={base_level}")
}

/// Install a stderr subscriber. `RUST_LOG` wins over `REMOTEOBJ_LOG`;
/// `LOG_FORMAT=json` switches to JSON lines. Does nothing if a global
/// subscriber is already set.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var("REMOTEOBJ_LOG").ok();
        EnvFilter::new(filter_directive(level.as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
