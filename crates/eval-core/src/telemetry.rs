//! Tracing subscriber setup for `evald`.
//!
//! Log lines go to stderr; stdout is reserved for command output.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Storage engine crates are noisy at `info`.
const QUIET_DEPENDENCIES: &[&str] = &["surrealdb=warn", "surrealkv=warn", "hyper=warn"];

/// Default filter for `level` when `RUST_LOG` is unset.
pub fn default_filter(level: Level) -> String {
    std::iter::once(level.as_str().to_lowercase())
        .chain(QUIET_DEPENDENCIES.iter().map(|d| d.to_string()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. Only the first call in a process wins.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let installed = if json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_quiets_storage_engines() {
        assert_eq!(
            default_filter(Level::DEBUG),
            "debug,surrealdb=warn,surrealkv=warn,hyper=warn"
        );
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
    }
}
