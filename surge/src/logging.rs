use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

pub(crate) const LOG_ENV: &str = "SURGE_LOG";

const DEFAULT_DIRECTIVES: &str = "surge=info,surge_core=info";

/// `--log-level` wins over `SURGE_LOG`; anything unparsable falls back to the defaults.
fn env_filter(level: Option<&str>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::try_new(level).ok(),
        None => EnvFilter::try_from_env(LOG_ENV).ok(),
    }
    .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Installs the global subscriber. Logs go to stderr so that `--output json`
/// keeps stdout machine-readable.
pub(crate) fn init(level: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_level_is_used() {
        assert_eq!(env_filter(Some("surge=debug")).to_string(), "surge=debug");
    }

    #[test]
    fn invalid_level_falls_back_to_defaults() {
        let filter = env_filter(Some("surge=loudest")).to_string();
        assert!(filter.contains("surge_core=info"), "{filter}");
        assert!(filter.contains("surge=info"), "{filter}");
    }
}
