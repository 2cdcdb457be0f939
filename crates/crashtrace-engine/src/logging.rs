//! Tracing subscriber setup for hosts that do not install their own

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives
pub const LOG_ENV: &str = "CRASHTRACE_LOG";

/// Install a formatting subscriber filtered by `CRASHTRACE_LOG`, falling back
/// to `default_filter` (e.g. `"crashtrace=info"`).
///
/// Returns `false` when a global subscriber was already set; calling this
/// more than once is harmless.
pub fn init(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let _first = init("crashtrace=debug");
        assert!(!init("crashtrace=debug"));
    }
}
