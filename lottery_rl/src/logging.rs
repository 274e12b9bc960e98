// src/logging.rs
//
// env_logger bootstrap for the CLI and tests.
//
// RUST_LOG wins over the default filter. Safe to call more than once; later
// calls are no-ops.

use log::LevelFilter;

/// Install the global logger with `default_filter` unless RUST_LOG is set.
pub fn init(default_filter: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .try_init();
}

/// Logger for tests: captured output, verbose level.
pub fn init_for_tests() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Map a `-v` count to a default filter string.
pub fn filter_for_verbosity(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "warn";
    }
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_filters() {
        assert_eq!(filter_for_verbosity(0, false), "info");
        assert_eq!(filter_for_verbosity(1, false), "debug");
        assert_eq!(filter_for_verbosity(5, false), "trace");
        assert_eq!(filter_for_verbosity(3, true), "warn");
    }

    #[test]
    fn init_is_idempotent() {
        init_for_tests();
        init("info");
        log::debug!("[logging] still alive");
    }
}
