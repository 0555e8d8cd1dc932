//! Logger setup shared by the bridge binaries.
//!
//! The library itself only emits through the `log` facade; nothing here runs
//! unless a binary calls [`init_logger`].

use crate::errors::CliError;

use log::LevelFilter;

/// Maps a command-line level name to a filter. Unknown names mean `info`.
pub fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Initializes the logger using env_logger with the given level
pub fn init_logger(level: &str) -> Result<(), CliError> {
    let mut builder = env_logger::Builder::new();

    builder.filter_level(level_filter(level));
    builder.format_timestamp_micros();
    builder.format_module_path(false);
    builder.format_target(false);
    builder
        .try_init()
        .map_err(|e| CliError::GeneralError(format!("Cannot install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter("ERROR"), LevelFilter::Error);
        assert_eq!(level_filter("warn"), LevelFilter::Warn);
        assert_eq!(level_filter("Debug"), LevelFilter::Debug);
        assert_eq!(level_filter("trace"), LevelFilter::Trace);
        assert_eq!(level_filter("off"), LevelFilter::Off);
        assert_eq!(level_filter("verbose"), LevelFilter::Info);
    }

    #[test]
    fn test_init_logger_once() {
        init_logger("debug").unwrap();
        assert_eq!(log::max_level(), LevelFilter::Debug);
        assert!(init_logger("info").is_err());
    }
}
