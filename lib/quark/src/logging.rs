pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the default terminal logger used by binaries.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Builds a logger from a TOML logger configuration string.
pub fn from_toml(toml: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).map_err(|e| e.to_string())?;
    config.build_logger().map_err(|e| e.to_string())
}

/// A logger that drops all records, for components constructed without one.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolves an optional parent logger into a child logger, falling back to a
/// discarding logger.
pub fn child_or_discard<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => discard(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_logger() {
        let log = discard();
        debug!(log, "dropped"; "key" => 1);
    }

    #[test]
    fn test_child_or_discard() {
        let root = discard();
        let child = child_or_discard(&root);
        trace!(child, "child record");
        let lone = child_or_discard(None);
        trace!(lone, "fallback record");
    }
}
