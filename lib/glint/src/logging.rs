pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the root terminal logger at the requested severity. The level
/// string follows the `sloggers` vocabulary (`trace`, `debug`, `info`,
/// `warning`, `error`, `critical`).
pub fn init(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("Error assembling logger configuration");

    config.build_logger().expect("Error building logger")
}

/// A logger that swallows all records. Components accept `Into<Option<&Logger>>`
/// and fall back to this when the caller does not care about diagnostics.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolves an optional parent logger into a child logger, discarding when absent.
pub fn branch<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        _ => discard(),
    }
}
