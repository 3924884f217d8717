//! Logging setup for the server process

/// Padded label for a log level.
fn level_label(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    }
}

/// Initialize logging for a long-running server:
/// `warn` when quiet, `debug` when debug, `info` otherwise.
/// `RUST_LOG` overrides the default filter. Millisecond timestamps, no ANSI
/// colors — output is expected to land in a journal or log file.
pub fn init_logging(quiet: bool, debug: bool) {
    use std::io::Write;

    let default_level = if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            let ts = buf.timestamp_millis();
            writeln!(buf, "{ts} [{}] {}", level_label(record.level()), record.args())
        })
        .init();
}
