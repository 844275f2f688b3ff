//! Binary entry point: parse flags, stand up logging, then hand off to the
//! supervisor (§6). Kept intentionally thin — everything it calls is
//! unit-testable from the library crate without a real fork or socket.

use pkg_fcgi::config;
use std::process::ExitCode;

const USAGE: &str = "usage: pkg_fcgi [-dv] [-j n] [-p path] [-s socket] [-u user] [db]";

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let config = match config::parse(&args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("pkg_fcgi: {message}");
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config);

    match pkg_fcgi::supervisor::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Installs `env_logger` against stderr at a level derived from `-v`'s
/// repeat count (§6: 0 → warn, 1 → info, 2+ → debug). Daemon mode still
/// logs through the same `log` facade; stderr is simply whatever
/// `daemon(1, 0)` redirected it to by the time a worker logs anything
/// (SPEC_FULL.md's ambient-stack section) — a real syslog transport is an
/// external collaborator this crate does not implement.
fn init_logging(config: &config::Config) {
    let level = match config.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}
