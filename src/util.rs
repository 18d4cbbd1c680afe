//! Logging and small time/errno helpers.
//!
//! Grounded on `redis/log.rs`: a level-gated line logger writing to stdout
//! or a configured file, `[pid] millis marker message`. The teacher makes
//! this a method on the server struct; here it's a free function backed by
//! `once_cell::sync::Lazy` state, since logging needs to be reachable from
//! code that doesn't hold a `&Server` (e.g. the event loop's poll backend).

use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::process::id;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Verbose,
    Notice,
    Warning,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ch = match self {
            Self::Debug => '.',
            Self::Verbose => '-',
            Self::Notice => '*',
            Self::Warning => '#',
        };
        write!(f, "{ch}")
    }
}

struct LogState {
    verbosity: LogLevel,
    log_file: String,
}

static LOG_STATE: Lazy<RwLock<LogState>> =
    Lazy::new(|| RwLock::new(LogState { verbosity: LogLevel::Notice, log_file: String::new() }));

/// Set the minimum level that actually gets printed and where to print it
/// (empty path means stdout). Called once from `config` during startup.
pub fn configure_logging(verbosity: LogLevel, log_file: &str) {
    let mut state = LOG_STATE.write().unwrap();
    state.verbosity = verbosity;
    state.log_file = log_file.to_string();
}

pub fn log(level: LogLevel, body: &str) {
    let state = LOG_STATE.read().unwrap();
    if level < state.verbosity {
        return;
    }

    let mut writer: Box<dyn Write> = if state.log_file.is_empty() {
        Box::new(io::stdout())
    } else {
        match OpenOptions::new().create(true).append(true).open(&state.log_file) {
            Ok(f) => Box::new(f),
            Err(e) => {
                eprintln!("Can't open log file '{}': {}", state.log_file, e);
                return;
            }
        }
    };

    let line = format!("[{}] {} {} {}\n", id(), timestamp().as_millis(), level, body);
    let _ = writer.write_all(line.as_bytes());
}

pub fn timestamp() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap()
}

/// The current `errno`, for reporting alongside a failed libc call.
pub fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

pub fn last_os_error_message() -> String {
    io::Error::last_os_error().to_string()
}

pub fn yes_no_to_bool(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(format!("argument must be 'yes' or 'no', got '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Verbose);
        assert!(LogLevel::Verbose < LogLevel::Notice);
        assert!(LogLevel::Notice < LogLevel::Warning);
    }

    #[test]
    fn level_display_matches_markers() {
        assert_eq!(format!("{}", LogLevel::Debug), ".");
        assert_eq!(format!("{}", LogLevel::Warning), "#");
    }

    #[test]
    fn yes_no_parsing() {
        assert_eq!(yes_no_to_bool("yes"), Ok(true));
        assert_eq!(yes_no_to_bool("NO"), Ok(false));
        assert!(yes_no_to_bool("maybe").is_err());
    }
}
