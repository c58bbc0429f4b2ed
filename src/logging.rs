//! Centralized timestamped logging
//!
//! All logs should go through `logi!`, `logw!`, or `loge!` so they include:
//!   <timestamp> [TAG][thread] message
//!
//! This is intentionally lightweight and dependency-minimal. Child-process
//! output (the encoder's stdout) can be piped into the same format with
//! [`spawn_pipe_thread`].

use std::io::{BufRead, BufReader, Read};

// NOTE: We use the `time` crate purely for formatting timestamps with millisecond precision.
// Local time is used when available; it falls back to UTC.
pub fn log_timestamp() -> String {
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let fmt = time::format_description::parse(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
    ).expect("valid time format description");
    now.format(&fmt).unwrap_or_else(|_| "<time-format-error>".to_string())
}

/// Compact timestamp for output filenames: `YYYYMMDD_hhmmss`.
pub(crate) fn file_timestamp() -> String {
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let fmt = time::format_description::parse("[year][month][day]_[hour][minute][second]")
        .expect("valid time format description");
    now.format(&fmt).unwrap_or_else(|_| "00000000_000000".to_string())
}

pub fn log_thread_name() -> String {
    std::thread::current().name().unwrap_or("thread").to_string()
}

/// Pipe a Read stream (child stdout/stderr) into the logger on its own thread.
pub fn spawn_pipe_thread<R: Read + Send + 'static>(
    thread_name: &str,
    tag: &str,
    reader: R,
    as_warn: bool,
) {
    let tag = tag.to_string();
    let _ = std::thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || {
            let br = BufReader::new(reader);
            for line in br.lines().map_while(Result::ok) {
                if as_warn {
                    crate::logw!(&tag, "{line}");
                } else {
                    crate::logi!(&tag, "{line}");
                }
            }
        });
}

/// Info log: printed to stdout
#[macro_export]
macro_rules! logi {
    ($tag:expr, $($arg:tt)*) => {{
        println!("{} [{}][{}] {}", $crate::logging::log_timestamp(), $tag, $crate::logging::log_thread_name(), format!($($arg)*));
        ()
    }};
}

/// Warning log: printed to stderr
#[macro_export]
macro_rules! logw {
    ($tag:expr, $($arg:tt)*) => {{
        eprintln!("{} [{}][{}] {}", $crate::logging::log_timestamp(), $tag, $crate::logging::log_thread_name(), format!($($arg)*));
        ()
    }};
}

/// Error log: printed to stderr
#[macro_export]
macro_rules! loge {
    ($tag:expr, $($arg:tt)*) => {{
        eprintln!("{} [{}][{}] {}", $crate::logging::log_timestamp(), $tag, $crate::logging::log_thread_name(), format!($($arg)*));
        ()
    }};
}
