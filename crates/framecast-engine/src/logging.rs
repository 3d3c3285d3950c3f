//! Centralized timestamped logging
//!
//! All logs go through `logi!`, `logw!`, or `loge!` so they share one shape:
//!   <timestamp> [LEVEL][TAG][thread] message
//!
//! - stderr is the canonical sink.
//! - `init` can add an append-only file sink for audit/debug.
//!
//! Per-frame success paths do not log; drops, protocol errors and lifecycle changes do.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

static LOG_FILE: OnceLock<Mutex<Option<std::fs::File>>> = OnceLock::new();
static RUN_ID: OnceLock<String> = OnceLock::new();

/// Initialize logging. Call once at startup.
/// - If `log_file` is Some, all log lines are appended to that path.
/// - Always logs to stderr.
///
/// Returns the generated run_id.
pub fn init(log_file: Option<PathBuf>) -> String {
    let rid = RUN_ID
        .get_or_init(|| {
            // Short correlation id: time xor pid
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            format!("{:08x}", (now.as_nanos() as u64) ^ (std::process::id() as u64))
        })
        .clone();

    let sink = LOG_FILE.get_or_init(|| Mutex::new(None));

    if let Some(path) = log_file {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => {
                if let Ok(mut guard) = sink.lock() {
                    *guard = Some(f);
                }
            }
            Err(e) => {
                // The sink is not installed yet, so write the warning directly.
                let msg = format!("failed to open log file {}: {e}", path.display());
                eprintln!("{}", format_line("WARN", "INIT", &msg));
            }
        }
    }

    rid
}

/// Current run id (empty if init() wasn't called).
pub fn run_id() -> &'static str {
    RUN_ID.get().map(|s| s.as_str()).unwrap_or("")
}

// NOTE: `time` is used purely for formatting timestamps with millisecond precision.
// Local time is used when available; it falls back to UTC.
pub fn log_timestamp() -> String {
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let Ok(fmt) = time::format_description::parse(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]",
    ) else {
        return "<time-format-error>".to_string();
    };
    now.format(&fmt).unwrap_or_else(|_| "<time-format-error>".to_string())
}

pub fn log_thread_name() -> String {
    std::thread::current().name().unwrap_or("thread").to_string()
}

fn format_line(level: &str, tag: &str, msg: &str) -> String {
    format!("{} [{level}][{tag}][{}] {msg}", log_timestamp(), log_thread_name())
}

/// Write one fully formatted line to stderr + optional file sink.
#[doc(hidden)]
pub fn log_line(level: &str, tag: &str, msg: &str) {
    let line = format_line(level, tag, msg);

    eprintln!("{line}");

    if let Some(m) = LOG_FILE.get() {
        if let Ok(mut guard) = m.lock() {
            if let Some(f) = guard.as_mut() {
                let _ = writeln!(f, "{line}");
                let _ = f.flush();
            }
        }
    }
}

/// Info log
#[macro_export]
macro_rules! logi {
    ($tag:expr, $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::logging::log_line("INFO", $tag, &msg);
    }};
}

/// Warning log
#[macro_export]
macro_rules! logw {
    ($tag:expr, $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::logging::log_line("WARN", $tag, &msg);
    }};
}

/// Error log
#[macro_export]
macro_rules! loge {
    ($tag:expr, $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::logging::log_line("ERROR", $tag, &msg);
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_has_millisecond_precision() {
        let ts = log_timestamp();
        // YYYY-MM-DD HH:MM:SS.mmm
        assert_eq!(ts.len(), 23, "unexpected timestamp {ts}");
        assert_eq!(&ts[10..11], " ");
        assert_eq!(&ts[19..20], ".");
    }

    #[test]
    fn line_carries_level_tag_and_thread() {
        let line = std::thread::Builder::new()
            .name("log-test".into())
            .spawn(|| format_line("WARN", "SERVER", "outbox full"))
            .unwrap()
            .join()
            .unwrap();
        assert!(line.ends_with(" [WARN][SERVER][log-test] outbox full"), "{line}");
    }

    #[test]
    fn file_sink_receives_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("framecast.log");
        let rid = init(Some(path.clone()));
        assert!(!rid.is_empty());
        assert_eq!(run_id(), rid);

        crate::logi!("TEST", "hello {}", 42);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[INFO][TEST]"));
        assert!(text.contains("hello 42"));
    }
}
