//! Process-wide leveled logging for the node.
//!
//! Records are rendered either as a single text line or as a JSON object and
//! written to stderr. Tests can route records into a bounded in-memory ring
//! and assert on them with [`captured`].

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    const ALL: [Level; 5] = [
        Level::Error,
        Level::Warn,
        Level::Info,
        Level::Debug,
        Level::Trace,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("warning") {
            return Some(Level::Warn);
        }
        Self::ALL
            .into_iter()
            .find(|level| raw.eq_ignore_ascii_case(level.label()))
    }

    fn from_u8(value: u8) -> Self {
        Self::ALL
            .into_iter()
            .find(|level| *level as u8 == value)
            .unwrap_or(Level::Info)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text,
    Json,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("text") || raw.eq_ignore_ascii_case("plain") {
            Some(Format::Text)
        } else if raw.eq_ignore_ascii_case("json") {
            Some(Format::Json)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
        }
    }
}

/// A rendered log event as it was emitted.
#[derive(Clone, Debug)]
pub struct Record {
    pub unix_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub message: String,
}

impl Record {
    fn render_text(&self, timestamps: bool) -> String {
        let mut out = String::with_capacity(self.message.len() + 48);
        if timestamps {
            out.push_str(&rfc3339(self.unix_ms));
            out.push(' ');
        }
        out.push_str(&format!(
            "[{:>5}] {}: {}",
            self.level.label().to_ascii_uppercase(),
            self.target,
            self.message
        ));
        out
    }

    fn render_json(&self) -> String {
        json!({
            "ts_ms": self.unix_ms,
            "level": self.level.label(),
            "target": self.target,
            "file": self.file,
            "line": self.line,
            "msg": self.message,
        })
        .to_string()
    }
}

struct Capture {
    capacity: usize,
    records: VecDeque<Record>,
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static JSON_OUTPUT: AtomicBool = AtomicBool::new(false);
static TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static STDERR: AtomicBool = AtomicBool::new(true);
static CAPTURING: AtomicBool = AtomicBool::new(false);
static CAPTURE: OnceLock<Mutex<Capture>> = OnceLock::new();

pub fn init(config: LogConfig) {
    MAX_LEVEL.store(config.level as u8, Ordering::Relaxed);
    JSON_OUTPUT.store(config.format == Format::Json, Ordering::Relaxed);
    TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
}

pub fn max_level() -> Level {
    Level::from_u8(MAX_LEVEL.load(Ordering::Relaxed))
}

pub fn set_stderr_enabled(enabled: bool) {
    STDERR.store(enabled, Ordering::Relaxed);
}

/// Starts keeping the most recent `capacity` records in memory.
pub fn enable_capture(capacity: usize) {
    let capture = CAPTURE.get_or_init(|| {
        Mutex::new(Capture {
            capacity,
            records: VecDeque::new(),
        })
    });
    if let Ok(mut guard) = capture.lock() {
        guard.capacity = capacity;
        while guard.records.len() > capacity {
            guard.records.pop_front();
        }
    }
    CAPTURING.store(capacity > 0, Ordering::Relaxed);
}

pub fn disable_capture() {
    CAPTURING.store(false, Ordering::Relaxed);
}

/// Returns captured records, oldest first, that satisfy `filter`.
pub fn captured(filter: impl Fn(&Record) -> bool) -> Vec<Record> {
    let Some(capture) = CAPTURE.get() else {
        return Vec::new();
    };
    match capture.lock() {
        Ok(guard) => guard.records.iter().filter(|r| filter(r)).cloned().collect(),
        Err(_) => Vec::new(),
    }
}

pub fn clear_captured() {
    if let Some(capture) = CAPTURE.get() {
        if let Ok(mut guard) = capture.lock() {
            guard.records.clear();
        }
    }
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn emit(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    let capturing = CAPTURING.load(Ordering::Relaxed);
    let to_stderr = STDERR.load(Ordering::Relaxed);
    if !capturing && !to_stderr {
        return;
    }

    let unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default();
    let record = Record {
        unix_ms,
        level,
        target,
        file,
        line,
        message: args.to_string(),
    };

    if to_stderr {
        let rendered = if JSON_OUTPUT.load(Ordering::Relaxed) {
            record.render_json()
        } else {
            record.render_text(TIMESTAMPS.load(Ordering::Relaxed))
        };
        let _ = writeln!(io::stderr().lock(), "{rendered}");
    }

    if capturing {
        if let Some(capture) = CAPTURE.get() {
            if let Ok(mut guard) = capture.lock() {
                if guard.records.len() >= guard.capacity {
                    guard.records.pop_front();
                }
                guard.records.push_back(record);
            }
        }
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        let level = $level;
        if $crate::enabled(level) {
            $crate::emit(level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Error, $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Info, $($arg)*) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Trace, $($arg)*) };
}

fn rfc3339(unix_ms: u64) -> String {
    let secs = unix_ms / 1000;
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;

    // Days since 1970-01-01 to a proleptic Gregorian date, shifted so that
    // years start in March.
    let shifted = days + 719_468;
    let era = shifted.div_euclid(146_097);
    let day_of_era = shifted.rem_euclid(146_097);
    let year_of_era =
        (day_of_era - day_of_era / 1_460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let month_index = (5 * day_of_year + 2) / 153;
    let day = day_of_year - (153 * month_index + 2) / 5 + 1;
    let month = if month_index < 10 {
        month_index + 3
    } else {
        month_index - 9
    };
    let year = year_of_era + era * 400 + i64::from(month <= 2);

    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        rem / 3_600,
        (rem % 3_600) / 60,
        rem % 60,
        unix_ms % 1000
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(Level::parse("INFO"), Some(Level::Info));
        assert_eq!(Level::parse(" warning "), Some(Level::Warn));
        assert_eq!(Level::parse("trace"), Some(Level::Trace));
        assert_eq!(Level::parse("verbose"), None);
    }

    #[test]
    fn formats_parse() {
        assert_eq!(Format::parse("Json"), Some(Format::Json));
        assert_eq!(Format::parse("plain"), Some(Format::Text));
        assert_eq!(Format::parse("xml"), None);
    }

    #[test]
    fn timestamps_render_utc() {
        assert_eq!(rfc3339(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(rfc3339(951_782_400_123), "2000-02-29T00:00:00.123Z");
    }

    #[test]
    fn json_records_carry_message() {
        let record = Record {
            unix_ms: 5,
            level: Level::Warn,
            target: "hybridd::test",
            file: "lib.rs",
            line: 7,
            message: "block rejected".to_string(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&record.render_json()).expect("valid json");
        assert_eq!(value["level"], "warn");
        assert_eq!(value["msg"], "block rejected");
    }
}
