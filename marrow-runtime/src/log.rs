//! Logging Infrastructure
//!
//! Structured logging for the runtime's own diagnostics: discarded race
//! outcomes, finalizer failures during scope close, and executor lifecycle
//! events. Supports log levels, key-value fields, and plain or JSON output.
//!
//! # Example
//!
//! ```rust,ignore
//! use marrow_runtime::log::{LogBuilder, LogLevel};
//!
//! marrow_runtime::warn!("finalizer failed during close");
//!
//! LogBuilder::new(LogLevel::Debug)
//!     .message("race loser dropped")
//!     .field("failure", "boom")
//!     .emit();
//! ```

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace = 0,
    /// Debug level.
    Debug = 1,
    /// Info level (default).
    #[default]
    Info = 2,
    /// Warning level.
    Warn = 3,
    /// Error level.
    Error = 4,
    /// Off (no logging).
    Off = 5,
}

impl LogLevel {
    /// Get the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" | "err" => Some(LogLevel::Error),
            "off" | "none" => Some(LogLevel::Off),
            _ => None,
        }
    }

    fn from_u8(v: u8) -> LogLevel {
        match v {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            4 => LogLevel::Error,
            _ => LogLevel::Off,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LogFormat {
    /// Human-readable plain text (default).
    #[default]
    Plain = 0,
    /// One JSON object per line.
    Json = 1,
}

impl LogFormat {
    /// Parse a format from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static CURRENT_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Plain as u8);

/// Set the global minimum level.
pub fn set_level(level: LogLevel) {
    CURRENT_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// The global minimum level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(CURRENT_LEVEL.load(Ordering::SeqCst))
}

/// Set the global output format.
pub fn set_format(format: LogFormat) {
    CURRENT_FORMAT.store(format as u8, Ordering::SeqCst);
}

/// Whether a message at `level` would be emitted.
pub fn enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level >= self::level()
}

/// Emit a pre-formatted message at `level`.
///
/// Prefer the level macros (`trace!`, `debug!`, `warn!`, `error!`) or
/// [`LogBuilder`] for structured fields.
pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    LogBuilder::new(level).message(args.to_string()).emit();
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Builder for a structured log record.
#[derive(Debug)]
pub struct LogBuilder {
    level: LogLevel,
    message: String,
    fields: Vec<(String, String)>,
}

impl LogBuilder {
    /// Start a record at `level`.
    pub fn new(level: LogLevel) -> Self {
        LogBuilder {
            level,
            message: String::new(),
            fields: Vec::new(),
        }
    }

    /// Set the message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach a key-value field.
    pub fn field(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.fields.push((key.into(), value.to_string()));
        self
    }

    /// Write the record to stderr if the level is enabled.
    pub fn emit(self) {
        if !enabled(self.level) {
            return;
        }
        let line = match LogFormat::parse_u8(CURRENT_FORMAT.load(Ordering::SeqCst)) {
            LogFormat::Plain => self.render_plain(),
            LogFormat::Json => self.render_json(),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
    }

    fn render_plain(&self) -> String {
        let mut line = format!(
            "[{} {:5}] {}",
            timestamp_millis(),
            self.level.as_str(),
            self.message
        );
        for (key, value) in &self.fields {
            line.push_str(&format!(" {}={}", key, value));
        }
        line
    }

    fn render_json(&self) -> String {
        let mut line = format!(
            "{{\"ts\":{},\"level\":\"{}\",\"message\":\"{}\"",
            timestamp_millis(),
            self.level.as_str(),
            json_escape(&self.message)
        );
        for (key, value) in &self.fields {
            line.push_str(&format!(
                ",\"{}\":\"{}\"",
                json_escape(key),
                json_escape(value)
            ));
        }
        line.push('}');
        line
    }
}

impl LogFormat {
    fn parse_u8(v: u8) -> LogFormat {
        if v == LogFormat::Json as u8 {
            LogFormat::Json
        } else {
            LogFormat::Plain
        }
    }
}

/// Emit a trace-level message.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Trace, format_args!($($arg)*))
    };
}

/// Emit a debug-level message.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Debug, format_args!($($arg)*))
    };
}

/// Emit a warn-level message.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Warn, format_args!($($arg)*))
    };
}

/// Emit an error-level message.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Error, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Off);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("bogus"), None);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("plain"), Some(LogFormat::Plain));
        assert_eq!(LogFormat::parse("yaml"), None);
    }

    #[test]
    fn test_json_escape() {
        assert_eq!(json_escape("a\"b"), "a\\\"b");
        assert_eq!(json_escape("line\nbreak"), "line\\nbreak");
        assert_eq!(json_escape("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn test_builder_renders_fields() {
        let builder = LogBuilder::new(LogLevel::Info)
            .message("completed")
            .field("items", 3)
            .field("mode", "bounded");
        let plain = builder.render_plain();
        assert!(plain.contains("completed"));
        assert!(plain.contains("items=3"));
        assert!(plain.contains("mode=bounded"));
    }

    #[test]
    fn test_builder_renders_json() {
        let builder = LogBuilder::new(LogLevel::Info)
            .message("done")
            .field("count", 2);
        let json = builder.render_json();
        assert!(json.starts_with('{') && json.ends_with('}'));
        assert!(json.contains("\"message\":\"done\""));
        assert!(json.contains("\"count\":\"2\""));
    }
}
