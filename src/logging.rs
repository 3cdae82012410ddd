//! Structured JSON-line logging.
//!
//! Provides the [`rlog!`] macro for consistent log output. Every line is a
//! single JSON object:
//!
//! ```text
//! {"ts":1750000000123,"level":"info","src":"src/web/handlers/messages.rs:42","msg":"send: accepted"}
//! ```
//!
//! Handlers attach the request id and error code through the optional fields
//! map so log lines can be joined back to responses. Phone numbers and other
//! caller secrets must never appear in a log line; log encrypted phones or
//! DIDs instead.
//!
//! By default log lines go to stderr.  Call [`set_writer`] to redirect output
//! to any [`std::io::Write`] implementor (file, in-memory buffer, test
//! capture, etc.).

use std::io::{self, Write};
use std::sync::{LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Log severity, lowercased into the `level` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

/// Replace the log writer.  All subsequent [`rlog!`] output goes to `w`.
pub fn set_writer(w: Box<dyn Write + Send>) {
    *LOG_WRITER.lock().unwrap() = w;
}

/// Current wall-clock time in integer milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

const LOG_ID_TRUNCATE_LEN: usize = 12;

/// Shorten a DID or message id for log output.
pub fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(LOG_ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// Write a single JSON log line to the current writer.
///
/// Called by the [`rlog!`] / [`rlog_kv!`] macros; not intended for direct use.
pub fn emit(level: Level, file: &str, line: u32, msg: &str, extra: Option<Value>) {
    let mut obj = serde_json::json!({
        "ts": now_ms(),
        "level": level.as_str(),
        "src": format!("{file}:{line}"),
        "msg": msg,
    });
    if let Some(Value::Object(fields)) = extra {
        if let Value::Object(map) = &mut obj {
            for (k, v) in fields {
                map.insert(k, v);
            }
        }
    }
    let mut writer = LOG_WRITER.lock().unwrap();
    let _ = writeln!(*writer, "{obj}");
}

/// Emit a JSON log line with timestamp and source location.
///
/// # Usage
///
/// ```ignore
/// rlog!(Info, "send: accepted {}", logging::short_id(&message_id));
/// rlog!(Warn, "push: provider returned 429");
/// ```
#[macro_export]
macro_rules! rlog {
    ($level:ident, $($arg:tt)*) => {{
        $crate::logging::emit(
            $crate::logging::Level::$level,
            file!(),
            line!(),
            &format!($($arg)*),
            None,
        );
    }};
}

/// Like [`rlog!`] but with structured fields attached to the line.
///
/// ```ignore
/// rlog_kv!(Warn, json!({"request_id": rid, "code": "FORBIDDEN", "status": 403}),
///          "receipts: non-member write rejected");
/// ```
#[macro_export]
macro_rules! rlog_kv {
    ($level:ident, $extra:expr, $($arg:tt)*) => {{
        $crate::logging::emit(
            $crate::logging::Level::$level,
            file!(),
            line!(),
            &format!($($arg)*),
            Some($extra),
        );
    }};
}
