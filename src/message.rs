//! Payload builder: turns a log call into a canonical GELF record.
//!
//! A log call carries a short message in one of three shapes (plain text,
//! a JSON record, or an error value with a stack trace), an optional full
//! message, optional additional fields and an optional timestamp. The
//! builder normalizes these into one [`CanonicalMessage`] and serializes it
//! to UTF-8 JSON.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::GelfError;

/// GELF format version written on every record.
pub const GELF_VERSION: &str = "1.1";

/// Syslog severity levels, as used by the GELF `level` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl Level {
    /// Numeric syslog code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Emergency => write!(f, "emergency"),
            Level::Alert => write!(f, "alert"),
            Level::Critical => write!(f, "critical"),
            Level::Error => write!(f, "error"),
            Level::Warning => write!(f, "warning"),
            Level::Notice => write!(f, "notice"),
            Level::Info => write!(f, "info"),
            Level::Debug => write!(f, "debug"),
        }
    }
}

/// An error-like value: a message plus a textual stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub message: String,
    pub stack: String,
}

impl ErrorValue {
    pub fn new(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: stack.into(),
        }
    }

    /// Capture an error together with the current backtrace.
    pub fn capture<E: std::fmt::Display + ?Sized>(err: &E) -> Self {
        let message = err.to_string();
        let backtrace = std::backtrace::Backtrace::force_capture();
        Self {
            stack: format!("{}\n{}", message, backtrace),
            message,
        }
    }

    /// File and line of the first frame in the stack trace that carries a
    /// source location.
    pub fn origin(&self) -> Option<(String, u32)> {
        self.stack.lines().find_map(parse_frame_location)
    }
}

/// Parse a `file:line[:col]` location out of one stack trace line.
///
/// Accepts both `at fn (file:line:col)` and bare `at file:line:col` forms.
fn parse_frame_location(line: &str) -> Option<(String, u32)> {
    let trimmed = line.trim();
    let trimmed = trimmed.strip_prefix("at ").unwrap_or(trimmed);

    let location = match (trimmed.rfind('('), trimmed.rfind(')')) {
        (Some(open), Some(close)) if open < close => &trimmed[open + 1..close],
        _ => trimmed,
    };

    let (rest, last) = location.rsplit_once(':')?;
    let last: u32 = last.trim().parse().ok()?;

    // file:line:col, or file:line when there is no column
    let (file, line_no) = match rest.rsplit_once(':') {
        Some((file, line_no)) => match line_no.trim().parse::<u32>() {
            Ok(line_no) => (file, line_no),
            Err(_) => (rest, last),
        },
        None => (rest, last),
    };

    let file = file.trim();
    if file.is_empty() || file.contains(char::is_whitespace) {
        return None;
    }

    Some((file.to_string(), line_no))
}

/// The shape of a message argument.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Text(String),
    Record(Value),
    Error(ErrorValue),
}

impl MessageBody {
    /// Fields a record contributes when used as additional fields.
    ///
    /// Objects contribute their entries, arrays their elements keyed by
    /// index. Scalars contribute nothing.
    fn record_fields(&self) -> Option<Vec<(String, Value)>> {
        match self {
            MessageBody::Record(Value::Object(map)) => {
                Some(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
            MessageBody::Record(Value::Array(items)) => Some(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), v.clone()))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Value written to `full_message` when this body is the full message.
    fn to_full_value(&self) -> Value {
        match self {
            MessageBody::Text(text) => Value::String(text.clone()),
            MessageBody::Record(value) => value.clone(),
            MessageBody::Error(err) => Value::String(err.stack.clone()),
        }
    }
}

impl From<&str> for MessageBody {
    fn from(text: &str) -> Self {
        MessageBody::Text(text.to_string())
    }
}

impl From<String> for MessageBody {
    fn from(text: String) -> Self {
        MessageBody::Text(text)
    }
}

impl From<Value> for MessageBody {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => MessageBody::Text(text),
            other => MessageBody::Record(other),
        }
    }
}

impl From<ErrorValue> for MessageBody {
    fn from(err: ErrorValue) -> Self {
        MessageBody::Error(err)
    }
}

/// A single log call.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: Level,
    pub short_message: MessageBody,
    pub full_message: Option<MessageBody>,
    pub additional_fields: Option<Map<String, Value>>,
    /// Defaults to the time the record is built
    pub timestamp: Option<DateTime<Utc>>,
}

impl LogEvent {
    /// Create an `Info` event with the given short message.
    pub fn new(short_message: impl Into<MessageBody>) -> Self {
        Self {
            level: Level::Info,
            short_message: short_message.into(),
            full_message: None,
            additional_fields: None,
            timestamp: None,
        }
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn full_message(mut self, full_message: impl Into<MessageBody>) -> Self {
        self.full_message = Some(full_message.into());
        self
    }

    /// Add one additional field.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.additional_fields
            .get_or_insert_with(Map::new)
            .insert(name.into(), value.into());
        self
    }

    /// Replace the additional fields.
    pub fn fields(mut self, fields: Map<String, Value>) -> Self {
        self.additional_fields = Some(fields);
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl From<&str> for LogEvent {
    fn from(text: &str) -> Self {
        LogEvent::new(text)
    }
}

impl From<String> for LogEvent {
    fn from(text: String) -> Self {
        LogEvent::new(text)
    }
}

impl From<Value> for LogEvent {
    fn from(value: Value) -> Self {
        LogEvent::new(value)
    }
}

impl From<ErrorValue> for LogEvent {
    fn from(err: ErrorValue) -> Self {
        LogEvent::new(err)
    }
}

impl From<MessageBody> for LogEvent {
    fn from(body: MessageBody) -> Self {
        LogEvent::new(body)
    }
}

/// The GELF record as it goes on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalMessage {
    pub version: &'static str,
    pub host: String,
    pub facility: String,
    /// Seconds since the epoch, millisecond precision
    pub timestamp: f64,
    pub level: u8,
    pub short_message: String,
    pub full_message: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Additional fields, already underscore-prefixed
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CanonicalMessage {
    /// Serialize to UTF-8 JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>, GelfError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Builds canonical records stamped with a fixed host and facility.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    host: String,
    facility: String,
}

impl PayloadBuilder {
    pub fn new(host: impl Into<String>, facility: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            facility: facility.into(),
        }
    }

    /// Normalize a log call into a canonical record.
    ///
    /// The first matching rule wins:
    /// 1. text short message, record full message, no additional fields:
    ///    the text is used for both messages and the record becomes the
    ///    additional fields
    /// 2. text short message: full message defaults to the short message
    ///    when absent or empty
    /// 3. error short message: message and stack trace, file and line
    ///    from the first stack frame, and a record full message becomes the
    ///    additional fields
    /// 4. record short message: its JSON text is used for both messages
    pub fn build(&self, event: LogEvent) -> CanonicalMessage {
        let LogEvent {
            level,
            short_message,
            full_message,
            additional_fields,
            timestamp,
        } = event;

        let timestamp = timestamp.unwrap_or_else(Utc::now);
        let mut file = None;
        let mut line = None;

        let fields_absent = additional_fields.is_none();
        let mut extra: Vec<(String, Value)> = additional_fields
            .map(|fields| fields.into_iter().collect())
            .unwrap_or_default();

        let (short, full) = match short_message {
            MessageBody::Text(text)
                if fields_absent
                    && matches!(
                        full_message,
                        Some(MessageBody::Record(
                            Value::Object(_) | Value::Array(_) | Value::Null
                        ))
                    ) =>
            {
                if let Some(fields) = full_message.as_ref().and_then(MessageBody::record_fields) {
                    extra = fields;
                }
                (text.clone(), Value::String(text))
            }
            MessageBody::Text(text) => {
                let full = match &full_message {
                    Some(MessageBody::Text(f)) if f.is_empty() => Value::String(text.clone()),
                    Some(body) => body.to_full_value(),
                    None => Value::String(text.clone()),
                };
                (text, full)
            }
            MessageBody::Error(err) => {
                if let Some((origin_file, origin_line)) = err.origin() {
                    file = Some(origin_file);
                    line = Some(origin_line);
                }
                if let Some(fields) = full_message.as_ref().and_then(MessageBody::record_fields) {
                    extra = fields;
                }
                (err.message, Value::String(err.stack))
            }
            MessageBody::Record(value) => {
                let text = value.to_string();
                (text.clone(), Value::String(text))
            }
        };

        let mut fields = Map::new();
        for (name, value) in extra {
            fields.insert(format!("_{}", name), value);
        }

        // `_id` is reserved by GELF receivers
        if let Some(id) = fields.remove("_id") {
            fields.insert("__id".to_string(), id);
        }

        CanonicalMessage {
            version: GELF_VERSION,
            host: self.host.clone(),
            facility: self.facility.clone(),
            timestamp: timestamp.timestamp_millis() as f64 / 1000.0,
            level: level.code(),
            short_message: short,
            full_message: full,
            file,
            line,
            fields,
        }
    }

    /// Normalize and serialize a log call.
    pub fn to_bytes(&self, event: LogEvent) -> Result<Vec<u8>, GelfError> {
        self.build(event).to_bytes()
    }
}
