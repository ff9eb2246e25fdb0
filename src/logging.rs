//! Structured logging with request correlation.
//!
//! A [`Logger`] is a short-lived, per-call handle. Callers annotate it with
//! key/value pairs and emit one or more records; every record carries the
//! stan and user id read from the [`RequestContext`]. Annotations whose key is
//! an *index field* become structured fields of the record, all others are
//! folded into the message text as `key=value` tokens.
//!
//! Records go to a [`LogSink`]. The default [`TracingSink`] turns each record
//! into a single `tracing` event.

use serde::ser::{Serialize, Serializer};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::context::RequestContext;

pub const TIME_SPENT_SECONDS: &str = "TimeSpentSeconds";
pub const REQUEST_ID: &str = "RequestId";
pub const ERROR: &str = "Error";
pub const ALERT: &str = "Alert";
pub const PANIC: &str = "Panic";
pub const ERROR_DETAIL: &str = "ErrorDetail";
pub const PANIC_DETAIL: &str = "PanicDetail";
pub const CANONICAL: &str = "canonical";

/// Annotation keys that are always emitted as structured fields.
pub const INDEX_FIELDS: [&str; 5] = [TIME_SPENT_SECONDS, REQUEST_ID, ERROR, PANIC, ALERT];

/// Severity of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// Value of an annotation or structured field.
#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
    Null,
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    /// Rendered error, printed without quotes
    Error(String),
    Json(serde_json::Value),
}

impl LogValue {
    pub fn error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        LogValue::Error(err.to_string())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            LogValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            LogValue::Float(f) => Some(*f),
            LogValue::Int(i) => Some(*i as f64),
            LogValue::UInt(u) => Some(*u as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            LogValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for LogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogValue::Null => write!(f, "<nil>"),
            LogValue::Str(s) => write!(f, "{}", s),
            LogValue::Int(i) => write!(f, "{}", i),
            LogValue::UInt(u) => write!(f, "{}", u),
            LogValue::Float(v) => write!(f, "{}", v),
            LogValue::Bool(b) => write!(f, "{}", b),
            LogValue::Error(e) => write!(f, "{}", e),
            LogValue::Json(v) => write!(f, "{}", v),
        }
    }
}

impl Serialize for LogValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LogValue::Null => serializer.serialize_unit(),
            LogValue::Str(s) | LogValue::Error(s) => serializer.serialize_str(s),
            LogValue::Int(i) => serializer.serialize_i64(*i),
            LogValue::UInt(u) => serializer.serialize_u64(*u),
            LogValue::Float(v) => serializer.serialize_f64(*v),
            LogValue::Bool(b) => serializer.serialize_bool(*b),
            LogValue::Json(v) => v.serialize(serializer),
        }
    }
}

impl From<&str> for LogValue {
    fn from(v: &str) -> Self {
        LogValue::Str(v.to_string())
    }
}

impl From<String> for LogValue {
    fn from(v: String) -> Self {
        LogValue::Str(v)
    }
}

impl From<&String> for LogValue {
    fn from(v: &String) -> Self {
        LogValue::Str(v.clone())
    }
}

impl From<bool> for LogValue {
    fn from(v: bool) -> Self {
        LogValue::Bool(v)
    }
}

impl From<f64> for LogValue {
    fn from(v: f64) -> Self {
        LogValue::Float(v)
    }
}

impl From<f32> for LogValue {
    fn from(v: f32) -> Self {
        LogValue::Float(v as f64)
    }
}

macro_rules! impl_from_int {
    ($variant:ident, $target:ty, $($ty:ty),*) => {
        $(
            impl From<$ty> for LogValue {
                fn from(v: $ty) -> Self {
                    LogValue::$variant(v as $target)
                }
            }
        )*
    };
}

impl_from_int!(Int, i64, i8, i16, i32, i64, isize);
impl_from_int!(UInt, u64, u8, u16, u32, u64, usize);

impl From<serde_json::Value> for LogValue {
    fn from(v: serde_json::Value) -> Self {
        LogValue::Json(v)
    }
}

impl<T: Into<LogValue>> From<Option<T>> for LogValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(LogValue::Null)
    }
}

/// Insertion-ordered map; setting an existing key replaces its value in place.
#[derive(Debug, Clone, Default)]
pub struct OrderedMap {
    entries: Vec<(String, LogValue)>,
    index: HashMap<String, usize>,
}

impl OrderedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: LogValue) {
        let key = key.into();
        match self.index.get(&key) {
            Some(&pos) => self.entries[pos].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&LogValue> {
        self.index.get(key).map(|&pos| &self.entries[pos].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LogValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// One emitted log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: Level,
    pub logger: String,
    pub message: String,
    /// Structured fields in emission order
    pub fields: Vec<(String, LogValue)>,
}

impl LogRecord {
    pub fn field(&self, key: &str) -> Option<&LogValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// Destination of log records.
pub trait LogSink: Send + Sync {
    fn emit(&self, record: LogRecord);
}

/// Emits every record as one `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

macro_rules! emit_event {
    ($level:expr, $($fields:tt)*) => {
        match $level {
            Level::Debug => tracing::debug!($($fields)*),
            Level::Info => tracing::info!($($fields)*),
            Level::Warn => tracing::warn!($($fields)*),
            Level::Error => tracing::error!($($fields)*),
            Level::Fatal => tracing::error!(fatal = true, $($fields)*),
        }
    };
}

impl LogSink for TracingSink {
    fn emit(&self, record: LogRecord) {
        let mut stan = None;
        let mut user_id = None;
        let mut spent = None;
        let mut request_id = None;
        let mut error = None;
        let mut panic = None;
        let mut alert = None;
        let mut canonical = None;
        let mut rest = serde_json::Map::new();

        for (key, value) in &record.fields {
            match (key.as_str(), value) {
                ("stan", v) => stan = Some(v.to_string()),
                ("UserID", v) => user_id = Some(v.to_string()),
                (TIME_SPENT_SECONDS, v) if v.as_f64().is_some() => spent = v.as_f64(),
                (REQUEST_ID, v) => request_id = Some(v.to_string()),
                (ERROR, LogValue::Bool(b)) => error = Some(*b),
                (PANIC, LogValue::Bool(b)) => panic = Some(*b),
                (ALERT, LogValue::Bool(b)) => alert = Some(*b),
                (CANONICAL, LogValue::Bool(b)) => canonical = Some(*b),
                (other, v) => {
                    let json = serde_json::to_value(v).unwrap_or(serde_json::Value::Null);
                    rest.insert(other.to_string(), json);
                }
            }
        }
        let fields = (!rest.is_empty()).then(|| serde_json::Value::Object(rest).to_string());

        emit_event!(
            record.level,
            logger = record.logger.as_str(),
            stan = stan.as_deref().unwrap_or_default(),
            UserID = user_id.as_deref().unwrap_or_default(),
            TimeSpentSeconds = spent,
            RequestId = request_id.as_deref(),
            Error = error,
            Panic = panic,
            Alert = alert,
            canonical = canonical,
            fields = fields.as_deref(),
            "{}",
            record.message
        );
    }
}

/// Sink that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: LogRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

/// Panic captured by a recovery boundary and handed back by [`Logger::canonical`].
pub struct PanicPayload(Box<dyn Any + Send + 'static>);

impl PanicPayload {
    pub fn new(payload: Box<dyn Any + Send + 'static>) -> Self {
        Self(payload)
    }

    pub fn message(&self) -> &str {
        if let Some(s) = self.0.downcast_ref::<&'static str>() {
            s
        } else if let Some(s) = self.0.downcast_ref::<String>() {
            s
        } else {
            "Box<dyn Any>"
        }
    }

    /// Continue unwinding with the original payload.
    pub fn resume(self) -> ! {
        std::panic::resume_unwind(self.0)
    }

    pub fn into_inner(self) -> Box<dyn Any + Send + 'static> {
        self.0
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PanicPayload").field(&self.message()).finish()
    }
}

/// Create a logger bound to `name` that writes through [`TracingSink`].
pub fn get_logger(name: &str) -> Logger {
    Logger::new(name)
}

/// Per-call logging handle.
pub struct Logger {
    name: String,
    info: OrderedMap,
    start: Instant,
    sink: Arc<dyn LogSink>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("name", &self.name)
            .field("info", &self.info)
            .finish()
    }
}

impl Logger {
    pub fn new(name: &str) -> Self {
        Self::with_sink(name, Arc::new(TracingSink))
    }

    pub fn with_sink(name: &str, sink: Arc<dyn LogSink>) -> Self {
        Self {
            name: name.to_string(),
            info: OrderedMap::new(),
            start: Instant::now(),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accumulated annotations.
    pub fn annotations(&self) -> &OrderedMap {
        &self.info
    }

    /// Annotate the handle; dots are stripped from the key.
    pub fn add(&mut self, key: &str, value: impl Into<LogValue>) {
        self.info.set(sanitize_key(key), value.into());
    }

    /// Annotate from a flat `key, value, key, value, ...` list.
    ///
    /// An empty or odd-length list, or one with a non-string key, is ignored.
    pub fn add_pairs(&mut self, keys_and_values: &[LogValue]) {
        if keys_and_values.is_empty() || keys_and_values.len() % 2 != 0 {
            return;
        }
        if keys_and_values.chunks(2).any(|pair| pair[0].as_str().is_none()) {
            return;
        }
        for pair in keys_and_values.chunks(2) {
            if let Some(key) = pair[0].as_str() {
                self.info.set(sanitize_key(key), pair[1].clone());
            }
        }
    }

    pub fn debugw(&self, ctx: &RequestContext, msg: &str, extra: &[(&str, LogValue)]) {
        self.emit(Level::Debug, ctx, msg, None, extra, false);
    }

    pub fn infow(&self, ctx: &RequestContext, msg: &str, extra: &[(&str, LogValue)]) {
        self.emit(Level::Info, ctx, msg, None, extra, false);
    }

    pub fn warnw(&self, ctx: &RequestContext, msg: &str, extra: &[(&str, LogValue)]) {
        self.emit(Level::Warn, ctx, msg, None, extra, false);
    }

    /// Warn with an error; the error detail stays on the handle for later records.
    pub fn warne(
        &mut self,
        ctx: &RequestContext,
        msg: &str,
        err: &dyn std::error::Error,
        extra: &[(&str, LogValue)],
    ) {
        self.info.set(ERROR_DETAIL, LogValue::error(err));
        self.emit(Level::Warn, ctx, msg, None, extra, false);
    }

    pub fn errorw(&self, ctx: &RequestContext, msg: &str, extra: &[(&str, LogValue)]) {
        self.emit(Level::Error, ctx, msg, None, extra, false);
    }

    /// Error with an error detail that applies to this record only.
    pub fn errore(
        &self,
        ctx: &RequestContext,
        msg: &str,
        err: &dyn std::error::Error,
        extra: &[(&str, LogValue)],
    ) {
        let local = error_detail(err);
        self.emit(Level::Error, ctx, msg, Some(&local), extra, false);
    }

    /// Log at fatal severity and terminate the process.
    pub fn fatalw(&self, ctx: &RequestContext, msg: &str, extra: &[(&str, LogValue)]) -> ! {
        self.emit(Level::Fatal, ctx, msg, None, extra, false);
        std::process::exit(1)
    }

    pub fn fatale(
        &self,
        ctx: &RequestContext,
        msg: &str,
        err: &dyn std::error::Error,
        extra: &[(&str, LogValue)],
    ) -> ! {
        let local = error_detail(err);
        self.emit(Level::Fatal, ctx, msg, Some(&local), extra, false);
        std::process::exit(1)
    }

    /// Error-severity record flagged as an alert.
    pub fn alertw(&self, ctx: &RequestContext, msg: &str, extra: &[(&str, LogValue)]) {
        let mut local = OrderedMap::new();
        local.set(ALERT, LogValue::Bool(true));
        self.emit(Level::Error, ctx, msg, Some(&local), extra, false);
    }

    pub fn alerte(
        &self,
        ctx: &RequestContext,
        msg: &str,
        err: &dyn std::error::Error,
        extra: &[(&str, LogValue)],
    ) {
        let mut local = OrderedMap::new();
        local.set(ALERT, LogValue::Bool(true));
        local.set(ERROR_DETAIL, LogValue::error(err));
        self.emit(Level::Error, ctx, msg, Some(&local), extra, false);
    }

    /// Emit the terminal record of a unit of work.
    ///
    /// The record carries the time spent since the handle was created and the
    /// `Error`/`Panic` flags. A recovered panic is returned as `Err` so the
    /// caller can resume unwinding after the line is written.
    #[must_use = "a recovered panic must be resumed by the caller"]
    pub fn canonical(
        &self,
        ctx: &RequestContext,
        msg: &str,
        err: Option<&dyn std::error::Error>,
        recovered: Option<PanicPayload>,
    ) -> Result<(), PanicPayload> {
        let mut local = OrderedMap::new();
        local.set(
            TIME_SPENT_SECONDS,
            LogValue::Float(self.start.elapsed().as_secs_f64()),
        );
        if let Some(err) = err {
            local.set(ERROR, LogValue::Bool(true));
            local.set(ERROR_DETAIL, LogValue::error(err));
        }
        if let Some(payload) = &recovered {
            local.set(PANIC, LogValue::Bool(true));
            local.set(PANIC_DETAIL, LogValue::Str(payload.message().to_string()));
        }
        self.emit(Level::Info, ctx, msg, Some(&local), &[], true);

        match recovered {
            Some(payload) => Err(payload),
            None => Ok(()),
        }
    }

    fn emit(
        &self,
        level: Level,
        ctx: &RequestContext,
        msg: &str,
        local: Option<&OrderedMap>,
        extra: &[(&str, LogValue)],
        canonical: bool,
    ) {
        let mut maps = vec![&self.info];
        maps.extend(local);

        let (message, mut fields) = format_info(msg, ctx.stan(), ctx.user_id(), &maps);
        if canonical {
            fields.insert(0, (CANONICAL.to_string(), LogValue::Bool(true)));
        }
        for (key, value) in extra {
            fields.push((sanitize_key(key), LogValue::Str(value.to_string())));
        }

        self.sink.emit(LogRecord {
            level,
            logger: self.name.clone(),
            message,
            fields,
        });
    }
}

fn error_detail(err: &dyn std::error::Error) -> OrderedMap {
    let mut local = OrderedMap::new();
    local.set(ERROR_DETAIL, LogValue::error(err));
    local
}

fn sanitize_key(key: &str) -> String {
    key.replace('.', "")
}

/// Split annotations into the message text and the structured fields.
fn format_info(
    msg: &str,
    stan: &str,
    user_id: &str,
    maps: &[&OrderedMap],
) -> (String, Vec<(String, LogValue)>) {
    let mut fields = vec![
        ("stan".to_string(), LogValue::Str(stan.to_string())),
        ("UserID".to_string(), LogValue::Str(user_id.to_string())),
    ];
    let mut message = msg.to_string();

    for map in maps {
        for (key, value) in map.iter() {
            let name = sanitize_key(key);
            if INDEX_FIELDS.contains(&key) {
                fields.push((name, value.clone()));
                continue;
            }
            let _ = match value {
                LogValue::Str(s) => write!(message, " {}='{}'", name, s),
                other => write!(message, " {}={}", name, other),
            };
        }
    }

    (message, fields)
}

/// `io::Write` adapter that logs every write as a debug record.
pub struct LogWriter {
    logger: Logger,
}

impl LogWriter {
    pub fn new(name: &str) -> Self {
        Self {
            logger: Logger::new(name),
        }
    }

    pub fn with_logger(logger: Logger) -> Self {
        Self { logger }
    }
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.logger
            .debugw(&RequestContext::new(), text.trim_end_matches('\n'), &[]);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
