//! Span model, tracer, and exporter seam.
//!
//! Spans are cheap-clone shared handles so the dispatch adapter can hold one
//! across callback, future, and stream completion paths. Ending a span is a
//! one-shot transition: the first `end()` freezes the data and hands a
//! [`FinishedSpan`] to the exporter, later mutations are ignored.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Kind of span, indicating its role in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpanKind {
    /// A client-side span (outgoing request). Every span this crate creates
    /// is a client span.
    #[default]
    Client,
    /// An internal span.
    Internal,
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpanKind::Client => write!(f, "client"),
            SpanKind::Internal => write!(f, "internal"),
        }
    }
}

/// Status of a span.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SpanStatus {
    /// No terminal status was recorded. Successful operations leave their
    /// status unset.
    #[default]
    Unset,
    /// Span completed successfully.
    Ok,
    /// Span completed with an error.
    Error(String),
}

impl SpanStatus {
    /// Returns `true` if the span status is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, SpanStatus::Error(_))
    }

    /// Returns the error message if this is an error status.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            SpanStatus::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

/// A value that can be attached to a span as an attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum SpanValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl SpanValue {
    /// Returns the value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SpanValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            SpanValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for SpanValue {
    fn from(s: &str) -> Self {
        SpanValue::String(s.to_string())
    }
}

impl From<String> for SpanValue {
    fn from(s: String) -> Self {
        SpanValue::String(s)
    }
}

impl From<i64> for SpanValue {
    fn from(i: i64) -> Self {
        SpanValue::Int(i)
    }
}

impl From<usize> for SpanValue {
    fn from(i: usize) -> Self {
        SpanValue::Int(i as i64)
    }
}

impl From<bool> for SpanValue {
    fn from(b: bool) -> Self {
        SpanValue::Bool(b)
    }
}

/// Full exception detail recorded on a span, distinct from its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRecord {
    /// The error's display form.
    pub message: String,
    /// The error's debug form.
    pub detail: String,
}

struct SpanData {
    name: String,
    kind: SpanKind,
    status: SpanStatus,
    attributes: Vec<(String, SpanValue)>,
    exceptions: Vec<ExceptionRecord>,
    start: Instant,
    ended: bool,
}

/// An open span handle for one traced operation instance.
///
/// Clones share the same underlying span; the adapter that created a span is
/// its only owner in practice, but the handle itself is thread-safe.
#[derive(Clone)]
pub struct Span {
    data: Arc<Mutex<SpanData>>,
    exporter: Arc<dyn SpanExporter>,
}

impl Span {
    fn new(name: String, kind: SpanKind, exporter: Arc<dyn SpanExporter>) -> Self {
        Self {
            data: Arc::new(Mutex::new(SpanData {
                name,
                kind,
                status: SpanStatus::Unset,
                attributes: Vec::new(),
                exceptions: Vec::new(),
                start: Instant::now(),
                ended: false,
            })),
            exporter,
        }
    }

    /// Returns the span name.
    pub fn name(&self) -> String {
        self.data.lock().name.clone()
    }

    /// Set an attribute on the span. Ignored after the span has ended.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<SpanValue>) {
        let mut data = self.data.lock();
        if data.ended {
            return;
        }
        data.attributes.push((key.into(), value.into()));
    }

    /// Set the span status. Ignored after the span has ended.
    pub fn set_status(&self, status: SpanStatus) {
        let mut data = self.data.lock();
        if data.ended {
            return;
        }
        data.status = status;
    }

    /// Attach full exception detail to the span, separate from its status.
    pub fn record_exception<E: fmt::Display + fmt::Debug + ?Sized>(&self, err: &E) {
        let mut data = self.data.lock();
        if data.ended {
            return;
        }
        data.exceptions.push(ExceptionRecord {
            message: err.to_string(),
            detail: format!("{err:?}"),
        });
    }

    /// End the span and hand it to the exporter.
    ///
    /// The first call wins; subsequent calls (and all later mutation) are
    /// ignored. A span that is never ended is never exported.
    pub fn end(&self) {
        let finished = {
            let mut data = self.data.lock();
            if data.ended {
                return;
            }
            data.ended = true;
            FinishedSpan {
                name: data.name.clone(),
                kind: data.kind,
                status: data.status.clone(),
                attributes: std::mem::take(&mut data.attributes),
                exceptions: std::mem::take(&mut data.exceptions),
                duration: data.start.elapsed(),
            }
        };
        self.exporter.export(finished);
    }

    /// Returns `true` if the span has not yet ended.
    pub fn is_recording(&self) -> bool {
        !self.data.lock().ended
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.lock();
        f.debug_struct("Span")
            .field("name", &data.name)
            .field("ended", &data.ended)
            .finish()
    }
}

/// A closed span with its final timing, status, and annotations.
#[derive(Debug, Clone)]
pub struct FinishedSpan {
    name: String,
    kind: SpanKind,
    status: SpanStatus,
    attributes: Vec<(String, SpanValue)>,
    exceptions: Vec<ExceptionRecord>,
    duration: Duration,
}

impl FinishedSpan {
    /// Returns the span name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the span kind.
    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    /// Returns the span status.
    pub fn status(&self) -> &SpanStatus {
        &self.status
    }

    /// Returns the span attributes in recording order.
    pub fn attributes(&self) -> &[(String, SpanValue)] {
        &self.attributes
    }

    /// Returns the first attribute recorded under `key`, if any.
    pub fn attribute(&self, key: &str) -> Option<&SpanValue> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Returns the recorded exceptions.
    pub fn exceptions(&self) -> &[ExceptionRecord] {
        &self.exceptions
    }

    /// Returns the span duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// Receives spans as they end. The exporter is an external collaborator; this
/// crate only ships the two trivial implementations below.
pub trait SpanExporter: Send + Sync {
    fn export(&self, span: FinishedSpan);
}

/// Collects finished spans in memory, for tests and demos.
#[derive(Default)]
pub struct InMemoryExporter {
    spans: Mutex<Vec<FinishedSpan>>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the finished spans seen so far.
    pub fn finished_spans(&self) -> Vec<FinishedSpan> {
        self.spans.lock().clone()
    }

    /// Drops all collected spans.
    pub fn reset(&self) {
        self.spans.lock().clear();
    }
}

impl SpanExporter for InMemoryExporter {
    fn export(&self, span: FinishedSpan) {
        self.spans.lock().push(span);
    }
}

/// Emits finished spans as `tracing` debug events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogExporter;

impl SpanExporter for LogExporter {
    fn export(&self, span: FinishedSpan) {
        tracing::debug!(
            name = span.name(),
            kind = %span.kind(),
            status = ?span.status(),
            duration_ms = span.duration().as_millis() as u64,
            "span finished"
        );
    }
}

/// Creates spans bound to one exporter.
#[derive(Clone)]
pub struct Tracer {
    exporter: Arc<dyn SpanExporter>,
}

impl Tracer {
    pub fn new(exporter: Arc<dyn SpanExporter>) -> Self {
        Self { exporter }
    }

    /// Start a new open span.
    pub fn start_span(&self, name: impl Into<String>, kind: SpanKind) -> Span {
        Span::new(name.into(), kind, self.exporter.clone())
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer").finish_non_exhaustive()
    }
}

/// Sets `err`, if present, onto the span as status code error with the
/// message of the error's display form. Does nothing when `err` is `None`.
pub fn set_span_error<E: fmt::Display>(span: &Span, err: Option<&E>) {
    if let Some(err) = err {
        span.set_status(SpanStatus::Error(err.to_string()));
    }
}

/// Records `err`, if present, as an exception on the span. Does nothing when
/// `err` is `None`.
pub fn record_span_exception<E: fmt::Display + fmt::Debug>(span: &Span, err: Option<&E>) {
    if let Some(err) = err {
        span.record_exception(err);
    }
}
