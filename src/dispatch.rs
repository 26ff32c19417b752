//! Call shapes of the wrapped client and the adapter wiring for each.
//!
//! A traced method is invoked through an argument list that may carry a
//! completion callback, and returns either nothing, a child handle, a future
//! of rows, or a row stream. The instrumentation classifies every call into
//! one of three dispatch shapes (callback, promise, or stream) and wires
//! span completion and context propagation accordingly. Arguments, results,
//! and errors pass through unchanged in every shape.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures::Stream;

use crate::context::TraceContext;
use crate::patch::ClientHandle;
use crate::span::{record_span_exception, set_span_error, Span};

/// A single row produced by the client. Opaque to the instrumentation.
pub type Row = serde_json::Value;

/// A full result set.
pub type Rows = Vec<Row>;

/// Error surfaced by the wrapped client. Observed, never altered.
pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

/// Result delivered to callbacks and promise-style callers.
pub type CallResult = Result<Rows, ClientError>;

/// Completion callback supplied by the caller in callback mode.
pub type RunCallback = Box<dyn FnOnce(CallResult) + Send>;

/// Promise-shaped return value.
pub type RowsFuture = Pin<Box<dyn Future<Output = CallResult> + Send>>;

/// Stream-shaped return value: row items, `Err` items surface operation
/// errors, exhaustion is the terminal signal.
pub type RowStream = Pin<Box<dyn Stream<Item = Result<Row, ClientError>> + Send>>;

/// A method reachable through the patch tables.
pub type MethodFn = Arc<dyn Fn(CallArgs) -> CallOutput + Send + Sync>;

/// Hook run on promise-mode success before the span ends.
pub type SuccessHook = Box<dyn FnOnce(&Span, &Rows) + Send>;

/// A statement handed to a query entry point: either raw SQL text or a
/// request record carrying a `sql` field. Both normalize to the plain text.
#[derive(Debug, Clone)]
pub enum Statement {
    Sql(String),
    Request {
        sql: String,
        params: Option<serde_json::Value>,
    },
}

impl Statement {
    /// The plain statement text, regardless of form.
    pub fn sql(&self) -> &str {
        match self {
            Statement::Sql(sql) => sql,
            Statement::Request { sql, .. } => sql,
        }
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::Sql(sql.to_string())
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::Sql(sql)
    }
}

/// One positional argument of a traced call.
pub enum CallArg {
    /// A statement to execute.
    Statement(Statement),
    /// Opaque call options, passed through untouched.
    Options(serde_json::Value),
    /// A completion callback.
    Callback(RunCallback),
}

impl fmt::Debug for CallArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallArg::Statement(stmt) => f.debug_tuple("Statement").field(stmt).finish(),
            CallArg::Options(opts) => f.debug_tuple("Options").field(opts).finish(),
            CallArg::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// The positional argument list of a traced call.
#[derive(Debug, Default)]
pub struct CallArgs {
    args: Vec<CallArg>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a statement argument.
    pub fn with_statement(mut self, statement: impl Into<Statement>) -> Self {
        self.args.push(CallArg::Statement(statement.into()));
        self
    }

    /// Append an opaque options argument.
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.args.push(CallArg::Options(options));
        self
    }

    /// Append a completion callback argument.
    pub fn with_callback(mut self, callback: impl FnOnce(CallResult) + Send + 'static) -> Self {
        self.args.push(CallArg::Callback(Box::new(callback)));
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// The first statement argument, if any.
    pub fn statement(&self) -> Option<&Statement> {
        self.args.iter().find_map(|arg| match arg {
            CallArg::Statement(stmt) => Some(stmt),
            _ => None,
        })
    }

    /// The first options argument, if any.
    pub fn options(&self) -> Option<&serde_json::Value> {
        self.args.iter().find_map(|arg| match arg {
            CallArg::Options(opts) => Some(opts),
            _ => None,
        })
    }

    /// Position of the first function-typed argument.
    pub fn callback_index(&self) -> Option<usize> {
        self.args
            .iter()
            .position(|arg| matches!(arg, CallArg::Callback(_)))
    }

    /// Take the first callback out of the argument list. Used by client
    /// implementations to deliver their completion signal.
    pub fn take_callback(&mut self) -> Option<RunCallback> {
        let index = self.callback_index()?;
        match self.args.remove(index) {
            CallArg::Callback(callback) => Some(callback),
            _ => None,
        }
    }

    /// Replace the callback at `index` with a wrapped version of itself,
    /// in place. Returns `false` if that position holds no callback.
    pub fn wrap_callback_at(
        &mut self,
        index: usize,
        wrap: impl FnOnce(RunCallback) -> RunCallback,
    ) -> bool {
        let Some(CallArg::Callback(slot)) = self.args.get_mut(index) else {
            return false;
        };
        let original = std::mem::replace(slot, Box::new(|_| {}));
        *slot = wrap(original);
        true
    }
}

/// What a traced method returned.
pub enum CallOutput {
    /// Nothing: completion arrives through a callback argument, or the call
    /// finished synchronously.
    Unit,
    /// A child client object produced by a factory operation.
    Handle(ClientHandle),
    /// A promise-shaped result.
    Rows(RowsFuture),
    /// A stream-shaped result.
    Stream(RowStream),
}

impl fmt::Debug for CallOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOutput::Unit => f.write_str("Unit"),
            CallOutput::Handle(_) => f.write_str("Handle"),
            CallOutput::Rows(_) => f.write_str("Rows"),
            CallOutput::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// The calling convention of one traced invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchShape {
    /// Completion arrives through the callback at this argument position.
    Callback(usize),
    /// Completion arrives when the returned future settles.
    Promise,
    /// Completion arrives when the returned stream ends.
    Stream,
}

impl DispatchShape {
    /// Classify from the argument list: a callback argument, wherever it
    /// sits, decides the shape before the method ever runs.
    pub fn from_args(args: &CallArgs) -> Option<Self> {
        args.callback_index().map(DispatchShape::Callback)
    }

    /// Classify from the return value, for calls with no callback argument.
    pub fn from_output(output: &CallOutput) -> Option<Self> {
        match output {
            CallOutput::Rows(_) => Some(DispatchShape::Promise),
            CallOutput::Stream(_) => Some(DispatchShape::Stream),
            CallOutput::Unit | CallOutput::Handle(_) => None,
        }
    }
}

/// Callback-mode wiring: finalize the span, then re-enter the caller's
/// context before the original callback sees the unmodified result.
pub(crate) fn wrap_callback(span: Span, parent: TraceContext, original: RunCallback) -> RunCallback {
    Box::new(move |result: CallResult| {
        set_span_error(&span, result.as_ref().err());
        record_span_exception(&span, result.as_ref().err());
        span.end();
        parent.scope(move || original(result));
    })
}

/// Promise-mode wiring: purely observational. The returned future settles
/// with exactly the inner future's value, after the span has ended.
pub(crate) fn wrap_future(span: Span, fut: RowsFuture, on_success: Option<SuccessHook>) -> RowsFuture {
    Box::pin(async move {
        let result = fut.await;
        match &result {
            Ok(rows) => {
                if let Some(hook) = on_success {
                    hook(&span, rows);
                }
            }
            Err(err) => {
                set_span_error(&span, Some(err));
                record_span_exception(&span, Some(err));
            }
        }
        span.end();
        result
    })
}

/// Stream-mode wiring: `Err` items mark the span errored without ending it,
/// exhaustion ends it, and emission is re-bound to the caller's context so
/// consumers never inherit the span as ambient state.
pub(crate) fn wrap_stream(span: Span, parent: &TraceContext, stream: RowStream) -> RowStream {
    let observed = SpanObserverStream {
        inner: stream,
        span: Some(span),
    };
    Box::pin(parent.bind_stream(observed))
}

struct SpanObserverStream {
    inner: RowStream,
    span: Option<Span>,
}

impl Stream for SpanObserverStream {
    type Item = Result<Row, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Err(err))) => {
                if let Some(span) = &this.span {
                    set_span_error(span, Some(&err));
                    record_span_exception(span, Some(&err));
                }
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if let Some(span) = this.span.take() {
                    span.end();
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
