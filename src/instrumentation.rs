//! The instrumentation entry point: installs trace wrappers on a client
//! module's entry points and keeps them honest.
//!
//! Per intercepted call the flow is: enabled check → span factory → dispatch
//! adapter → error annotation on completion → caller-context restore. A
//! disabled instrumentation removes its wrapper on the next call through it
//! and delegates straight to the original from then on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::TracingConfig;
use crate::context::TraceContext;
use crate::dispatch::{
    wrap_callback, wrap_future, wrap_stream, CallArgs, CallOutput, DispatchShape, MethodFn, Rows,
    Statement, SuccessHook,
};
use crate::parser;
use crate::patch::{ClientHandle, PatchError, PatchRegistry, PatchTarget};
use crate::semconv;
use crate::span::{Span, SpanKind, Tracer};

/// Prefix of every span name this instrumentation creates.
pub const COMPONENT_PREFIX: &str = "CloudDb";

/// Value recorded under `db.system` on every span.
pub const DB_SYSTEM_NAME: &str = "clouddb";

/// Operation-producing entry points: calls that return child client handles.
pub const FACTORY_METHODS: &[&str] = &["Instance.database", "Instance.createDatabase"];

/// The terminal query-execution entry point.
pub const QUERY_METHOD: &str = "Database.run";

/// Methods re-wrapped on child handles returned by factory calls.
const CHILD_METHODS: &[&str] = &[QUERY_METHOD];

/// Call-specific attributes handed to the span factory.
#[derive(Debug, Default)]
pub struct SpanOptions {
    /// Table the operation targets, when known.
    pub table_name: Option<String>,
    /// The statement being executed. Its text is only attached to the span
    /// when extended tracing resolves to enabled.
    pub statement: Option<Statement>,
}

struct State {
    config: TracingConfig,
    tracer: Tracer,
    enabled: AtomicBool,
}

impl State {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Span factory: a client span named `CloudDb.<operation>` with the
    /// call's attributes, statement text gated by the extended-tracing
    /// policy.
    fn start_operation_span(&self, operation: &str, opts: &SpanOptions) -> Span {
        let span = self
            .tracer
            .start_span(format!("{COMPONENT_PREFIX}.{operation}"), SpanKind::Client);
        span.set_attribute(semconv::DB_SYSTEM, DB_SYSTEM_NAME);

        if let Some(table) = &opts.table_name {
            span.set_attribute(semconv::DB_SQL_TABLE, table.clone());
        }
        if let Some(statement) = &opts.statement {
            span.set_attribute(
                semconv::DB_OPERATION,
                parser::parse_operation(statement.sql()).as_str(),
            );
            if self.config.capture_statements() {
                span.set_attribute(semconv::DB_STATEMENT, statement.sql());
            }
        }
        span
    }

    fn row_count_hook(&self) -> Option<SuccessHook> {
        self.config.record_row_counts.then(|| {
            Box::new(|span: &Span, rows: &Rows| {
                span.set_attribute(semconv::DB_ROWS_RETURNED, rows.len());
            }) as SuccessHook
        })
    }
}

/// Tracing instrumentation for a managed cloud database client module.
///
/// Cheap to clone; clones share the enabled flag and configuration.
///
/// # Example
///
/// ```rust,ignore
/// use clouddb_tracing::prelude::*;
///
/// let tracer = Tracer::new(exporter);
/// let instrumentation =
///     CloudDbInstrumentation::new(TracingConfig::from_env(), tracer);
/// instrumentation.install(&registry, "clouddb")?;
/// ```
#[derive(Clone)]
pub struct CloudDbInstrumentation {
    state: Arc<State>,
}

impl CloudDbInstrumentation {
    /// Create an instrumentation. It starts enabled; the process-wide
    /// extended-tracing opt-in is whatever `config` carries; sample it via
    /// [`TracingConfig::from_env`] if the environment should decide.
    pub fn new(config: TracingConfig, tracer: Tracer) -> Self {
        Self {
            state: Arc::new(State {
                config,
                tracer,
                enabled: AtomicBool::new(true),
            }),
        }
    }

    /// Turn tracing on for subsequent calls through still-installed patches.
    pub fn enable(&self) {
        self.state.enabled.store(true, Ordering::Relaxed);
        tracing::debug!("instrumentation enabled");
    }

    /// Turn tracing off. Each installed patch removes itself the next time a
    /// call passes through it; re-enabling later requires a fresh
    /// [`CloudDbInstrumentation::install`].
    pub fn disable(&self) {
        self.state.enabled.store(false, Ordering::Relaxed);
        tracing::debug!("instrumentation disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled()
    }

    /// Wrap the module's factory and query entry points. Already-wrapped
    /// targets are left alone.
    pub fn install(&self, registry: &PatchRegistry, module: &str) -> Result<(), PatchError> {
        for path in FACTORY_METHODS.iter().chain(std::iter::once(&QUERY_METHOD)) {
            install_target(&self.state, registry.locate(module, path)?)?;
        }
        Ok(())
    }

    /// Remove exactly the wrappers [`CloudDbInstrumentation::install`] put in
    /// place, restoring direct delegation to the originals.
    pub fn uninstall(&self, registry: &PatchRegistry, module: &str) -> Result<(), PatchError> {
        for path in FACTORY_METHODS.iter().chain(std::iter::once(&QUERY_METHOD)) {
            let target = registry.locate(module, path)?;
            if target.restore() {
                tracing::debug!(path, "trace wrapper removed");
            }
        }
        Ok(())
    }

    /// Start a span for a named operation, applying the extended-tracing
    /// policy to its statement attribute.
    pub fn start_operation_span(&self, operation: &str, opts: &SpanOptions) -> Span {
        self.state.start_operation_span(operation, opts)
    }
}

impl std::fmt::Debug for CloudDbInstrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudDbInstrumentation")
            .field("enabled", &self.state.enabled())
            .finish()
    }
}

fn install_target(state: &Arc<State>, target: PatchTarget) -> Result<(), PatchError> {
    if target.is_wrapped() {
        tracing::debug!(path = target.path(), "target already wrapped, skipping");
        return Ok(());
    }
    tracing::debug!(path = target.path(), "installing trace wrapper");
    let state = state.clone();
    let self_target = target.clone();
    target.replace(move |original| adapted_method(state, self_target, original))
}

/// Build the replacement method: identical calling convention, added tracing.
fn adapted_method(state: Arc<State>, target: PatchTarget, original: MethodFn) -> MethodFn {
    let operation = target.path().to_string();
    Arc::new(move |mut args: CallArgs| {
        if !state.enabled() {
            tracing::debug!(path = %operation, "tracing disabled, removing patch");
            target.restore();
            return original(args);
        }

        let parent = TraceContext::current();
        let opts = call_span_options(&args);
        let span = state.start_operation_span(&operation, &opts);
        let span_ctx = parent.with_span(span.clone());

        if let Some(DispatchShape::Callback(index)) = DispatchShape::from_args(&args) {
            let wrapped =
                args.wrap_callback_at(index, |cb| wrap_callback(span.clone(), parent.clone(), cb));
            if !wrapped {
                // Span bookkeeping must never fail the call itself: close the
                // span and run the operation untraced.
                tracing::warn!(path = %operation, index, "callback wrap failed, running untraced");
                span.end();
                return original(args);
            }
            // The original runs with the span active so synchronous child
            // operations observe it as their parent.
            return span_ctx.scope(|| original(args));
        }

        let output = span_ctx.scope(|| original(args));
        if let Some(shape) = DispatchShape::from_output(&output) {
            tracing::trace!(path = %operation, ?shape, "deferred completion");
        }
        match output {
            CallOutput::Rows(fut) => {
                CallOutput::Rows(wrap_future(span, fut, state.row_count_hook()))
            }
            CallOutput::Stream(stream) => CallOutput::Stream(wrap_stream(span, &parent, stream)),
            CallOutput::Handle(handle) => {
                patch_child_handle(&state, &handle);
                span.end();
                CallOutput::Handle(handle)
            }
            CallOutput::Unit => {
                // Neither a callback nor a deferred return: the operation
                // completed when the call returned.
                span.end();
                CallOutput::Unit
            }
        }
    })
}

fn call_span_options(args: &CallArgs) -> SpanOptions {
    match args.statement() {
        Some(statement) => SpanOptions {
            table_name: parser::extract_table(statement.sql()),
            statement: Some(statement.clone()),
        },
        None => SpanOptions::default(),
    }
}

/// Instance-level patch for handles returned by factory calls, so tracing
/// follows objects created after initialization. Failures here degrade to an
/// untraced child, never a broken call.
fn patch_child_handle(state: &Arc<State>, handle: &ClientHandle) {
    for path in CHILD_METHODS {
        match handle.target(path) {
            Ok(target) if target.is_wrapped() => {
                tracing::debug!(path, "child method already wrapped");
            }
            Ok(target) => {
                let state = state.clone();
                let self_target = target.clone();
                if let Err(err) =
                    target.replace(move |original| adapted_method(state, self_target, original))
                {
                    tracing::warn!(path, error = %err, "failed to wrap child method");
                }
            }
            Err(err) => {
                tracing::warn!(path, error = %err, "child method not patchable");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{InMemoryExporter, SpanStatus, SpanValue};

    fn instrumentation(config: TracingConfig) -> (CloudDbInstrumentation, Arc<InMemoryExporter>) {
        let exporter = Arc::new(InMemoryExporter::new());
        let tracer = Tracer::new(exporter.clone());
        (CloudDbInstrumentation::new(config, tracer), exporter)
    }

    fn select_opts() -> SpanOptions {
        SpanOptions {
            table_name: Some("users".into()),
            statement: Some(Statement::from("SELECT * FROM users")),
        }
    }

    #[test]
    fn test_factory_names_and_common_attributes() {
        let (instr, exporter) = instrumentation(TracingConfig::default());
        instr
            .start_operation_span("Database.run", &select_opts())
            .end();

        let spans = exporter.finished_spans();
        assert_eq!(spans[0].name(), "CloudDb.Database.run");
        assert_eq!(spans[0].status(), &SpanStatus::Unset);
        assert_eq!(
            spans[0].attribute(semconv::DB_SYSTEM).and_then(SpanValue::as_str),
            Some(DB_SYSTEM_NAME)
        );
        assert_eq!(
            spans[0]
                .attribute(semconv::DB_SQL_TABLE)
                .and_then(SpanValue::as_str),
            Some("users")
        );
        assert_eq!(
            spans[0]
                .attribute(semconv::DB_OPERATION)
                .and_then(SpanValue::as_str),
            Some("SELECT")
        );
    }

    #[test]
    fn test_statement_suppressed_by_default() {
        let (instr, exporter) = instrumentation(TracingConfig::default());
        instr
            .start_operation_span("Database.run", &select_opts())
            .end();
        assert!(exporter.finished_spans()[0]
            .attribute(semconv::DB_STATEMENT)
            .is_none());
    }

    #[test]
    fn test_statement_attached_via_process_opt_in() {
        let config = TracingConfig::default().with_extended_tracing_opt_in(true);
        let (instr, exporter) = instrumentation(config);
        instr
            .start_operation_span("Database.run", &select_opts())
            .end();
        assert_eq!(
            exporter.finished_spans()[0]
                .attribute(semconv::DB_STATEMENT)
                .and_then(SpanValue::as_str),
            Some("SELECT * FROM users")
        );
    }

    #[test]
    fn test_explicit_disable_beats_process_opt_in() {
        let config = TracingConfig::default()
            .with_extended_tracing_opt_in(true)
            .with_extended_tracing(false);
        let (instr, exporter) = instrumentation(config);
        instr
            .start_operation_span("Database.run", &select_opts())
            .end();
        assert!(exporter.finished_spans()[0]
            .attribute(semconv::DB_STATEMENT)
            .is_none());
    }

    #[test]
    fn test_request_statement_normalized_to_text() {
        let config = TracingConfig::default().with_extended_tracing(true);
        let (instr, exporter) = instrumentation(config);
        let opts = SpanOptions {
            table_name: None,
            statement: Some(Statement::Request {
                sql: "SELECT CURRENT_TIMESTAMP()".into(),
                params: None,
            }),
        };
        instr.start_operation_span("Database.run", &opts).end();
        assert_eq!(
            exporter.finished_spans()[0]
                .attribute(semconv::DB_STATEMENT)
                .and_then(SpanValue::as_str),
            Some("SELECT CURRENT_TIMESTAMP()")
        );
    }

    #[test]
    fn test_enable_disable_toggles() {
        let (instr, _exporter) = instrumentation(TracingConfig::default());
        assert!(instr.is_enabled());
        instr.disable();
        assert!(!instr.is_enabled());
        instr.enable();
        assert!(instr.is_enabled());
    }
}
