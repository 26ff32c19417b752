//! End-to-end tests driving the instrumentation against a fake client
//! module registered in a patch registry.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use clouddb_tracing::{
    semconv, CallArgs, CallOutput, ClientError, ClientHandle, CloudDbInstrumentation, FinishedSpan,
    InMemoryExporter, MethodFn, MethodTable, PatchRegistry, Row, SpanStatus, SpanValue,
    TraceContext, Tracer, TracingConfig,
};
use futures::StreamExt;

const MODULE: &str = "clouddb";

/// Ambient span names observed inside the fake client, in call order.
type ContextProbe = Arc<Mutex<Vec<Option<String>>>>;

fn client_err(msg: &str) -> ClientError {
    Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg.to_string()))
}

fn sample_rows() -> Vec<Row> {
    vec![json!({"id": 1, "name": "ada"}), json!({"id": 2, "name": "grace"})]
}

/// A query method that picks its dispatch shape the way the real client
/// does: a callback argument wins, a `{"stream": true}` option asks for a
/// row stream, anything else returns a future. Statements containing
/// `missing_table` fail.
fn run_method(probe: ContextProbe) -> MethodFn {
    Arc::new(move |mut args: CallArgs| {
        probe
            .lock()
            .push(TraceContext::current().span().map(|s| s.name()));

        let sql = args
            .statement()
            .map(|s| s.sql().to_string())
            .unwrap_or_default();
        let fail = sql.contains("missing_table");

        if let Some(callback) = args.take_callback() {
            if fail {
                callback(Err(client_err("table missing_table not found")));
            } else {
                callback(Ok(sample_rows()));
            }
            return CallOutput::Unit;
        }

        let streaming = args
            .options()
            .and_then(|opts| opts.get("stream"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if streaming {
            let items: Vec<Result<Row, ClientError>> = if fail {
                vec![
                    Ok(json!({"id": 1})),
                    Err(client_err("table missing_table not found")),
                    Ok(json!({"id": 2})),
                ]
            } else {
                sample_rows().into_iter().map(Ok).collect()
            };
            return CallOutput::Stream(Box::pin(futures::stream::iter(items)));
        }

        CallOutput::Rows(Box::pin(async move {
            if fail {
                Err(client_err("table missing_table not found"))
            } else {
                Ok(sample_rows())
            }
        }))
    })
}

struct Harness {
    registry: PatchRegistry,
    exporter: Arc<InMemoryExporter>,
    instrumentation: CloudDbInstrumentation,
    probe: ContextProbe,
}

impl Harness {
    /// Fake module whose factories hand out handles dispatching against the
    /// module table itself, like prototype methods.
    fn shared(config: TracingConfig) -> Self {
        Self::build(config, true)
    }

    /// Fake module whose factories hand out handles with their own detached
    /// class table, so only instance-level patching can reach them.
    fn detached(config: TracingConfig) -> Self {
        Self::build(config, false)
    }

    fn build(config: TracingConfig, shared_class: bool) -> Self {
        let probe: ContextProbe = Arc::new(Mutex::new(Vec::new()));
        let table = Arc::new(MethodTable::new());
        table.register("Database.run", run_method(probe.clone()));

        let child_class = if shared_class {
            table.clone()
        } else {
            let class = Arc::new(MethodTable::new());
            class.register("Database.run", run_method(probe.clone()));
            class
        };
        for factory in ["Instance.database", "Instance.createDatabase"] {
            let class = child_class.clone();
            table.register(
                factory,
                Arc::new(move |_args: CallArgs| CallOutput::Handle(ClientHandle::new(class.clone()))),
            );
        }

        let registry = PatchRegistry::new();
        registry.register_module(MODULE, table);

        let exporter = Arc::new(InMemoryExporter::new());
        let instrumentation =
            CloudDbInstrumentation::new(config, Tracer::new(exporter.clone()));
        instrumentation
            .install(&registry, MODULE)
            .expect("install succeeds");

        Self {
            registry,
            exporter,
            instrumentation,
            probe,
        }
    }

    fn run(&self, args: CallArgs) -> CallOutput {
        self.registry
            .call(MODULE, "Database.run", args)
            .expect("run dispatches")
    }

    fn query_spans(&self) -> Vec<FinishedSpan> {
        self.exporter
            .finished_spans()
            .into_iter()
            .filter(|s| s.name() == "CloudDb.Database.run")
            .collect()
    }
}

#[test]
fn callback_success_closes_span_once_and_restores_context() {
    let harness = Harness::shared(TracingConfig::default());

    let seen = Arc::new(Mutex::new(None));
    let seen_in_cb = seen.clone();
    let exporter = harness.exporter.clone();
    let output = harness.run(CallArgs::new().with_statement("SELECT * FROM users").with_callback(
        move |result| {
            // By the time caller code runs the span is already closed and the
            // ambient context is the caller's own again.
            *seen_in_cb.lock() = Some((
                result.map(|rows| rows.len()).map_err(|e| e.to_string()),
                exporter.finished_spans().len(),
                TraceContext::current().span().is_none(),
            ));
        },
    ));
    assert!(matches!(output, CallOutput::Unit));

    assert_eq!(*seen.lock(), Some((Ok(2), 1, true)));
    let spans = harness.query_spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status(), &SpanStatus::Unset);
    assert!(spans[0].exceptions().is_empty());

    // The client itself observed the span as ambient parent.
    assert_eq!(
        harness.probe.lock().as_slice(),
        &[Some("CloudDb.Database.run".to_string())]
    );
}

#[test]
fn callback_error_is_recorded_and_surfaced_unchanged() {
    let harness = Harness::shared(TracingConfig::default());

    let seen = Arc::new(Mutex::new(String::new()));
    let seen_in_cb = seen.clone();
    harness.run(
        CallArgs::new()
            .with_statement("SELECT * FROM missing_table")
            .with_callback(move |result| {
                *seen_in_cb.lock() = result.unwrap_err().to_string();
            }),
    );

    assert_eq!(*seen.lock(), "table missing_table not found");
    let spans = harness.query_spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(
        spans[0].status().error_message(),
        Some("table missing_table not found")
    );
    assert_eq!(spans[0].exceptions().len(), 1);
}

#[tokio::test]
async fn promise_resolution_is_transparent() {
    let harness = Harness::shared(TracingConfig::default());

    let CallOutput::Rows(fut) = harness.run(CallArgs::new().with_statement("SELECT * FROM users"))
    else {
        panic!("expected promise-shaped return");
    };
    // Span stays open until the future settles.
    assert!(harness.query_spans().is_empty());

    let rows = fut.await.expect("resolves");
    assert_eq!(rows, sample_rows());

    let spans = harness.query_spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status(), &SpanStatus::Unset);
    assert_eq!(
        spans[0]
            .attribute(semconv::DB_ROWS_RETURNED)
            .and_then(SpanValue::as_int),
        Some(2)
    );
    assert_eq!(
        spans[0]
            .attribute(semconv::DB_SQL_TABLE)
            .and_then(SpanValue::as_str),
        Some("users")
    );
}

#[tokio::test]
async fn promise_rejection_is_transparent() {
    let harness = Harness::shared(TracingConfig::default());

    let CallOutput::Rows(fut) = harness.run(
        CallArgs::new().with_statement("SELECT * FROM missing_table"),
    ) else {
        panic!("expected promise-shaped return");
    };
    let err = fut.await.unwrap_err();
    assert_eq!(err.to_string(), "table missing_table not found");

    let spans = harness.query_spans();
    assert_eq!(
        spans[0].status().error_message(),
        Some("table missing_table not found")
    );
    assert_eq!(spans[0].exceptions()[0].message, "table missing_table not found");
}

#[tokio::test]
async fn stream_error_marks_span_without_closing_before_end() {
    let harness = Harness::shared(TracingConfig::default());

    let CallOutput::Stream(mut stream) = harness.run(
        CallArgs::new()
            .with_statement("SELECT * FROM missing_table")
            .with_options(json!({"stream": true})),
    ) else {
        panic!("expected stream-shaped return");
    };

    assert!(stream.next().await.expect("first item").is_ok());
    assert!(stream.next().await.expect("second item").is_err());
    // Marked errored, but still open until the terminal signal.
    assert!(harness.query_spans().is_empty());

    assert!(stream.next().await.expect("third item").is_ok());
    assert!(stream.next().await.is_none());

    let spans = harness.query_spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(
        spans[0].status().error_message(),
        Some("table missing_table not found")
    );
}

#[tokio::test]
async fn stream_without_errors_ends_with_status_unset() {
    let harness = Harness::shared(TracingConfig::default());

    let CallOutput::Stream(stream) = harness.run(
        CallArgs::new()
            .with_statement("SELECT * FROM users")
            .with_options(json!({"stream": true})),
    ) else {
        panic!("expected stream-shaped return");
    };

    let rows: Vec<_> = stream.collect().await;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(Result::is_ok));

    let spans = harness.query_spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status(), &SpanStatus::Unset);
}

#[test]
fn disable_unpatches_permanently_and_produces_no_spans() {
    let harness = Harness::shared(TracingConfig::default());
    let target = harness
        .registry
        .locate(MODULE, "Database.run")
        .expect("locate");
    assert!(target.is_wrapped());

    harness.instrumentation.disable();
    let output = harness.run(CallArgs::new().with_statement("SELECT * FROM users"));
    assert!(matches!(output, CallOutput::Rows(_)));

    // The patch removed itself; the original now runs directly, even after a
    // re-enable, until install is called again.
    assert!(!target.is_wrapped());
    harness.instrumentation.enable();
    harness.run(CallArgs::new().with_statement("SELECT * FROM users"));
    assert!(harness.exporter.finished_spans().is_empty());
    assert_eq!(harness.probe.lock().len(), 2);
    assert!(harness.probe.lock().iter().all(Option::is_none));
}

#[test]
fn install_is_idempotent_per_target() {
    let harness = Harness::shared(TracingConfig::default());
    harness
        .instrumentation
        .install(&harness.registry, MODULE)
        .expect("second install is a no-op");

    let seen = Arc::new(Mutex::new(0usize));
    let seen_in_cb = seen.clone();
    harness.run(
        CallArgs::new()
            .with_statement("SELECT * FROM users")
            .with_callback(move |_| *seen_in_cb.lock() += 1),
    );

    assert_eq!(*seen.lock(), 1);
    assert_eq!(harness.query_spans().len(), 1);
}

#[test]
fn uninstall_restores_direct_delegation() {
    let harness = Harness::shared(TracingConfig::default());
    harness
        .instrumentation
        .uninstall(&harness.registry, MODULE)
        .expect("uninstall");

    harness.run(CallArgs::new().with_statement("SELECT * FROM users"));
    assert!(harness.exporter.finished_spans().is_empty());
    assert!(!harness
        .registry
        .locate(MODULE, "Database.run")
        .expect("locate")
        .is_wrapped());
}

#[tokio::test]
async fn factory_patches_returned_handle_transitively() {
    let harness = Harness::detached(TracingConfig::default());

    let CallOutput::Handle(db) = harness
        .registry
        .call(MODULE, "Instance.database", CallArgs::new())
        .expect("factory call")
    else {
        panic!("expected a handle");
    };

    // The factory call itself was traced.
    let factory_spans: Vec<_> = harness
        .exporter
        .finished_spans()
        .into_iter()
        .filter(|s| s.name() == "CloudDb.Instance.database")
        .collect();
    assert_eq!(factory_spans.len(), 1);
    assert_eq!(factory_spans[0].status(), &SpanStatus::Unset);

    // The handle's own query method was wrapped at instance level, even
    // though its class table is unknown to the registry.
    let CallOutput::Rows(fut) = db
        .call(
            "Database.run",
            CallArgs::new().with_statement("SELECT * FROM users"),
        )
        .expect("handle dispatch")
    else {
        panic!("expected promise-shaped return");
    };
    fut.await.expect("resolves");

    assert_eq!(harness.query_spans().len(), 1);
}

#[tokio::test]
async fn shared_class_handles_are_not_double_traced() {
    let harness = Harness::shared(TracingConfig::default());

    let CallOutput::Handle(db) = harness
        .registry
        .call(MODULE, "Instance.database", CallArgs::new())
        .expect("factory call")
    else {
        panic!("expected a handle");
    };

    let CallOutput::Rows(fut) = db
        .call(
            "Database.run",
            CallArgs::new().with_statement("SELECT * FROM users"),
        )
        .expect("handle dispatch")
    else {
        panic!("expected promise-shaped return");
    };
    fut.await.expect("resolves");

    // One query call, one span: the class-level wrapper already covers the
    // handle, so no instance wrapper was stacked on top.
    assert_eq!(harness.query_spans().len(), 1);
    assert_eq!(harness.probe.lock().len(), 1);
}

#[tokio::test]
async fn statement_text_attached_iff_extended_tracing_enabled() {
    for (config, expected) in [
        (TracingConfig::default(), None),
        (
            TracingConfig::default().with_extended_tracing_opt_in(true),
            Some("SELECT * FROM users"),
        ),
        (
            TracingConfig::default()
                .with_extended_tracing_opt_in(true)
                .with_extended_tracing(false),
            None,
        ),
        (
            TracingConfig::default().with_extended_tracing(true),
            Some("SELECT * FROM users"),
        ),
    ] {
        let harness = Harness::shared(config);
        let CallOutput::Rows(fut) =
            harness.run(CallArgs::new().with_statement("SELECT * FROM users"))
        else {
            panic!("expected promise-shaped return");
        };
        fut.await.expect("resolves");

        let spans = harness.query_spans();
        assert_eq!(
            spans[0]
                .attribute(semconv::DB_STATEMENT)
                .and_then(SpanValue::as_str),
            expected
        );
    }
}

#[tokio::test]
async fn select_current_timestamp_scenario() {
    let config = TracingConfig::default().with_extended_tracing(true);
    let harness = Harness::shared(config);

    let CallOutput::Rows(fut) =
        harness.run(CallArgs::new().with_statement("SELECT CURRENT_TIMESTAMP()"))
    else {
        panic!("expected promise-shaped return");
    };
    fut.await.expect("resolves");

    let spans = harness.query_spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name(), "CloudDb.Database.run");
    assert_eq!(spans[0].status(), &SpanStatus::Unset);
    assert_eq!(
        spans[0]
            .attribute(semconv::DB_STATEMENT)
            .and_then(SpanValue::as_str),
        Some("SELECT CURRENT_TIMESTAMP()")
    );
    assert_eq!(
        spans[0]
            .attribute(semconv::DB_SYSTEM)
            .and_then(SpanValue::as_str),
        Some("clouddb")
    );
    // No table is derivable from this statement.
    assert!(spans[0].attribute(semconv::DB_SQL_TABLE).is_none());
}

#[test]
fn concurrent_calls_own_independent_spans() {
    let harness = Harness::shared(TracingConfig::default());

    // Interleave: start a callback call from inside another call's callback.
    let inner_harness_registry = &harness.registry;
    let exporter = harness.exporter.clone();
    harness.run(
        CallArgs::new()
            .with_statement("SELECT * FROM users")
            .with_callback(move |_| {
                // Sibling operation issued from caller code: it must see the
                // caller's context, not the finished span's.
                assert!(TraceContext::current().span().is_none());
            }),
    );
    inner_harness_registry
        .call(
            MODULE,
            "Database.run",
            CallArgs::new()
                .with_statement("SELECT * FROM missing_table")
                .with_callback(|_| {}),
        )
        .expect("second call");

    let spans = exporter.finished_spans();
    let query_spans: Vec<_> = spans
        .iter()
        .filter(|s| s.name() == "CloudDb.Database.run")
        .collect();
    assert_eq!(query_spans.len(), 2);
    assert_eq!(query_spans[0].status(), &SpanStatus::Unset);
    assert!(query_spans[1].status().is_error());
}
