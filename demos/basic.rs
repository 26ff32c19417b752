//! Basic example showing how to wire clouddb-tracing around a client module.
//!
//! Run with: cargo run --example basic

use std::sync::Arc;

use clouddb_tracing::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stand-in for a loaded client module: a dispatch table with the factory
/// and query entry points a real client would register at load time.
fn client_module() -> Arc<MethodTable> {
    let table = Arc::new(MethodTable::new());

    table.register(
        "Database.run",
        Arc::new(|args: CallArgs| {
            let sql = args
                .statement()
                .map(|s| s.sql().to_string())
                .unwrap_or_default();
            CallOutput::Rows(Box::pin(async move {
                tracing::info!(%sql, "executing query");
                Ok(vec![serde_json::json!({"now": "2026-08-07T00:00:00Z"})])
            }))
        }),
    );

    let class = table.clone();
    table.register(
        "Instance.database",
        Arc::new(move |_args: CallArgs| CallOutput::Handle(ClientHandle::new(class.clone()))),
    );
    let class = table.clone();
    table.register(
        "Instance.createDatabase",
        Arc::new(move |_args: CallArgs| CallOutput::Handle(ClientHandle::new(class.clone()))),
    );

    table
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,clouddb_tracing=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // The host registers the client's entry points once at load time.
    let registry = PatchRegistry::new();
    registry.register_module("clouddb", client_module());

    // Collect finished spans in memory so we can print them below; a real
    // deployment would hand them to an exporter instead.
    let exporter = Arc::new(InMemoryExporter::new());
    let tracer = Tracer::new(exporter.clone());

    // Extended tracing follows CLOUDDB_ENABLE_EXTENDED_TRACING unless set
    // explicitly here.
    let config = TracingConfig::from_env().with_extended_tracing(true);
    let instrumentation = CloudDbInstrumentation::new(config, tracer);
    instrumentation.install(&registry, "clouddb")?;

    // Fetch a database handle through the traced factory, then query it.
    let CallOutput::Handle(db) = registry.call("clouddb", "Instance.database", CallArgs::new())?
    else {
        return Err("factory did not return a handle".into());
    };

    let CallOutput::Rows(rows) = db.call(
        "Database.run",
        CallArgs::new().with_statement("SELECT CURRENT_TIMESTAMP()"),
    )?
    else {
        return Err("query did not return rows".into());
    };
    let rows = rows.await?;
    tracing::info!(count = rows.len(), "query finished");

    for span in exporter.finished_spans() {
        println!(
            "span {} [{:?}] {:?} ({} attrs)",
            span.name(),
            span.status(),
            span.duration(),
            span.attributes().len()
        );
    }

    Ok(())
}
