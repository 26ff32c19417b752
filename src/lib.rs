//! # clouddb-tracing
//!
//! OpenTelemetry-style tracing instrumentation for managed cloud database
//! clients.
//!
//! This crate adds distributed-tracing spans around a database client's entry
//! points without touching the client's own code. The client is reached
//! through an explicit patch registry; the instrumentation swaps each entry
//! point for a wrapper that creates a span, runs the original, and finalizes
//! the span on whichever completion signal the call uses.
//!
//! ## Features
//!
//! - **Three dispatch shapes**: callback-style, promise-style, and
//!   streaming-style invocations of the same operation are each wired to
//!   their own completion signal and context-restore rule
//! - **Transparent**: arguments, results, and errors pass through unchanged;
//!   spans only observe
//! - **Transitive**: handles returned by factory calls are patched at the
//!   instance level, so tracing follows objects created after initialization
//! - **Extended tracing policy**: statement text (potentially PII) is only
//!   attached when explicitly opted in, per instance or process-wide
//! - **Clean removal**: disabling tracing unpatches lazily and permanently,
//!   restoring direct delegation to the original methods
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use clouddb_tracing::prelude::*;
//!
//! // The host registers the client module's entry points once at load time.
//! let registry = PatchRegistry::new();
//! registry.register_module("clouddb", client_module_table());
//!
//! // Install tracing around them.
//! let tracer = Tracer::new(Arc::new(LogExporter));
//! let instrumentation =
//!     CloudDbInstrumentation::new(TracingConfig::from_env(), tracer);
//! instrumentation.install(&registry, "clouddb")?;
//!
//! // Calls through the registry are now traced.
//! let output = registry.call(
//!     "clouddb",
//!     "Database.run",
//!     CallArgs::new().with_statement("SELECT * FROM users"),
//! )?;
//! ```
//!
//! ## Span Attributes
//!
//! | Attribute | Description |
//! |-----------|-------------|
//! | `db.system` | Always `"clouddb"` |
//! | `db.operation` | Statement keyword (SELECT, INSERT, ...) when a statement is present |
//! | `db.sql.table` | Target table name (when detectable) |
//! | `db.statement` | Full statement text (only with extended tracing) |
//! | `db.response.returned_rows` | Row count for promise-style calls (when enabled) |

mod config;
mod context;
mod dispatch;
mod instrumentation;
mod parser;
mod patch;
mod span;

pub use config::{TracingConfig, EXTENDED_TRACING_ENV};
pub use context::{ContextGuard, ContextStream, TraceContext};
pub use dispatch::{
    CallArg, CallArgs, CallOutput, CallResult, ClientError, DispatchShape, MethodFn, Row, Rows,
    RowStream, RowsFuture, RunCallback, Statement, SuccessHook,
};
pub use instrumentation::{
    CloudDbInstrumentation, SpanOptions, COMPONENT_PREFIX, DB_SYSTEM_NAME, FACTORY_METHODS,
    QUERY_METHOD,
};
pub use parser::{extract_table, parse_operation, QueryInfo, QueryOperation};
pub use patch::{ClientHandle, MethodTable, PatchError, PatchRegistry, PatchTarget};
pub use span::{
    record_span_exception, set_span_error, ExceptionRecord, FinishedSpan, InMemoryExporter,
    LogExporter, Span, SpanExporter, SpanKind, SpanStatus, SpanValue, Tracer,
};

/// OpenTelemetry semantic-convention attribute keys recorded on spans.
pub mod semconv {
    /// The database system identifier.
    pub const DB_SYSTEM: &str = "db.system";
    /// The statement keyword (SELECT, INSERT, ...).
    pub const DB_OPERATION: &str = "db.operation";
    /// The primary table the statement targets.
    pub const DB_SQL_TABLE: &str = "db.sql.table";
    /// The full statement text.
    pub const DB_STATEMENT: &str = "db.statement";
    /// Number of rows returned to the caller.
    pub const DB_ROWS_RETURNED: &str = "db.response.returned_rows";
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        CallArgs, CallOutput, ClientHandle, CloudDbInstrumentation, InMemoryExporter, LogExporter,
        MethodTable, PatchRegistry, Statement, TraceContext, Tracer, TracingConfig,
    };
}
