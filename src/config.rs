//! Configuration for tracing behavior.

use std::env;

/// Environment variable that opts the whole process into extended tracing.
///
/// Sampled once, at [`TracingConfig::from_env`]; never re-read afterwards.
pub const EXTENDED_TRACING_ENV: &str = "CLOUDDB_ENABLE_EXTENDED_TRACING";

/// Configuration options for database client tracing.
///
/// # Example
///
/// ```rust
/// use clouddb_tracing::TracingConfig;
///
/// let config = TracingConfig::default()
///     .with_extended_tracing(true)
///     .with_row_count_recording(false);
/// ```
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Per-instance extended-tracing flag. When set it wins outright:
    /// `Some(false)` suppresses statement capture even if the process-wide
    /// opt-in is on, `Some(true)` enables it regardless.
    /// Default: `None` (defer to the process-wide opt-in)
    pub extended_tracing: Option<bool>,

    /// Process-wide extended-tracing opt-in, normally sampled from the
    /// environment exactly once via [`TracingConfig::from_env`].
    /// Default: `false`
    pub extended_tracing_opt_in: bool,

    /// Whether to record the number of rows returned by promise-style calls.
    /// Default: `true`
    pub record_row_counts: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            extended_tracing: None,
            extended_tracing_opt_in: false,
            record_row_counts: true,
        }
    }
}

impl TracingConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration with the process-wide opt-in sampled from
    /// [`EXTENDED_TRACING_ENV`].
    ///
    /// This is the single point where the environment is consulted; the
    /// resulting value is threaded into the instrumentation at construction
    /// and never mutated afterwards.
    pub fn from_env() -> Self {
        let opted_in = env::var(EXTENDED_TRACING_ENV)
            .map(|v| v == "true")
            .unwrap_or(false);
        Self {
            extended_tracing_opt_in: opted_in,
            ..Self::default()
        }
    }

    /// Explicitly enable or disable extended tracing for this instance.
    ///
    /// **Security Warning**: Enabling this attaches full statement text to
    /// spans, which may expose credentials or PII embedded in the SQL.
    pub fn with_extended_tracing(mut self, enabled: bool) -> Self {
        self.extended_tracing = Some(enabled);
        self
    }

    /// Set the process-wide opt-in directly instead of sampling the
    /// environment. Mostly useful in tests.
    pub fn with_extended_tracing_opt_in(mut self, opted_in: bool) -> Self {
        self.extended_tracing_opt_in = opted_in;
        self
    }

    /// Enable or disable row count recording on promise-style calls.
    pub fn with_row_count_recording(mut self, enabled: bool) -> Self {
        self.record_row_counts = enabled;
        self
    }

    /// Resolve whether statement text should be attached to spans.
    ///
    /// An explicit per-instance setting wins; otherwise the process-wide
    /// opt-in decides.
    pub fn capture_statements(&self) -> bool {
        self.extended_tracing.unwrap_or(self.extended_tracing_opt_in)
    }

    /// Create a development-friendly configuration with statement capture on.
    ///
    /// **Warning**: Do not use in production as it records all SQL text.
    pub fn development() -> Self {
        Self {
            extended_tracing: Some(true),
            ..Self::default()
        }
    }

    /// Create a production-safe configuration that never records SQL text,
    /// regardless of the process-wide opt-in.
    pub fn production() -> Self {
        Self {
            extended_tracing: Some(false),
            ..Self::default()
        }
    }
}
