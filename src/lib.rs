//! End-to-end tracing for database client operations.
//!
//! Implements the request tracing model used by database clients: every
//! operation a caller issues is covered by an *outer* span, with request
//! encoding and per-socket *dispatch* attempts nested underneath it.
//! Spans carry typed tags, form trees through parent references, and can
//! be moved freely across threads while the operation makes its way
//! through a client's pipeline. When a dispatch span finishes, its
//! timing and socket details are copied up to the parent, so the outer
//! span alone tells you where the time went.
//!
//! What happens to finished spans is decided by the [`Tracer`]:
//!
//! - [`Tracer::disabled`] ignores everything and keeps the hot path
//!   trivial.
//! - [`Tracer::threshold`] installs the built-in
//!   [`ThresholdLoggingTracer`]: bounded per-service aggregation of the
//!   slowest operations, flushed periodically as one JSON report. This
//!   is what production deployments usually run.
//! - [`Tracer::reporter`] hands each finished span to a
//!   [`SpanReporter`] you implement.
//! - [`Tracer::delegate`] forwards the whole span lifecycle to a
//!   [`SpanDelegate`], for integrating an external tracing system that
//!   wants to own span storage itself.
//!
//! ## Getting Started
//!
//! ```
//! use dbtrace::{global, Registry, Service, ThresholdLoggingTracer, Tracer};
//!
//! // Install the built-in threshold logging tracer for the process.
//! global::set_tracer(Tracer::threshold(ThresholdLoggingTracer::default()));
//!
//! let registry = Registry::new();
//! let tracer = global::tracer();
//!
//! let span = registry
//!     .span_builder("get")
//!     .with_service(Service::Kv)
//!     .outer()
//!     .start(&tracer);
//! span.add_tag_str("db.instance", "travel-sample");
//! // ... perform the operation ...
//! span.finish(0); // 0 resolves to the current time
//!
//! global::shutdown_tracer();
//! ```
//!
//! Handing finished spans to your own backend instead:
//!
//! ```
//! use dbtrace::{Registry, Span, SpanReporter, TraceResult, Tracer};
//!
//! #[derive(Debug)]
//! struct PrintReporter;
//!
//! impl SpanReporter for PrintReporter {
//!     fn report(&self, span: &Span) -> TraceResult<()> {
//!         println!("{} took {}us", span.operation(), span.duration_us());
//!         Ok(())
//!     }
//! }
//!
//! let tracer = Tracer::reporter(PrintReporter);
//! let registry = Registry::new();
//! let span = registry.span_builder("query").start(&tracer);
//! span.finish(0);
//! ```
//!
//! ## Timestamps
//!
//! Timestamps are `u64` microseconds since the Unix epoch. Every API
//! taking one accepts [`TIMESTAMP_AUTO`] (zero) to mean "now", so
//! callers that do not keep their own clock never have to look one up.
//!
//! ## Crate Feature Flags
//!
//! The following feature flags are available:
//!
//! * `internal-logs`: Emits this crate's own diagnostics through
//!   [`tracing`](https://crates.io/crates/tracing). Enabled by default.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(
    docsrs,
    feature(doc_cfg, doc_auto_cfg),
    deny(rustdoc::broken_intra_doc_links)
)]
#![cfg_attr(test, deny(warnings))]

pub mod global;

pub mod conventions;

mod error;

pub use error::{TraceError, TraceResult};

mod tag;

pub use tag::{TagKind, TagSet, TagValue};

mod span;

pub use span::{Reference, Service, Span, SpanBuilder};

mod registry;

pub use registry::{IdGenerator, RandomIdGenerator, Registry, SequentialIdGenerator};

mod tracer;

pub use tracer::{ExternalSpan, SpanDelegate, SpanReporter, Tracer};

pub mod threshold;

pub use threshold::report::{
    FlushReport, InMemoryReportSink, InMemoryReportSinkBuilder, LogReportSink, OrphanEntry,
    OrphanReport, ReportSink, ServiceReport, SpanSummary,
};
pub use threshold::{
    ThresholdConfig, ThresholdConfigBuilder, ThresholdLoggingTracer, ThresholdLoggingTracerBuilder,
};

pub(crate) mod internal_logging;

/// Timestamp value that resolves to the current wall-clock time.
///
/// Accepted wherever a start or finish timestamp is expected. Explicit
/// timestamps exist so callers can stamp events against their own
/// clock; most callers pass this instead.
pub const TIMESTAMP_AUTO: u64 = 0;

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

pub(crate) fn resolve_ts(ts: u64) -> u64 {
    if ts == TIMESTAMP_AUTO {
        now()
    } else {
        ts
    }
}

#[doc(hidden)]
#[cfg(feature = "internal-logs")]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic_enough() {
        let first = now();
        let second = now();
        assert!(first > 0);
        assert!(second >= first);
    }

    #[test]
    fn auto_timestamp_resolves_to_the_clock() {
        let before = now();
        let resolved = resolve_ts(TIMESTAMP_AUTO);
        assert!(resolved >= before);
        assert_eq!(resolve_ts(42), 42);
    }
}
