//! Tracers and pluggable backends.
//!
//! A [`Tracer`] is the long-lived object finished spans report to. It is
//! created once at client configuration time, cloned into every span at
//! start, and shut down at teardown. Backends plug in through two seams:
//! [`SpanReporter`] observes finished spans, [`SpanDelegate`] takes over
//! the whole span lifecycle. Backend failures never reach the operation
//! path; they are counted on the tracer handle and logged.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::span::Span;
use crate::tag::TagValue;
use crate::threshold::ThresholdLoggingTracer;
use crate::{dbtrace_debug, dbtrace_error, TraceError, TraceResult};

/// Opaque handle to a span owned by an external tracing system.
///
/// The subsystem never looks inside a handle; it stores it and passes it
/// back to the backend that understands it. Backends recover their own
/// type with [`downcast_ref`] or [`downcast`].
///
/// [`downcast_ref`]: ExternalSpan::downcast_ref
/// [`downcast`]: ExternalSpan::downcast
pub struct ExternalSpan(Box<dyn Any + Send + Sync>);

impl ExternalSpan {
    /// Wrap a backend-owned value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        ExternalSpan(Box::new(value))
    }

    /// Borrow the wrapped value if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Recover the wrapped value if it is a `T`, or give the handle back.
    pub fn downcast<T: Any>(self) -> Result<T, ExternalSpan> {
        self.0.downcast().map(|value| *value).map_err(ExternalSpan)
    }
}

impl fmt::Debug for ExternalSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExternalSpan")
    }
}

/// A backend that observes finished spans without managing their
/// lifecycle.
pub trait SpanReporter: Send + Sync {
    /// Called once per span, after the finish timestamp is set. The span
    /// is read-only at this point. Errors are counted on the tracer
    /// handle and otherwise ignored.
    fn report(&self, span: &Span) -> TraceResult<()>;

    /// Called when the owning tracer shuts down.
    fn shutdown(&self) {}
}

/// A backend that owns the full span lifecycle.
///
/// While a delegating tracer is active, spans forward their start, tag
/// writes and finish to the backend in real time, and the subsystem stops
/// copying dispatch and encode annotations between its own spans; the
/// backend sees every child directly and draws its own conclusions.
pub trait SpanDelegate: Send + Sync {
    /// Open a backend span. `parent` is the handle of the parent span
    /// when the new span has one, including handles supplied by the
    /// caller through [`Registry::wrap`].
    ///
    /// [`Registry::wrap`]: crate::Registry::wrap
    fn start_span(
        &self,
        operation: &str,
        start_ts: u64,
        parent: Option<&ExternalSpan>,
    ) -> TraceResult<ExternalSpan>;

    /// Attach a tag to a backend span.
    fn add_tag(&self, span: &ExternalSpan, key: &str, value: &TagValue) -> TraceResult<()>;

    /// Close a backend span.
    fn end_span(&self, span: &ExternalSpan, finish_ts: u64) -> TraceResult<()>;

    /// Release a backend span. Called exactly once per handle minted by
    /// [`start_span`], after the last handle to the owning span is gone.
    ///
    /// [`start_span`]: SpanDelegate::start_span
    fn destroy_span(&self, span: ExternalSpan);
}

enum TracerKind {
    Disabled,
    Threshold(ThresholdLoggingTracer),
    Reporter(Box<dyn SpanReporter>),
    Delegate(Box<dyn SpanDelegate>),
}

impl TracerKind {
    fn name(&self) -> &'static str {
        match self {
            TracerKind::Disabled => "disabled",
            TracerKind::Threshold(_) => "threshold",
            TracerKind::Reporter(_) => "reporter",
            TracerKind::Delegate(_) => "delegate",
        }
    }
}

struct TracerInner {
    kind: TracerKind,
    hook_failures: AtomicU64,
    is_shutdown: AtomicBool,
}

/// Entry point finished spans report to.
///
/// Cloning is cheap and every clone refers to the same tracer. Each span
/// captures the tracer it was started under, so replacing the tracer a
/// client hands out mid-flight never strands an open span: spans started
/// under the old tracer keep reporting to it.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Tracer {
    /// A tracer that ignores every span.
    pub fn disabled() -> Tracer {
        Tracer::from_kind(TracerKind::Disabled)
    }

    /// A tracer that hands every finished span to `reporter`.
    pub fn reporter(reporter: impl SpanReporter + 'static) -> Tracer {
        Tracer::from_kind(TracerKind::Reporter(Box::new(reporter)))
    }

    /// A tracer that delegates the whole span lifecycle to `delegate`.
    pub fn delegate(delegate: impl SpanDelegate + 'static) -> Tracer {
        Tracer::from_kind(TracerKind::Delegate(Box::new(delegate)))
    }

    /// A tracer that aggregates the slowest operations per service and
    /// periodically logs them.
    pub fn threshold(threshold: ThresholdLoggingTracer) -> Tracer {
        Tracer::from_kind(TracerKind::Threshold(threshold))
    }

    fn from_kind(kind: TracerKind) -> Tracer {
        Tracer {
            inner: Arc::new(TracerInner {
                kind,
                hook_failures: AtomicU64::new(0),
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Number of backend hook failures recorded so far. Hook panics and
    /// hook errors both count; neither interrupts the operation that
    /// triggered them.
    pub fn hook_failures(&self) -> u64 {
        let own = self.inner.hook_failures.load(Ordering::Relaxed);
        match &self.inner.kind {
            TracerKind::Threshold(threshold) => own + threshold.sink_failures(),
            _ => own,
        }
    }

    /// Flush any pending aggregation. A no-op for tracers that do not
    /// retain state.
    pub fn flush(&self) -> TraceResult<()> {
        match &self.inner.kind {
            TracerKind::Threshold(threshold) => threshold.force_flush(),
            _ => Ok(()),
        }
    }

    /// Shut the tracer down, draining pending aggregation. Subsequent
    /// span finishes are dropped. Shutting down twice is a no-op.
    pub fn shutdown(&self) -> TraceResult<()> {
        if self.inner.is_shutdown.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        match &self.inner.kind {
            TracerKind::Threshold(threshold) => threshold.shutdown(),
            TracerKind::Reporter(reporter) => {
                if catch_unwind(AssertUnwindSafe(|| reporter.shutdown())).is_err() {
                    self.hook_failed("shutdown", None);
                }
                Ok(())
            }
            TracerKind::Disabled | TracerKind::Delegate(_) => Ok(()),
        }
    }

    pub(crate) fn is_delegate(&self) -> bool {
        matches!(self.inner.kind, TracerKind::Delegate(_))
    }

    pub(crate) fn on_span_finished(&self, span: &Span) {
        if self.inner.is_shutdown.load(Ordering::Relaxed) {
            dbtrace_debug!(
                name: "span_finished_after_shutdown",
                span_id = span.span_id(),
                operation = span.operation()
            );
            return;
        }
        match &self.inner.kind {
            TracerKind::Disabled | TracerKind::Delegate(_) => {}
            TracerKind::Threshold(threshold) => threshold.on_span_finished(span),
            TracerKind::Reporter(reporter) => {
                match catch_unwind(AssertUnwindSafe(|| reporter.report(span))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => self.hook_failed("report", Some(err)),
                    Err(_) => self.hook_failed("report", None),
                }
            }
        }
    }

    pub(crate) fn start_external(
        &self,
        operation: &str,
        start_ts: u64,
        parent: Option<&Span>,
    ) -> Option<ExternalSpan> {
        if self.inner.is_shutdown.load(Ordering::Relaxed) {
            return None;
        }
        let delegate = match &self.inner.kind {
            TracerKind::Delegate(delegate) => delegate,
            _ => return None,
        };
        let result = match parent {
            Some(parent) => parent.inner().with_external(|handle| {
                catch_unwind(AssertUnwindSafe(|| delegate.start_span(operation, start_ts, handle)))
            }),
            None => catch_unwind(AssertUnwindSafe(|| delegate.start_span(operation, start_ts, None))),
        };
        match result {
            Ok(Ok(handle)) => Some(handle),
            Ok(Err(err)) => {
                self.hook_failed("start_span", Some(err));
                None
            }
            Err(_) => {
                self.hook_failed("start_span", None);
                None
            }
        }
    }

    pub(crate) fn forward_tag(&self, span: &Span, key: &str, value: &TagValue) {
        let delegate = match &self.inner.kind {
            TracerKind::Delegate(delegate) => delegate,
            _ => return,
        };
        let result = span.inner().with_external(|handle| {
            handle.map(|handle| {
                catch_unwind(AssertUnwindSafe(|| delegate.add_tag(handle, key, value)))
            })
        });
        match result {
            None | Some(Ok(Ok(()))) => {}
            Some(Ok(Err(err))) => self.hook_failed("add_tag", Some(err)),
            Some(Err(_)) => self.hook_failed("add_tag", None),
        }
    }

    pub(crate) fn end_external(&self, handle: &ExternalSpan, finish_ts: u64) {
        let delegate = match &self.inner.kind {
            TracerKind::Delegate(delegate) => delegate,
            _ => return,
        };
        match catch_unwind(AssertUnwindSafe(|| delegate.end_span(handle, finish_ts))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.hook_failed("end_span", Some(err)),
            Err(_) => self.hook_failed("end_span", None),
        }
    }

    pub(crate) fn destroy_external(&self, handle: ExternalSpan) {
        let delegate = match &self.inner.kind {
            TracerKind::Delegate(delegate) => delegate,
            _ => return,
        };
        if catch_unwind(AssertUnwindSafe(move || delegate.destroy_span(handle))).is_err() {
            self.hook_failed("destroy_span", None);
        }
    }

    fn hook_failed(&self, hook: &'static str, err: Option<TraceError>) {
        self.inner.hook_failures.fetch_add(1, Ordering::Relaxed);
        match err {
            Some(err) => {
                let reason = err.to_string();
                dbtrace_error!(name: "tracer_hook_failed", hook = hook, reason = reason.as_str());
            }
            None => {
                dbtrace_error!(name: "tracer_hook_panicked", hook = hook);
            }
        }
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("kind", &self.inner.kind.name())
            .field("hook_failures", &self.hook_failures())
            .finish()
    }
}
