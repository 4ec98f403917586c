//! Spans and their lifecycle.
//!
//! A [`Span`] names one unit of work inside a client operation. Spans form
//! trees: an outer span covers the whole operation as observed by the
//! caller, with request encoding and per-socket dispatch attempts nested
//! under it. Handles are cheap to clone and safe to move across threads;
//! the span they point at is finished at most once, no matter how many
//! handles exist.

use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::conventions::tags;
use crate::registry::Registry;
use crate::tag::{socket_of, TagSet, TagValue};
use crate::tracer::{ExternalSpan, Tracer};
use crate::{dbtrace_warn, resolve_ts, TraceResult, TIMESTAMP_AUTO};

/// The service category an operation belongs to, used to bucket spans
/// during threshold aggregation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Service {
    /// Key-value data operations.
    Kv,
    /// SQL-like queries.
    Query,
    /// Map-reduce view queries.
    View,
    /// Full-text search.
    Search,
    /// Analytical queries.
    Analytics,
    /// Not categorized. Spans start here until the dispatch layer knows
    /// which service handles them.
    #[default]
    Unset,
}

impl Service {
    pub(crate) const COUNT: usize = 6;

    /// The canonical name, matching the [`SERVICE`] tag values.
    ///
    /// [`SERVICE`]: crate::conventions::tags::SERVICE
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Kv => "kv",
            Service::Query => "query",
            Service::View => "views",
            Service::Search => "search",
            Service::Analytics => "analytics",
            Service::Unset => "unset",
        }
    }

    pub(crate) fn bucket_index(self) -> usize {
        match self {
            Service::Kv => 0,
            Service::Query => 1,
            Service::View => 2,
            Service::Search => 3,
            Service::Analytics => 4,
            Service::Unset => 5,
        }
    }

    pub(crate) fn from_bucket_index(index: usize) -> Service {
        match index {
            0 => Service::Kv,
            1 => Service::Query,
            2 => Service::View,
            3 => Service::Search,
            4 => Service::Analytics,
            _ => Service::Unset,
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for Service {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Causal relationship between a new span and an existing one.
///
/// References borrow the related span, so linking to a span that no longer
/// exists is not expressible. The child never keeps its parent alive; it
/// holds a weak back-reference after construction.
#[derive(Clone, Copy, Debug, Default)]
pub enum Reference<'a> {
    /// No relationship. The span starts a new trace.
    #[default]
    None,
    /// The new span is a child doing work on behalf of the parent.
    ChildOf(&'a Span),
    /// The new span was caused by the other span but does not block it.
    FollowsFrom(&'a Span),
}

impl<'a> Reference<'a> {
    pub(crate) fn span(&self) -> Option<&'a Span> {
        match self {
            Reference::None => None,
            Reference::ChildOf(span) | Reference::FollowsFrom(span) => Some(span),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Open,
    Finished,
    Reported,
}

/// Mutable portion of a span, guarded by the span's mutex.
struct SpanData {
    start_ts: u64,
    finish_ts: u64,
    service: Service,
    tags: TagSet,
    is_outer: bool,
    // Finish ownership rests with the caller, not the machinery. Set by
    // `set_is_outer(true)` and by `wrap`.
    caller_owned: bool,
    is_dispatch: bool,
    is_encode: bool,
    orphaned: bool,
    stage: Stage,
}

enum ExternalState {
    None,
    /// Handle supplied by the caller through `wrap`; its lifecycle belongs
    /// to the caller and we never end or destroy it.
    Wrapped(ExternalSpan),
    /// Handle minted by a delegating backend at start. Ended at finish,
    /// destroyed when the last span handle drops.
    Delegated(Mutex<Option<ExternalSpan>>),
}

pub(crate) struct SpanInner {
    span_id: u64,
    trace_id: u64,
    parent_span_id: u64,
    operation: Cow<'static, str>,
    tracer: Tracer,
    parent: Option<Weak<SpanInner>>,
    external: ExternalState,
    data: Mutex<SpanData>,
}

impl SpanInner {
    fn data(&self) -> MutexGuard<'_, SpanData> {
        // A poisoned lock only means a hook panicked mid-access; the span
        // data itself is still consistent.
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn with_external<R>(&self, f: impl FnOnce(Option<&ExternalSpan>) -> R) -> R {
        match &self.external {
            ExternalState::None => f(None),
            ExternalState::Wrapped(handle) => f(Some(handle)),
            ExternalState::Delegated(slot) => {
                let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
                f(guard.as_ref())
            }
        }
    }

    fn with_delegated<R>(&self, f: impl FnOnce(&ExternalSpan) -> R) -> Option<R> {
        match &self.external {
            ExternalState::Delegated(slot) => {
                let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
                guard.as_ref().map(f)
            }
            _ => None,
        }
    }

    // Finished spans are immutable apart from reads; a late write is
    // dropped and logged, like a double finish.
    fn mutate_open(&self, field: &'static str, f: impl FnOnce(&mut SpanData)) {
        let mut data = self.data();
        if data.stage != Stage::Open {
            drop(data);
            dbtrace_warn!(
                name: "span_mutated_after_finish",
                span_id = self.span_id,
                field = field
            );
            return;
        }
        f(&mut data);
    }
}

impl Drop for SpanInner {
    fn drop(&mut self) {
        let dropped_open = {
            let data = self.data.get_mut().unwrap_or_else(PoisonError::into_inner);
            data.stage == Stage::Open
        };
        if dropped_open {
            crate::dbtrace_debug!(
                name: "span_dropped_unfinished",
                span_id = self.span_id,
                operation = &*self.operation
            );
        }
        if let ExternalState::Delegated(slot) = &mut self.external {
            let handle = slot.get_mut().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(handle) = handle {
                self.tracer.destroy_external(handle);
            }
        }
    }
}

/// A handle to one unit of traced work.
///
/// Cloning a `Span` clones the handle, not the span; all clones observe and
/// mutate the same state. The span reports to the tracer it was started
/// under exactly once, when [`finish`] first succeeds. A finished span is
/// read-only: tag and flag writes are dropped with a warning in the
/// internal logs.
///
/// [`finish`]: Span::finish
#[derive(Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

pub(crate) struct StartArgs<'a> {
    pub(crate) tracer: &'a Tracer,
    pub(crate) operation: Cow<'static, str>,
    pub(crate) start_ts: u64,
    pub(crate) service: Service,
    pub(crate) outer: bool,
    pub(crate) parent: Option<&'a Span>,
    pub(crate) wrapped: Option<ExternalSpan>,
    pub(crate) span_id: u64,
    pub(crate) trace_id: u64,
}

pub(crate) fn start(args: StartArgs<'_>) -> Span {
    let StartArgs {
        tracer,
        operation,
        start_ts,
        service,
        outer,
        parent,
        wrapped,
        span_id,
        trace_id,
    } = args;

    let caller_owned = wrapped.is_some();
    let external = match wrapped {
        Some(handle) => ExternalState::Wrapped(handle),
        // Wrapped spans proxy a span the backend already knows about, so
        // only machinery-started spans open a delegated counterpart.
        None => match tracer.start_external(&operation, start_ts, parent) {
            Some(handle) => ExternalState::Delegated(Mutex::new(Some(handle))),
            None => ExternalState::None,
        },
    };

    Span {
        inner: Arc::new(SpanInner {
            span_id,
            trace_id,
            parent_span_id: parent.map(|p| p.span_id()).unwrap_or(0),
            operation,
            tracer: tracer.clone(),
            parent: parent.map(|p| Arc::downgrade(&p.inner)),
            external,
            data: Mutex::new(SpanData {
                start_ts,
                finish_ts: 0,
                service,
                tags: TagSet::new(),
                is_outer: outer,
                caller_owned,
                is_dispatch: false,
                is_encode: false,
                orphaned: false,
                stage: Stage::Open,
            }),
        }),
    }
}

struct FinishSnapshot {
    duration_us: u64,
    finish_ts: u64,
    is_dispatch: bool,
    is_encode: bool,
}

impl Span {
    /// Process-unique identifier of this span.
    pub fn span_id(&self) -> u64 {
        self.inner.span_id
    }

    /// Identifier shared by every span in this span's tree.
    pub fn trace_id(&self) -> u64 {
        self.inner.trace_id
    }

    /// Identifier of the parent span, if the span was started with a
    /// reference.
    pub fn parent_span_id(&self) -> Option<u64> {
        if self.inner.parent_span_id == 0 {
            None
        } else {
            Some(self.inner.parent_span_id)
        }
    }

    /// The parent span, if it was referenced at start and at least one
    /// handle to it is still alive.
    pub fn parent(&self) -> Option<Span> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Span { inner })
    }

    /// The operation name given at start. Immutable.
    pub fn operation(&self) -> &str {
        &self.inner.operation
    }

    /// The service category used for threshold bucketing.
    pub fn service(&self) -> Service {
        self.inner.data().service
    }

    /// Set the service category.
    pub fn set_service(&self, service: Service) {
        self.inner.mutate_open("service", |data| data.service = service);
    }

    /// Start timestamp, microseconds since the Unix epoch.
    pub fn start_ts(&self) -> u64 {
        self.inner.data().start_ts
    }

    /// Finish timestamp, or `None` while the span is open.
    pub fn finish_ts(&self) -> Option<u64> {
        let data = self.inner.data();
        match data.finish_ts {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Whether [`finish`] has been called.
    ///
    /// [`finish`]: Span::finish
    pub fn is_finished(&self) -> bool {
        self.inner.data().stage != Stage::Open
    }

    /// Wall-clock duration in microseconds, `0` while the span is open.
    pub fn duration_us(&self) -> u64 {
        let data = self.inner.data();
        match data.finish_ts {
            0 => 0,
            ts => ts.saturating_sub(data.start_ts),
        }
    }

    /// Whether this span covers a whole operation as seen by the caller.
    pub fn is_outer(&self) -> bool {
        self.inner.data().is_outer
    }

    /// Mark or unmark the span as an outer span.
    ///
    /// Calling this with `true` also transfers finish ownership to the
    /// caller: the span stops being eligible for automatic finishing, as
    /// reported by [`should_finish`]. Spans created outer through
    /// [`SpanBuilder::outer`] keep their eligibility.
    ///
    /// [`should_finish`]: Span::should_finish
    /// [`SpanBuilder::outer`]: crate::SpanBuilder::outer
    pub fn set_is_outer(&self, outer: bool) {
        self.inner.mutate_open("is_outer", |data| {
            data.is_outer = outer;
            data.caller_owned = outer;
        });
    }

    /// Whether the span represents one dispatch attempt over a socket.
    pub fn is_dispatch(&self) -> bool {
        self.inner.data().is_dispatch
    }

    /// Mark the span as a dispatch span. When a dispatch span finishes, its
    /// duration and socket-level annotations are copied up to the parent,
    /// so retries leave both a last-attempt and a cumulative record there.
    pub fn set_is_dispatch(&self, dispatch: bool) {
        self.inner.mutate_open("is_dispatch", |data| data.is_dispatch = dispatch);
    }

    /// Whether the span represents request encoding.
    pub fn is_encode(&self) -> bool {
        self.inner.data().is_encode
    }

    /// Mark the span as an encode span. When an encode span finishes, its
    /// duration accumulates on the parent as the encoding duration.
    pub fn set_is_encode(&self, encode: bool) {
        self.inner.mutate_open("is_encode", |data| data.is_encode = encode);
    }

    /// Whether the operation behind this span was abandoned.
    pub fn is_orphaned(&self) -> bool {
        self.inner.data().orphaned
    }

    /// Flag the span as orphaned: the response belongs to an operation the
    /// caller no longer waits for. Orphaned spans are logged immediately at
    /// finish and kept out of threshold comparison.
    pub fn mark_orphaned(&self) {
        self.inner.mutate_open("orphaned", |data| data.orphaned = true);
    }

    /// Whether the machinery may finish this span automatically.
    ///
    /// Returns `false` once the span is finished, and for spans whose
    /// finish ownership rests with the caller (wrapped spans and spans
    /// flagged outer after creation).
    pub fn should_finish(&self) -> bool {
        let data = self.inner.data();
        data.stage == Stage::Open && !data.caller_owned
    }

    /// Add a tag, overwriting any previous value under the same key.
    ///
    /// Writes to a finished span are dropped with a warning.
    pub fn add_tag(&self, key: impl Into<Cow<'static, str>>, value: impl Into<TagValue>) {
        let key = key.into();
        let value = value.into();
        {
            let mut data = self.inner.data();
            if data.stage != Stage::Open {
                drop(data);
                dbtrace_warn!(
                    name: "span_mutated_after_finish",
                    span_id = self.inner.span_id,
                    field = &*key
                );
                return;
            }
            data.tags.insert(key.clone(), value.clone());
        }
        self.inner.tracer.forward_tag(self, &key, &value);
    }

    /// Add a string tag.
    pub fn add_tag_str(
        &self,
        key: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
    ) {
        self.add_tag(key, TagValue::Str(value.into()));
    }

    /// Add a u64 tag.
    pub fn add_tag_u64(&self, key: impl Into<Cow<'static, str>>, value: u64) {
        self.add_tag(key, value);
    }

    /// Add a f64 tag.
    pub fn add_tag_f64(&self, key: impl Into<Cow<'static, str>>, value: f64) {
        self.add_tag(key, value);
    }

    /// Add a bool tag.
    pub fn add_tag_bool(&self, key: impl Into<Cow<'static, str>>, value: bool) {
        self.add_tag(key, value);
    }

    /// Look up a string tag. See [`TagSet::get_str`] for the error
    /// contract.
    ///
    /// [`TagSet::get_str`]: crate::TagSet::get_str
    pub fn get_tag_str(&self, key: &str) -> TraceResult<String> {
        self.inner.data().tags.get_str(key).map(str::to_owned)
    }

    /// Look up a u64 tag.
    pub fn get_tag_u64(&self, key: &str) -> TraceResult<u64> {
        self.inner.data().tags.get_u64(key)
    }

    /// Look up a f64 tag.
    pub fn get_tag_f64(&self, key: &str) -> TraceResult<f64> {
        self.inner.data().tags.get_f64(key)
    }

    /// Look up a bool tag.
    pub fn get_tag_bool(&self, key: &str) -> TraceResult<bool> {
        self.inner.data().tags.get_bool(key)
    }

    /// Snapshot of the span's tags.
    pub fn tags(&self) -> TagSet {
        self.inner.data().tags.clone()
    }

    /// Finish the span at `finish_ts` (microseconds since the Unix epoch,
    /// `0` to use the current time) and hand it to the tracer it was
    /// started under.
    ///
    /// The first call wins. Finishing an already-finished span is a no-op
    /// that leaves a warning in the internal logs. The finish timestamp is
    /// clamped so it never precedes the start timestamp.
    pub fn finish(&self, finish_ts: u64) {
        let resolved = resolve_ts(finish_ts);
        let snapshot = {
            let mut data = self.inner.data();
            if data.stage != Stage::Open {
                drop(data);
                dbtrace_warn!(
                    name: "span_already_finished",
                    span_id = self.inner.span_id,
                    operation = self.operation()
                );
                return;
            }
            let finish_ts = resolved.max(data.start_ts);
            data.finish_ts = finish_ts;
            data.stage = Stage::Finished;
            FinishSnapshot {
                duration_us: finish_ts - data.start_ts,
                finish_ts,
                is_dispatch: data.is_dispatch,
                is_encode: data.is_encode,
            }
        };

        // Under full delegation the backend owns the span tree and sees
        // every child directly, so nothing is copied between spans here.
        if !self.inner.tracer.is_delegate() {
            if snapshot.is_dispatch {
                self.copy_up_dispatch(snapshot.duration_us);
            }
            if snapshot.is_encode {
                self.copy_up_encode(snapshot.duration_us);
            }
        }

        self.inner
            .with_delegated(|handle| self.inner.tracer.end_external(handle, snapshot.finish_ts));
        self.inner.tracer.on_span_finished(self);
        self.inner.data().stage = Stage::Reported;
    }

    fn copy_up_dispatch(&self, duration_us: u64) {
        let Some(parent) = self.parent() else {
            return;
        };
        let (server_us, remote, local, local_id, operation_id) = {
            let data = self.inner.data();
            (
                data.tags.get_u64(tags::SERVER_DURATION_US).ok(),
                socket_of(&data.tags, tags::PEER_ADDRESS, tags::PEER_PORT),
                socket_of(&data.tags, tags::LOCAL_ADDRESS, tags::LOCAL_PORT),
                data.tags.get(tags::LOCAL_ID).cloned(),
                data.tags.get(tags::OPERATION_ID).cloned(),
            )
        };

        let mut parent_data = parent.inner.data();
        if parent_data.stage != Stage::Open {
            return;
        }
        parent_data.tags.insert(tags::LAST_DISPATCH_DURATION_US, duration_us);
        accumulate(&mut parent_data.tags, tags::TOTAL_DISPATCH_DURATION_US, duration_us);
        if let Some(server_us) = server_us {
            parent_data.tags.insert(tags::LAST_SERVER_DURATION_US, server_us);
            accumulate(&mut parent_data.tags, tags::TOTAL_SERVER_DURATION_US, server_us);
        }
        if let Some(remote) = remote {
            parent_data.tags.insert(tags::LAST_REMOTE_SOCKET, remote);
        }
        if let Some(local) = local {
            parent_data.tags.insert(tags::LAST_LOCAL_SOCKET, local);
        }
        if let Some(local_id) = local_id {
            parent_data.tags.insert(tags::LAST_LOCAL_ID, local_id);
        }
        if let Some(operation_id) = operation_id {
            parent_data.tags.insert(tags::LAST_OPERATION_ID, operation_id);
        }
    }

    fn copy_up_encode(&self, duration_us: u64) {
        let Some(parent) = self.parent() else {
            return;
        };
        let mut parent_data = parent.inner.data();
        if parent_data.stage != Stage::Open {
            return;
        }
        accumulate(&mut parent_data.tags, tags::ENCODE_DURATION_US, duration_us);
    }

    pub(crate) fn inner(&self) -> &SpanInner {
        &self.inner
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.data();
        f.debug_struct("Span")
            .field("span_id", &self.inner.span_id)
            .field("trace_id", &self.inner.trace_id)
            .field("operation", &self.inner.operation)
            .field("service", &data.service)
            .field("finished", &(data.stage != Stage::Open))
            .finish()
    }
}

/// Configures a [`Span`] before it starts.
///
/// Obtained from [`Registry::span_builder`].
///
/// [`Registry::span_builder`]: crate::Registry::span_builder
#[derive(Debug)]
pub struct SpanBuilder<'a> {
    registry: &'a Registry,
    operation: Cow<'static, str>,
    start_ts: u64,
    service: Service,
    outer: bool,
    reference: Reference<'a>,
}

impl<'a> SpanBuilder<'a> {
    pub(crate) fn new(registry: &'a Registry, operation: Cow<'static, str>) -> Self {
        SpanBuilder {
            registry,
            operation,
            start_ts: TIMESTAMP_AUTO,
            service: Service::Unset,
            outer: false,
            reference: Reference::None,
        }
    }

    /// Start the span at `ts` (microseconds since the Unix epoch) instead
    /// of the current time.
    pub fn with_start_ts(mut self, ts: u64) -> Self {
        self.start_ts = ts;
        self
    }

    /// Assign the service category.
    pub fn with_service(mut self, service: Service) -> Self {
        self.service = service;
        self
    }

    /// Link the span as a child of `parent`.
    pub fn child_of(mut self, parent: &'a Span) -> Self {
        self.reference = Reference::ChildOf(parent);
        self
    }

    /// Link the span as following from `cause`.
    pub fn follows_from(mut self, cause: &'a Span) -> Self {
        self.reference = Reference::FollowsFrom(cause);
        self
    }

    /// Mark the span as an outer span from the start.
    ///
    /// Unlike [`Span::set_is_outer`], starting outer keeps the span
    /// eligible for automatic finishing.
    pub fn outer(mut self) -> Self {
        self.outer = true;
        self
    }

    /// Start the span under `tracer`.
    pub fn start(self, tracer: &Tracer) -> Span {
        self.registry.start_configured(
            tracer,
            self.operation,
            self.start_ts,
            self.service,
            self.outer,
            self.reference,
        )
    }
}

fn accumulate(tags: &mut TagSet, key: &'static str, amount_us: u64) {
    let total = tags.get_u64(key).unwrap_or(0);
    tags.insert(key, total.saturating_add(amount_us));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::tracer::SpanReporter;
    use crate::TraceError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CountingReporter {
        reported: Arc<AtomicUsize>,
    }

    impl SpanReporter for CountingReporter {
        fn report(&self, _span: &Span) -> TraceResult<()> {
            self.reported.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn builder_defaults_and_identity() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let span = registry
            .span_builder("get")
            .with_start_ts(1_000)
            .start(&tracer);

        assert_eq!(span.operation(), "get");
        assert_eq!(span.service(), Service::Unset);
        assert_eq!(span.start_ts(), 1_000);
        assert_eq!(span.finish_ts(), None);
        assert_eq!(span.duration_us(), 0);
        assert_eq!(span.parent_span_id(), None);
        assert!(span.parent().is_none());
        assert_ne!(span.span_id(), 0);
        assert_ne!(span.trace_id(), 0);
        assert!(!span.is_outer());
        assert!(!span.is_finished());
        assert!(span.should_finish());
    }

    #[test]
    fn children_share_the_trace() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let parent = registry
            .span_builder("get")
            .with_start_ts(1_000)
            .outer()
            .start(&tracer);
        let child = registry
            .span_builder("dispatch")
            .child_of(&parent)
            .with_start_ts(1_010)
            .start(&tracer);
        let cousin = registry
            .span_builder("retry")
            .follows_from(&child)
            .with_start_ts(1_020)
            .start(&tracer);

        assert_eq!(child.trace_id(), parent.trace_id());
        assert_eq!(child.parent_span_id(), Some(parent.span_id()));
        assert_eq!(cousin.trace_id(), parent.trace_id());
        assert_eq!(cousin.parent_span_id(), Some(child.span_id()));
        let upgraded = child.parent().expect("parent is alive");
        assert_eq!(upgraded.span_id(), parent.span_id());
    }

    #[test]
    fn parent_reference_is_weak() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let parent = registry
            .span_builder("get")
            .with_start_ts(1_000)
            .start(&tracer);
        let parent_id = parent.span_id();
        let child = registry
            .span_builder("dispatch")
            .child_of(&parent)
            .with_start_ts(1_010)
            .start(&tracer);

        drop(parent);
        assert!(child.parent().is_none());
        assert_eq!(child.parent_span_id(), Some(parent_id));
    }

    #[test]
    fn first_finish_wins() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let span = registry
            .span_builder("get")
            .with_start_ts(1_000)
            .start(&tracer);
        span.finish(1_500);
        span.finish(9_000);

        assert_eq!(span.finish_ts(), Some(1_500));
        assert_eq!(span.duration_us(), 500);
    }

    #[test]
    fn finished_spans_drop_late_writes() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let span = registry
            .span_builder("get")
            .with_service(Service::Kv)
            .with_start_ts(1_000)
            .start(&tracer);
        span.add_tag_str(tags::DB_INSTANCE, "travel-sample");
        span.finish(2_000);

        span.add_tag_str(tags::DB_INSTANCE, "late");
        span.add_tag_u64(tags::RETRIES, 3);
        span.set_service(Service::Query);
        span.set_is_outer(true);
        span.set_is_dispatch(true);
        span.set_is_encode(true);
        span.mark_orphaned();

        assert_eq!(span.get_tag_str(tags::DB_INSTANCE).unwrap(), "travel-sample");
        assert!(matches!(
            span.get_tag_u64(tags::RETRIES),
            Err(TraceError::NotFound { .. })
        ));
        assert_eq!(span.service(), Service::Kv);
        assert!(!span.is_outer());
        assert!(!span.is_dispatch());
        assert!(!span.is_encode());
        assert!(!span.is_orphaned());
    }

    #[test]
    fn finish_never_precedes_start() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let span = registry
            .span_builder("get")
            .with_start_ts(5_000)
            .start(&tracer);
        span.finish(1_000);

        assert_eq!(span.finish_ts(), Some(5_000));
        assert_eq!(span.duration_us(), 0);
    }

    #[test]
    fn auto_timestamps_resolve_to_the_clock() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let before = crate::now();
        let span = registry.span_builder("get").start(&tracer);
        assert!(span.start_ts() >= before);

        span.finish(TIMESTAMP_AUTO);
        assert!(span.finish_ts().expect("finished") >= span.start_ts());
    }

    #[test]
    fn outer_flag_set_late_moves_finish_ownership() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let eligible = registry
            .span_builder("get")
            .with_start_ts(1_000)
            .outer()
            .start(&tracer);
        assert!(eligible.is_outer());
        assert!(eligible.should_finish());

        let promoted = registry
            .span_builder("get")
            .with_start_ts(1_000)
            .start(&tracer);
        promoted.set_is_outer(true);
        assert!(promoted.is_outer());
        assert!(!promoted.should_finish());

        promoted.set_is_outer(false);
        assert!(promoted.should_finish());

        eligible.finish(2_000);
        assert!(!eligible.should_finish());
    }

    #[test]
    fn wrapped_spans_belong_to_the_caller() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let span = registry.wrap(&tracer, "outer-op", 1_000, ExternalSpan::new(7u32));
        assert!(span.is_outer());
        assert!(!span.should_finish());

        span.finish(2_000);
        assert_eq!(span.duration_us(), 1_000);
    }

    #[test]
    fn dispatch_finish_copies_timings_up() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let parent = registry
            .span_builder("get")
            .with_service(Service::Kv)
            .with_start_ts(1_000)
            .outer()
            .start(&tracer);

        let first = registry
            .span_builder("dispatch")
            .child_of(&parent)
            .with_start_ts(1_100)
            .start(&tracer);
        first.set_is_dispatch(true);
        first.add_tag_u64(tags::SERVER_DURATION_US, 20);
        first.add_tag_str(tags::PEER_ADDRESS, "10.0.0.1");
        first.add_tag_u64(tags::PEER_PORT, 11210);
        first.add_tag_str(tags::LOCAL_ID, "66e1/5cbe");
        first.add_tag_str(tags::OPERATION_ID, "0x15");
        first.finish(1_130);

        assert_eq!(
            parent.get_tag_u64(tags::LAST_DISPATCH_DURATION_US).unwrap(),
            30
        );
        assert_eq!(
            parent.get_tag_u64(tags::TOTAL_DISPATCH_DURATION_US).unwrap(),
            30
        );
        assert_eq!(parent.get_tag_u64(tags::LAST_SERVER_DURATION_US).unwrap(), 20);
        assert_eq!(
            parent.get_tag_u64(tags::TOTAL_SERVER_DURATION_US).unwrap(),
            20
        );
        assert_eq!(
            parent.get_tag_str(tags::LAST_REMOTE_SOCKET).unwrap(),
            "10.0.0.1:11210"
        );
        assert_eq!(parent.get_tag_str(tags::LAST_LOCAL_ID).unwrap(), "66e1/5cbe");
        assert_eq!(parent.get_tag_str(tags::LAST_OPERATION_ID).unwrap(), "0x15");

        // A retry overwrites the last-attempt values and accumulates the
        // totals.
        let second = registry
            .span_builder("dispatch")
            .child_of(&parent)
            .with_start_ts(1_200)
            .start(&tracer);
        second.set_is_dispatch(true);
        second.add_tag_u64(tags::SERVER_DURATION_US, 35);
        second.add_tag_str(tags::PEER_ADDRESS, "10.0.0.2");
        second.add_tag_u64(tags::PEER_PORT, 11210);
        second.add_tag_str(tags::OPERATION_ID, "0x16");
        second.finish(1_250);

        assert_eq!(
            parent.get_tag_u64(tags::LAST_DISPATCH_DURATION_US).unwrap(),
            50
        );
        assert_eq!(
            parent.get_tag_u64(tags::TOTAL_DISPATCH_DURATION_US).unwrap(),
            80
        );
        assert_eq!(parent.get_tag_u64(tags::LAST_SERVER_DURATION_US).unwrap(), 35);
        assert_eq!(
            parent.get_tag_u64(tags::TOTAL_SERVER_DURATION_US).unwrap(),
            55
        );
        assert_eq!(
            parent.get_tag_str(tags::LAST_REMOTE_SOCKET).unwrap(),
            "10.0.0.2:11210"
        );
        assert_eq!(parent.get_tag_str(tags::LAST_OPERATION_ID).unwrap(), "0x16");
        // No fresher local id arrived, the first one stands.
        assert_eq!(parent.get_tag_str(tags::LAST_LOCAL_ID).unwrap(), "66e1/5cbe");
    }

    #[test]
    fn encode_finish_accumulates_on_the_parent() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let parent = registry
            .span_builder("upsert")
            .with_start_ts(1_000)
            .outer()
            .start(&tracer);

        for (start, finish) in [(1_010, 1_020), (1_030, 1_045)] {
            let encode = registry
                .span_builder("request_encoding")
                .child_of(&parent)
                .with_start_ts(start)
                .start(&tracer);
            encode.set_is_encode(true);
            encode.finish(finish);
        }

        assert_eq!(parent.get_tag_u64(tags::ENCODE_DURATION_US).unwrap(), 25);
    }

    #[test]
    fn copy_up_totals_saturate() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let parent = registry
            .span_builder("get")
            .with_start_ts(1_000)
            .outer()
            .start(&tracer);

        for _ in 0..2 {
            let dispatch = registry
                .span_builder("dispatch")
                .child_of(&parent)
                .with_start_ts(1_000)
                .start(&tracer);
            dispatch.set_is_dispatch(true);
            dispatch.add_tag_u64(tags::SERVER_DURATION_US, u64::MAX);
            dispatch.finish(u64::MAX);
        }

        assert_eq!(
            parent.get_tag_u64(tags::TOTAL_DISPATCH_DURATION_US).unwrap(),
            u64::MAX
        );
        assert_eq!(
            parent.get_tag_u64(tags::TOTAL_SERVER_DURATION_US).unwrap(),
            u64::MAX
        );
    }

    #[test]
    fn copy_up_skips_a_finished_parent() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let parent = registry
            .span_builder("get")
            .with_start_ts(1_000)
            .outer()
            .start(&tracer);
        let dispatch = registry
            .span_builder("dispatch")
            .child_of(&parent)
            .with_start_ts(1_100)
            .start(&tracer);
        dispatch.set_is_dispatch(true);

        parent.finish(1_150);
        dispatch.finish(1_200);

        assert!(matches!(
            parent.get_tag_u64(tags::LAST_DISPATCH_DURATION_US),
            Err(TraceError::NotFound { .. })
        ));
    }

    #[test]
    fn copy_up_without_a_parent_is_a_noop() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let dispatch = registry
            .span_builder("dispatch")
            .with_start_ts(1_000)
            .start(&tracer);
        dispatch.set_is_dispatch(true);
        dispatch.finish(1_050);

        assert_eq!(dispatch.duration_us(), 50);
    }

    #[test]
    fn typed_tag_lookups_report_mismatches() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let span = registry
            .span_builder("get")
            .with_start_ts(1_000)
            .start(&tracer);
        span.add_tag_str(tags::DB_OPERATION, "get");

        assert!(matches!(
            span.get_tag_u64(tags::DB_OPERATION),
            Err(TraceError::TypeMismatch { .. })
        ));
        assert!(matches!(
            span.get_tag_u64("no.such.tag"),
            Err(TraceError::NotFound { .. })
        ));
        assert_eq!(span.get_tag_str(tags::DB_OPERATION).unwrap(), "get");
    }

    #[test]
    fn reports_once_and_only_when_finished() {
        let reported = Arc::new(AtomicUsize::new(0));
        let tracer = Tracer::reporter(CountingReporter {
            reported: Arc::clone(&reported),
        });
        let registry = Registry::new();

        let span = registry
            .span_builder("get")
            .with_start_ts(1_000)
            .start(&tracer);
        span.finish(1_500);
        span.finish(2_000);
        assert_eq!(reported.load(Ordering::SeqCst), 1);

        let abandoned = registry
            .span_builder("get")
            .with_start_ts(1_000)
            .start(&tracer);
        drop(abandoned);
        assert_eq!(reported.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_the_same_span() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let span = registry
            .span_builder("get")
            .with_start_ts(1_000)
            .start(&tracer);
        let clone = span.clone();

        clone.add_tag_u64(tags::RETRIES, 2);
        clone.set_service(Service::Query);
        assert_eq!(span.get_tag_u64(tags::RETRIES).unwrap(), 2);
        assert_eq!(span.service(), Service::Query);

        clone.finish(1_400);
        assert!(span.is_finished());
        assert_eq!(span.duration_us(), 400);
    }

    #[test]
    fn orphan_flag_sticks() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let span = registry
            .span_builder("get")
            .with_start_ts(1_000)
            .start(&tracer);
        assert!(!span.is_orphaned());
        span.mark_orphaned();
        assert!(span.is_orphaned());
    }
}
