//! Span registry and id generation.

use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt;

use rand::{rngs, Rng, SeedableRng};

use crate::resolve_ts;
use crate::span::{self, Reference, Service, Span, SpanBuilder, StartArgs};
use crate::tracer::{ExternalSpan, Tracer};

/// Interface for generating span and trace ids.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new trace id.
    fn new_trace_id(&self) -> u64;

    /// Generate a new span id.
    fn new_span_id(&self) -> u64;
}

/// Default [`IdGenerator`] implementation.
///
/// Generates span and trace ids using a random number generator. Zero
/// marks "no id" on the wire and is never produced.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> u64 {
        CURRENT_RNG.with(|rng| non_zero(&mut rng.borrow_mut()))
    }

    fn new_span_id(&self) -> u64 {
        CURRENT_RNG.with(|rng| non_zero(&mut rng.borrow_mut()))
    }
}

fn non_zero(rng: &mut rngs::SmallRng) -> u64 {
    loop {
        let id = rng.gen::<u64>();
        if id != 0 {
            return id;
        }
    }
}

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

/// [`IdGenerator`] implementation that increments a counter for each new
/// id. This helps produce predictable ids for testing.
#[derive(Debug)]
pub struct SequentialIdGenerator(std::sync::atomic::AtomicU64);

impl SequentialIdGenerator {
    /// Create a new [`SequentialIdGenerator`] starting at 1.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self(std::sync::atomic::AtomicU64::new(1))
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn new_trace_id(&self) -> u64 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    fn new_span_id(&self) -> u64 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }
}

/// Creates spans and issues their identifiers.
///
/// One registry serves a whole client instance. Spans do not keep a
/// reference back to the registry; it can be dropped while spans are
/// still open.
#[derive(Debug)]
pub struct Registry {
    ids: Box<dyn IdGenerator>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    /// Create a registry with the default random id generator.
    pub fn new() -> Self {
        Registry {
            ids: Box::new(RandomIdGenerator::default()),
        }
    }

    /// Create a registry with a custom id generator.
    pub fn with_id_generator(ids: Box<dyn IdGenerator>) -> Self {
        Registry { ids }
    }

    /// Start a new span under `tracer`.
    ///
    /// `start_ts` is microseconds since the Unix epoch, `0` for the
    /// current time. With a [`Reference::ChildOf`] or
    /// [`Reference::FollowsFrom`] reference the span joins the referenced
    /// span's trace; otherwise it starts a new one.
    pub fn start(
        &self,
        tracer: &Tracer,
        operation: impl Into<Cow<'static, str>>,
        start_ts: u64,
        reference: Reference<'_>,
    ) -> Span {
        self.start_configured(
            tracer,
            operation.into(),
            start_ts,
            Service::Unset,
            false,
            reference,
        )
    }

    /// Start configuring a span. Finish with [`SpanBuilder::start`].
    ///
    /// [`SpanBuilder::start`]: crate::SpanBuilder::start
    pub fn span_builder(&self, operation: impl Into<Cow<'static, str>>) -> SpanBuilder<'_> {
        SpanBuilder::new(self, operation.into())
    }

    /// Start a span that proxies a caller-owned external span.
    ///
    /// The handle is stored untouched and passed through to delegating
    /// backends as the parent of spans started below this one; the
    /// subsystem never interprets it. Finish ownership stays with the
    /// caller, so [`Span::should_finish`] reports `false` for the result.
    ///
    /// [`Span::should_finish`]: crate::Span::should_finish
    pub fn wrap(
        &self,
        tracer: &Tracer,
        operation: impl Into<Cow<'static, str>>,
        start_ts: u64,
        external: ExternalSpan,
    ) -> Span {
        span::start(StartArgs {
            tracer,
            operation: operation.into(),
            start_ts: resolve_ts(start_ts),
            service: Service::Unset,
            outer: true,
            parent: None,
            wrapped: Some(external),
            span_id: self.ids.new_span_id(),
            trace_id: self.ids.new_trace_id(),
        })
    }

    pub(crate) fn start_configured(
        &self,
        tracer: &Tracer,
        operation: Cow<'static, str>,
        start_ts: u64,
        service: Service,
        outer: bool,
        reference: Reference<'_>,
    ) -> Span {
        let parent = reference.span();
        let trace_id = parent
            .map(Span::trace_id)
            .unwrap_or_else(|| self.ids.new_trace_id());
        span::start(StartArgs {
            tracer,
            operation,
            start_ts: resolve_ts(start_ts),
            service,
            outer,
            parent,
            wrapped: None,
            span_id: self.ids.new_span_id(),
            trace_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_non_zero_and_distinct() {
        let ids = RandomIdGenerator::default();
        let a = ids.new_span_id();
        let b = ids.new_span_id();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn sequential_ids_count_up() {
        let ids = SequentialIdGenerator::new();
        assert_eq!(ids.new_trace_id(), 1);
        assert_eq!(ids.new_span_id(), 2);
        assert_eq!(ids.new_span_id(), 3);
    }

    #[test]
    fn root_spans_get_fresh_trace_ids() {
        let registry = Registry::with_id_generator(Box::new(SequentialIdGenerator::new()));
        let tracer = Tracer::disabled();

        let first = registry.start(&tracer, "get", 0, Reference::None);
        let second = registry.start(&tracer, "get", 0, Reference::None);

        assert_ne!(first.trace_id(), second.trace_id());
        assert_ne!(first.span_id(), second.span_id());
        assert_eq!(first.parent_span_id(), None);
    }

    #[test]
    fn children_join_the_parent_trace() {
        let registry = Registry::new();
        let tracer = Tracer::disabled();

        let parent = registry.start(&tracer, "get", 0, Reference::None);
        let child = registry.start(&tracer, "dispatch", 0, Reference::ChildOf(&parent));
        let follower = registry.start(&tracer, "retry", 0, Reference::FollowsFrom(&child));

        assert_eq!(child.trace_id(), parent.trace_id());
        assert_eq!(child.parent_span_id(), Some(parent.span_id()));
        assert_eq!(follower.trace_id(), parent.trace_id());
        assert_eq!(follower.parent_span_id(), Some(child.span_id()));
    }
}
