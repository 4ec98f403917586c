//! Threshold logging tracer.
//!
//! The built-in tracer answers one question: which operations were slow
//! recently, and where did the time go? Finished outer spans whose
//! duration reaches their service's eligibility floor are condensed into
//! summaries and aggregated per service, keeping only the slowest
//! `per_service_top_k` per flush interval. Orphaned spans bypass the
//! floor and land in their own bounded ring. A dedicated flush thread
//! periodically swaps out the aggregated state, builds a
//! [`FlushReport`](report::FlushReport) and hands it to the configured
//! [`ReportSink`](report::ReportSink), so report serialization never
//! runs on the thread that finished a span.

mod aggregator;
pub mod report;

use std::env;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use aggregator::Aggregator;
use report::{LogReportSink, OrphanEntry, ReportSink, SpanSummary};

use crate::span::{Service, Span};
use crate::{dbtrace_debug, dbtrace_warn, TraceError, TraceResult};

/// Delay interval between two consecutive flushes, in milliseconds.
pub(crate) const DBTRACE_THRESHOLD_FLUSH_INTERVAL: &str = "DBTRACE_THRESHOLD_FLUSH_INTERVAL";
/// Default delay interval between two consecutive flushes.
pub(crate) const DBTRACE_THRESHOLD_FLUSH_INTERVAL_DEFAULT: u64 = 10_000;
/// Number of span summaries kept per service per interval.
pub(crate) const DBTRACE_THRESHOLD_TOP_K: &str = "DBTRACE_THRESHOLD_TOP_K";
/// Default number of span summaries kept per service per interval.
pub(crate) const DBTRACE_THRESHOLD_TOP_K_DEFAULT: usize = 10;
/// Number of orphaned spans kept per interval.
pub(crate) const DBTRACE_ORPHAN_CAPACITY: &str = "DBTRACE_ORPHAN_CAPACITY";
/// Default number of orphaned spans kept per interval.
pub(crate) const DBTRACE_ORPHAN_CAPACITY_DEFAULT: usize = 128;
/// Baseline duration floor for reporting, in microseconds.
pub(crate) const DBTRACE_MIN_DURATION_TO_REPORT: &str = "DBTRACE_MIN_DURATION_TO_REPORT";
/// Default baseline duration floor for reporting.
pub(crate) const DBTRACE_MIN_DURATION_TO_REPORT_DEFAULT: u64 = 500_000;

/// Per-service eligibility floors used when neither the service nor the
/// baseline floor was configured. Key-value traffic defaults to 500 ms,
/// the query-style services to 1 s.
fn seeded_floor(service: Service, min_duration_to_report: Duration) -> Duration {
    match service {
        Service::Kv => Duration::from_millis(500),
        Service::Query | Service::View | Service::Search | Service::Analytics => {
            Duration::from_secs(1)
        }
        Service::Unset => min_duration_to_report,
    }
}

/// Configuration for the [`ThresholdLoggingTracer`]. Immutable once the
/// tracer is constructed.
#[derive(Clone, Debug)]
pub struct ThresholdConfig {
    pub(crate) flush_interval: Duration,
    pub(crate) per_service_top_k: usize,
    pub(crate) orphan_capacity: usize,
    pub(crate) service_floors: [Duration; Service::COUNT],
}

impl ThresholdConfig {
    pub(crate) fn floor_for(&self, service: Service) -> Duration {
        self.service_floors[service.bucket_index()]
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        ThresholdConfigBuilder::default().build()
    }
}

/// A builder for [`ThresholdConfig`] instances.
#[derive(Debug)]
pub struct ThresholdConfigBuilder {
    flush_interval: Duration,
    per_service_top_k: usize,
    orphan_capacity: usize,
    min_duration_to_report: Option<Duration>,
    service_floors: [Option<Duration>; Service::COUNT],
}

impl Default for ThresholdConfigBuilder {
    /// Create a new [`ThresholdConfigBuilder`] initialized with the
    /// default values, overridden by environment variables if set.
    /// The supported environment variables are:
    /// * `DBTRACE_THRESHOLD_FLUSH_INTERVAL` (milliseconds)
    /// * `DBTRACE_THRESHOLD_TOP_K`
    /// * `DBTRACE_ORPHAN_CAPACITY`
    /// * `DBTRACE_MIN_DURATION_TO_REPORT` (microseconds)
    fn default() -> Self {
        ThresholdConfigBuilder {
            flush_interval: Duration::from_millis(DBTRACE_THRESHOLD_FLUSH_INTERVAL_DEFAULT),
            per_service_top_k: DBTRACE_THRESHOLD_TOP_K_DEFAULT,
            orphan_capacity: DBTRACE_ORPHAN_CAPACITY_DEFAULT,
            min_duration_to_report: None,
            service_floors: [None; Service::COUNT],
        }
        .init_from_env_vars()
    }
}

impl ThresholdConfigBuilder {
    /// Set the delay between two consecutive flushes. The default is
    /// 10 seconds.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Set how many of the slowest spans each service keeps per
    /// interval. The default is 10. A value of `0` still counts spans
    /// but reports no summaries.
    pub fn with_per_service_top_k(mut self, per_service_top_k: usize) -> Self {
        self.per_service_top_k = per_service_top_k;
        self
    }

    /// Set how many orphaned spans are kept per interval. The default
    /// is 128. Older entries are evicted first once the ring is full.
    pub fn with_orphan_capacity(mut self, orphan_capacity: usize) -> Self {
        self.orphan_capacity = orphan_capacity;
        self
    }

    /// Set the baseline duration floor a span must reach to be
    /// reported. The default is 500 milliseconds.
    ///
    /// Setting this explicitly also rebases the seeded per-service
    /// floors, so every service without its own
    /// [`with_service_threshold`] entry uses this value.
    ///
    /// [`with_service_threshold`]: ThresholdConfigBuilder::with_service_threshold
    pub fn with_min_duration_to_report(mut self, min_duration_to_report: Duration) -> Self {
        self.min_duration_to_report = Some(min_duration_to_report);
        self
    }

    /// Set the duration floor for one service, overriding both the
    /// seeded default and the baseline floor.
    pub fn with_service_threshold(mut self, service: Service, threshold: Duration) -> Self {
        self.service_floors[service.bucket_index()] = Some(threshold);
        self
    }

    /// Builds a `ThresholdConfig`, resolving the per-service floors.
    pub fn build(self) -> ThresholdConfig {
        let min_duration_to_report = self
            .min_duration_to_report
            .unwrap_or(Duration::from_micros(DBTRACE_MIN_DURATION_TO_REPORT_DEFAULT));

        let mut service_floors = [Duration::ZERO; Service::COUNT];
        for (index, floor) in service_floors.iter_mut().enumerate() {
            *floor = self.service_floors[index].unwrap_or_else(|| {
                if self.min_duration_to_report.is_some() {
                    min_duration_to_report
                } else {
                    seeded_floor(Service::from_bucket_index(index), min_duration_to_report)
                }
            });
        }

        ThresholdConfig {
            flush_interval: self.flush_interval,
            per_service_top_k: self.per_service_top_k,
            orphan_capacity: self.orphan_capacity,
            service_floors,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(flush_interval) = env::var(DBTRACE_THRESHOLD_FLUSH_INTERVAL)
            .ok()
            .and_then(|interval| u64::from_str(&interval).ok())
        {
            self.flush_interval = Duration::from_millis(flush_interval);
        }

        if let Some(per_service_top_k) = env::var(DBTRACE_THRESHOLD_TOP_K)
            .ok()
            .and_then(|top_k| usize::from_str(&top_k).ok())
        {
            self.per_service_top_k = per_service_top_k;
        }

        if let Some(orphan_capacity) = env::var(DBTRACE_ORPHAN_CAPACITY)
            .ok()
            .and_then(|capacity| usize::from_str(&capacity).ok())
        {
            self.orphan_capacity = orphan_capacity;
        }

        if let Some(min_duration) = env::var(DBTRACE_MIN_DURATION_TO_REPORT)
            .ok()
            .and_then(|micros| u64::from_str(&micros).ok())
        {
            self.min_duration_to_report = Some(Duration::from_micros(min_duration));
        }

        self
    }
}

enum ControlMessage {
    ForceFlush(SyncSender<TraceResult<()>>),
    Shutdown(SyncSender<TraceResult<()>>),
}

/// The built-in tracer: bounded per-service aggregation of slow
/// operations, flushed periodically to a [`ReportSink`] from a
/// dedicated thread.
#[derive(Debug)]
pub struct ThresholdLoggingTracer {
    aggregator: Arc<Aggregator>,
    config: ThresholdConfig,
    message_sender: SyncSender<ControlMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    forceflush_timeout: Duration,
    shutdown_timeout: Duration,
    is_shutdown: AtomicBool,
    sink_failures: Arc<AtomicU64>,
}

impl ThresholdLoggingTracer {
    /// Creates a tracer that feeds `sink`, spawning its flush thread.
    pub fn new<S>(sink: S, config: ThresholdConfig) -> Self
    where
        S: ReportSink + 'static,
    {
        let aggregator = Arc::new(Aggregator::new(
            config.per_service_top_k,
            config.orphan_capacity,
        ));
        let sink_failures = Arc::new(AtomicU64::new(0));
        let (message_sender, message_receiver) = sync_channel(4);
        let flush_interval = config.flush_interval;
        let worker_aggregator = Arc::clone(&aggregator);
        let worker_failures = Arc::clone(&sink_failures);
        let mut sink = sink;

        let handle = thread::Builder::new()
            .name("ThresholdFlushThread".to_string())
            .spawn(move || {
                let mut last_flush = Instant::now();

                loop {
                    let timeout = flush_interval.saturating_sub(last_flush.elapsed());
                    match message_receiver.recv_timeout(timeout) {
                        Ok(ControlMessage::ForceFlush(sender)) => {
                            let result =
                                flush_once(&worker_aggregator, &mut sink, &worker_failures);
                            let _ = sender.send(result);
                        }
                        Ok(ControlMessage::Shutdown(sender)) => {
                            let result =
                                flush_once(&worker_aggregator, &mut sink, &worker_failures);
                            let _ = sender.send(result);
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if last_flush.elapsed() >= flush_interval {
                                let _ = flush_once(&worker_aggregator, &mut sink, &worker_failures);
                                last_flush = Instant::now();
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("Failed to spawn thread");

        ThresholdLoggingTracer {
            aggregator,
            config,
            message_sender,
            handle: Mutex::new(Some(handle)),
            forceflush_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            is_shutdown: AtomicBool::new(false),
            sink_failures,
        }
    }

    /// Returns a builder that feeds `sink`, configured with
    /// [`ThresholdConfig::default`].
    pub fn builder<S>(sink: S) -> ThresholdLoggingTracerBuilder<S>
    where
        S: ReportSink + 'static,
    {
        ThresholdLoggingTracerBuilder {
            sink,
            config: ThresholdConfig::default(),
        }
    }

    /// Considers one finished span for aggregation.
    pub(crate) fn on_span_finished(&self, span: &Span) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            dbtrace_debug!(name: "span_after_tracer_shutdown", span_id = span.span_id());
            return;
        }
        let service = span.service();

        if span.is_orphaned() {
            dbtrace_warn!(
                name: "orphaned_response",
                service = service.as_str(),
                operation = span.operation(),
                span_id = span.span_id(),
                duration_us = span.duration_us()
            );
            self.aggregator.record_orphan(OrphanEntry {
                service,
                summary: SpanSummary::from_span(span),
            });
            return;
        }

        if !span.is_outer() {
            return;
        }
        let duration_us = span.duration_us();
        if duration_us < self.config.floor_for(service).as_micros() as u64 {
            return;
        }
        self.aggregator.record(service, SpanSummary::from_span(span));
    }

    /// Flushes the current interval immediately, waiting for the sink.
    pub fn force_flush(&self) -> TraceResult<()> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(TraceError::InvalidState("tracer already shut down"));
        }
        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .try_send(ControlMessage::ForceFlush(sender))
            .map_err(|_| TraceError::InvalidState("flush thread is not running"))?;

        receiver
            .recv_timeout(self.forceflush_timeout)
            .map_err(|_| TraceError::BackendFailure("timed out waiting for flush".to_owned()))?
    }

    /// Performs one final flush, stops the flush thread and joins it.
    /// Safe to call more than once; later calls return `Ok` without
    /// doing anything.
    pub fn shutdown(&self) -> TraceResult<()> {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .try_send(ControlMessage::Shutdown(sender))
            .map_err(|_| TraceError::InvalidState("flush thread is not running"))?;

        let result = receiver
            .recv_timeout(self.shutdown_timeout)
            .map_err(|_| {
                TraceError::BackendFailure("timed out waiting for the final flush".to_owned())
            })?;
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle
                .join()
                .map_err(|_| TraceError::BackendFailure("flush thread panicked".to_owned()))?;
        }
        result
    }

    pub(crate) fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }
}

impl Default for ThresholdLoggingTracer {
    /// A tracer with default configuration that logs each report as one
    /// JSON line through the crate's internal logs.
    fn default() -> Self {
        ThresholdLoggingTracer::new(LogReportSink::default(), ThresholdConfig::default())
    }
}

impl Drop for ThresholdLoggingTracer {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            let reason = err.to_string();
            dbtrace_warn!(name: "threshold_shutdown_failed_in_drop", reason = reason.as_str());
        }
    }
}

/// A builder for [`ThresholdLoggingTracer`] instances.
#[derive(Debug)]
pub struct ThresholdLoggingTracerBuilder<S> {
    sink: S,
    config: ThresholdConfig,
}

impl<S> ThresholdLoggingTracerBuilder<S>
where
    S: ReportSink + 'static,
{
    /// Replace the configuration.
    pub fn with_config(mut self, config: ThresholdConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the tracer, spawning its flush thread.
    pub fn build(self) -> ThresholdLoggingTracer {
        ThresholdLoggingTracer::new(self.sink, self.config)
    }
}

fn flush_once<S: ReportSink>(
    aggregator: &Aggregator,
    sink: &mut S,
    sink_failures: &AtomicU64,
) -> TraceResult<()> {
    let Some(report) = aggregator.take_report() else {
        return Ok(());
    };
    match catch_unwind(AssertUnwindSafe(|| sink.emit(report))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            sink_failures.fetch_add(1, Ordering::Relaxed);
            let reason = err.to_string();
            dbtrace_warn!(name: "report_sink_failed", reason = reason.as_str());
            Err(err)
        }
        Err(_) => {
            sink_failures.fetch_add(1, Ordering::Relaxed);
            dbtrace_warn!(name: "report_sink_panicked");
            Err(TraceError::BackendFailure("report sink panicked".to_owned()))
        }
    }
}
