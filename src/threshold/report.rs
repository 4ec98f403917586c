//! Flush reports and the sinks that receive them.
//!
//! Once per flush interval the threshold tracer condenses everything it
//! aggregated into a [`FlushReport`] and hands it to a [`ReportSink`].
//! The default [`LogReportSink`] serializes the report to JSON and emits
//! it through the crate's internal logs; [`InMemoryReportSink`] stores
//! reports for inspection and is what the crate's own tests use.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::conventions::tags;
use crate::span::{Service, Span};
use crate::tag::{socket_of, TagSet};
use crate::{dbtrace_info, TraceError, TraceResult};

/// Everything one flush interval learned about slow and orphaned
/// operations.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FlushReport {
    /// Per-service sections. Services that saw no qualifying span during
    /// the interval are omitted.
    pub services: Vec<ServiceReport>,
    /// Orphaned responses observed during the interval, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphans: Option<OrphanReport>,
}

/// The slowest operations one service saw during the interval.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceReport {
    /// Service the entries below belong to.
    pub service: Service,
    /// Number of qualifying spans observed, including those that were
    /// later pushed out of `top` by slower ones.
    pub count: u64,
    /// Up to `per_service_top_k` summaries, slowest first.
    pub top: Vec<SpanSummary>,
}

/// Responses that arrived after their operation had already been
/// finished or abandoned.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrphanReport {
    /// Number of orphans observed, including entries evicted from
    /// `entries` once the ring filled up.
    pub count: u64,
    /// The most recent orphans, oldest first.
    pub entries: Vec<OrphanEntry>,
}

/// One orphaned span, tagged with the service it belonged to.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrphanEntry {
    /// Service the orphaned operation belonged to.
    pub service: Service,
    /// Condensed span fields, flattened into the entry.
    #[serde(flatten)]
    pub summary: SpanSummary,
}

/// Condensed view of one finished span, as it appears in flush reports.
///
/// The dispatch and server fields come from the copy-up tags a span
/// accumulates while its dispatch children finish. They are `None` when
/// the span never had a dispatch child and carries no socket tags of its
/// own.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SpanSummary {
    /// Operation name given when the span was started.
    pub operation: String,
    /// Process-unique span identifier.
    pub span_id: u64,
    /// Wall-clock duration of the span in microseconds.
    pub total_duration_us: u64,
    /// Time spent encoding the request payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encode_duration_us: Option<u64>,
    /// Duration of the most recent dispatch attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dispatch_duration_us: Option<u64>,
    /// Summed duration of every dispatch attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_dispatch_duration_us: Option<u64>,
    /// Server-side processing time reported with the last response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_server_duration_us: Option<u64>,
    /// Summed server-side processing time across dispatch attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_server_duration_us: Option<u64>,
    /// `host:port` of the server the last dispatch went to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_remote_socket: Option<String>,
    /// `host:port` of the local endpoint the last dispatch used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_local_socket: Option<String>,
    /// Connection identifier of the last dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_local_id: Option<String>,
    /// Wire-level identifier of the last request, usually the opaque.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_operation_id: Option<String>,
}

impl SpanSummary {
    /// Condenses `span` down to the fields a flush report carries.
    ///
    /// Socket fields prefer the copied-up `last_*` tags and fall back to
    /// the span's own `net.*` tags, so dispatch spans summarize cleanly
    /// too.
    pub fn from_span(span: &Span) -> SpanSummary {
        let snapshot = span.tags();
        SpanSummary {
            operation: span.operation().to_owned(),
            span_id: span.span_id(),
            total_duration_us: span.duration_us(),
            encode_duration_us: snapshot.get_u64(tags::ENCODE_DURATION_US).ok(),
            last_dispatch_duration_us: snapshot.get_u64(tags::LAST_DISPATCH_DURATION_US).ok(),
            total_dispatch_duration_us: snapshot.get_u64(tags::TOTAL_DISPATCH_DURATION_US).ok(),
            last_server_duration_us: snapshot
                .get_u64(tags::LAST_SERVER_DURATION_US)
                .or_else(|_| snapshot.get_u64(tags::SERVER_DURATION_US))
                .ok(),
            total_server_duration_us: snapshot.get_u64(tags::TOTAL_SERVER_DURATION_US).ok(),
            last_remote_socket: snapshot
                .get_str(tags::LAST_REMOTE_SOCKET)
                .ok()
                .map(str::to_owned)
                .or_else(|| socket_of(&snapshot, tags::PEER_ADDRESS, tags::PEER_PORT)),
            last_local_socket: snapshot
                .get_str(tags::LAST_LOCAL_SOCKET)
                .ok()
                .map(str::to_owned)
                .or_else(|| socket_of(&snapshot, tags::LOCAL_ADDRESS, tags::LOCAL_PORT)),
            last_local_id: first_tag_string(&snapshot, &[tags::LAST_LOCAL_ID, tags::LOCAL_ID]),
            last_operation_id: first_tag_string(
                &snapshot,
                &[tags::LAST_OPERATION_ID, tags::OPERATION_ID],
            ),
        }
    }
}

fn first_tag_string(snapshot: &TagSet, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| snapshot.get(key).map(ToString::to_string))
}

/// Receives completed flush reports.
///
/// `emit` runs on the tracer's flush thread, never on the thread that
/// finished a span, so a slow sink delays the next flush but not the
/// caller. Errors are counted and logged; reports are never retried.
pub trait ReportSink: Send + fmt::Debug {
    /// Deliver one report.
    fn emit(&mut self, report: FlushReport) -> TraceResult<()>;
}

/// Sink that serializes each report to JSON and writes it to the
/// crate's internal logs at INFO level. This is the default sink.
#[derive(Debug, Default)]
pub struct LogReportSink {
    _private: (),
}

impl LogReportSink {
    /// Creates a new logging sink.
    pub fn new() -> Self {
        LogReportSink::default()
    }
}

impl ReportSink for LogReportSink {
    fn emit(&mut self, report: FlushReport) -> TraceResult<()> {
        let payload = serde_json::to_string(&report)
            .map_err(|err| TraceError::BackendFailure(err.to_string()))?;
        dbtrace_info!(name: "operations_over_threshold", report = payload);
        Ok(())
    }
}

/// Sink that stores reports in memory, mainly for testing.
///
/// Clones share the same storage, so a clone handed to the tracer keeps
/// feeding the copy the test holds on to.
///
/// # Example
///
/// ```
/// use dbtrace::threshold::report::InMemoryReportSink;
/// use dbtrace::threshold::ThresholdLoggingTracer;
/// use dbtrace::{Registry, Service, Tracer};
///
/// let sink = InMemoryReportSink::default();
/// let tracer = Tracer::threshold(ThresholdLoggingTracer::builder(sink.clone()).build());
/// let registry = Registry::new();
///
/// let span = registry
///     .span_builder("get")
///     .with_service(Service::Kv)
///     .outer()
///     .start(&tracer);
/// span.finish(0);
///
/// tracer.flush().unwrap();
/// let reports = sink.get_reports().unwrap();
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryReportSink {
    reports: Arc<Mutex<Vec<FlushReport>>>,
}

/// Builder for [`InMemoryReportSink`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryReportSinkBuilder {}

impl InMemoryReportSinkBuilder {
    /// Creates a new sink with empty storage.
    pub fn build(&self) -> InMemoryReportSink {
        InMemoryReportSink::default()
    }
}

impl InMemoryReportSink {
    /// Returns a builder for the sink.
    pub fn builder() -> InMemoryReportSinkBuilder {
        InMemoryReportSinkBuilder::default()
    }

    /// Returns every report emitted so far, oldest first.
    pub fn get_reports(&self) -> TraceResult<Vec<FlushReport>> {
        Ok(self.reports.lock()?.clone())
    }

    /// Clears the stored reports.
    pub fn reset(&self) {
        let _ = self.reports.lock().map(|mut reports| reports.clear());
    }
}

impl ReportSink for InMemoryReportSink {
    fn emit(&mut self, report: FlushReport) -> TraceResult<()> {
        self.reports.lock()?.push(report);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conventions::operations;
    use crate::registry::Registry;
    use crate::tracer::Tracer;

    fn sample_summary() -> SpanSummary {
        SpanSummary {
            operation: "get".to_owned(),
            span_id: 7,
            total_duration_us: 1_500,
            encode_duration_us: None,
            last_dispatch_duration_us: Some(30),
            total_dispatch_duration_us: Some(30),
            last_server_duration_us: None,
            total_server_duration_us: None,
            last_remote_socket: Some("10.0.0.1:11210".to_owned()),
            last_local_socket: None,
            last_local_id: None,
            last_operation_id: Some("0x15".to_owned()),
        }
    }

    #[test]
    fn summary_pulls_copied_dispatch_tags() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let parent = registry
            .span_builder(operations::GET)
            .with_service(Service::Kv)
            .with_start_ts(1_000)
            .outer()
            .start(&tracer);
        let dispatch = registry
            .span_builder(operations::DISPATCH)
            .child_of(&parent)
            .with_start_ts(1_100)
            .start(&tracer);
        dispatch.set_is_dispatch(true);
        dispatch.add_tag_str(tags::PEER_ADDRESS, "10.0.0.1");
        dispatch.add_tag_u64(tags::PEER_PORT, 11210);
        dispatch.add_tag_str(tags::OPERATION_ID, "0x15");
        dispatch.add_tag_u64(tags::SERVER_DURATION_US, 20);
        dispatch.finish(1_130);
        parent.finish(2_500);

        let summary = SpanSummary::from_span(&parent);
        assert_eq!(summary.operation, "get");
        assert_eq!(summary.total_duration_us, 1_500);
        assert_eq!(summary.last_dispatch_duration_us, Some(30));
        assert_eq!(summary.total_dispatch_duration_us, Some(30));
        assert_eq!(summary.last_server_duration_us, Some(20));
        assert_eq!(summary.total_server_duration_us, Some(20));
        assert_eq!(summary.last_remote_socket.as_deref(), Some("10.0.0.1:11210"));
        assert_eq!(summary.last_operation_id.as_deref(), Some("0x15"));
    }

    #[test]
    fn summary_falls_back_to_own_socket_tags() {
        let tracer = Tracer::disabled();
        let registry = Registry::new();

        let span = registry
            .span_builder(operations::DISPATCH)
            .with_start_ts(1_000)
            .start(&tracer);
        span.add_tag_str(tags::PEER_ADDRESS, "db3.example.com");
        span.add_tag_u64(tags::PEER_PORT, 11210);
        span.add_tag_str(tags::LOCAL_ID, "66e1/5cbe");
        span.finish(1_200);

        let summary = SpanSummary::from_span(&span);
        assert_eq!(
            summary.last_remote_socket.as_deref(),
            Some("db3.example.com:11210")
        );
        assert_eq!(summary.last_local_id.as_deref(), Some("66e1/5cbe"));
        assert_eq!(summary.last_dispatch_duration_us, None);
    }

    #[test]
    fn report_serializes_to_stable_json() {
        let report = FlushReport {
            services: vec![ServiceReport {
                service: Service::Kv,
                count: 2,
                top: vec![sample_summary()],
            }],
            orphans: None,
        };

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["services"][0]["service"], "kv");
        assert_eq!(value["services"][0]["count"], 2);
        assert_eq!(value["services"][0]["top"][0]["total_duration_us"], 1_500);
        assert!(value["services"][0]["top"][0]
            .get("encode_duration_us")
            .is_none());
        assert!(value.get("orphans").is_none());
    }

    #[test]
    fn orphan_entries_flatten_the_summary() {
        let report = FlushReport {
            services: Vec::new(),
            orphans: Some(OrphanReport {
                count: 1,
                entries: vec![OrphanEntry {
                    service: Service::Kv,
                    summary: sample_summary(),
                }],
            }),
        };

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["orphans"]["count"], 1);
        assert_eq!(value["orphans"]["entries"][0]["service"], "kv");
        assert_eq!(value["orphans"]["entries"][0]["operation"], "get");
    }

    #[test]
    fn in_memory_sink_records_and_resets() {
        let sink = InMemoryReportSink::builder().build();
        let mut writer = sink.clone();
        writer
            .emit(FlushReport {
                services: Vec::new(),
                orphans: None,
            })
            .unwrap();
        assert_eq!(sink.get_reports().unwrap().len(), 1);

        sink.reset();
        assert!(sink.get_reports().unwrap().is_empty());
    }

    #[test]
    fn log_sink_accepts_reports() {
        let mut sink = LogReportSink::new();
        let report = FlushReport {
            services: Vec::new(),
            orphans: None,
        };
        assert!(sink.emit(report).is_ok());
    }
}
