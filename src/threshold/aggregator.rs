//! Bounded aggregation state shared between span-finishing threads and
//! the flush thread.
//!
//! Memory is capped regardless of traffic: each service keeps at most
//! `per_service_top_k` summaries and the orphan ring at most
//! `orphan_capacity` entries, while counters keep tracking everything
//! that was seen.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::mem;
use std::sync::{Mutex, PoisonError};

use super::report::{FlushReport, OrphanEntry, OrphanReport, ServiceReport, SpanSummary};
use crate::span::Service;

#[derive(Debug)]
pub(crate) struct Aggregator {
    buckets: [Mutex<TopK>; Service::COUNT],
    orphans: Mutex<OrphanRing>,
}

impl Aggregator {
    pub(crate) fn new(per_service_top_k: usize, orphan_capacity: usize) -> Self {
        Aggregator {
            buckets: std::array::from_fn(|_| Mutex::new(TopK::new(per_service_top_k))),
            orphans: Mutex::new(OrphanRing::new(orphan_capacity)),
        }
    }

    pub(crate) fn record(&self, service: Service, summary: SpanSummary) {
        let mut bucket = self.buckets[service.bucket_index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        bucket.insert(summary);
    }

    pub(crate) fn record_orphan(&self, entry: OrphanEntry) {
        let mut orphans = self
            .orphans
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        orphans.push(entry);
    }

    /// Swaps out everything recorded since the last call. `None` when
    /// the interval saw nothing, so empty intervals produce no report.
    pub(crate) fn take_report(&self) -> Option<FlushReport> {
        let mut services = Vec::new();
        for index in 0..Service::COUNT {
            let drained = self.buckets[index]
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some((count, top)) = drained {
                services.push(ServiceReport {
                    service: Service::from_bucket_index(index),
                    count,
                    top,
                });
            }
        }

        let orphans = self
            .orphans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if services.is_empty() && orphans.is_none() {
            return None;
        }
        Some(FlushReport { services, orphans })
    }
}

/// Keeps the `capacity` slowest summaries seen since the last drain.
///
/// A min-heap of the current keepers: the top is the weakest entry, and
/// an incoming summary replaces it only when strictly slower. Equal
/// durations rank by arrival order so that the earlier span wins ties.
#[derive(Debug)]
struct TopK {
    capacity: usize,
    seen: u64,
    next_seq: u64,
    heap: BinaryHeap<Reverse<Entry>>,
}

impl TopK {
    fn new(capacity: usize) -> Self {
        TopK {
            capacity,
            seen: 0,
            next_seq: 0,
            heap: BinaryHeap::with_capacity(capacity),
        }
    }

    fn insert(&mut self, summary: SpanSummary) {
        self.seen += 1;
        if self.capacity == 0 {
            return;
        }
        let entry = Entry {
            duration_us: summary.total_duration_us,
            seq: self.next_seq,
            summary,
        };
        self.next_seq += 1;

        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(entry));
        } else if let Some(mut weakest) = self.heap.peek_mut() {
            if entry > weakest.0 {
                weakest.0 = entry;
            }
        }
    }

    /// Drains into `(seen, slowest-first summaries)`, resetting the
    /// interval. `None` when nothing was inserted.
    fn take(&mut self) -> Option<(u64, Vec<SpanSummary>)> {
        if self.seen == 0 {
            return None;
        }
        let count = mem::take(&mut self.seen);
        self.next_seq = 0;
        let heap = mem::replace(&mut self.heap, BinaryHeap::with_capacity(self.capacity));
        let top = heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(entry)| entry.summary)
            .collect();
        Some((count, top))
    }
}

#[derive(Debug)]
struct Entry {
    duration_us: u64,
    seq: u64,
    summary: SpanSummary,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Equal durations rank the later arrival lower, so it loses both
        // the replacement check and the final sort.
        self.duration_us
            .cmp(&other.duration_us)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

/// Ring of the most recent orphan entries. Pushes past capacity evict
/// the oldest entry but still count.
#[derive(Debug)]
struct OrphanRing {
    capacity: usize,
    seen: u64,
    entries: VecDeque<OrphanEntry>,
}

impl OrphanRing {
    fn new(capacity: usize) -> Self {
        OrphanRing {
            capacity,
            seen: 0,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, entry: OrphanEntry) {
        self.seen += 1;
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn take(&mut self) -> Option<OrphanReport> {
        if self.seen == 0 {
            return None;
        }
        let count = mem::take(&mut self.seen);
        let entries = mem::take(&mut self.entries).into_iter().collect();
        Some(OrphanReport { count, entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(operation: &str, duration_us: u64) -> SpanSummary {
        SpanSummary {
            operation: operation.to_owned(),
            span_id: duration_us,
            total_duration_us: duration_us,
            ..SpanSummary::default()
        }
    }

    fn orphan(operation: &str, duration_us: u64) -> OrphanEntry {
        OrphanEntry {
            service: Service::Kv,
            summary: summary(operation, duration_us),
        }
    }

    #[test]
    fn keeps_the_slowest_k() {
        let aggregator = Aggregator::new(3, 0);
        for duration in [10, 50, 30, 90, 5] {
            aggregator.record(Service::Kv, summary("get", duration));
        }

        let report = aggregator.take_report().expect("kv bucket recorded");
        assert_eq!(report.services.len(), 1);
        let kv = &report.services[0];
        assert_eq!(kv.service, Service::Kv);
        assert_eq!(kv.count, 5);
        let durations: Vec<u64> = kv.top.iter().map(|s| s.total_duration_us).collect();
        assert_eq!(durations, vec![90, 50, 30]);
    }

    #[test]
    fn ties_keep_the_earlier_arrival() {
        let aggregator = Aggregator::new(2, 0);
        aggregator.record(Service::Query, summary("first", 100));
        aggregator.record(Service::Query, summary("second", 100));
        aggregator.record(Service::Query, summary("third", 100));

        let report = aggregator.take_report().unwrap();
        let names: Vec<&str> = report.services[0]
            .top
            .iter()
            .map(|s| s.operation.as_str())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn services_bucket_independently() {
        let aggregator = Aggregator::new(4, 0);
        aggregator.record(Service::Kv, summary("get", 10));
        aggregator.record(Service::Query, summary("select", 20));

        let report = aggregator.take_report().unwrap();
        assert_eq!(report.services.len(), 2);
        assert_eq!(report.services[0].service, Service::Kv);
        assert_eq!(report.services[1].service, Service::Query);
    }

    #[test]
    fn take_resets_the_interval() {
        let aggregator = Aggregator::new(2, 4);
        aggregator.record(Service::Kv, summary("get", 10));

        assert!(aggregator.take_report().is_some());
        assert!(aggregator.take_report().is_none());
    }

    #[test]
    fn orphan_ring_keeps_newest_and_counts_all() {
        let aggregator = Aggregator::new(2, 2);
        for (name, duration) in [("a", 1), ("b", 2), ("c", 3)] {
            aggregator.record_orphan(orphan(name, duration));
        }

        let report = aggregator.take_report().unwrap();
        assert!(report.services.is_empty());
        let orphans = report.orphans.expect("orphans recorded");
        assert_eq!(orphans.count, 3);
        let names: Vec<&str> = orphans
            .entries
            .iter()
            .map(|e| e.summary.operation.as_str())
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn zero_capacity_still_counts() {
        let aggregator = Aggregator::new(0, 0);
        aggregator.record(Service::Kv, summary("get", 10));
        aggregator.record_orphan(orphan("get", 5));

        let report = aggregator.take_report().unwrap();
        assert_eq!(report.services[0].count, 1);
        assert!(report.services[0].top.is_empty());
        assert_eq!(report.orphans.unwrap().count, 1);
    }
}
