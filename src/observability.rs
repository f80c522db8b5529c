//! Per-client counters with Prometheus text rendering.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters owned by one producer or consumer instance.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    requests_total: AtomicU64,
    request_errors_total: AtomicU64,
    retries_total: AtomicU64,
    records_sent_total: AtomicU64,
    records_acked_total: AtomicU64,
    records_failed_total: AtomicU64,
    batches_sent_total: AtomicU64,
    fetch_records_total: AtomicU64,
    fetch_bytes_total: AtomicU64,
    commits_total: AtomicU64,
}

/// Point-in-time copy of [`ClientMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub request_errors: u64,
    pub retries: u64,
    pub records_sent: u64,
    pub records_acked: u64,
    pub records_failed: u64,
    pub batches_sent: u64,
    pub fetch_records: u64,
    pub fetch_bytes: u64,
    pub commits: u64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, ok: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.request_errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueued(&self) {
        self.records_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, records: usize, ok: bool) {
        let counter = if ok {
            &self.records_acked_total
        } else {
            &self.records_failed_total
        };
        counter.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_fetch(&self, records: usize, bytes: usize) {
        self.fetch_records_total
            .fetch_add(records as u64, Ordering::Relaxed);
        self.fetch_bytes_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests_total.load(Ordering::Relaxed),
            request_errors: self.request_errors_total.load(Ordering::Relaxed),
            retries: self.retries_total.load(Ordering::Relaxed),
            records_sent: self.records_sent_total.load(Ordering::Relaxed),
            records_acked: self.records_acked_total.load(Ordering::Relaxed),
            records_failed: self.records_failed_total.load(Ordering::Relaxed),
            batches_sent: self.batches_sent_total.load(Ordering::Relaxed),
            fetch_records: self.fetch_records_total.load(Ordering::Relaxed),
            fetch_bytes: self.fetch_bytes_total.load(Ordering::Relaxed),
            commits: self.commits_total.load(Ordering::Relaxed),
        }
    }

    /// Render counters in the Prometheus text exposition format.
    pub fn render_prometheus(&self, client_id: &str) -> String {
        let s = self.snapshot();
        let rows = [
            ("thorstream_client_requests_total", s.requests),
            ("thorstream_client_request_errors_total", s.request_errors),
            ("thorstream_client_retries_total", s.retries),
            ("thorstream_client_records_sent_total", s.records_sent),
            ("thorstream_client_records_acked_total", s.records_acked),
            ("thorstream_client_records_failed_total", s.records_failed),
            ("thorstream_client_batches_sent_total", s.batches_sent),
            ("thorstream_client_fetch_records_total", s.fetch_records),
            ("thorstream_client_fetch_bytes_total", s.fetch_bytes),
            ("thorstream_client_commits_total", s.commits),
        ];
        let mut out = String::new();
        for (name, value) in rows {
            out.push_str(&format!("# TYPE {} counter\n", name));
            out.push_str(&format!(
                "{}{{client_id=\"{}\"}} {}\n",
                name, client_id, value
            ));
        }
        out
    }
}
