//! Node metrics: lock-free counters with Prometheus text exposition.
//!
//! All fields are `AtomicU64`, so the struct is `Send + Sync` by
//! construction. Increments use `Relaxed` (monotonic counters),
//! `to_prometheus` reads with `SeqCst` for a consistent snapshot.
//! Latencies are exposed as summaries (`_sum` seconds + `_count`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct NodeMetrics {
    disperse_total: AtomicU64,
    disperse_micros_total: AtomicU64,
    retrieve_total: AtomicU64,
    retrieve_micros_total: AtomicU64,
    echo_total: AtomicU64,
    ready_total: AtomicU64,
    commit_total: AtomicU64,
    gc_removed_total: AtomicU64,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_disperse(&self, elapsed: Duration) {
        self.disperse_total.fetch_add(1, Ordering::Relaxed);
        self.disperse_micros_total
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_retrieve(&self, elapsed: Duration) {
        self.retrieve_total.fetch_add(1, Ordering::Relaxed);
        self.retrieve_micros_total
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_echo(&self) {
        self.echo_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ready(&self) {
        self.ready_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commit_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gc_removed(&self, count: u64) {
        self.gc_removed_total.fetch_add(count, Ordering::Relaxed);
    }

    /// Render the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let disperse_total = self.disperse_total.load(Ordering::SeqCst);
        let disperse_secs = self.disperse_micros_total.load(Ordering::SeqCst) as f64 / 1e6;
        let retrieve_total = self.retrieve_total.load(Ordering::SeqCst);
        let retrieve_secs = self.retrieve_micros_total.load(Ordering::SeqCst) as f64 / 1e6;

        let mut out = String::with_capacity(1024);
        out.push_str("# HELP avid_fp_disperse_total Total Disperse RPC calls.\n");
        out.push_str("# TYPE avid_fp_disperse_total counter\n");
        out.push_str(&format!("avid_fp_disperse_total {disperse_total}\n"));
        out.push_str("# HELP avid_fp_disperse_duration_seconds Latency of Disperse RPCs.\n");
        out.push_str("# TYPE avid_fp_disperse_duration_seconds summary\n");
        out.push_str(&format!(
            "avid_fp_disperse_duration_seconds_sum {disperse_secs}\n"
        ));
        out.push_str(&format!(
            "avid_fp_disperse_duration_seconds_count {disperse_total}\n"
        ));
        out.push_str("# HELP avid_fp_retrieve_total Total Retrieve RPC calls.\n");
        out.push_str("# TYPE avid_fp_retrieve_total counter\n");
        out.push_str(&format!("avid_fp_retrieve_total {retrieve_total}\n"));
        out.push_str("# HELP avid_fp_retrieve_duration_seconds Latency of Retrieve RPCs.\n");
        out.push_str("# TYPE avid_fp_retrieve_duration_seconds summary\n");
        out.push_str(&format!(
            "avid_fp_retrieve_duration_seconds_sum {retrieve_secs}\n"
        ));
        out.push_str(&format!(
            "avid_fp_retrieve_duration_seconds_count {retrieve_total}\n"
        ));
        out.push_str("# HELP avid_fp_echo_total Total Echo RPC calls.\n");
        out.push_str("# TYPE avid_fp_echo_total counter\n");
        out.push_str(&format!(
            "avid_fp_echo_total {}\n",
            self.echo_total.load(Ordering::SeqCst)
        ));
        out.push_str("# HELP avid_fp_ready_total Total Ready RPC calls.\n");
        out.push_str("# TYPE avid_fp_ready_total counter\n");
        out.push_str(&format!(
            "avid_fp_ready_total {}\n",
            self.ready_total.load(Ordering::SeqCst)
        ));
        out.push_str("# HELP avid_fp_commit_total Objects committed by this node.\n");
        out.push_str("# TYPE avid_fp_commit_total counter\n");
        out.push_str(&format!(
            "avid_fp_commit_total {}\n",
            self.commit_total.load(Ordering::SeqCst)
        ));
        out.push_str("# HELP avid_fp_gc_removed_total Objects removed by the garbage collector.\n");
        out.push_str("# TYPE avid_fp_gc_removed_total counter\n");
        out.push_str(&format!(
            "avid_fp_gc_removed_total {}\n",
            self.gc_removed_total.load(Ordering::SeqCst)
        ));
        out
    }
}

async fn metrics_handler(State(metrics): State<Arc<NodeMetrics>>) -> String {
    metrics.to_prometheus()
}

/// Serve `/metrics` and `/healthz` until `shutdown` fires.
pub async fn serve_metrics(
    metrics: Arc<NodeMetrics>,
    port: u16,
    shutdown: Arc<Notify>,
) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_exposition() {
        let metrics = NodeMetrics::new();
        metrics.record_disperse(Duration::from_millis(1500));
        metrics.record_disperse(Duration::from_millis(500));
        metrics.record_retrieve(Duration::from_millis(250));
        metrics.record_echo();
        metrics.record_ready();
        metrics.record_commit();
        metrics.record_gc_removed(3);

        let text = metrics.to_prometheus();
        assert!(text.contains("avid_fp_disperse_total 2\n"));
        assert!(text.contains("avid_fp_disperse_duration_seconds_sum 2\n"));
        assert!(text.contains("avid_fp_disperse_duration_seconds_count 2\n"));
        assert!(text.contains("avid_fp_retrieve_total 1\n"));
        assert!(text.contains("avid_fp_echo_total 1\n"));
        assert!(text.contains("avid_fp_ready_total 1\n"));
        assert!(text.contains("avid_fp_commit_total 1\n"));
        assert!(text.contains("avid_fp_gc_removed_total 3\n"));
    }
}
