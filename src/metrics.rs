//! Throughput, latency and outcome tracking for the investigation pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics collector for pipeline performance
pub struct PipelineMetrics {
    /// Claims taken off the stream
    pub claims_processed: AtomicU64,
    /// Investigations that produced findings
    pub investigations_completed: AtomicU64,
    /// Investigations published as unavailable
    pub investigations_failed: AtomicU64,
    /// Queries answered by the static rules instead of the index
    pub retrieval_fallbacks: AtomicU64,
    /// Extra attempts made against the language model
    pub upstream_retries: AtomicU64,
    claims_by_risk: RwLock<HashMap<String, u64>>,
    verdicts_by_action: RwLock<HashMap<String, u64>>,
    failures_by_kind: RwLock<HashMap<String, u64>>,
    /// End-to-end investigation times (milliseconds)
    processing_times: RwLock<Vec<u64>>,
    /// Fraud probability distribution buckets
    probability_buckets: RwLock<[u64; 10]>,
    start_time: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            claims_processed: AtomicU64::new(0),
            investigations_completed: AtomicU64::new(0),
            investigations_failed: AtomicU64::new(0),
            retrieval_fallbacks: AtomicU64::new(0),
            upstream_retries: AtomicU64::new(0),
            claims_by_risk: RwLock::new(HashMap::new()),
            verdicts_by_action: RwLock::new(HashMap::new()),
            failures_by_kind: RwLock::new(HashMap::new()),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            probability_buckets: RwLock::new([0; 10]),
            start_time: Instant::now(),
        }
    }

    /// Record a scored claim
    pub fn record_prediction(&self, risk_level: &str, probability: f64) {
        if let Ok(mut by_risk) = self.claims_by_risk.write() {
            *by_risk.entry(risk_level.to_string()).or_insert(0) += 1;
        }

        let bucket = (probability * 10.0).clamp(0.0, 9.0) as usize;
        if let Ok(mut buckets) = self.probability_buckets.write() {
            buckets[bucket] += 1;
        }
    }

    /// Record a finished investigation, successful or not
    pub fn record_investigation(&self, processing_time: Duration, failure_kind: Option<&str>) {
        self.claims_processed.fetch_add(1, Ordering::Relaxed);

        match failure_kind {
            None => {
                self.investigations_completed.fetch_add(1, Ordering::Relaxed);
            }
            Some(kind) => {
                self.investigations_failed.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut by_kind) = self.failures_by_kind.write() {
                    *by_kind.entry(kind.to_string()).or_insert(0) += 1;
                }
            }
        }

        if let Ok(mut times) = self.processing_times.write() {
            times.push(processing_time.as_millis() as u64);
            // Keep only last 10000 for memory efficiency
            if times.len() > 10000 {
                times.drain(0..5000);
            }
        }
    }

    /// Record the recommended action of a structured verdict
    pub fn record_verdict(&self, action: &str) {
        if let Ok(mut by_action) = self.verdicts_by_action.write() {
            *by_action.entry(action.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_retrieval_fallback(&self) {
        self.retrieval_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_retry(&self) {
        self.upstream_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Get processing time statistics
    pub fn get_processing_stats(&self) -> ProcessingStats {
        let mut sorted = match self.processing_times.read() {
            Ok(times) if !times.is_empty() => times.clone(),
            _ => return ProcessingStats::default(),
        };
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len();

        ProcessingStats {
            count: count as u64,
            mean_ms: sum / count as u64,
            p50_ms: sorted[count / 2],
            p95_ms: sorted[((count as f64 * 0.95) as usize).min(count - 1)],
            p99_ms: sorted[((count as f64 * 0.99) as usize).min(count - 1)],
            max_ms: sorted[count - 1],
        }
    }

    /// Claims per minute since startup
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.claims_processed.load(Ordering::Relaxed) as f64 * 60.0 / elapsed
        } else {
            0.0
        }
    }

    pub fn get_probability_distribution(&self) -> [u64; 10] {
        self.probability_buckets
            .read()
            .map(|b| *b)
            .unwrap_or_default()
    }

    pub fn get_claims_by_risk(&self) -> HashMap<String, u64> {
        self.claims_by_risk
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn get_verdicts_by_action(&self) -> HashMap<String, u64> {
        self.verdicts_by_action
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn get_failures_by_kind(&self) -> HashMap<String, u64> {
        self.failures_by_kind
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Print summary statistics
    pub fn print_summary(&self) {
        let claims = self.claims_processed.load(Ordering::Relaxed);
        let completed = self.investigations_completed.load(Ordering::Relaxed);
        let failed = self.investigations_failed.load(Ordering::Relaxed);
        let fallbacks = self.retrieval_fallbacks.load(Ordering::Relaxed);
        let retries = self.upstream_retries.load(Ordering::Relaxed);

        let processing = self.get_processing_stats();
        let throughput = self.get_throughput();
        let prob_dist = self.get_probability_distribution();

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║        CLAIM INVESTIGATION PIPELINE - METRICS SUMMARY        ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Claims Processed: {:>8}  │  Throughput: {:>6.1} claims/min ║",
            claims, throughput
        );
        info!(
            "║ Completed: {:>8}  │  Unavailable: {:>8}                   ║",
            completed, failed
        );
        info!(
            "║ Rule Fallbacks: {:>6}  │  LLM Retries: {:>6}                ║",
            fallbacks, retries
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Latency (ms): mean={:>6} p50={:>6} p95={:>6} p99={:>6}     ║",
            processing.mean_ms, processing.p50_ms, processing.p95_ms, processing.p99_ms
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Claims by Risk Level:                                        ║");
        for (level, count) in &self.get_claims_by_risk() {
            info!("║   {:10}: {:>6}", level, count);
        }
        let verdicts = self.get_verdicts_by_action();
        if !verdicts.is_empty() {
            info!("║ Verdicts by Recommended Action:                              ║");
            for (action, count) in &verdicts {
                info!("║   {:24}: {:>6}", action, count);
            }
        }
        let failures = self.get_failures_by_kind();
        if !failures.is_empty() {
            info!("║ Failures by Kind:                                            ║");
            for (kind, count) in &failures {
                info!("║   {:24}: {:>6}", kind, count);
            }
        }
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Fraud Probability Distribution:                              ║");
        let total: u64 = prob_dist.iter().sum();
        for (i, &count) in prob_dist.iter().enumerate() {
            let pct = if total > 0 { (count as f64 / total as f64) * 100.0 } else { 0.0 };
            let bar: String = "█".repeat(((pct / 2.0) as usize).min(20));
            info!(
                "║   {:.1}-{:.1}: {:>6} ({:>5.1}%) {}",
                i as f64 / 10.0,
                (i + 1) as f64 / 10.0,
                count,
                pct,
                bar
            );
        }
        info!("╚══════════════════════════════════════════════════════════════╝");
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Processing time statistics
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

/// Real-time metrics reporter that prints periodic summaries
pub struct MetricsReporter {
    metrics: Arc<PipelineMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<PipelineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = PipelineMetrics::new();

        metrics.record_prediction("high", 0.82);
        metrics.record_prediction("low", 0.05);
        metrics.record_investigation(Duration::from_millis(900), None);
        metrics.record_investigation(Duration::from_millis(30), Some("upstream_service"));
        metrics.record_verdict("Manual Review");

        assert_eq!(metrics.claims_processed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.investigations_completed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.investigations_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.get_failures_by_kind().get("upstream_service"), Some(&1));
        assert_eq!(metrics.get_verdicts_by_action().get("Manual Review"), Some(&1));

        let dist = metrics.get_probability_distribution();
        assert_eq!(dist[8], 1);
        assert_eq!(dist[0], 1);
    }

    #[test]
    fn test_probability_one_lands_in_top_bucket() {
        let metrics = PipelineMetrics::new();
        metrics.record_prediction("high", 1.0);
        assert_eq!(metrics.get_probability_distribution()[9], 1);
    }

    #[test]
    fn test_processing_stats() {
        let metrics = PipelineMetrics::new();
        assert_eq!(metrics.get_processing_stats().count, 0);

        for ms in [10, 20, 30, 40] {
            metrics.record_investigation(Duration::from_millis(ms), None);
        }
        let stats = metrics.get_processing_stats();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.mean_ms, 25);
        assert_eq!(stats.max_ms, 40);
    }
}
