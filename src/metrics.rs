use crate::security::moderation::{ModerationVerdict, Stage};
use crate::security::reputation::ReputationStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Why a request never reached the moderation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    MaliciousPattern,
    RateLimited,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::MaliciousPattern => "malicious_pattern",
            BlockReason::RateLimited => "rate_limited",
        }
    }
}

/// Process-wide counters, mirrored into the Prometheus recorder when one is
/// installed.
#[derive(Clone, Default)]
pub struct MetricsTracker {
    blocked_requests: Arc<AtomicU64>,
    verdicts: Arc<AtomicU64>,
    completions: Arc<AtomicU64>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_blocked(&self, reason: BlockReason) {
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("requests_blocked_total", "reason" => reason.as_str()).increment(1);
    }

    pub fn record_verdict(&self, verdict: &ModerationVerdict) {
        self.verdicts.fetch_add(1, Ordering::Relaxed);
        let outcome = if verdict.allowed { "allowed" } else { "rejected" };
        ::metrics::counter!(
            "moderation_verdicts_total",
            "stage" => verdict.stage.as_str(),
            "outcome" => outcome
        )
        .increment(1);
    }

    pub fn record_completion(&self, provider: &'static str) {
        self.completions.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("chat_completions_total", "provider" => provider).increment(1);
    }

    pub fn blocked_requests(&self) -> u64 {
        self.blocked_requests.load(Ordering::Relaxed)
    }

    pub fn verdicts(&self) -> u64 {
        self.verdicts.load(Ordering::Relaxed)
    }

    pub fn completions(&self) -> u64 {
        self.completions.load(Ordering::Relaxed)
    }
}

/// Count a failed classifier call for `stage`.
pub fn record_classifier_error(stage: Stage) {
    ::metrics::counter!("classifier_errors_total", "stage" => stage.as_str()).increment(1);
}

/// Health check status for the server
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub service: &'static str,
    pub provider: &'static str,
    pub tracked_clients: usize,
    pub blacklisted_clients: usize,
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    pub fn check(provider: &'static str, reputation: &ReputationStore, now: DateTime<Utc>) -> Self {
        let stats = reputation.system_stats();
        Self {
            status: "healthy",
            service: "tile-guard",
            provider,
            tracked_clients: reputation.tracked_clients(),
            blacklisted_clients: stats.blacklisted_ips,
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_tracker_counts_without_recorder() {
        let tracker = MetricsTracker::new();
        let shared = tracker.clone();

        tracker.record_blocked(BlockReason::RateLimited);
        shared.record_blocked(BlockReason::MaliciousPattern);
        tracker.record_completion("groq");

        assert_eq!(tracker.blocked_requests(), 2);
        assert_eq!(shared.completions(), 1);
        assert_eq!(tracker.verdicts(), 0);
    }

    #[test]
    fn test_health_reports_reputation_counts() {
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap();
        let store = ReputationStore::new(1);
        store.record_request("a", now, false);
        store.record_request("b", now, true);

        let health = HealthStatus::check("ollama", &store, now);
        assert_eq!(health.tracked_clients, 2);
        assert_eq!(health.blacklisted_clients, 1);

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "tile-guard");
        assert_eq!(json["provider"], "ollama");
    }

    #[test]
    fn test_block_reason_labels() {
        assert_eq!(BlockReason::MaliciousPattern.as_str(), "malicious_pattern");
        assert_eq!(BlockReason::RateLimited.as_str(), "rate_limited");
    }
}
