use super::rate_limiter::prune;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

pub const DEFAULT_BLACKLIST_THRESHOLD: u32 = 5;

/// How long request timestamps are kept for audit.
const AUDIT_WINDOW_HOURS: i64 = 24;

/// Per-client request and violation counters plus blacklist flag
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientReputation {
    pub total_requests: u64,
    pub bad_requests: u64,
    pub first_seen: DateTime<Utc>,
    pub last_violation: Option<DateTime<Utc>>,
    pub blacklisted: bool,
    pub blacklist_reason: String,
}

impl ClientReputation {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            total_requests: 0,
            bad_requests: 0,
            first_seen: now,
            last_violation: None,
            blacklisted: false,
            blacklist_reason: String::new(),
        }
    }

    pub fn violation_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.bad_requests as f64 / self.total_requests as f64
        }
    }
}

struct ClientRecord {
    reputation: ClientReputation,
    audit: VecDeque<DateTime<Utc>>,
}

impl ClientRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            reputation: ClientReputation::new(now),
            audit: VecDeque::new(),
        }
    }
}

/// Post-state of a `record_request` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub blacklisted: bool,
    /// This call tripped the threshold.
    pub newly_blacklisted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    New,
    Active,
    Blacklisted,
}

/// Admin view of one client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClientStats {
    /// Never seen before
    New {
        status: ClientStatus,
        requests: u64,
        violations: u64,
    },
    Tracked {
        status: ClientStatus,
        total_requests: u64,
        bad_requests: u64,
        violation_rate: f64,
        first_seen: DateTime<Utc>,
        last_violation: Option<DateTime<Utc>>,
        blacklisted: bool,
        blacklist_reason: String,
        requests_last_24h: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStats {
    pub total_ips_tracked: usize,
    pub blacklisted_ips: usize,
    pub total_requests: u64,
    pub total_violations: u64,
    pub violation_rate: f64,
    pub blacklist_threshold: u32,
}

/// In-memory reputation tracker keyed by client identifier.
///
/// Every mutation of one client happens under that client's map-entry lock,
/// so counters and the blacklist flag never lose updates. Records live for
/// the whole process.
pub struct ReputationStore {
    clients: DashMap<String, ClientRecord>,
    threshold: u32,
}

impl ReputationStore {
    pub fn new(threshold: u32) -> Self {
        Self {
            clients: DashMap::new(),
            threshold,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Count a request, and a violation if `is_violation`. Crossing the
    /// threshold blacklists the client.
    pub fn record_request(&self, client_id: &str, now: DateTime<Utc>, is_violation: bool) -> RecordOutcome {
        let mut record = self
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientRecord::new(now));

        let newly_blacklisted = apply_request(&mut record, now, is_violation, self.threshold);
        if newly_blacklisted {
            tracing::warn!(
                client = %client_id,
                violations = record.reputation.bad_requests,
                "client blacklisted"
            );
        }

        RecordOutcome {
            blacklisted: record.reputation.blacklisted,
            newly_blacklisted,
        }
    }

    /// Count a clean request unless the client is blacklisted, atomically.
    ///
    /// Returns `false` (and records nothing) for a blacklisted client.
    pub fn admit_clean_request(&self, client_id: &str, now: DateTime<Utc>) -> bool {
        let mut record = self
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientRecord::new(now));

        if record.reputation.blacklisted {
            return false;
        }
        apply_request(&mut record, now, false, self.threshold);
        true
    }

    pub fn is_blacklisted(&self, client_id: &str) -> bool {
        self.clients
            .get(client_id)
            .map(|record| record.reputation.blacklisted)
            .unwrap_or(false)
    }

    pub fn blacklist_reason(&self, client_id: &str) -> Option<String> {
        self.clients
            .get(client_id)
            .filter(|record| record.reputation.blacklisted)
            .map(|record| record.reputation.blacklist_reason.clone())
    }

    /// Blacklist a client regardless of its counters.
    pub fn manual_blacklist(&self, client_id: &str, reason: &str, now: DateTime<Utc>) {
        let mut record = self
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientRecord::new(now));

        record.reputation.blacklisted = true;
        record.reputation.blacklist_reason = reason.to_string();
        tracing::warn!(client = %client_id, reason = %reason, "client manually blacklisted");
    }

    /// Lift a blacklist regardless of its counters.
    ///
    /// Returns `false` if the client has never been seen.
    pub fn manual_unblacklist(&self, client_id: &str, reason: &str) -> bool {
        let Some(mut record) = self.clients.get_mut(client_id) else {
            return false;
        };

        record.reputation.blacklisted = false;
        record.reputation.blacklist_reason = format!("Unblacklisted: {}", reason);
        tracing::info!(client = %client_id, reason = %reason, "client unblacklisted");
        true
    }

    pub fn stats_for(&self, client_id: &str) -> ClientStats {
        let Some(record) = self.clients.get(client_id) else {
            return ClientStats::New {
                status: ClientStatus::New,
                requests: 0,
                violations: 0,
            };
        };

        let rep = &record.reputation;
        ClientStats::Tracked {
            status: if rep.blacklisted {
                ClientStatus::Blacklisted
            } else {
                ClientStatus::Active
            },
            total_requests: rep.total_requests,
            bad_requests: rep.bad_requests,
            violation_rate: rep.violation_rate(),
            first_seen: rep.first_seen,
            last_violation: rep.last_violation,
            blacklisted: rep.blacklisted,
            blacklist_reason: rep.blacklist_reason.clone(),
            requests_last_24h: record.audit.len(),
        }
    }

    pub fn system_stats(&self) -> SystemStats {
        let mut stats = SystemStats {
            total_ips_tracked: 0,
            blacklisted_ips: 0,
            total_requests: 0,
            total_violations: 0,
            violation_rate: 0.0,
            blacklist_threshold: self.threshold,
        };

        for record in self.clients.iter() {
            let rep = &record.reputation;
            stats.total_ips_tracked += 1;
            stats.blacklisted_ips += usize::from(rep.blacklisted);
            stats.total_requests += rep.total_requests;
            stats.total_violations += rep.bad_requests;
        }

        if stats.total_requests > 0 {
            stats.violation_rate = stats.total_violations as f64 / stats.total_requests as f64;
        }
        stats
    }

    /// Full records of currently blacklisted clients, ordered by client id.
    pub fn export_blacklist(&self) -> BTreeMap<String, ClientReputation> {
        self.clients
            .iter()
            .filter(|entry| entry.reputation.blacklisted)
            .map(|entry| (entry.key().clone(), entry.reputation.clone()))
            .collect()
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ReputationStore {
    fn default() -> Self {
        Self::new(DEFAULT_BLACKLIST_THRESHOLD)
    }
}

/// Returns true when this request tripped the threshold.
fn apply_request(record: &mut ClientRecord, now: DateTime<Utc>, is_violation: bool, threshold: u32) -> bool {
    let rep = &mut record.reputation;
    rep.total_requests += 1;

    let mut tripped = false;
    if is_violation {
        rep.bad_requests += 1;
        rep.last_violation = Some(now);

        if rep.bad_requests >= u64::from(threshold) && !rep.blacklisted {
            rep.blacklisted = true;
            rep.blacklist_reason = format!("Exceeded {} violations", threshold);
            tripped = true;
        }
    }

    record.audit.push_back(now);
    prune(&mut record.audit, now - Duration::hours(AUDIT_WINDOW_HOURS));

    tripped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn tracked(stats: ClientStats) -> (u64, u64, bool, String) {
        match stats {
            ClientStats::Tracked {
                total_requests,
                bad_requests,
                blacklisted,
                blacklist_reason,
                ..
            } => (total_requests, bad_requests, blacklisted, blacklist_reason),
            ClientStats::New { .. } => panic!("expected a tracked client"),
        }
    }

    #[test]
    fn test_unseen_client() {
        let store = ReputationStore::default();

        assert!(!store.is_blacklisted("1.2.3.4"));
        assert_eq!(
            store.stats_for("1.2.3.4"),
            ClientStats::New {
                status: ClientStatus::New,
                requests: 0,
                violations: 0
            }
        );
        assert_eq!(store.tracked_clients(), 0);
    }

    #[test]
    fn test_threshold_blacklists_and_sticks() {
        let store = ReputationStore::new(3);
        let ip = "10.0.0.1";

        for i in 0..2 {
            let outcome = store.record_request(ip, t0() + Duration::seconds(i), true);
            assert!(!outcome.blacklisted);
        }

        let outcome = store.record_request(ip, t0() + Duration::seconds(5), true);
        assert!(outcome.blacklisted);
        assert!(outcome.newly_blacklisted);
        assert!(store.is_blacklisted(ip));
        assert_eq!(store.blacklist_reason(ip).as_deref(), Some("Exceeded 3 violations"));

        // Clean requests never lift it
        for i in 0..10 {
            let outcome = store.record_request(ip, t0() + Duration::seconds(10 + i), false);
            assert!(outcome.blacklisted);
            assert!(!outcome.newly_blacklisted);
        }
        assert!(store.is_blacklisted(ip));
    }

    #[test]
    fn test_bad_never_exceeds_total() {
        let store = ReputationStore::new(2);
        let pattern = [true, false, true, true, false, true, false, false, true];

        for (i, violation) in pattern.iter().enumerate() {
            store.record_request("c", t0() + Duration::seconds(i as i64), *violation);
            let (total, bad, _, _) = tracked(store.stats_for("c"));
            assert!(bad <= total);
        }

        let (total, bad, _, _) = tracked(store.stats_for("c"));
        assert_eq!(total, 9);
        assert_eq!(bad, 5);
    }

    #[test]
    fn test_last_violation_and_first_seen() {
        let store = ReputationStore::default();

        store.record_request("c", t0(), false);
        store.record_request("c", t0() + Duration::minutes(3), true);
        store.record_request("c", t0() + Duration::minutes(5), false);

        match store.stats_for("c") {
            ClientStats::Tracked {
                first_seen,
                last_violation,
                violation_rate,
                status,
                ..
            } => {
                assert_eq!(first_seen, t0());
                assert_eq!(last_violation, Some(t0() + Duration::minutes(3)));
                assert!((violation_rate - 1.0 / 3.0).abs() < 1e-9);
                assert_eq!(status, ClientStatus::Active);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_manual_blacklist_and_unblacklist() {
        let store = ReputationStore::default();

        store.manual_blacklist("6.6.6.6", "abusive prompts", t0());
        assert!(store.is_blacklisted("6.6.6.6"));
        let (total, bad, blacklisted, reason) = tracked(store.stats_for("6.6.6.6"));
        assert_eq!((total, bad, blacklisted), (0, 0, true));
        assert_eq!(reason, "abusive prompts");

        assert!(store.manual_unblacklist("6.6.6.6", "appeal accepted"));
        assert!(!store.is_blacklisted("6.6.6.6"));
        let (_, _, _, reason) = tracked(store.stats_for("6.6.6.6"));
        assert_eq!(reason, "Unblacklisted: appeal accepted");

        assert!(!store.manual_unblacklist("never.seen", "n/a"));
        assert_eq!(store.tracked_clients(), 1);
    }

    #[test]
    fn test_unblacklisted_client_can_trip_again() {
        let store = ReputationStore::new(2);

        store.record_request("c", t0(), true);
        store.record_request("c", t0(), true);
        assert!(store.is_blacklisted("c"));

        store.manual_unblacklist("c", "second chance");
        assert!(!store.is_blacklisted("c"));

        let outcome = store.record_request("c", t0() + Duration::seconds(1), true);
        assert!(outcome.newly_blacklisted);
    }

    #[test]
    fn test_admit_clean_request_refuses_blacklisted() {
        let store = ReputationStore::new(1);

        assert!(store.admit_clean_request("c", t0()));
        store.record_request("c", t0(), true);
        assert!(!store.admit_clean_request("c", t0()));

        let (total, _, _, _) = tracked(store.stats_for("c"));
        assert_eq!(total, 2);
    }

    #[test]
    fn test_stats_are_idempotent() {
        let store = ReputationStore::default();
        store.record_request("c", t0(), true);

        assert_eq!(store.stats_for("c"), store.stats_for("c"));
        assert_eq!(store.system_stats(), store.system_stats());
    }

    #[test]
    fn test_audit_window_keeps_last_day() {
        let store = ReputationStore::default();

        store.record_request("c", t0(), false);
        store.record_request("c", t0() + Duration::hours(12), false);
        store.record_request("c", t0() + Duration::hours(25), false);

        match store.stats_for("c") {
            ClientStats::Tracked {
                requests_last_24h,
                total_requests,
                ..
            } => {
                assert_eq!(requests_last_24h, 2);
                assert_eq!(total_requests, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_system_stats_and_export() {
        let store = ReputationStore::new(2);

        store.record_request("a", t0(), false);
        store.record_request("b", t0(), true);
        store.record_request("b", t0(), true);
        store.manual_blacklist("c", "manual", t0());

        let stats = store.system_stats();
        assert_eq!(stats.total_ips_tracked, 3);
        assert_eq!(stats.blacklisted_ips, 2);
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_violations, 2);
        assert_eq!(stats.blacklist_threshold, 2);
        assert!((stats.violation_rate - 2.0 / 3.0).abs() < 1e-9);

        let exported = store.export_blacklist();
        assert_eq!(exported.keys().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(exported["b"].bad_requests, 2);
        assert_eq!(exported["c"].blacklist_reason, "manual");
    }

    #[test]
    fn test_stats_serialize_shapes() {
        let store = ReputationStore::default();

        let json = serde_json::to_value(store.stats_for("x")).unwrap();
        assert_eq!(json, serde_json::json!({"status": "new", "requests": 0, "violations": 0}));

        store.record_request("x", t0(), false);
        let json = serde_json::to_value(store.stats_for("x")).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["total_requests"], 1);
        assert!(json["last_violation"].is_null());
    }

    #[test]
    fn test_concurrent_violations_are_not_lost() {
        let store = Arc::new(ReputationStore::new(50));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut tripped = 0;
                    for _ in 0..10 {
                        if store.record_request("shared", t0(), true).newly_blacklisted {
                            tripped += 1;
                        }
                    }
                    tripped
                })
            })
            .collect();

        let tripped: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(tripped, 1);

        let (total, bad, blacklisted, _) = tracked(store.stats_for("shared"));
        assert_eq!((total, bad, blacklisted), (100, 100, true));
    }
}
