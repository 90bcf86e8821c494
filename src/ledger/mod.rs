//! Campaign progress ledger
//!
//! The ledger is the only durable state of a campaign: one attempt record per
//! recipient ever contacted plus aggregate counters. Counters are always
//! recomputed from the attempt records so hand-edited or partially written
//! files cannot leave them inconsistent.

pub mod store;

pub use store::{JsonLedgerStore, LedgerStore, MemoryLedgerStore};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Ledger persistence errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger I/O error: {0}")]
    Io(String),

    #[error("Corrupt ledger: {0}")]
    Corrupt(String),

    #[error("Failed to serialize ledger: {0}")]
    Serialize(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// One send attempt for one recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendAttempt {
    #[serde(rename = "email")]
    pub address: String,

    #[serde(default, with = "timestamp")]
    pub timestamp: Option<DateTime<Utc>>,

    /// A record without an outcome counts as a failed attempt
    #[serde(default)]
    pub success: bool,

    #[serde(default, with = "error_text")]
    pub error: Option<String>,
}

impl SendAttempt {
    /// Salvage an attempt from a hand-edited entry; only the address is required
    fn from_loose(value: &serde_json::Value) -> Option<Self> {
        let address = value.get("email")?.as_str()?.to_string();
        Some(Self {
            address,
            timestamp: value
                .get("timestamp")
                .and_then(|v| v.as_str())
                .and_then(timestamp::parse),
            success: value
                .get("success")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            error: value
                .get("error")
                .and_then(|v| v.as_str())
                .filter(|e| !e.is_empty())
                .map(str::to_string),
        })
    }
}

/// Aggregate counters derived from the attempt records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignStats {
    #[serde(default)]
    pub total_sent: usize,
    #[serde(default)]
    pub successful: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default, with = "timestamp")]
    pub last_run: Option<DateTime<Utc>>,
}

/// Attempt records plus counters, as persisted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawLedger")]
pub struct CampaignLedger {
    #[serde(rename = "sent_emails")]
    attempts: Vec<SendAttempt>,
    #[serde(rename = "campaign_stats")]
    stats: CampaignStats,
    /// Lower-cased addresses of `attempts`
    #[serde(skip)]
    index: HashSet<String>,
}

/// On-disk shape accepted when reading, including legacy bare-address entries
#[derive(Deserialize)]
struct RawLedger {
    #[serde(default)]
    sent_emails: Vec<RawAttempt>,
    #[serde(default)]
    campaign_stats: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAttempt {
    Record(SendAttempt),
    Address(String),
    Loose(serde_json::Value),
}

impl From<RawLedger> for CampaignLedger {
    fn from(raw: RawLedger) -> Self {
        let mut ledger = CampaignLedger::default();
        for entry in raw.sent_emails {
            let attempt = match entry {
                RawAttempt::Record(attempt) => attempt,
                // Old progress files only listed delivered addresses
                RawAttempt::Address(address) => SendAttempt {
                    address,
                    timestamp: None,
                    success: true,
                    error: None,
                },
                RawAttempt::Loose(value) => match SendAttempt::from_loose(&value) {
                    Some(attempt) => attempt,
                    None => {
                        warn!("Skipping ledger entry without an address: {}", value);
                        continue;
                    }
                },
            };
            if attempt.address.trim().is_empty() {
                continue;
            }
            ledger.push_attempt(attempt);
        }
        ledger.stats.last_run = raw
            .campaign_stats
            .as_ref()
            .and_then(|stats| stats.get("last_run"))
            .and_then(|v| v.as_str())
            .and_then(timestamp::parse);
        ledger.recompute_stats();
        ledger
    }
}

impl CampaignLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> &[SendAttempt] {
        &self.attempts
    }

    pub fn stats(&self) -> &CampaignStats {
        &self.stats
    }

    /// Whether an attempt exists for this address (case-insensitive)
    pub fn contains(&self, address: &str) -> bool {
        self.index.contains(&address.to_lowercase())
    }

    /// Lower-cased set of every attempted address
    pub fn attempted(&self) -> &HashSet<String> {
        &self.index
    }

    /// Recipients of `full_list` with no attempt record, in list order
    pub fn unsent(&self, full_list: &[String]) -> Vec<String> {
        full_list
            .iter()
            .filter(|address| !self.contains(address))
            .cloned()
            .collect()
    }

    /// Record the outcome of a send.
    ///
    /// Returns `false` when the address already had a record; the existing
    /// record is left untouched. Counters are recomputed either way.
    pub fn record(&mut self, address: &str, success: bool, error: Option<String>) -> bool {
        let appended = self.push_attempt(SendAttempt {
            address: address.to_string(),
            timestamp: Some(Utc::now()),
            success,
            error: error.filter(|e| !e.is_empty()),
        });
        if !appended {
            debug!("{} already has an attempt record, not adding another", address);
        }

        self.recompute_stats();
        appended
    }

    fn push_attempt(&mut self, attempt: SendAttempt) -> bool {
        if !self.index.insert(attempt.address.to_lowercase()) {
            return false;
        }
        self.attempts.push(attempt);
        true
    }

    /// Rebuild the counters from the full attempt collection
    pub fn recompute_stats(&mut self) {
        let successful = self.attempts.iter().filter(|a| a.success).count();
        self.stats.total_sent = self.attempts.len();
        self.stats.successful = successful;
        self.stats.failed = self.attempts.len() - successful;
    }

    pub fn mark_run(&mut self, at: DateTime<Utc>) {
        self.stats.last_run = Some(at);
    }

    /// Progress of this ledger against a recipient list
    pub fn status(&self, full_list: &[String]) -> CampaignStatus {
        let remaining = self.unsent(full_list).len();
        CampaignStatus {
            total_in_source: full_list.len(),
            attempted: self.stats.total_sent,
            remaining,
            successful: self.stats.successful,
            failed: self.stats.failed,
            last_run: self.stats.last_run,
        }
    }
}

/// Snapshot of a campaign's progress
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignStatus {
    pub total_in_source: usize,
    pub attempted: usize,
    pub remaining: usize,
    pub successful: usize,
    pub failed: usize,
    pub last_run: Option<DateTime<Utc>>,
}

impl CampaignStatus {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let last_run = self
            .last_run
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "Never".to_string());
        write!(
            f,
            "{} in source, {} attempted ({} successful, {} failed), {} remaining, last run: {}",
            self.total_in_source,
            self.attempted,
            self.successful,
            self.failed,
            self.remaining,
            last_run
        )
    }
}

/// Pick at most `limit` distinct recipients uniformly at random.
///
/// Only a drawn sample is shuffled. When everything fits, the whole list is
/// returned unchanged, in source order.
pub fn sample_batch<R: Rng + ?Sized>(unsent: &[String], limit: usize, rng: &mut R) -> Vec<String> {
    if unsent.len() <= limit {
        return unsent.to_vec();
    }

    let mut batch: Vec<String> = unsent.choose_multiple(rng, limit).cloned().collect();
    batch.shuffle(rng);
    batch
}

/// A ledger bound to the store it was loaded from
pub struct ProgressLedger {
    ledger: CampaignLedger,
    store: Box<dyn LedgerStore>,
}

impl ProgressLedger {
    /// Load the ledger from `store`; missing or unreadable state starts fresh
    pub fn load(store: Box<dyn LedgerStore>) -> Self {
        let ledger = match store.load() {
            Ok(Some(ledger)) => {
                info!(
                    "Loaded progress from {}: {} emails already sent",
                    store.location(),
                    ledger.attempts().len()
                );
                ledger
            }
            Ok(None) => {
                info!("No progress file found at {}, starting fresh", store.location());
                CampaignLedger::new()
            }
            Err(e) => {
                error!("Error loading progress from {}: {}", store.location(), e);
                warn!("Treating {} as having no history", store.location());
                CampaignLedger::new()
            }
        };

        Self { ledger, store }
    }

    pub fn ledger(&self) -> &CampaignLedger {
        &self.ledger
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    pub fn unsent(&self, full_list: &[String]) -> Vec<String> {
        self.ledger.unsent(full_list)
    }

    /// Draw the next batch from the recipients of `full_list` not yet attempted
    pub fn sample_batch<R: Rng + ?Sized>(&self, full_list: &[String], limit: usize, rng: &mut R) -> Vec<String> {
        sample_batch(&self.ledger.unsent(full_list), limit, rng)
    }

    pub fn record(&mut self, address: &str, success: bool, error: Option<String>) -> bool {
        self.ledger.record(address, success, error)
    }

    pub fn status(&self, full_list: &[String]) -> CampaignStatus {
        self.ledger.status(full_list)
    }

    /// Write the ledger to its store.
    ///
    /// Failures are logged and reported as `false`; the in-memory ledger stays
    /// authoritative and the next persist may succeed.
    pub fn persist(&mut self) -> bool {
        self.ledger.mark_run(Utc::now());
        match self.store.save(&self.ledger) {
            Ok(()) => {
                debug!(
                    "Progress saved: {} total emails sent",
                    self.ledger.attempts().len()
                );
                true
            }
            Err(e) => {
                error!("Error saving progress to {}: {}", self.store.location(), e);
                false
            }
        }
    }
}

/// Timestamps are written as RFC 3339; naive ISO timestamps are read as UTC
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(at) => serializer.serialize_str(&at.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        // Anything other than a parseable string is treated as unknown
        let raw: Option<serde_json::Value> = Option::deserialize(deserializer)?;
        Ok(raw.as_ref().and_then(|v| v.as_str()).and_then(parse))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
            return Some(at.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// Missing and empty error strings both mean "no error"
mod error_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_deref().unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        let raw: Option<serde_json::Value> = Option::deserialize(deserializer)?;
        Ok(raw
            .as_ref()
            .and_then(|v| v.as_str())
            .filter(|e| !e.is_empty())
            .map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn list(addresses: &[&str]) -> Vec<String> {
        addresses.iter().map(|s| s.to_string()).collect()
    }

    fn assert_invariants(ledger: &CampaignLedger) {
        let stats = ledger.stats();
        assert_eq!(stats.total_sent, ledger.attempts().len());
        assert_eq!(stats.successful + stats.failed, stats.total_sent);
        assert_eq!(ledger.attempted().len(), ledger.attempts().len());
    }

    #[test]
    fn test_record_success() {
        let mut ledger = CampaignLedger::new();
        let full = list(&["a@x.com"]);

        assert_eq!(ledger.unsent(&full), full);
        assert!(ledger.record("a@x.com", true, None));

        assert_eq!(ledger.stats().total_sent, 1);
        assert_eq!(ledger.stats().successful, 1);
        assert_eq!(ledger.stats().failed, 0);
        assert!(ledger.unsent(&full).is_empty());
        assert_invariants(&ledger);
    }

    #[test]
    fn test_record_is_idempotent_per_address() {
        let mut ledger = CampaignLedger::new();
        assert!(ledger.record("a@x.com", false, Some("HTTP 500".to_string())));
        assert!(!ledger.record("a@x.com", true, None));
        assert!(!ledger.record("A@X.COM", true, None));

        assert_eq!(ledger.attempts().len(), 1);
        assert!(!ledger.attempts()[0].success);
        assert_eq!(ledger.attempts()[0].error.as_deref(), Some("HTTP 500"));
        assert_eq!(ledger.stats().failed, 1);
        assert_invariants(&ledger);
    }

    #[test]
    fn test_failed_addresses_are_not_resampled() {
        let mut ledger = CampaignLedger::new();
        ledger.record("a@x.com", false, Some("bounced".to_string()));

        let unsent = ledger.unsent(&list(&["a@x.com", "b@x.com"]));
        assert_eq!(unsent, list(&["b@x.com"]));
    }

    #[test]
    fn test_unsent_is_case_insensitive() {
        let mut ledger = CampaignLedger::new();
        ledger.record("Mixed@Case.com", true, None);

        let unsent = ledger.unsent(&list(&["mixed@case.com", "other@case.com"]));
        assert_eq!(unsent, list(&["other@case.com"]));
    }

    #[test]
    fn test_invariants_over_mixed_sequence() {
        let mut ledger = CampaignLedger::new();
        let outcomes = [
            ("a@x.com", true),
            ("b@x.com", false),
            ("a@x.com", false),
            ("c@x.com", true),
            ("B@x.com", true),
            ("d@x.com", false),
        ];
        for (address, success) in outcomes {
            ledger.record(address, success, None);
            assert_invariants(&ledger);
        }
        assert_eq!(ledger.stats().total_sent, 4);
        assert_eq!(ledger.stats().successful, 2);
        assert_eq!(ledger.stats().failed, 2);
    }

    #[test]
    fn test_hand_edited_entries_still_count_as_attempted() {
        let json = r#"{
            "sent_emails": [
                {"email": "a@x.com", "timestamp": "2024-01-01T10:00:00", "success": true, "error": ""},
                {"email": "b@x.com"},
                {"email": "C@x.com", "timestamp": 1704103200, "success": "yes", "error": null},
                {"email": "d@x.com", "success": false, "error": 42},
                {"name": "no address here"},
                17
            ],
            "campaign_stats": {"total_sent": "lots", "last_run": 5}
        }"#;
        let ledger: CampaignLedger = serde_json::from_str(json).unwrap();

        assert_eq!(ledger.attempts().len(), 4);
        assert_eq!(ledger.stats().successful, 1);
        assert_eq!(ledger.stats().failed, 3);
        assert_eq!(ledger.stats().last_run, None);
        assert!(ledger.attempts()[0].timestamp.is_some());
        assert_eq!(ledger.attempts()[2].timestamp, None);
        assert_invariants(&ledger);

        let full = list(&["a@x.com", "b@x.com", "c@x.com", "d@x.com", "e@x.com"]);
        assert_eq!(ledger.unsent(&full), list(&["e@x.com"]));
    }

    #[test]
    fn test_large_ledger_loads_quickly() {
        let entries: Vec<String> = (0..10_000)
            .map(|i| {
                format!(
                    r#"{{"email": "user{}@x.com", "timestamp": "2024-01-01T10:00:00", "success": {}, "error": ""}}"#,
                    i,
                    i % 7 != 0
                )
            })
            .collect();
        let json = format!(r#"{{"sent_emails": [{}]}}"#, entries.join(","));

        let started = std::time::Instant::now();
        let ledger: CampaignLedger = serde_json::from_str(&json).unwrap();
        let full: Vec<String> = (0..10_500).map(|i| format!("USER{}@x.com", i)).collect();
        let unsent = ledger.unsent(&full);
        let elapsed = started.elapsed();

        assert_eq!(ledger.attempts().len(), 10_000);
        assert_eq!(unsent.len(), 500);
        assert_invariants(&ledger);
        assert!(elapsed < std::time::Duration::from_secs(5), "load took {:?}", elapsed);
    }

    #[test]
    fn test_empty_error_is_none() {
        let mut ledger = CampaignLedger::new();
        ledger.record("a@x.com", false, Some(String::new()));
        assert_eq!(ledger.attempts()[0].error, None);
    }

    #[test]
    fn test_sample_batch_small_list_returns_all() {
        let mut rng = StdRng::seed_from_u64(7);
        let unsent = list(&["a@x.com", "b@x.com"]);
        assert_eq!(sample_batch(&unsent, 50, &mut rng), unsent);
        assert_eq!(sample_batch(&unsent, 2, &mut rng), unsent);
    }

    #[test]
    fn test_sample_batch_draws_distinct_members() {
        let mut rng = StdRng::seed_from_u64(42);
        let unsent: Vec<String> = (0..100).map(|i| format!("user{}@x.com", i)).collect();

        for limit in [0, 1, 10, 99] {
            let batch = sample_batch(&unsent, limit, &mut rng);
            assert_eq!(batch.len(), limit);
            let distinct: HashSet<_> = batch.iter().collect();
            assert_eq!(distinct.len(), limit);
            assert!(batch.iter().all(|address| unsent.contains(address)));
        }
    }

    #[test]
    fn test_sample_batch_is_not_a_prefix() {
        let unsent: Vec<String> = (0..1000).map(|i| format!("user{}@x.com", i)).collect();
        let mut rng = StdRng::seed_from_u64(1);
        let batch = sample_batch(&unsent, 10, &mut rng);
        assert_ne!(batch, unsent[..10].to_vec());
    }

    #[test]
    fn test_status_counts() {
        let mut ledger = CampaignLedger::new();
        ledger.record("a@x.com", true, None);
        ledger.record("gone@x.com", false, None);

        let status = ledger.status(&list(&["a@x.com", "b@x.com", "c@x.com"]));
        assert_eq!(status.total_in_source, 3);
        assert_eq!(status.attempted, 2);
        assert_eq!(status.remaining, 2);
        assert_eq!(status.successful, 1);
        assert_eq!(status.failed, 1);
        assert!(!status.is_complete());
        assert!(status.to_string().contains("last run: Never"));
    }

    #[test]
    fn test_legacy_json_is_normalized() {
        let json = r#"{
            "sent_emails": [
                "old@x.com",
                {"email": "a@x.com", "timestamp": "2024-05-01T10:00:00.123456", "success": true, "error": ""},
                {"email": "b@x.com", "timestamp": "2024-05-01T10:00:02+00:00", "success": false, "error": "HTTP 400"},
                {"email": "A@x.com", "timestamp": null, "success": false, "error": ""}
            ],
            "campaign_stats": {"total_sent": 99, "last_run": "2024-05-01T10:00:03"}
        }"#;

        let ledger: CampaignLedger = serde_json::from_str(json).unwrap();
        assert_eq!(ledger.attempts().len(), 3);
        assert!(ledger.attempts()[0].success);
        assert!(ledger.attempts()[1].timestamp.is_some());
        assert_eq!(ledger.attempts()[1].error, None);
        assert_eq!(ledger.attempts()[2].error.as_deref(), Some("HTTP 400"));
        assert_eq!(ledger.stats().total_sent, 3);
        assert_eq!(ledger.stats().successful, 2);
        assert_eq!(ledger.stats().failed, 1);
        assert!(ledger.stats().last_run.is_some());
        assert_invariants(&ledger);
    }

    #[test]
    fn test_missing_stats_block() {
        let json = r#"{"sent_emails": [{"email": "a@x.com", "success": true}]}"#;
        let ledger: CampaignLedger = serde_json::from_str(json).unwrap();
        assert_eq!(ledger.stats().total_sent, 1);
        assert_eq!(ledger.stats().last_run, None);
    }

    #[test]
    fn test_serialized_shape() {
        let mut ledger = CampaignLedger::new();
        ledger.record("a@x.com", true, None);
        ledger.mark_run(Utc::now());

        let value = serde_json::to_value(&ledger).unwrap();
        assert_eq!(value["sent_emails"][0]["email"], "a@x.com");
        assert_eq!(value["sent_emails"][0]["error"], "");
        assert_eq!(value["campaign_stats"]["total_sent"], 1);
        assert!(value["campaign_stats"]["last_run"].is_string());
    }

    #[test]
    fn test_progress_ledger_persist() {
        let store = MemoryLedgerStore::new();
        let mut progress = ProgressLedger::load(Box::new(store.clone()));
        assert!(progress.ledger().attempts().is_empty());

        progress.record("a@x.com", true, None);
        assert!(progress.persist());

        let reopened = ProgressLedger::load(Box::new(store));
        assert_eq!(reopened.ledger().attempts().len(), 1);
        assert!(reopened.ledger().stats().last_run.is_some());
    }

    #[test]
    fn test_progress_ledger_samples_only_unsent() {
        let mut progress = ProgressLedger::load(Box::new(MemoryLedgerStore::new()));
        progress.record("a@x.com", true, None);
        progress.record("b@x.com", false, Some("bounced".to_string()));

        let full = list(&["a@x.com", "B@x.com", "c@x.com", "d@x.com", "e@x.com"]);
        let mut rng = StdRng::seed_from_u64(3);
        let batch = progress.sample_batch(&full, 2, &mut rng);
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|a| ["c@x.com", "d@x.com", "e@x.com"].contains(&a.as_str())));
    }

    #[test]
    fn test_progress_ledger_corrupt_state_starts_fresh() {
        let store = MemoryLedgerStore::with_contents("{ not json");
        let progress = ProgressLedger::load(Box::new(store));
        assert!(progress.ledger().attempts().is_empty());
    }
}
