//! Append-only audit ledger of completed analyses
//!
//! Entries live for the process lifetime only. There is no API that edits or
//! removes an entry, so the entry count never decreases.

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{OnceLock, PoisonError, RwLock};
use tracing::info;
use uuid::Uuid;

/// Prefix of every verification code
pub const VERIFICATION_PREFIX: &str = "SAP";

const BASE36_DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const RANDOM_SUFFIX_LEN: usize = 6;

/// One completed analysis. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Unique entry ID
    pub id: String,
    /// Position in creation order, starting at 1
    pub sequence: u64,
    /// Creation instant (RFC 3339 when serialized)
    pub timestamp: DateTime<Utc>,
    /// Text that was submitted
    pub original_text: String,
    /// Name of the uploaded file, if the text came from one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Humanized text returned by the backend
    pub response: String,
    pub verification_code: String,
}

/// Full-history export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub export_timestamp: DateTime<Utc>,
    pub total_entries: usize,
    /// Newest first
    pub audit_logs: Vec<AuditEntry>,
}

/// In-memory ledger, newest entry first
#[derive(Debug, Default)]
pub struct AuditLedger {
    entries: RwLock<VecDeque<AuditEntry>>,
}

impl AuditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed analysis and return its verification code
    pub fn record(&self, original_text: &str, response: &str, file_name: Option<&str>) -> String {
        let verification_code = generate_verification_code();

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            sequence: entries.len() as u64 + 1,
            timestamp: Utc::now(),
            original_text: original_text.to_string(),
            file_name: file_name.map(str::to_string),
            response: response.to_string(),
            verification_code: verification_code.clone(),
        };

        info!(
            sequence = entry.sequence,
            verification_code = %entry.verification_code,
            file_name = ?entry.file_name,
            "Recorded audit entry"
        );

        entries.push_front(entry);
        verification_code
    }

    /// All entries, newest first
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.read().iter().cloned().collect()
    }

    /// Look up an entry by its verification code
    pub fn get(&self, verification_code: &str) -> Option<AuditEntry> {
        self.read()
            .iter()
            .find(|e| e.verification_code == verification_code)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Serializable copy of the whole ledger
    pub fn export_snapshot(&self) -> LedgerSnapshot {
        let audit_logs = self.entries();
        LedgerSnapshot {
            export_timestamp: Utc::now(),
            total_entries: audit_logs.len(),
            audit_logs,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, VecDeque<AuditEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Build a code of the form `SAP-<base36 millis>-<6 random base36>`.
///
/// Uniqueness is probabilistic and never checked.
pub fn generate_verification_code() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let mut rng = rand::thread_rng();
    let suffix: String = (0..RANDOM_SUFFIX_LEN)
        .map(|_| BASE36_DIGITS[rng.gen_range(0..BASE36_DIGITS.len())] as char)
        .collect();

    format!("{}-{}-{}", VERIFICATION_PREFIX, to_base36(millis), suffix)
}

/// True if `code` has the verification code shape
pub fn is_verification_code(code: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^SAP-[0-9A-Z]+-[0-9A-Z]{6}$").unwrap())
        .is_match(code)
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "Z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_700_000_000_000), "LOYW3V28");
    }

    #[test]
    fn test_verification_code_shape() {
        for _ in 0..50 {
            let code = generate_verification_code();
            assert!(is_verification_code(&code), "bad code: {code}");
            let suffix = code.rsplit('-').next().unwrap();
            assert_eq!(suffix.len(), 6);
            assert!(suffix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn test_rejects_malformed_codes() {
        assert!(!is_verification_code(""));
        assert!(!is_verification_code("SAP-abc-ABCDEF"));
        assert!(!is_verification_code("SAP-LOYW3V28-ABCDE"));
        assert!(!is_verification_code("XYZ-LOYW3V28-ABCDEF"));
    }

    #[test]
    fn test_record_returns_code_of_new_entry() {
        let ledger = AuditLedger::new();
        let code = ledger.record("hello", "Hello, analyzed.", Some("notes.txt"));

        assert_eq!(ledger.len(), 1);
        let entry = ledger.get(&code).unwrap();
        assert_eq!(entry.original_text, "hello");
        assert_eq!(entry.response, "Hello, analyzed.");
        assert_eq!(entry.file_name.as_deref(), Some("notes.txt"));
        assert_eq!(entry.sequence, 1);
    }

    #[test]
    fn test_entries_newest_first() {
        let ledger = AuditLedger::new();
        for i in 0..5 {
            ledger.record(&format!("text {i}"), "ok", None);
        }

        let entries = ledger.entries();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].original_text, "text 4");
        assert!(entries.windows(2).all(|w| w[0].sequence > w[1].sequence));
        assert!(entries.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

        let mut ids: Vec<_> = entries.iter().map(|e| e.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn test_snapshot_is_read_only_and_repeatable() {
        let ledger = AuditLedger::new();
        ledger.record("a", "first", None);
        ledger.record("b", "second", Some("b.txt"));

        let first = ledger.export_snapshot();
        let second = ledger.export_snapshot();

        assert_eq!(first.total_entries, 2);
        assert_eq!(first.total_entries, second.total_entries);
        assert_eq!(first.audit_logs, second.audit_logs);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let ledger = AuditLedger::new();
        ledger.record("hello", "Hello, analyzed.", None);

        let json = serde_json::to_value(ledger.export_snapshot()).unwrap();
        assert_eq!(json["totalEntries"], 1);
        assert!(json["exportTimestamp"].is_string());

        let entry = &json["auditLogs"][0];
        assert_eq!(entry["originalText"], "hello");
        assert!(entry.get("fileName").is_none());
        let timestamp = entry["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_concurrent_records_all_land() {
        let ledger = std::sync::Arc::new(AuditLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = std::sync::Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        ledger.record(&format!("{t}-{i}"), "ok", None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entries = ledger.entries();
        assert_eq!(entries.len(), 200);
        assert_eq!(entries[0].sequence, 200);
        assert_eq!(entries[199].sequence, 1);
    }
}
