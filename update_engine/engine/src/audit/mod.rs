use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::{info, warn};

/// Type of security-relevant event being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    Registration,
    ManifestAccepted,
    ManifestRejected,
    TimeAttestation,
    ConsensusFailure,
    FirmwareRejected,
    Relay,
}

/// Record of an update-protocol event
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub event_type: AuditEventType,
    /// ECU serial or VIN the event is about.
    pub subject: String,
    pub message: String,
    pub timestamp: String, // RFC3339
}

impl AuditRecord {
    pub fn new(event_type: AuditEventType, subject: impl Into<String>, message: impl Into<String>) -> Self {
        AuditRecord {
            event_type,
            subject: subject.into(),
            message: message.into(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn event_type_label(&self) -> &'static str {
        match self.event_type {
            AuditEventType::Registration => "REGISTER",
            AuditEventType::ManifestAccepted => "ACCEPT",
            AuditEventType::ManifestRejected => "REJECT",
            AuditEventType::TimeAttestation => "TIME",
            AuditEventType::ConsensusFailure => "CONSENSUS",
            AuditEventType::FirmwareRejected => "FIRMWARE",
            AuditEventType::Relay => "RELAY",
        }
    }

    fn is_alarm(&self) -> bool {
        matches!(
            self.event_type,
            AuditEventType::ManifestRejected
                | AuditEventType::ConsensusFailure
                | AuditEventType::FirmwareRejected
        )
    }
}

/// Bounded in-memory audit tracker, one per ECU or Director context.
pub struct AuditTracker {
    records: Mutex<VecDeque<AuditRecord>>,
    max_entries: usize,
}

impl AuditTracker {
    pub fn new(max_entries: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(max_entries)),
            max_entries,
        }
    }

    /// Record a new event in the audit log
    pub fn log(&self, record: AuditRecord) {
        if record.is_alarm() {
            warn!(event = record.event_type_label(), subject = %record.subject, "{}", record.message);
        } else {
            info!(event = record.event_type_label(), subject = %record.subject, "{}", record.message);
        }

        // A panic while holding the lock leaves the buffer intact.
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == self.max_entries {
            records.pop_front(); // evict oldest
        }
        records.push_back(record);
    }

    /// Most recent first.
    pub fn recent(&self, count: usize) -> Vec<AuditRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().rev().take(count).cloned().collect()
    }

    pub fn count(&self, event_type: AuditEventType) -> usize {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().filter(|r| r.event_type == event_type).count()
    }
}

impl Default for AuditTracker {
    fn default() -> Self {
        AuditTracker::new(500)
    }
}

/// Helper to get current timestamp as RFC3339 string
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
