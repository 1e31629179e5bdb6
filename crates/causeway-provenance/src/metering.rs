//! Append-only metering ledger
//!
//! One entry per successful token consumption, linking the resource spend
//! back to the authorizing decision and token. There are no update or
//! delete operations; queries aggregate without mutating state.

use crate::store::AppendLog;
use causeway_core::{DecisionId, EntryId, Result, TokenId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One metering record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteringEntry {
    /// Identity of this entry.
    pub entry_id: EntryId,
    /// Token whose consumption produced this entry.
    pub token_id: TokenId,
    /// Decision that authorized the consumption.
    pub decision_id: DecisionId,
    /// Kind of resource consumed.
    pub resource_type: String,
    /// Units consumed.
    pub units_consumed: u64,
    /// Consumption time (milliseconds since epoch).
    pub timestamp_ms: u64,
}

/// Aggregated view over a time range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeteringSummary {
    /// Total units per resource type.
    pub by_resource: BTreeMap<String, u64>,
    /// Total units per authorizing decision.
    pub by_decision: BTreeMap<DecisionId, u64>,
    /// Number of entries in range.
    pub entry_count: usize,
}

/// Append-only metering ledger.
pub struct MeteringLedger {
    log: AppendLog<MeteringEntry>,
    entries: Mutex<Vec<MeteringEntry>>,
}

impl MeteringLedger {
    /// Partition name under which metering appears in the digest tree.
    pub const PARTITION: &'static str = "metering";

    /// Open the metering ledger under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let log: AppendLog<MeteringEntry> =
            AppendLog::open(dir.as_ref().join("metering.ndjson"))?;
        let entries = log.load()?;
        Ok(Self {
            log,
            entries: Mutex::new(entries),
        })
    }

    /// Append one consumption record. Called only from a successful token
    /// consumption.
    pub fn record(
        &self,
        token_id: TokenId,
        decision_id: DecisionId,
        resource_type: impl Into<String>,
        units_consumed: u64,
        timestamp_ms: u64,
    ) -> Result<EntryId> {
        let entry = MeteringEntry {
            entry_id: EntryId::new(),
            token_id,
            decision_id,
            resource_type: resource_type.into(),
            units_consumed,
            timestamp_ms,
        };
        let mut entries = self.entries.lock();
        self.log.append(&entry)?;
        let id = entry.entry_id;
        entries.push(entry);
        Ok(id)
    }

    /// Aggregate consumption in `[since, until)` by resource and decision.
    pub fn summary(&self, since_ms: u64, until_ms: u64) -> MeteringSummary {
        let entries = self.entries.lock();
        let mut summary = MeteringSummary::default();
        for entry in entries
            .iter()
            .filter(|e| e.timestamp_ms >= since_ms && e.timestamp_ms < until_ms)
        {
            *summary
                .by_resource
                .entry(entry.resource_type.clone())
                .or_insert(0) += entry.units_consumed;
            *summary.by_decision.entry(entry.decision_id).or_insert(0) += entry.units_consumed;
            summary.entry_count += 1;
        }
        summary
    }

    /// Entries recorded against one token.
    pub fn entries_for_token(&self, token_id: &TokenId) -> Vec<MeteringEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.token_id == *token_id)
            .cloned()
            .collect()
    }

    /// Number of entries in the ledger.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when the ledger has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_aggregates_by_resource_and_decision() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MeteringLedger::open(dir.path()).unwrap();
        let d1 = DecisionId::new();
        let d2 = DecisionId::new();

        ledger.record(TokenId::new(), d1, "llm_tokens", 100, 10).unwrap();
        ledger.record(TokenId::new(), d1, "llm_tokens", 50, 20).unwrap();
        ledger.record(TokenId::new(), d2, "disk_bytes", 4096, 30).unwrap();
        // Outside the queried range.
        ledger.record(TokenId::new(), d2, "disk_bytes", 9999, 99).unwrap();

        let summary = ledger.summary(0, 50);
        assert_eq!(summary.entry_count, 3);
        assert_eq!(summary.by_resource["llm_tokens"], 150);
        assert_eq!(summary.by_resource["disk_bytes"], 4096);
        assert_eq!(summary.by_decision[&d1], 150);
        assert_eq!(summary.by_decision[&d2], 4096);
    }

    #[test]
    fn entries_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = MeteringLedger::open(dir.path()).unwrap();
            ledger
                .record(TokenId::new(), DecisionId::new(), "calls", 1, 5)
                .unwrap();
        }
        let reopened = MeteringLedger::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 1);
    }
}
