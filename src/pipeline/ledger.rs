//! Overflow ledger: which queries matched more results than the API can page
//!
//! The in-memory ledger is shared by every in-flight paginator, so writes are
//! keyed inserts under one lock (no read-modify-write across an await).
//!
//! On disk it is one JSON document:
//!
//! ```json
//! {"nace": {"01.100": 15000}, "nace_kommunenummer": {"47.111:0301": 12000}}
//! ```
//!
//! Persisting always reads the existing file, deep-merges the in-memory
//! entries into it and writes the whole document back, so repeated runs
//! accumulate entries instead of overwriting each other.

use crate::error::HarvestResult;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

/// `kind -> key -> total element count`
pub type LedgerMap = BTreeMap<String, BTreeMap<String, u64>>;

#[derive(Debug, Default)]
pub struct OverflowLedger {
    entries: Mutex<LedgerMap>,
}

impl OverflowLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` under `kind` reported `total` results
    pub fn record(&self, kind: &str, key: &str, total: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(kind.to_string())
            .or_default()
            .insert(key.to_string(), total);
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .all(|keys| keys.is_empty())
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|keys| keys.len())
            .sum()
    }

    pub fn snapshot(&self) -> LedgerMap {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Read-merge-write the ledger file at `path`
    ///
    /// Returns the merged document that was written.
    pub fn persist(&self, path: &Path) -> HarvestResult<LedgerMap> {
        let merged = merge_ledgers(load_ledger(path), self.snapshot());
        write_ledger(path, &merged)?;
        log::debug!(
            "💾 Persisted overflow ledger to {} ({} kinds)",
            path.display(),
            merged.len()
        );
        Ok(merged)
    }
}

/// Deep-merge `new` into `old`; leaf keys present in both take `new`'s value
pub fn merge_ledgers(mut old: LedgerMap, new: LedgerMap) -> LedgerMap {
    for (kind, keys) in new {
        old.entry(kind).or_default().extend(keys);
    }
    old
}

/// Load a ledger file; a missing or unreadable file is an empty ledger
pub fn load_ledger(path: &Path) -> LedgerMap {
    if !path.exists() {
        log::info!("No existing overflow ledger found: {}", path.display());
        return LedgerMap::new();
    }

    match fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|json| serde_json::from_str::<LedgerMap>(&json).map_err(|e| e.to_string()))
    {
        Ok(ledger) => ledger,
        Err(e) => {
            log::warn!(
                "⚠️  Overflow ledger {} is unreadable, treating as empty: {}",
                path.display(),
                e
            );
            LedgerMap::new()
        }
    }
}

/// Write the whole document through a temp file so readers never see half a ledger
fn write_ledger(path: &Path, ledger: &LedgerMap) -> HarvestResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(ledger)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn ledger_of(entries: &[(&str, &str, u64)]) -> LedgerMap {
        let ledger = OverflowLedger::new();
        for (kind, key, total) in entries {
            ledger.record(kind, key, *total);
        }
        ledger.snapshot()
    }

    #[test]
    fn test_merge_keeps_old_entries_and_new_wins_per_leaf() {
        let old = ledger_of(&[("nace", "01.100", 15000), ("nace", "02.200", 11000)]);
        let new = ledger_of(&[("nace", "02.200", 12500), ("postnummer", "0150", 20000)]);

        let merged = merge_ledgers(old, new);

        assert_eq!(merged["nace"]["01.100"], 15000);
        assert_eq!(merged["nace"]["02.200"], 12500);
        assert_eq!(merged["postnummer"]["0150"], 20000);
    }

    #[test]
    fn test_two_runs_with_disjoint_keys_accumulate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let run1 = OverflowLedger::new();
        run1.record("nace", "01.100", 15000);
        run1.persist(&path).unwrap();

        let run2 = OverflowLedger::new();
        run2.record("nace", "02.200", 12000);
        run2.persist(&path).unwrap();

        let on_disk = load_ledger(&path);
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk["nace"].len(), 2);
        assert_eq!(on_disk["nace"]["01.100"], 15000);
        assert_eq!(on_disk["nace"]["02.200"], 12000);
    }

    #[test]
    fn test_absent_and_corrupt_files_are_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        assert!(load_ledger(&path).is_empty());

        fs::write(&path, "{not json").unwrap();
        assert!(load_ledger(&path).is_empty());

        // A corrupt file is replaced by the merged in-memory ledger
        let ledger = OverflowLedger::new();
        ledger.record("nace", "01.100", 15000);
        ledger.persist(&path).unwrap();
        assert_eq!(load_ledger(&path)["nace"]["01.100"], 15000);
    }

    #[test]
    fn test_concurrent_records_are_not_lost() {
        let ledger = Arc::new(OverflowLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        ledger.record("nace", &format!("{}.{}", t, i), 10_001);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ledger.len(), 800);
        assert!(!ledger.is_empty());
    }
}
