//! Append-only, hash-linked record chain.
//!
//! `append` is the only mutator and runs one short critical section: index,
//! `prev_hash`, `created_at` and `hash` are all derived under the chain lock,
//! so no two appends can observe the same predecessor. The lock never covers
//! I/O; mirrored records are handed to a writer task through a channel while
//! the lock is held, which keeps the mirror in chain order.

pub mod hash;
pub mod mirror;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::LedgerError;

pub use hash::{canonical_json, payload_hash, record_hash, Digest};
pub use mirror::{spawn_writer, MemoryMirror, MirrorCommand, RecordMirror};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Confirmed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Confirmed => "Confirmed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Confirmed" => Some(RecordStatus::Confirmed),
            _ => None,
        }
    }
}

/// One appended event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub index: u64,
    pub device_id: String,
    pub payload_hash: Digest,
    pub prev_hash: Digest,
    pub hash: Digest,
    pub created_at: DateTime<Utc>,
    pub status: RecordStatus,
}

impl Record {
    /// Recompute this record's hash from its stored fields.
    pub fn compute_hash(&self) -> Digest {
        record_hash(
            self.index,
            &self.device_id,
            &self.payload_hash,
            &self.prev_hash,
            &self.created_at,
            self.status,
        )
    }
}

/// Result of walking the chain from genesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub ok: bool,
    pub first_bad_index: Option<u64>,
    pub length: u64,
}

impl ChainReport {
    /// The break as an error, for callers that alert on it.
    pub fn check(&self) -> Result<(), LedgerError> {
        match self.first_bad_index {
            Some(index) => Err(LedgerError::ChainIntegrity {
                index,
                length: self.length,
            }),
            None => Ok(()),
        }
    }
}

/// Walk `records` from genesis, checking index, linkage and hash.
pub fn verify_records(records: &[Record]) -> ChainReport {
    let mut expected_prev = Digest::GENESIS;
    for (i, record) in records.iter().enumerate() {
        let index = i as u64;
        let intact = record.index == index
            && record.prev_hash == expected_prev
            && record.compute_hash() == record.hash;
        if !intact {
            return ChainReport {
                ok: false,
                first_bad_index: Some(index),
                length: records.len() as u64,
            };
        }
        expected_prev = record.hash;
    }
    ChainReport {
        ok: true,
        first_bad_index: None,
        length: records.len() as u64,
    }
}

struct ChainState {
    records: Vec<Record>,
    recent: VecDeque<Record>,
}

pub struct Ledger {
    state: Mutex<ChainState>,
    tail_capacity: usize,
    mirror: Option<mpsc::UnboundedSender<MirrorCommand>>,
}

impl Ledger {
    pub fn new(tail_capacity: usize) -> Self {
        let tail_capacity = tail_capacity.max(1);
        Self {
            state: Mutex::new(ChainState {
                records: Vec::new(),
                recent: VecDeque::with_capacity(tail_capacity),
            }),
            tail_capacity,
            mirror: None,
        }
    }

    /// Forward every future append to a mirror writer.
    pub fn with_mirror(mut self, tx: mpsc::UnboundedSender<MirrorCommand>) -> Self {
        self.mirror = Some(tx);
        self
    }

    /// Append one event. The payload is canonicalized and hashed before the
    /// chain lock is taken.
    pub fn append<T: Serialize + ?Sized>(&self, device_id: &str, payload: &T) -> Result<Record, LedgerError> {
        let payload_hash = payload_hash(payload)?;

        let record = {
            let mut state = self.state.lock();
            // Follows the stored head, not the vector length, so a restored
            // chain with a gap keeps accepting appends.
            let (index, prev_hash, created_at) = match state.records.last() {
                Some(last) => {
                    let index = last.index + 1;
                    if state.recent.back().map(|r| r.hash) != Some(last.hash) {
                        return Err(LedgerError::ConcurrencyViolation {
                            index,
                            reason: format!("recent cache disagrees with chain head {}", last.index),
                        });
                    }
                    // Wall clock may step backwards; record order wins.
                    (index, last.hash, Utc::now().max(last.created_at))
                }
                None => (0, Digest::GENESIS, Utc::now()),
            };

            let status = RecordStatus::Confirmed;
            let hash = record_hash(index, device_id, &payload_hash, &prev_hash, &created_at, status);
            let record = Record {
                index,
                device_id: device_id.to_string(),
                payload_hash,
                prev_hash,
                hash,
                created_at,
                status,
            };

            state.records.push(record.clone());
            if state.recent.len() == self.tail_capacity {
                state.recent.pop_front();
            }
            state.recent.push_back(record.clone());

            if let Some(tx) = &self.mirror {
                if tx.send(MirrorCommand::Persist(record.clone())).is_err() {
                    warn!(index, "ledger mirror writer has stopped, record kept in memory only");
                }
            }
            record
        };

        debug!(index = record.index, device_id, hash = %record.hash, "record appended");
        Ok(record)
    }

    /// Verify the whole chain from genesis. Hashing runs on a copy taken
    /// under the lock, so appends are only held up by the copy.
    pub fn verify(&self) -> ChainReport {
        let report = verify_records(&self.snapshot());
        if let Err(e) = report.check() {
            error!(error = %e, "chain integrity check failed");
        }
        report
    }

    /// Up to `k` most recent records, newest first. `k` is clamped to the
    /// recent-records cache capacity.
    pub fn tail(&self, k: usize) -> Vec<Record> {
        let state = self.state.lock();
        state.recent.iter().rev().take(k.min(self.tail_capacity)).cloned().collect()
    }

    pub fn len(&self) -> u64 {
        self.state.lock().records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn head(&self) -> Option<Digest> {
        self.state.lock().records.last().map(|r| r.hash)
    }

    /// Record with the given index. Falls back to a search when a restored
    /// chain has gaps.
    pub fn get(&self, index: u64) -> Option<Record> {
        let state = self.state.lock();
        match state.records.get(index as usize) {
            Some(record) if record.index == index => Some(record.clone()),
            _ => state.records.iter().find(|r| r.index == index).cloned(),
        }
    }

    /// Copy of the full chain in append order.
    pub fn snapshot(&self) -> Vec<Record> {
        self.state.lock().records.clone()
    }

    pub fn tail_capacity(&self) -> usize {
        self.tail_capacity
    }

    /// Replace the chain with records loaded from a mirror.
    ///
    /// A chain that fails verification is still loaded as-is so the break
    /// stays visible to `verify`; it is reported, never repaired.
    pub fn restore(&self, records: Vec<Record>) -> ChainReport {
        let report = verify_records(&records);
        let mut state = self.state.lock();
        let skip = records.len().saturating_sub(self.tail_capacity);
        state.recent = records.iter().skip(skip).cloned().collect();
        state.records = records;
        drop(state);

        match report.first_bad_index {
            Some(index) => error!(index, length = report.length, "restored chain failed verification"),
            None => info!(length = report.length, "restored ledger chain"),
        }
        report
    }

    /// Wait until the mirror writer has handled every record sent so far.
    pub async fn flush_mirror(&self) {
        let Some(tx) = &self.mirror else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(MirrorCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_genesis_and_linkage() {
        let ledger = Ledger::new(10);
        let r0 = ledger.append("D1", &json!({"n": 0})).unwrap();
        let r1 = ledger.append("D2", &json!({"n": 1})).unwrap();

        assert_eq!(r0.index, 0);
        assert_eq!(r0.prev_hash, Digest::GENESIS);
        assert_eq!(r1.index, 1);
        assert_eq!(r1.prev_hash, r0.hash);
        assert_eq!(r0.status, RecordStatus::Confirmed);
        assert!(r1.created_at >= r0.created_at);
        assert_eq!(ledger.head(), Some(r1.hash));
    }

    #[test]
    fn test_verify_pure_chain() {
        let ledger = Ledger::new(10);
        assert_eq!(
            ledger.verify(),
            ChainReport { ok: true, first_bad_index: None, length: 0 }
        );
        for n in 0..25 {
            ledger.append("D1", &json!({ "n": n })).unwrap();
        }
        assert_eq!(
            ledger.verify(),
            ChainReport { ok: true, first_bad_index: None, length: 25 }
        );
    }

    #[test]
    fn test_tamper_detected_at_exact_index() {
        for target in [0usize, 7, 19] {
            let ledger = Ledger::new(10);
            for n in 0..20 {
                ledger.append("D1", &json!({ "n": n })).unwrap();
            }
            ledger.state.lock().records[target].device_id = "forged".into();
            let report = ledger.verify();
            assert!(!report.ok);
            assert_eq!(report.first_bad_index, Some(target as u64));
        }
    }

    #[test]
    fn test_relinked_tamper_still_detected() {
        let ledger = Ledger::new(10);
        for n in 0..5 {
            ledger.append("D1", &json!({ "n": n })).unwrap();
        }
        {
            let mut state = ledger.state.lock();
            let r = &mut state.records[2];
            r.payload_hash = Digest([7; 32]);
            r.hash = r.compute_hash();
        }
        // Record 2 is self-consistent now, so the break surfaces at 3.
        assert_eq!(ledger.verify().first_bad_index, Some(3));
    }

    #[test]
    fn test_concurrent_appends_are_contiguous() {
        let ledger = Arc::new(Ledger::new(10));
        std::thread::scope(|s| {
            for t in 0..100 {
                let ledger = Arc::clone(&ledger);
                s.spawn(move || {
                    ledger.append(&format!("D{t}"), &json!({ "t": t })).unwrap();
                });
            }
        });

        assert_eq!(ledger.len(), 100);
        let mut prev = Digest::GENESIS;
        for i in 0..100 {
            let r = ledger.get(i).unwrap();
            assert_eq!(r.index, i);
            assert_eq!(r.prev_hash, prev);
            prev = r.hash;
        }
        assert!(ledger.verify().ok);
    }

    #[test]
    fn test_tail_is_newest_first_and_clamped() {
        let ledger = Ledger::new(3);
        for n in 0..5 {
            ledger.append("D1", &json!({ "n": n })).unwrap();
        }
        let tail: Vec<u64> = ledger.tail(10).iter().map(|r| r.index).collect();
        assert_eq!(tail, vec![4, 3, 2]);
        assert_eq!(ledger.tail(1)[0].index, 4);
        assert!(ledger.tail(0).is_empty());
        // The chain itself is never truncated.
        assert_eq!(ledger.len(), 5);
        assert_eq!(ledger.get(0).unwrap().index, 0);
    }

    #[test]
    fn test_restore_keeps_broken_chain_visible() {
        let source = Ledger::new(10);
        for n in 0..4 {
            source.append("D1", &json!({ "n": n })).unwrap();
        }
        let mut records: Vec<Record> = (0..4).filter_map(|i| source.get(i)).collect();
        records[1].device_id = "forged".into();

        let restored = Ledger::new(2);
        let report = restored.restore(records);
        assert_eq!(report.first_bad_index, Some(1));
        assert_eq!(
            report.check(),
            Err(LedgerError::ChainIntegrity { index: 1, length: 4 })
        );
        assert_eq!(restored.len(), 4);
        assert_eq!(restored.verify().first_bad_index, Some(1));
        let tail: Vec<u64> = restored.tail(5).iter().map(|r| r.index).collect();
        assert_eq!(tail, vec![3, 2]);
    }

    #[test]
    fn test_append_continues_after_gapped_restore() {
        let source = Ledger::new(10);
        for n in 0..6 {
            source.append("D1", &json!({ "n": n })).unwrap();
        }
        let mut records = source.snapshot();
        records.remove(2);

        let restored = Ledger::new(10);
        let report = restored.restore(records);
        assert_eq!(report.first_bad_index, Some(2));

        for n in 0..3 {
            let r = restored.append("D2", &json!({ "after": n })).unwrap();
            assert_eq!(r.index, 6 + n);
        }
        let head = restored.get(8).unwrap();
        assert_eq!(head.prev_hash, restored.get(7).unwrap().hash);
        assert_eq!(restored.get(6).unwrap().prev_hash, source.get(5).unwrap().hash);
        assert!(restored.get(2).is_none());
        // The gap stays reported.
        assert_eq!(restored.verify().first_bad_index, Some(2));
    }

    #[test]
    fn test_verify_runs_alongside_appends() {
        let ledger = Arc::new(Ledger::new(10));
        for n in 0..2_000 {
            ledger.append("D1", &json!({ "n": n })).unwrap();
        }
        std::thread::scope(|s| {
            let verifier = Arc::clone(&ledger);
            s.spawn(move || assert!(verifier.verify().ok));
            for t in 0..20 {
                let ledger = Arc::clone(&ledger);
                s.spawn(move || {
                    ledger.append("D2", &json!({ "t": t })).unwrap();
                });
            }
        });
        assert_eq!(ledger.len(), 2_020);
        assert!(ledger.verify().ok);
    }

    #[tokio::test]
    async fn test_mirror_receives_records_in_order() {
        let mirror = Arc::new(MemoryMirror::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = spawn_writer(mirror.clone(), rx);
        let ledger = Ledger::new(10).with_mirror(tx);

        for n in 0..10 {
            ledger.append("D1", &json!({ "n": n })).unwrap();
        }
        ledger.flush_mirror().await;

        let mirrored = mirror.load_all().unwrap();
        assert_eq!(mirrored.len(), 10);
        assert!(verify_records(&mirrored).ok);

        drop(ledger);
        writer.await.unwrap();
    }
}
