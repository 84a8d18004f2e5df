//! Durable mirror port and the background writer feeding it.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::ledger::Record;

/// Storage the chain is mirrored to. Implementations may block; the writer
/// calls them from the blocking pool.
pub trait RecordMirror: Send + Sync {
    fn persist(&self, record: &Record) -> Result<()>;

    /// Every persisted record in index order.
    fn load_all(&self) -> Result<Vec<Record>>;
}

pub enum MirrorCommand {
    Persist(Record),
    /// Acknowledged once every earlier command has been handled.
    Flush(oneshot::Sender<()>),
}

/// Mirror kept in process memory.
#[derive(Default)]
pub struct MemoryMirror {
    records: Mutex<Vec<Record>>,
}

impl MemoryMirror {
    pub fn with_records(records: Vec<Record>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

impl RecordMirror for MemoryMirror {
    fn persist(&self, record: &Record) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Record>> {
        Ok(self.records.lock().clone())
    }
}

/// Drain `rx` into `mirror`, one record at a time and in arrival order.
///
/// Persist failures are logged and the writer keeps going; the in-memory
/// chain stays authoritative. The task ends when every sender is dropped.
pub fn spawn_writer(
    mirror: Arc<dyn RecordMirror>,
    mut rx: mpsc::UnboundedReceiver<MirrorCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                MirrorCommand::Persist(record) => {
                    let index = record.index;
                    let mirror = Arc::clone(&mirror);
                    match tokio::task::spawn_blocking(move || mirror.persist(&record)).await {
                        Ok(Ok(())) => debug!(index, "record mirrored"),
                        Ok(Err(e)) => error!(index, error = %e, "failed to mirror record"),
                        Err(e) => error!(index, error = %e, "mirror task panicked"),
                    }
                }
                MirrorCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("ledger mirror writer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use serde_json::json;

    struct BrokenMirror;

    impl RecordMirror for BrokenMirror {
        fn persist(&self, _record: &Record) -> Result<()> {
            anyhow::bail!("disk full")
        }

        fn load_all(&self) -> Result<Vec<Record>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_stop_the_chain() {
        let (tx, rx) = mpsc::unbounded_channel();
        let _writer = spawn_writer(Arc::new(BrokenMirror), rx);
        let ledger = Ledger::new(10).with_mirror(tx);

        ledger.append("D1", &json!({"n": 0})).unwrap();
        ledger.append("D1", &json!({"n": 1})).unwrap();
        ledger.flush_mirror().await;

        assert_eq!(ledger.len(), 2);
        assert!(ledger.verify().ok);
    }

    #[test]
    fn test_memory_mirror_roundtrip() {
        let ledger = Ledger::new(10);
        let r = ledger.append("D1", &json!({"n": 0})).unwrap();
        let mirror = MemoryMirror::default();
        mirror.persist(&r).unwrap();
        assert_eq!(mirror.load_all().unwrap(), vec![r]);
    }
}
