//! Audit trail of shipment actions. Writes are best effort: a failing sink is
//! logged and never fails the operation that produced the entry.
use super::record::TimeStamp;
use chrono::Utc;
use parking_lot::Mutex;
use sled::Tree;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct AuditEntry {
    #[n(0)]
    pub actor_id: String,
    #[n(1)]
    pub action: String, // e.g. DISPATCH, CONFIRM_PICKUP
    #[n(2)]
    pub details: String,
    #[n(3)]
    pub shipment_id: String,
    #[n(4)]
    pub timestamp: TimeStamp<Utc>,
}

impl AuditEntry {
    pub fn new(actor_id: &str, action: &str, shipment_id: &str, details: String) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            action: action.to_string(),
            details,
            shipment_id: shipment_id.to_string(),
            timestamp: TimeStamp::new(),
        }
    }

    /// CBOR encoding of the entry and its sha256 digest, used as the key.
    pub fn build(&self) -> anyhow::Result<(String, Vec<u8>)> {
        let cbor = minicbor::to_vec(self)?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry) -> anyhow::Result<()>;
}

pub fn record_best_effort(sink: &dyn AuditSink, entry: AuditEntry) {
    if let Err(e) = sink.record(&entry) {
        warn!(
            action = %entry.action,
            shipment = %entry.shipment_id,
            error = %e,
            "failed to write audit entry"
        );
    }
}

pub struct SledAuditLog {
    tree: Tree,
}

impl SledAuditLog {
    pub fn new(instance: Arc<sled::Db>) -> anyhow::Result<Self> {
        Ok(Self {
            tree: instance.open_tree("audit")?,
        })
    }

    /// Entries for one shipment, oldest first.
    pub fn entries_for(&self, shipment_id: &str) -> anyhow::Result<Vec<AuditEntry>> {
        let mut entries = Vec::new();
        for item in self.tree.iter() {
            let (_, bytes) = item?;
            let entry: AuditEntry = minicbor::decode(&bytes)?;
            if entry.shipment_id == shipment_id {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }
}

impl AuditSink for SledAuditLog {
    fn record(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        let (hash, cbor) = entry.build()?;
        self.tree.insert(hash.as_bytes(), cbor)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.action.clone()).collect()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}
