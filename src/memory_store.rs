//! In-memory store for tests and embedding. One lock guards every map, so
//! each call is atomic with respect to every other.
use super::error::StoreError;
use super::record::{CodeKind, CodeRecord, Shipment, pair_key};
use super::store::{
    CloseOutcome, CodeStore, ConsumeOutcome, IssueOutcome, ShipmentStore, new_code_id,
};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct Tables {
    codes: HashMap<String, CodeRecord>,
    active: HashMap<String, String>,  // code digits -> id
    pending: HashMap<String, String>, // shipment/kind -> id
    shipments: HashMap<String, Shipment>,
}

impl Tables {
    fn unconsumed(&self, id: &str) -> Option<CodeRecord> {
        self.codes.get(id).filter(|r| !r.consumed).cloned()
    }

    fn retire(&mut self, retired: CodeRecord) {
        if self.active.get(&retired.code) == Some(&retired.id) {
            self.active.remove(&retired.code);
        }
        let key = retired.pair_key();
        if self.pending.get(&key) == Some(&retired.id) {
            self.pending.remove(&key);
        }
        self.codes.insert(retired.id.clone(), retired);
    }

    // indexes a fresh record, retiring whatever was pending for its pair
    fn store_code(&mut self, record: &CodeRecord) {
        let key = record.pair_key();
        if let Some(stale) = self.pending.get(&key).and_then(|id| self.unconsumed(id)) {
            self.retire(stale.superseded());
        }
        self.active.insert(record.code.clone(), record.id.clone());
        self.pending.insert(key, record.id.clone());
        self.codes.insert(record.id.clone(), record.clone());
    }
}

fn new_record(
    shipment_id: &str,
    code: &str,
    kind: CodeKind,
    issued_by: Option<&str>,
) -> Result<CodeRecord, StoreError> {
    Ok(CodeRecord::new(
        new_code_id()?,
        shipment_id.to_string(),
        code.to_string(),
        kind,
        issued_by.map(str::to_string),
    ))
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CodeStore for MemoryStore {
    fn find_unconsumed(&self, code: &str) -> Result<Option<CodeRecord>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables.active.get(code).and_then(|id| tables.unconsumed(id)))
    }

    fn find_active_for_shipment(
        &self,
        shipment_id: &str,
        kind: CodeKind,
    ) -> Result<Option<CodeRecord>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .pending
            .get(&pair_key(shipment_id, kind))
            .and_then(|id| tables.unconsumed(id)))
    }

    fn insert(
        &self,
        shipment_id: &str,
        code: &str,
        kind: CodeKind,
        issued_by: Option<&str>,
    ) -> Result<Option<CodeRecord>, StoreError> {
        let record = new_record(shipment_id, code, kind, issued_by)?;

        let mut tables = self.tables.lock();
        if tables.active.contains_key(code) {
            return Ok(None);
        }
        tables.store_code(&record);
        Ok(Some(record))
    }

    fn supersede_active(&self, shipment_id: &str, kind: CodeKind) -> Result<usize, StoreError> {
        let key = pair_key(shipment_id, kind);
        let mut tables = self.tables.lock();
        match tables.pending.get(&key).and_then(|id| tables.unconsumed(id)) {
            Some(stale) => {
                tables.retire(stale.superseded());
                Ok(1)
            }
            None => {
                tables.pending.remove(&key);
                Ok(0)
            }
        }
    }

    fn mark_consumed(&self, id: &str, consumed_by: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        match tables.unconsumed(id) {
            Some(record) => {
                tables.retire(record.consume(consumed_by));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn history(&self, shipment_id: &str) -> Result<Vec<CodeRecord>, StoreError> {
        let tables = self.tables.lock();
        let mut records: Vec<CodeRecord> = tables
            .codes
            .values()
            .filter(|r| r.shipment_id == shipment_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        Ok(records)
    }
}

impl ShipmentStore for MemoryStore {
    fn insert_shipment(&self, shipment: &Shipment) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        if tables.shipments.contains_key(&shipment.id) {
            return Ok(false);
        }
        tables
            .shipments
            .insert(shipment.id.clone(), shipment.clone());
        Ok(true)
    }

    fn load_shipment(&self, id: &str) -> Result<Option<Shipment>, StoreError> {
        Ok(self.tables.lock().shipments.get(id).cloned())
    }

    fn replace_shipment(&self, current: &Shipment, next: &Shipment) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        if tables.shipments.get(&current.id) != Some(current) {
            return Ok(false);
        }
        tables.shipments.insert(current.id.clone(), next.clone());
        Ok(true)
    }

    fn consume_and_replace(
        &self,
        code_id: &str,
        consumed_by: &str,
        current: &Shipment,
        next: &Shipment,
    ) -> Result<ConsumeOutcome, StoreError> {
        let mut tables = self.tables.lock();
        let Some(record) = tables.unconsumed(code_id) else {
            return Ok(ConsumeOutcome::CodeUsed);
        };
        if tables.shipments.get(&current.id) != Some(current) {
            return Ok(ConsumeOutcome::ShipmentChanged);
        }
        tables.retire(record.consume(consumed_by));
        tables.shipments.insert(current.id.clone(), next.clone());
        Ok(ConsumeOutcome::Committed)
    }

    fn issue_and_replace(
        &self,
        code: &str,
        kind: CodeKind,
        issued_by: Option<&str>,
        current: &Shipment,
        next: &Shipment,
    ) -> Result<IssueOutcome, StoreError> {
        let record = new_record(&current.id, code, kind, issued_by)?;

        let mut tables = self.tables.lock();
        if tables.shipments.get(&current.id) != Some(current) {
            return Ok(IssueOutcome::ShipmentChanged);
        }
        if tables.active.contains_key(code) {
            return Ok(IssueOutcome::CodeTaken);
        }
        tables.store_code(&record);
        tables.shipments.insert(current.id.clone(), next.clone());
        Ok(IssueOutcome::Issued(record))
    }

    fn replace_and_withdraw(
        &self,
        current: &Shipment,
        next: &Shipment,
        kind: CodeKind,
        withdrawn_by: &str,
    ) -> Result<CloseOutcome, StoreError> {
        let mut tables = self.tables.lock();
        if tables.shipments.get(&current.id) != Some(current) {
            return Ok(CloseOutcome::ShipmentChanged);
        }
        let withdrawn = tables
            .pending
            .get(&pair_key(&current.id, kind))
            .and_then(|id| tables.unconsumed(id))
            .map(|record| record.consume(withdrawn_by));
        if let Some(record) = &withdrawn {
            tables.retire(record.clone());
        }
        tables.shipments.insert(current.id.clone(), next.clone());
        Ok(CloseOutcome::Closed(withdrawn))
    }
}
