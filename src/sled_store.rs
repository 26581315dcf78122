//! sled backed store. Records are CBOR encoded; every mutation runs as one
//! multi-tree transaction.
use super::error::StoreError;
use super::record::{CodeKind, CodeRecord, Shipment, pair_key};
use super::store::{
    CloseOutcome, CodeStore, ConsumeOutcome, IssueOutcome, ShipmentStore, decode, encode,
    new_code_id,
};
use sled::Tree;
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionResult, TransactionalTree,
    Transactional,
};
use std::sync::Arc;
use tracing::debug;

type TxResult<T> = Result<T, ConflictableTransactionError<StoreError>>;

pub struct SledStore {
    codes: Tree,    // code id -> CodeRecord
    active: Tree,   // code digits -> id, unconsumed only
    pending: Tree,  // shipment/kind -> id, unconsumed only
    shipments: Tree, // shipment id -> Shipment
}

impl SledStore {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, StoreError> {
        Ok(Self {
            codes: instance.open_tree("codes")?,
            active: instance.open_tree("codes_active")?,
            pending: instance.open_tree("codes_pending")?,
            shipments: instance.open_tree("shipments")?,
        })
    }

    fn load_code(&self, id: &[u8]) -> Result<Option<CodeRecord>, StoreError> {
        match self.codes.get(id)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn abort_on<T>(result: Result<T, StoreError>) -> TxResult<T> {
    result.map_err(ConflictableTransactionError::Abort)
}

fn finish<T>(result: TransactionResult<T, StoreError>) -> Result<T, StoreError> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::Unavailable(e),
    })
}

// the unconsumed record stored under `id`, if there is one
fn load_unconsumed(codes: &TransactionalTree, id: &[u8]) -> TxResult<Option<CodeRecord>> {
    let Some(bytes) = codes.get(id)? else {
        return Ok(None);
    };
    let record: CodeRecord = abort_on(decode(&bytes))?;
    Ok((!record.consumed).then_some(record))
}

// writes the consumed copy and drops both index entries that point at it
fn retire(
    codes: &TransactionalTree,
    active: &TransactionalTree,
    pending: &TransactionalTree,
    retired: &CodeRecord,
) -> TxResult<()> {
    let id = retired.id.as_bytes();
    codes.insert(id, abort_on(encode(retired))?)?;
    if active.get(retired.code.as_bytes())?.as_deref() == Some(id) {
        active.remove(retired.code.as_bytes())?;
    }
    let key = retired.pair_key();
    if pending.get(key.as_bytes())?.as_deref() == Some(id) {
        pending.remove(key.as_bytes())?;
    }
    Ok(())
}

// indexes a fresh record, retiring whatever was pending for its pair
fn store_code(
    codes: &TransactionalTree,
    active: &TransactionalTree,
    pending: &TransactionalTree,
    record: &CodeRecord,
    encoded: &[u8],
) -> TxResult<()> {
    let key = record.pair_key();
    if let Some(previous) = pending.get(key.as_bytes())? {
        if let Some(stale) = load_unconsumed(codes, &previous)? {
            retire(codes, active, pending, &stale.superseded())?;
        }
    }
    codes.insert(record.id.as_bytes(), encoded)?;
    active.insert(record.code.as_bytes(), record.id.as_bytes())?;
    pending.insert(key.as_bytes(), record.id.as_bytes())?;
    Ok(())
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

impl CodeStore for SledStore {
    fn find_unconsumed(&self, code: &str) -> Result<Option<CodeRecord>, StoreError> {
        let Some(id) = self.active.get(code.as_bytes())? else {
            return Ok(None);
        };
        Ok(self.load_code(&id)?.filter(|record| !record.consumed))
    }

    fn find_active_for_shipment(
        &self,
        shipment_id: &str,
        kind: CodeKind,
    ) -> Result<Option<CodeRecord>, StoreError> {
        let Some(id) = self.pending.get(pair_key(shipment_id, kind).as_bytes())? else {
            return Ok(None);
        };
        Ok(self.load_code(&id)?.filter(|record| !record.consumed))
    }

    fn insert(
        &self,
        shipment_id: &str,
        code: &str,
        kind: CodeKind,
        issued_by: Option<&str>,
    ) -> Result<Option<CodeRecord>, StoreError> {
        let record = new_record(shipment_id, code, kind, issued_by)?;
        let encoded = encode(&record)?;

        let inserted = (&self.codes, &self.active, &self.pending).transaction(
            |(codes, active, pending)| {
                if active.get(record.code.as_bytes())?.is_some() {
                    return Ok(false);
                }
                store_code(codes, active, pending, &record, &encoded)?;
                Ok(true)
            },
        );

        if finish(inserted)? {
            debug!(id = %record.id, shipment = %record.shipment_id, kind = %kind, "code record stored");
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    fn supersede_active(&self, shipment_id: &str, kind: CodeKind) -> Result<usize, StoreError> {
        let key = pair_key(shipment_id, kind);
        let retired = (&self.codes, &self.active, &self.pending).transaction(
            |(codes, active, pending)| {
                let Some(id) = pending.get(key.as_bytes())? else {
                    return Ok(0);
                };
                match load_unconsumed(codes, &id)? {
                    Some(stale) => {
                        retire(codes, active, pending, &stale.superseded())?;
                        Ok(1)
                    }
                    None => {
                        pending.remove(key.as_bytes())?;
                        Ok(0)
                    }
                }
            },
        );
        finish(retired)
    }

    fn mark_consumed(&self, id: &str, consumed_by: &str) -> Result<bool, StoreError> {
        let consumed = (&self.codes, &self.active, &self.pending).transaction(
            |(codes, active, pending)| match load_unconsumed(codes, id.as_bytes())? {
                Some(record) => {
                    retire(codes, active, pending, &record.consume(consumed_by))?;
                    Ok(true)
                }
                None => Ok(false),
            },
        );
        finish(consumed)
    }

    fn history(&self, shipment_id: &str) -> Result<Vec<CodeRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in self.codes.iter() {
            let (_, bytes) = entry?;
            let record: CodeRecord = decode(&bytes)?;
            if record.shipment_id == shipment_id {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        Ok(records)
    }
}

impl ShipmentStore for SledStore {
    fn insert_shipment(&self, shipment: &Shipment) -> Result<bool, StoreError> {
        let swapped = self.shipments.compare_and_swap(
            shipment.id.as_bytes(),
            None::<&[u8]>,
            Some(encode(shipment)?),
        )?;
        Ok(swapped.is_ok())
    }

    fn load_shipment(&self, id: &str) -> Result<Option<Shipment>, StoreError> {
        match self.shipments.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn replace_shipment(&self, current: &Shipment, next: &Shipment) -> Result<bool, StoreError> {
        let swapped = self.shipments.compare_and_swap(
            current.id.as_bytes(),
            Some(encode(current)?),
            Some(encode(next)?),
        )?;
        Ok(swapped.is_ok())
    }

    fn consume_and_replace(
        &self,
        code_id: &str,
        consumed_by: &str,
        current: &Shipment,
        next: &Shipment,
    ) -> Result<ConsumeOutcome, StoreError> {
        let expected = encode(current)?;
        let replacement = encode(next)?;

        let outcome = (&self.codes, &self.active, &self.pending, &self.shipments).transaction(
            |(codes, active, pending, shipments)| {
                let Some(record) = load_unconsumed(codes, code_id.as_bytes())? else {
                    return Ok(ConsumeOutcome::CodeUsed);
                };
                if shipments.get(current.id.as_bytes())?.as_deref() != Some(expected.as_slice()) {
                    return Ok(ConsumeOutcome::ShipmentChanged);
                }
                retire(codes, active, pending, &record.consume(consumed_by))?;
                shipments.insert(current.id.as_bytes(), replacement.as_slice())?;
                Ok(ConsumeOutcome::Committed)
            },
        );
        finish(outcome)
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
        let encoded = encode(&record)?;
        let expected = encode(current)?;
        let replacement = encode(next)?;

        let issued = (&self.codes, &self.active, &self.pending, &self.shipments).transaction(
            |(codes, active, pending, shipments)| {
                if shipments.get(current.id.as_bytes())?.as_deref() != Some(expected.as_slice()) {
                    return Ok(IssueOutcome::ShipmentChanged);
                }
                if active.get(record.code.as_bytes())?.is_some() {
                    return Ok(IssueOutcome::CodeTaken);
                }
                store_code(codes, active, pending, &record, &encoded)?;
                shipments.insert(current.id.as_bytes(), replacement.as_slice())?;
                Ok(IssueOutcome::Issued(record.clone()))
            },
        );

        let issued = finish(issued)?;
        if matches!(issued, IssueOutcome::Issued(_)) {
            debug!(id = %record.id, shipment = %record.shipment_id, kind = %kind, "code record stored");
        }
        Ok(issued)
    }

    fn replace_and_withdraw(
        &self,
        current: &Shipment,
        next: &Shipment,
        kind: CodeKind,
        withdrawn_by: &str,
    ) -> Result<CloseOutcome, StoreError> {
        let expected = encode(current)?;
        let replacement = encode(next)?;
        let key = pair_key(&current.id, kind);

        let closed = (&self.codes, &self.active, &self.pending, &self.shipments).transaction(
            |(codes, active, pending, shipments)| {
                if shipments.get(current.id.as_bytes())?.as_deref() != Some(expected.as_slice()) {
                    return Ok(CloseOutcome::ShipmentChanged);
                }
                let mut withdrawn = None;
                if let Some(id) = pending.get(key.as_bytes())? {
                    if let Some(record) = load_unconsumed(codes, &id)? {
                        let record = record.consume(withdrawn_by);
                        retire(codes, active, pending, &record)?;
                        withdrawn = Some(record);
                    }
                }
                shipments.insert(current.id.as_bytes(), replacement.as_slice())?;
                Ok(CloseOutcome::Closed(withdrawn))
            },
        );
        finish(closed)
    }
}
