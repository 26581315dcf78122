//! Persistence contract for code records and shipments
//!
//! Every mutating call is a single atomic step at the storage layer. Nothing
//! above this boundary reads a record and then writes it back, so racing
//! requests are settled by the store alone.
use super::error::StoreError;
use super::record::{CodeKind, CodeRecord, Shipment};
use super::utils::new_uuid_to_bech32;

pub const CODE_ID_HRP: &str = "code_";

pub trait CodeStore: Send + Sync {
    /// The unconsumed record holding `code`, if any.
    fn find_unconsumed(&self, code: &str) -> Result<Option<CodeRecord>, StoreError>;

    /// Most recently issued unconsumed record for the pair.
    fn find_active_for_shipment(
        &self,
        shipment_id: &str,
        kind: CodeKind,
    ) -> Result<Option<CodeRecord>, StoreError>;

    /// Stores a new unconsumed record with a store assigned id. Returns
    /// `None` when `code` is already held by another unconsumed record.
    /// Any record that became active for the same pair since the last
    /// `supersede_active` is retired in the same step.
    fn insert(
        &self,
        shipment_id: &str,
        code: &str,
        kind: CodeKind,
        issued_by: Option<&str>,
    ) -> Result<Option<CodeRecord>, StoreError>;

    /// Marks every unconsumed record of the pair consumed. Returns how many
    /// were retired.
    fn supersede_active(&self, shipment_id: &str, kind: CodeKind) -> Result<usize, StoreError>;

    /// Consumes the record only if it is still unconsumed. `false` means
    /// another caller got there first, or the id is unknown.
    fn mark_consumed(&self, id: &str, consumed_by: &str) -> Result<bool, StoreError>;

    /// Every record ever issued for a shipment, oldest first.
    fn history(&self, shipment_id: &str) -> Result<Vec<CodeRecord>, StoreError>;
}

/// Result of consuming a code and rewriting its shipment as one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Committed,
    CodeUsed,
    ShipmentChanged,
}

/// Result of issuing a code and rewriting its shipment as one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueOutcome {
    Issued(CodeRecord),
    CodeTaken,
    ShipmentChanged,
}

/// Result of closing a shipment and withdrawing its pending code together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The consumed copy of the withdrawn code, if one was pending.
    Closed(Option<CodeRecord>),
    ShipmentChanged,
}

pub trait ShipmentStore: CodeStore {
    /// Stores a new shipment. `false` if the id is taken.
    fn insert_shipment(&self, shipment: &Shipment) -> Result<bool, StoreError>;

    fn load_shipment(&self, id: &str) -> Result<Option<Shipment>, StoreError>;

    /// Replaces `current` with `next` only if the stored shipment still
    /// equals `current`.
    fn replace_shipment(&self, current: &Shipment, next: &Shipment) -> Result<bool, StoreError>;

    /// Consumes code `code_id` and replaces `current` with `next` together.
    /// The code is checked first, so a caller that lost a race for the code
    /// sees `CodeUsed` even though the shipment has moved on as well.
    fn consume_and_replace(
        &self,
        code_id: &str,
        consumed_by: &str,
        current: &Shipment,
        next: &Shipment,
    ) -> Result<ConsumeOutcome, StoreError>;

    /// Stores a new unconsumed code for `current` and replaces it with
    /// `next`, retiring the pair's pending code, all in one step. Nothing
    /// is written unless the stored shipment still equals `current` and
    /// the digits are free.
    fn issue_and_replace(
        &self,
        code: &str,
        kind: CodeKind,
        issued_by: Option<&str>,
        current: &Shipment,
        next: &Shipment,
    ) -> Result<IssueOutcome, StoreError>;

    /// Replaces `current` with `next` and consumes the pending code of
    /// `kind` in `withdrawn_by`'s name, together.
    fn replace_and_withdraw(
        &self,
        current: &Shipment,
        next: &Shipment,
        kind: CodeKind,
        withdrawn_by: &str,
    ) -> Result<CloseOutcome, StoreError>;
}

pub(crate) fn new_code_id() -> Result<String, StoreError> {
    new_uuid_to_bech32(CODE_ID_HRP).map_err(|e| StoreError::Encode(e.to_string()))
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, StoreError> {
    minicbor::to_vec(value).map_err(|e| StoreError::Encode(e.to_string()))
}

pub(crate) fn decode<'b, T: minicbor::Decode<'b, ()>>(bytes: &'b [u8]) -> Result<T, StoreError> {
    minicbor::decode(bytes).map_err(|e| StoreError::Decode(e.to_string()))
}
