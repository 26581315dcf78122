//! Shipment lifecycle. The two handoffs (warehouse to driver, driver to
//! recipient) only happen when a matching code is presented and consumed in
//! the same storage step as the state change.
use super::audit::{AuditEntry, AuditSink, record_best_effort};
use super::code_service::{Cancellation, ConfirmationCodeService, Verdict};
use super::error::{Rejection, Result, ServiceError};
use super::record::{CodeKind, CodeRecord, Shipment, ShipmentState, TimeStamp};
use super::store::{CloseOutcome, ConsumeOutcome, ShipmentStore};
use super::utils::{new_uuid_to_bech32, normalise_code};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SHIPMENT_ID_HRP: &str = "ship_";

// reloads allowed when the shipment moves under an issue
const ISSUE_RETRIES: usize = 3;

pub fn new_shipment_id() -> anyhow::Result<String> {
    new_uuid_to_bech32(SHIPMENT_ID_HRP)
}

/// Result of presenting a code for a handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Transitioned(Shipment),
    Rejected(Rejection),
}

impl Confirmation {
    pub fn is_transitioned(&self) -> bool {
        matches!(self, Confirmation::Transitioned(_))
    }
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Confirmation::Transitioned(_) => None,
            Confirmation::Rejected(reason) => Some(*reason),
        }
    }
}

pub struct ShipmentStateMachine<S> {
    codes: ConfirmationCodeService<S>,
    store: Arc<S>,
    audit: Arc<dyn AuditSink>,
}

impl<S: ShipmentStore> ShipmentStateMachine<S> {
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_codes(ConfirmationCodeService::new(store), audit)
    }

    pub fn with_codes(codes: ConfirmationCodeService<S>, audit: Arc<dyn AuditSink>) -> Self {
        let store = Arc::clone(codes.store());
        Self {
            codes,
            store,
            audit,
        }
    }

    pub fn codes(&self) -> &ConfirmationCodeService<S> {
        &self.codes
    }

    pub fn shipment(&self, shipment_id: &str) -> Result<Shipment> {
        self.store
            .load_shipment(shipment_id)?
            .ok_or_else(|| ServiceError::ShipmentNotFound(shipment_id.to_string()))
    }

    fn require(
        shipment: &Shipment,
        allowed: &[ShipmentState],
        action: &'static str,
    ) -> Result<()> {
        if allowed.contains(&shipment.state) {
            Ok(())
        } else {
            Err(ServiceError::InvalidTransition {
                from: shipment.state,
                action,
            })
        }
    }

    fn audit(&self, actor_id: &str, action: &str, shipment_id: &str, details: String) {
        record_best_effort(
            self.audit.as_ref(),
            AuditEntry::new(actor_id, action, shipment_id, details),
        );
    }

    // swaps in `next` if nobody changed the shipment since it was loaded
    fn commit(&self, current: &Shipment, next: Shipment) -> Result<Shipment> {
        if !self.store.replace_shipment(current, &next)? {
            return Err(ServiceError::Conflict(current.id.clone()));
        }
        info!(shipment = %next.id, from = ?current.state, to = ?next.state, "shipment transitioned");
        Ok(next)
    }

    /// Stores a new shipment in `Pending`.
    pub fn register(&self, shipment_id: &str, actor_id: &str) -> Result<Shipment> {
        let shipment = Shipment::new(shipment_id.to_string());
        if !self.store.insert_shipment(&shipment)? {
            return Err(ServiceError::ShipmentExists(shipment_id.to_string()));
        }
        self.audit(actor_id, "REGISTER", shipment_id, String::new());
        Ok(shipment)
    }

    pub fn prepare(&self, shipment_id: &str, actor_id: &str) -> Result<Shipment> {
        let shipment = self.shipment(shipment_id)?;
        Self::require(&shipment, &[ShipmentState::Pending], "prepare")?;
        let next = self.commit(&shipment, shipment.with_state(ShipmentState::Prepared))?;
        self.audit(actor_id, "PREPARE", shipment_id, String::new());
        Ok(next)
    }

    /// Hands the shipment over for pickup and issues the pickup code. May be
    /// repeated while pickup is pending; each call replaces the previous code.
    pub fn dispatch(&self, shipment_id: &str, warehouse_actor_id: &str) -> Result<CodeRecord> {
        let record = self.issue(
            shipment_id,
            CodeKind::WarehouseToDriver,
            warehouse_actor_id,
            &[
                ShipmentState::Prepared,
                ShipmentState::AwaitingPickupConfirmation,
            ],
            ShipmentState::AwaitingPickupConfirmation,
            "dispatch",
        )?;
        self.audit(
            warehouse_actor_id,
            "DISPATCH",
            shipment_id,
            "pickup confirmation code issued".into(),
        );
        Ok(record)
    }

    // issues a code of `kind` and moves the shipment to `target` in one storage step
    fn issue(
        &self,
        shipment_id: &str,
        kind: CodeKind,
        actor_id: &str,
        allowed: &[ShipmentState],
        target: ShipmentState,
        action: &'static str,
    ) -> Result<CodeRecord> {
        for _ in 0..ISSUE_RETRIES {
            let shipment = self.shipment(shipment_id)?;
            Self::require(&shipment, allowed, action)?;
            let next = shipment.with_state(target);

            let issued = self.codes.generate_with(shipment_id, kind, |candidate| {
                self.store
                    .issue_and_replace(candidate, kind, Some(actor_id), &shipment, &next)
            })?;
            match issued {
                Some(record) => {
                    if shipment.state != next.state {
                        info!(shipment = %shipment_id, from = ?shipment.state, to = ?next.state, "shipment transitioned");
                    }
                    return Ok(record);
                }
                None => debug!(shipment = %shipment_id, "shipment changed while issuing, reloading"),
            }
        }
        Err(ServiceError::Conflict(shipment_id.to_string()))
    }

    /// Consumes a pickup code and moves the shipment to `InTransit`. A bad
    /// code comes back as `Confirmation::Rejected`; a good code presented
    /// while the shipment is not awaiting pickup is an `InvalidTransition`
    /// error and the code stays unconsumed.
    pub fn confirm_pickup(
        &self,
        shipment_id: &str,
        driver_id: &str,
        presented_code: &str,
    ) -> Result<Confirmation> {
        self.confirm(
            shipment_id,
            driver_id,
            presented_code,
            CodeKind::WarehouseToDriver,
        )
    }

    /// Issues the code the recipient hands the driver at the door.
    pub fn generate_delivery_code(&self, shipment_id: &str, actor_id: &str) -> Result<CodeRecord> {
        let record = self.issue(
            shipment_id,
            CodeKind::DriverToRecipient,
            actor_id,
            &[ShipmentState::InTransit],
            ShipmentState::InTransit,
            "issue a delivery code for",
        )?;
        self.audit(
            actor_id,
            "DELIVERY_CODE",
            shipment_id,
            "delivery confirmation code issued".into(),
        );
        Ok(record)
    }

    pub fn confirm_delivery(
        &self,
        shipment_id: &str,
        driver_id: &str,
        presented_code: &str,
    ) -> Result<Confirmation> {
        self.confirm(
            shipment_id,
            driver_id,
            presented_code,
            CodeKind::DriverToRecipient,
        )
    }

    fn confirm(
        &self,
        shipment_id: &str,
        actor_id: &str,
        presented_code: &str,
        kind: CodeKind,
    ) -> Result<Confirmation> {
        if normalise_code(Some(presented_code)).is_none() {
            return Ok(Confirmation::Rejected(Rejection::InvalidFormat));
        }

        let shipment = self.shipment(shipment_id)?;
        let record = match self.codes.check(presented_code, shipment_id, Some(kind))? {
            Ok(record) => record,
            Err(reason) => {
                info!(shipment = %shipment_id, kind = %kind, reason = ?reason, "handoff rejected");
                return Ok(Confirmation::Rejected(reason));
            }
        };

        let (next, action) = match kind {
            CodeKind::WarehouseToDriver => {
                Self::require(
                    &shipment,
                    &[ShipmentState::AwaitingPickupConfirmation],
                    "confirm pickup of",
                )?;
                let mut next = shipment.with_state(ShipmentState::InTransit);
                next.assigned_driver_id = Some(actor_id.to_string());
                (next, "CONFIRM_PICKUP")
            }
            CodeKind::DriverToRecipient => {
                Self::require(&shipment, &[ShipmentState::InTransit], "confirm delivery of")?;
                let mut next = shipment.with_state(ShipmentState::Delivered);
                next.delivered_at = Some(TimeStamp::new());
                (next, "CONFIRM_DELIVERY")
            }
        };

        match self
            .store
            .consume_and_replace(&record.id, actor_id, &shipment, &next)?
        {
            ConsumeOutcome::Committed => {
                info!(shipment = %shipment_id, from = ?shipment.state, to = ?next.state, "handoff confirmed");
                self.audit(
                    actor_id,
                    action,
                    shipment_id,
                    format!("{} code accepted", kind),
                );
                Ok(Confirmation::Transitioned(next))
            }
            ConsumeOutcome::CodeUsed => Ok(Confirmation::Rejected(Rejection::NotFoundOrUsed)),
            ConsumeOutcome::ShipmentChanged => {
                warn!(shipment = %shipment_id, "shipment changed while confirming handoff");
                Err(ServiceError::Conflict(shipment_id.to_string()))
            }
        }
    }

    /// Unilateral stop by a driver or admin. No code is needed; any pending
    /// delivery code is withdrawn.
    pub fn cancel_in_transit(
        &self,
        shipment_id: &str,
        actor_id: &str,
        reason: &str,
    ) -> Result<Shipment> {
        let reason = non_empty(reason)?;
        self.close_in_transit(
            shipment_id,
            actor_id,
            ShipmentState::Canceled,
            "CANCEL",
            Some(reason),
        )
    }

    /// Records an incident at the door; the shipment leaves the delivery run.
    pub fn report_failed_attempt(
        &self,
        shipment_id: &str,
        driver_id: &str,
        reason: &str,
    ) -> Result<Shipment> {
        let reason = non_empty(reason)?;
        self.close_in_transit(
            shipment_id,
            driver_id,
            ShipmentState::DeliveryAttemptFailed,
            "DELIVERY_ATTEMPT_FAILED",
            Some(reason),
        )
    }

    pub fn return_to_warehouse(&self, shipment_id: &str, actor_id: &str) -> Result<Shipment> {
        self.close_in_transit(
            shipment_id,
            actor_id,
            ShipmentState::ReturnedToWarehouse,
            "RETURN_TO_WAREHOUSE",
            None,
        )
    }

    fn close_in_transit(
        &self,
        shipment_id: &str,
        actor_id: &str,
        target: ShipmentState,
        action: &'static str,
        note: Option<String>,
    ) -> Result<Shipment> {
        let shipment = self.shipment(shipment_id)?;
        Self::require(&shipment, &[ShipmentState::InTransit], "close")?;

        let mut next = shipment.with_state(target);
        next.note = note.clone();

        let withdrawn = match self.store.replace_and_withdraw(
            &shipment,
            &next,
            CodeKind::DriverToRecipient,
            actor_id,
        )? {
            CloseOutcome::Closed(withdrawn) => withdrawn,
            CloseOutcome::ShipmentChanged => {
                return Err(ServiceError::Conflict(shipment_id.to_string()));
            }
        };
        info!(shipment = %shipment_id, from = ?shipment.state, to = ?next.state, "shipment transitioned");
        if withdrawn.is_some() {
            info!(shipment = %shipment_id, "withdrew pending delivery code");
        }
        self.audit(actor_id, action, shipment_id, note.unwrap_or_default());
        Ok(next)
    }

    /// Issues a code of `kind`: a pickup code dispatches the shipment, a
    /// delivery code needs it in transit.
    ///
    /// Pickup codes for a gated handoff must come from here or
    /// [`Self::dispatch`]. A code issued directly through
    /// [`ConfirmationCodeService::generate`] leaves a `Prepared` shipment
    /// where it is, and presenting it to [`Self::confirm_and_transition`]
    /// then fails with `InvalidTransition`.
    pub fn generate_code(
        &self,
        shipment_id: &str,
        kind: CodeKind,
        issued_by: &str,
    ) -> Result<CodeRecord> {
        match kind {
            CodeKind::WarehouseToDriver => self.dispatch(shipment_id, issued_by),
            CodeKind::DriverToRecipient => self.generate_delivery_code(shipment_id, issued_by),
        }
    }

    /// Non-consuming check against the handoff the caller is about to gate.
    pub fn validate_code(
        &self,
        code: &str,
        shipment_id: &str,
        expected_kind: CodeKind,
    ) -> Result<Verdict> {
        Ok(self
            .codes
            .check(code, shipment_id, Some(expected_kind))?
            .into())
    }

    /// Presents a code for the handoff of `expected_kind`. Code problems are
    /// returned as `Confirmation::Rejected`; a valid code for a shipment in
    /// the wrong state is an `InvalidTransition` error and nothing changes.
    pub fn confirm_and_transition(
        &self,
        shipment_id: &str,
        presented_code: &str,
        expected_kind: CodeKind,
        actor_id: &str,
    ) -> Result<Confirmation> {
        self.confirm(shipment_id, actor_id, presented_code, expected_kind)
    }

    pub fn cancel_active_code(
        &self,
        shipment_id: &str,
        kind: CodeKind,
        actor_id: &str,
    ) -> Result<Cancellation> {
        let outcome = self.codes.cancel_active(shipment_id, kind, actor_id)?;
        if let Cancellation::Canceled(code) = &outcome {
            self.audit(
                actor_id,
                "CANCEL_CODE",
                shipment_id,
                format!("{} code {} canceled", kind, code),
            );
        }
        Ok(outcome)
    }
}

fn non_empty(reason: &str) -> Result<String> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(ServiceError::MissingReason);
    }
    Ok(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::config::Config;
    use crate::memory_store::MemoryStore;
    use crate::source::SequenceCodeSource;

    fn machine(codes: &[&str]) -> (ShipmentStateMachine<MemoryStore>, Arc<MemoryAuditLog>) {
        let audit = Arc::new(MemoryAuditLog::new());
        let service = ConfirmationCodeService::with_source(
            Arc::new(MemoryStore::new()),
            Arc::new(SequenceCodeSource::new(codes.iter().copied())),
            Config::default(),
        );
        (ShipmentStateMachine::with_codes(service, audit.clone()), audit)
    }

    fn in_transit(machine: &ShipmentStateMachine<MemoryStore>, id: &str) {
        machine.register(id, "admin").unwrap();
        machine.prepare(id, "staff1").unwrap();
        let pickup = machine.dispatch(id, "staff1").unwrap();
        assert!(machine
            .confirm_pickup(id, "driver7", &pickup.code)
            .unwrap()
            .is_transitioned());
    }

    #[test]
    fn dispatch_requires_prepared() {
        let (machine, _) = machine(&["482913"]);
        machine.register("ship_a", "admin").unwrap();

        let err = machine.dispatch("ship_a", "staff1").unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InvalidTransition {
                from: ShipmentState::Pending,
                ..
            }
        ));
        assert!(!machine
            .codes()
            .has_active_code("ship_a", CodeKind::WarehouseToDriver)
            .unwrap());
    }

    #[test]
    fn redispatch_supersedes_the_pickup_code() {
        let (machine, _) = machine(&["111111", "222222"]);
        machine.register("ship_a", "admin").unwrap();
        machine.prepare("ship_a", "staff1").unwrap();

        machine.dispatch("ship_a", "staff1").unwrap();
        machine.dispatch("ship_a", "staff1").unwrap();

        let stale = machine.confirm_pickup("ship_a", "driver7", "111111").unwrap();
        assert_eq!(stale.rejection(), Some(Rejection::NotFoundOrUsed));

        let fresh = machine.confirm_pickup("ship_a", "driver7", "222222").unwrap();
        assert!(fresh.is_transitioned());
    }

    #[test]
    fn rejected_pickup_leaves_shipment_untouched() {
        let (machine, audit) = machine(&["482913"]);
        machine.register("ship_a", "admin").unwrap();
        machine.prepare("ship_a", "staff1").unwrap();
        machine.dispatch("ship_a", "staff1").unwrap();
        let before = machine.shipment("ship_a").unwrap();
        let actions_before = audit.actions();

        for bad in ["48291", "999999", "48a913"] {
            let outcome = machine.confirm_pickup("ship_a", "driver7", bad).unwrap();
            assert!(!outcome.is_transitioned());
        }

        assert_eq!(machine.shipment("ship_a").unwrap(), before);
        assert_eq!(audit.actions(), actions_before);
    }

    #[test]
    fn exhausted_dispatch_leaves_shipment_prepared() {
        let (machine, audit) = machine(&["111111"]);
        for id in ["ship_a", "ship_b"] {
            machine.register(id, "admin").unwrap();
            machine.prepare(id, "staff1").unwrap();
        }
        machine.dispatch("ship_a", "staff1").unwrap();

        // the only code on offer is held by ship_a
        let err = machine.dispatch("ship_b", "staff1").unwrap_err();
        assert!(matches!(err, ServiceError::CodeSpaceExhausted { attempts: 100 }));

        let shipment = machine.shipment("ship_b").unwrap();
        assert_eq!(shipment.state, ShipmentState::Prepared);
        assert!(!machine
            .codes()
            .has_active_code("ship_b", CodeKind::WarehouseToDriver)
            .unwrap());
        assert!(audit
            .entries()
            .iter()
            .all(|e| !(e.shipment_id == "ship_b" && e.action == "DISPATCH")));
    }

    #[test]
    fn valid_code_in_the_wrong_state_is_an_error_and_stays_unconsumed() {
        let (machine, _) = machine(&["482913"]);
        machine.register("ship_a", "admin").unwrap();
        machine.prepare("ship_a", "staff1").unwrap();
        machine
            .codes()
            .generate("ship_a", CodeKind::WarehouseToDriver, Some("staff1"))
            .unwrap();

        let err = machine
            .confirm_and_transition("ship_a", "482913", CodeKind::WarehouseToDriver, "driver7")
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InvalidTransition {
                from: ShipmentState::Prepared,
                ..
            }
        ));
        assert!(machine
            .codes()
            .has_active_code("ship_a", CodeKind::WarehouseToDriver)
            .unwrap());
    }

    #[test]
    fn delivery_code_needs_transit() {
        let (machine, _) = machine(&["482913"]);
        machine.register("ship_a", "admin").unwrap();
        machine.prepare("ship_a", "staff1").unwrap();

        let err = machine
            .generate_delivery_code("ship_a", "branch2")
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { .. }));
    }

    #[test]
    fn cancel_requires_a_reason_and_withdraws_delivery_code() {
        let (machine, audit) = machine(&["482913", "019442"]);
        in_transit(&machine, "ship_a");
        machine.generate_delivery_code("ship_a", "branch2").unwrap();

        let err = machine.cancel_in_transit("ship_a", "driver7", "   ").unwrap_err();
        assert!(matches!(err, ServiceError::MissingReason));

        let canceled = machine
            .cancel_in_transit("ship_a", "driver7", "recipient moved away")
            .unwrap();
        assert_eq!(canceled.state, ShipmentState::Canceled);
        assert_eq!(canceled.note.as_deref(), Some("recipient moved away"));
        assert!(!machine
            .codes()
            .has_active_code("ship_a", CodeKind::DriverToRecipient)
            .unwrap());
        assert_eq!(audit.actions().last().map(String::as_str), Some("CANCEL"));
    }

    #[test]
    fn failed_attempt_and_return_are_terminal() {
        let (machine, _) = machine(&["111111", "222222"]);
        in_transit(&machine, "ship_a");
        in_transit(&machine, "ship_b");

        let failed = machine
            .report_failed_attempt("ship_a", "driver7", "nobody home")
            .unwrap();
        assert_eq!(failed.state, ShipmentState::DeliveryAttemptFailed);
        assert!(failed.state.is_terminal());

        let returned = machine.return_to_warehouse("ship_b", "driver7").unwrap();
        assert_eq!(returned.state, ShipmentState::ReturnedToWarehouse);

        let err = machine.return_to_warehouse("ship_b", "driver7").unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { .. }));
    }

    #[test]
    fn unknown_shipment_is_an_error() {
        let (machine, _) = machine(&["482913"]);
        let err = machine
            .confirm_pickup("ship_missing", "driver7", "482913")
            .unwrap_err();
        assert!(matches!(err, ServiceError::ShipmentNotFound(_)));
    }
}
