//! Issuing, checking and consuming confirmation codes
use super::config::Config;
use super::error::{Rejection, Result, ServiceError, StoreError};
use super::record::{CodeKind, CodeRecord};
use super::source::{CodeSource, RandomCodeSource};
use super::store::{CodeStore, IssueOutcome};
use super::utils::normalise_code;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of checking a presented code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid(CodeKind),
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid(_))
    }
    pub fn kind(&self) -> Option<CodeKind> {
        match self {
            Verdict::Valid(kind) => Some(*kind),
            Verdict::Rejected(_) => None,
        }
    }
    pub fn reason(&self) -> Option<Rejection> {
        match self {
            Verdict::Valid(_) => None,
            Verdict::Rejected(reason) => Some(*reason),
        }
    }
}

impl From<std::result::Result<CodeRecord, Rejection>> for Verdict {
    fn from(value: std::result::Result<CodeRecord, Rejection>) -> Self {
        match value {
            Ok(record) => Verdict::Valid(record.kind),
            Err(reason) => Verdict::Rejected(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cancellation {
    /// The code that was withdrawn.
    Canceled(String),
    NothingActive,
}

pub struct ConfirmationCodeService<S> {
    store: Arc<S>,
    source: Arc<dyn CodeSource>,
    config: Config,
}

impl<S: CodeStore> ConfirmationCodeService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_source(store, Arc::new(RandomCodeSource), Config::default())
    }

    pub fn with_source(store: Arc<S>, source: Arc<dyn CodeSource>, config: Config) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Issues a fresh code for the pair, retiring whichever code was pending
    /// for it. Gives up after `max_generation_attempts` draws.
    pub fn generate(
        &self,
        shipment_id: &str,
        kind: CodeKind,
        issued_by: Option<&str>,
    ) -> Result<CodeRecord> {
        let mut superseded = false;
        let issued = self.generate_with(shipment_id, kind, |candidate| {
            if !superseded {
                let retired = self.store.supersede_active(shipment_id, kind)?;
                if retired > 0 {
                    info!(shipment = %shipment_id, kind = %kind, retired, "superseded pending code");
                }
                superseded = true;
            }
            Ok(match self.store.insert(shipment_id, candidate, kind, issued_by)? {
                Some(record) => IssueOutcome::Issued(record),
                None => IssueOutcome::CodeTaken,
            })
        })?;
        // a plain insert has no shipment to guard
        issued.ok_or_else(|| ServiceError::Conflict(shipment_id.to_string()))
    }

    /// The bounded draw loop behind every issue. `store_code` persists one
    /// candidate; `None` means it refused because the shipment moved.
    pub(crate) fn generate_with<F>(
        &self,
        shipment_id: &str,
        kind: CodeKind,
        mut store_code: F,
    ) -> Result<Option<CodeRecord>>
    where
        F: FnMut(&str) -> std::result::Result<IssueOutcome, StoreError>,
    {
        let attempts = self.config.max_generation_attempts;

        for attempt in 1..=attempts {
            let candidate = self.source.draw(&self.config.code_range);
            if self.store.find_unconsumed(&candidate)?.is_some() {
                debug!(attempt, "candidate code already active, drawing again");
                continue;
            }

            match store_code(&candidate)? {
                IssueOutcome::Issued(record) => {
                    info!(shipment = %shipment_id, kind = %kind, attempt, "confirmation code issued");
                    return Ok(Some(record));
                }
                // another request claimed the same digits in the meantime
                IssueOutcome::CodeTaken => continue,
                IssueOutcome::ShipmentChanged => return Ok(None),
            }
        }

        warn!(shipment = %shipment_id, kind = %kind, attempts, "code space exhausted");
        Err(ServiceError::CodeSpaceExhausted { attempts })
    }

    /// Looks a code up and checks its binding. Nothing is mutated. When
    /// `expected` is given, a code of the other kind is `WrongKind`.
    pub(crate) fn check(
        &self,
        code: &str,
        shipment_id: &str,
        expected: Option<CodeKind>,
    ) -> Result<std::result::Result<CodeRecord, Rejection>> {
        let Some(code) = normalise_code(Some(code)) else {
            return Ok(Err(Rejection::InvalidFormat));
        };
        let Some(record) = self.store.find_unconsumed(code)? else {
            return Ok(Err(Rejection::NotFoundOrUsed));
        };
        if record.shipment_id != shipment_id {
            warn!(
                shipment = %shipment_id,
                bound_to = %record.shipment_id,
                "code presented for the wrong shipment"
            );
            return Ok(Err(Rejection::ShipmentMismatch));
        }
        if let Some(expected) = expected {
            if record.kind != expected {
                warn!(
                    shipment = %shipment_id,
                    expected = %expected,
                    actual = %record.kind,
                    "code presented for the wrong handoff"
                );
                return Ok(Err(Rejection::WrongKind));
            }
        }
        Ok(Ok(record))
    }

    /// Pre-flight check for a form or app screen.
    pub fn validate_without_consuming(&self, code: &str, shipment_id: &str) -> Result<Verdict> {
        Ok(self.check(code, shipment_id, None)?.into())
    }

    /// Consumes the code if it is unconsumed and bound to `shipment_id`,
    /// whatever its kind. Callers gating a transition should prefer
    /// [`Self::validate_and_consume_for`], which leaves wrong-kind codes alone.
    pub fn validate_and_consume(
        &self,
        code: &str,
        shipment_id: &str,
        consumed_by: &str,
    ) -> Result<Verdict> {
        self.consume_checked(code, shipment_id, None, consumed_by)
    }

    pub fn validate_and_consume_for(
        &self,
        code: &str,
        shipment_id: &str,
        expected: CodeKind,
        consumed_by: &str,
    ) -> Result<Verdict> {
        self.consume_checked(code, shipment_id, Some(expected), consumed_by)
    }

    fn consume_checked(
        &self,
        code: &str,
        shipment_id: &str,
        expected: Option<CodeKind>,
        consumed_by: &str,
    ) -> Result<Verdict> {
        let record = match self.check(code, shipment_id, expected)? {
            Ok(record) => record,
            Err(reason) => return Ok(Verdict::Rejected(reason)),
        };
        if !self.store.mark_consumed(&record.id, consumed_by)? {
            debug!(shipment = %shipment_id, "lost the race to consume code");
            return Ok(Verdict::Rejected(Rejection::NotFoundOrUsed));
        }
        info!(shipment = %shipment_id, kind = %record.kind, "confirmation code consumed");
        Ok(Verdict::Valid(record.kind))
    }

    /// Withdraws the pending code for the pair. Cancelling consumes the code
    /// in the canceller's name; the record is kept.
    pub fn cancel_active(
        &self,
        shipment_id: &str,
        kind: CodeKind,
        canceled_by: &str,
    ) -> Result<Cancellation> {
        let Some(record) = self.store.find_active_for_shipment(shipment_id, kind)? else {
            return Ok(Cancellation::NothingActive);
        };
        if !self.store.mark_consumed(&record.id, canceled_by)? {
            return Ok(Cancellation::NothingActive);
        }
        info!(shipment = %shipment_id, kind = %kind, "confirmation code canceled");
        Ok(Cancellation::Canceled(record.code))
    }

    pub fn active_code(&self, shipment_id: &str, kind: CodeKind) -> Result<Option<CodeRecord>> {
        Ok(self.store.find_active_for_shipment(shipment_id, kind)?)
    }

    pub fn has_active_code(&self, shipment_id: &str, kind: CodeKind) -> Result<bool> {
        Ok(self.active_code(shipment_id, kind)?.is_some())
    }
}
