use super::record::ShipmentState;

/// Why a presented code was turned away. These never mutate state and are
/// returned to callers as values, not errors.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("The code must be exactly 6 digits.")]
    InvalidFormat,
    #[error("The code is not valid or has already been used.")]
    NotFoundOrUsed,
    #[error("The code does not belong to this shipment.")]
    ShipmentMismatch,
    #[error("The code is not valid for this step of the delivery.")]
    WrongKind,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] sled::Error),
    #[error("failed to decode stored record: {0}")]
    Decode(String),
    #[error("failed to encode record: {0}")]
    Encode(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("could not find an unused code after {attempts} attempts, please try again")]
    CodeSpaceExhausted { attempts: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("shipment {0} does not exist")]
    ShipmentNotFound(String),
    #[error("shipment {0} already exists")]
    ShipmentExists(String),
    #[error("cannot {action} a shipment that is {from:?}")]
    InvalidTransition {
        from: ShipmentState,
        action: &'static str,
    },
    #[error("a non-empty reason is required")]
    MissingReason,
    #[error("shipment {0} was modified concurrently")]
    Conflict(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
