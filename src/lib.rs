//! Single-use delivery confirmation codes and the shipment handoffs they gate.

pub mod audit;
pub mod code_service;
pub mod config;
pub mod error;
pub mod memory_store;
pub mod record;
pub mod shipment;
pub mod sled_store;
pub mod source;
pub mod store;
pub mod utils;

pub use code_service::{Cancellation, ConfirmationCodeService, Verdict};
pub use error::{Rejection, ServiceError, StoreError};
pub use record::{CodeKind, CodeRecord, Shipment, ShipmentState};
pub use shipment::{Confirmation, ShipmentStateMachine};
