//! Persistent records: confirmation codes and the shipment fields that gate on them
use chrono::{DateTime, TimeZone, Utc};

/// The handoff a code authorises.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeKind {
    #[n(0)]
    WarehouseToDriver,
    #[n(1)]
    DriverToRecipient,
}

impl CodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeKind::WarehouseToDriver => "WAREHOUSE_TO_DRIVER",
            CodeKind::DriverToRecipient => "DRIVER_TO_RECIPIENT",
        }
    }
}

impl std::fmt::Display for CodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShipmentState {
    #[n(0)]
    Pending,
    #[n(1)]
    Prepared,
    #[n(2)]
    AwaitingPickupConfirmation,
    #[n(3)]
    InTransit,
    #[n(4)]
    Delivered,
    #[n(5)]
    Canceled,
    #[n(6)]
    DeliveryAttemptFailed,
    #[n(7)]
    ReturnedToWarehouse,
}

/// What the ordering client is shown, a coarser view of [`ShipmentState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Accepted,
    OutForDelivery,
    Delivered,
    NotDelivered,
}

impl ShipmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShipmentState::Delivered
                | ShipmentState::Canceled
                | ShipmentState::DeliveryAttemptFailed
                | ShipmentState::ReturnedToWarehouse
        )
    }

    pub fn client_status(&self) -> ClientStatus {
        match self {
            ShipmentState::Pending
            | ShipmentState::Prepared
            | ShipmentState::AwaitingPickupConfirmation => ClientStatus::Accepted,
            ShipmentState::InTransit => ClientStatus::OutForDelivery,
            ShipmentState::Delivered => ClientStatus::Delivered,
            ShipmentState::Canceled
            | ShipmentState::DeliveryAttemptFailed
            | ShipmentState::ReturnedToWarehouse => ClientStatus::NotDelivered,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

// ordered by instant; `Utc` itself has no ordering to derive from
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// One issued confirmation code. Never deleted; once `consumed` is set the
/// record does not change again.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct CodeRecord {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7, prefix "code_"
    #[n(1)]
    pub shipment_id: String,
    #[n(2)]
    pub code: String, // six ascii digits, leading zeros kept
    #[n(3)]
    pub kind: CodeKind,
    #[n(4)]
    pub issued_by: Option<String>,
    #[n(5)]
    pub issued_at: TimeStamp<Utc>,
    #[n(6)]
    pub consumed: bool,
    #[n(7)]
    pub consumed_by: Option<String>,
    #[n(8)]
    pub consumed_at: Option<TimeStamp<Utc>>,
}

impl CodeRecord {
    pub fn new(
        id: String,
        shipment_id: String,
        code: String,
        kind: CodeKind,
        issued_by: Option<String>,
    ) -> Self {
        Self {
            id,
            shipment_id,
            code,
            kind,
            issued_by,
            issued_at: TimeStamp::new(),
            consumed: false,
            consumed_by: None,
            consumed_at: None,
        }
    }

    /// Copy of this record marked consumed by `actor`.
    pub fn consume(&self, actor: &str) -> Self {
        Self {
            consumed: true,
            consumed_by: Some(actor.to_string()),
            consumed_at: Some(TimeStamp::new()),
            ..self.clone()
        }
    }

    /// Copy of this record retired because a newer code replaced it.
    pub fn superseded(&self) -> Self {
        Self {
            consumed: true,
            consumed_by: None,
            consumed_at: Some(TimeStamp::new()),
            ..self.clone()
        }
    }

    pub fn is_superseded(&self) -> bool {
        self.consumed && self.consumed_by.is_none()
    }

    pub fn pair_key(&self) -> String {
        pair_key(&self.shipment_id, self.kind)
    }
}

// key of the pending-code index, one entry per shipment and kind
pub fn pair_key(shipment_id: &str, kind: CodeKind) -> String {
    format!("{}/{}", shipment_id, kind.as_str())
}

/// The parts of a shipment the confirmation flow reads and writes.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Shipment {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub state: ShipmentState,
    #[n(2)]
    pub assigned_driver_id: Option<String>,
    #[n(3)]
    pub delivered_at: Option<TimeStamp<Utc>>,
    #[n(4)]
    pub note: Option<String>, // reason given for cancellation or a failed attempt
}

impl Shipment {
    pub fn new(id: String) -> Self {
        Self {
            id,
            state: ShipmentState::Pending,
            assigned_driver_id: None,
            delivered_at: None,
            note: None,
        }
    }

    pub fn with_state(&self, state: ShipmentState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}
