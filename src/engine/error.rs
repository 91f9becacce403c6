use crate::model::*;

use super::optimizer::Alternatives;
use super::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    InvalidRequest(String),
    VenueNotFound(String),
    ServiceNotFound(ServiceId),
    LockNotFound(LockToken),
    LockExpired(LockToken),
    /// Another caller holds the slot until `expires_at`.
    SlotLocked { expires_at: Ms },
    /// Nothing fits at the requested time; carries nearby options.
    NoTableAvailable(Box<Alternatives>),
    BookingNotFound(BookingId),
    LimitExceeded(&'static str),
    Store(String),
}

impl EngineError {
    /// Stable machine-readable code for API payloads and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidRequest(_) | EngineError::LimitExceeded(_) => "invalid_request",
            EngineError::VenueNotFound(_) => "venue_not_found",
            EngineError::ServiceNotFound(_) => "service_not_found",
            EngineError::LockNotFound(_) => "lock_not_found",
            EngineError::LockExpired(_) => "lock_expired",
            EngineError::SlotLocked { .. } => "slot_locked",
            EngineError::NoTableAvailable(_) => "no_table_available",
            EngineError::BookingNotFound(_) => "booking_not_found",
            EngineError::Store(_) => "internal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::VenueNotFound(slug) => write!(f, "venue not found: {slug}"),
            EngineError::ServiceNotFound(id) => write!(f, "service not found: {id}"),
            EngineError::LockNotFound(token) => write!(f, "lock not found: {token}"),
            EngineError::LockExpired(token) => write!(f, "lock expired: {token}"),
            EngineError::SlotLocked { expires_at } => {
                write!(f, "slot is held until {expires_at}")
            }
            EngineError::NoTableAvailable(alts) => write!(
                f,
                "no table available ({} alternatives)",
                alts.earlier.len() + alts.later.len()
            ),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SlotHeld { expires_at } => EngineError::SlotLocked { expires_at },
            other => EngineError::Store(other.to_string()),
        }
    }
}
