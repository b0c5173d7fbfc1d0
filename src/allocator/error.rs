use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::ledger::LedgerError;

#[derive(Debug)]
pub enum BookingError {
    ResourceNotFound(Ulid),
    UnknownUser(Ulid),
    ReservationNotFound(Ulid),
    InvalidSlot { date: NaiveDate, time: NaiveTime },
    /// No absolute instant exists for this civil date in the regional zone.
    DateOutOfRange(NaiveDate),
    PastSlot,
    DailyCapExceeded { date: NaiveDate },
    PriorityReserved,
    SlotTaken,
    Forbidden,
    PastBooking,
    /// Retries exhausted on a connectivity-class failure.
    TransientStoreError(String),
    Store(LedgerError),
}

impl BookingError {
    /// Stable machine code for replies and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::ResourceNotFound(_) => "resource_not_found",
            BookingError::UnknownUser(_) => "unknown_user",
            BookingError::ReservationNotFound(_) => "reservation_not_found",
            BookingError::InvalidSlot { .. } => "invalid_slot",
            BookingError::DateOutOfRange(_) => "bad_request",
            BookingError::PastSlot => "past_slot",
            BookingError::DailyCapExceeded { .. } => "daily_cap_exceeded",
            BookingError::PriorityReserved => "priority_reserved",
            BookingError::SlotTaken => "slot_taken",
            BookingError::Forbidden => "forbidden",
            BookingError::PastBooking => "past_booking",
            BookingError::TransientStoreError(_) => "store_unavailable",
            BookingError::Store(_) => "store_error",
        }
    }
}

/// Generic mapping; call sites translate the store errors that carry
/// booking meaning (`Conflict`, `NotFound`, ...) before falling back to this.
impl From<LedgerError> for BookingError {
    fn from(e: LedgerError) -> Self {
        if e.is_transient() {
            BookingError::TransientStoreError(e.to_string())
        } else {
            BookingError::Store(e)
        }
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::ResourceNotFound(id) => write!(f, "game not found: {id}"),
            BookingError::UnknownUser(id) => write!(f, "unknown user: {id}"),
            BookingError::ReservationNotFound(id) => write!(f, "booking not found: {id}"),
            BookingError::InvalidSlot { date, time } => write!(
                f,
                "{} is not a valid slot for {}",
                time.format("%H:%M"),
                date.format("%A")
            ),
            BookingError::DateOutOfRange(date) => write!(f, "date {date} is out of range"),
            BookingError::PastSlot => write!(f, "cannot book a slot in the past"),
            BookingError::DailyCapExceeded { date } => {
                write!(f, "daily booking limit reached for {date}")
            }
            BookingError::PriorityReserved => {
                write!(f, "this slot is reserved for first-time players")
            }
            BookingError::SlotTaken => {
                write!(f, "already booked for this time, please choose another slot")
            }
            BookingError::Forbidden => write!(f, "not allowed to act on this booking"),
            BookingError::PastBooking => write!(f, "cannot cancel a booking that has started"),
            BookingError::TransientStoreError(e) => {
                write!(f, "store unavailable, please try again: {e}")
            }
            BookingError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for BookingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BookingError::Store(e) => Some(e),
            _ => None,
        }
    }
}
