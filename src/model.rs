use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only stored time type.
pub type Ms = i64;

/// Half-open interval `[start, end)` of absolute instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// A bookable game. Reference data: the allocation path only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    /// Max players.
    pub capacity: u32,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    /// Normalised identity string (lower-cased email).
    pub handle: String,
    pub role: Role,
}

/// Trim and lower-case an identity string the way handles are stored.
pub fn normalize_handle(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: Ulid,
    /// Absolute start instant of the slot.
    pub start: Ms,
    pub created_at: Ms,
    pub status: ReservationStatus,
    pub cancelled_at: Option<Ms>,
}

impl Reservation {
    /// Live reservations are the ones that hold their slot.
    pub fn is_live(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }
}

/// Per-game state guarded by one lock. `live` is the uniqueness index:
/// at most one Confirmed reservation per start instant.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    /// start instant → id of the Confirmed reservation holding it.
    pub live: BTreeMap<Ms, Ulid>,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            live: BTreeMap::new(),
        }
    }

    pub fn holder(&self, start: Ms) -> Option<Ulid> {
        self.live.get(&start).copied()
    }

    /// Live reservation ids starting at or after `from`, in start order.
    pub fn live_from(&self, from: Ms) -> impl Iterator<Item = (Ms, Ulid)> + '_ {
        self.live.range(from..).map(|(start, id)| (*start, *id))
    }

    /// Drop `id` from the live index if it still holds `start`.
    pub fn release(&mut self, start: Ms, id: Ulid) -> bool {
        if self.live.get(&start) == Some(&id) {
            self.live.remove(&start);
            true
        } else {
            false
        }
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: String,
        capacity: u32,
        duration_minutes: u32,
    },
    UserRegistered {
        id: Ulid,
        handle: String,
        role: Role,
    },
    /// Cascade: removes the user and every reservation row they own.
    UserDeleted {
        id: Ulid,
    },
    ReservationConfirmed {
        id: Ulid,
        resource_id: Ulid,
        user_id: Ulid,
        start: Ms,
        created_at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
    },
}
