use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::auth::Actor;
use crate::limits::*;
use crate::model::*;

use super::{LedgerError, LedgerInner, WalCommand};

impl LedgerInner {
    pub(super) async fn create_resource(
        &self,
        name: String,
        capacity: u32,
        duration_minutes: u32,
    ) -> Result<Resource, LedgerError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(LedgerError::LimitExceeded("game name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(LedgerError::LimitExceeded("game name too long"));
        }

        let _catalog = self.membership.write().await;
        if self.resource_names.contains_key(&name) {
            return Err(LedgerError::AlreadyExists(format!("game {name}")));
        }
        if self.resources.len() >= MAX_RESOURCES {
            return Err(LedgerError::LimitExceeded("too many games"));
        }

        let resource = Resource {
            id: Ulid::new(),
            name,
            capacity,
            duration_minutes,
        };
        let event = Event::ResourceCreated {
            id: resource.id,
            name: resource.name.clone(),
            capacity,
            duration_minutes,
        };
        self.wal_append(&event).await?;
        self.insert_resource(resource.clone());
        Ok(resource)
    }

    pub(super) async fn register_user(&self, raw: &str, role: Role) -> Result<User, LedgerError> {
        let handle = normalize_handle(raw);
        if handle.is_empty() {
            return Err(LedgerError::LimitExceeded("handle must not be empty"));
        }
        if handle.len() > MAX_HANDLE_LEN {
            return Err(LedgerError::LimitExceeded("handle too long"));
        }
        if handle.chars().any(char::is_control) {
            return Err(LedgerError::LimitExceeded("handle contains control characters"));
        }
        if let Some(existing) = self.user_by_handle(&handle) {
            return Ok(existing);
        }

        let _members = self.membership.write().await;
        // Somebody may have registered the same handle while we waited.
        if let Some(existing) = self.user_by_handle(&handle) {
            return Ok(existing);
        }
        if self.users.len() >= MAX_USERS {
            return Err(LedgerError::LimitExceeded("too many users"));
        }

        let user = User {
            id: Ulid::new(),
            handle,
            role,
        };
        let event = Event::UserRegistered {
            id: user.id,
            handle: user.handle.clone(),
            role,
        };
        self.wal_append(&event).await?;
        self.insert_user(user.clone());
        Ok(user)
    }

    pub(super) async fn delete_user(&self, user_id: Ulid) -> Result<usize, LedgerError> {
        let _members = self.membership.write().await;
        if !self.users.contains_key(&user_id) {
            return Err(LedgerError::NotFound(user_id));
        }
        // No create can add rows for this user while we hold membership,
        // so the set of games to lock is stable.
        let resource_ids = self.user_resource_ids(user_id);
        let mut locked = self.lock_resources(&resource_ids).await;

        let event = Event::UserDeleted { id: user_id };
        self.wal_append(&event).await?;
        let removed = self.purge_user(user_id, &mut locked);
        info!(user = %user_id, removed, "user deleted");
        Ok(removed)
    }

    pub(super) async fn create(
        &self,
        id: Ulid,
        resource_id: Ulid,
        user_id: Ulid,
        start: Ms,
    ) -> Result<Reservation, LedgerError> {
        let _members = self.membership.read().await;
        if !self.users.contains_key(&user_id) {
            return Err(LedgerError::NotFound(user_id));
        }
        if let Some(done) = self.landed_create(id, resource_id, user_id, start) {
            return done;
        }
        if self
            .by_user
            .get(&user_id)
            .is_some_and(|ids| ids.len() >= MAX_RESERVATIONS_PER_USER)
        {
            return Err(LedgerError::LimitExceeded("too many reservations for user"));
        }

        let rs = self
            .resource_state(&resource_id)
            .ok_or(LedgerError::NotFound(resource_id))?;
        let mut guard = rs.write().await;
        if let Some(holder) = guard.holder(start) {
            // Our own earlier attempt may have committed while we waited.
            if holder == id
                && let Some(done) = self.landed_create(id, resource_id, user_id, start)
            {
                return done;
            }
            return Err(LedgerError::Conflict(holder));
        }

        let event = Event::ReservationConfirmed {
            id,
            resource_id,
            user_id,
            start,
            created_at: self.clock.now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        self.reservation(&id).ok_or(LedgerError::NotFound(id))
    }

    /// A create re-issued with an id that already exists gets the existing
    /// row back if it describes the same booking.
    fn landed_create(
        &self,
        id: Ulid,
        resource_id: Ulid,
        user_id: Ulid,
        start: Ms,
    ) -> Option<Result<Reservation, LedgerError>> {
        let row = self.reservation(&id)?;
        if row.resource_id == resource_id && row.user_id == user_id && row.start == start {
            Some(Ok(row))
        } else {
            Some(Err(LedgerError::AlreadyExists(format!("reservation {id}"))))
        }
    }

    pub(super) async fn cancel(&self, id: Ulid, actor: Actor) -> Result<Reservation, LedgerError> {
        let resource_id = self
            .reservations
            .get(&id)
            .map(|r| r.resource_id)
            .ok_or(LedgerError::NotFound(id))?;
        let rs = self
            .resource_state(&resource_id)
            .ok_or(LedgerError::NotFound(resource_id))?;
        let mut guard = rs.write().await;

        // Re-read under the lock; the row may have been purged meanwhile.
        let current = self.reservation(&id).ok_or(LedgerError::NotFound(id))?;
        if !actor.can_act_for(current.user_id) {
            return Err(LedgerError::Forbidden(id));
        }
        if !current.is_live() {
            return Ok(current);
        }
        let now = self.clock.now_ms();
        if current.start < now {
            return Err(LedgerError::PastBooking(id));
        }

        let event = Event::ReservationCancelled {
            id,
            resource_id,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        self.reservation(&id).ok_or(LedgerError::NotFound(id))
    }

    /// Snapshot current state into a fresh WAL. Cancelled rows are kept as
    /// confirm+cancel pairs ahead of the live rows so replay never sees a
    /// cancelled row and a live row on the same slot at once.
    pub(super) async fn compact_wal(&self) -> Result<(), LedgerError> {
        let _members = self.membership.write().await;
        let mut ids: Vec<Ulid> = self.resources.iter().map(|e| *e.key()).collect();
        ids.sort();
        let locked = self.lock_resources(&ids).await;

        let mut events = Vec::new();
        for id in &ids {
            if let Some(guard) = locked.get(id) {
                let r = &guard.resource;
                events.push(Event::ResourceCreated {
                    id: r.id,
                    name: r.name.clone(),
                    capacity: r.capacity,
                    duration_minutes: r.duration_minutes,
                });
            }
        }

        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        for u in users {
            events.push(Event::UserRegistered {
                id: u.id,
                handle: u.handle,
                role: u.role,
            });
        }

        let mut rows: Vec<Reservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        rows.sort_by_key(|r| (r.is_live(), r.created_at, r.id));
        for r in rows {
            events.push(Event::ReservationConfirmed {
                id: r.id,
                resource_id: r.resource_id,
                user_id: r.user_id,
                start: r.start,
                created_at: r.created_at,
            });
            if let Some(at) = r.cancelled_at {
                events.push(Event::ReservationCancelled {
                    id: r.id,
                    resource_id: r.resource_id,
                    at,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| LedgerError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::WalError(e.to_string()))?;
        info!("wal compacted to {count} events");
        Ok(())
    }
}
