//! The booking ledger: authoritative store of games, users and reservations.
//!
//! `WalLedger` keeps state in memory and makes every change durable through
//! a group-committed write-ahead log before applying it. Live uniqueness per
//! (game, start instant) is checked and written under that game's write
//! lock, so it holds no matter how many callers race on the same slot.

mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use error::LedgerError;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::auth::Actor;
use crate::clock::{Clock, RegionalZone};
use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Store contract the allocator runs against.
#[async_trait]
pub trait Ledger: Send + Sync {
    // ── Catalog ──────────────────────────────────────────────

    async fn create_resource(
        &self,
        name: &str,
        capacity: u32,
        duration_minutes: u32,
    ) -> Result<Resource, LedgerError>;

    async fn get_resource(&self, id: Ulid) -> Result<Option<Resource>, LedgerError>;

    /// Ordered by name.
    async fn list_resources(&self) -> Result<Vec<Resource>, LedgerError>;

    // ── Users ────────────────────────────────────────────────

    /// Get-or-create by normalised handle. An existing user keeps their role.
    async fn register_user(&self, handle: &str, role: Role) -> Result<User, LedgerError>;

    async fn get_user(&self, id: Ulid) -> Result<Option<User>, LedgerError>;

    async fn find_user(&self, handle: &str) -> Result<Option<User>, LedgerError>;

    /// Ordered by handle.
    async fn list_users(&self) -> Result<Vec<User>, LedgerError>;

    /// Delete a user and hard-delete every reservation they own.
    /// Returns the number of reservation rows removed.
    async fn delete_user(&self, id: Ulid) -> Result<usize, LedgerError>;

    // ── Reservations ─────────────────────────────────────────

    async fn count_confirmed_for_user_on_day(
        &self,
        user_id: Ulid,
        date: NaiveDate,
    ) -> Result<usize, LedgerError>;

    async fn find_live_conflict(
        &self,
        resource_id: Ulid,
        start: Ms,
    ) -> Result<Option<Reservation>, LedgerError>;

    async fn user_has_any_reservation(&self, user_id: Ulid) -> Result<bool, LedgerError>;

    /// Insert a Confirmed reservation. `Conflict` if the slot is live-held.
    async fn create(
        &self,
        id: Ulid,
        resource_id: Ulid,
        user_id: Ulid,
        start: Ms,
    ) -> Result<Reservation, LedgerError>;

    /// Confirmed → Cancelled. Cancelling a Cancelled row is a no-op.
    async fn cancel(&self, reservation_id: Ulid, actor: Actor) -> Result<Reservation, LedgerError>;

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, LedgerError>;

    /// Newest start first.
    async fn reservations_for_user(&self, user_id: Ulid) -> Result<Vec<Reservation>, LedgerError>;

    /// Live reservations on a game starting at or after `from`, in start order.
    async fn live_reservations_for_resource(
        &self,
        resource_id: Ulid,
        from: Ms,
    ) -> Result<Vec<Reservation>, LedgerError>;

    /// Every reservation (any status) on the civil day, in start order.
    async fn reservations_on_day(&self, date: NaiveDate) -> Result<Vec<Reservation>, LedgerError>;

    /// Newest start first.
    async fn all_reservations(&self) -> Result<Vec<Reservation>, LedgerError>;
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL. Every append already queued when the
/// first one arrives joins the same batch and shares a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut pending: Option<WalCommand> = None;
    loop {
        let cmd = match pending.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Append { event, response } => {
                let mut events = vec![event];
                let mut waiters = vec![response];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => {
                            events.push(event);
                            waiters.push(response);
                        }
                        other => {
                            pending = Some(other);
                            break;
                        }
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(events.len() as f64);
                let flush_start = Instant::now();
                let result = wal.append_batch(&events);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());

                for tx in waiters {
                    let r = match &result {
                        Ok(()) => Ok(()),
                        Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
                    };
                    let _ = tx.send(r);
                }
            }
            WalCommand::Compact { events, response } => {
                let _ = response.send(wal.compact(&events));
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
        }
    }
}

struct LedgerInner {
    resources: DashMap<Ulid, SharedResourceState>,
    resource_names: DashMap<String, Ulid>,
    reservations: DashMap<Ulid, Reservation>,
    /// user → ids of every reservation row they own, any status.
    by_user: DashMap<Ulid, Vec<Ulid>>,
    users: DashMap<Ulid, User>,
    handles: DashMap<String, Ulid>,
    /// Shared by reservation creates; exclusive for catalog and membership
    /// changes and for compaction snapshots.
    membership: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    clock: Arc<dyn Clock>,
    zone: RegionalZone,
}

/// WAL-backed [`Ledger`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WalLedger {
    inner: Arc<LedgerInner>,
}

impl WalLedger {
    /// Replay the log at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: &Path, clock: Arc<dyn Clock>, zone: RegionalZone) -> io::Result<Self> {
        let (wal, events) = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let inner = LedgerInner {
            resources: DashMap::new(),
            resource_names: DashMap::new(),
            reservations: DashMap::new(),
            by_user: DashMap::new(),
            users: DashMap::new(),
            handles: DashMap::new(),
            membership: RwLock::new(()),
            wal_tx,
            clock,
            zone,
        };

        // We're the sole owner of every lock during replay. Never block
        // here: this may run inside a runtime.
        for event in &events {
            inner.replay(event)?;
        }
        info!(
            "ledger {}: {} events, {} games, {} users, {} reservations",
            wal_path.display(),
            events.len(),
            inner.resources.len(),
            inner.users.len(),
            inner.reservations.len()
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn zone(&self) -> RegionalZone {
        self.inner.zone
    }

    /// Rewrite the WAL from current state, keeping cancelled history.
    pub async fn compact_wal(&self) -> Result<(), LedgerError> {
        let inner = self.inner.clone();
        detached(async move { inner.compact_wal().await }).await
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Run a write on its own task. A caller that gives up (timeout, dropped
/// future) can never leave the write logged but unapplied.
async fn detached<T, F>(fut: F) -> Result<T, LedgerError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, LedgerError>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| LedgerError::Internal(format!("ledger task failed: {e}")))?
}

impl LedgerInner {
    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), LedgerError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| LedgerError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::WalError(e.to_string()))
    }

    /// WAL-append then apply, with the game's write lock held by the caller.
    async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), LedgerError> {
        self.wal_append(event).await?;
        self.apply_to_resource(rs, event);
        Ok(())
    }

    /// Apply a reservation event (caller holds the game's write lock).
    fn apply_to_resource(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::ReservationConfirmed {
                id,
                resource_id,
                user_id,
                start,
                created_at,
            } => {
                rs.live.insert(*start, *id);
                self.reservations.insert(
                    *id,
                    Reservation {
                        id: *id,
                        resource_id: *resource_id,
                        user_id: *user_id,
                        start: *start,
                        created_at: *created_at,
                        status: ReservationStatus::Confirmed,
                        cancelled_at: None,
                    },
                );
                self.by_user.entry(*user_id).or_default().push(*id);
            }
            Event::ReservationCancelled { id, at, .. } => {
                if let Some(mut row) = self.reservations.get_mut(id)
                    && row.is_live()
                {
                    rs.release(row.start, row.id);
                    row.status = ReservationStatus::Cancelled;
                    row.cancelled_at = Some(*at);
                }
            }
            // Catalog and membership events don't touch a single game.
            Event::ResourceCreated { .. }
            | Event::UserRegistered { .. }
            | Event::UserDeleted { .. } => {}
        }
    }

    fn insert_resource(&self, resource: Resource) {
        self.resource_names.insert(resource.name.clone(), resource.id);
        self.resources
            .insert(resource.id, Arc::new(RwLock::new(ResourceState::new(resource))));
    }

    fn insert_user(&self, user: User) {
        self.handles.insert(user.handle.clone(), user.id);
        self.users.insert(user.id, user);
    }

    /// Games the user holds any row on, sorted (the lock order).
    fn user_resource_ids(&self, user_id: Ulid) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .user_rows(user_id)
            .into_iter()
            .map(|r| r.resource_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Write-lock games in the given (sorted) order.
    async fn lock_resources(
        &self,
        ids: &[Ulid],
    ) -> HashMap<Ulid, OwnedRwLockWriteGuard<ResourceState>> {
        let mut locked = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(rs) = self.resource_state(id) {
                locked.insert(*id, rs.write_owned().await);
            }
        }
        locked
    }

    /// Remove the user and all their rows. Caller holds the affected games' locks.
    fn purge_user(
        &self,
        user_id: Ulid,
        locked: &mut HashMap<Ulid, OwnedRwLockWriteGuard<ResourceState>>,
    ) -> usize {
        let ids = self
            .by_user
            .remove(&user_id)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        let mut removed = 0;
        for id in ids {
            if let Some((_, row)) = self.reservations.remove(&id) {
                if row.is_live()
                    && let Some(guard) = locked.get_mut(&row.resource_id)
                {
                    guard.release(row.start, row.id);
                }
                removed += 1;
            }
        }
        if let Some((_, user)) = self.users.remove(&user_id) {
            self.handles.remove(&user.handle);
        }
        removed
    }

    fn replay(&self, event: &Event) -> io::Result<()> {
        match event {
            Event::ResourceCreated {
                id,
                name,
                capacity,
                duration_minutes,
            } => self.insert_resource(Resource {
                id: *id,
                name: name.clone(),
                capacity: *capacity,
                duration_minutes: *duration_minutes,
            }),
            Event::UserRegistered { id, handle, role } => self.insert_user(User {
                id: *id,
                handle: handle.clone(),
                role: *role,
            }),
            Event::UserDeleted { id } => {
                let mut locked = HashMap::new();
                for rid in self.user_resource_ids(*id) {
                    if let Some(rs) = self.resource_state(&rid) {
                        let guard = rs.try_write_owned().map_err(|_| replay_contended(rid))?;
                        locked.insert(rid, guard);
                    }
                }
                self.purge_user(*id, &mut locked);
            }
            Event::ReservationConfirmed { resource_id, .. }
            | Event::ReservationCancelled { resource_id, .. } => {
                if let Some(rs) = self.resource_state(resource_id) {
                    let mut guard = rs.try_write().map_err(|_| replay_contended(*resource_id))?;
                    self.apply_to_resource(&mut guard, event);
                }
            }
        }
        Ok(())
    }
}

fn replay_contended(resource_id: Ulid) -> io::Error {
    io::Error::new(
        io::ErrorKind::WouldBlock,
        format!("replay: game {resource_id} locked during open"),
    )
}

#[async_trait]
impl Ledger for WalLedger {
    async fn create_resource(
        &self,
        name: &str,
        capacity: u32,
        duration_minutes: u32,
    ) -> Result<Resource, LedgerError> {
        let inner = self.inner.clone();
        let name = name.to_string();
        detached(async move { inner.create_resource(name, capacity, duration_minutes).await }).await
    }

    async fn get_resource(&self, id: Ulid) -> Result<Option<Resource>, LedgerError> {
        Ok(self.inner.get_resource(id).await)
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, LedgerError> {
        Ok(self.inner.list_resources().await)
    }

    async fn register_user(&self, handle: &str, role: Role) -> Result<User, LedgerError> {
        let inner = self.inner.clone();
        let handle = handle.to_string();
        detached(async move { inner.register_user(&handle, role).await }).await
    }

    async fn get_user(&self, id: Ulid) -> Result<Option<User>, LedgerError> {
        Ok(self.inner.users.get(&id).map(|u| u.value().clone()))
    }

    async fn find_user(&self, handle: &str) -> Result<Option<User>, LedgerError> {
        Ok(self.inner.user_by_handle(&normalize_handle(handle)))
    }

    async fn list_users(&self) -> Result<Vec<User>, LedgerError> {
        Ok(self.inner.list_users())
    }

    async fn delete_user(&self, id: Ulid) -> Result<usize, LedgerError> {
        let inner = self.inner.clone();
        detached(async move { inner.delete_user(id).await }).await
    }

    async fn count_confirmed_for_user_on_day(
        &self,
        user_id: Ulid,
        date: NaiveDate,
    ) -> Result<usize, LedgerError> {
        Ok(self.inner.count_confirmed_for_user_on_day(user_id, date))
    }

    async fn find_live_conflict(
        &self,
        resource_id: Ulid,
        start: Ms,
    ) -> Result<Option<Reservation>, LedgerError> {
        Ok(self.inner.find_live_conflict(resource_id, start).await)
    }

    async fn user_has_any_reservation(&self, user_id: Ulid) -> Result<bool, LedgerError> {
        Ok(self
            .inner
            .by_user
            .get(&user_id)
            .is_some_and(|ids| !ids.is_empty()))
    }

    async fn create(
        &self,
        id: Ulid,
        resource_id: Ulid,
        user_id: Ulid,
        start: Ms,
    ) -> Result<Reservation, LedgerError> {
        let inner = self.inner.clone();
        detached(async move { inner.create(id, resource_id, user_id, start).await }).await
    }

    async fn cancel(&self, reservation_id: Ulid, actor: Actor) -> Result<Reservation, LedgerError> {
        let inner = self.inner.clone();
        detached(async move { inner.cancel(reservation_id, actor).await }).await
    }

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, LedgerError> {
        Ok(self.inner.reservation(&id))
    }

    async fn reservations_for_user(&self, user_id: Ulid) -> Result<Vec<Reservation>, LedgerError> {
        let mut rows = self.inner.user_rows(user_id);
        rows.sort_by(|a, b| b.start.cmp(&a.start));
        Ok(rows)
    }

    async fn live_reservations_for_resource(
        &self,
        resource_id: Ulid,
        from: Ms,
    ) -> Result<Vec<Reservation>, LedgerError> {
        Ok(self.inner.live_reservations_for_resource(resource_id, from).await)
    }

    async fn reservations_on_day(&self, date: NaiveDate) -> Result<Vec<Reservation>, LedgerError> {
        Ok(self.inner.reservations_on_day(date))
    }

    async fn all_reservations(&self) -> Result<Vec<Reservation>, LedgerError> {
        let mut rows: Vec<Reservation> = self
            .inner
            .reservations
            .iter()
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by(|a, b| b.start.cmp(&a.start));
        Ok(rows)
    }
}
