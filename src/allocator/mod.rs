//! The allocation engine: admission rules in front of the ledger.
//!
//! `request_booking` is the only path that creates reservations. It runs
//! the checks in a fixed order and hands the final uniqueness decision to
//! the ledger, whose per-slot constraint is the one serialization point.

mod error;

pub use error::BookingError;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, Days, NaiveDate, NaiveTime, Weekday};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::auth::Actor;
use crate::clock::{Clock, RegionalZone};
use crate::ledger::{Ledger, LedgerError};
use crate::limits::WEEK_BOARD_DAYS;
use crate::model::*;
use crate::notify::{Confirmation, NotificationSink};
use crate::observability::{
    BOOKINGS_TOTAL, BOOKING_DURATION_SECONDS, CANCELLATIONS_TOTAL, NOTIFICATIONS_FAILED_TOTAL,
};
use crate::policy::{DAILY_BOOKING_CAP, SlotPolicy};
use crate::retry::{self, Idempotency, LandedCheck, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRequest {
    pub resource_id: Ulid,
    pub user_id: Ulid,
    /// Civil date in the regional zone.
    pub date: NaiveDate,
    /// Civil time of day in the regional zone.
    pub time: NaiveTime,
}

/// One permitted slot of a game on a civil date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotView {
    #[serde(serialize_with = "crate::policy::ser_hhmm")]
    pub time: NaiveTime,
    pub start: Ms,
    pub priority: bool,
    pub taken: bool,
    pub past: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayBoard {
    pub date: NaiveDate,
    pub weekday: Weekday,
    pub slots: Vec<SlotView>,
}

/// A reservation joined with the names people read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingLine {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub game: String,
    pub user: String,
    pub date: NaiveDate,
    #[serde(serialize_with = "crate::policy::ser_hhmm")]
    pub time: NaiveTime,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total_games: usize,
    pub my_bookings: usize,
    pub today_confirmed: usize,
}

pub struct Allocator {
    ledger: Arc<dyn Ledger>,
    policy: SlotPolicy,
    clock: Arc<dyn Clock>,
    zone: RegionalZone,
    sink: Arc<dyn NotificationSink>,
    retry: RetryPolicy,
    notify_timeout: Duration,
}

impl Allocator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        policy: SlotPolicy,
        clock: Arc<dyn Clock>,
        zone: RegionalZone,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            ledger,
            policy,
            clock,
            zone,
            sink,
            retry: RetryPolicy::default(),
            notify_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn zone(&self) -> RegionalZone {
        self.zone
    }

    pub fn today(&self) -> NaiveDate {
        self.zone.today(self.clock.now_ms())
    }

    /// Blind-retried store read.
    async fn read<'a, T: Send>(
        &self,
        what: &'static str,
        op: impl FnMut() -> BoxFuture<'a, Result<T, LedgerError>> + Send,
    ) -> Result<T, BookingError> {
        retry::run(&self.retry, what, Idempotency::Blind, op)
            .await
            .map_err(BookingError::from)
    }

    // ── Booking ──────────────────────────────────────────────

    pub async fn request_booking(&self, req: BookingRequest) -> Result<Reservation, BookingError> {
        let started = Instant::now();
        let result = self.admit_and_create(req).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(BOOKING_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    async fn admit_and_create(&self, req: BookingRequest) -> Result<Reservation, BookingError> {
        let BookingRequest {
            resource_id,
            user_id,
            date,
            time,
        } = req;
        let ledger = &*self.ledger;

        let resource = self
            .read("get_resource", || ledger.get_resource(resource_id))
            .await?
            .ok_or(BookingError::ResourceNotFound(resource_id))?;
        let user = self
            .read("get_user", || ledger.get_user(user_id))
            .await?
            .ok_or(BookingError::UnknownUser(user_id))?;

        let now = self.clock.now_ms();
        if date < self.zone.today(now) {
            debug!(user = %user.handle, %date, "rejected: date in the past");
            return Err(BookingError::PastSlot);
        }
        let slot = self
            .policy
            .lookup(date.weekday(), time)
            .ok_or(BookingError::InvalidSlot { date, time })?;
        let start = self
            .zone
            .to_instant(date, time)
            .ok_or(BookingError::DateOutOfRange(date))?;
        if start <= now {
            debug!(user = %user.handle, %date, %time, "rejected: slot already started");
            return Err(BookingError::PastSlot);
        }

        let holder = self
            .read("find_live_conflict", || ledger.find_live_conflict(resource_id, start))
            .await?;
        if holder.is_some_and(|r| r.user_id == user_id) {
            debug!(user = %user.handle, "rejected: already holds this slot");
            return Err(BookingError::SlotTaken);
        }

        let booked = self
            .read("count_confirmed_for_user_on_day", || {
                ledger.count_confirmed_for_user_on_day(user_id, date)
            })
            .await?;
        if booked >= DAILY_BOOKING_CAP {
            debug!(user = %user.handle, %date, booked, "rejected: daily cap");
            return Err(BookingError::DailyCapExceeded { date });
        }

        if slot.priority
            && self
                .read("user_has_any_reservation", || {
                    ledger.user_has_any_reservation(user_id)
                })
                .await?
        {
            debug!(user = %user.handle, "rejected: priority slot");
            return Err(BookingError::PriorityReserved);
        }

        let id = Ulid::new();
        let landed: LandedCheck<'_, Reservation> = Box::new(move || {
            async move {
                let landed = ledger.find_live_conflict(resource_id, start).await?;
                Ok::<_, LedgerError>(landed.filter(|r| r.id == id))
            }
            .boxed()
        });
        let created = retry::run(&self.retry, "create", Idempotency::CheckFirst(landed), || {
            ledger.create(id, resource_id, user_id, start)
        })
        .await;
        let reservation = match created {
            Ok(r) => r,
            // An earlier attempt of this same request holds the slot.
            Err(LedgerError::Conflict(holder)) if holder == id => self
                .read("get_reservation", || ledger.get_reservation(id))
                .await?
                .ok_or(BookingError::SlotTaken)?,
            Err(LedgerError::Conflict(_)) => return Err(BookingError::SlotTaken),
            Err(LedgerError::NotFound(missing)) if missing == user_id => {
                return Err(BookingError::UnknownUser(user_id));
            }
            Err(LedgerError::NotFound(_)) => {
                return Err(BookingError::ResourceNotFound(resource_id));
            }
            Err(other) => return Err(BookingError::from(other)),
        };

        info!(
            booking = %reservation.id,
            game = %resource.name,
            user = %user.handle,
            %date,
            time = %time.format("%H:%M"),
            "booking confirmed"
        );
        self.dispatch(Confirmation {
            reservation_id: reservation.id,
            resource_id,
            resource_name: resource.name,
            user_handle: user.handle,
            start,
        });
        Ok(reservation)
    }

    /// Fire-and-forget: the booking is already committed.
    fn dispatch(&self, confirmation: Confirmation) {
        let sink = self.sink.clone();
        let limit = self.notify_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(limit, sink.notify(&confirmation)).await {
                Ok(Ok(())) => debug!(booking = %confirmation.reservation_id, "confirmation sent"),
                Ok(Err(e)) => {
                    warn!(booking = %confirmation.reservation_id, "confirmation failed: {e}");
                    metrics::counter!(NOTIFICATIONS_FAILED_TOTAL).increment(1);
                }
                Err(_) => {
                    warn!(booking = %confirmation.reservation_id, ?limit, "confirmation timed out");
                    metrics::counter!(NOTIFICATIONS_FAILED_TOTAL).increment(1);
                }
            }
        });
    }

    // ── Cancellation and removal ─────────────────────────────

    pub async fn cancel_booking(
        &self,
        reservation_id: Ulid,
        actor: Actor,
    ) -> Result<Reservation, BookingError> {
        let ledger = &*self.ledger;
        let result = retry::run(&self.retry, "cancel", Idempotency::Blind, || {
            ledger.cancel(reservation_id, actor)
        })
        .await
        .map_err(|e| match e {
            LedgerError::NotFound(_) => BookingError::ReservationNotFound(reservation_id),
            LedgerError::Forbidden(_) => BookingError::Forbidden,
            LedgerError::PastBooking(_) => BookingError::PastBooking,
            other => BookingError::from(other),
        });

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => outcome).increment(1);
        if let Ok(r) = &result {
            info!(booking = %r.id, by = %actor.user_id, "booking cancelled");
        }
        result
    }

    /// Admin-only. Removes the user and every booking they own.
    ///
    /// If an attempt lands but its reply is lost, the retry sees the user
    /// gone and reports the row count read before the delete.
    pub async fn delete_user(&self, actor: Actor, target: Ulid) -> Result<usize, BookingError> {
        if !actor.is_admin() {
            return Err(BookingError::Forbidden);
        }
        let ledger = &*self.ledger;
        if self.read("get_user", || ledger.get_user(target)).await?.is_none() {
            return Err(BookingError::UnknownUser(target));
        }
        let owned = self
            .read("reservations_for_user", || ledger.reservations_for_user(target))
            .await?
            .len();
        let landed: LandedCheck<'_, usize> = Box::new(move || {
            async move {
                let gone = ledger.get_user(target).await?.is_none();
                Ok::<_, LedgerError>(gone.then_some(owned))
            }
            .boxed()
        });
        let removed = retry::run(
            &self.retry,
            "delete_user",
            Idempotency::CheckFirst(landed),
            || ledger.delete_user(target),
        )
        .await
        .map_err(|e| match e {
            LedgerError::NotFound(_) => BookingError::UnknownUser(target),
            other => BookingError::from(other),
        })?;
        info!(user = %target, removed, by = %actor.user_id, "user removed");
        Ok(removed)
    }

    // ── Users ────────────────────────────────────────────────

    /// Get-or-create the user behind a verified handle. Re-issuing is safe:
    /// a second registration of the same handle returns the first row.
    pub async fn identify(&self, handle: &str, role: Role) -> Result<User, BookingError> {
        let ledger = &*self.ledger;
        self.read("register_user", || ledger.register_user(handle, role))
            .await
    }

    pub async fn find_user(&self, handle: &str) -> Result<Option<User>, BookingError> {
        let ledger = &*self.ledger;
        self.read("find_user", || ledger.find_user(handle)).await
    }

    // ── Boards ───────────────────────────────────────────────

    pub async fn day_board(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<DayBoard, BookingError> {
        self.require_resource(resource_id).await?;
        self.board(resource_id, date, self.clock.now_ms()).await
    }

    /// Boards for the next seven civil days, today first.
    pub async fn week(&self, resource_id: Ulid) -> Result<Vec<DayBoard>, BookingError> {
        self.require_resource(resource_id).await?;
        let now = self.clock.now_ms();
        let today = self.zone.today(now);
        let mut boards = Vec::with_capacity(WEEK_BOARD_DAYS as usize);
        for offset in 0..WEEK_BOARD_DAYS {
            let Some(date) = today.checked_add_days(Days::new(offset.into())) else {
                break;
            };
            boards.push(self.board(resource_id, date, now).await?);
        }
        Ok(boards)
    }

    async fn require_resource(&self, resource_id: Ulid) -> Result<Resource, BookingError> {
        let ledger = &*self.ledger;
        self.read("get_resource", || ledger.get_resource(resource_id))
            .await?
            .ok_or(BookingError::ResourceNotFound(resource_id))
    }

    async fn board(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        now: Ms,
    ) -> Result<DayBoard, BookingError> {
        let window = self
            .zone
            .day_window(date)
            .ok_or(BookingError::DateOutOfRange(date))?;
        let ledger = &*self.ledger;
        let taken: HashSet<Ms> = self
            .read("live_reservations_for_resource", || {
                ledger.live_reservations_for_resource(resource_id, window.start)
            })
            .await?
            .into_iter()
            .map(|r| r.start)
            .take_while(|start| *start < window.end)
            .collect();

        let weekday = date.weekday();
        let slots = self
            .policy
            .slots(weekday)
            .iter()
            .map(|slot| {
                let start = self.zone.to_instant(date, slot.time)?;
                Some(SlotView {
                    time: slot.time,
                    start,
                    priority: slot.priority,
                    taken: taken.contains(&start),
                    past: start <= now,
                })
            })
            .collect::<Option<Vec<_>>>()
            .ok_or(BookingError::DateOutOfRange(date))?;
        Ok(DayBoard {
            date,
            weekday,
            slots,
        })
    }

    // ── Dashboards ───────────────────────────────────────────

    pub async fn games(&self) -> Result<Vec<Resource>, BookingError> {
        let ledger = &*self.ledger;
        self.read("list_resources", || ledger.list_resources()).await
    }

    /// The user's bookings, newest first.
    pub async fn user_bookings(&self, user: &User) -> Result<Vec<BookingLine>, BookingError> {
        let ledger = &*self.ledger;
        let rows = self
            .read("reservations_for_user", || ledger.reservations_for_user(user.id))
            .await?;
        let games = self.game_names().await?;
        Ok(rows
            .iter()
            .map(|r| self.line(r, &games, &user.handle))
            .collect())
    }

    /// Every booking, newest first. Admin only.
    pub async fn all_bookings(&self, actor: Actor) -> Result<Vec<BookingLine>, BookingError> {
        if !actor.is_admin() {
            return Err(BookingError::Forbidden);
        }
        let ledger = &*self.ledger;
        let rows = self
            .read("all_reservations", || ledger.all_reservations())
            .await?;
        let games = self.game_names().await?;
        let handles: HashMap<Ulid, String> = self
            .read("list_users", || ledger.list_users())
            .await?
            .into_iter()
            .map(|u| (u.id, u.handle))
            .collect();
        Ok(rows
            .iter()
            .map(|r| {
                let handle = handles.get(&r.user_id).map_or("", String::as_str);
                self.line(r, &games, handle)
            })
            .collect())
    }

    /// Admin only.
    pub async fn list_users(&self, actor: Actor) -> Result<Vec<User>, BookingError> {
        if !actor.is_admin() {
            return Err(BookingError::Forbidden);
        }
        let ledger = &*self.ledger;
        self.read("list_users", || ledger.list_users()).await
    }

    pub async fn stats(&self, user_id: Ulid) -> Result<Stats, BookingError> {
        let ledger = &*self.ledger;
        let total_games = self
            .read("list_resources", || ledger.list_resources())
            .await?
            .len();
        let my_bookings = self
            .read("reservations_for_user", || ledger.reservations_for_user(user_id))
            .await?
            .len();
        let today = self.today();
        let today_confirmed = self
            .read("reservations_on_day", || ledger.reservations_on_day(today))
            .await?
            .iter()
            .filter(|r| r.is_live())
            .count();
        Ok(Stats {
            total_games,
            my_bookings,
            today_confirmed,
        })
    }

    async fn game_names(&self) -> Result<HashMap<Ulid, String>, BookingError> {
        Ok(self
            .games()
            .await?
            .into_iter()
            .map(|g| (g.id, g.name))
            .collect())
    }

    fn line(&self, r: &Reservation, games: &HashMap<Ulid, String>, handle: &str) -> BookingLine {
        let game = games.get(&r.resource_id).map_or("", String::as_str);
        self.booking_line(r, game, handle)
    }

    /// `r` with its start rendered as a civil date and time.
    pub fn booking_line(&self, r: &Reservation, game: &str, handle: &str) -> BookingLine {
        let civil = self.zone.civil(r.start).unwrap_or_default();
        BookingLine {
            id: r.id,
            resource_id: r.resource_id,
            game: game.to_string(),
            user: handle.to_string(),
            date: civil.date(),
            time: civil.time(),
            status: r.status,
            created_at: r.created_at,
        }
    }
}
