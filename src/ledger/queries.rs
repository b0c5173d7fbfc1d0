use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{LedgerInner, SharedResourceState};

impl LedgerInner {
    pub(super) fn resource_state(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|entry| entry.value().clone())
    }

    pub(super) fn reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|r| r.value().clone())
    }

    /// `handle` must already be normalised.
    pub(super) fn user_by_handle(&self, handle: &str) -> Option<User> {
        let id = *self.handles.get(handle)?;
        self.users.get(&id).map(|u| u.value().clone())
    }

    /// Every row the user owns, any status, unordered.
    pub(super) fn user_rows(&self, user_id: Ulid) -> Vec<Reservation> {
        let ids = self
            .by_user
            .get(&user_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.reservation(id)).collect()
    }

    pub(super) async fn get_resource(&self, id: Ulid) -> Option<Resource> {
        let rs = self.resource_state(&id)?;
        let guard = rs.read().await;
        Some(guard.resource.clone())
    }

    pub(super) async fn list_resources(&self) -> Vec<Resource> {
        let states: Vec<SharedResourceState> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for rs in states {
            out.push(rs.read().await.resource.clone());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub(super) fn list_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by(|a, b| a.handle.cmp(&b.handle));
        users
    }

    pub(super) fn count_confirmed_for_user_on_day(&self, user_id: Ulid, date: NaiveDate) -> usize {
        let Some(window) = self.zone.day_window(date) else {
            return 0;
        };
        self.user_rows(user_id)
            .iter()
            .filter(|r| r.is_live() && window.contains_instant(r.start))
            .count()
    }

    pub(super) async fn find_live_conflict(
        &self,
        resource_id: Ulid,
        start: Ms,
    ) -> Option<Reservation> {
        let rs = self.resource_state(&resource_id)?;
        let holder = rs.read().await.holder(start)?;
        self.reservation(&holder)
    }

    pub(super) async fn live_reservations_for_resource(
        &self,
        resource_id: Ulid,
        from: Ms,
    ) -> Vec<Reservation> {
        let Some(rs) = self.resource_state(&resource_id) else {
            return vec![];
        };
        let guard = rs.read().await;
        guard
            .live_from(from)
            .filter_map(|(_, id)| self.reservation(&id))
            .collect()
    }

    pub(super) fn reservations_on_day(&self, date: NaiveDate) -> Vec<Reservation> {
        let Some(window) = self.zone.day_window(date) else {
            return vec![];
        };
        let mut rows: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|e| window.contains_instant(e.start))
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|r| (r.start, r.created_at));
        rows
    }
}
