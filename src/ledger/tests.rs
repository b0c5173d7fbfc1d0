use std::path::PathBuf;

use chrono::NaiveTime;

use super::*;
use crate::clock::ManualClock;

const H: Ms = 3_600_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("courtside_test_ledger");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
}

fn at(d: u32, h: u32, m: u32) -> Ms {
    RegionalZone::ist()
        .to_instant(day(d), NaiveTime::from_hms_opt(h, m, 0).unwrap())
        .unwrap()
}

/// Monday 2026-10-19, 10:00 IST.
fn monday_morning() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(at(19, 10, 0)))
}

fn open(path: &Path, clock: Arc<ManualClock>) -> WalLedger {
    WalLedger::open(path, clock, RegionalZone::ist()).unwrap()
}

async fn seeded(ledger: &WalLedger) -> (Resource, User) {
    let game = ledger.create_resource("Badminton", 4, 60).await.unwrap();
    let user = ledger.register_user("a@x.edu", Role::Student).await.unwrap();
    (game, user)
}

// ── Catalog and users ────────────────────────────────────

#[tokio::test]
async fn create_and_list_resources_by_name() {
    let ledger = open(&test_wal_path("list_resources.wal"), monday_morning());
    ledger.create_resource("Tennis", 4, 90).await.unwrap();
    ledger.create_resource("Basketball", 10, 60).await.unwrap();

    let names: Vec<String> = ledger
        .list_resources()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, ["Basketball", "Tennis"]);
}

#[tokio::test]
async fn duplicate_resource_name_rejected() {
    let ledger = open(&test_wal_path("dup_resource.wal"), monday_morning());
    ledger.create_resource("Cricket", 22, 180).await.unwrap();
    let result = ledger.create_resource("Cricket", 22, 180).await;
    assert!(matches!(result, Err(LedgerError::AlreadyExists(_))));
}

#[tokio::test]
async fn register_user_is_get_or_create() {
    let ledger = open(&test_wal_path("register_user.wal"), monday_morning());
    let first = ledger.register_user("Alice@X.edu ", Role::Student).await.unwrap();
    let again = ledger.register_user("alice@x.edu", Role::Admin).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(again.role, Role::Student);
    assert_eq!(first.handle, "alice@x.edu");
    assert_eq!(
        ledger.find_user("ALICE@x.edu").await.unwrap().map(|u| u.id),
        Some(first.id)
    );
}

#[tokio::test]
async fn empty_handle_rejected() {
    let ledger = open(&test_wal_path("empty_handle.wal"), monday_morning());
    let result = ledger.register_user("   ", Role::Student).await;
    assert!(matches!(result, Err(LedgerError::LimitExceeded(_))));
}

#[tokio::test]
async fn handle_with_line_breaks_rejected() {
    let ledger = open(&test_wal_path("control_handle.wal"), monday_morning());
    let result = ledger
        .register_user("a@x.edu\r\nBcc: b@y.edu", Role::Student)
        .await;
    assert!(matches!(result, Err(LedgerError::LimitExceeded(_))));
    assert!(ledger.list_users().await.unwrap().is_empty());
}

// ── Reservations ─────────────────────────────────────────

#[tokio::test]
async fn create_then_conflict_on_same_slot() {
    let ledger = open(&test_wal_path("create_conflict.wal"), monday_morning());
    let (game, alice) = seeded(&ledger).await;
    let bob = ledger.register_user("b@x.edu", Role::Student).await.unwrap();

    let start = at(21, 16, 0);
    let first = ledger.create(Ulid::new(), game.id, alice.id, start).await.unwrap();
    assert!(first.is_live());
    assert_eq!(first.created_at, at(19, 10, 0));

    let result = ledger.create(Ulid::new(), game.id, bob.id, start).await;
    assert!(matches!(result, Err(LedgerError::Conflict(id)) if id == first.id));

    let holder = ledger.find_live_conflict(game.id, start).await.unwrap();
    assert_eq!(holder.map(|r| r.id), Some(first.id));
}

#[tokio::test]
async fn same_instant_on_other_game_is_free() {
    let ledger = open(&test_wal_path("other_game.wal"), monday_morning());
    let (badminton, alice) = seeded(&ledger).await;
    let tennis = ledger.create_resource("Tennis", 4, 90).await.unwrap();
    let bob = ledger.register_user("b@x.edu", Role::Student).await.unwrap();

    let start = at(21, 16, 0);
    ledger.create(Ulid::new(), badminton.id, alice.id, start).await.unwrap();
    ledger.create(Ulid::new(), tennis.id, bob.id, start).await.unwrap();
}

#[tokio::test]
async fn create_for_unknown_user_or_game_fails() {
    let ledger = open(&test_wal_path("create_unknown.wal"), monday_morning());
    let (game, alice) = seeded(&ledger).await;
    let start = at(21, 16, 0);

    let result = ledger.create(Ulid::new(), game.id, Ulid::new(), start).await;
    assert!(matches!(result, Err(LedgerError::NotFound(_))));
    let result = ledger.create(Ulid::new(), Ulid::new(), alice.id, start).await;
    assert!(matches!(result, Err(LedgerError::NotFound(_))));
}

#[tokio::test]
async fn duplicate_reservation_id_rejected() {
    let ledger = open(&test_wal_path("dup_reservation.wal"), monday_morning());
    let (game, alice) = seeded(&ledger).await;
    let id = Ulid::new();
    ledger.create(id, game.id, alice.id, at(21, 16, 0)).await.unwrap();
    let result = ledger.create(id, game.id, alice.id, at(21, 16, 30)).await;
    assert!(matches!(result, Err(LedgerError::AlreadyExists(_))));
}

#[tokio::test]
async fn reissued_create_returns_the_landed_row() {
    let path = test_wal_path("reissued_create.wal");
    let ledger = open(&path, monday_morning());
    let (game, alice) = seeded(&ledger).await;
    let id = Ulid::new();
    let start = at(21, 16, 0);

    let first = ledger.create(id, game.id, alice.id, start).await.unwrap();
    let again = ledger.create(id, game.id, alice.id, start).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(ledger.reservations_for_user(alice.id).await.unwrap().len(), 1);

    // No second event was logged.
    drop(ledger);
    let reopened = open(&path, monday_morning());
    assert_eq!(reopened.all_reservations().await.unwrap(), vec![first]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_issues_of_one_create_agree() {
    let ledger = open(&test_wal_path("concurrent_same_id.wal"), monday_morning());
    let (game, alice) = seeded(&ledger).await;
    let id = Ulid::new();
    let start = at(22, 16, 30);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.create(id, game.id, alice.id, start).await
        }));
    }
    for h in handles {
        let row = h.await.unwrap().unwrap();
        assert_eq!(row.id, id);
    }
    assert_eq!(ledger.all_reservations().await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancel_frees_slot_and_keeps_history() {
    let ledger = open(&test_wal_path("cancel_frees.wal"), monday_morning());
    let (game, alice) = seeded(&ledger).await;
    let bob = ledger.register_user("b@x.edu", Role::Student).await.unwrap();
    let start = at(21, 16, 0);

    let first = ledger.create(Ulid::new(), game.id, alice.id, start).await.unwrap();
    let cancelled = ledger.cancel(first.id, Actor::member(alice.id)).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(cancelled.cancelled_at, Some(at(19, 10, 0)));
    assert!(ledger.find_live_conflict(game.id, start).await.unwrap().is_none());

    let second = ledger.create(Ulid::new(), game.id, bob.id, start).await.unwrap();
    assert!(second.is_live());

    // Both rows remain; only one is live.
    let on_day = ledger.reservations_on_day(day(21)).await.unwrap();
    assert_eq!(on_day.len(), 2);
    assert_eq!(on_day.iter().filter(|r| r.is_live()).count(), 1);
}

#[tokio::test]
async fn cancel_twice_is_a_noop() {
    let ledger = open(&test_wal_path("cancel_twice.wal"), monday_morning());
    let (game, alice) = seeded(&ledger).await;
    let r = ledger.create(Ulid::new(), game.id, alice.id, at(21, 16, 0)).await.unwrap();

    let first = ledger.cancel(r.id, Actor::member(alice.id)).await.unwrap();
    let second = ledger.cancel(r.id, Actor::member(alice.id)).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(ledger.wal_appends_since_compact().await, 4);
}

#[tokio::test]
async fn cancel_by_stranger_forbidden_admin_allowed() {
    let ledger = open(&test_wal_path("cancel_forbidden.wal"), monday_morning());
    let (game, alice) = seeded(&ledger).await;
    let bob = ledger.register_user("b@x.edu", Role::Student).await.unwrap();
    let staff = ledger.register_user("staff@x.edu", Role::Admin).await.unwrap();
    let r = ledger.create(Ulid::new(), game.id, alice.id, at(21, 16, 0)).await.unwrap();

    let result = ledger.cancel(r.id, Actor::member(bob.id)).await;
    assert!(matches!(result, Err(LedgerError::Forbidden(_))));
    assert!(ledger.get_reservation(r.id).await.unwrap().unwrap().is_live());

    let done = ledger.cancel(r.id, Actor::for_user(&staff)).await.unwrap();
    assert!(!done.is_live());
}

#[tokio::test]
async fn cancel_after_start_rejected() {
    let clock = monday_morning();
    let ledger = open(&test_wal_path("cancel_past.wal"), clock.clone());
    let (game, alice) = seeded(&ledger).await;
    let r = ledger.create(Ulid::new(), game.id, alice.id, at(19, 16, 0)).await.unwrap();

    clock.set(at(19, 16, 0) + 1);
    let result = ledger.cancel(r.id, Actor::member(alice.id)).await;
    assert!(matches!(result, Err(LedgerError::PastBooking(_))));
    assert!(ledger.get_reservation(r.id).await.unwrap().unwrap().is_live());
}

#[tokio::test]
async fn cancel_unknown_reservation() {
    let ledger = open(&test_wal_path("cancel_unknown.wal"), monday_morning());
    let (_, alice) = seeded(&ledger).await;
    let result = ledger.cancel(Ulid::new(), Actor::member(alice.id)).await;
    assert!(matches!(result, Err(LedgerError::NotFound(_))));
}

#[tokio::test]
async fn daily_count_uses_civil_day_and_live_rows_only() {
    let ledger = open(&test_wal_path("daily_count.wal"), monday_morning());
    let (game, alice) = seeded(&ledger).await;
    let tennis = ledger.create_resource("Tennis", 4, 90).await.unwrap();

    ledger.create(Ulid::new(), game.id, alice.id, at(23, 14, 0)).await.unwrap();
    let cancelled = ledger.create(Ulid::new(), tennis.id, alice.id, at(23, 15, 0)).await.unwrap();
    ledger.cancel(cancelled.id, Actor::member(alice.id)).await.unwrap();
    // Just after civil midnight belongs to the next day.
    ledger.create(Ulid::new(), game.id, alice.id, at(24, 0, 0)).await.unwrap();

    assert_eq!(ledger.count_confirmed_for_user_on_day(alice.id, day(23)).await.unwrap(), 1);
    assert_eq!(ledger.count_confirmed_for_user_on_day(alice.id, day(24)).await.unwrap(), 1);
    assert_eq!(ledger.count_confirmed_for_user_on_day(alice.id, day(22)).await.unwrap(), 0);
}

#[tokio::test]
async fn any_reservation_counts_cancelled_history() {
    let ledger = open(&test_wal_path("any_reservation.wal"), monday_morning());
    let (game, alice) = seeded(&ledger).await;
    assert!(!ledger.user_has_any_reservation(alice.id).await.unwrap());

    let r = ledger.create(Ulid::new(), game.id, alice.id, at(21, 16, 0)).await.unwrap();
    ledger.cancel(r.id, Actor::member(alice.id)).await.unwrap();
    assert!(ledger.user_has_any_reservation(alice.id).await.unwrap());
}

#[tokio::test]
async fn listing_orders() {
    let ledger = open(&test_wal_path("listing_orders.wal"), monday_morning());
    let (game, alice) = seeded(&ledger).await;
    let early = ledger.create(Ulid::new(), game.id, alice.id, at(20, 16, 0)).await.unwrap();
    let late = ledger.create(Ulid::new(), game.id, alice.id, at(23, 14, 0)).await.unwrap();
    let mid = ledger.create(Ulid::new(), game.id, alice.id, at(21, 16, 0)).await.unwrap();

    let mine: Vec<Ulid> = ledger
        .reservations_for_user(alice.id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(mine, [late.id, mid.id, early.id]);

    let upcoming: Vec<Ulid> = ledger
        .live_reservations_for_resource(game.id, at(21, 0, 0))
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(upcoming, [mid.id, late.id]);

    assert_eq!(ledger.all_reservations().await.unwrap()[0].id, late.id);
}

// ── Cascade delete ───────────────────────────────────────

#[tokio::test]
async fn delete_user_cascades_and_frees_slots() {
    let ledger = open(&test_wal_path("delete_cascade.wal"), monday_morning());
    let (game, alice) = seeded(&ledger).await;
    let bob = ledger.register_user("b@x.edu", Role::Student).await.unwrap();
    let start = at(21, 16, 0);

    ledger.create(Ulid::new(), game.id, alice.id, start).await.unwrap();
    let old = ledger.create(Ulid::new(), game.id, alice.id, at(20, 16, 0)).await.unwrap();
    ledger.cancel(old.id, Actor::member(alice.id)).await.unwrap();

    assert_eq!(ledger.delete_user(alice.id).await.unwrap(), 2);
    assert!(ledger.get_user(alice.id).await.unwrap().is_none());
    assert!(ledger.find_user("a@x.edu").await.unwrap().is_none());
    assert!(ledger.reservations_for_user(alice.id).await.unwrap().is_empty());
    assert!(ledger.all_reservations().await.unwrap().is_empty());

    ledger.create(Ulid::new(), game.id, bob.id, start).await.unwrap();
}

#[tokio::test]
async fn delete_unknown_user() {
    let ledger = open(&test_wal_path("delete_unknown.wal"), monday_morning());
    let result = ledger.delete_user(Ulid::new()).await;
    assert!(matches!(result, Err(LedgerError::NotFound(_))));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_creates_yield_one_winner() {
    let ledger = open(&test_wal_path("race.wal"), monday_morning());
    let game = ledger.create_resource("Football", 22, 90).await.unwrap();
    let start = at(23, 15, 0);

    let mut users = Vec::new();
    for i in 0..16 {
        users.push(ledger.register_user(&format!("u{i}@x.edu"), Role::Student).await.unwrap());
    }

    let mut handles = Vec::new();
    for user in users {
        let l = ledger.clone();
        handles.push(tokio::spawn(async move {
            l.create(Ulid::new(), game.id, user.id, start).await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => winners += 1,
            Err(LedgerError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(ledger.reservations_on_day(day(23)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit.wal");
    let ledger = open(&path, monday_morning());

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let l = ledger.clone();
        handles.push(tokio::spawn(async move {
            l.register_user(&format!("p{i}@x.edu"), Role::Student).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(ledger.list_users().await.unwrap().len(), n);

    let reopened = open(&path, monday_morning());
    assert_eq!(reopened.list_users().await.unwrap().len(), n);
}

// ── Replay and compaction ────────────────────────────────

#[tokio::test]
async fn replay_into_a_locked_game_is_an_error() {
    let ledger = open(&test_wal_path("replay_locked.wal"), monday_morning());
    let (game, alice) = seeded(&ledger).await;
    let rs = ledger.inner.resource_state(&game.id).unwrap();
    let _reader = rs.read().await;

    let event = Event::ReservationConfirmed {
        id: Ulid::new(),
        resource_id: game.id,
        user_id: alice.id,
        start: at(21, 16, 0),
        created_at: at(19, 10, 0),
    };
    let err = ledger.inner.replay(&event).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    assert!(ledger.all_reservations().await.unwrap().is_empty());
}

#[tokio::test]
async fn replay_restores_live_index_and_history() {
    let path = test_wal_path("replay.wal");
    let start = at(21, 16, 0);
    let (game_id, alice_id, live_id, cancelled_id) = {
        let ledger = open(&path, monday_morning());
        let (game, alice) = seeded(&ledger).await;
        let gone = ledger.register_user("gone@x.edu", Role::Student).await.unwrap();
        ledger.create(Ulid::new(), game.id, gone.id, at(22, 16, 0)).await.unwrap();
        ledger.delete_user(gone.id).await.unwrap();

        let cancelled = ledger.create(Ulid::new(), game.id, alice.id, start).await.unwrap();
        ledger.cancel(cancelled.id, Actor::member(alice.id)).await.unwrap();
        let live = ledger.create(Ulid::new(), game.id, alice.id, start).await.unwrap();
        (game.id, alice.id, live.id, cancelled.id)
    };

    let ledger = open(&path, monday_morning());
    assert_eq!(
        ledger.find_live_conflict(game_id, start).await.unwrap().map(|r| r.id),
        Some(live_id)
    );
    let old = ledger.get_reservation(cancelled_id).await.unwrap().unwrap();
    assert_eq!(old.status, ReservationStatus::Cancelled);
    assert_eq!(ledger.reservations_for_user(alice_id).await.unwrap().len(), 2);
    assert!(ledger.find_user("gone@x.edu").await.unwrap().is_none());
    assert!(ledger.find_live_conflict(game_id, at(22, 16, 0)).await.unwrap().is_none());
}

#[tokio::test]
async fn compact_wal_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let start = at(21, 16, 0);
    let (game_id, live_id) = {
        let ledger = open(&path, monday_morning());
        let (game, alice) = seeded(&ledger).await;
        // Churn the same slot to grow the log.
        for _ in 0..10 {
            let r = ledger.create(Ulid::new(), game.id, alice.id, start).await.unwrap();
            ledger.cancel(r.id, Actor::member(alice.id)).await.unwrap();
        }
        let live = ledger.create(Ulid::new(), game.id, alice.id, start).await.unwrap();
        assert!(ledger.wal_appends_since_compact().await > 0);

        ledger.compact_wal().await.unwrap();
        assert_eq!(ledger.wal_appends_since_compact().await, 0);
        (game.id, live.id)
    };

    let ledger = open(&path, monday_morning());
    assert_eq!(
        ledger.find_live_conflict(game_id, start).await.unwrap().map(|r| r.id),
        Some(live_id)
    );
    assert_eq!(ledger.reservations_on_day(day(21)).await.unwrap().len(), 11);
}

#[tokio::test]
async fn compact_then_append_survives_restart() {
    let path = test_wal_path("compact_restart.wal");
    {
        let ledger = open(&path, monday_morning());
        let (game, alice) = seeded(&ledger).await;
        ledger.compact_wal().await.unwrap();
        ledger.create(Ulid::new(), game.id, alice.id, at(21, 16, 0) + H).await.unwrap();
    }
    let ledger = open(&path, monday_morning());
    assert_eq!(ledger.all_reservations().await.unwrap().len(), 1);
    assert_eq!(ledger.list_resources().await.unwrap().len(), 1);
}
