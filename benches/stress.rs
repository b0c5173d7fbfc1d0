use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Datelike, Days, NaiveDate, NaiveTime};
use ulid::Ulid;

use courtside::allocator::{Allocator, BookingError, BookingRequest};
use courtside::catalog;
use courtside::clock::{Clock, ManualClock, RegionalZone};
use courtside::ledger::{Ledger, WalLedger};
use courtside::model::{Resource, Role, User};
use courtside::notify::{NotificationSink, NotifyHub};
use courtside::policy::SlotPolicy;
use courtside::server::ServerContext;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

struct Bench {
    allocator: Arc<Allocator>,
    games: Vec<Resource>,
    policy: SlotPolicy,
    today: NaiveDate,
}

/// Fresh WAL per phase, clock pinned to Monday 2026-10-19 10:00 IST.
async fn setup(phase: &str) -> Bench {
    let dir = std::env::temp_dir().join(format!("courtside_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");

    let zone = RegionalZone::ist();
    let today = NaiveDate::from_ymd_opt(2026, 10, 19).expect("valid date");
    let now = zone
        .to_instant(today, NaiveTime::from_hms_opt(10, 0, 0).expect("valid time"))
        .expect("instant in range");
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now));

    let ledger = WalLedger::open(&dir.join(format!("{phase}.wal")), clock.clone(), zone)
        .expect("open WAL");
    let games = catalog::seed(&ledger, &catalog::default_catalog())
        .await
        .expect("seed catalog");
    let policy = SlotPolicy::default();
    let allocator = Allocator::new(
        Arc::new(ledger) as Arc<dyn Ledger>,
        policy.clone(),
        clock,
        zone,
        Arc::new(NotifyHub::new()) as Arc<dyn NotificationSink>,
    );
    Bench {
        allocator: Arc::new(allocator),
        games,
        policy,
        today,
    }
}

impl Bench {
    /// Permitted (date, time) pairs from tomorrow on, in order.
    fn future_slots(&self, count: usize) -> Vec<(NaiveDate, NaiveTime)> {
        let mut out = Vec::with_capacity(count);
        let mut offset = 1;
        while out.len() < count {
            let date = self.today + Days::new(offset);
            for slot in self.policy.slots(date.weekday()) {
                out.push((date, slot.time));
            }
            offset += 1;
        }
        out.truncate(count);
        out
    }

    async fn fresh_user(&self) -> User {
        self.allocator
            .identify(&format!("bench-{}@bench.local", Ulid::new()), Role::Student)
            .await
            .expect("register user")
    }
}

async fn phase1_sequential() {
    let bench = setup("sequential").await;
    let game = &bench.games[0];
    let n = 500;
    let slots = bench.future_slots(n);

    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for (date, time) in slots {
        let user = bench.fresh_user().await;
        let t = Instant::now();
        bench
            .allocator
            .request_booking(BookingRequest {
                resource_id: game.id,
                user_id: user.id,
                date,
                time,
            })
            .await
            .expect("sequential booking");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("booking latency", &mut latencies);
}

async fn phase2_contention() {
    let bench = setup("contention").await;
    let contenders = 32;
    let rounds = 50;
    let slots = bench.future_slots(rounds);

    let mut users = Vec::with_capacity(contenders);
    for _ in 0..contenders {
        users.push(bench.fresh_user().await);
    }

    let start = Instant::now();
    let mut winners = 0;
    let mut taken = 0;
    for (round, (date, time)) in slots.into_iter().enumerate() {
        let game = bench.games[round % bench.games.len()].id;
        let mut handles = Vec::with_capacity(contenders);
        for user in &users {
            let allocator = bench.allocator.clone();
            let req = BookingRequest {
                resource_id: game,
                user_id: user.id,
                date,
                time,
            };
            handles.push(tokio::spawn(async move { allocator.request_booking(req).await }));
        }
        let mut round_winners = 0;
        for h in handles {
            match h.await.expect("task panicked") {
                Ok(_) => round_winners += 1,
                Err(BookingError::SlotTaken) => taken += 1,
                Err(_) => {}
            }
        }
        assert!(round_winners <= 1, "slot double-booked in round {round}");
        winners += round_winners;
    }

    let elapsed = start.elapsed();
    println!(
        "  {rounds} slots x {contenders} contenders in {:.2}s: {winners} winners, {taken} slot_taken",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load() {
    let bench = Arc::new(setup("read_under_load").await);
    let stop = Arc::new(AtomicBool::new(false));
    let written = Arc::new(AtomicUsize::new(0));

    let mut writer_handles = Vec::new();
    for w in 0..4 {
        let bench = bench.clone();
        let stop = stop.clone();
        let written = written.clone();
        writer_handles.push(tokio::spawn(async move {
            let game = bench.games[w % bench.games.len()].id;
            for (date, time) in bench.future_slots(2_000) {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let user = bench.fresh_user().await;
                let booked = bench
                    .allocator
                    .request_booking(BookingRequest {
                        resource_id: game,
                        user_id: user.id,
                        date,
                        time,
                    })
                    .await;
                if booked.is_ok() {
                    written.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    let n_readers = 8;
    let reads_per_reader = 300;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let bench = bench.clone();
        reader_handles.push(tokio::spawn(async move {
            let game = bench.games[r % bench.games.len()].id;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                bench.allocator.week(game).await.expect("week board");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.expect("reader panicked"));
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    println!("  {} bookings written during reads", written.load(Ordering::Relaxed));
    print_latency("week board", &mut all_latencies);
}

async fn phase4_protocol_round_trip() {
    let bench = setup("protocol").await;
    let ctx = ServerContext::new(bench.allocator.clone(), Vec::new());
    let game = &bench.games[1].name;
    let n = 300;

    let mut latencies = Vec::with_capacity(n);
    let mut ok = 0;
    for (date, time) in bench.future_slots(n) {
        let line = format!(
            r#"{{"user":"bench-{}@bench.local","op":"book","game":"{game}","date":"{date}","time":"{}"}}"#,
            Ulid::new(),
            time.format("%H:%M")
        );
        let t = Instant::now();
        let reply = ctx.handle_line(&line).await;
        latencies.push(t.elapsed());
        if reply.contains(r#""status":"ok""#) {
            ok += 1;
        }
    }

    println!("  {ok}/{n} protocol bookings succeeded");
    print_latency("request line to reply", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== courtside stress benchmark ===\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential().await;

    println!("\n[phase 2] contention on single slots");
    phase2_contention().await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load().await;

    println!("\n[phase 4] protocol round trip");
    phase4_protocol_round_trip().await;

    println!("\n=== done ===");
}
