//! Weekly slot table.
//!
//! Which times of day may be booked depends only on the weekday. The table is
//! plain data: [`SlotPolicy::default`] is the house schedule, and a JSON file
//! can replace it without touching the allocator.

use std::collections::HashSet;
use std::path::Path;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Confirmed bookings one user may hold per civil day, across all games.
pub const DAILY_BOOKING_CAP: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    #[serde(serialize_with = "ser_hhmm", deserialize_with = "de_hhmm")]
    pub time: NaiveTime,
    /// Reserved for users with no reservation history.
    #[serde(default)]
    pub priority: bool,
}

impl Slot {
    pub fn open(h: u32, m: u32) -> Self {
        Self {
            time: hm(h, m),
            priority: false,
        }
    }

    pub fn priority(h: u32, m: u32) -> Self {
        Self {
            time: hm(h, m),
            priority: true,
        }
    }
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

/// One weekday's entry in a policy file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub weekday: Weekday,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPolicy {
    /// Indexed by days from Monday; each day sorted by time.
    days: [Vec<Slot>; 7],
}

impl Default for SlotPolicy {
    fn default() -> Self {
        let weekday = || vec![Slot::open(16, 0), Slot::open(16, 30)];
        let wednesday = vec![Slot::priority(16, 0), Slot::open(16, 30)];
        let friday = vec![
            Slot::open(14, 0),
            Slot::open(14, 30),
            Slot::priority(15, 0),
            Slot::open(15, 30),
            Slot::open(16, 0),
            Slot::priority(16, 30),
        ];
        Self {
            days: [
                weekday(),
                weekday(),
                wednesday,
                weekday(),
                friday,
                Vec::new(),
                Vec::new(),
            ],
        }
    }
}

impl SlotPolicy {
    /// Build a table from per-day entries. Days not listed permit nothing.
    pub fn from_days(days: Vec<DaySchedule>) -> Result<Self, PolicyError> {
        let mut table: [Vec<Slot>; 7] = Default::default();
        let mut seen = HashSet::new();
        for day in days {
            if !seen.insert(day.weekday) {
                return Err(PolicyError::DuplicateDay(day.weekday));
            }
            let mut slots = day.slots;
            slots.sort_by_key(|s| s.time);
            if let Some(w) = slots.windows(2).find(|w| w[0].time == w[1].time) {
                return Err(PolicyError::DuplicateSlot(day.weekday, w[0].time));
            }
            table[day.weekday.num_days_from_monday() as usize] = slots;
        }
        Ok(Self { days: table })
    }

    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let days: Vec<DaySchedule> =
            serde_json::from_str(json).map_err(|e| PolicyError::Parse(e.to_string()))?;
        Self::from_days(days)
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| PolicyError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn to_days(&self) -> Vec<DaySchedule> {
        let mut out = Vec::new();
        let mut day = Weekday::Mon;
        for slots in &self.days {
            if !slots.is_empty() {
                out.push(DaySchedule {
                    weekday: day,
                    slots: slots.clone(),
                });
            }
            day = day.succ();
        }
        out
    }

    pub fn slots(&self, weekday: Weekday) -> &[Slot] {
        &self.days[weekday.num_days_from_monday() as usize]
    }

    /// Permitted times for the day, in order.
    pub fn permitted_slots(&self, weekday: Weekday) -> impl Iterator<Item = NaiveTime> + '_ {
        self.slots(weekday).iter().map(|s| s.time)
    }

    pub fn lookup(&self, weekday: Weekday, time: NaiveTime) -> Option<Slot> {
        let slots = self.slots(weekday);
        slots
            .binary_search_by_key(&time, |s| s.time)
            .ok()
            .map(|i| slots[i])
    }

    pub fn is_priority_slot(&self, weekday: Weekday, time: NaiveTime) -> bool {
        self.lookup(weekday, time).is_some_and(|s| s.priority)
    }
}

pub(crate) fn ser_hhmm<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&time.format("%H:%M").to_string())
}

pub(crate) fn de_hhmm<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
    let raw = String::deserialize(d)?;
    parse_time(&raw).map_err(serde::de::Error::custom)
}

/// Accepts `HH:MM` or `HH:MM:SS`.
pub fn parse_time(raw: &str) -> Result<NaiveTime, chrono::ParseError> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
}

#[derive(Debug)]
pub enum PolicyError {
    Io(String),
    Parse(String),
    DuplicateDay(Weekday),
    DuplicateSlot(Weekday, NaiveTime),
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::Io(e) => write!(f, "cannot read slot policy: {e}"),
            PolicyError::Parse(e) => write!(f, "bad slot policy: {e}"),
            PolicyError::DuplicateDay(day) => write!(f, "slot policy lists {day} twice"),
            PolicyError::DuplicateSlot(day, time) => {
                write!(f, "slot policy lists {day} {} twice", time.format("%H:%M"))
            }
        }
    }
}

impl std::error::Error for PolicyError {}
