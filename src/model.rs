use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds: lock lifetimes and audit stamps.
pub type Ms = i64;

/// Minutes since local midnight, for seating times and durations.
/// May exceed 1440 when a booking runs past midnight.
pub type Minute = i32;

pub type VenueId = i64;
pub type ServiceId = i64;
pub type TableId = i64;
pub type GroupId = i64;
pub type BookingId = Ulid;
pub type LockToken = Ulid;

/// Half-open interval `[start, end)` in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn starting_at(start: Minute, duration: Minute) -> Self {
        Self::new(start, start + duration)
    }

    pub fn duration(&self) -> Minute {
        self.end - self.start
    }

    /// `self.start < other.end && self.end > other.start`; touching spans do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }
}

pub fn minute_of_day(t: NaiveTime) -> Minute {
    (t.hour() * 60 + t.minute()) as Minute
}

/// Render a minute-of-day as `HH:MM`, wrapping past midnight.
pub fn format_minute(m: Minute) -> String {
    let m = m.rem_euclid(24 * 60);
    format!("{:02}:{:02}", m / 60, m % 60)
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

/// Serde adapter for `HH:MM` times in seed files and API payloads.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_time(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid time: {raw}")))
    }
}

// ── Floor ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Venue {
    pub id: VenueId,
    pub slug: String,
    pub name: String,
}

/// A sitting (lunch, dinner, ...) with its own seating window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub venue_id: VenueId,
    pub name: String,
    #[serde(with = "hhmm")]
    pub opens_at: NaiveTime,
    #[serde(with = "hhmm")]
    pub last_seating: NaiveTime,
    #[serde(default = "default_slot_interval")]
    pub slot_interval_minutes: Minute,
    #[serde(default)]
    pub duration_minutes: Option<Minute>,
}

fn default_slot_interval() -> Minute {
    15
}

impl Service {
    pub fn window(&self) -> (Minute, Minute) {
        (minute_of_day(self.opens_at), minute_of_day(self.last_seating))
    }

    /// Every bookable seating time, first to last inclusive.
    pub fn seating_times(&self) -> Vec<Minute> {
        let (open, last) = self.window();
        let step = self.slot_interval_minutes.max(1);
        (open..=last).step_by(step as usize).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    pub venue_id: VenueId,
    pub label: String,
    pub seats: u32,
    #[serde(default)]
    pub section: Option<String>,
    /// Lower rank = preferred.
    #[serde(default)]
    pub priority_rank: i32,
    #[serde(default = "yes")]
    pub online_bookable: bool,
    #[serde(default)]
    pub status: TableStatus,
}

fn yes() -> bool {
    true
}

impl Table {
    pub fn is_active(&self) -> bool {
        self.status == TableStatus::Active
    }
}

/// Adjacent tables that can be pushed together for one party.
/// Usable only while every member is free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinGroup {
    pub id: GroupId,
    pub venue_id: VenueId,
    pub name: String,
    pub table_ids: Vec<TableId>,
    pub min_party: u32,
    pub max_party: u32,
}

impl JoinGroup {
    pub fn seats(&self, party_size: u32) -> bool {
        (self.min_party..=self.max_party).contains(&party_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PriorityTarget {
    Table(TableId),
    Group(GroupId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityEntry {
    pub rank: i32,
    pub target: PriorityTarget,
}

/// Operator-defined preferences for one venue and party size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPriority {
    pub venue_id: VenueId,
    pub party_size: u32,
    pub entries: Vec<PriorityEntry>,
}

/// Priority entries in consultation order: ascending rank, ties kept in
/// the order the operator listed them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityList {
    entries: Vec<PriorityEntry>,
}

impl PriorityList {
    pub fn new(mut entries: Vec<PriorityEntry>) -> Self {
        entries.sort_by_key(|e| e.rank);
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PriorityEntry> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    PendingPayment,
    Confirmed,
    Seated,
    Finished,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Finished | BookingStatus::Cancelled | BookingStatus::NoShow)
    }

    /// Whether a booking in this state still claims its table.
    pub fn occupies_table(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    #[serde(default = "Ulid::new")]
    pub id: BookingId,
    pub venue_id: VenueId,
    pub service_id: ServiceId,
    #[serde(default)]
    pub table_id: Option<TableId>,
    #[serde(default)]
    pub join_group_id: Option<GroupId>,
    pub party_size: u32,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    #[serde(default)]
    pub duration_minutes: Option<Minute>,
    pub status: BookingStatus,
}

impl Booking {
    pub fn span(&self, default_duration: Minute) -> Span {
        let duration = self.duration_minutes.unwrap_or(default_duration).max(1);
        Span::starting_at(minute_of_day(self.time), duration)
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey {
            venue_id: self.venue_id,
            service_id: self.service_id,
            date: self.date,
        }
    }
}

// ── Locks ────────────────────────────────────────────────────────

/// One bookable instant. At most one live lock may exist per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub venue_id: VenueId,
    pub service_id: ServiceId,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl SlotKey {
    pub fn cache_key(&self) -> CacheKey {
        CacheKey {
            venue_id: self.venue_id,
            service_id: self.service_id,
            date: self.date,
        }
    }
}

/// Granularity of the availability cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub venue_id: VenueId,
    pub service_id: ServiceId,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub token: LockToken,
    pub key: SlotKey,
    pub party_size: u32,
    pub created_at: Ms,
    pub expires_at: Ms,
    pub released_at: Option<Ms>,
    pub reason: Option<String>,
}

impl Lock {
    /// The one definition of "held": unreleased and not yet expired.
    /// Every reader goes through here; `released_at.is_none()` alone is not enough.
    pub fn is_live(&self, now: Ms) -> bool {
        self.released_at.is_none() && self.expires_at > now
    }
}
