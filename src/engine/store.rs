//! The relational store the engine reads and writes.
//!
//! Everything that must be atomic (one live lock per slot, one party per
//! table interval) is expressed as a conditional write on this trait, never
//! as read-then-write in the engine.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::model::*;

use super::conflict::claimed_tables;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Conditional lock insert lost: a live lock already owns the slot.
    SlotHeld { expires_at: Ms },
    /// Conditional booking insert lost: the table is taken for that interval.
    TableTaken(TableId),
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::SlotHeld { expires_at } => write!(f, "slot held until {expires_at}"),
            StoreError::TableTaken(id) => write!(f, "table {id} already booked"),
            StoreError::Backend(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait]
pub trait Store: Send + Sync {
    async fn venue_by_slug(&self, slug: &str) -> Result<Option<Venue>, StoreError>;
    async fn service(&self, venue_id: VenueId, service_id: ServiceId) -> Result<Option<Service>, StoreError>;
    async fn tables(&self, venue_id: VenueId) -> Result<Vec<Table>, StoreError>;
    async fn join_groups(&self, venue_id: VenueId) -> Result<Vec<JoinGroup>, StoreError>;
    async fn priorities(&self, venue_id: VenueId, party_size: u32) -> Result<PriorityList, StoreError>;

    async fn bookings_on(&self, venue_id: VenueId, date: NaiveDate) -> Result<Vec<Booking>, StoreError>;
    async fn get_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;
    /// Insert unless one of the booking's tables is claimed by an overlapping,
    /// non-terminal booking.
    async fn insert_booking_if_free(&self, booking: Booking, default_duration: Minute) -> Result<(), StoreError>;
    /// Returns the booking as it was before the update.
    async fn set_booking_status(&self, id: BookingId, status: BookingStatus) -> Result<Option<Booking>, StoreError>;

    /// Insert unless a live lock exists on the same key. Equivalent of a
    /// partial unique index over the slot where the lock is live.
    async fn insert_lock_if_free(&self, lock: Lock, now: Ms) -> Result<(), StoreError>;
    async fn get_lock(&self, token: LockToken) -> Result<Option<Lock>, StoreError>;
    async fn live_lock(&self, key: &SlotKey, now: Ms) -> Result<Option<Lock>, StoreError>;
    async fn live_locks_for(&self, key: &CacheKey, now: Ms) -> Result<Vec<Lock>, StoreError>;
    /// Move the expiry only while the lock is still live. Returns whether it moved.
    async fn set_lock_expiry(&self, token: LockToken, expires_at: Ms, now: Ms) -> Result<bool, StoreError>;
    /// Stamp `released_at` if unset. Returns the row as it was before, if any.
    async fn release_lock(&self, token: LockToken, now: Ms, reason: &str) -> Result<Option<Lock>, StoreError>;
    /// Unreleased locks whose expiry has passed.
    async fn expired_locks(&self, now: Ms) -> Result<Vec<Lock>, StoreError>;
    /// Delete rows released before `before`. Returns how many went.
    async fn prune_released_locks(&self, before: Ms) -> Result<usize, StoreError>;
}

/// Seed data for the in-memory store, as read from JSON.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Dataset {
    pub venues: Vec<Venue>,
    pub services: Vec<Service>,
    pub tables: Vec<Table>,
    pub join_groups: Vec<JoinGroup>,
    pub priorities: Vec<BookingPriority>,
    pub bookings: Vec<Booking>,
}

/// One venue's bookings, sorted by `(date, time)`.
#[derive(Debug, Default)]
pub struct BookingLedger {
    bookings: Vec<Booking>,
}

impl BookingLedger {
    fn insert(&mut self, booking: Booking) {
        let key = (booking.date, booking.time);
        let pos = self.bookings.partition_point(|b| (b.date, b.time) <= key);
        self.bookings.insert(pos, booking);
    }

    fn on_date(&self, date: NaiveDate) -> &[Booking] {
        let lo = self.bookings.partition_point(|b| b.date < date);
        let hi = self.bookings.partition_point(|b| b.date <= date);
        &self.bookings[lo..hi]
    }

    fn find_mut(&mut self, id: BookingId) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }
}

pub type SharedLedger = Arc<RwLock<BookingLedger>>;

/// Lock ordering: `live_index` before `locks`. Paths that touch `locks`
/// first must drop that guard before touching `live_index`.
pub struct InMemoryStore {
    venues: DashMap<VenueId, Venue>,
    venue_slugs: DashMap<String, VenueId>,
    services: DashMap<ServiceId, Service>,
    tables: DashMap<VenueId, Vec<Table>>,
    join_groups: DashMap<VenueId, Vec<JoinGroup>>,
    priorities: DashMap<(VenueId, u32), PriorityList>,
    ledgers: DashMap<VenueId, SharedLedger>,
    /// Reverse lookup: booking id → venue id
    booking_to_venue: DashMap<BookingId, VenueId>,
    locks: DashMap<LockToken, Lock>,
    /// Slot → token of the lock most recently granted on it.
    live_index: DashMap<SlotKey, LockToken>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            venues: DashMap::new(),
            venue_slugs: DashMap::new(),
            services: DashMap::new(),
            tables: DashMap::new(),
            join_groups: DashMap::new(),
            priorities: DashMap::new(),
            ledgers: DashMap::new(),
            booking_to_venue: DashMap::new(),
            locks: DashMap::new(),
            live_index: DashMap::new(),
        }
    }

    pub async fn from_dataset(data: Dataset) -> Self {
        let store = Self::new();
        store.load(data).await;
        store
    }

    pub async fn load(&self, data: Dataset) {
        for v in data.venues {
            self.add_venue(v);
        }
        for s in data.services {
            self.add_service(s);
        }
        for t in data.tables {
            self.add_table(t);
        }
        for g in data.join_groups {
            self.add_join_group(g);
        }
        for p in data.priorities {
            self.set_priorities(p);
        }
        for b in data.bookings {
            self.add_booking(b).await;
        }
    }

    // ── Floor setup ──────────────────────────────────────────

    pub fn add_venue(&self, venue: Venue) {
        self.venue_slugs.insert(venue.slug.clone(), venue.id);
        self.venues.insert(venue.id, venue);
    }

    pub fn add_service(&self, service: Service) {
        self.services.insert(service.id, service);
    }

    pub fn add_table(&self, table: Table) {
        self.tables.entry(table.venue_id).or_default().push(table);
    }

    pub fn add_join_group(&self, group: JoinGroup) {
        self.join_groups.entry(group.venue_id).or_default().push(group);
    }

    pub fn set_priorities(&self, priority: BookingPriority) {
        self.priorities.insert(
            (priority.venue_id, priority.party_size),
            PriorityList::new(priority.entries),
        );
    }

    /// Unconditional insert, for seeding.
    pub async fn add_booking(&self, booking: Booking) {
        let ledger = self.ledger(booking.venue_id);
        self.booking_to_venue.insert(booking.id, booking.venue_id);
        ledger.write().await.insert(booking);
    }

    fn ledger(&self, venue_id: VenueId) -> SharedLedger {
        self.ledgers.entry(venue_id).or_default().value().clone()
    }

    fn groups_snapshot(&self, venue_id: VenueId) -> Vec<JoinGroup> {
        self.join_groups
            .get(&venue_id)
            .map(|g| g.value().clone())
            .unwrap_or_default()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn venue_by_slug(&self, slug: &str) -> Result<Option<Venue>, StoreError> {
        let Some(id) = self.venue_slugs.get(slug).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self.venues.get(&id).map(|v| v.value().clone()))
    }

    async fn service(&self, venue_id: VenueId, service_id: ServiceId) -> Result<Option<Service>, StoreError> {
        Ok(self
            .services
            .get(&service_id)
            .filter(|s| s.venue_id == venue_id)
            .map(|s| s.value().clone()))
    }

    async fn tables(&self, venue_id: VenueId) -> Result<Vec<Table>, StoreError> {
        Ok(self
            .tables
            .get(&venue_id)
            .map(|t| t.value().clone())
            .unwrap_or_default())
    }

    async fn join_groups(&self, venue_id: VenueId) -> Result<Vec<JoinGroup>, StoreError> {
        Ok(self.groups_snapshot(venue_id))
    }

    async fn priorities(&self, venue_id: VenueId, party_size: u32) -> Result<PriorityList, StoreError> {
        Ok(self
            .priorities
            .get(&(venue_id, party_size))
            .map(|p| p.value().clone())
            .unwrap_or_default())
    }

    async fn bookings_on(&self, venue_id: VenueId, date: NaiveDate) -> Result<Vec<Booking>, StoreError> {
        let Some(ledger) = self.ledgers.get(&venue_id).map(|l| l.value().clone()) else {
            return Ok(Vec::new());
        };
        let guard = ledger.read().await;
        Ok(guard.on_date(date).to_vec())
    }

    async fn get_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        let Some(venue_id) = self.booking_to_venue.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let ledger = self.ledger(venue_id);
        let guard = ledger.read().await;
        Ok(guard.bookings.iter().find(|b| b.id == id).cloned())
    }

    async fn insert_booking_if_free(&self, booking: Booking, default_duration: Minute) -> Result<(), StoreError> {
        let ledger = self.ledger(booking.venue_id);
        let mut guard = ledger.write().await;

        if booking.status.occupies_table() {
            let groups = self.groups_snapshot(booking.venue_id);
            let wanted: HashSet<TableId> = claimed_tables(&booking, &groups).into_iter().collect();
            let span = booking.span(default_duration);
            for existing in guard.on_date(booking.date) {
                if !existing.status.occupies_table() || !existing.span(default_duration).overlaps(&span) {
                    continue;
                }
                if let Some(taken) = claimed_tables(existing, &groups)
                    .into_iter()
                    .find(|t| wanted.contains(t))
                {
                    return Err(StoreError::TableTaken(taken));
                }
            }
        }

        self.booking_to_venue.insert(booking.id, booking.venue_id);
        guard.insert(booking);
        Ok(())
    }

    async fn set_booking_status(&self, id: BookingId, status: BookingStatus) -> Result<Option<Booking>, StoreError> {
        let Some(venue_id) = self.booking_to_venue.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let ledger = self.ledger(venue_id);
        let mut guard = ledger.write().await;
        Ok(guard.find_mut(id).map(|b| {
            let before = b.clone();
            b.status = status;
            before
        }))
    }

    async fn insert_lock_if_free(&self, lock: Lock, now: Ms) -> Result<(), StoreError> {
        // The entry guard serialises every insert on this key.
        match self.live_index.entry(lock.key.clone()) {
            Entry::Occupied(mut slot) => {
                if let Some(current) = self.locks.get(slot.get())
                    && current.is_live(now)
                {
                    return Err(StoreError::SlotHeld {
                        expires_at: current.expires_at,
                    });
                }
                slot.insert(lock.token);
                self.locks.insert(lock.token, lock);
            }
            Entry::Vacant(slot) => {
                slot.insert(lock.token);
                self.locks.insert(lock.token, lock);
            }
        }
        Ok(())
    }

    async fn get_lock(&self, token: LockToken) -> Result<Option<Lock>, StoreError> {
        Ok(self.locks.get(&token).map(|l| l.value().clone()))
    }

    async fn live_lock(&self, key: &SlotKey, now: Ms) -> Result<Option<Lock>, StoreError> {
        let Some(token) = self.live_index.get(key).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self
            .locks
            .get(&token)
            .filter(|l| l.is_live(now))
            .map(|l| l.value().clone()))
    }

    async fn live_locks_for(&self, key: &CacheKey, now: Ms) -> Result<Vec<Lock>, StoreError> {
        let tokens: Vec<LockToken> = self
            .live_index
            .iter()
            .filter(|e| e.key().cache_key() == *key)
            .map(|e| *e.value())
            .collect();
        Ok(tokens
            .into_iter()
            .filter_map(|t| self.locks.get(&t).map(|l| l.value().clone()))
            .filter(|l| l.is_live(now))
            .collect())
    }

    async fn set_lock_expiry(&self, token: LockToken, expires_at: Ms, now: Ms) -> Result<bool, StoreError> {
        match self.locks.get_mut(&token) {
            Some(mut lock) if lock.is_live(now) => {
                lock.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, token: LockToken, now: Ms, reason: &str) -> Result<Option<Lock>, StoreError> {
        let (before, key) = {
            let Some(mut lock) = self.locks.get_mut(&token) else {
                return Ok(None);
            };
            let before = lock.clone();
            if lock.released_at.is_none() {
                lock.released_at = Some(now);
                lock.reason = Some(reason.to_string());
            }
            (before, lock.key.clone())
        };
        self.live_index.remove_if(&key, |_, t| *t == token);
        Ok(Some(before))
    }

    async fn expired_locks(&self, now: Ms) -> Result<Vec<Lock>, StoreError> {
        Ok(self
            .locks
            .iter()
            .filter(|l| l.released_at.is_none() && !l.is_live(now))
            .map(|l| l.value().clone())
            .collect())
    }

    async fn prune_released_locks(&self, before: Ms) -> Result<usize, StoreError> {
        let start = self.locks.len();
        self.locks
            .retain(|_, l| l.released_at.is_none_or(|at| at >= before));
        Ok(start - self.locks.len())
    }
}
