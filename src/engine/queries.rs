use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};

use crate::audit::{AuditEvent, AuditKind};
use crate::limits::*;
use crate::model::*;
use crate::observability as obs;

use super::allocation::{Allocation, Allocator, FloorPlan};
use super::availability::{DaySnapshot, ServiceAvailability, scan_service};
use super::conflict::{now_ms, occupied_tables, validate_duration, validate_slug};
use super::optimizer::{Optimizer, SearchWindow};
use super::{BookingRequest, Engine, EngineError, ResolvedSlot};

#[derive(Debug, Clone, Serialize)]
pub struct AvailabilityView {
    /// Served from the cache rather than recomputed.
    pub cached: bool,
    pub availability: ServiceAvailability,
}

impl Engine {
    pub async fn load_floor(&self, venue_id: VenueId, party_size: u32) -> Result<FloorPlan, EngineError> {
        Ok(FloorPlan {
            tables: self.store.tables(venue_id).await?,
            groups: self.store.join_groups(venue_id).await?,
            priorities: self.store.priorities(venue_id, party_size).await?,
        })
    }

    /// Dry run: what a commit would pick right now. Writes nothing.
    pub async fn allocate_table(&self, req: &BookingRequest) -> Result<Allocation, EngineError> {
        let slot = self.resolve(&req.slot).await?;
        let duration = req
            .duration_minutes
            .or(slot.service.duration_minutes)
            .unwrap_or(self.config.default_duration);
        validate_duration(duration)?;
        self.plan(&slot, req, duration).await
    }

    /// Priority pass, then fallback; on failure, nearby alternatives.
    pub(crate) async fn plan(
        &self,
        slot: &ResolvedSlot,
        req: &BookingRequest,
        duration: Minute,
    ) -> Result<Allocation, EngineError> {
        let party_size = req.slot.party_size;
        let floor = self.load_floor(slot.venue.id, party_size).await?;
        let bookings = self.store.bookings_on(slot.venue.id, slot.key.date).await?;
        let allocator = Allocator::new(&floor, self.config.large_party_threshold, req.online);

        let requested = minute_of_day(slot.key.time);
        let span = Span::starting_at(requested, duration);
        let occupied = occupied_tables(&bookings, &floor.groups, &span, self.config.default_duration);
        if let Some(allocation) = allocator.allocate(party_size, &occupied) {
            metrics::counter!(obs::ALLOCATIONS_TOTAL, "pass" => allocation.pass.as_str()).increment(1);
            return Ok(allocation);
        }
        metrics::counter!(obs::ALLOCATIONS_TOTAL, "pass" => "none").increment(1);

        let (opens, last_seating) = slot.service.window();
        let step = req
            .search_step_minutes
            .map(|s| s.clamp(MIN_SEARCH_STEP_MINUTES, MAX_SEARCH_STEP_MINUTES))
            .unwrap_or(self.config.search_step);
        let search = SearchWindow {
            requested,
            duration,
            reach: self.config.search_window,
            step,
            opens,
            last_seating,
            min_flex: self.config.min_flex_duration,
        };
        let alternatives = Optimizer::new(&allocator, &bookings, self.config.default_duration)
            .suggest(party_size, &search);
        debug!(
            "no table for {party_size} at {} {}; {} earlier, {} later, {} flexible",
            slot.key.date,
            slot.key.time,
            alternatives.earlier.len(),
            alternatives.later.len(),
            alternatives.flexible.len()
        );
        Err(EngineError::NoTableAvailable(Box::new(alternatives)))
    }

    pub async fn availability(
        &self,
        venue_slug: &str,
        service_id: ServiceId,
        date: &str,
    ) -> Result<AvailabilityView, EngineError> {
        self.availability_at(venue_slug, service_id, date, now_ms()).await
    }

    pub async fn availability_at(
        &self,
        venue_slug: &str,
        service_id: ServiceId,
        date: &str,
        now: Ms,
    ) -> Result<AvailabilityView, EngineError> {
        validate_slug(venue_slug)?;
        let date: NaiveDate =
            parse_date(date).ok_or_else(|| EngineError::InvalidRequest(format!("invalid date: {date}")))?;
        let venue = self
            .store
            .venue_by_slug(venue_slug)
            .await?
            .ok_or_else(|| EngineError::VenueNotFound(venue_slug.to_string()))?;
        let service = self
            .store
            .service(venue.id, service_id)
            .await?
            .ok_or(EngineError::ServiceNotFound(service_id))?;
        let key = CacheKey {
            venue_id: venue.id,
            service_id,
            date,
        };

        let cached = match self.cache.get(&key, now).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!("cache read failed, recomputing: {e}");
                None
            }
        };

        let view = match cached {
            Some(mut availability) => {
                metrics::counter!(obs::CACHE_HITS_TOTAL).increment(1);
                availability.refresh_holds(now);
                AvailabilityView {
                    cached: true,
                    availability,
                }
            }
            None => {
                metrics::counter!(obs::CACHE_MISSES_TOTAL).increment(1);
                let generation = match self.cache.generation(&key).await {
                    Ok(g) => Some(g),
                    Err(e) => {
                        warn!("cache generation read failed, not caching this scan: {e}");
                        None
                    }
                };
                let tables = self.store.tables(venue.id).await?;
                let groups = self.store.join_groups(venue.id).await?;
                let bookings = self.store.bookings_on(venue.id, date).await?;
                let locks = self.store.live_locks_for(&key, now).await?;
                let availability = scan_service(
                    &DaySnapshot {
                        service: &service,
                        date,
                        tables: &tables,
                        groups: &groups,
                        bookings: &bookings,
                        locks: &locks,
                    },
                    self.config.default_duration,
                    now,
                );
                if let Some(generation) = generation {
                    match self.cache.put(key, availability.clone(), generation, now).await {
                        Ok(true) => {}
                        Ok(false) => debug!("scan of {key:?} raced an invalidation, not cached"),
                        Err(e) => warn!("cache write failed: {e}"),
                    }
                }
                AvailabilityView {
                    cached: false,
                    availability,
                }
            }
        };

        self.record(AuditEvent::for_day(AuditKind::Check, &key, now)).await;
        Ok(view)
    }
}
