mod allocation;
mod availability;
mod conflict;
mod error;
mod mutations;
mod optimizer;
mod queries;
pub mod store;

pub use allocation::{Allocation, AllocationPass, AllocationTarget, Allocator, FloorPlan, efficiency};
pub use availability::{AvailabilitySlot, DaySnapshot, ServiceAvailability, scan_service};
pub use conflict::{claimed_tables, occupied_tables};
pub use error::EngineError;
pub use mutations::{Committed, LockGrant, ReleaseOutcome};
pub use optimizer::{Alternative, Alternatives, Optimizer, SearchWindow};
pub use queries::AvailabilityView;
pub use store::{Dataset, InMemoryStore, Store, StoreError};

use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::cache::AvailabilityCache;
use crate::config::EngineConfig;
use crate::model::*;

/// A slot as named by a client: text date and time, venue by slug.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRequest {
    pub venue_slug: String,
    pub service_id: ServiceId,
    pub date: String,
    pub time: String,
    pub party_size: u32,
}

/// Input to allocation and booking commit.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    #[serde(flatten)]
    pub slot: SlotRequest,
    #[serde(default)]
    pub duration_minutes: Option<Minute>,
    #[serde(default)]
    pub lock_token: Option<LockToken>,
    /// Online requests may only be seated at online-bookable tables.
    #[serde(default = "online_default")]
    pub online: bool,
    /// Granularity of the alternative-time search.
    #[serde(default)]
    pub search_step_minutes: Option<Minute>,
}

fn online_default() -> bool {
    true
}

/// Venue and service resolved from a `SlotRequest`.
pub(crate) struct ResolvedSlot {
    pub venue: Venue,
    pub service: Service,
    pub key: SlotKey,
}

pub struct Engine {
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn AvailabilityCache>,
    pub audit: Arc<dyn AuditSink>,
    pub config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn AvailabilityCache>,
        audit: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            cache,
            audit,
            config,
        }
    }

    pub(crate) async fn resolve(&self, req: &SlotRequest) -> Result<ResolvedSlot, EngineError> {
        conflict::validate_slug(&req.venue_slug)?;
        conflict::validate_party_size(req.party_size)?;
        let (date, time) = conflict::parse_slot(&req.date, &req.time)?;

        let venue = self
            .store
            .venue_by_slug(&req.venue_slug)
            .await?
            .ok_or_else(|| EngineError::VenueNotFound(req.venue_slug.clone()))?;
        let service = self
            .store
            .service(venue.id, req.service_id)
            .await?
            .ok_or(EngineError::ServiceNotFound(req.service_id))?;

        let key = SlotKey {
            venue_id: venue.id,
            service_id: service.id,
            date,
            time,
        };
        Ok(ResolvedSlot { venue, service, key })
    }

    /// Audit failures never fail the caller.
    pub(crate) async fn record(&self, event: AuditEvent) {
        let kind = event.kind.as_str();
        if let Err(e) = self.audit.append(event).await {
            warn!("audit append failed ({kind}): {e}");
        }
    }

    /// Drop the cached scan for a day. Failures are logged; the entry's own
    /// TTL bounds how long a missed invalidation can linger.
    pub(crate) async fn invalidate(&self, key: &CacheKey, now: Ms) {
        metrics::counter!(crate::observability::CACHE_INVALIDATIONS_TOTAL).increment(1);
        if let Err(e) = self.cache.invalidate(key).await {
            warn!(
                "cache invalidation failed for venue {} service {} on {}: {e}",
                key.venue_id, key.service_id, key.date
            );
        }
        self.record(AuditEvent::for_day(AuditKind::CacheInvalidate, key, now))
            .await;
    }
}
