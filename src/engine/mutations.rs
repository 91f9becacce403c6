use serde::Serialize;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::audit::{AuditEvent, AuditKind};
use crate::limits::*;
use crate::model::*;
use crate::observability as obs;

use super::allocation::Allocation;
use super::conflict::{now_ms, validate_duration};
use super::store::StoreError;
use super::{BookingRequest, Engine, EngineError, SlotRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub token: LockToken,
    pub created_at: Ms,
    pub expires_at: Ms,
    pub hold_minutes: i64,
}

/// What a release found. Never an error: release is best effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    AlreadyReleased,
    NotFound,
    /// The store failed; the hold will lapse on its own.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Committed {
    pub booking_id: BookingId,
    pub allocation: Allocation,
}

impl Engine {
    pub async fn create_lock(&self, req: &SlotRequest, client: Option<String>) -> Result<LockGrant, EngineError> {
        self.create_lock_at(req, client, now_ms()).await
    }

    pub async fn create_lock_at(
        &self,
        req: &SlotRequest,
        client: Option<String>,
        now: Ms,
    ) -> Result<LockGrant, EngineError> {
        let slot = self.resolve(req).await?;
        let lock = Lock {
            token: Ulid::new(),
            key: slot.key,
            party_size: req.party_size,
            created_at: now,
            expires_at: now + self.config.hold_ttl_ms,
            released_at: None,
            reason: None,
        };

        match self.store.insert_lock_if_free(lock.clone(), now).await {
            Ok(()) => {}
            Err(StoreError::SlotHeld { expires_at }) => {
                metrics::counter!(obs::LOCKS_CONFLICTED_TOTAL).increment(1);
                debug!(
                    "slot {} {} {} already held until {expires_at}",
                    slot.venue.slug, lock.key.date, lock.key.time
                );
                return Err(EngineError::SlotLocked { expires_at });
            }
            Err(e) => return Err(e.into()),
        }

        metrics::counter!(obs::LOCKS_CREATED_TOTAL).increment(1);
        self.invalidate(&lock.key.cache_key(), now).await;
        self.record(AuditEvent::for_lock(AuditKind::Held, &lock, now).with_client(client))
            .await;

        Ok(LockGrant {
            token: lock.token,
            created_at: lock.created_at,
            expires_at: lock.expires_at,
            hold_minutes: self.config.hold_minutes(),
        })
    }

    pub async fn extend_lock(&self, token: LockToken) -> Result<Ms, EngineError> {
        self.extend_lock_at(token, now_ms()).await
    }

    /// New expiry is `min(now + step, created_at + ttl)`: a hold never
    /// outlives its original window.
    pub async fn extend_lock_at(&self, token: LockToken, now: Ms) -> Result<Ms, EngineError> {
        let lock = self
            .store
            .get_lock(token)
            .await?
            .ok_or(EngineError::LockNotFound(token))?;
        if lock.released_at.is_some() {
            return Err(EngineError::LockNotFound(token));
        }
        if !lock.is_live(now) {
            return Err(EngineError::LockExpired(token));
        }

        let expires_at = (now + self.config.extend_step_ms).min(lock.created_at + self.config.hold_ttl_ms);
        if !self.store.set_lock_expiry(token, expires_at, now).await? {
            // Released or lapsed between the read and the write.
            return Err(EngineError::LockExpired(token));
        }
        metrics::counter!(obs::LOCKS_EXTENDED_TOTAL).increment(1);
        Ok(expires_at)
    }

    pub async fn release_lock(&self, token: LockToken, reason: Option<&str>) -> ReleaseOutcome {
        self.release_lock_at(token, reason, now_ms()).await
    }

    pub async fn release_lock_at(&self, token: LockToken, reason: Option<&str>, now: Ms) -> ReleaseOutcome {
        let reason = reason_or(reason, "user");
        let before = match self.store.release_lock(token, now, &reason).await {
            Ok(Some(before)) => before,
            Ok(None) => return ReleaseOutcome::NotFound,
            Err(e) => {
                warn!("release of lock {token} failed: {e}");
                return ReleaseOutcome::Failed;
            }
        };

        self.invalidate(&before.key.cache_key(), now).await;
        if before.released_at.is_some() {
            return ReleaseOutcome::AlreadyReleased;
        }
        metrics::counter!(obs::LOCKS_RELEASED_TOTAL).increment(1);
        let released = Lock {
            released_at: Some(now),
            reason: Some(reason),
            ..before
        };
        self.record(AuditEvent::for_lock(AuditKind::Released, &released, now))
            .await;
        ReleaseOutcome::Released
    }

    pub async fn commit_booking(&self, req: &BookingRequest) -> Result<Committed, EngineError> {
        self.commit_booking_at(req, now_ms()).await
    }

    /// Allocate and persist. The store's conditional insert is the arbiter;
    /// losing it to a concurrent commit re-runs allocation a bounded number
    /// of times.
    pub async fn commit_booking_at(&self, req: &BookingRequest, now: Ms) -> Result<Committed, EngineError> {
        let slot = self.resolve(&req.slot).await?;
        let duration = req
            .duration_minutes
            .or(slot.service.duration_minutes)
            .unwrap_or(self.config.default_duration);
        validate_duration(duration)?;
        self.check_hold(&slot.key, req.lock_token, now).await?;

        let mut attempt = 0;
        let (booking_id, allocation) = loop {
            attempt += 1;
            let allocation = self.plan(&slot, req, duration).await?;
            let (table_id, join_group_id) = allocation.target.booking_refs();
            let booking = Booking {
                id: Ulid::new(),
                venue_id: slot.venue.id,
                service_id: slot.service.id,
                table_id,
                join_group_id,
                party_size: req.slot.party_size,
                date: slot.key.date,
                time: slot.key.time,
                duration_minutes: Some(duration),
                status: BookingStatus::Confirmed,
            };
            let id = booking.id;
            match self
                .store
                .insert_booking_if_free(booking, self.config.default_duration)
                .await
            {
                Ok(()) => break (id, allocation),
                Err(StoreError::TableTaken(table)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    debug!("table {table} taken concurrently, retrying allocation ({attempt})");
                }
                Err(StoreError::TableTaken(_)) => {
                    return Err(EngineError::Store("allocation kept losing to concurrent commits".into()));
                }
                Err(e) => return Err(e.into()),
            }
        };

        metrics::counter!(obs::BOOKINGS_COMMITTED_TOTAL).increment(1);
        info!(
            "booking {booking_id} committed at {} {} {} via {}",
            slot.venue.slug,
            slot.key.date,
            slot.key.time,
            allocation.pass.as_str()
        );

        // A release that found the row already invalidated this day.
        let released = match req.lock_token {
            Some(token) => self.release_lock_at(token, Some("committed"), now).await,
            None => ReleaseOutcome::NotFound,
        };
        if !matches!(released, ReleaseOutcome::Released | ReleaseOutcome::AlreadyReleased) {
            self.invalidate(&slot.key.cache_key(), now).await;
        }
        Ok(Committed {
            booking_id,
            allocation,
        })
    }

    /// A committing caller must either own the live hold on the slot or
    /// find the slot unheld.
    async fn check_hold(&self, key: &SlotKey, token: Option<LockToken>, now: Ms) -> Result<(), EngineError> {
        if let Some(token) = token {
            let lock = self
                .store
                .get_lock(token)
                .await?
                .ok_or(EngineError::LockNotFound(token))?;
            if lock.key != *key {
                return Err(EngineError::InvalidRequest("lockToken does not cover this slot".into()));
            }
            if !lock.is_live(now) {
                return Err(EngineError::LockExpired(token));
            }
            return Ok(());
        }
        match self.store.live_lock(key, now).await? {
            Some(other) => Err(EngineError::SlotLocked {
                expires_at: other.expires_at,
            }),
            None => Ok(()),
        }
    }

    /// Cancelling an already finished, cancelled or no-show booking is a no-op.
    pub async fn cancel_booking(&self, id: BookingId) -> Result<(), EngineError> {
        self.cancel_booking_at(id, now_ms()).await
    }

    pub async fn cancel_booking_at(&self, id: BookingId, now: Ms) -> Result<(), EngineError> {
        let booking = self
            .store
            .get_booking(id)
            .await?
            .ok_or(EngineError::BookingNotFound(id))?;
        if booking.status.is_terminal() {
            return Ok(());
        }
        self.store
            .set_booking_status(id, BookingStatus::Cancelled)
            .await?
            .ok_or(EngineError::BookingNotFound(id))?;
        metrics::counter!(obs::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!("booking {id} cancelled");
        self.invalidate(&booking.cache_key(), now).await;
        Ok(())
    }

    /// Mark lapsed holds released, then drop rows released long ago.
    /// Returns how many holds were reaped.
    pub async fn reap_expired(&self, now: Ms) -> Result<usize, EngineError> {
        let mut reaped = 0;
        for lock in self.store.expired_locks(now).await? {
            let Some(before) = self.store.release_lock(lock.token, now, "expired").await? else {
                continue;
            };
            if before.released_at.is_some() {
                continue;
            }
            reaped += 1;
            let expired = Lock {
                released_at: Some(now),
                reason: Some("expired".into()),
                ..before
            };
            self.record(AuditEvent::for_lock(AuditKind::Expired, &expired, now))
                .await;
            self.invalidate(&expired.key.cache_key(), now).await;
        }
        if reaped > 0 {
            metrics::counter!(obs::LOCKS_REAPED_TOTAL).increment(reaped as u64);
        }

        let pruned = self
            .store
            .prune_released_locks(now - RELEASED_LOCK_RETENTION_MS)
            .await?;
        if pruned > 0 {
            debug!("pruned {pruned} released locks");
        }
        Ok(reaped)
    }
}

fn reason_or(reason: Option<&str>, default: &str) -> String {
    let reason = reason.map(str::trim).filter(|r| !r.is_empty()).unwrap_or(default);
    reason.chars().take(MAX_REASON_LEN).collect()
}
