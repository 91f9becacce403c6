//! Append-only availability log (`availability_logs`).
//!
//! One record per held/released/expired/check/cache_invalidate event.
//! Client identity is only ever stored as a truncated SHA-256 digest.

mod log;

pub use log::AuditFile;

use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::model::*;

/// Hex chars kept from the identifier digest.
const CLIENT_HASH_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    Held,
    Released,
    Expired,
    Check,
    CacheInvalidate,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Held => "held",
            AuditKind::Released => "released",
            AuditKind::Expired => "expired",
            AuditKind::Check => "check",
            AuditKind::CacheInvalidate => "cache_invalidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: Ms,
    pub kind: AuditKind,
    pub venue_id: VenueId,
    pub service_id: ServiceId,
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM`; absent for whole-day events.
    pub time: Option<String>,
    pub party_size: Option<u32>,
    pub lock_token: Option<String>,
    pub reason: Option<String>,
    pub client_hash: Option<String>,
}

impl AuditEvent {
    pub fn for_day(kind: AuditKind, key: &CacheKey, at: Ms) -> Self {
        Self {
            at,
            kind,
            venue_id: key.venue_id,
            service_id: key.service_id,
            date: key.date.format("%Y-%m-%d").to_string(),
            time: None,
            party_size: None,
            lock_token: None,
            reason: None,
            client_hash: None,
        }
    }

    pub fn for_lock(kind: AuditKind, lock: &Lock, at: Ms) -> Self {
        Self {
            time: Some(lock.key.time.format("%H:%M").to_string()),
            party_size: Some(lock.party_size),
            lock_token: Some(lock.token.to_string()),
            reason: lock.reason.clone(),
            ..Self::for_day(kind, &lock.key.cache_key(), at)
        }
    }

    pub fn with_client(mut self, client_hash: Option<String>) -> Self {
        self.client_hash = client_hash;
        self
    }
}

/// Digest of whatever identifies the caller (IP, user agent, fingerprint).
/// Parts are joined with `|` before hashing. Returns `None` when every part is blank.
pub fn hash_identifier(parts: &[&str]) -> Option<String> {
    if parts.iter().all(|p| p.trim().is_empty()) {
        return None;
    }
    let digest = Sha256::digest(parts.join("|").as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(CLIENT_HASH_LEN);
    Some(hex)
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> io::Result<()>;
}

/// Keeps events in memory. Used when no log file is configured, and by tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub async fn count(&self, kind: AuditKind) -> usize {
        self.events.lock().await.iter().filter(|e| e.kind == kind).count()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn append(&self, event: AuditEvent) -> io::Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_truncated() {
        let a = hash_identifier(&["10.0.0.1", "Mozilla/5.0"]).unwrap();
        let b = hash_identifier(&["10.0.0.1", "Mozilla/5.0"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), CLIENT_HASH_LEN);
        assert!(!a.contains("10.0.0.1"));
        assert_ne!(a, hash_identifier(&["10.0.0.2", "Mozilla/5.0"]).unwrap());
    }

    #[test]
    fn blank_identity_hashes_to_none() {
        assert_eq!(hash_identifier(&["", "  "]), None);
        assert_eq!(hash_identifier(&[]), None);
    }

    #[tokio::test]
    async fn memory_sink_counts_by_kind() {
        let sink = MemorySink::new();
        let key = CacheKey {
            venue_id: 1,
            service_id: 2,
            date: parse_date("2024-06-01").unwrap(),
        };
        sink.append(AuditEvent::for_day(AuditKind::Check, &key, 1)).await.unwrap();
        sink.append(AuditEvent::for_day(AuditKind::CacheInvalidate, &key, 2)).await.unwrap();
        sink.append(AuditEvent::for_day(AuditKind::Check, &key, 3)).await.unwrap();
        assert_eq!(sink.count(AuditKind::Check).await, 2);
        assert_eq!(sink.events().await[1].date, "2024-06-01");
    }
}
