use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::db::CompanyRecord;
use crate::error::StoreError;

pub fn company_key(idno: &str) -> String {
    format!("company:{}", idno)
}

pub fn status_key(idno: &str) -> String {
    format!("scraping_status:{}", idno)
}

/// Minimal expiring key/value contract. Expired keys read as absent.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process expiring map. Expired entries are dropped lazily on read and by `purge_expired`.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| StoreError::Unavailable(format!("ttl of {}s out of range", ttl.as_secs())))?;
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        if let Some(e) = self.entries.get(key) {
            if e.expires_at > now {
                return Ok(Some(e.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, e| e.expires_at <= now);
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Company-record cache plus the per-identifier status marker.
#[derive(Clone)]
pub struct CacheStore {
    kv: Arc<dyn KeyValueStore>,
    record_ttl: Duration,
    status_ttl: Duration,
}

impl CacheStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, record_ttl: Duration, status_ttl: Duration) -> Self {
        Self {
            kv,
            record_ttl,
            status_ttl,
        }
    }

    pub async fn get(&self, idno: &str) -> Result<Option<CompanyRecord>, StoreError> {
        let Some(raw) = self.kv.get(&company_key(idno)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // Unreadable entries behave like a miss so the next run overwrites them.
                warn!(idno = %idno, error = %e, "discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    pub async fn set(&self, record: &CompanyRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record)
            .map_err(|e| StoreError::Unavailable(format!("serialize record: {}", e)))?;
        self.kv
            .set_ex(&company_key(&record.idno), raw, self.record_ttl)
            .await?;
        debug!(idno = %record.idno, ttl_secs = self.record_ttl.as_secs(), "cached record");
        Ok(())
    }

    pub async fn delete(&self, idno: &str) -> Result<(), StoreError> {
        self.kv.delete(&company_key(idno)).await
    }

    pub async fn set_status(&self, idno: &str, status: &str) -> Result<(), StoreError> {
        self.kv
            .set_ex(&status_key(idno), status.to_string(), self.status_ttl)
            .await
    }

    pub async fn status(&self, idno: &str) -> Result<Option<String>, StoreError> {
        self.kv.get(&status_key(idno)).await
    }
}

// ── Tests ──
