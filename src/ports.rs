//! Host port allocation for session workers.
//!
//! Ports come from a fixed inclusive range and are bound 1:1 to sessions.
//! The [`PortStore`] is the source of truth, so several controllers sharing
//! one Redis never hand out the same port: reservation is a single atomic
//! check-and-set (`HSETNX`) and a lost race simply moves on to the next
//! candidate.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Redis hash holding `port -> {sessionId, allocatedAt}`.
pub const PORTS_KEY: &str = "byoc:ports";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortAllocation {
    #[serde(skip)]
    pub port: u16,
    pub session_id: String,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("port store error: {0}")]
    Store(#[from] redis::RedisError),
    #[error("corrupt allocation record for port {port}: {reason}")]
    Corrupt { port: String, reason: String },
    #[error("invalid port range {start}..={end}")]
    InvalidRange { start: u16, end: u16 },
}

/// Persisted allocation set.
#[async_trait]
pub trait PortStore: Send + Sync {
    /// Reserve `allocation.port` iff it is not already present. Returns
    /// `false` when another caller holds it.
    async fn try_reserve(&self, allocation: &PortAllocation) -> Result<bool, PortError>;

    /// Remove the reservation for `port`. Missing entries are not an error.
    async fn remove(&self, port: u16) -> Result<(), PortError>;

    /// Every current reservation, ordered by port.
    async fn list(&self) -> Result<Vec<PortAllocation>, PortError>;
}

// ── Stores ─────────────────────────────────────────────────────────

/// In-process store. Only safe for a single controller.
#[derive(Default)]
pub struct MemoryPortStore {
    entries: Mutex<BTreeMap<u16, PortAllocation>>,
}

impl MemoryPortStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PortStore for MemoryPortStore {
    async fn try_reserve(&self, allocation: &PortAllocation) -> Result<bool, PortError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&allocation.port) {
            return Ok(false);
        }
        entries.insert(allocation.port, allocation.clone());
        Ok(true)
    }

    async fn remove(&self, port: u16) -> Result<(), PortError> {
        self.entries.lock().remove(&port);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PortAllocation>, PortError> {
        Ok(self.entries.lock().values().cloned().collect())
    }
}

/// Redis-backed store shared by every controller instance.
#[derive(Clone)]
pub struct RedisPortStore {
    conn: redis::aio::ConnectionManager,
    key: String,
}

impl RedisPortStore {
    pub async fn connect(url: &str) -> Result<Self, PortError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            key: PORTS_KEY.to_string(),
        })
    }
}

fn encode_allocation(allocation: &PortAllocation) -> Result<String, PortError> {
    serde_json::to_string(allocation).map_err(|e| PortError::Corrupt {
        port: allocation.port.to_string(),
        reason: e.to_string(),
    })
}

fn decode_allocation(field: &str, value: &str) -> Result<PortAllocation, PortError> {
    let port: u16 = field.parse().map_err(|_| PortError::Corrupt {
        port: field.to_string(),
        reason: "field is not a port number".into(),
    })?;
    let mut allocation: PortAllocation =
        serde_json::from_str(value).map_err(|e| PortError::Corrupt {
            port: field.to_string(),
            reason: e.to_string(),
        })?;
    allocation.port = port;
    Ok(allocation)
}

#[async_trait]
impl PortStore for RedisPortStore {
    async fn try_reserve(&self, allocation: &PortAllocation) -> Result<bool, PortError> {
        let value = encode_allocation(allocation)?;
        let mut conn = self.conn.clone();
        let inserted: bool = redis::cmd("HSETNX")
            .arg(&self.key)
            .arg(allocation.port)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(inserted)
    }

    async fn remove(&self, port: u16) -> Result<(), PortError> {
        let mut conn = self.conn.clone();
        let _removed: i64 = redis::cmd("HDEL")
            .arg(&self.key)
            .arg(port)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PortAllocation>, PortError> {
        let mut conn = self.conn.clone();
        let raw: Vec<(String, String)> = redis::cmd("HGETALL")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        let mut out = Vec::with_capacity(raw.len());
        for (field, value) in raw {
            match decode_allocation(&field, &value) {
                Ok(a) => out.push(a),
                // A bad record still occupies its port; skip it for listing.
                Err(e) => tracing::warn!(error = %e, "skipping unreadable port record"),
            }
        }
        out.sort_by_key(|a| a.port);
        Ok(out)
    }
}

// ── Manager ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PortManager {
    store: Arc<dyn PortStore>,
    range: RangeInclusive<u16>,
}

impl PortManager {
    pub fn new(store: Arc<dyn PortStore>, start: u16, end: u16) -> Result<Self, PortError> {
        if start > end {
            return Err(PortError::InvalidRange { start, end });
        }
        Ok(Self {
            store,
            range: start..=end,
        })
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    /// Reserve the lowest free port for `session_id`. `None` when the range
    /// is exhausted.
    pub async fn allocate(&self, session_id: &str) -> Result<Option<u16>, PortError> {
        let taken: std::collections::HashSet<u16> =
            self.store.list().await?.into_iter().map(|a| a.port).collect();

        for port in self.range.clone() {
            if taken.contains(&port) {
                continue;
            }
            let allocation = PortAllocation {
                port,
                session_id: session_id.to_string(),
                allocated_at: Utc::now(),
            };
            if self.store.try_reserve(&allocation).await? {
                tracing::debug!(port, session_id, "port allocated");
                return Ok(Some(port));
            }
            // Lost a race with another allocator; keep scanning.
        }
        tracing::warn!(session_id, "port range exhausted");
        Ok(None)
    }

    /// Release `port`. Releasing an unallocated port is a no-op.
    pub async fn release(&self, port: u16) -> Result<(), PortError> {
        self.store.remove(port).await?;
        tracing::debug!(port, "port released");
        Ok(())
    }

    pub async fn list_allocations(&self) -> Result<Vec<PortAllocation>, PortError> {
        self.store.list().await
    }

    /// Reverse lookup used during teardown.
    pub async fn port_for_session(&self, session_id: &str) -> Result<Option<u16>, PortError> {
        Ok(self
            .list_allocations()
            .await?
            .into_iter()
            .find(|a| a.session_id == session_id)
            .map(|a| a.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(start: u16, end: u16) -> PortManager {
        PortManager::new(Arc::new(MemoryPortStore::new()), start, end).unwrap()
    }

    #[tokio::test]
    async fn allocates_lowest_free_port() {
        let pm = manager(8081, 8083);
        assert_eq!(pm.allocate("S1").await.unwrap(), Some(8081));
        assert_eq!(pm.allocate("S2").await.unwrap(), Some(8082));
        pm.release(8081).await.unwrap();
        assert_eq!(pm.allocate("S3").await.unwrap(), Some(8081));
    }

    #[tokio::test]
    async fn exhausted_range_returns_none() {
        let pm = manager(9000, 9001);
        assert!(pm.allocate("a").await.unwrap().is_some());
        assert!(pm.allocate("b").await.unwrap().is_some());
        assert_eq!(pm.allocate("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let pm = manager(9000, 9000);
        pm.release(9000).await.unwrap();
        let port = pm.allocate("S1").await.unwrap().unwrap();
        pm.release(port).await.unwrap();
        pm.release(port).await.unwrap();
        assert!(pm.list_allocations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn allocate_then_release_restores_state() {
        let pm = manager(8081, 8085);
        pm.allocate("keep").await.unwrap();
        let before: Vec<(u16, String)> = pm
            .list_allocations()
            .await
            .unwrap()
            .into_iter()
            .map(|a| (a.port, a.session_id))
            .collect();
        let port = pm.allocate("temp").await.unwrap().unwrap();
        pm.release(port).await.unwrap();
        let after: Vec<(u16, String)> = pm
            .list_allocations()
            .await
            .unwrap()
            .into_iter()
            .map(|a| (a.port, a.session_id))
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn reverse_lookup_finds_session() {
        let pm = manager(8081, 8090);
        pm.allocate("S1").await.unwrap();
        let p2 = pm.allocate("S2").await.unwrap();
        assert_eq!(pm.port_for_session("S2").await.unwrap(), p2);
        assert_eq!(pm.port_for_session("missing").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocations_are_unique() {
        let pm = manager(8081, 8120);
        let mut handles = Vec::new();
        for i in 0..40 {
            let pm = pm.clone();
            handles.push(tokio::spawn(async move {
                pm.allocate(&format!("S{i}")).await.unwrap()
            }));
        }
        let mut ports = Vec::new();
        for h in handles {
            ports.push(h.await.unwrap().expect("range is large enough"));
        }
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 40);
        assert_eq!(pm.allocate("overflow").await.unwrap(), None);
    }

    #[test]
    fn invalid_range_rejected() {
        let result = PortManager::new(Arc::new(MemoryPortStore::new()), 9000, 8000);
        assert!(matches!(result, Err(PortError::InvalidRange { .. })));
    }

    #[test]
    fn allocation_record_round_trips_through_hash_field() {
        let allocation = PortAllocation {
            port: 8081,
            session_id: "S1".into(),
            allocated_at: Utc::now(),
        };
        let value = encode_allocation(&allocation).unwrap();
        assert!(value.contains("\"sessionId\":\"S1\""));
        let decoded = decode_allocation("8081", &value).unwrap();
        assert_eq!(decoded, allocation);
    }

    #[test]
    fn non_numeric_field_is_corrupt() {
        assert!(matches!(
            decode_allocation("abc", "{}"),
            Err(PortError::Corrupt { .. })
        ));
    }
}
