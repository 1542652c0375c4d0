//! Identity resolver (C2): (device_uuid, sensor_uuid) -> sensor_id, LRU+TTL cache.
//!
//! Grounded on `original_source/ingest_api/pipelines/sensor_resolver.py`, which keys a
//! plain `OrderedDict` by the lowercased pair — no external LRU crate is used there or
//! anywhere in this codebase's dependency stack, so the cache here is hand-rolled rather
//! than pulled from `lru`.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_TTL_SECONDS: i64 = 300;

type Key = (String, String);

struct Entry {
    sensor_id: i64,
    expires_at: DateTime<Utc>,
}

/// Ordered-by-recency cache: `order` holds keys from least- to most-recently-used.
struct CacheState {
    entries: HashMap<Key, Entry>,
    order: Vec<Key>,
}

impl CacheState {
    fn touch(&mut self, key: &Key) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos);
            self.order.push(k);
        }
    }

    fn insert(&mut self, key: Key, sensor_id: i64, expires_at: DateTime<Utc>, capacity: usize) {
        if self.entries.contains_key(&key) {
            self.entries.insert(key.clone(), Entry { sensor_id, expires_at });
            self.touch(&key);
            return;
        }
        if self.entries.len() >= capacity {
            if !self.order.is_empty() {
                let evicted = self.order.remove(0);
                self.entries.remove(&evicted);
            }
        }
        self.entries.insert(key.clone(), Entry { sensor_id, expires_at });
        self.order.push(key);
    }
}

pub struct IdentityResolver {
    pool: PgPool,
    capacity: usize,
    ttl: Duration,
    state: Mutex<CacheState>,
}

fn normalize(device_uuid: Uuid, sensor_uuid: Uuid) -> Key {
    (
        device_uuid.to_string().to_lowercase(),
        sensor_uuid.to_string().to_lowercase(),
    )
}

impl IdentityResolver {
    pub fn new(pool: PgPool, capacity: usize, ttl_seconds: i64) -> Self {
        Self {
            pool,
            capacity,
            ttl: Duration::seconds(ttl_seconds),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    pub async fn cache_size(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    async fn cache_lookup(&self, key: &Key) -> Option<i64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some(entry) = state.entries.get(key) {
            if entry.expires_at > now {
                let sensor_id = entry.sensor_id;
                state.touch(key);
                return Some(sensor_id);
            }
        }
        None
    }

    async fn cache_insert(&self, key: Key, sensor_id: i64) {
        let expires_at = Utc::now() + self.ttl;
        let mut state = self.state.lock().await;
        state.insert(key, sensor_id, expires_at, self.capacity);
    }

    /// Single-pair resolve: cache hit, else Q-RESOLVE against persistence.
    pub async fn resolve(&self, device_uuid: Uuid, sensor_uuid: Uuid) -> anyhow::Result<Option<i64>> {
        let key = normalize(device_uuid, sensor_uuid);
        if let Some(id) = self.cache_lookup(&key).await {
            return Ok(Some(id));
        }

        // Q-RESOLVE: the single sensors.id whose sensor belongs to the device.
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT s.id FROM sensors s JOIN devices d ON d.id = s.device_id \
             WHERE d.device_uuid = $1 AND s.sensor_uuid = $2",
        )
        .bind(device_uuid)
        .bind(sensor_uuid)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((sensor_id,)) = row {
            self.cache_insert(key, sensor_id).await;
            Ok(Some(sensor_id))
        } else {
            Ok(None)
        }
    }

    /// Batch resolve: partition into cache hits/misses, issue one Q-RESOLVE-BATCH for
    /// the misses. Falls back to per-key resolution if the batch query fails.
    pub async fn resolve_batch(
        &self,
        pairs: &[(Uuid, Uuid)],
    ) -> anyhow::Result<HashMap<(Uuid, Uuid), Option<i64>>> {
        let mut result = HashMap::with_capacity(pairs.len());
        let mut misses = Vec::new();

        for &(device_uuid, sensor_uuid) in pairs {
            let key = normalize(device_uuid, sensor_uuid);
            if let Some(id) = self.cache_lookup(&key).await {
                result.insert((device_uuid, sensor_uuid), Some(id));
            } else {
                misses.push((device_uuid, sensor_uuid));
            }
        }

        if misses.is_empty() {
            return Ok(result);
        }

        let device_uuids: Vec<Uuid> = misses.iter().map(|(d, _)| *d).collect();
        let sensor_uuids: Vec<Uuid> = misses.iter().map(|(_, s)| *s).collect();

        let rows: sqlx::Result<Vec<(Uuid, Uuid, i64)>> = sqlx::query_as(
            "SELECT d.device_uuid, s.sensor_uuid, s.id FROM sensors s \
             JOIN devices d ON d.id = s.device_id \
             WHERE (d.device_uuid, s.sensor_uuid) IN ( \
                 SELECT * FROM UNNEST($1::uuid[], $2::uuid[]) \
             )",
        )
        .bind(&device_uuids)
        .bind(&sensor_uuids)
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => {
                let mut found: HashMap<(Uuid, Uuid), i64> = HashMap::new();
                for (device_uuid, sensor_uuid, sensor_id) in rows {
                    self.cache_insert(normalize(device_uuid, sensor_uuid), sensor_id).await;
                    found.insert((device_uuid, sensor_uuid), sensor_id);
                }
                for pair in misses {
                    result.insert(pair, found.get(&pair).copied());
                }
                Ok(result)
            }
            Err(err) => {
                tracing::warn!(error = %err, "Q-RESOLVE-BATCH failed, falling back to per-key resolve");
                for (device_uuid, sensor_uuid) in misses {
                    let id = self.resolve(device_uuid, sensor_uuid).await?;
                    result.insert((device_uuid, sensor_uuid), id);
                }
                Ok(result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_of(i: u8) -> Key {
        (format!("device-{i}"), format!("sensor-{i}"))
    }

    #[test]
    fn lru_eviction_evicts_oldest_first() {
        let mut state = CacheState {
            entries: HashMap::new(),
            order: Vec::new(),
        };
        let far_future = Utc::now() + Duration::seconds(300);
        for i in 0..3u8 {
            state.insert(key_of(i), i as i64, far_future, 3);
        }
        // capacity 3, insert a 4th distinct key with no hits in between
        state.insert(key_of(3), 3, far_future, 3);
        assert!(!state.entries.contains_key(&key_of(0)));
        assert!(state.entries.contains_key(&key_of(1)));
        assert!(state.entries.contains_key(&key_of(2)));
        assert!(state.entries.contains_key(&key_of(3)));
        assert_eq!(state.entries.len(), 3);
    }

    #[test]
    fn touch_promotes_to_most_recently_used() {
        let mut state = CacheState {
            entries: HashMap::new(),
            order: Vec::new(),
        };
        let far_future = Utc::now() + Duration::seconds(300);
        for i in 0..3u8 {
            state.insert(key_of(i), i as i64, far_future, 3);
        }
        state.touch(&key_of(0));
        state.insert(key_of(3), 3, far_future, 3);
        // key 0 was touched so key 1 (now oldest) should be evicted instead
        assert!(state.entries.contains_key(&key_of(0)));
        assert!(!state.entries.contains_key(&key_of(1)));
    }
}
