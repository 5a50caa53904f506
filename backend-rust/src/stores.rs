//! # stores
//!
//! The two authoritative shared stores of the engine: the expiring
//! spatial index and the per-vehicle last-sample store. Both come in two
//! flavors behind one enum:
//!
//! - `Redis` — the deployed mode. The spatial set is a Redis geo key
//!   (`GEOADD` / `GEORADIUSBYMEMBER`), per-member expiry lives in a
//!   companion ZSET scored by deadline epoch-ms, and telemetry payloads
//!   are plain keys with native `EX` expiry.
//! - `Memory` — single-process mode for local development and tests,
//!   with identical TTL semantics on in-process maps.
//!
//! A vehicle's geo entry and telemetry entry are written through one
//! upsert boundary in the ingress pipeline; the stores themselves make
//! no cross-key guarantees.

use std::time::Duration;

use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::geo::{Coord, RadiusOptions, RadiusOrder, Unit};
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use v2v_types::geo::{great_circle_m, LatLon};
use v2v_types::TelemetrySample;

/// Contract cap on radius query results.
pub const MAX_RADIUS_RESULTS: usize = 50;

const GEO_KEY: &str = "v2v:geo";
const GEO_EXPIRY_KEY: &str = "v2v:geo:exp";
const TELEMETRY_PREFIX: &str = "v2v:last:";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Geo index ─────────────────────────────────────────────────────────────────

struct GeoEntry {
    pos: LatLon,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryGeoIndex {
    entries: DashMap<String, GeoEntry>,
}

impl MemoryGeoIndex {
    fn upsert(&self, id: &str, pos: LatLon, ttl: Duration) {
        self.entries.insert(
            id.to_string(),
            GeoEntry {
                pos,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn radius_by_member(&self, id: &str, radius_m: f64, max: usize) -> Vec<String> {
        let now = Instant::now();
        let center = match self.entries.get(id) {
            Some(e) if e.expires_at > now => e.pos,
            _ => return Vec::new(),
        };

        let mut hits: Vec<(String, f64)> = self
            .entries
            .iter()
            .filter(|e| e.expires_at > now)
            .filter_map(|e| {
                let d = great_circle_m(center, e.pos);
                (d <= radius_m).then(|| (e.key().clone(), d))
            })
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        hits.truncate(max);
        hits.into_iter().map(|(id, _)| id).collect()
    }

    fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct RedisGeoIndex {
    conn: ConnectionManager,
}

impl RedisGeoIndex {
    async fn upsert(&self, id: &str, pos: LatLon, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let deadline = now_epoch_ms() + ttl.as_millis() as i64;
        let _: () = redis::pipe()
            .geo_add(GEO_KEY, (Coord::lon_lat(pos.lon, pos.lat), id))
            .ignore()
            .zadd(GEO_EXPIRY_KEY, id, deadline)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn radius_by_member(
        &self,
        id: &str,
        radius_m: f64,
        max: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let now = now_epoch_ms();

        // Unknown or already-expired query member → empty, not an error.
        let deadline: Option<i64> = conn.zscore(GEO_EXPIRY_KEY, id).await?;
        match deadline {
            Some(d) if d > now => {}
            _ => return Ok(Vec::new()),
        }

        let opts = RadiusOptions::default().order(RadiusOrder::Asc).limit(max);
        let ids: Vec<String> = match conn
            .geo_radius_by_member(GEO_KEY, id, radius_m, Unit::Meters, opts)
            .await
        {
            Ok(ids) => ids,
            // The member can disappear between the deadline check and the
            // query (concurrent sweep); that is an empty neighborhood.
            Err(e) if e.kind() == redis::ErrorKind::ResponseError => {
                debug!("geo radius for absent member {id}: {e}");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        if ids.is_empty() {
            return Ok(ids);
        }

        let mut pipe = redis::pipe();
        for m in &ids {
            pipe.zscore(GEO_EXPIRY_KEY, m);
        }
        let deadlines: Vec<Option<i64>> = pipe.query_async(&mut conn).await?;

        Ok(ids
            .into_iter()
            .zip(deadlines)
            .filter_map(|(m, d)| matches!(d, Some(d) if d > now).then_some(m))
            .collect())
    }

    async fn sweep(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let now = now_epoch_ms();
        let expired: Vec<String> = conn.zrangebyscore(GEO_EXPIRY_KEY, "-inf", now).await?;
        if expired.is_empty() {
            return Ok(());
        }
        let _: () = redis::pipe()
            .zrem(GEO_KEY, &expired)
            .ignore()
            .zrem(GEO_EXPIRY_KEY, &expired)
            .ignore()
            .query_async(&mut conn)
            .await?;
        debug!("geo sweep evicted {} members", expired.len());
        Ok(())
    }
}

/// Expiring spatial index keyed by vehicle id.
pub enum GeoIndex {
    Memory(MemoryGeoIndex),
    Redis(RedisGeoIndex),
}

impl GeoIndex {
    pub fn memory() -> Self {
        Self::Memory(MemoryGeoIndex::default())
    }

    pub fn redis(conn: ConnectionManager) -> Self {
        Self::Redis(RedisGeoIndex { conn })
    }

    pub async fn upsert(&self, id: &str, pos: LatLon, ttl: Duration) -> Result<(), StoreError> {
        match self {
            Self::Memory(m) => {
                m.upsert(id, pos, ttl);
                Ok(())
            }
            Self::Redis(r) => r.upsert(id, pos, ttl).await,
        }
    }

    /// Ids within `radius_m` of the given member, the member itself
    /// included, at most `max` results. Unknown member → empty.
    pub async fn radius_by_member(
        &self,
        id: &str,
        radius_m: f64,
        max: usize,
    ) -> Result<Vec<String>, StoreError> {
        match self {
            Self::Memory(m) => Ok(m.radius_by_member(id, radius_m, max)),
            Self::Redis(r) => r.radius_by_member(id, radius_m, max).await,
        }
    }

    pub async fn sweep(&self) {
        match self {
            Self::Memory(m) => m.sweep(),
            Self::Redis(r) => {
                if let Err(e) = r.sweep().await {
                    warn!("geo sweep failed: {e}");
                }
            }
        }
    }
}

// ── Telemetry store ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryTelemetryStore {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryTelemetryStore {
    fn put(&self, id: &str, payload: String, ttl: Duration) {
        self.entries
            .insert(id.to_string(), (payload, Instant::now() + ttl));
    }

    fn get(&self, id: &str) -> Option<String> {
        let e = self.entries.get(id)?;
        (e.1 > Instant::now()).then(|| e.0.clone())
    }

    fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

pub struct RedisTelemetryStore {
    conn: ConnectionManager,
}

impl RedisTelemetryStore {
    async fn put(&self, id: &str, payload: String, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = format!("{TELEMETRY_PREFIX}{id}");
        let _: () = conn.set_ex(key, payload, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn mget(&self, ids: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{TELEMETRY_PREFIX}{id}"))
            .collect();
        let vals: Vec<Option<String>> = conn.mget(keys).await?;
        Ok(vals)
    }
}

/// Per-vehicle last-known sample with per-key TTL.
pub enum TelemetryStore {
    Memory(MemoryTelemetryStore),
    Redis(RedisTelemetryStore),
}

impl TelemetryStore {
    pub fn memory() -> Self {
        Self::Memory(MemoryTelemetryStore::default())
    }

    pub fn redis(conn: ConnectionManager) -> Self {
        Self::Redis(RedisTelemetryStore { conn })
    }

    pub async fn put(
        &self,
        id: &str,
        sample: &TelemetrySample,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(sample).unwrap_or_default();
        match self {
            Self::Memory(m) => {
                m.put(id, payload, ttl);
                Ok(())
            }
            Self::Redis(r) => r.put(id, payload, ttl).await,
        }
    }

    /// Order-preserving batch fetch; missing, expired, or undecodable
    /// entries come back as `None`.
    pub async fn mget(&self, ids: &[String]) -> Result<Vec<Option<TelemetrySample>>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw = match self {
            Self::Memory(m) => ids.iter().map(|id| m.get(id)).collect::<Vec<_>>(),
            Self::Redis(r) => r.mget(ids).await?,
        };
        Ok(raw
            .into_iter()
            .zip(ids)
            .map(|(payload, id)| {
                let payload = payload?;
                match serde_json::from_str::<TelemetrySample>(&payload) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        debug!("undecodable stored sample for {id}: {e}");
                        None
                    }
                }
            })
            .collect())
    }

    pub async fn sweep(&self) {
        if let Self::Memory(m) = self {
            m.sweep();
        }
        // Redis mode expires keys natively.
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(id: &str, lat: f64, lon: f64) -> TelemetrySample {
        TelemetrySample::from_message(&json!({
            "userId": id, "latitude": lat, "longitude": lon, "speed": 1.0
        }))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn radius_query_includes_self() {
        let geo = GeoIndex::memory();
        geo.upsert("a", LatLon::new(0.0, 0.0), Duration::from_secs(30))
            .await
            .unwrap();
        let ids = geo.radius_by_member("a", 0.0, MAX_RADIUS_RESULTS).await.unwrap();
        assert_eq!(ids, vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn radius_query_unknown_member_is_empty() {
        let geo = GeoIndex::memory();
        geo.upsert("a", LatLon::new(0.0, 0.0), Duration::from_secs(30))
            .await
            .unwrap();
        let ids = geo.radius_by_member("ghost", 100.0, 50).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn radius_query_filters_by_distance_and_caps_results() {
        let geo = GeoIndex::memory();
        let ttl = Duration::from_secs(30);
        geo.upsert("center", LatLon::new(0.0, 0.0), ttl).await.unwrap();
        // ~55 m, ~111 m, ~445 m east of center
        geo.upsert("near", LatLon::new(0.0, 0.0005), ttl).await.unwrap();
        geo.upsert("mid", LatLon::new(0.0, 0.001), ttl).await.unwrap();
        geo.upsert("far", LatLon::new(0.0, 0.004), ttl).await.unwrap();

        let ids = geo.radius_by_member("center", 200.0, 50).await.unwrap();
        assert_eq!(ids, vec!["center", "near", "mid"]);

        let ids = geo.radius_by_member("center", 200.0, 2).await.unwrap();
        assert_eq!(ids, vec!["center", "near"]);
    }

    #[tokio::test(start_paused = true)]
    async fn geo_entries_expire_independently() {
        let geo = GeoIndex::memory();
        geo.upsert("a", LatLon::new(0.0, 0.0), Duration::from_secs(10))
            .await
            .unwrap();
        geo.upsert("b", LatLon::new(0.0, 0.0001), Duration::from_secs(30))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        // a is expired: as query member → empty; as b's neighbor → gone
        assert!(geo.radius_by_member("a", 100.0, 50).await.unwrap().is_empty());
        assert_eq!(
            geo.radius_by_member("b", 100.0, 50).await.unwrap(),
            vec!["b".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_expired_geo_entries() {
        let geo = GeoIndex::memory();
        geo.upsert("a", LatLon::new(0.0, 0.0), Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        geo.sweep().await;
        if let GeoIndex::Memory(m) = &geo {
            assert_eq!(m.len(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_mget_preserves_order_with_gaps() {
        let store = TelemetryStore::memory();
        let ttl = Duration::from_secs(30);
        store.put("a", &sample("a", 1.0, 1.0), ttl).await.unwrap();
        store.put("c", &sample("c", 3.0, 3.0), ttl).await.unwrap();

        let got = store
            .mget(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].as_ref().map(|s| s.user_id.as_str()), Some("a"));
        assert!(got[1].is_none());
        assert_eq!(got[2].as_ref().map(|s| s.user_id.as_str()), Some("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_entries_expire() {
        let store = TelemetryStore::memory();
        store
            .put("a", &sample("a", 1.0, 1.0), Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        let got = store.mget(&["a".into()]).await.unwrap();
        assert!(got[0].is_none());
    }
}
