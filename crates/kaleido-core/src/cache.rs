//! Client-side query result cache.
//!
//! Keyed by canonicalized query text ([`crate::sql::canonical_key`]), with
//! LRU + TTL eviction: expired entries are dropped when touched, the
//! least-recently-used entry is evicted when the cache is full.
//!
//! Cache contents are not durable across process restarts; the embedding
//! application may snapshot and restore them explicitly through
//! [`QueryCache::export`] / [`QueryCache::import`].

use std::io::Cursor;
use std::time::{Duration, Instant};

use arrow::array::RecordBatch;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::connector::QueryResponse;
use crate::{Error, Result};

/// Configuration for the query cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether caching is enabled at all.
    pub enabled: bool,
    /// Maximum number of entries before LRU eviction.
    pub max_entries: usize,
    /// Entry time-to-live (`None` = no expiry).
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1024,
            ttl: Some(Duration::from_secs(3600)),
        }
    }
}

struct Entry {
    value: QueryResponse,
    last_access: Instant,
}

/// LRU + TTL cache from canonical query text to results.
pub struct QueryCache {
    entries: FxHashMap<String, Entry>,
    config: CacheConfig,
}

impl QueryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: FxHashMap::default(),
            config,
        }
    }

    /// Returns true if caching is enabled.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Looks up a cached result, refreshing its access time.
    ///
    /// An expired entry is removed and reported as a miss.
    pub fn get(&mut self, key: &str) -> Option<QueryResponse> {
        if !self.config.enabled {
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        if let Some(ttl) = self.config.ttl {
            if entry.last_access.elapsed() > ttl {
                self.entries.remove(key);
                return None;
            }
        }
        entry.last_access = Instant::now();
        Some(entry.value.clone())
    }

    /// Stores a result, evicting least-recently-used entries to make room.
    pub fn put(&mut self, key: impl Into<String>, value: QueryResponse) {
        if !self.config.enabled || self.config.max_entries == 0 {
            return;
        }
        let key = key.into();
        while self.entries.len() >= self.config.max_entries && !self.entries.contains_key(&key) {
            self.evict_lru();
        }
        self.entries.insert(
            key,
            Entry {
                value,
                last_access: Instant::now(),
            },
        );
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    /// Serializes the cache contents to a JSON blob.
    ///
    /// Columnar results are encoded as base64 Arrow IPC streams. Access
    /// times are not preserved; imported entries start fresh.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheSerde`] if a result cannot be encoded.
    pub fn export(&self) -> Result<String> {
        let mut wire = Vec::with_capacity(self.entries.len());
        for (key, entry) in &self.entries {
            wire.push(WireEntry {
                key: key.clone(),
                value: WireResponse::encode(&entry.value)?,
            });
        }
        serde_json::to_string(&wire).map_err(|e| Error::CacheSerde(e.to_string()))
    }

    /// Restores entries from a blob produced by [`QueryCache::export`].
    ///
    /// Existing entries with the same key are overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheSerde`] if the blob is malformed.
    pub fn import(&mut self, blob: &str) -> Result<()> {
        let wire: Vec<WireEntry> =
            serde_json::from_str(blob).map_err(|e| Error::CacheSerde(e.to_string()))?;
        for entry in wire {
            let value = entry.value.decode()?;
            self.put(entry.key, value);
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct WireEntry {
    key: String,
    value: WireResponse,
}

#[derive(Serialize, Deserialize)]
enum WireResponse {
    Exec,
    Table(String),
    Rows(Vec<serde_json::Value>),
}

impl WireResponse {
    fn encode(value: &QueryResponse) -> Result<Self> {
        Ok(match value {
            QueryResponse::Exec => Self::Exec,
            QueryResponse::Rows(rows) => Self::Rows(rows.clone()),
            QueryResponse::Table(batch) => Self::Table(encode_batch(batch)?),
        })
    }

    fn decode(self) -> Result<QueryResponse> {
        Ok(match self {
            Self::Exec => QueryResponse::Exec,
            Self::Rows(rows) => QueryResponse::Rows(rows),
            Self::Table(encoded) => QueryResponse::Table(decode_batch(&encoded)?),
        })
    }
}

/// Encodes a record batch as a base64 Arrow IPC stream.
pub(crate) fn encode_batch(batch: &RecordBatch) -> Result<String> {
    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, &batch.schema())?;
        writer.write(batch)?;
        writer.finish()?;
    }
    Ok(BASE64.encode(buf))
}

/// Decodes a record batch from a base64 Arrow IPC stream.
pub(crate) fn decode_batch(encoded: &str) -> Result<RecordBatch> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| Error::CacheSerde(e.to_string()))?;
    let reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    let mut batches: Vec<RecordBatch> = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    match batches.first() {
        Some(first) => Ok(arrow::compute::concat_batches(&first.schema(), &batches)?),
        None => Err(Error::CacheSerde("empty IPC stream".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn batch(values: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))]).unwrap()
    }

    fn config(max: usize, ttl: Option<Duration>) -> CacheConfig {
        CacheConfig {
            enabled: true,
            max_entries: max,
            ttl,
        }
    }

    // -- basic get/put --

    #[test]
    fn test_hit_and_miss() {
        let mut cache = QueryCache::new(config(4, None));
        assert!(cache.get("a").is_none());
        cache.put("a", QueryResponse::Exec);
        assert_eq!(cache.get("a"), Some(QueryResponse::Exec));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let mut cache = QueryCache::new(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        cache.put("a", QueryResponse::Exec);
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    // -- eviction --

    #[test]
    fn test_lru_eviction() {
        let mut cache = QueryCache::new(config(2, None));
        cache.put("a", QueryResponse::Exec);
        cache.put("b", QueryResponse::Exec);
        // Touch "a" so "b" becomes least recently used.
        assert!(cache.get("a").is_some());
        cache.put("c", QueryResponse::Exec);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_ttl_expiry() {
        let mut cache = QueryCache::new(config(4, Some(Duration::from_millis(0))));
        cache.put("a", QueryResponse::Exec);
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    // -- export/import --

    #[test]
    fn test_export_import_roundtrip() {
        let mut cache = QueryCache::new(config(8, None));
        cache.put("t", QueryResponse::Table(batch(&[1, 2, 3])));
        cache.put("r", QueryResponse::Rows(vec![serde_json::json!({"x": 1})]));

        let blob = cache.export().unwrap();
        let mut restored = QueryCache::new(config(8, None));
        restored.import(&blob).unwrap();

        assert_eq!(
            restored.get("t"),
            Some(QueryResponse::Table(batch(&[1, 2, 3])))
        );
        assert_eq!(
            restored.get("r"),
            Some(QueryResponse::Rows(vec![serde_json::json!({"x": 1})]))
        );
    }
}
