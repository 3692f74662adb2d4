//! Storage sink interface and the two bundled stores
//!
//! The real time-series store is external; the pipeline only needs `persist`
//! for batches and scores and `query` to rebuild baseline windows.

use async_trait::async_trait;
use ethoscope_core::{
    MetricKind, NetworkHealthScoreRecord, ProcessedMetricBatch, Result, TimeRange,
    ValidatedRecord,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

const HEALTH_FILE: &str = "health_scores.jsonl";

/// Where processed batches and health scores go
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Store a batch, returning how many records were written
    async fn persist(&self, batch: &ProcessedMetricBatch) -> Result<usize>;

    async fn persist_health(&self, record: &NetworkHealthScoreRecord) -> Result<()>;

    /// Records of one kind captured inside `range`, oldest first
    async fn query(&self, kind: MetricKind, range: TimeRange) -> Result<Vec<ValidatedRecord>>;

    /// Health scores inside `range`, oldest first
    async fn query_health(&self, range: TimeRange) -> Result<Vec<NetworkHealthScoreRecord>>;
}

/// Storage mode for processed metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageMode {
    /// Process-local, lost on exit
    Memory,
    /// One JSON-lines file per kind under a directory
    AppendFile(PathBuf),
}

/// Open the sink for a storage mode
pub fn open_store(mode: &StorageMode) -> Arc<dyn MetricSink> {
    match mode {
        StorageMode::Memory => Arc::new(MemoryStore::new()),
        StorageMode::AppendFile(dir) => Arc::new(AppendFileStore::new(dir)),
    }
}

/// In-memory store used by tests and one-shot commands
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<MetricKind, Vec<ValidatedRecord>>>,
    health: RwLock<Vec<NetworkHealthScoreRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored records across kinds
    pub async fn len(&self) -> usize {
        self.records.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MetricSink for MemoryStore {
    async fn persist(&self, batch: &ProcessedMetricBatch) -> Result<usize> {
        let mut records = self.records.write().await;
        records
            .entry(batch.metric_kind)
            .or_default()
            .extend(batch.records.iter().cloned());
        Ok(batch.len())
    }

    async fn persist_health(&self, record: &NetworkHealthScoreRecord) -> Result<()> {
        self.health.write().await.push(record.clone());
        Ok(())
    }

    async fn query(&self, kind: MetricKind, range: TimeRange) -> Result<Vec<ValidatedRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<ValidatedRecord> = records
            .get(&kind)
            .map(|stored| {
                stored
                    .iter()
                    .filter(|r| range.contains(r.captured_at))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by_key(|r| r.captured_at);
        Ok(matching)
    }

    async fn query_health(&self, range: TimeRange) -> Result<Vec<NetworkHealthScoreRecord>> {
        let health = self.health.read().await;
        let mut matching: Vec<_> = health
            .iter()
            .filter(|r| range.contains(r.timestamp))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.timestamp);
        Ok(matching)
    }
}

/// Append-only JSON-lines store
///
/// Layout: `<dir>/<kind>.jsonl` per metric kind plus `<dir>/health_scores.jsonl`.
#[derive(Debug)]
pub struct AppendFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl AppendFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, kind: MetricKind) -> PathBuf {
        self.dir.join(format!("{}.jsonl", kind))
    }

    async fn append_lines(&self, path: &Path, content: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_lines<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        if !fs::try_exists(path).await? {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(path).await?;
        let mut items = Vec::new();

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<T>(line) {
                Ok(item) => items.push(item),
                Err(e) => {
                    debug!("Skipping unparsable line in {:?}: {}", path, e);
                }
            }
        }

        Ok(items)
    }
}

#[async_trait]
impl MetricSink for AppendFileStore {
    async fn persist(&self, batch: &ProcessedMetricBatch) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut content = String::new();
        for record in &batch.records {
            content.push_str(&serde_json::to_string(record)?);
            content.push('\n');
        }

        let path = self.path_for(batch.metric_kind);
        self.append_lines(&path, &content).await?;
        debug!("Stored {} {} records to {:?}", batch.len(), batch.metric_kind, path);
        Ok(batch.len())
    }

    async fn persist_health(&self, record: &NetworkHealthScoreRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.append_lines(&self.dir.join(HEALTH_FILE), &line).await
    }

    async fn query(&self, kind: MetricKind, range: TimeRange) -> Result<Vec<ValidatedRecord>> {
        let mut records: Vec<ValidatedRecord> = self
            .read_lines::<ValidatedRecord>(&self.path_for(kind))
            .await?
            .into_iter()
            .filter(|r| r.metric_kind == kind && range.contains(r.captured_at))
            .collect();
        records.sort_by_key(|r| r.captured_at);
        Ok(records)
    }

    async fn query_health(&self, range: TimeRange) -> Result<Vec<NetworkHealthScoreRecord>> {
        let mut records: Vec<NetworkHealthScoreRecord> = self
            .read_lines::<NetworkHealthScoreRecord>(&self.dir.join(HEALTH_FILE))
            .await?
            .into_iter()
            .filter(|r| range.contains(r.timestamp))
            .collect();
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use ethoscope_core::{Fields, HealthStatus};
    use tempfile::tempdir;

    fn gas_record(offset_secs: i64, gwei: f64) -> ValidatedRecord {
        let mut fields = Fields::new();
        fields.insert("gas_price_gwei".into(), gwei.into());
        ValidatedRecord {
            source_id: "mainnet".to_string(),
            metric_kind: MetricKind::Gas,
            captured_at: Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap(),
            fields,
        }
    }

    fn gas_batch(records: Vec<ValidatedRecord>) -> ProcessedMetricBatch {
        ProcessedMetricBatch {
            metric_kind: MetricKind::Gas,
            records,
        }
    }

    fn all_time() -> TimeRange {
        TimeRange::new(
            Utc.timestamp_opt(0, 0).unwrap(),
            Utc.timestamp_opt(2_000_000_000, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_memory_store_query_orders_and_filters() {
        let store = MemoryStore::new();
        store
            .persist(&gas_batch(vec![gas_record(60, 12.0), gas_record(0, 10.0)]))
            .await
            .unwrap();
        store
            .persist(&gas_batch(vec![gas_record(7200, 30.0)]))
            .await
            .unwrap();

        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let hour = TimeRange::new(start, start + Duration::hours(1));
        let values: Vec<f64> = store
            .query(MetricKind::Gas, hour)
            .await
            .unwrap()
            .iter()
            .filter_map(|r| r.field_f64("gas_price_gwei"))
            .collect();

        assert_eq!(values, vec![10.0, 12.0]);
        assert!(store.query(MetricKind::Block, all_time()).await.unwrap().is_empty());
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_append_file_round_trip() {
        let dir = tempdir().unwrap();
        let store = AppendFileStore::new(dir.path().join("data"));

        let written = store
            .persist(&gas_batch(vec![gas_record(0, 10.0), gas_record(12, 11.0)]))
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert!(store.path_for(MetricKind::Gas).ends_with("gas.jsonl"));

        let loaded = store.query(MetricKind::Gas, all_time()).await.unwrap();
        assert_eq!(loaded, vec![gas_record(0, 10.0), gas_record(12, 11.0)]);
    }

    #[tokio::test]
    async fn test_append_file_skips_corrupt_lines() {
        let dir = tempdir().unwrap();
        let store = AppendFileStore::new(dir.path());

        store.persist(&gas_batch(vec![gas_record(0, 10.0)])).await.unwrap();
        store
            .append_lines(&store.path_for(MetricKind::Gas), "{not json\n")
            .await
            .unwrap();
        store.persist(&gas_batch(vec![gas_record(5, 9.0)])).await.unwrap();

        let loaded = store.query(MetricKind::Gas, all_time()).await.unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_files_read_as_empty() {
        let dir = tempdir().unwrap();
        let store = open_store(&StorageMode::AppendFile(dir.path().join("nothing-yet")));
        assert!(store.query(MetricKind::Mev, all_time()).await.unwrap().is_empty());
        assert!(store.query_health(all_time()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health_scores_are_appended() {
        let dir = tempdir().unwrap();
        let store = AppendFileStore::new(dir.path());
        let record = NetworkHealthScoreRecord {
            timestamp: Utc.timestamp_opt(1_700_000_060, 0).unwrap(),
            overall_score: 82.5,
            components: Vec::new(),
            anomalies: Vec::new(),
            health_status: HealthStatus::Good,
            confidence: 1.0,
        };

        store.persist_health(&record).await.unwrap();
        let loaded = store.query_health(all_time()).await.unwrap();
        assert_eq!(loaded, vec![record]);
        assert!(dir.path().join(HEALTH_FILE).exists());
    }
}
