use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snowcast_core::{
    models::{
        ObservationBatch, ObservationRecord, PipelineRun, PipelineRunQuery, PipelineStage,
        SimulationResultRecord, Station, TimeRange,
    },
    ObservationRepository, PipelineRunRepository, SchedulerResult, SimulationResultRepository,
    StationRepository,
};
use tokio::sync::RwLock;
use uuid::Uuid;

/// 内存数据存储
///
/// 与 `SqliteStore` 语义一致，用于单进程部署和测试。
#[derive(Default)]
pub struct InMemoryStore {
    stations: RwLock<BTreeMap<i64, Station>>,
    observations: RwLock<HashMap<(String, TimeRange), Vec<ObservationRecord>>>,
    results: RwLock<BTreeMap<(Uuid, String), SimulationResultRecord>>,
    runs: RwLock<HashMap<Uuid, PipelineRun>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StationRepository for InMemoryStore {
    async fn upsert(&self, station: &Station) -> SchedulerResult<()> {
        self.stations
            .write()
            .await
            .insert(station.id, station.clone());
        Ok(())
    }

    async fn list_active(&self) -> SchedulerResult<Vec<Station>> {
        Ok(self
            .stations
            .read()
            .await
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    async fn get_by_external_id(
        &self,
        external_identifier: &str,
    ) -> SchedulerResult<Option<Station>> {
        Ok(self
            .stations
            .read()
            .await
            .values()
            .find(|s| s.external_identifier == external_identifier)
            .cloned())
    }

    async fn update_last_fetch_time(
        &self,
        external_identifiers: &[String],
        fetched_until: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let mut stations = self.stations.write().await;
        let mut updated = 0;
        for station in stations.values_mut() {
            if !external_identifiers.contains(&station.external_identifier) {
                continue;
            }
            if station.last_fetch_time.map_or(true, |t| t < fetched_until) {
                station.last_fetch_time = Some(fetched_until);
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[async_trait]
impl ObservationRepository for InMemoryStore {
    async fn upsert_batch(&self, batch: &ObservationBatch) -> SchedulerResult<u64> {
        // 同一时刻的重复记录只保留最后一条
        let mut by_time: BTreeMap<DateTime<Utc>, ObservationRecord> = BTreeMap::new();
        for record in &batch.records {
            by_time.insert(record.observed_at, record.clone());
        }
        let records: Vec<ObservationRecord> = by_time.into_values().collect();
        let written = records.len() as u64;

        self.observations
            .write()
            .await
            .insert((batch.station_id.clone(), batch.time_range), records);
        Ok(written)
    }

    async fn count_records(&self, station_id: Option<&str>) -> SchedulerResult<u64> {
        Ok(self
            .observations
            .read()
            .await
            .iter()
            .filter(|((station, _), _)| station_id.map_or(true, |id| id == station))
            .map(|(_, records)| records.len() as u64)
            .sum())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut observations = self.observations.write().await;
        let mut deleted = 0;
        for records in observations.values_mut() {
            let before = records.len();
            records.retain(|r| r.observed_at >= cutoff);
            deleted += (before - records.len()) as u64;
        }
        observations.retain(|_, records| !records.is_empty());
        Ok(deleted)
    }
}

#[async_trait]
impl SimulationResultRepository for InMemoryStore {
    async fn upsert_result(&self, record: &SimulationResultRecord) -> SchedulerResult<()> {
        let mut results = self.results.write().await;
        let key = (record.run_id, record.config_identifier.clone());
        let created_at = results
            .get(&key)
            .map(|existing| existing.created_at)
            .unwrap_or(record.created_at);
        let mut record = record.clone();
        record.created_at = created_at;
        results.insert(key, record);
        Ok(())
    }

    async fn results_for_run(&self, run_id: Uuid) -> SchedulerResult<Vec<SimulationResultRecord>> {
        Ok(self
            .results
            .read()
            .await
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn count_results(&self) -> SchedulerResult<u64> {
        Ok(self.results.read().await.len() as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut results = self.results.write().await;
        let before = results.len();
        results.retain(|_, r| r.created_at >= cutoff);
        Ok((before - results.len()) as u64)
    }
}

#[async_trait]
impl PipelineRunRepository for InMemoryStore {
    async fn create(&self, run: &PipelineRun) -> SchedulerResult<bool> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Ok(false);
        }
        runs.insert(run.id, run.clone());
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> SchedulerResult<Option<PipelineRun>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn update(&self, run: &PipelineRun, expected: PipelineStage) -> SchedulerResult<bool> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(&run.id) {
            Some(stored) if stored.stage == expected => {
                *stored = run.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn query(&self, query: &PipelineRunQuery) -> SchedulerResult<Vec<PipelineRun>> {
        let mut matched: Vec<PipelineRun> = self
            .runs
            .read()
            .await
            .values()
            .filter(|run| query.matches(run))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}
