//! Test data builders for creating test entities
//!
//! This module provides builder patterns for creating test data with
//! sensible defaults and easy customization.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use snowcast_core::models::{ObservationBatch, ObservationRecord, Station, Task, TimeRange};
use uuid::Uuid;

/// 测试中统一使用的起始时间：2025-01-01 04:00 UTC，恰好是早间运行的触发时刻
pub fn morning_of_first_day() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 4, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// 构造含 `records` 条逐小时记录的观测批次
pub fn observation_batch(station_id: &str, range: TimeRange, records: usize) -> ObservationBatch {
    let mut batch = ObservationBatch::new(station_id, range);
    for hour in 0..records {
        batch.records.push(ObservationRecord {
            observed_at: range.start + Duration::hours(hour as i64),
            values: BTreeMap::from([
                ("air_temp".to_string(), Some(-4.0 + hour as f64 * 0.5)),
                ("snow_depth".to_string(), Some(110.0)),
            ]),
        });
    }
    batch
}

/// 构造一组活跃站点，外部标识依次为 `ST01`、`ST02` ...
pub fn active_stations(count: usize) -> Vec<Station> {
    (1..=count)
        .map(|i| Station::new(i as i64, format!("ST{i:02}"), format!("Station {i}")))
        .collect()
}

/// Builder for creating test Task entities
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(handler_name: &str) -> Self {
        Self {
            task: Task::new(
                "pipeline",
                handler_name,
                serde_json::json!({}),
                3,
                morning_of_first_day(),
            ),
        }
    }

    pub fn with_queue(mut self, queue: &str) -> Self {
        self.task.queue_name = queue.to_string();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.task.payload = payload;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.task.max_attempts = max_attempts;
        self
    }

    pub fn with_attempt_count(mut self, attempt_count: u32) -> Self {
        self.task.attempt_count = attempt_count;
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.task.eta = eta;
        self
    }

    pub fn with_pipeline_run(mut self, run_id: Uuid) -> Self {
        self.task.pipeline_run_id = Some(run_id);
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}
