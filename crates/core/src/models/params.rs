//! 各任务处理器的参数结构，作为任务 payload 在 broker 中传递

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{SimulationJob, TimeRange};

/// `pipeline.run`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineRunParams {
    pub run_id: Uuid,
    pub trigger_label: String,
}

/// `fetch.observations`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchParams {
    pub run_id: Uuid,
    pub station_ids: Vec<String>,
    pub time_range: TimeRange,
}

/// `simulation.run_batch`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationBatchParams {
    pub run_id: Uuid,
    pub input_dir: PathBuf,
    pub end_date: NaiveDate,
}

/// `pipeline.store_results`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreResultsParams {
    pub run_id: Uuid,
    pub station_ids: Vec<String>,
    pub fetched_until: DateTime<Utc>,
    pub jobs: Vec<SimulationJob>,
}

/// `pipeline.cleanup`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CleanupParams {
    /// 覆盖配置中的保留天数
    #[serde(default)]
    pub retention_days: Option<u32>,
}
