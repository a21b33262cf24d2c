use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 模拟作业状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state", content = "error")]
pub enum SimulationJobStatus {
    Pending,
    Succeeded,
    Failed(String),
    /// fail-fast 模式下因其他作业失败而未执行或被中断
    Cancelled,
}

/// 一次外部模拟程序调用
///
/// `output_path` 由 `(run_id, config_identifier)` 唯一确定，
/// 同一批次中的两个作业不会共享输出目录。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationJob {
    pub run_id: Uuid,
    pub config_identifier: String,
    pub config_path: PathBuf,
    pub input_data_path: PathBuf,
    pub output_path: PathBuf,
    pub end_date: NaiveDate,
    pub status: SimulationJobStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
}

impl SimulationJob {
    pub fn is_succeeded(&self) -> bool {
        self.status == SimulationJobStatus::Succeeded
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            SimulationJobStatus::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// 批次执行结果汇总
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationBatchReport {
    pub run_id: Uuid,
    pub jobs: Vec<SimulationJob>,
}

impl SimulationBatchReport {
    pub fn succeeded(&self) -> usize {
        self.jobs.iter().filter(|j| j.is_succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.jobs.iter().filter(|j| j.error().is_some()).count()
    }

    pub fn total(&self) -> usize {
        self.jobs.len()
    }
}

/// 入库后的模拟结果，以 `(run_id, config_identifier)` 为键
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationResultRecord {
    pub run_id: Uuid,
    pub config_identifier: String,
    pub output_path: PathBuf,
    pub output_files: Vec<String>,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}
