use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{SchedulerError, SchedulerResult};

/// 流水线阶段
///
/// 正常推进顺序为 `Fetching -> Simulating -> Storing -> Completed`，
/// 前三个阶段都可以进入吸收态 `Failed`。阶段只会前进，不会回退。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Fetching,
    Simulating,
    Storing,
    Completed,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Fetching => "fetching",
            PipelineStage::Simulating => "simulating",
            PipelineStage::Storing => "storing",
            PipelineStage::Completed => "completed",
            PipelineStage::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> SchedulerResult<Self> {
        match s {
            "fetching" => Ok(PipelineStage::Fetching),
            "simulating" => Ok(PipelineStage::Simulating),
            "storing" => Ok(PipelineStage::Storing),
            "completed" => Ok(PipelineStage::Completed),
            "failed" => Ok(PipelineStage::Failed),
            other => Err(SchedulerError::Internal(format!(
                "Invalid pipeline stage: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Completed | PipelineStage::Failed)
    }

    /// 正常流程中的下一个阶段
    pub fn successor(&self) -> Option<PipelineStage> {
        match self {
            PipelineStage::Fetching => Some(PipelineStage::Simulating),
            PipelineStage::Simulating => Some(PipelineStage::Storing),
            PipelineStage::Storing => Some(PipelineStage::Completed),
            PipelineStage::Completed | PipelineStage::Failed => None,
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个阶段的执行摘要
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageSummary {
    pub stage: PipelineStage,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub detail: serde_json::Value,
    pub error: Option<String>,
}

/// 一次端到端的流水线运行
///
/// 每次触发产生一条独立记录，同一标签的并发触发不会合并。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineRun {
    pub id: Uuid,
    pub trigger_label: String,
    pub stage: PipelineStage,
    pub stages: Vec<StageSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(id: Uuid, trigger_label: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            trigger_label: trigger_label.into(),
            stage: PipelineStage::Fetching,
            stages: vec![StageSummary {
                stage: PipelineStage::Fetching,
                started_at: now,
                finished_at: None,
                detail: serde_json::Value::Null,
                error: None,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn summary(&self, stage: PipelineStage) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    fn summary_mut(&mut self, stage: PipelineStage) -> Option<&mut StageSummary> {
        self.stages.iter_mut().find(|s| s.stage == stage)
    }

    /// 结束当前阶段并进入下一阶段
    ///
    /// 只允许进入 `successor()`，其余转换都返回 `InvalidStageTransition`。
    pub fn advance(
        &mut self,
        to: PipelineStage,
        detail: serde_json::Value,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        if self.stage.successor() != Some(to) {
            return Err(SchedulerError::InvalidStageTransition {
                from: self.stage.to_string(),
                to: to.to_string(),
            });
        }

        let current = self.stage;
        if let Some(summary) = self.summary_mut(current) {
            summary.finished_at = Some(now);
            summary.detail = detail;
        }
        self.stage = to;
        if !to.is_terminal() {
            self.stages.push(StageSummary {
                stage: to,
                started_at: now,
                finished_at: None,
                detail: serde_json::Value::Null,
                error: None,
            });
        }
        self.updated_at = now;
        Ok(())
    }

    /// 将运行标记为失败，错误记录在当前阶段的摘要上
    ///
    /// 已经失败的运行再次失败是幂等的；已完成的运行不能失败。
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        detail: serde_json::Value,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        match self.stage {
            PipelineStage::Failed => return Ok(false),
            PipelineStage::Completed => {
                return Err(SchedulerError::InvalidStageTransition {
                    from: self.stage.to_string(),
                    to: PipelineStage::Failed.to_string(),
                })
            }
            _ => {}
        }

        let current = self.stage;
        let error = error.into();
        if let Some(summary) = self.summary_mut(current) {
            summary.finished_at = Some(now);
            summary.error = Some(error);
            if !detail.is_null() {
                summary.detail = detail;
            }
        }
        self.stage = PipelineStage::Failed;
        self.updated_at = now;
        Ok(true)
    }

    /// 失败发生的阶段
    pub fn failed_stage(&self) -> Option<PipelineStage> {
        if self.stage != PipelineStage::Failed {
            return None;
        }
        self.stages
            .iter()
            .rev()
            .find(|s| s.error.is_some())
            .map(|s| s.stage)
    }
}

/// 多个模拟作业中部分失败时如何判定整次运行
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunSuccessPolicy {
    /// 所有作业都成功才继续
    #[default]
    AllSucceed,
    /// 严格多数成功即继续
    Majority,
}

impl RunSuccessPolicy {
    pub fn is_satisfied(&self, succeeded: usize, total: usize) -> bool {
        if total == 0 {
            return false;
        }
        match self {
            RunSuccessPolicy::AllSucceed => succeeded == total,
            RunSuccessPolicy::Majority => succeeded * 2 > total,
        }
    }
}

/// 状态查询条件，供外部 API 层使用
#[derive(Debug, Clone, Default)]
pub struct PipelineRunQuery {
    pub trigger_label: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl PipelineRunQuery {
    pub fn matches(&self, run: &PipelineRun) -> bool {
        if let Some(label) = &self.trigger_label {
            if &run.trigger_label != label {
                return false;
            }
        }
        if let Some(from) = self.created_from {
            if run.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.created_to {
            if run.created_at >= to {
                return false;
            }
        }
        true
    }
}
