use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use snowcast_core::{
    Clock, ObservationRepository, SchedulerError, SchedulerResult, SimulationResultRepository,
};
use std::sync::Arc;
use tracing::{debug, info};

/// 一次清理的统计
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CleanupStats {
    pub cutoff: Option<DateTime<Utc>>,
    pub observations_deleted: u64,
    pub results_deleted: u64,
    pub total_deleted: u64,
    pub duration_ms: u64,
}

/// 数据清理服务
///
/// 删除超过保留期的观测数据和模拟结果，防止数据库无限增长。
/// 删除条件只依赖截止时间，重复执行是幂等的。
pub struct CleanupService {
    observations: Arc<dyn ObservationRepository>,
    results: Arc<dyn SimulationResultRepository>,
    clock: Arc<dyn Clock>,
    retention_days: u32,
}

impl CleanupService {
    pub fn new(
        observations: Arc<dyn ObservationRepository>,
        results: Arc<dyn SimulationResultRepository>,
        clock: Arc<dyn Clock>,
        retention_days: u32,
    ) -> Self {
        Self {
            observations,
            results,
            clock,
            retention_days,
        }
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// 执行一次清理，`retention_override` 覆盖配置中的保留天数
    pub async fn cleanup_once(&self, retention_override: Option<u32>) -> SchedulerResult<CleanupStats> {
        let retention_days = retention_override.unwrap_or(self.retention_days);
        if retention_days == 0 {
            return Err(SchedulerError::InvalidTaskParams(
                "保留天数必须大于0".to_string(),
            ));
        }

        let start_time = std::time::Instant::now();
        let cutoff = self.clock.now() - Duration::days(i64::from(retention_days));
        info!(
            "Starting cleanup of data older than {} ({} days)",
            cutoff, retention_days
        );

        let observations_deleted = self.observations.delete_older_than(cutoff).await?;
        debug!("Deleted {} observation rows", observations_deleted);

        let results_deleted = self.results.delete_older_than(cutoff).await?;
        debug!("Deleted {} simulation results", results_deleted);

        let stats = CleanupStats {
            cutoff: Some(cutoff),
            observations_deleted,
            results_deleted,
            total_deleted: observations_deleted + results_deleted,
            duration_ms: u64::try_from(start_time.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        counter!("snowcast_cleanup_deleted_total", "kind" => "observations")
            .increment(observations_deleted);
        counter!("snowcast_cleanup_deleted_total", "kind" => "results").increment(results_deleted);

        info!(
            "Cleanup completed: {} total records cleaned in {}ms (observations: {}, results: {})",
            stats.total_deleted, stats.duration_ms, stats.observations_deleted, stats.results_deleted
        );

        Ok(stats)
    }
}
