use chrono::{DateTime, Duration, DurationRound, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::debug;

use snowcast_core::{SchedulerError, SchedulerResult};

/// CRON表达式解析和调度工具
///
/// 所有时间按 UTC 计算，匹配粒度为分钟。
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> SchedulerResult<Self> {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            expression: cron_expr.to_string(),
            schedule,
        })
    }

    /// `now` 所在的分钟是否匹配表达式
    ///
    /// 返回匹配的分钟起点，同一分钟内多次调用返回同一个值，
    /// 调用方据此保证每个匹配分钟只触发一次。
    pub fn matching_minute(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let minute_start = now.duration_trunc(Duration::minutes(1)).ok()?;
        let next = self
            .schedule
            .after(&(minute_start - Duration::seconds(1)))
            .next()?;
        if next == minute_start {
            debug!(
                "CRON {} 匹配 {}",
                self.expression,
                minute_start.format("%Y-%m-%d %H:%M UTC")
            );
            Some(minute_start)
        } else {
            None
        }
    }

    /// 获取下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }
}
