//! 行映射的公共工具

use chrono::{DateTime, Utc};
use snowcast_core::{SchedulerError, SchedulerResult};
use uuid::Uuid;

pub fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_ms(ms: i64) -> SchedulerResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SchedulerError::Storage(format!("无效的时间戳: {ms}")))
}

pub fn parse_uuid(value: &str) -> SchedulerResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| SchedulerError::Storage(format!("无效的UUID {value}: {e}")))
}

pub fn parse_optional_uuid(value: Option<String>) -> SchedulerResult<Option<Uuid>> {
    value.as_deref().map(parse_uuid).transpose()
}
