use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 气象站
///
/// 采集阶段只读，`last_fetch_time` 仅由入库阶段更新。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Station {
    pub id: i64,
    pub external_identifier: String,
    pub name: String,
    pub active: bool,
    pub last_fetch_time: Option<DateTime<Utc>>,
}

impl Station {
    pub fn new(id: i64, external_identifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            external_identifier: external_identifier.into(),
            name: name.into(),
            active: true,
            last_fetch_time: None,
        }
    }
}

/// 左闭右开的时间区间 `[start, end)`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// 以 `end` 结尾、长度为 `window` 的区间
    pub fn trailing(end: DateTime<Utc>, window: chrono::Duration) -> Self {
        Self {
            start: end - window,
            end,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// 单个时刻的观测值，变量名到数值
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservationRecord {
    pub observed_at: DateTime<Utc>,
    pub values: BTreeMap<String, Option<f64>>,
}

/// 一个站点在一个时间区间内的观测数据
///
/// 存储层以 `(station_id, time_range)` 为键整体替换，重复投递不会产生重复行。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservationBatch {
    pub station_id: String,
    pub time_range: TimeRange,
    pub records: Vec<ObservationRecord>,
    pub raw_payload: Option<serde_json::Value>,
}

impl ObservationBatch {
    pub fn new(station_id: impl Into<String>, time_range: TimeRange) -> Self {
        Self {
            station_id: station_id.into(),
            time_range,
            records: Vec::new(),
            raw_payload: None,
        }
    }

    pub fn processed_count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
