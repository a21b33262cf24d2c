use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Deserialize;
use serde_json::Value;
use snowcast_core::{
    config::ObservationSourceConfig,
    models::{ObservationBatch, ObservationRecord, TimeRange},
    ObservationSource, SchedulerError, SchedulerResult,
};
use tracing::{debug, info, instrument, warn};

/// MesoWest 接口要求的时间格式
const MESOWEST_TIME_FORMAT: &str = "%Y%m%d%H%M";

/// MesoWest 时间序列接口客户端
pub struct MesoWestClient {
    http: reqwest::Client,
    config: ObservationSourceConfig,
}

#[derive(Debug, Deserialize)]
struct TimeseriesResponse {
    #[serde(rename = "SUMMARY", default)]
    summary: Summary,
    #[serde(rename = "STATION", default)]
    stations: Vec<StationSeries>,
}

#[derive(Debug, Default, Deserialize)]
struct Summary {
    #[serde(rename = "RESPONSE_CODE")]
    response_code: Option<i64>,
    #[serde(rename = "RESPONSE_MESSAGE")]
    response_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StationSeries {
    #[serde(rename = "STID")]
    stid: String,
    #[serde(rename = "OBSERVATIONS", default)]
    observations: BTreeMap<String, Value>,
}

impl MesoWestClient {
    pub fn new(config: ObservationSourceConfig) -> SchedulerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| SchedulerError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { http, config })
    }

    fn query_params(&self, station_ids: &[String], range: TimeRange) -> Vec<(&'static str, String)> {
        vec![
            ("token", self.config.token.clone()),
            ("stid", station_ids.join(",")),
            ("start", range.start.format(MESOWEST_TIME_FORMAT).to_string()),
            ("end", range.end.format(MESOWEST_TIME_FORMAT).to_string()),
            ("vars", self.config.variables.join(",")),
            ("units", self.config.units.clone()),
            ("output", "json".to_string()),
        ]
    }

    /// 带 `Authorization: Bearer` 头的 GET 请求
    pub fn build_request(
        &self,
        station_ids: &[String],
        range: TimeRange,
    ) -> SchedulerResult<reqwest::Request> {
        self.http
            .get(&self.config.base_url)
            .bearer_auth(&self.config.token)
            .query(&self.query_params(station_ids, range))
            .build()
            .map_err(|e| SchedulerError::Configuration(format!("构造MesoWest请求失败: {e}")))
    }
}

#[async_trait]
impl ObservationSource for MesoWestClient {
    #[instrument(skip(self, station_ids), fields(stations = station_ids.len()))]
    async fn fetch(
        &self,
        station_ids: &[String],
        range: TimeRange,
    ) -> SchedulerResult<Vec<ObservationBatch>> {
        if station_ids.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            "Fetching MesoWest data for {} station(s) from {} to {}",
            station_ids.len(),
            range.start,
            range.end
        );

        let request = self.build_request(station_ids, range)?;
        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| {
                counter!("snowcast_fetch_errors_total", "kind" => "transport").increment(1);
                SchedulerError::TransientFetch(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            counter!("snowcast_fetch_errors_total", "kind" => "http_status").increment(1);
            return Err(SchedulerError::TransientFetch(format!(
                "MesoWest 返回 HTTP {status}"
            )));
        }

        let body: Value = response.json().await.map_err(|e| {
            counter!("snowcast_fetch_errors_total", "kind" => "decode").increment(1);
            SchedulerError::FetchFailure(format!("响应解析失败: {e}"))
        })?;

        let batches = parse_timeseries(body, range)?;
        let records: usize = batches.iter().map(ObservationBatch::processed_count).sum();
        info!(
            "Fetched {} record(s) across {} station(s)",
            records,
            batches.len()
        );
        Ok(batches)
    }
}

/// 解析时间序列响应，每个站点得到一个批次
///
/// `OBSERVATIONS` 中是按列存储的数据：`date_time` 一列时间戳，其余每个变量一列数值。
/// 变量名上的 `_set_N` 后缀会被去掉，同一变量有多组传感器时取第一组。
/// 区间外的时刻和无法解析的时间戳会被丢弃。
pub fn parse_timeseries(body: Value, range: TimeRange) -> SchedulerResult<Vec<ObservationBatch>> {
    let response: TimeseriesResponse = serde_json::from_value(body.clone())
        .map_err(|e| SchedulerError::FetchFailure(format!("响应结构无效: {e}")))?;

    if response.summary.response_code != Some(1) {
        let message = response
            .summary
            .response_message
            .unwrap_or_else(|| "未知错误".to_string());
        warn!("MesoWest API error: {}", message);
        return Err(SchedulerError::FetchFailure(message));
    }

    let raw_stations = body.get("STATION").and_then(Value::as_array);

    let mut batches = Vec::with_capacity(response.stations.len());
    for (index, station) in response.stations.into_iter().enumerate() {
        let mut batch = ObservationBatch::new(station.stid.clone(), range);
        batch.records = pivot_observations(&station.stid, &station.observations, range);
        batch.raw_payload = raw_stations.and_then(|s| s.get(index)).cloned();
        debug!(
            "Station {} yielded {} record(s)",
            batch.station_id,
            batch.processed_count()
        );
        batches.push(batch);
    }
    Ok(batches)
}

fn pivot_observations(
    stid: &str,
    observations: &BTreeMap<String, Value>,
    range: TimeRange,
) -> Vec<ObservationRecord> {
    let Some(times) = observations.get("date_time").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut columns: BTreeMap<String, &Vec<Value>> = BTreeMap::new();
    for (key, value) in observations {
        if key == "date_time" {
            continue;
        }
        let Some(values) = value.as_array() else {
            continue;
        };
        columns.entry(variable_name(key)).or_insert(values);
    }

    let mut records = Vec::with_capacity(times.len());
    for (row, time) in times.iter().enumerate() {
        let Some(observed_at) = time.as_str().and_then(parse_timestamp) else {
            warn!("Station {} has unparseable timestamp {:?}", stid, time);
            continue;
        };
        if !range.contains(observed_at) {
            continue;
        }
        let values = columns
            .iter()
            .map(|(name, column)| (name.clone(), column.get(row).and_then(Value::as_f64)))
            .collect();
        records.push(ObservationRecord {
            observed_at,
            values,
        });
    }
    records
}

fn variable_name(key: &str) -> String {
    match key.find("_set_") {
        Some(pos) => key[..pos].to_string(),
        None => key.to_string(),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
