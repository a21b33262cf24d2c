use serde::{Deserialize, Serialize};

/// MesoWest 观测接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationSourceConfig {
    pub base_url: String,
    pub token: String,
    pub variables: Vec<String>,
    pub units: String,
    pub request_timeout_seconds: u64,
}

impl Default for ObservationSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.mesowest.net/v2/stations/timeseries".to_string(),
            token: String::new(),
            variables: vec![
                "air_temp".to_string(),
                "relative_humidity".to_string(),
                "wind_speed".to_string(),
                "wind_direction".to_string(),
                "solar_radiation".to_string(),
                "snow_depth".to_string(),
                "precipitation_increment".to_string(),
            ],
            units: "metric".to_string(),
            request_timeout_seconds: 30,
        }
    }
}

impl ObservationSourceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(anyhow::anyhow!("观测接口地址格式无效: {}", self.base_url));
        }

        if self.variables.is_empty() {
            return Err(anyhow::anyhow!("观测变量列表不能为空"));
        }

        if self.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("请求超时时间必须大于0"));
        }

        Ok(())
    }
}
