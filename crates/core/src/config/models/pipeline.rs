use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::RunSuccessPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 采集窗口长度（小时），以当前时间为结束
    pub fetch_window_hours: u32,
    pub success_policy: RunSuccessPolicy,
    /// 接口成功但无数据时是否按退避重试
    pub retry_on_empty_fetch: bool,
    /// 每次运行的输入数据目录根路径
    pub work_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_window_hours: 24,
            success_policy: RunSuccessPolicy::AllSucceed,
            retry_on_empty_fetch: false,
            work_dir: PathBuf::from("data/runs"),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fetch_window_hours == 0 {
            return Err(anyhow::anyhow!("采集窗口必须大于0小时"));
        }

        if self.work_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("工作目录不能为空"));
        }

        Ok(())
    }
}
