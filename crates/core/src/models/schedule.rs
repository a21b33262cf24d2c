use serde::{Deserialize, Serialize};

/// 定时触发条目，启动时确定，运行期间不可变
///
/// 时间一律按 UTC 解释。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub trigger_id: String,
    pub hour: u32,
    pub minute: u32,
    pub handler_name: String,
    /// 流水线标签，例如 `morning_run`；清理任务没有标签
    pub label: Option<String>,
}

impl ScheduleEntry {
    pub fn daily(
        trigger_id: impl Into<String>,
        hour: u32,
        minute: u32,
        handler_name: impl Into<String>,
        label: Option<String>,
    ) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            hour,
            minute,
            handler_name: handler_name.into(),
            label,
        }
    }

    /// 对应的 7 字段 cron 表达式（秒 分 时 日 月 周 年）
    pub fn cron_expression(&self) -> String {
        format!("0 {} {} * * * *", self.minute, self.hour)
    }
}
