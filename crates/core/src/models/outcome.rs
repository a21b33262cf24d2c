use std::time::Duration;

use crate::errors::{SchedulerError, SchedulerResult};

/// 任务处理器的执行结果
///
/// worker 根据结果决定确认、按退避重试或直接进入永久失败，
/// 处理器自身不负责重试。
#[derive(Debug)]
pub enum HandlerOutcome {
    Success(serde_json::Value),
    Retryable {
        error: SchedulerError,
        delay_hint: Option<Duration>,
    },
    Fatal(SchedulerError),
}

impl HandlerOutcome {
    pub fn retryable(error: SchedulerError) -> Self {
        HandlerOutcome::Retryable {
            error,
            delay_hint: None,
        }
    }

    /// 按错误分类把 `SchedulerResult` 转成执行结果
    pub fn from_result(result: SchedulerResult<serde_json::Value>) -> Self {
        match result {
            Ok(value) => HandlerOutcome::Success(value),
            Err(error) if error.is_retryable() => HandlerOutcome::retryable(error),
            Err(error) => HandlerOutcome::Fatal(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Success(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            HandlerOutcome::Success(_) => "success",
            HandlerOutcome::Retryable { .. } => "retryable",
            HandlerOutcome::Fatal(_) => "fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_result_classifies_errors() {
        let outcome = HandlerOutcome::from_result(Err(SchedulerError::TransientFetch(
            "connection reset".into(),
        )));
        assert!(matches!(outcome, HandlerOutcome::Retryable { .. }));

        let outcome = HandlerOutcome::from_result(Err(SchedulerError::InvalidTaskParams(
            "missing run_id".into(),
        )));
        assert!(matches!(outcome, HandlerOutcome::Fatal(_)));

        let outcome = HandlerOutcome::from_result(Ok(serde_json::json!({"ok": true})));
        assert!(outcome.is_success());
    }
}
