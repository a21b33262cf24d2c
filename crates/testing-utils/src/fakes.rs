//! Test doubles for the external collaborators: the observation API and the
//! simulation program.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use snowcast_core::{
    models::{ObservationBatch, SimulationJob, TimeRange},
    ObservationSource, ProcessExit, SchedulerError, SchedulerResult, SimulationLauncher,
};

use crate::builders::observation_batch;

/// 观测数据源的一次脚本化响应
#[derive(Debug, Clone)]
pub enum FetchScript {
    /// 每个请求的站点返回指定条数的记录
    Records(usize),
    Transient(String),
    Failure(String),
}

/// 按脚本依次返回响应的观测数据源，脚本用完后重复最后一个响应
pub struct FakeObservationSource {
    script: Mutex<VecDeque<FetchScript>>,
    last: Mutex<FetchScript>,
    calls: Mutex<Vec<(Vec<String>, TimeRange)>>,
}

impl FakeObservationSource {
    pub fn new(script: impl IntoIterator<Item = FetchScript>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(FetchScript::Records(0)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 总是为每个站点返回 `records` 条记录
    pub fn with_records(records: usize) -> Self {
        Self::new([FetchScript::Records(records)])
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<(Vec<String>, TimeRange)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next_script(&self) -> FetchScript {
        let mut script = match self.script.lock() {
            Ok(script) => script,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut last = match self.last.lock() {
            Ok(last) => last,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(next) = script.pop_front() {
            *last = next;
        }
        last.clone()
    }
}

#[async_trait]
impl ObservationSource for FakeObservationSource {
    async fn fetch(
        &self,
        station_ids: &[String],
        range: TimeRange,
    ) -> SchedulerResult<Vec<ObservationBatch>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((station_ids.to_vec(), range));
        }

        match self.next_script() {
            FetchScript::Records(count) => Ok(station_ids
                .iter()
                .map(|id| observation_batch(id, range, count))
                .collect()),
            FetchScript::Transient(message) => Err(SchedulerError::TransientFetch(message)),
            FetchScript::Failure(message) => Err(SchedulerError::FetchFailure(message)),
        }
    }
}

/// 模拟程序启动器的替身
///
/// 默认退出码为 0，可以按配置标识指定退出码。成功的作业会在输出目录中写入
/// `<config>.pro`，便于检查输出路径是否冲突。
pub struct FakeLauncher {
    exit_codes: HashMap<String, i32>,
    delay: Duration,
    launched: Mutex<Vec<SimulationJob>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            exit_codes: HashMap::new(),
            delay: Duration::ZERO,
            launched: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    pub fn with_exit_code(mut self, config_identifier: &str, exit_code: i32) -> Self {
        self.exit_codes
            .insert(config_identifier.to_string(), exit_code);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn launched(&self) -> Vec<SimulationJob> {
        self.launched.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// 同时运行的作业数峰值
    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SimulationLauncher for FakeLauncher {
    async fn launch(&self, job: &SimulationJob) -> SchedulerResult<ProcessExit> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        if let Ok(mut launched) = self.launched.lock() {
            launched.push(job.clone());
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let exit_code = self
            .exit_codes
            .get(&job.config_identifier)
            .copied()
            .unwrap_or(0);
        let result = if exit_code == 0 {
            tokio::fs::create_dir_all(&job.output_path).await?;
            tokio::fs::write(
                job.output_path.join(format!("{}.pro", job.config_identifier)),
                job.end_date.to_string(),
            )
            .await?;
            ProcessExit::success()
        } else {
            ProcessExit::failed(exit_code, format!("{} aborted", job.config_identifier))
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(result)
    }
}
