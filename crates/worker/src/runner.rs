//! 外部模拟程序的执行
//!
//! [`DockerLauncher`] 为每个作业启动一个独立容器：配置目录和输入目录只读挂载，
//! 输出目录可写挂载。[`SimulationRunner`] 把配置目录展开为有序的作业批次，
//! 按顺序或有界并发执行，单个作业失败默认不影响其他作业。

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use metrics::counter;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use snowcast_core::{
    config::SimulationConfig,
    models::{SimulationBatchParams, SimulationBatchReport, SimulationJob, SimulationJobStatus},
    ProcessExit, RunWorkspace, SchedulerError, SchedulerResult, SimulationLauncher,
};

/// 失败时保留的 stderr 行数
const STDERR_TAIL_LINES: usize = 20;

/// 通过容器运行时启动模拟程序
pub struct DockerLauncher {
    config: SimulationConfig,
}

impl DockerLauncher {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    /// 构造 `docker run` 参数，作业中的路径必须已经是绝对路径
    pub fn command_args(
        &self,
        job: &SimulationJob,
        container_name: &str,
    ) -> SchedulerResult<Vec<String>> {
        for path in [&job.config_path, &job.input_data_path, &job.output_path] {
            if !path.is_absolute() {
                return Err(SchedulerError::InvalidTaskParams(format!(
                    "挂载路径必须是绝对路径: {}",
                    path.display()
                )));
            }
        }
        let config_dir = job.config_path.parent().ok_or_else(|| {
            SchedulerError::InvalidTaskParams(format!(
                "无效的配置文件路径: {}",
                job.config_path.display()
            ))
        })?;
        let config_file = job
            .config_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                SchedulerError::InvalidTaskParams(format!(
                    "无效的配置文件路径: {}",
                    job.config_path.display()
                ))
            })?;

        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
        ];
        args.extend(self.config.extra_runtime_args.iter().cloned());
        args.extend([
            "-v".to_string(),
            format!("{}:{}:ro", config_dir.display(), self.config.config_mount),
            "-v".to_string(),
            format!(
                "{}:{}:ro",
                job.input_data_path.display(),
                self.config.data_mount
            ),
            "-v".to_string(),
            format!("{}:{}", job.output_path.display(), self.config.output_mount),
            self.config.image.clone(),
            self.config.executable.clone(),
            "-c".to_string(),
            format!("{}/{}", self.config.config_mount, config_file),
            "-e".to_string(),
            format!("{}T00:00", job.end_date.format("%Y-%m-%d")),
        ]);
        Ok(args)
    }

    fn container_name(job: &SimulationJob) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "snowcast-{}-{}-{}",
            job.run_id.simple(),
            sanitize(&job.config_identifier),
            &suffix[..8]
        )
    }
}

/// 作业被中途丢弃时停止容器；`docker run` 客户端被杀死后容器本身不会退出
struct ContainerGuard {
    program: String,
    name: String,
    armed: bool,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Killing abandoned simulation container {}", self.name);
        if let Err(e) = std::process::Command::new(&self.program)
            .args(["kill", &self.name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            error!("Failed to kill container {}: {}", self.name, e);
        }
    }
}

#[async_trait]
impl SimulationLauncher for DockerLauncher {
    async fn launch(&self, job: &SimulationJob) -> SchedulerResult<ProcessExit> {
        let container_name = Self::container_name(job);
        let args = self.command_args(job, &container_name)?;
        debug!("Running command: {} {}", self.config.program, args.join(" "));

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let mut guard = ContainerGuard {
            program: self.config.program.clone(),
            name: container_name,
            armed: true,
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SchedulerError::Internal("无法获取stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SchedulerError::Internal("无法获取stderr".to_string()))?;

        let config_identifier = job.config_identifier.as_str();
        let stdout_task = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(config = config_identifier, "{}", line);
            }
        };
        let stderr_task = async {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        };

        let (_, tail, status) = tokio::join!(stdout_task, stderr_task, child.wait());
        let status = status?;
        guard.armed = false;

        let stderr_tail = if tail.is_empty() {
            None
        } else {
            Some(Vec::from(tail).join("\n"))
        };
        Ok(ProcessExit {
            exit_code: status.code(),
            stderr_tail,
        })
    }
}

/// 一次批次执行的结果
#[derive(Debug, Clone)]
pub struct BatchExecution {
    pub report: SimulationBatchReport,
    /// 软时限到达，剩余作业已取消
    pub interrupted: bool,
}

/// 批次执行器
pub struct SimulationRunner {
    launcher: Arc<dyn SimulationLauncher>,
    workspace: RunWorkspace,
    config_dir: PathBuf,
    config_extension: String,
    parallelism: usize,
    fail_fast: bool,
}

impl SimulationRunner {
    pub fn new(
        launcher: Arc<dyn SimulationLauncher>,
        workspace: RunWorkspace,
        config: &SimulationConfig,
    ) -> Self {
        Self {
            launcher,
            workspace,
            config_dir: config.config_dir.clone(),
            config_extension: config.config_extension.clone(),
            parallelism: config.effective_parallelism(),
            fail_fast: config.fail_fast,
        }
    }

    /// 按文件名排序的配置文件列表，扩展名区分大小写
    pub async fn discover_configs(&self) -> SchedulerResult<Vec<PathBuf>> {
        let mut configs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let matches = path
                .extension()
                .is_some_and(|ext| ext == self.config_extension.as_str());
            if matches && entry.file_type().await?.is_file() {
                configs.push(path);
            }
        }
        configs.sort();
        Ok(configs)
    }

    /// 为每个配置文件构造作业，并创建各自的输出目录
    pub async fn prepare_jobs(
        &self,
        params: &SimulationBatchParams,
    ) -> SchedulerResult<Vec<SimulationJob>> {
        let configs = self.discover_configs().await?;
        if configs.is_empty() {
            return Err(SchedulerError::Configuration(format!(
                "配置目录 {} 中没有 .{} 文件",
                self.config_dir.display(),
                self.config_extension
            )));
        }

        let input_data_path = tokio::fs::canonicalize(&params.input_dir).await?;
        let mut identifiers = HashSet::with_capacity(configs.len());
        let mut jobs = Vec::with_capacity(configs.len());
        for config in configs {
            let config_identifier = config_stem(&config);
            if !identifiers.insert(config_identifier.clone()) {
                return Err(SchedulerError::Configuration(format!(
                    "配置文件 {} 的标识与其他配置重复，输出目录会冲突",
                    config.display()
                )));
            }
            let output_dir = self.workspace.output_dir(params.run_id, &config_identifier);
            tokio::fs::create_dir_all(&output_dir).await?;

            jobs.push(SimulationJob {
                run_id: params.run_id,
                config_path: tokio::fs::canonicalize(&config).await?,
                input_data_path: input_data_path.clone(),
                output_path: tokio::fs::canonicalize(&output_dir).await?,
                end_date: params.end_date,
                config_identifier,
                status: SimulationJobStatus::Pending,
                exit_code: None,
                duration_ms: None,
            });
        }
        Ok(jobs)
    }

    /// 执行整个批次
    ///
    /// 作业失败只记录在各自的状态中；开启 fail-fast 时第一个失败会中断
    /// 正在执行的作业，其余作业标记为已取消。
    pub async fn run_batch(
        &self,
        params: &SimulationBatchParams,
    ) -> SchedulerResult<SimulationBatchReport> {
        let execution = self
            .run_batch_until(params, std::future::pending::<()>())
            .await?;
        Ok(execution.report)
    }

    /// 执行批次，`soft_limit` 完成时停止启动新作业并中断正在执行的作业
    ///
    /// 被中断和未启动的作业都标记为已取消，`interrupted` 为 `true`。
    pub async fn run_batch_until<F>(
        &self,
        params: &SimulationBatchParams,
        soft_limit: F,
    ) -> SchedulerResult<BatchExecution>
    where
        F: Future<Output = ()>,
    {
        let jobs = self.prepare_jobs(params).await?;
        info!(
            "Running {} simulation job(s) for run {} with parallelism {}",
            jobs.len(),
            params.run_id,
            self.parallelism
        );

        let mut finished: Vec<Option<SimulationJob>> = vec![None; jobs.len()];
        let mut pending = jobs.iter().cloned().enumerate();
        let mut running = FuturesUnordered::new();
        let mut interrupted = false;
        tokio::pin!(soft_limit);

        loop {
            while running.len() < self.parallelism {
                match pending.next() {
                    Some((index, job)) => running.push(self.run_job(index, job)),
                    None => break,
                }
            }

            let next = tokio::select! {
                next = running.next() => next,
                _ = &mut soft_limit => {
                    warn!(
                        "Soft time limit reached, cancelling {} remaining simulation job(s)",
                        running.len() + pending.len()
                    );
                    interrupted = true;
                    break;
                }
            };
            let Some((index, job)) = next else {
                break;
            };
            let failed = !job.is_succeeded();
            finished[index] = Some(job);
            if failed && self.fail_fast {
                warn!(
                    "Simulation job failed with fail-fast enabled, cancelling {} remaining job(s)",
                    running.len() + pending.len()
                );
                break;
            }
        }
        drop(running);

        let jobs = jobs
            .into_iter()
            .zip(finished)
            .map(|(job, done)| {
                done.unwrap_or_else(|| {
                    counter!("snowcast_simulation_jobs_total", "status" => "cancelled")
                        .increment(1);
                    SimulationJob {
                        status: SimulationJobStatus::Cancelled,
                        ..job
                    }
                })
            })
            .collect();

        let report = SimulationBatchReport {
            run_id: params.run_id,
            jobs,
        };
        info!(
            "Simulation batch for run {} finished: {}/{} succeeded",
            params.run_id,
            report.succeeded(),
            report.total()
        );
        Ok(BatchExecution {
            report,
            interrupted,
        })
    }

    async fn run_job(&self, index: usize, mut job: SimulationJob) -> (usize, SimulationJob) {
        info!(
            "Starting simulation for config {} -> {}",
            job.config_identifier,
            job.output_path.display()
        );
        let started = Instant::now();
        let result = self.launcher.launch(&job).await;
        job.duration_ms = Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));

        let status = match result {
            Ok(exit) if exit.is_success() => {
                job.exit_code = exit.exit_code;
                info!(
                    "Simulation for config {} succeeded in {}ms",
                    job.config_identifier,
                    job.duration_ms.unwrap_or_default()
                );
                SimulationJobStatus::Succeeded
            }
            Ok(exit) => {
                job.exit_code = exit.exit_code;
                let err = SchedulerError::SimulationProcess {
                    config_identifier: job.config_identifier.clone(),
                    exit_code: exit.exit_code,
                    stderr_tail: exit.stderr_tail.clone(),
                };
                error!(
                    "{}; stderr tail:\n{}",
                    err,
                    exit.stderr_tail.as_deref().unwrap_or("")
                );
                SimulationJobStatus::Failed(err.to_string())
            }
            Err(e) => {
                error!(
                    "Failed to launch simulation for config {}: {}",
                    job.config_identifier, e
                );
                SimulationJobStatus::Failed(e.to_string())
            }
        };

        let label = match status {
            SimulationJobStatus::Succeeded => "succeeded",
            _ => "failed",
        };
        counter!("snowcast_simulation_jobs_total", "status" => label).increment(1);
        job.status = status;
        (index, job)
    }
}

fn config_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn job(run_id: Uuid) -> SimulationJob {
        SimulationJob {
            run_id,
            config_identifier: "wbb".to_string(),
            config_path: PathBuf::from("/srv/config/wbb.ini"),
            input_data_path: PathBuf::from("/srv/runs/input"),
            output_path: PathBuf::from("/srv/results/wbb"),
            end_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            status: SimulationJobStatus::Pending,
            exit_code: None,
            duration_ms: None,
        }
    }

    #[test]
    fn test_command_mounts_inputs_read_only() {
        let launcher = DockerLauncher::new(SimulationConfig::default());
        let args = launcher.command_args(&job(Uuid::new_v4()), "c1").unwrap();
        let joined = args.join(" ");

        assert!(joined.starts_with("run --rm --name c1"));
        assert!(joined.contains("-v /srv/config:/config_to_test:ro"));
        assert!(joined.contains("-v /srv/runs/input:/data:ro"));
        assert!(joined.contains("-v /srv/results/wbb:/output "));
        assert!(joined.ends_with("snowpack-env snowpack -c /config_to_test/wbb.ini -e 2025-06-01T00:00"));
    }

    #[test]
    fn test_command_rejects_relative_paths() {
        let launcher = DockerLauncher::new(SimulationConfig::default());
        let mut relative = job(Uuid::new_v4());
        relative.output_path = PathBuf::from("results/wbb");
        assert!(matches!(
            launcher.command_args(&relative, "c1"),
            Err(SchedulerError::InvalidTaskParams(_))
        ));
    }

    #[test]
    fn test_container_names_are_unique() {
        let job = job(Uuid::new_v4());
        assert_ne!(
            DockerLauncher::container_name(&job),
            DockerLauncher::container_name(&job)
        );
    }
}
