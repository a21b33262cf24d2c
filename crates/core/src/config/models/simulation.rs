use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 批次内作业的执行方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// 外部模拟程序配置
///
/// 默认通过 `docker run --rm` 在隔离容器中执行 `snowpack`，
/// 配置与输入只读挂载，输出目录可写挂载。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// 容器运行时程序
    pub program: String,
    pub image: String,
    /// 容器内执行的模拟程序
    pub executable: String,
    pub config_mount: String,
    pub data_mount: String,
    pub output_mount: String,
    /// 站点配置文件所在目录
    pub config_dir: PathBuf,
    pub config_extension: String,
    /// 历史 SMET 数据目录，会复制到每次运行的输入目录
    pub historical_data_dir: Option<PathBuf>,
    pub results_dir: PathBuf,
    pub execution_mode: ExecutionMode,
    pub parallelism: usize,
    pub fail_fast: bool,
    /// 追加到运行时命令中的参数，例如资源限制
    pub extra_runtime_args: Vec<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            image: "snowpack-env".to_string(),
            executable: "snowpack".to_string(),
            config_mount: "/config_to_test".to_string(),
            data_mount: "/data".to_string(),
            output_mount: "/output".to_string(),
            config_dir: PathBuf::from("config/snowpack"),
            config_extension: "ini".to_string(),
            historical_data_dir: None,
            results_dir: PathBuf::from("data/results"),
            execution_mode: ExecutionMode::Sequential,
            parallelism: 2,
            fail_fast: false,
            extra_runtime_args: Vec::new(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.program.is_empty() {
            return Err(anyhow::anyhow!("容器运行时程序不能为空"));
        }

        if self.image.is_empty() {
            return Err(anyhow::anyhow!("模拟镜像不能为空"));
        }

        if self.executable.is_empty() {
            return Err(anyhow::anyhow!("模拟程序名不能为空"));
        }

        for (name, mount) in [
            ("config_mount", &self.config_mount),
            ("data_mount", &self.data_mount),
            ("output_mount", &self.output_mount),
        ] {
            if !mount.starts_with('/') {
                return Err(anyhow::anyhow!("{} 必须是容器内绝对路径: {}", name, mount));
            }
        }

        if self.parallelism == 0 {
            return Err(anyhow::anyhow!("并行度必须大于0"));
        }

        if self.config_extension.is_empty() {
            return Err(anyhow::anyhow!("配置文件扩展名不能为空"));
        }

        Ok(())
    }

    /// 实际生效的并发作业数
    pub fn effective_parallelism(&self) -> usize {
        match self.execution_mode {
            ExecutionMode::Sequential => 1,
            ExecutionMode::Parallel => self.parallelism.max(1),
        }
    }
}
