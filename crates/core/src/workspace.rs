use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::{models::ObservationBatch, SchedulerResult};

/// 单次运行的目录布局
///
/// ```text
/// <work_dir>/<run_id>/input/            采集结果与历史数据，只读挂载给模拟程序
/// <results_dir>/<run_id>/<config_stem>/ 每个配置独立的输出目录
/// ```
///
/// 输出目录由 `(run_id, config_stem)` 唯一确定，同一批次中的作业不会写到同一位置。
#[derive(Debug, Clone)]
pub struct RunWorkspace {
    work_dir: PathBuf,
    results_dir: PathBuf,
}

impl RunWorkspace {
    pub fn new(work_dir: impl Into<PathBuf>, results_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            results_dir: results_dir.into(),
        }
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.work_dir.join(run_id.to_string())
    }

    pub fn input_dir(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("input")
    }

    pub fn results_root(&self, run_id: Uuid) -> PathBuf {
        self.results_dir.join(run_id.to_string())
    }

    pub fn output_dir(&self, run_id: Uuid, config_stem: &str) -> PathBuf {
        self.results_root(run_id).join(config_stem)
    }

    /// 写入采集到的观测批次，每个站点一个 JSON 文件，重复写入会覆盖
    pub async fn write_batches(
        &self,
        run_id: Uuid,
        batches: &[ObservationBatch],
    ) -> SchedulerResult<PathBuf> {
        let input_dir = self.input_dir(run_id);
        tokio::fs::create_dir_all(&input_dir).await?;

        for batch in batches {
            let path = input_dir.join(format!("{}.json", station_file_stem(&batch.station_id)));
            let body = serde_json::to_vec_pretty(batch)?;
            tokio::fs::write(&path, body).await?;
            debug!(
                "Wrote {} records for station {} to {}",
                batch.processed_count(),
                batch.station_id,
                path.display()
            );
        }

        Ok(input_dir)
    }

    /// 把历史数据目录复制到运行的输入目录，返回复制的文件数
    pub async fn copy_historical(&self, run_id: Uuid, source: &Path) -> SchedulerResult<usize> {
        let target = self.input_dir(run_id);
        copy_dir(source, &target).await
    }
}

/// 站点 ID 来自外部接口，编码为安全的文件名
///
/// 字母、数字和 `-` 原样保留，其余字节写成 `_XX`。`_` 自身也会被编码，
/// 所以不同的站点 ID 不会映射到同一个文件。
fn station_file_stem(id: &str) -> String {
    let mut encoded = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("_{byte:02X}"));
        }
    }
    encoded
}

async fn copy_dir(source: &Path, target: &Path) -> SchedulerResult<usize> {
    tokio::fs::create_dir_all(target).await?;
    let mut copied = 0;
    let mut stack = vec![(source.to_path_buf(), target.to_path_buf())];

    while let Some((from, to)) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let dest = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                tokio::fs::create_dir_all(&dest).await?;
                stack.push((entry.path(), dest));
            } else {
                tokio::fs::copy(entry.path(), &dest).await?;
                copied += 1;
            }
        }
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimeRange;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_similar_station_ids_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let ws = RunWorkspace::new(dir.path().join("work"), dir.path().join("results"));
        let run_id = Uuid::new_v4();
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(),
        );

        let ids = ["WBB.1", "WBB_1", "WBB/1", "WBB-1"];
        let batches: Vec<_> = ids
            .iter()
            .map(|id| ObservationBatch::new(*id, range))
            .collect();
        let input = ws.write_batches(run_id, &batches).await.unwrap();

        let written = std::fs::read_dir(&input).unwrap().count();
        assert_eq!(written, ids.len());
        assert!(input.join("WBB-1.json").exists());
        assert!(input.join("WBB_2E1.json").exists());
        assert!(input.join("WBB_5F1.json").exists());
    }

    #[test]
    fn test_output_dirs_are_distinct_per_config() {
        let ws = RunWorkspace::new("/work", "/results");
        let run_id = Uuid::new_v4();
        let a = ws.output_dir(run_id, "station_a");
        let b = ws.output_dir(run_id, "station_b");
        assert_ne!(a, b);
        assert!(a.starts_with(ws.results_root(run_id)));
        assert_ne!(ws.output_dir(Uuid::new_v4(), "station_a"), a);
    }

    #[tokio::test]
    async fn test_write_batches_and_copy_historical() {
        let dir = tempfile::tempdir().unwrap();
        let ws = RunWorkspace::new(dir.path().join("work"), dir.path().join("results"));
        let run_id = Uuid::new_v4();

        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(),
        );
        let input = ws
            .write_batches(run_id, &[ObservationBatch::new("WBB/1", range)])
            .await
            .unwrap();
        assert!(input.join("WBB_2F1.json").exists());

        let history = dir.path().join("smet");
        std::fs::create_dir_all(history.join("sno")).unwrap();
        std::fs::write(history.join("WBB.smet"), "SMET 1.1 ASCII").unwrap();
        std::fs::write(history.join("sno").join("WBB.sno"), "SMET 1.1 ASCII").unwrap();

        let copied = ws.copy_historical(run_id, &history).await.unwrap();
        assert_eq!(copied, 2);
        assert!(input.join("sno").join("WBB.sno").exists());
    }
}
