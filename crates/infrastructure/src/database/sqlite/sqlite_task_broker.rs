use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use snowcast_core::{
    models::{Task, TaskStatus},
    Clock, QueueStats, SchedulerError, SchedulerResult, SystemClock, TaskBroker,
};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::database::mapping::{from_ms, parse_optional_uuid, parse_uuid, to_ms};

const TASK_COLUMNS: &str = "id, queue_name, handler_name, payload, attempt_count, max_attempts, \
     eta_ms, status, pipeline_run_id, last_error, created_ms, updated_ms";

/// SQLite 持久化任务队列
///
/// 与内存队列语义相同，任务在进程重启后不会丢失，调度进程和 worker 进程
/// 可以共享同一个数据库文件。出队使用单条 `UPDATE ... RETURNING` 语句，
/// 在途数检查与认领在同一写事务内完成。
pub struct SqliteTaskBroker {
    pool: SqlitePool,
    limits: BTreeMap<String, usize>,
    visibility_timeout: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteTaskBroker {
    pub fn new(
        pool: SqlitePool,
        limits: BTreeMap<String, usize>,
        visibility_timeout: Duration,
    ) -> SchedulerResult<Self> {
        Self::with_clock(pool, limits, visibility_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(
        pool: SqlitePool,
        limits: BTreeMap<String, usize>,
        visibility_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> SchedulerResult<Self> {
        let visibility_timeout = chrono::Duration::from_std(visibility_timeout)
            .map_err(|e| SchedulerError::Configuration(format!("可见性超时无效: {e}")))?;
        if let Some((queue, _)) = limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(SchedulerError::Configuration(format!(
                "队列 {queue} 的并发数必须大于0"
            )));
        }
        Ok(Self {
            pool,
            limits,
            visibility_timeout,
            clock,
        })
    }

    fn limit_for(&self, queue: &str) -> SchedulerResult<usize> {
        self.limits
            .get(queue)
            .copied()
            .ok_or_else(|| SchedulerError::MessageQueue(format!("未知队列: {queue}")))
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Task> {
        let id: String = row.try_get("id")?;
        let payload: String = row.try_get("payload")?;
        let status: String = row.try_get("status")?;
        let attempt_count: i64 = row.try_get("attempt_count")?;
        let max_attempts: i64 = row.try_get("max_attempts")?;

        Ok(Task {
            id: parse_uuid(&id)?,
            queue_name: row.try_get("queue_name")?,
            handler_name: row.try_get("handler_name")?,
            payload: serde_json::from_str(&payload)?,
            attempt_count: u32::try_from(attempt_count).unwrap_or(u32::MAX),
            max_attempts: u32::try_from(max_attempts).unwrap_or(0),
            eta: from_ms(row.try_get("eta_ms")?)?,
            status: TaskStatus::parse(&status)?,
            pipeline_run_id: parse_optional_uuid(row.try_get("pipeline_run_id")?)?,
            last_error: row.try_get("last_error")?,
            created_at: from_ms(row.try_get("created_ms")?)?,
            updated_at: from_ms(row.try_get("updated_ms")?)?,
        })
    }

    async fn fetch_task(&self, task_id: Uuid) -> SchedulerResult<Task> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM broker_tasks WHERE id = ?1"
        ))
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_task(&row),
            None => Err(SchedulerError::TaskNotFound { id: task_id }),
        }
    }

    /// 可见性超时的任务重新变为可见，不改变重试计数
    async fn reclaim_expired(&self, queue: &str, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE broker_tasks SET status = 'queued', visible_until_ms = NULL, updated_ms = ?1 \
             WHERE queue_name = ?2 AND status = 'running' AND visible_until_ms <= ?1",
        )
        .bind(to_ms(now))
        .bind(queue)
        .execute(&self.pool)
        .await?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            warn!(
                "{} task(s) in queue {} exceeded visibility timeout, redelivering",
                reclaimed, queue
            );
            counter!("snowcast_broker_redeliveries_total", "queue" => queue.to_string())
                .increment(reclaimed);
        }
        Ok(reclaimed)
    }
}

#[async_trait]
impl TaskBroker for SqliteTaskBroker {
    #[instrument(skip(self, task), fields(task_id = %task.id, handler = %task.handler_name))]
    async fn enqueue(&self, task: Task, queue: &str, eta: DateTime<Utc>) -> SchedulerResult<()> {
        self.limit_for(queue)?;
        let now = self.clock.now();
        let status = if task.status == TaskStatus::Retrying {
            TaskStatus::Retrying
        } else {
            TaskStatus::Queued
        };

        sqlx::query(
            r#"
            INSERT INTO broker_tasks (id, queue_name, handler_name, payload, attempt_count,
                                      max_attempts, eta_ms, status, pipeline_run_id, last_error,
                                      visible_until_ms, created_ms, updated_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11, ?12)
            ON CONFLICT (id) DO UPDATE SET
                queue_name = excluded.queue_name,
                payload = excluded.payload,
                attempt_count = excluded.attempt_count,
                max_attempts = excluded.max_attempts,
                eta_ms = excluded.eta_ms,
                status = excluded.status,
                last_error = excluded.last_error,
                visible_until_ms = NULL,
                updated_ms = excluded.updated_ms
            "#,
        )
        .bind(task.id.to_string())
        .bind(queue)
        .bind(&task.handler_name)
        .bind(serde_json::to_string(&task.payload)?)
        .bind(i64::from(task.attempt_count))
        .bind(i64::from(task.max_attempts))
        .bind(to_ms(eta))
        .bind(status.as_str())
        .bind(task.pipeline_run_id.map(|id| id.to_string()))
        .bind(&task.last_error)
        .bind(to_ms(task.created_at))
        .bind(to_ms(now))
        .execute(&self.pool)
        .await?;

        debug!("Enqueued task {} to queue {} with eta {}", task.id, queue, eta);
        counter!("snowcast_broker_enqueued_total", "queue" => queue.to_string()).increment(1);
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> SchedulerResult<Option<Task>> {
        let limit = self.limit_for(queue)?;
        let now = self.clock.now();
        self.reclaim_expired(queue, now).await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE broker_tasks
            SET status = 'running', visible_until_ms = ?1, updated_ms = ?2
            WHERE id = (
                SELECT id FROM broker_tasks
                WHERE queue_name = ?3 AND status IN ('queued', 'retrying') AND eta_ms <= ?2
                ORDER BY eta_ms, rowid
                LIMIT 1
            )
            AND (SELECT COUNT(*) FROM broker_tasks WHERE queue_name = ?3 AND status = 'running') < ?4
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(to_ms(now + self.visibility_timeout))
        .bind(to_ms(now))
        .bind(queue)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn ack(&self, task_id: Uuid) -> SchedulerResult<()> {
        let result = sqlx::query("DELETE FROM broker_tasks WHERE id = ?1")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound { id: task_id });
        }
        Ok(())
    }

    async fn nack(&self, task_id: Uuid, retry_delay: Duration) -> SchedulerResult<Task> {
        let now = self.clock.now();
        let mut task = self.fetch_task(task_id).await?;
        task.schedule_retry(retry_delay, now)?;

        // 以旧的计数为条件，避免并发 nack 重复递增
        let result = sqlx::query(
            "UPDATE broker_tasks SET attempt_count = ?1, eta_ms = ?2, status = 'retrying', \
             visible_until_ms = NULL, updated_ms = ?3 WHERE id = ?4 AND attempt_count = ?5",
        )
        .bind(i64::from(task.attempt_count))
        .bind(to_ms(task.eta))
        .bind(to_ms(now))
        .bind(task_id.to_string())
        .bind(i64::from(task.attempt_count - 1))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::MessageQueue(format!(
                "任务 {task_id} 在重试期间被并发修改"
            )));
        }
        Ok(task)
    }

    async fn fail(&self, task_id: Uuid, error: &str) -> SchedulerResult<Task> {
        let now = self.clock.now();
        let result = sqlx::query(
            "UPDATE broker_tasks SET status = 'failed_permanent', last_error = ?1, \
             visible_until_ms = NULL, updated_ms = ?2 WHERE id = ?3",
        )
        .bind(error)
        .bind(to_ms(now))
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound { id: task_id });
        }
        self.fetch_task(task_id).await
    }

    async fn queue_stats(&self, queue: &str) -> SchedulerResult<QueueStats> {
        let limit = self.limit_for(queue)?;
        let now = to_ms(self.clock.now());
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status IN ('queued', 'retrying') AND eta_ms <= ?2 THEN 1 ELSE 0 END), 0) AS ready,
                COALESCE(SUM(CASE WHEN status IN ('queued', 'retrying') AND eta_ms > ?2 THEN 1 ELSE 0 END), 0) AS delayed,
                COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0) AS in_flight,
                COALESCE(SUM(CASE WHEN status = 'failed_permanent' THEN 1 ELSE 0 END), 0) AS failed
            FROM broker_tasks WHERE queue_name = ?1
            "#,
        )
        .bind(queue)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let count = |name: &str| -> SchedulerResult<usize> {
            let value: i64 = row.try_get(name)?;
            Ok(usize::try_from(value).unwrap_or(0))
        };

        Ok(QueueStats {
            queue: queue.to_string(),
            ready: count("ready")?,
            delayed: count("delayed")?,
            in_flight: count("in_flight")?,
            failed: count("failed")?,
            concurrency_limit: limit,
        })
    }

    async fn failed_tasks(&self, queue: Option<&str>) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM broker_tasks \
             WHERE status = 'failed_permanent' AND (?1 IS NULL OR queue_name = ?1) \
             ORDER BY updated_ms"
        ))
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }
}
