use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snowcast_core::{
    models::{
        ObservationBatch, PipelineRun, PipelineRunQuery, PipelineStage, SimulationResultRecord,
        Station,
    },
    ObservationRepository, PipelineRunRepository, SchedulerResult, SimulationResultRepository,
    StationRepository,
};
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::database::mapping::{from_ms, parse_uuid, to_ms};

/// SQLite 数据存储，实现全部仓储接口
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_station(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Station> {
        let active: i64 = row.try_get("active")?;
        let last_fetch_ms: Option<i64> = row.try_get("last_fetch_ms")?;
        Ok(Station {
            id: row.try_get("id")?,
            external_identifier: row.try_get("external_identifier")?,
            name: row.try_get("name")?,
            active: active != 0,
            last_fetch_time: last_fetch_ms.map(from_ms).transpose()?,
        })
    }

    fn row_to_result(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<SimulationResultRecord> {
        let run_id: String = row.try_get("run_id")?;
        let output_path: String = row.try_get("output_path")?;
        let output_files: String = row.try_get("output_files")?;
        let exit_code: Option<i64> = row.try_get("exit_code")?;
        let duration_ms: Option<i64> = row.try_get("duration_ms")?;
        Ok(SimulationResultRecord {
            run_id: parse_uuid(&run_id)?,
            config_identifier: row.try_get("config_identifier")?,
            output_path: PathBuf::from(output_path),
            output_files: serde_json::from_str(&output_files)?,
            exit_code: exit_code.and_then(|c| i32::try_from(c).ok()),
            duration_ms: duration_ms.and_then(|d| u64::try_from(d).ok()),
            created_at: from_ms(row.try_get("created_ms")?)?,
        })
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<PipelineRun> {
        let id: String = row.try_get("id")?;
        let stage: String = row.try_get("stage")?;
        let stages: String = row.try_get("stages")?;
        Ok(PipelineRun {
            id: parse_uuid(&id)?,
            trigger_label: row.try_get("trigger_label")?,
            stage: PipelineStage::parse(&stage)?,
            stages: serde_json::from_str(&stages)?,
            created_at: from_ms(row.try_get("created_ms")?)?,
            updated_at: from_ms(row.try_get("updated_ms")?)?,
        })
    }
}

#[async_trait]
impl StationRepository for SqliteStore {
    async fn upsert(&self, station: &Station) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stations (id, external_identifier, name, active, last_fetch_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (id) DO UPDATE SET
                external_identifier = excluded.external_identifier,
                name = excluded.name,
                active = excluded.active,
                last_fetch_ms = excluded.last_fetch_ms
            "#,
        )
        .bind(station.id)
        .bind(&station.external_identifier)
        .bind(&station.name)
        .bind(i64::from(station.active))
        .bind(station.last_fetch_time.map(to_ms))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_active(&self) -> SchedulerResult<Vec<Station>> {
        let rows = sqlx::query(
            "SELECT id, external_identifier, name, active, last_fetch_ms \
             FROM stations WHERE active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_station).collect()
    }

    async fn get_by_external_id(
        &self,
        external_identifier: &str,
    ) -> SchedulerResult<Option<Station>> {
        let row = sqlx::query(
            "SELECT id, external_identifier, name, active, last_fetch_ms \
             FROM stations WHERE external_identifier = ?1",
        )
        .bind(external_identifier)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_station).transpose()
    }

    async fn update_last_fetch_time(
        &self,
        external_identifiers: &[String],
        fetched_until: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let mut updated = 0;
        let mut tx = self.pool.begin().await?;
        for identifier in external_identifiers {
            let result = sqlx::query(
                "UPDATE stations SET last_fetch_ms = ?1 \
                 WHERE external_identifier = ?2 AND (last_fetch_ms IS NULL OR last_fetch_ms < ?1)",
            )
            .bind(to_ms(fetched_until))
            .bind(identifier)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }
}

#[async_trait]
impl ObservationRepository for SqliteStore {
    #[instrument(skip(self, batch), fields(station = %batch.station_id, records = batch.records.len()))]
    async fn upsert_batch(&self, batch: &ObservationBatch) -> SchedulerResult<u64> {
        let start = to_ms(batch.time_range.start);
        let end = to_ms(batch.time_range.end);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM observations WHERE station_id = ?1 AND batch_start_ms = ?2 AND batch_end_ms = ?3",
        )
        .bind(&batch.station_id)
        .bind(start)
        .bind(end)
        .execute(&mut *tx)
        .await?;

        let mut written = 0;
        for record in &batch.records {
            let result = sqlx::query(
                r#"
                INSERT INTO observations (station_id, batch_start_ms, batch_end_ms, observed_ms, observed_values)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (station_id, batch_start_ms, batch_end_ms, observed_ms)
                DO UPDATE SET observed_values = excluded.observed_values
                "#,
            )
            .bind(&batch.station_id)
            .bind(start)
            .bind(end)
            .bind(to_ms(record.observed_at))
            .bind(serde_json::to_string(&record.values)?)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;

        debug!("Stored {} observation rows", written);
        Ok(written)
    }

    async fn count_records(&self, station_id: Option<&str>) -> SchedulerResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM observations WHERE (?1 IS NULL OR station_id = ?1)",
        )
        .bind(station_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM observations WHERE observed_ms < ?1")
            .bind(to_ms(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SimulationResultRepository for SqliteStore {
    async fn upsert_result(&self, record: &SimulationResultRecord) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO simulation_results (run_id, config_identifier, output_path, output_files,
                                            exit_code, duration_ms, created_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (run_id, config_identifier) DO UPDATE SET
                output_path = excluded.output_path,
                output_files = excluded.output_files,
                exit_code = excluded.exit_code,
                duration_ms = excluded.duration_ms
            "#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.config_identifier)
        .bind(record.output_path.to_string_lossy().into_owned())
        .bind(serde_json::to_string(&record.output_files)?)
        .bind(record.exit_code.map(i64::from))
        .bind(record.duration_ms.and_then(|d| i64::try_from(d).ok()))
        .bind(to_ms(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn results_for_run(&self, run_id: Uuid) -> SchedulerResult<Vec<SimulationResultRecord>> {
        let rows = sqlx::query(
            "SELECT run_id, config_identifier, output_path, output_files, exit_code, duration_ms, created_ms \
             FROM simulation_results WHERE run_id = ?1 ORDER BY config_identifier",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_result).collect()
    }

    async fn count_results(&self) -> SchedulerResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM simulation_results")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM simulation_results WHERE created_ms < ?1")
            .bind(to_ms(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PipelineRunRepository for SqliteStore {
    async fn create(&self, run: &PipelineRun) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline_runs (id, trigger_label, stage, stages, created_ms, updated_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(run.id.to_string())
        .bind(&run.trigger_label)
        .bind(run.stage.as_str())
        .bind(serde_json::to_string(&run.stages)?)
        .bind(to_ms(run.created_at))
        .bind(to_ms(run.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: Uuid) -> SchedulerResult<Option<PipelineRun>> {
        let row = sqlx::query(
            "SELECT id, trigger_label, stage, stages, created_ms, updated_ms \
             FROM pipeline_runs WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn update(&self, run: &PipelineRun, expected: PipelineStage) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE pipeline_runs SET stage = ?1, stages = ?2, updated_ms = ?3 \
             WHERE id = ?4 AND stage = ?5",
        )
        .bind(run.stage.as_str())
        .bind(serde_json::to_string(&run.stages)?)
        .bind(to_ms(run.updated_at))
        .bind(run.id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn query(&self, query: &PipelineRunQuery) -> SchedulerResult<Vec<PipelineRun>> {
        // SQLite 中 LIMIT -1 表示不限制
        let limit = query
            .limit
            .and_then(|l| i64::try_from(l).ok())
            .unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT id, trigger_label, stage, stages, created_ms, updated_ms
            FROM pipeline_runs
            WHERE (?1 IS NULL OR trigger_label = ?1)
              AND (?2 IS NULL OR created_ms >= ?2)
              AND (?3 IS NULL OR created_ms < ?3)
            ORDER BY created_ms DESC, id
            LIMIT ?4
            "#,
        )
        .bind(query.trigger_label.as_deref())
        .bind(query.created_from.map(to_ms))
        .bind(query.created_to.map(to_ms))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_run).collect()
    }
}
