//! Video record repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{CompletedOutput, RecordStatus, VideoRecordDbModel};

/// Video record repository trait.
///
/// Terminal updates are conditional on the row still being PROCESSING and
/// report whether the transition happened, so a record is finalized at most
/// once even if a job is executed twice.
#[async_trait]
pub trait VideoRecordRepository: Send + Sync {
    /// Insert a record and return its row id.
    async fn insert(&self, record: &VideoRecordDbModel) -> Result<i64>;
    async fn find_by_job_id(&self, job_id: &str) -> Result<Option<VideoRecordDbModel>>;
    async fn find_by_id(&self, id: i64) -> Result<Option<VideoRecordDbModel>>;
    async fn list_by_status(
        &self,
        status: RecordStatus,
        limit: i64,
    ) -> Result<Vec<VideoRecordDbModel>>;
    /// PROCESSING → COMPLETED. Returns `false` if the record was not PROCESSING.
    async fn complete(&self, job_id: &str, output: &CompletedOutput) -> Result<bool>;
    /// PROCESSING → FAILED. Returns `false` if the record was not PROCESSING.
    async fn fail(&self, job_id: &str, error_message: &str) -> Result<bool>;
}

/// SQLx implementation of VideoRecordRepository.
pub struct SqlxVideoRecordRepository {
    pool: SqlitePool,
}

impl SqlxVideoRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VideoRecordRepository for SqlxVideoRecordRepository {
    async fn insert(&self, record: &VideoRecordDbModel) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO video_records (
                job_id, original_file_name, original_file_size, grid_n, fps, resolution,
                enable_fec, fec_parity_percent, public_key_hint, private_key_frame_index,
                obfuscation_seed, obfuscation_file_path, processing_mode, status,
                error_message, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.job_id)
        .bind(&record.original_file_name)
        .bind(record.original_file_size)
        .bind(record.grid_n)
        .bind(record.fps)
        .bind(&record.resolution)
        .bind(record.enable_fec)
        .bind(record.fec_parity_percent)
        .bind(&record.public_key_hint)
        .bind(record.private_key_frame_index)
        .bind(record.obfuscation_seed)
        .bind(&record.obfuscation_file_path)
        .bind(&record.processing_mode)
        .bind(&record.status)
        .bind(&record.error_message)
        .bind(&record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn find_by_job_id(&self, job_id: &str) -> Result<Option<VideoRecordDbModel>> {
        let record = sqlx::query_as::<_, VideoRecordDbModel>(
            "SELECT * FROM video_records WHERE job_id = ? LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<VideoRecordDbModel>> {
        let record =
            sqlx::query_as::<_, VideoRecordDbModel>("SELECT * FROM video_records WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    async fn list_by_status(
        &self,
        status: RecordStatus,
        limit: i64,
    ) -> Result<Vec<VideoRecordDbModel>> {
        let records = sqlx::query_as::<_, VideoRecordDbModel>(
            "SELECT * FROM video_records WHERE status = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn complete(&self, job_id: &str, output: &CompletedOutput) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE video_records SET
                status = 'COMPLETED',
                storage_path = ?,
                manifest_path = ?,
                output_video_size = ?,
                output_frame_count = ?,
                completed_at = ?
            WHERE job_id = ? AND status = 'PROCESSING'
            "#,
        )
        .bind(&output.storage_path)
        .bind(&output.manifest_path)
        .bind(output.output_video_size as i64)
        .bind(output.output_frame_count.map(i64::from))
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail(&self, job_id: &str, error_message: &str) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE video_records SET
                status = 'FAILED',
                error_message = ?,
                completed_at = ?
            WHERE job_id = ? AND status = 'PROCESSING'
            "#,
        )
        .bind(error_message)
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
