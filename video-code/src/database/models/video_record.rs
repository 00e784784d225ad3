//! Video record database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Durable record of one encoding job.
///
/// Created as PROCESSING at submission and moved exactly once to
/// COMPLETED or FAILED by the executing worker.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct VideoRecordDbModel {
    /// Row id (assigned by the database on insert).
    pub id: i64,
    pub job_id: String,
    pub original_file_name: Option<String>,
    pub original_file_size: Option<i64>,
    /// Blob-store path of the encoded video (COMPLETED only).
    pub storage_path: Option<String>,
    /// Blob-store path of the manifest (COMPLETED only).
    pub manifest_path: Option<String>,
    pub grid_n: Option<i64>,
    pub fps: Option<i64>,
    pub resolution: Option<String>,
    pub enable_fec: Option<bool>,
    pub fec_parity_percent: Option<i64>,
    pub public_key_hint: Option<String>,
    pub private_key_frame_index: Option<i64>,
    pub obfuscation_seed: Option<i64>,
    pub obfuscation_file_path: Option<String>,
    /// Execution mode (e.g. CPU, GPU, CLOUD).
    pub processing_mode: String,
    /// Status: PROCESSING, COMPLETED, FAILED
    pub status: String,
    pub error_message: Option<String>,
    /// ISO 8601 timestamp when the record was created
    pub created_at: String,
    /// ISO 8601 timestamp when the record reached a terminal state
    pub completed_at: Option<String>,
    pub output_video_size: Option<i64>,
    pub output_frame_count: Option<i64>,
}

impl VideoRecordDbModel {
    /// New PROCESSING record for `job_id`. Parameters are filled in by the caller.
    pub fn processing(job_id: impl Into<String>, processing_mode: impl Into<String>) -> Self {
        Self {
            id: 0,
            job_id: job_id.into(),
            original_file_name: None,
            original_file_size: None,
            storage_path: None,
            manifest_path: None,
            grid_n: None,
            fps: None,
            resolution: None,
            enable_fec: None,
            fec_parity_percent: None,
            public_key_hint: None,
            private_key_frame_index: None,
            obfuscation_seed: None,
            obfuscation_file_path: None,
            processing_mode: processing_mode.into(),
            status: RecordStatus::Processing.as_str().to_string(),
            error_message: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
            output_video_size: None,
            output_frame_count: None,
        }
    }

    /// Parsed status. Unknown strings are treated as PROCESSING.
    pub fn record_status(&self) -> RecordStatus {
        RecordStatus::parse(&self.status).unwrap_or(RecordStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        self.record_status().is_terminal()
    }
}

/// Record status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    /// Submitted and waiting for, or undergoing, execution.
    Processing,
    /// Encoded and persisted.
    Completed,
    /// Failed or cancelled.
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Output metadata written when a record is completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedOutput {
    pub storage_path: String,
    pub manifest_path: String,
    pub output_video_size: u64,
    pub output_frame_count: Option<u32>,
}
