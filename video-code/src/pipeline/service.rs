//! Job orchestrator.
//!
//! Owns the job lifecycle: submission writes the working directory, creates a
//! PROCESSING record and publishes a descriptor; execution runs an encoder and
//! finalizes the record to COMPLETED or FAILED exactly once.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::Result;
use crate::config::AppConfig;
use crate::database::models::{CompletedOutput, RecordStatus, VideoRecordDbModel};
use crate::database::repositories::VideoRecordRepository;
use crate::pipeline::descriptor::{EncodingParams, JobDescriptor};
use crate::pipeline::dispatch::JobProducer;
use crate::pipeline::encoder::{EncoderSet, EncodingRequest};
use crate::pipeline::registry::JobRegistry;
use crate::storage::BlobStore;

pub const INPUT_FILE_NAME: &str = "input.zip";
pub const OBFUSCATION_FILE_NAME: &str = "obfuscation.bin";
pub const OUTPUT_FILE_NAME: &str = "output.mp4";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Records fetched per round when recovering interrupted jobs.
const RECOVERY_BATCH: i64 = 100;

/// Uploaded content, either already on disk or in memory.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

/// A file supplied by the caller of [`VideoCodeService::submit`].
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Client-side file name, recorded for reference.
    pub file_name: Option<String>,
    pub source: UploadSource,
}

impl UploadedFile {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Self {
            file_name,
            source: UploadSource::Path(path),
        }
    }

    pub fn from_bytes(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: Some(file_name.into()),
            source: UploadSource::Bytes(bytes.into()),
        }
    }

    async fn size(&self) -> Result<u64> {
        match &self.source {
            UploadSource::Path(path) => Ok(tokio::fs::metadata(path).await?.len()),
            UploadSource::Bytes(bytes) => Ok(bytes.len() as u64),
        }
    }

    /// Copy the content to `target`, returning the number of bytes written.
    async fn copy_to(&self, target: &Path) -> Result<u64> {
        match &self.source {
            UploadSource::Path(path) => Ok(tokio::fs::copy(path, target).await?),
            UploadSource::Bytes(bytes) => {
                tokio::fs::write(target, bytes).await?;
                Ok(bytes.len() as u64)
            }
        }
    }
}

/// Parameters of a submission.
#[derive(Debug, Clone)]
pub struct SubmitJobCommand {
    pub file: UploadedFile,
    pub params: EncodingParams,
    pub obfuscation_seed: Option<i64>,
    /// Optional secondary input. Ignored when empty.
    pub obfuscation_file: Option<UploadedFile>,
    /// `None` selects the configured default mode.
    pub processing_mode: Option<String>,
}

impl SubmitJobCommand {
    pub fn new(file: UploadedFile) -> Self {
        Self {
            file,
            params: EncodingParams::default(),
            obfuscation_seed: None,
            obfuscation_file: None,
            processing_mode: None,
        }
    }

    /// Command with parameters taken from the configured defaults.
    pub fn with_defaults(file: UploadedFile, config: &AppConfig) -> Self {
        let defaults = &config.defaults;
        let mut cmd = Self::new(file);
        cmd.params.grid_n = defaults.grid_n;
        cmd.params.fps = defaults.fps;
        cmd.params.resolution = defaults.resolution.clone();
        cmd.params.enable_fec = defaults.enable_fec;
        cmd.params.fec_parity_percent = defaults.fec_parity_percent;
        cmd
    }
}

/// Job state as exposed to status callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: String,
    /// Record row id.
    pub id: i64,
    pub status: RecordStatus,
    pub error: Option<String>,
    pub progress: u8,
    pub stage: String,
    pub storage_path: Option<String>,
    pub manifest_path: Option<String>,
    pub output_video_size: Option<i64>,
    pub output_frame_count: Option<i64>,
}

/// Stored artifacts of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutput {
    pub job_id: String,
    pub storage_path: PathBuf,
    pub manifest_path: PathBuf,
}

/// Message recorded for jobs left PROCESSING by a previous run.
pub const INTERRUPTED_MESSAGE: &str = "Interrupted before completion";

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub workdir: PathBuf,
    pub default_processing_mode: String,
}

impl ServiceConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            workdir: config.workdir.clone(),
            default_processing_mode: config.default_processing_mode.clone(),
        }
    }
}

/// Scoped owner of a job's working directory.
///
/// The directory is removed exactly once: explicitly through [`WorkDir::remove`],
/// or on drop if that never happened.
struct WorkDir {
    path: PathBuf,
    armed: bool,
}

impl WorkDir {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Keep the directory on disk and release ownership.
    fn release(mut self) {
        self.armed = false;
    }

    async fn remove(mut self) {
        self.armed = false;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Removed working directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove working directory")
            }
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// Best-effort read of the `frames` field of a manifest.
///
/// Accepts integers, floats (truncated) and numeric strings.
pub fn parse_frame_count(manifest: &[u8]) -> Option<u32> {
    let value: serde_json::Value = serde_json::from_slice(manifest).ok()?;
    let frames = match value.get("frames")? {
        serde_json::Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f.trunc() as u64)
        })?,
        serde_json::Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f.trunc() as u64)
            })?
        }
        _ => return None,
    };
    u32::try_from(frames).ok()
}

/// Job orchestrator.
pub struct VideoCodeService {
    config: ServiceConfig,
    records: Arc<dyn VideoRecordRepository>,
    blobs: Arc<dyn BlobStore>,
    registry: Arc<JobRegistry>,
    encoders: EncoderSet,
    producer: JobProducer,
}

impl VideoCodeService {
    pub fn new(
        config: ServiceConfig,
        records: Arc<dyn VideoRecordRepository>,
        blobs: Arc<dyn BlobStore>,
        registry: Arc<JobRegistry>,
        encoders: EncoderSet,
        producer: JobProducer,
    ) -> Self {
        Self {
            config,
            records,
            blobs,
            registry,
            encoders,
            producer,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.config.workdir.join(job_id)
    }

    /// Accept a job and queue it for execution. Returns the new job id.
    pub async fn submit(&self, cmd: SubmitJobCommand) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        let job_dir = self.job_dir(&job_id);
        tokio::fs::create_dir_all(&job_dir).await?;
        let work_dir = WorkDir::new(job_dir.clone());

        match self.stage_and_publish(&job_id, &job_dir, cmd).await {
            Ok(()) => {
                work_dir.release();
                info!(job_id = %job_id, "Job submitted");
                Ok(job_id)
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Job submission failed");
                work_dir.remove().await;
                Err(e)
            }
        }
    }

    async fn stage_and_publish(
        &self,
        job_id: &str,
        job_dir: &Path,
        cmd: SubmitJobCommand,
    ) -> Result<()> {
        let input_path = job_dir.join(INPUT_FILE_NAME);
        let input_size = cmd.file.copy_to(&input_path).await?;

        let mut obf_path = None;
        if let Some(obf) = &cmd.obfuscation_file
            && obf.size().await? > 0
        {
            let path = job_dir.join(OBFUSCATION_FILE_NAME);
            obf.copy_to(&path).await?;
            obf_path = Some(path);
        }

        let mode = cmd
            .processing_mode
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.config.default_processing_mode.as_str())
            .to_string();

        let params = cmd.params;
        let mut record = VideoRecordDbModel::processing(job_id, mode.clone());
        record.original_file_name = cmd.file.file_name.clone();
        record.original_file_size = Some(input_size as i64);
        record.grid_n = Some(i64::from(params.grid_n));
        record.fps = Some(i64::from(params.fps));
        record.resolution = Some(params.resolution.clone());
        record.enable_fec = Some(params.enable_fec);
        record.fec_parity_percent = params.fec_parity_percent.map(i64::from);
        record.public_key_hint = Some(params.public_key_hint.clone());
        record.private_key_frame_index = params.private_key_frame_index.map(i64::from);
        record.obfuscation_seed = cmd.obfuscation_seed;
        record.obfuscation_file_path = obf_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        self.records.insert(&record).await?;

        let descriptor = JobDescriptor {
            job_id: job_id.to_string(),
            job_dir_path: job_dir.to_path_buf(),
            input_zip_path: input_path,
            obf_arg: obf_path,
            params,
            processing_mode: Some(mode),
        };

        if let Err(e) = self.producer.send_job(&descriptor).await {
            if let Err(fail_err) = self.records.fail(job_id, &e.to_string()).await {
                error!(job_id = %job_id, error = %fail_err, "Failed to mark unpublished job as failed");
            }
            return Err(e);
        }

        Ok(())
    }

    /// Execute a delivered job. Never returns an error; every outcome is
    /// recorded on the job's record.
    pub async fn execute_job(&self, descriptor: &JobDescriptor) {
        let job_id = descriptor.job_id.as_str();

        let record = match self.records.find_by_job_id(job_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                error!(job_id = %job_id, "Job record not found, dropping delivery");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to load job record, dropping delivery");
                self.mark_failed(job_id, &format!("Failed to load job record: {}", e))
                    .await;
                self.registry.remove(job_id);
                WorkDir::new(descriptor.job_dir_path.clone()).remove().await;
                return;
            }
        };

        if record.is_terminal() {
            info!(
                job_id = %job_id,
                status = %record.status,
                "Job already finalized, ignoring redelivery"
            );
            return;
        }

        let work_dir = WorkDir::new(descriptor.job_dir_path.clone());
        info!(job_id = %job_id, "Job started");

        match self.run_job(descriptor).await {
            Ok(true) => {
                self.registry.set_progress(job_id, 100, "DONE");
                info!(job_id = %job_id, "Job done");
            }
            Ok(false) => {
                warn!(job_id = %job_id, "Record was finalized concurrently, completion not applied");
            }
            Err(e) => {
                let mut message = e.to_string();
                if message.trim().is_empty() {
                    message = format!("{:?}", e);
                }
                self.mark_failed(job_id, &message).await;
                error!(job_id = %job_id, error = %message, "Job failed");
            }
        }

        self.registry.remove(job_id);
        work_dir.remove().await;
    }

    /// Run the encoder and persist its artifacts. Returns whether the record
    /// transitioned to COMPLETED.
    async fn run_job(&self, descriptor: &JobDescriptor) -> Result<bool> {
        let job_id = descriptor.job_id.as_str();
        self.registry.set_progress(job_id, 5, "SAVED_INPUT");

        let job_dir = &descriptor.job_dir_path;
        let mode = descriptor.mode_or(&self.config.default_processing_mode);
        let request = EncodingRequest {
            job_id: job_id.to_string(),
            input_path: descriptor.input_zip_path.clone(),
            output_path: job_dir.join(OUTPUT_FILE_NAME),
            manifest_path: job_dir.join(MANIFEST_FILE_NAME),
            obfuscation_path: descriptor.obf_arg.clone(),
            processing_mode: mode.to_string(),
            params: descriptor.params.clone(),
        };

        let encoder = self.encoders.resolve(mode)?;
        debug!(job_id = %job_id, encoder = encoder.name(), mode = %mode, "Encoder selected");
        let log = encoder.execute(&request).await?;
        debug!(job_id = %job_id, "Encoder output: {}", log);

        self.registry.set_progress(job_id, 60, "PERSISTING");
        let output_video_size = tokio::fs::metadata(&request.output_path).await?.len();
        let storage_path = self
            .blobs
            .store_file(&request.output_path, &format!("{}.mp4", job_id))
            .await?;
        let manifest_path = self
            .blobs
            .store_file(&request.manifest_path, &format!("{}-manifest.json", job_id))
            .await?;

        let output_frame_count = match tokio::fs::read(&request.manifest_path).await {
            Ok(bytes) => parse_frame_count(&bytes),
            Err(_) => None,
        };

        let output = CompletedOutput {
            storage_path,
            manifest_path,
            output_video_size,
            output_frame_count,
        };
        self.records.complete(job_id, &output).await
    }

    async fn mark_failed(&self, job_id: &str, message: &str) {
        let current = i32::from(self.registry.progress(job_id));
        self.registry.set_progress(job_id, current, "FAILED");
        match self.records.fail(job_id, message).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job_id, "Record already finalized, failure not applied")
            }
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to mark job as failed"),
        }
    }

    /// Finalize a job whose delivery could not be decoded.
    ///
    /// Only ids of the form this service generates are honored, so a
    /// malformed payload can never point the cleanup outside the work dir.
    pub async fn reject(&self, job_id: &str, message: &str) {
        if Uuid::parse_str(job_id).is_err() {
            warn!(job_id = %job_id, "Ignoring rejected delivery with a foreign job id");
            return;
        }
        match self.records.find_by_job_id(job_id).await {
            Ok(Some(record)) if !record.is_terminal() => {
                WorkDir::new(self.job_dir(job_id)).remove().await;
                self.mark_failed(job_id, message).await;
                self.registry.remove(job_id);
                warn!(job_id = %job_id, error = %message, "Rejected undecodable job");
            }
            Ok(_) => debug!(job_id = %job_id, "No pending record for rejected delivery"),
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to load record of rejected delivery"),
        }
    }

    /// Fail every PROCESSING record left behind by a previous run and remove
    /// its working directory. Returns the number of records finalized.
    ///
    /// Must run before any consumer starts.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        loop {
            let batch = self
                .records
                .list_by_status(RecordStatus::Processing, RECOVERY_BATCH)
                .await?;
            if batch.is_empty() {
                break;
            }
            let mut progressed = false;
            for record in batch {
                if self.records.fail(&record.job_id, INTERRUPTED_MESSAGE).await? {
                    recovered += 1;
                    progressed = true;
                }
                WorkDir::new(self.job_dir(&record.job_id)).remove().await;
            }
            if !progressed {
                break;
            }
        }
        if recovered > 0 {
            warn!(count = recovered, "Failed jobs interrupted by a previous shutdown");
        }
        Ok(recovered)
    }

    /// Finalize a job whose execution was aborted outside the normal path.
    pub async fn abandon(&self, job_id: &str, message: &str) {
        self.registry.cancel(job_id);
        self.mark_failed(job_id, message).await;
        self.registry.remove(job_id);
    }

    /// Kill the running process of `job_id`.
    ///
    /// Returns `false` when nothing is running. The record is marked FAILED
    /// with "Cancelled" by the executing worker.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        if self.records.find_by_job_id(job_id).await?.is_none() {
            return Err(crate::Error::not_found("VideoRecord", job_id));
        }
        let cancelled = self.registry.cancel(job_id);
        info!(job_id = %job_id, cancelled, "Cancel requested");
        Ok(cancelled)
    }

    /// Current state of `job_id`, or `None` for an unknown job.
    pub async fn status(&self, job_id: &str) -> Result<Option<JobStatusView>> {
        let Some(record) = self.records.find_by_job_id(job_id).await? else {
            return Ok(None);
        };
        let status = record.record_status();
        let (progress, stage) = match status {
            RecordStatus::Completed => (100, "DONE".to_string()),
            RecordStatus::Failed => (self.registry.progress(job_id), "FAILED".to_string()),
            RecordStatus::Processing => (self.registry.progress(job_id), self.registry.stage(job_id)),
        };
        Ok(Some(JobStatusView {
            job_id: record.job_id,
            id: record.id,
            status,
            error: record.error_message,
            progress,
            stage,
            storage_path: record.storage_path,
            manifest_path: record.manifest_path,
            output_video_size: record.output_video_size,
            output_frame_count: record.output_frame_count,
        }))
    }

    /// Stored artifacts of the completed job with record row id `id`.
    pub async fn output_by_id(&self, id: i64) -> Result<JobOutput> {
        let record = self
            .records
            .find_by_id(id)
            .await?
            .ok_or_else(|| crate::Error::not_found("VideoRecord", id.to_string()))?;
        Self::completed_output(record)
    }

    /// Stored artifacts of the completed job `job_id`.
    pub async fn output_by_job_id(&self, job_id: &str) -> Result<JobOutput> {
        let record = self
            .records
            .find_by_job_id(job_id)
            .await?
            .ok_or_else(|| crate::Error::not_found("VideoRecord", job_id))?;
        Self::completed_output(record)
    }

    fn completed_output(record: VideoRecordDbModel) -> Result<JobOutput> {
        if record.record_status() != RecordStatus::Completed {
            return Err(crate::Error::validation(format!(
                "Job {} is {}, not COMPLETED",
                record.job_id, record.status
            )));
        }
        match (record.storage_path, record.manifest_path) {
            (Some(storage_path), Some(manifest_path)) => Ok(JobOutput {
                job_id: record.job_id,
                storage_path: PathBuf::from(storage_path),
                manifest_path: PathBuf::from(manifest_path),
            }),
            _ => Err(crate::Error::Other(format!(
                "Completed job {} has no stored artifacts",
                record.job_id
            ))),
        }
    }

    pub fn progress(&self, job_id: &str) -> u8 {
        self.registry.progress(job_id)
    }

    pub fn stage(&self, job_id: &str) -> String {
        self.registry.stage(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_count() {
        assert_eq!(parse_frame_count(br#"{"frames": 42}"#), Some(42));
        assert_eq!(parse_frame_count(br#"{"frames": 100, "mock": true}"#), Some(100));
        assert_eq!(parse_frame_count(br#"{"frames": 42.0}"#), Some(42));
        assert_eq!(parse_frame_count(br#"{"frames": 42.9}"#), Some(42));
        assert_eq!(parse_frame_count(br#"{"frames": "42"}"#), Some(42));
        assert_eq!(parse_frame_count(br#"{"frames": " 7.5 "}"#), Some(7));
        assert_eq!(parse_frame_count(br#"{"frames": "many"}"#), None);
        assert_eq!(parse_frame_count(br#"{"frames": null}"#), None);
        assert_eq!(parse_frame_count(br#"{"frames": -1}"#), None);
        assert_eq!(parse_frame_count(br#"{"other": 1}"#), None);
        assert_eq!(parse_frame_count(b"not json"), None);
    }

    #[tokio::test]
    async fn test_workdir_guard_removes_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("job");
        std::fs::create_dir_all(path.join("nested")).unwrap();
        std::fs::write(path.join("nested").join("f"), b"x").unwrap();

        WorkDir::new(path.clone()).remove().await;
        assert!(!path.exists());

        // Already gone: no error
        WorkDir::new(path.clone()).remove().await;
    }

    #[test]
    fn test_workdir_guard_drop_and_release() {
        let dir = tempfile::TempDir::new().unwrap();
        let dropped = dir.path().join("dropped");
        let kept = dir.path().join("kept");
        std::fs::create_dir_all(&dropped).unwrap();
        std::fs::create_dir_all(&kept).unwrap();

        drop(WorkDir::new(dropped.clone()));
        WorkDir::new(kept.clone()).release();

        assert!(!dropped.exists());
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn test_uploaded_file_copy() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("archive.zip");
        std::fs::write(&src, b"0123456789").unwrap();

        let upload = UploadedFile::from_path(&src);
        assert_eq!(upload.file_name.as_deref(), Some("archive.zip"));
        assert_eq!(upload.size().await.unwrap(), 10);
        let target = dir.path().join("copy");
        assert_eq!(upload.copy_to(&target).await.unwrap(), 10);

        let upload = UploadedFile::from_bytes("a.bin", Vec::new());
        assert_eq!(upload.size().await.unwrap(), 0);
    }

    #[test]
    fn test_submit_command_with_defaults() {
        let config = AppConfig::default();
        let upload = UploadedFile::from_bytes("a", b"x".to_vec());
        let cmd = SubmitJobCommand::with_defaults(upload, &config);
        assert_eq!(cmd.params.grid_n, 2);
        assert_eq!(cmd.params.fps, 60);
        assert_eq!(cmd.params.fec_parity_percent, Some(20));
        assert!(cmd.processing_mode.is_none());
    }
}
