//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use video_code::database::repositories::{SqlxVideoRecordRepository, VideoRecordRepository};
use video_code::database::{self, DbPool};
use video_code::pipeline::{
    ChannelTransport, Encoder, EncoderSet, EncodingRequest, JOB_TOPIC, JobDescriptor,
    JobProducer, JobRegistry, JobTransport, ServiceConfig, Subscription, VideoCodeService,
};
use video_code::storage::LocalBlobStore;

pub async fn test_pool(dir: &TempDir) -> DbPool {
    let db_path = dir.path().join("video_code.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );
    let pool = database::init_pool(&db_url).await.unwrap();
    database::run_migrations(&pool).await.unwrap();
    pool
}

/// Encoder that writes fixed artifacts for the modes it supports.
pub struct WritingEncoder {
    pub modes: Vec<&'static str>,
    pub video: Vec<u8>,
    pub manifest: Vec<u8>,
    pub calls: AtomicUsize,
    pub last_request: parking_lot::Mutex<Option<EncodingRequest>>,
}

impl WritingEncoder {
    pub fn new(modes: Vec<&'static str>) -> Self {
        Self {
            modes,
            video: b"0123456789abcdef".to_vec(),
            manifest: br#"{"frames": 42}"#.to_vec(),
            calls: AtomicUsize::new(0),
            last_request: parking_lot::Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encoder for WritingEncoder {
    fn name(&self) -> &'static str {
        "WritingEncoder"
    }

    fn supports(&self, mode: &str) -> bool {
        self.modes.iter().any(|m| m.eq_ignore_ascii_case(mode))
    }

    async fn execute(&self, request: &EncodingRequest) -> video_code::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());
        tokio::fs::write(&request.output_path, &self.video).await?;
        tokio::fs::write(&request.manifest_path, &self.manifest).await?;
        Ok("encoded".to_string())
    }
}

/// Encoder that exits like a failed external tool.
pub struct FailingEncoder {
    pub mode: &'static str,
}

#[async_trait]
impl Encoder for FailingEncoder {
    fn name(&self) -> &'static str {
        "FailingEncoder"
    }

    fn supports(&self, mode: &str) -> bool {
        self.mode.eq_ignore_ascii_case(mode)
    }

    async fn execute(&self, _request: &EncodingRequest) -> video_code::Result<String> {
        Err(video_code::Error::Encoding {
            code: 2,
            log: "corrupt archive".to_string(),
        })
    }
}

/// Encoder that reports success without producing anything.
pub struct SilentEncoder {
    pub mode: &'static str,
}

#[async_trait]
impl Encoder for SilentEncoder {
    fn name(&self) -> &'static str {
        "SilentEncoder"
    }

    fn supports(&self, mode: &str) -> bool {
        self.mode.eq_ignore_ascii_case(mode)
    }

    async fn execute(&self, _request: &EncodingRequest) -> video_code::Result<String> {
        Ok(String::new())
    }
}

/// Encoder whose job gets finalized by someone else while it runs.
pub struct RacingEncoder {
    pub inner: WritingEncoder,
    pub records: parking_lot::Mutex<Option<Arc<SqlxVideoRecordRepository>>>,
}

#[async_trait]
impl Encoder for RacingEncoder {
    fn name(&self) -> &'static str {
        "RacingEncoder"
    }

    fn supports(&self, mode: &str) -> bool {
        self.inner.supports(mode)
    }

    async fn execute(&self, request: &EncodingRequest) -> video_code::Result<String> {
        let records = self.records.lock().clone();
        if let Some(records) = records {
            records.fail(&request.job_id, "finalized elsewhere").await?;
        }
        self.inner.execute(request).await
    }
}

/// Encoder that panics.
pub struct PanickingEncoder {
    pub mode: &'static str,
}

#[async_trait]
impl Encoder for PanickingEncoder {
    fn name(&self) -> &'static str {
        "PanickingEncoder"
    }

    fn supports(&self, mode: &str) -> bool {
        self.mode.eq_ignore_ascii_case(mode)
    }

    async fn execute(&self, _request: &EncodingRequest) -> video_code::Result<String> {
        panic!("encoder exploded");
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub workdir: PathBuf,
    pub storage_dir: PathBuf,
    pub pool: DbPool,
    pub records: Arc<SqlxVideoRecordRepository>,
    pub transport: Arc<ChannelTransport>,
    pub registry: Arc<JobRegistry>,
    pub service: Arc<VideoCodeService>,
}

impl Harness {
    pub async fn new(encoders: Vec<Arc<dyn Encoder>>) -> Self {
        Self::with_registry(encoders, Arc::new(JobRegistry::new())).await
    }

    pub async fn with_registry(encoders: Vec<Arc<dyn Encoder>>, registry: Arc<JobRegistry>) -> Self {
        let dir = TempDir::new().unwrap();
        let workdir = dir.path().join("work");
        let storage_dir = dir.path().join("store");
        let pool = test_pool(&dir).await;
        let records = Arc::new(SqlxVideoRecordRepository::new(pool.clone()));
        let transport = Arc::new(ChannelTransport::new(64));
        let dyn_transport: Arc<dyn JobTransport> = transport.clone();

        let service = Arc::new(VideoCodeService::new(
            ServiceConfig {
                workdir: workdir.clone(),
                default_processing_mode: "CPU".to_string(),
            },
            records.clone(),
            Arc::new(LocalBlobStore::new(&storage_dir)),
            registry.clone(),
            EncoderSet::new(encoders),
            JobProducer::new(dyn_transport),
        ));

        Self {
            dir,
            workdir,
            storage_dir,
            pool,
            records,
            transport,
            registry,
            service,
        }
    }

    pub fn subscribe(&self) -> Arc<dyn Subscription> {
        self.transport.subscribe(JOB_TOPIC).unwrap()
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.workdir.join(job_id)
    }
}

/// Take the next published descriptor.
pub async fn next_descriptor(subscription: &Arc<dyn Subscription>) -> JobDescriptor {
    let delivery = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("no job published")
        .expect("topic closed");
    JobDescriptor::from_json(&delivery.payload).unwrap()
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
