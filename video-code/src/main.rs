use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use video_code::config::AppConfig;
use video_code::database::{self, repositories::SqlxVideoRecordRepository};
use video_code::logging::{init_logging, start_retention_cleanup};
use video_code::pipeline::{
    ChannelTransport, CloudEncoder, EncoderSet, JobConsumer, JobConsumerConfig, JobProducer,
    JobRegistry, JobTransport, ScriptEncoder, ScriptEncoderConfig, ServiceConfig,
    SubmitJobCommand, UploadedFile, VideoCodeService,
};
use video_code::policy::{ClientRateLimiter, RateLimitConfig};
use video_code::storage::LocalBlobStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env_or_default();

    let _log_guard = init_logging(&config.log_dir)?;
    let shutdown = CancellationToken::new();
    start_retention_cleanup(config.log_dir.clone(), shutdown.clone());

    // Initialize database
    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    tokio::fs::create_dir_all(&config.workdir).await?;

    let registry = Arc::new(JobRegistry::new());
    let encoders = EncoderSet::new(vec![
        Arc::new(ScriptEncoder::new(
            ScriptEncoderConfig::from_app_config(&config),
            registry.clone(),
        )),
        Arc::new(CloudEncoder::new(Duration::from_millis(
            config.cloud_phase_delay_ms,
        ))),
    ]);
    tracing::info!(encoders = ?encoders.names(), "Encoders configured");
    if encoders.resolve(&config.default_processing_mode).is_err() {
        return Err(video_code::Error::config(format!(
            "no encoder accepts the default processing mode '{}'",
            config.default_processing_mode
        ))
        .into());
    }

    let transport: Arc<dyn JobTransport> = Arc::new(ChannelTransport::new(config.queue_capacity));
    let service = Arc::new(VideoCodeService::new(
        ServiceConfig::from_app_config(&config),
        Arc::new(SqlxVideoRecordRepository::new(pool.clone())),
        Arc::new(LocalBlobStore::new(&config.storage_dir)),
        registry,
        encoders,
        JobProducer::new(transport.clone()),
    ));

    // The queue is in-process, so PROCESSING records from a previous run can
    // never be delivered again.
    service.recover_interrupted().await?;

    let consumer = JobConsumer::new(
        JobConsumerConfig {
            workers: config.consumer_workers,
            ..Default::default()
        },
        service.clone(),
        transport,
    );
    consumer.start()?;

    tracing::info!("video-code initialized successfully");

    // Archives given on the command line are submitted with default parameters
    let limiter = ClientRateLimiter::new(RateLimitConfig::from_app_config(&config));
    for path in std::env::args().skip(1) {
        if !limiter.check("cli").is_allowed() {
            tracing::warn!(path = %path, "Submission rate limit reached, skipping archive");
            continue;
        }
        let cmd = SubmitJobCommand::with_defaults(UploadedFile::from_path(&path), &config);
        match service.submit(cmd).await {
            Ok(job_id) => tracing::info!(job_id = %job_id, path = %path, "Submitted archive"),
            Err(e) => tracing::error!(path = %path, error = %e, "Failed to submit archive"),
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    shutdown.cancel();
    consumer.stop().await;
    pool.close().await;

    tracing::info!("video-code stopped");
    Ok(())
}
