//! Simulated remote encoder.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{Encoder, EncodingRequest};
use crate::Result;

const PLACEHOLDER_VIDEO: &[u8] = b"Simulated Cloud Video Content";
const PLACEHOLDER_MANIFEST: &[u8] = br#"{"frames": 100, "mock": true}"#;

/// Encoder for the `CLOUD` mode.
///
/// Simulates upload, remote transcoding and download. Guarantees both output
/// artifacts exist on success.
#[derive(Debug, Clone)]
pub struct CloudEncoder {
    phase_delay: Duration,
}

impl CloudEncoder {
    pub fn new(phase_delay: Duration) -> Self {
        Self { phase_delay }
    }
}

impl Default for CloudEncoder {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

async fn write_if_absent(path: &std::path::Path, contents: &[u8]) -> Result<()> {
    if !tokio::fs::try_exists(path).await? {
        tokio::fs::write(path, contents).await?;
    }
    Ok(())
}

#[async_trait]
impl Encoder for CloudEncoder {
    fn name(&self) -> &'static str {
        "CloudEncoder"
    }

    fn supports(&self, mode: &str) -> bool {
        "CLOUD".eq_ignore_ascii_case(mode)
    }

    async fn execute(&self, request: &EncodingRequest) -> Result<String> {
        info!(job_id = %request.job_id, "Starting cloud transcoding");

        info!(
            job_id = %request.job_id,
            input = %request.input_path.display(),
            "[Cloud] Uploading input"
        );
        tokio::time::sleep(self.phase_delay).await;

        info!(
            job_id = %request.job_id,
            grid = request.params.grid_n,
            fps = request.params.fps,
            "[Cloud] Triggering remote transcoding"
        );
        tokio::time::sleep(self.phase_delay * 2).await;

        info!(job_id = %request.job_id, "[Cloud] Downloading results");
        write_if_absent(&request.output_path, PLACEHOLDER_VIDEO).await?;
        write_if_absent(&request.manifest_path, PLACEHOLDER_MANIFEST).await?;

        Ok("Cloud transcoding completed (simulated)".to_string())
    }
}
