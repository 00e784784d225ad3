//! Encoding strategies.
//!
//! Each [`Encoder`] declares which processing modes it accepts. The
//! [`EncoderSet`] picks the first one that accepts a job's mode.

mod cloud;
mod script;

pub use cloud::CloudEncoder;
pub use script::{ScriptEncoder, ScriptEncoderConfig};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::pipeline::descriptor::EncodingParams;

/// Everything an encoder needs to run one job.
#[derive(Debug, Clone)]
pub struct EncodingRequest {
    pub job_id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub manifest_path: PathBuf,
    pub obfuscation_path: Option<PathBuf>,
    pub processing_mode: String,
    pub params: EncodingParams,
}

/// An encoding strategy.
#[async_trait]
pub trait Encoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this encoder handles `mode`. Comparison is case-insensitive.
    fn supports(&self, mode: &str) -> bool;

    /// Produce the output video and manifest at the request's paths and
    /// return the captured log output.
    async fn execute(&self, request: &EncodingRequest) -> Result<String>;
}

/// Ordered set of encoders with first-match resolution.
#[derive(Clone, Default)]
pub struct EncoderSet {
    encoders: Vec<Arc<dyn Encoder>>,
}

impl EncoderSet {
    pub fn new(encoders: Vec<Arc<dyn Encoder>>) -> Self {
        Self { encoders }
    }

    /// First encoder supporting `mode`.
    pub fn resolve(&self, mode: &str) -> Result<Arc<dyn Encoder>> {
        let mode = mode.trim();
        self.encoders
            .iter()
            .find(|e| e.supports(mode))
            .cloned()
            .ok_or_else(|| crate::Error::NoEncoder(mode.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.encoders.iter().map(|e| e.name()).collect()
    }
}

impl std::fmt::Debug for EncoderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderSet")
            .field("encoders", &self.names())
            .finish()
    }
}
