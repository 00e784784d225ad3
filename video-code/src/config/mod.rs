//! Application configuration.
//!
//! Values come from environment variables (a `.env` file is loaded by the
//! binary via `dotenvy`), falling back to defaults for anything unset or
//! unparsable.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default processing mode when a submission does not name one.
pub const DEFAULT_PROCESSING_MODE: &str = "CPU";

/// Encoding parameters applied when a submission leaves them unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingDefaults {
    pub grid_n: u32,
    pub fps: u32,
    pub resolution: String,
    pub enable_fec: bool,
    pub fec_parity_percent: Option<u32>,
}

impl Default for EncodingDefaults {
    fn default() -> Self {
        Self {
            grid_n: 2,
            fps: 60,
            resolution: "1080p".to_string(),
            enable_fec: true,
            fec_parity_percent: Some(20),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database URL.
    pub database_url: String,
    /// Root of the per-job scratch directories.
    pub workdir: PathBuf,
    /// Base directory of the local blob store.
    pub storage_dir: PathBuf,
    /// Interpreter used to run the encoder script.
    pub python_cmd: String,
    /// ffmpeg binary exported to the encoder script as `FFMPEG_CMD`.
    pub ffmpeg_cmd: String,
    /// Path to the encoder script.
    pub encoder_script: PathBuf,
    /// Mode used when a submission does not specify one.
    pub default_processing_mode: String,
    /// Number of consumer workers executing jobs.
    pub consumer_workers: usize,
    /// Capacity of the in-process dispatch channel.
    pub queue_capacity: usize,
    /// Wall-clock limit for one external encode. `None` disables the limit.
    pub encode_timeout_secs: Option<u64>,
    /// Delay used by the simulated cloud encoder per phase, in milliseconds.
    pub cloud_phase_delay_ms: u64,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    /// Requests allowed per client per minute.
    pub rate_limit_per_minute: u32,
    pub defaults: EncodingDefaults,
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for AppConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            database_url: "sqlite:video-code.db?mode=rwc".to_string(),
            workdir: home.join("video-qrcode"),
            storage_dir: home.join("video-store"),
            python_cmd: "python".to_string(),
            ffmpeg_cmd: "ffmpeg".to_string(),
            encoder_script: PathBuf::from("scripts").join("encode_qr_video.py"),
            default_processing_mode: DEFAULT_PROCESSING_MODE.to_string(),
            consumer_workers: 2,
            queue_capacity: 1024,
            encode_timeout_secs: None,
            cloud_phase_delay_ms: 1000,
            log_dir: PathBuf::from("logs"),
            rate_limit_per_minute: 120,
            defaults: EncodingDefaults::default(),
        }
    }
}

/// Read a non-blank environment variable.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Read and parse an environment variable, ignoring values that do not parse.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `DATABASE_URL`
    /// - `VIDEO_CODE_WORKDIR`, `VIDEO_CODE_STORAGE_DIR`, `LOG_DIR`
    /// - `PYTHON_CMD`, `FFMPEG_CMD`, `ENCODER_SCRIPT`
    /// - `DEFAULT_PROCESSING_MODE`, `CONSUMER_WORKERS`, `QUEUE_CAPACITY`
    /// - `ENCODE_TIMEOUT_SECS`, `CLOUD_PHASE_DELAY_MS`, `RATE_LIMIT_PER_MINUTE`
    /// - `DEFAULT_GRID_N`, `DEFAULT_FPS`, `DEFAULT_RESOLUTION`,
    ///   `DEFAULT_ENABLE_FEC`, `DEFAULT_FEC_PARITY_PERCENT`
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Some(url) = env_string("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = env_string("VIDEO_CODE_WORKDIR") {
            config.workdir = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("VIDEO_CODE_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(cmd) = env_string("PYTHON_CMD") {
            config.python_cmd = cmd;
        }
        if let Some(cmd) = env_string("FFMPEG_CMD") {
            config.ffmpeg_cmd = cmd;
        }
        if let Some(script) = env_string("ENCODER_SCRIPT") {
            config.encoder_script = PathBuf::from(script);
        }
        if let Some(mode) = env_string("DEFAULT_PROCESSING_MODE") {
            config.default_processing_mode = mode.trim().to_ascii_uppercase();
        }
        if let Some(workers) = env_parse::<usize>("CONSUMER_WORKERS")
            && workers > 0
        {
            config.consumer_workers = workers;
        }
        if let Some(capacity) = env_parse::<usize>("QUEUE_CAPACITY")
            && capacity > 0
        {
            config.queue_capacity = capacity;
        }
        if let Some(secs) = env_parse::<u64>("ENCODE_TIMEOUT_SECS") {
            config.encode_timeout_secs = (secs > 0).then_some(secs);
        }
        if let Some(ms) = env_parse::<u64>("CLOUD_PHASE_DELAY_MS") {
            config.cloud_phase_delay_ms = ms;
        }
        if let Some(limit) = env_parse::<u32>("RATE_LIMIT_PER_MINUTE")
            && limit > 0
        {
            config.rate_limit_per_minute = limit;
        }

        if let Some(grid) = env_parse::<u32>("DEFAULT_GRID_N") {
            config.defaults.grid_n = grid;
        }
        if let Some(fps) = env_parse::<u32>("DEFAULT_FPS") {
            config.defaults.fps = fps;
        }
        if let Some(resolution) = env_string("DEFAULT_RESOLUTION") {
            config.defaults.resolution = resolution;
        }
        if let Some(enable) = env_parse::<bool>("DEFAULT_ENABLE_FEC") {
            config.defaults.enable_fec = enable;
        }
        if let Some(percent) = env_parse::<u32>("DEFAULT_FEC_PARITY_PERCENT") {
            config.defaults.fec_parity_percent = Some(percent);
        }

        config
    }
}
