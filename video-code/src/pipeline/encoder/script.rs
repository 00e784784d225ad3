//! Encoder backed by an external script.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use process_utils::{BoundedBuffer, DEFAULT_CAPTURE_LIMIT, drain_bounded};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Encoder, EncodingRequest};
use crate::Result;
use crate::config::AppConfig;
use crate::pipeline::registry::{JobRegistry, ProcessHandle};

/// Progress reported once the encoder process is running.
const ENCODING_PROGRESS: i32 = 20;

/// How long output pipes may stay open after the encoder exits.
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Configuration for [`ScriptEncoder`].
#[derive(Debug, Clone)]
pub struct ScriptEncoderConfig {
    /// Interpreter that runs the script.
    pub interpreter: String,
    pub script_path: PathBuf,
    /// Exported to the script as `FFMPEG_CMD`.
    pub ffmpeg_cmd: String,
    /// Processing modes handled by this encoder.
    pub modes: Vec<String>,
    /// Wall-clock limit for one run.
    pub timeout: Option<Duration>,
    /// Maximum bytes of combined stdout/stderr retained.
    pub capture_limit: usize,
    /// Bound on reading output after exit. Descendants that inherited the
    /// pipes can keep them open indefinitely.
    pub drain_grace: Duration,
}

impl Default for ScriptEncoderConfig {
    fn default() -> Self {
        Self {
            interpreter: "python".to_string(),
            script_path: PathBuf::from("scripts").join("encode_qr_video.py"),
            ffmpeg_cmd: "ffmpeg".to_string(),
            modes: vec!["CPU".to_string(), "GPU".to_string(), "LOCAL".to_string()],
            timeout: None,
            capture_limit: DEFAULT_CAPTURE_LIMIT,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

impl ScriptEncoderConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            interpreter: config.python_cmd.clone(),
            script_path: config.encoder_script.clone(),
            ffmpeg_cmd: config.ffmpeg_cmd.clone(),
            timeout: config.encode_timeout_secs.map(Duration::from_secs),
            ..Default::default()
        }
    }
}

enum RunOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Killed,
    TimedOut,
}

/// Runs the QR video encoding script as a child process.
pub struct ScriptEncoder {
    config: ScriptEncoderConfig,
    registry: Arc<JobRegistry>,
}

impl ScriptEncoder {
    pub fn new(config: ScriptEncoderConfig, registry: Arc<JobRegistry>) -> Self {
        Self { config, registry }
    }

    /// Arguments passed to the script after its path.
    pub fn build_args(request: &EncodingRequest) -> Vec<String> {
        let params = &request.params;
        let mut args = vec![
            "--input".to_string(),
            request.input_path.to_string_lossy().into_owned(),
            "--output".to_string(),
            request.output_path.to_string_lossy().into_owned(),
            "--manifest".to_string(),
            request.manifest_path.to_string_lossy().into_owned(),
            "--grid".to_string(),
            params.grid_n.to_string(),
            "--fps".to_string(),
            params.fps.to_string(),
            "--resolution".to_string(),
            params.resolution.clone(),
            "--enable-fec".to_string(),
            params.enable_fec.to_string(),
            "--fec-ratio".to_string(),
            params.fec_ratio().to_string(),
            "--passphrase".to_string(),
            params.passphrase.clone(),
            "--pubkey-hint".to_string(),
            params.public_key_hint.clone(),
            "--privkey-frame".to_string(),
            params.private_key_frame_index.unwrap_or(0).to_string(),
        ];

        if let Some(password) = &params.private_key_frame_password {
            args.push("--privkey-frame-pass".to_string());
            args.push(password.clone());
        }
        if let Some((width, height)) = params.dimensions() {
            args.push("--width".to_string());
            args.push(width.to_string());
            args.push("--height".to_string());
            args.push(height.to_string());
        }
        if let Some(obf) = &request.obfuscation_path {
            args.push("--obfuscation".to_string());
            args.push(obf.to_string_lossy().into_owned());
        }

        args
    }

    fn spawn_drain<R>(reader: Option<R>, sink: &Arc<Mutex<BoundedBuffer>>) -> Option<JoinHandle<()>>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let reader = reader?;
        let sink = sink.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = drain_bounded(reader, sink).await {
                debug!("Output stream closed with error: {}", e);
            }
        }))
    }

    async fn run(&self, request: &EncodingRequest) -> Result<String> {
        let job_id = request.job_id.as_str();
        let start = Instant::now();

        let mut command = process_utils::tokio_command(&self.config.interpreter);
        command
            .arg(&self.config.script_path)
            .args(Self::build_args(request))
            .env("FFMPEG_CMD", &self.config.ffmpeg_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            crate::Error::Other(format!(
                "Failed to spawn encoder '{}': {}",
                self.config.interpreter, e
            ))
        })?;

        let handle = ProcessHandle::new(child.id());
        self.registry.register(job_id, handle.clone());
        self.registry
            .set_progress(job_id, ENCODING_PROGRESS, "ENCODING");
        info!(job_id = %job_id, pid = ?handle.pid(), "Encoder process started");

        let sink = Arc::new(Mutex::new(BoundedBuffer::new(self.config.capture_limit)));
        let mut readers: Vec<JoinHandle<()>> = [
            Self::spawn_drain(child.stdout.take(), &sink),
            Self::spawn_drain(child.stderr.take(), &sink),
        ]
        .into_iter()
        .flatten()
        .collect();

        let deadline = self.config.timeout;
        let outcome = tokio::select! {
            _ = handle.killed() => {
                let _ = child.kill().await;
                RunOutcome::Killed
            }
            _ = async {
                match deadline {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                let _ = child.kill().await;
                RunOutcome::TimedOut
            }
            status = child.wait() => RunOutcome::Exited(status),
        };

        // The child is gone; nothing is left for a cancel to kill.
        self.registry.remove(job_id);

        if matches!(outcome, RunOutcome::Exited(_)) {
            let mut grace = self.config.drain_grace;
            if let Some(limit) = deadline {
                grace = grace.min(limit.saturating_sub(start.elapsed()));
            }
            let drained = tokio::time::timeout(grace, async {
                for reader in readers.iter_mut() {
                    let _ = reader.await;
                }
            })
            .await;
            if drained.is_err() {
                warn!(
                    job_id = %job_id,
                    "Encoder output still open {:?} after exit, abandoning capture", grace
                );
            }
        }
        for reader in &readers {
            reader.abort();
        }

        let log = {
            let sink = sink.lock();
            if sink.is_truncated() {
                warn!(
                    job_id = %job_id,
                    kept = sink.len(),
                    discarded = sink.discarded(),
                    "Encoder output exceeded capture limit"
                );
            }
            sink.to_string_lossy()
        };
        let elapsed = start.elapsed().as_secs_f64();

        match outcome {
            RunOutcome::Killed => {
                warn!(job_id = %job_id, "Encoder process killed after {:.2}s", elapsed);
                Err(crate::Error::Cancelled)
            }
            RunOutcome::TimedOut => {
                let secs = deadline.map(|d| d.as_secs()).unwrap_or_default();
                error!(job_id = %job_id, "Encoder timed out after {}s", secs);
                Err(crate::Error::Timeout(secs))
            }
            RunOutcome::Exited(Err(e)) => Err(crate::Error::Other(format!(
                "Failed to wait for encoder: {}",
                e
            ))),
            RunOutcome::Exited(Ok(status)) if status.success() => {
                info!(job_id = %job_id, "Encoder finished in {:.2}s", elapsed);
                Ok(log)
            }
            RunOutcome::Exited(Ok(status)) => {
                let code = status.code().unwrap_or(-1);
                error!(job_id = %job_id, code, "Encoder exited unsuccessfully");
                Err(crate::Error::Encoding { code, log })
            }
        }
    }
}

#[async_trait]
impl Encoder for ScriptEncoder {
    fn name(&self) -> &'static str {
        "ScriptEncoder"
    }

    fn supports(&self, mode: &str) -> bool {
        self.config
            .modes
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mode))
    }

    async fn execute(&self, request: &EncodingRequest) -> Result<String> {
        self.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::descriptor::EncodingParams;

    fn request(dir: &std::path::Path) -> EncodingRequest {
        EncodingRequest {
            job_id: "job-1".to_string(),
            input_path: dir.join("input.zip"),
            output_path: dir.join("output.mp4"),
            manifest_path: dir.join("manifest.json"),
            obfuscation_path: None,
            processing_mode: "CPU".to_string(),
            params: EncodingParams::default(),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_build_args_order_and_defaults() {
        let req = request(std::path::Path::new("/w/job-1"));
        let args = ScriptEncoder::build_args(&req);

        let flags: Vec<&str> = args
            .iter()
            .filter(|a| a.starts_with("--"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            flags,
            vec![
                "--input",
                "--output",
                "--manifest",
                "--grid",
                "--fps",
                "--resolution",
                "--enable-fec",
                "--fec-ratio",
                "--passphrase",
                "--pubkey-hint",
                "--privkey-frame",
            ]
        );
        assert_eq!(value_after(&args, "--grid"), Some("2"));
        assert_eq!(value_after(&args, "--enable-fec"), Some("true"));
        assert_eq!(value_after(&args, "--fec-ratio"), Some("0.2"));
        assert_eq!(value_after(&args, "--privkey-frame"), Some("0"));
    }

    #[test]
    fn test_build_args_optional_flags() {
        let mut req = request(std::path::Path::new("/w/job-1"));
        req.obfuscation_path = Some(PathBuf::from("/w/job-1/obfuscation.bin"));
        req.params.private_key_frame_password = Some("secret".to_string());
        req.params.private_key_frame_index = Some(7);
        req.params.fec_parity_percent = Some(50);
        req.params.width = Some(1280);

        let args = ScriptEncoder::build_args(&req);
        assert_eq!(value_after(&args, "--privkey-frame"), Some("7"));
        assert_eq!(value_after(&args, "--privkey-frame-pass"), Some("secret"));
        assert_eq!(value_after(&args, "--fec-ratio"), Some("0.35"));
        assert!(!args.iter().any(|a| a == "--width"));
        assert_eq!(args.last().map(String::as_str), Some("/w/job-1/obfuscation.bin"));

        req.params.height = Some(720);
        let args = ScriptEncoder::build_args(&req);
        assert_eq!(value_after(&args, "--width"), Some("1280"));
        assert_eq!(value_after(&args, "--height"), Some("720"));
    }

    #[test]
    fn test_supports_configured_modes() {
        let encoder = ScriptEncoder::new(
            ScriptEncoderConfig::default(),
            Arc::new(JobRegistry::new()),
        );
        assert!(encoder.supports("CPU"));
        assert!(encoder.supports("gpu"));
        assert!(encoder.supports("LOCAL"));
        assert!(!encoder.supports("CLOUD"));
    }

    #[cfg(unix)]
    fn shell_encoder(
        script: &str,
        dir: &std::path::Path,
        registry: Arc<JobRegistry>,
        timeout: Option<Duration>,
    ) -> ScriptEncoder {
        let script_path = dir.join("encode.sh");
        std::fs::write(&script_path, script).unwrap();
        ScriptEncoder::new(
            ScriptEncoderConfig {
                interpreter: "sh".to_string(),
                script_path,
                ffmpeg_cmd: "my-ffmpeg".to_string(),
                timeout,
                ..Default::default()
            },
            registry,
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_run_writes_outputs_and_clears_registry() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let script = r#"
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    --manifest) man="$2"; shift 2 ;;
    *) shift ;;
  esac
done
printf 'video' > "$out"
printf '{"frames": 4}' > "$man"
echo "ffmpeg=$FFMPEG_CMD"
"#;
        let encoder = shell_encoder(script, dir.path(), registry.clone(), None);
        let req = request(dir.path());

        let log = encoder.execute(&req).await.unwrap();
        assert!(log.contains("ffmpeg=my-ffmpeg"));
        assert_eq!(std::fs::read(&req.output_path).unwrap(), b"video");
        assert!(req.manifest_path.exists());
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_reports_code_and_log() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let encoder = shell_encoder(
            "echo 'bad archive' >&2\nexit 3\n",
            dir.path(),
            registry.clone(),
            None,
        );

        let err = encoder.execute(&request(dir.path())).await.unwrap_err();
        match err {
            crate::Error::Encoding { code, log } => {
                assert_eq!(code, 3);
                assert!(log.contains("bad archive"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_is_bounded() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let script = "i=0\nwhile [ $i -lt 2000 ]; do echo 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx'; i=$((i+1)); done\n";
        let encoder = shell_encoder(script, dir.path(), registry, None);

        let log = encoder.execute(&request(dir.path())).await.unwrap();
        assert_eq!(log.len(), DEFAULT_CAPTURE_LIMIT);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_switch_cancels_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let encoder = Arc::new(shell_encoder(
            "exec sleep 30\n",
            dir.path(),
            registry.clone(),
            None,
        ));
        let req = request(dir.path());

        let task = {
            let encoder = encoder.clone();
            let req = req.clone();
            tokio::spawn(async move { encoder.execute(&req).await })
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        while !registry.is_running("job-1") {
            assert!(Instant::now() < deadline, "process never registered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.stage("job-1"), "ENCODING");
        assert!(registry.cancel("job-1"));

        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(crate::Error::Cancelled)));
        assert!(!registry.is_running("job-1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let encoder = shell_encoder(
            "exec sleep 30\n",
            dir.path(),
            registry.clone(),
            Some(Duration::from_millis(200)),
        );

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            encoder.execute(&request(dir.path())),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(crate::Error::Timeout(_))));
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_descendant_does_not_hold_the_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let script_path = dir.path().join("encode.sh");
        std::fs::write(&script_path, "echo started\nsleep 5 &\nexit 0\n").unwrap();
        let encoder = Arc::new(ScriptEncoder::new(
            ScriptEncoderConfig {
                interpreter: "sh".to_string(),
                script_path,
                timeout: Some(Duration::from_secs(3)),
                drain_grace: Duration::from_millis(300),
                ..Default::default()
            },
            registry.clone(),
        ));
        let req = request(dir.path());

        let started = Instant::now();
        let task = {
            let encoder = encoder.clone();
            let req = req.clone();
            tokio::spawn(async move { encoder.execute(&req).await })
        };

        let result = tokio::time::timeout(Duration::from_secs(4), task)
            .await
            .expect("run held open by background descendant")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(result.unwrap().contains("started"));
        assert!(registry.is_empty());
        assert!(!registry.cancel("job-1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_registry_cleared_once_process_exits() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let encoder = Arc::new(shell_encoder(
            "sleep 5 &\nexit 0\n",
            dir.path(),
            registry.clone(),
            None,
        ));
        let req = request(dir.path());

        let task = {
            let encoder = encoder.clone();
            let req = req.clone();
            tokio::spawn(async move { encoder.execute(&req).await })
        };

        // Still draining output held open by the background sleep.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!registry.is_running("job-1"));
        assert!(!registry.cancel("job-1"));

        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let encoder = ScriptEncoder::new(
            ScriptEncoderConfig {
                interpreter: "definitely-not-a-real-interpreter-binary".to_string(),
                ..Default::default()
            },
            registry.clone(),
        );
        let err = encoder.execute(&request(dir.path())).await.unwrap_err();
        assert!(err.to_string().contains("Failed to spawn encoder"));
        assert!(registry.is_empty());
    }
}
