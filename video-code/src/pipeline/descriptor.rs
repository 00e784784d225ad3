//! Job descriptor: the self-contained message that travels from submission
//! to execution.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

/// Lower bound of the FEC ratio passed to the encoder.
pub const MIN_FEC_RATIO: f64 = 0.15;
/// Upper bound of the FEC ratio passed to the encoder.
pub const MAX_FEC_RATIO: f64 = 0.35;
/// Ratio used when no parity percent was requested.
pub const DEFAULT_FEC_RATIO: f64 = 0.2;

/// FEC ratio derived from an optional parity percent, clamped to
/// `[MIN_FEC_RATIO, MAX_FEC_RATIO]`.
pub fn fec_ratio(parity_percent: Option<u32>) -> f64 {
    match parity_percent {
        None => DEFAULT_FEC_RATIO,
        Some(p) => (f64::from(p) / 100.0).clamp(MIN_FEC_RATIO, MAX_FEC_RATIO),
    }
}

fn default_grid_n() -> u32 {
    2
}

fn default_fps() -> u32 {
    60
}

fn default_resolution() -> String {
    "1080p".to_string()
}

fn default_enable_fec() -> bool {
    true
}

// Older producers send explicit `null` for unset fields; those decode to the
// same defaults as a missing field.

fn nullable_grid_n<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    Ok(Option::deserialize(d)?.unwrap_or_else(default_grid_n))
}

fn nullable_fps<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    Ok(Option::deserialize(d)?.unwrap_or_else(default_fps))
}

fn nullable_resolution<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(default_resolution))
}

fn nullable_enable_fec<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(Option::deserialize(d)?.unwrap_or_else(default_enable_fec))
}

fn nullable_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::deserialize(d)?.unwrap_or_default())
}

/// Encoding parameters shared by the descriptor and the encoder request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingParams {
    #[serde(default = "default_grid_n", deserialize_with = "nullable_grid_n")]
    pub grid_n: u32,
    #[serde(default = "default_fps", deserialize_with = "nullable_fps")]
    pub fps: u32,
    /// Resolution label such as "1080p".
    #[serde(default = "default_resolution", deserialize_with = "nullable_resolution")]
    pub resolution: String,
    /// Explicit frame size. Only used when both are present.
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default = "default_enable_fec", deserialize_with = "nullable_enable_fec")]
    pub enable_fec: bool,
    #[serde(default)]
    pub fec_parity_percent: Option<u32>,
    #[serde(default, deserialize_with = "nullable_string")]
    pub passphrase: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub public_key_hint: String,
    #[serde(default)]
    pub private_key_frame_index: Option<u32>,
    #[serde(default)]
    pub private_key_frame_password: Option<String>,
}

impl Default for EncodingParams {
    fn default() -> Self {
        Self {
            grid_n: default_grid_n(),
            fps: default_fps(),
            resolution: default_resolution(),
            width: None,
            height: None,
            enable_fec: default_enable_fec(),
            fec_parity_percent: None,
            passphrase: String::new(),
            public_key_hint: String::new(),
            private_key_frame_index: None,
            private_key_frame_password: None,
        }
    }
}

impl EncodingParams {
    /// Effective FEC ratio for these parameters.
    pub fn fec_ratio(&self) -> f64 {
        fec_ratio(self.fec_parity_percent)
    }

    /// Explicit frame size when both dimensions are set.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }
}

/// Immutable description of one job, built at submission time.
///
/// Serialized as JSON with camelCase field names. Only `jobId`, `jobDirPath`
/// and `inputZipPath` are required; unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub job_id: String,
    pub job_dir_path: PathBuf,
    pub input_zip_path: PathBuf,
    /// Optional obfuscation input.
    #[serde(default)]
    pub obf_arg: Option<PathBuf>,
    #[serde(flatten)]
    pub params: EncodingParams,
    /// Execution mode. `None` selects the configured default mode.
    #[serde(default)]
    pub processing_mode: Option<String>,
}

impl JobDescriptor {
    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Job id of a payload that does not decode as a full descriptor.
    pub fn peek_job_id(bytes: &[u8]) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
        value
            .get("jobId")?
            .as_str()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    /// Processing mode, falling back to `default_mode`.
    pub fn mode_or<'a>(&'a self, default_mode: &'a str) -> &'a str {
        self.processing_mode
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(default_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fec_ratio_clamping() {
        assert_eq!(fec_ratio(None), 0.2);
        assert_eq!(fec_ratio(Some(5)), 0.15);
        assert_eq!(fec_ratio(Some(20)), 0.2);
        assert_eq!(fec_ratio(Some(50)), 0.35);
        assert_eq!(fec_ratio(Some(0)), 0.15);
        assert!((fec_ratio(Some(30)) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_descriptor_minimal_json_uses_defaults() {
        let json = r#"{
            "jobId": "abc",
            "jobDirPath": "/tmp/abc",
            "inputZipPath": "/tmp/abc/input.zip",
            "someFutureField": 42
        }"#;
        let descriptor = JobDescriptor::from_json(json.as_bytes()).unwrap();

        assert_eq!(descriptor.job_id, "abc");
        assert_eq!(descriptor.params, EncodingParams::default());
        assert_eq!(descriptor.params.grid_n, 2);
        assert_eq!(descriptor.params.fps, 60);
        assert_eq!(descriptor.params.resolution, "1080p");
        assert!(descriptor.params.enable_fec);
        assert!(descriptor.obf_arg.is_none());
        assert_eq!(descriptor.mode_or("CPU"), "CPU");
    }

    #[test]
    fn test_descriptor_explicit_nulls_use_defaults() {
        let json = r#"{
            "jobId": "abc",
            "jobDirPath": "/tmp/abc",
            "inputZipPath": "/tmp/abc/input.zip",
            "obfArg": null,
            "gridN": null,
            "fps": null,
            "resolution": null,
            "enableFec": null,
            "fecParityPercent": null,
            "passphrase": null,
            "publicKeyHint": null,
            "privateKeyFrameIndex": null,
            "privateKeyFramePassword": null,
            "width": null,
            "height": null,
            "processingMode": null
        }"#;
        let descriptor = JobDescriptor::from_json(json.as_bytes()).unwrap();

        assert_eq!(descriptor.params, EncodingParams::default());
        assert!(descriptor.obf_arg.is_none());
        assert_eq!(descriptor.mode_or("CPU"), "CPU");
        assert_eq!(descriptor.params.fec_ratio(), 0.2);
    }

    #[test]
    fn test_descriptor_partial_nulls_keep_values() {
        let json = r#"{
            "jobId": "abc",
            "jobDirPath": "/tmp/abc",
            "inputZipPath": "/tmp/abc/input.zip",
            "gridN": 4,
            "resolution": "720p",
            "enableFec": false,
            "passphrase": "pw",
            "publicKeyHint": null,
            "processingMode": "LOCAL"
        }"#;
        let descriptor = JobDescriptor::from_json(json.as_bytes()).unwrap();

        assert_eq!(descriptor.params.grid_n, 4);
        assert_eq!(descriptor.params.fps, 60);
        assert_eq!(descriptor.params.resolution, "720p");
        assert!(!descriptor.params.enable_fec);
        assert_eq!(descriptor.params.passphrase, "pw");
        assert_eq!(descriptor.params.public_key_hint, "");
        assert_eq!(descriptor.mode_or("CPU"), "LOCAL");
    }

    #[test]
    fn test_peek_job_id() {
        assert_eq!(
            JobDescriptor::peek_job_id(br#"{"jobId": "abc", "gridN": "four"}"#).as_deref(),
            Some("abc")
        );
        assert!(JobDescriptor::peek_job_id(br#"{"jobId": ""}"#).is_none());
        assert!(JobDescriptor::peek_job_id(br#"{"jobId": 7}"#).is_none());
        assert!(JobDescriptor::peek_job_id(b"not json").is_none());
    }

    #[test]
    fn test_descriptor_camel_case_wire_names() {
        let descriptor = JobDescriptor {
            job_id: "j1".to_string(),
            job_dir_path: PathBuf::from("/w/j1"),
            input_zip_path: PathBuf::from("/w/j1/input.zip"),
            obf_arg: Some(PathBuf::from("/w/j1/obfuscation.bin")),
            params: EncodingParams {
                fec_parity_percent: Some(5),
                private_key_frame_index: Some(3),
                ..Default::default()
            },
            processing_mode: Some("GPU".to_string()),
        };

        let value: serde_json::Value =
            serde_json::from_slice(&descriptor.to_json().unwrap()).unwrap();
        assert_eq!(value["jobId"], "j1");
        assert_eq!(value["obfArg"], "/w/j1/obfuscation.bin");
        assert_eq!(value["gridN"], 2);
        assert_eq!(value["fecParityPercent"], 5);
        assert_eq!(value["privateKeyFrameIndex"], 3);
        assert_eq!(value["processingMode"], "GPU");

        let decoded = JobDescriptor::from_json(&descriptor.to_json().unwrap()).unwrap();
        assert_eq!(decoded, descriptor);
        assert_eq!(decoded.mode_or("CPU"), "GPU");
    }

    #[test]
    fn test_dimensions_require_both() {
        let mut params = EncodingParams {
            width: Some(1920),
            ..Default::default()
        };
        assert!(params.dimensions().is_none());
        params.height = Some(1080);
        assert_eq!(params.dimensions(), Some((1920, 1080)));
    }
}
