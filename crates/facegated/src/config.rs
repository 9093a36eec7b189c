use facegate_core::{
    DetectionFilter, EnrollmentConfig, PipelineConfig, QualityFilter, ReenrollPolicy,
};
use facegate_hw::CameraConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Used when `FACEGATE_CONFIG` is unset. Missing is fine; defaults apply.
const DEFAULT_CONFIG_PATH: &str = "/etc/facegate/facegate.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration: defaults, then the TOML file, then `FACEGATE_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Cosine similarity at or above which a probe is accepted.
    pub accept_threshold: f32,
    /// Cosine similarity below which a probe is rejected outright.
    pub reject_threshold: f32,
    /// Top-two margin under which a decision is ambiguous.
    pub ambiguity_epsilon: f32,
    pub detection_confidence_min: f32,
    /// Shorter bounding-box side, in pixels, below which faces are ignored.
    pub min_face_size: f32,
    pub enrollment_sample_count: usize,
    pub enrollment_min_valid_samples: usize,
    pub enrollment_quality_min: f32,
    pub enrollment_consistency_min: f32,
    pub frame_capture_timeout_ms: u64,
    pub reenroll_policy: ReenrollPolicy,
    pub max_embeddings_per_identity: usize,
    /// V4L2 device path.
    pub camera_device: String,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Frames discarded at startup while exposure settles.
    pub warmup_frames: usize,
    pub frame_queue_capacity: usize,
    /// Consecutive accepted recognitions before an access event is recorded.
    pub access_confirm_frames: u32,
    /// Repeat recognitions this soon after the last event are ignored.
    pub access_reentry_secs: u64,
    pub unknown_log_interval_secs: u64,
    /// Claim the bus name on the session bus instead of the system bus.
    pub use_session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        Self {
            accept_threshold: 0.45,
            reject_threshold: 0.30,
            ambiguity_epsilon: 0.03,
            detection_confidence_min: 0.5,
            min_face_size: 80.0,
            enrollment_sample_count: 5,
            enrollment_min_valid_samples: 3,
            enrollment_quality_min: 0.5,
            enrollment_consistency_min: 0.45,
            frame_capture_timeout_ms: 1000,
            reenroll_policy: ReenrollPolicy::Replace,
            max_embeddings_per_identity: 50,
            camera_device: "/dev/video0".to_string(),
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("facegate.db"),
            warmup_frames: 4,
            frame_queue_capacity: 2,
            access_confirm_frames: 5,
            access_reentry_secs: 60,
            unknown_log_interval_secs: 10,
            use_session_bus: false,
        }
    }
}

impl Config {
    /// Load from `FACEGATE_CONFIG` (or the default path, when present) and
    /// apply environment overrides. Does not validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("FACEGATE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `FACEGATE_<FIELD>` variables resolved by `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let env = Env(&lookup);
        env.set(&mut self.accept_threshold, "FACEGATE_ACCEPT_THRESHOLD")?;
        env.set(&mut self.reject_threshold, "FACEGATE_REJECT_THRESHOLD")?;
        env.set(&mut self.ambiguity_epsilon, "FACEGATE_AMBIGUITY_EPSILON")?;
        env.set(&mut self.detection_confidence_min, "FACEGATE_DETECTION_CONFIDENCE_MIN")?;
        env.set(&mut self.min_face_size, "FACEGATE_MIN_FACE_SIZE")?;
        env.set(&mut self.enrollment_sample_count, "FACEGATE_ENROLLMENT_SAMPLE_COUNT")?;
        env.set(&mut self.enrollment_min_valid_samples, "FACEGATE_ENROLLMENT_MIN_VALID_SAMPLES")?;
        env.set(&mut self.enrollment_quality_min, "FACEGATE_ENROLLMENT_QUALITY_MIN")?;
        env.set(&mut self.enrollment_consistency_min, "FACEGATE_ENROLLMENT_CONSISTENCY_MIN")?;
        env.set(&mut self.frame_capture_timeout_ms, "FACEGATE_FRAME_CAPTURE_TIMEOUT_MS")?;
        env.set(&mut self.reenroll_policy, "FACEGATE_REENROLL_POLICY")?;
        env.set(&mut self.max_embeddings_per_identity, "FACEGATE_MAX_EMBEDDINGS_PER_IDENTITY")?;
        env.set(&mut self.camera_device, "FACEGATE_CAMERA_DEVICE")?;
        env.set(&mut self.model_dir, "FACEGATE_MODEL_DIR")?;
        env.set(&mut self.db_path, "FACEGATE_DB_PATH")?;
        env.set(&mut self.warmup_frames, "FACEGATE_WARMUP_FRAMES")?;
        env.set(&mut self.frame_queue_capacity, "FACEGATE_FRAME_QUEUE_CAPACITY")?;
        env.set(&mut self.access_confirm_frames, "FACEGATE_ACCESS_CONFIRM_FRAMES")?;
        env.set(&mut self.access_reentry_secs, "FACEGATE_ACCESS_REENTRY_SECS")?;
        env.set(&mut self.unknown_log_interval_secs, "FACEGATE_UNKNOWN_LOG_INTERVAL_SECS")?;
        env.flag(&mut self.use_session_bus, "FACEGATE_USE_SESSION_BUS");
        Ok(())
    }

    /// Reject combinations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        for (key, value) in [
            ("detection_confidence_min", self.detection_confidence_min),
            ("enrollment_quality_min", self.enrollment_quality_min),
            ("enrollment_consistency_min", self.enrollment_consistency_min),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{key} ({value}) must be within 0.0..=1.0"));
            }
        }
        for (key, value) in [
            ("accept_threshold", self.accept_threshold),
            ("reject_threshold", self.reject_threshold),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                return invalid(format!("{key} ({value}) must be a cosine similarity in -1.0..=1.0"));
            }
        }
        if !self.min_face_size.is_finite() || self.min_face_size < 0.0 {
            return invalid(format!("min_face_size ({}) must not be negative", self.min_face_size));
        }
        if self.reject_threshold > self.accept_threshold {
            return invalid(format!(
                "reject_threshold ({}) exceeds accept_threshold ({})",
                self.reject_threshold, self.accept_threshold
            ));
        }
        if self.ambiguity_epsilon.is_nan() || self.ambiguity_epsilon < 0.0 {
            return invalid("ambiguity_epsilon must not be negative".into());
        }
        if self.enrollment_sample_count == 0 {
            return invalid("enrollment_sample_count must be at least 1".into());
        }
        if self.enrollment_min_valid_samples == 0
            || self.enrollment_min_valid_samples > self.enrollment_sample_count
        {
            return invalid(format!(
                "enrollment_min_valid_samples ({}) must be in 1..={}",
                self.enrollment_min_valid_samples, self.enrollment_sample_count
            ));
        }
        if !(1..=2).contains(&self.frame_queue_capacity) {
            return invalid(format!(
                "frame_queue_capacity ({}) must be 1 or 2",
                self.frame_queue_capacity
            ));
        }
        if self.frame_capture_timeout_ms == 0 {
            return invalid("frame_capture_timeout_ms must be positive".into());
        }
        if self.max_embeddings_per_identity == 0 {
            return invalid("max_embeddings_per_identity must be at least 1".into());
        }
        if self.access_confirm_frames == 0 {
            return invalid("access_confirm_frames must be at least 1".into());
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn detection_filter(&self) -> DetectionFilter {
        DetectionFilter {
            confidence_min: self.detection_confidence_min,
            min_face_size: self.min_face_size,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let detection = self.detection_filter();
        PipelineConfig {
            capture_timeout: Duration::from_millis(self.frame_capture_timeout_ms),
            frame_queue_capacity: self.frame_queue_capacity,
            warmup_frames: self.warmup_frames,
            detection,
            enrollment: EnrollmentConfig {
                sample_count: self.enrollment_sample_count,
                min_valid_samples: self.enrollment_min_valid_samples,
                consistency_min: self.enrollment_consistency_min,
                quality: QualityFilter::new(self.enrollment_quality_min),
                detection,
                reenroll_policy: self.reenroll_policy,
            },
        }
    }

    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            queue_capacity: self.frame_queue_capacity,
            ..CameraConfig::default()
        }
    }
}

/// Environment lookup with typed parsing.
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn set<T: FromStr>(&self, field: &mut T, key: &'static str) -> Result<(), ConfigError> {
        if let Some(value) = (self.0)(key) {
            *field = value
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { key, value })?;
        }
        Ok(())
    }

    /// Any value other than "0" or "false" enables the flag.
    fn flag(&self, field: &mut bool, key: &'static str) {
        if let Some(value) = (self.0)(key) {
            *field = value != "0" && !value.eq_ignore_ascii_case("false");
        }
    }
}
