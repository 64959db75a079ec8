use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("distance_threshold must be in (0, 2], got {0}")]
    InvalidThreshold(f32),
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

impl BusKind {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "session" => Some(Self::Session),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Optional TOML file; every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    distance_threshold: Option<f32>,
    extract_timeout_secs: Option<u64>,
    require_blink: Option<bool>,
    liveness_window_secs: Option<u64>,
    liveness_session_ttl_secs: Option<u64>,
    bus: Option<BusKind>,
}

/// Daemon configuration: optional TOML file, then `VOTEGATE_*` environment overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine distance threshold; `None` uses the model's own default.
    pub distance_threshold: Option<f32>,
    /// Upper bound on a single engine request (decode + inference).
    pub extract_timeout_secs: u64,
    /// Require a recent blink in the caller's liveness session before accepting a face.
    pub require_blink: bool,
    /// How old the last blink may be when `require_blink` is set.
    pub liveness_window_secs: u64,
    /// Idle liveness sessions are dropped after this many seconds.
    pub liveness_session_ttl_secs: u64,
    pub bus: BusKind,
}

impl Config {
    /// Load from `$VOTEGATE_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("VOTEGATE_CONFIG") {
            Ok(path) => read_file(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("votegate");

        let distance_threshold = parse_env(&env, "VOTEGATE_DISTANCE_THRESHOLD").or(file.distance_threshold);
        if let Some(t) = distance_threshold {
            // Cosine distance lives in [0, 2]; the comparison also rejects NaN.
            if !(t > 0.0 && t <= 2.0) {
                return Err(ConfigError::InvalidThreshold(t));
            }
        }

        Ok(Self {
            model_dir: env("VOTEGATE_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(|| data_dir.join("models")),
            db_path: env("VOTEGATE_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("votegate.db")),
            distance_threshold,
            extract_timeout_secs: parse_env(&env, "VOTEGATE_EXTRACT_TIMEOUT_SECS")
                .or(file.extract_timeout_secs)
                .unwrap_or(10),
            require_blink: env("VOTEGATE_REQUIRE_BLINK")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .or(file.require_blink)
                .unwrap_or(false),
            liveness_window_secs: parse_env(&env, "VOTEGATE_LIVENESS_WINDOW_SECS")
                .or(file.liveness_window_secs)
                .unwrap_or(30),
            liveness_session_ttl_secs: parse_env(&env, "VOTEGATE_LIVENESS_SESSION_TTL_SECS")
                .or(file.liveness_session_ttl_secs)
                .unwrap_or(300),
            bus: env("VOTEGATE_BUS")
                .and_then(|v| BusKind::parse(&v))
                .or(file.bus)
                .unwrap_or_default(),
        })
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

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn liveness_session_ttl(&self) -> Duration {
        Duration::from_secs(self.liveness_session_ttl_secs)
    }
}

fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.parse().ok())
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
