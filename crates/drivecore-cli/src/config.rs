//! Configuration Vault – reads/writes `~/.drivecore/config.toml`.

use drivecore_runtime::{Backpressure, ModelRunnerConfig, TrafficConvention};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persisted user configuration stored in `~/.drivecore/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Recorded network outputs played back by the replay backend.
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,

    /// SQLite file backing the params store.
    #[serde(default = "default_params_path")]
    pub params_path: PathBuf,

    #[serde(default = "default_camera_fps")]
    pub camera_fps: f32,

    /// How long modeld waits for a frame before counting a stall.
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,

    #[serde(default = "default_publish_queue_depth")]
    pub publish_queue_depth: usize,

    #[serde(default)]
    pub backpressure: Backpressure,

    #[serde(default = "default_warmup_iterations")]
    pub warmup_iterations: usize,

    #[serde(default)]
    pub traffic_convention: TrafficConvention,

    /// Feed modeld from the built-in synthetic road camera.
    #[serde(default = "default_sim_camera")]
    pub sim_camera: bool,

    /// Ego speed of the synthetic drive, m/s.
    #[serde(default = "default_sim_speed_mps")]
    pub sim_speed_mps: f32,
}

fn default_model_path() -> PathBuf {
    drivecore_dir().join("supercombo.replay")
}
fn default_params_path() -> PathBuf {
    drivecore_dir().join("params.db")
}
fn default_camera_fps() -> f32 {
    20.0
}
fn default_frame_timeout_ms() -> u64 {
    1000
}
fn default_publish_queue_depth() -> usize {
    8
}
fn default_warmup_iterations() -> usize {
    100
}
fn default_sim_camera() -> bool {
    true
}
fn default_sim_speed_mps() -> f32 {
    20.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            params_path: default_params_path(),
            camera_fps: default_camera_fps(),
            frame_timeout_ms: default_frame_timeout_ms(),
            publish_queue_depth: default_publish_queue_depth(),
            backpressure: Backpressure::default(),
            warmup_iterations: default_warmup_iterations(),
            traffic_convention: TrafficConvention::default(),
            sim_camera: default_sim_camera(),
            sim_speed_mps: default_sim_speed_mps(),
        }
    }
}

impl Config {
    /// The perception-loop slice of the configuration.
    pub fn runner_config(&self) -> ModelRunnerConfig {
        ModelRunnerConfig {
            model_path: self.model_path.clone(),
            frame_timeout: Duration::from_millis(self.frame_timeout_ms),
            warmup_iterations: self.warmup_iterations,
            publish_queue_depth: self.publish_queue_depth,
            backpressure: self.backpressure,
            traffic_convention: self.traffic_convention,
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn drivecore_dir() -> PathBuf {
    PathBuf::from(home_dir()).join(".drivecore")
}

/// Return the path to `~/.drivecore/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".drivecore").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Load the config, writing the defaults on first run.
pub fn load_or_init() -> Result<Config, String> {
    let path = config_path();
    match load_from(&path)? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = Config::default();
            save_to(&cfg, &path)?;
            apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
    }
}

/// Apply `DRIVECORE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `DRIVECORE_MODEL_PATH` | `model_path` |
/// | `DRIVECORE_PARAMS_PATH` | `params_path` |
/// | `DRIVECORE_CAMERA_FPS` | `camera_fps` |
/// | `DRIVECORE_FRAME_TIMEOUT_MS` | `frame_timeout_ms` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("DRIVECORE_MODEL_PATH") {
        cfg.model_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("DRIVECORE_PARAMS_PATH") {
        cfg.params_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("DRIVECORE_CAMERA_FPS")
        && let Ok(fps) = v.parse::<f32>()
        && fps > 0.0
    {
        cfg.camera_fps = fps;
    }
    if let Ok(v) = std::env::var("DRIVECORE_FRAME_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.frame_timeout_ms = ms;
    }
}

/// Save the config to a specific path, creating its directory if needed.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
