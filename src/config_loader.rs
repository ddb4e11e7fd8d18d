/// Configuration loader for the time-lapse controller
///
/// Single source of truth: autoslice.yaml, one block per hostname plus a
/// `default` block. Host keys override default keys; anything still missing
/// falls back to the built-in values below.

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::timelapse::CaptureErrorPolicy;

pub const DEFAULT_BAUD: u32 = 115200;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_RESET_DELAY_MS: u64 = 2000;
pub const DEFAULT_ADVANCE_CMD: &str = "c2f1";
pub const DEFAULT_CAMERA_CMD: &str = "libcamera-still";
pub const DEFAULT_PREVIEW_GEOMETRY: &str = "0,0,1280,960";
pub const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 1;
pub const DEFAULT_CAPTURE_WATCHDOG_SECS: u64 = 30;

const DEFAULT_SECTION: &str = "default";

/// One block of autoslice.yaml. Every key is optional.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct HostConfig {
    pub ard_port: Option<String>,
    pub ard_baud: Option<u32>,
    pub ard_read_timeout_ms: Option<u64>,
    pub ard_reset_delay_ms: Option<u64>,
    pub ard_advance_cmd: Option<String>,
    pub camera_cmd: Option<String>,
    pub camera_preview_geometry: Option<String>,
    pub capture_timeout_ms: Option<u64>,
    pub capture_watchdog_secs: Option<u64>,
    pub capture_awb: Option<String>,
    pub capture_ev: Option<i32>,
    pub capture_on_error: Option<String>,
    pub compensate_drift: Option<bool>,
    pub output_dir: Option<String>,
    pub interval_secs: Option<u64>,
    pub duration_secs: Option<u64>,
    pub shutter_us: Option<u64>,
    pub gain: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl HostConfig {
    /// Keys set in `host` win over keys set in `self`.
    pub fn overlay(self, host: HostConfig) -> HostConfig {
        HostConfig {
            ard_port: host.ard_port.or(self.ard_port),
            ard_baud: host.ard_baud.or(self.ard_baud),
            ard_read_timeout_ms: host.ard_read_timeout_ms.or(self.ard_read_timeout_ms),
            ard_reset_delay_ms: host.ard_reset_delay_ms.or(self.ard_reset_delay_ms),
            ard_advance_cmd: host.ard_advance_cmd.or(self.ard_advance_cmd),
            camera_cmd: host.camera_cmd.or(self.camera_cmd),
            camera_preview_geometry: host.camera_preview_geometry.or(self.camera_preview_geometry),
            capture_timeout_ms: host.capture_timeout_ms.or(self.capture_timeout_ms),
            capture_watchdog_secs: host.capture_watchdog_secs.or(self.capture_watchdog_secs),
            capture_awb: host.capture_awb.or(self.capture_awb),
            capture_ev: host.capture_ev.or(self.capture_ev),
            capture_on_error: host.capture_on_error.or(self.capture_on_error),
            compensate_drift: host.compensate_drift.or(self.compensate_drift),
            output_dir: host.output_dir.or(self.output_dir),
            interval_secs: host.interval_secs.or(self.interval_secs),
            duration_secs: host.duration_secs.or(self.duration_secs),
            shutter_us: host.shutter_us.or(self.shutter_us),
            gain: host.gain.or(self.gain),
            width: host.width.or(self.width),
            height: host.height.or(self.height),
        }
    }
}

// -------------------- Resolved settings --------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ArduinoSettings {
    /// Port to preselect when it shows up in the enumeration.
    pub port: Option<String>,
    pub baud: u32,
    pub read_timeout: Duration,
    /// Opening the port resets the board; commands sent before it boots are lost.
    pub reset_delay: Duration,
    pub advance_command: String,
}

impl Default for ArduinoSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud: DEFAULT_BAUD,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            reset_delay: Duration::from_millis(DEFAULT_RESET_DELAY_MS),
            advance_command: DEFAULT_ADVANCE_CMD.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub command: String,
    pub preview_geometry: String,
    /// Passed to the utility as `--timeout`, in milliseconds.
    pub capture_timeout_ms: u64,
    /// Wall-clock limit after which a capture process is killed.
    pub watchdog: Duration,
    pub awb: String,
    pub ev: i32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            command: DEFAULT_CAMERA_CMD.to_string(),
            preview_geometry: DEFAULT_PREVIEW_GEOMETRY.to_string(),
            capture_timeout_ms: DEFAULT_CAPTURE_TIMEOUT_MS,
            watchdog: Duration::from_secs(DEFAULT_CAPTURE_WATCHDOG_SECS),
            awb: "auto".to_string(),
            ev: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimelapseSettings {
    pub capture_policy: CaptureErrorPolicy,
    pub compensate_drift: bool,
}

/// Values the session form starts with.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDefaults {
    pub output_dir: String,
    pub interval_secs: u64,
    pub duration_secs: u64,
    pub shutter_us: u64,
    pub gain: f64,
    pub width: u32,
    pub height: u32,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            output_dir: String::new(),
            interval_secs: 10,
            duration_secs: 3600,
            shutter_us: 100000,
            gain: 5.0,
            width: 2028,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settings {
    pub arduino: ArduinoSettings,
    pub camera: CameraSettings,
    pub timelapse: TimelapseSettings,
    pub session: SessionDefaults,
}

impl Settings {
    pub fn from_host_config(cfg: HostConfig) -> Result<Self> {
        let arduino_defaults = ArduinoSettings::default();
        let camera_defaults = CameraSettings::default();
        let session_defaults = SessionDefaults::default();

        let capture_policy = match cfg.capture_on_error.as_deref() {
            Some(raw) => raw
                .parse::<CaptureErrorPolicy>()
                .map_err(|e| anyhow!("CAPTURE_ON_ERROR: {}", e))?,
            None => CaptureErrorPolicy::default(),
        };

        if cfg.ard_baud == Some(0) {
            return Err(anyhow!("ARD_BAUD must be positive"));
        }
        if cfg.interval_secs == Some(0) {
            return Err(anyhow!("INTERVAL_SECS must be positive"));
        }

        Ok(Self {
            arduino: ArduinoSettings {
                port: cfg.ard_port.filter(|p| !p.trim().is_empty()),
                baud: cfg.ard_baud.unwrap_or(arduino_defaults.baud),
                read_timeout: cfg
                    .ard_read_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(arduino_defaults.read_timeout),
                reset_delay: cfg
                    .ard_reset_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(arduino_defaults.reset_delay),
                advance_command: cfg.ard_advance_cmd.unwrap_or(arduino_defaults.advance_command),
            },
            camera: CameraSettings {
                command: cfg.camera_cmd.unwrap_or(camera_defaults.command),
                preview_geometry: cfg
                    .camera_preview_geometry
                    .unwrap_or(camera_defaults.preview_geometry),
                capture_timeout_ms: cfg
                    .capture_timeout_ms
                    .unwrap_or(camera_defaults.capture_timeout_ms),
                watchdog: cfg
                    .capture_watchdog_secs
                    .map(Duration::from_secs)
                    .unwrap_or(camera_defaults.watchdog),
                awb: cfg.capture_awb.unwrap_or(camera_defaults.awb),
                ev: cfg.capture_ev.unwrap_or(camera_defaults.ev),
            },
            timelapse: TimelapseSettings {
                capture_policy,
                compensate_drift: cfg.compensate_drift.unwrap_or(false),
            },
            session: SessionDefaults {
                output_dir: cfg.output_dir.unwrap_or(session_defaults.output_dir),
                interval_secs: cfg.interval_secs.unwrap_or(session_defaults.interval_secs),
                duration_secs: cfg.duration_secs.unwrap_or(session_defaults.duration_secs),
                shutter_us: cfg.shutter_us.unwrap_or(session_defaults.shutter_us),
                gain: cfg.gain.unwrap_or(session_defaults.gain),
                width: cfg.width.unwrap_or(session_defaults.width),
                height: cfg.height.unwrap_or(session_defaults.height),
            },
        })
    }
}

// -------------------- Loading --------------------

/// `$AUTOSLICE_CONFIG` if set, otherwise autoslice.yaml next to Cargo.toml.
pub fn config_path() -> PathBuf {
    let _ = dotenv();
    match env::var("AUTOSLICE_CONFIG") {
        Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
        _ => PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("autoslice.yaml"),
    }
}

/// Resolve settings for `hostname` from YAML text.
pub fn parse_settings(yaml: &str, hostname: &str) -> Result<Settings> {
    let mut sections: BTreeMap<String, HostConfig> = if yaml.trim().is_empty() {
        BTreeMap::new()
    } else {
        serde_yaml::from_str(yaml).context("Invalid autoslice.yaml")?
    };
    let base = sections.remove(DEFAULT_SECTION).unwrap_or_default();
    let merged = match sections.remove(hostname) {
        Some(host) => {
            log::info!(target: "config_loader", "Using host block '{}'", hostname);
            base.overlay(host)
        }
        None => {
            log::debug!(target: "config_loader", "No host block for '{}', using defaults", hostname);
            base
        }
    };
    Settings::from_host_config(merged)
}

/// Load settings for the current hostname. A missing file yields built-in
/// defaults; a present but malformed file is an error.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    let hostname = gethostname().to_string_lossy().to_string();

    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::warn!(target: "config_loader", "{:?} not found, using built-in defaults", path);
            return Ok(Settings::default());
        }
        Err(e) => return Err(anyhow!("Failed to open {:?}: {}", path, e)),
    };
    let yaml = std::io::read_to_string(file).with_context(|| format!("Failed to read {:?}", path))?;
    let settings = parse_settings(&yaml, &hostname)?;

    log::info!(target: "config_loader",
               "Settings: baud={}, advance='{}', camera='{}', on_error={:?}, drift_comp={} (hostname={})",
               settings.arduino.baud, settings.arduino.advance_command, settings.camera.command,
               settings.timelapse.capture_policy, settings.timelapse.compensate_drift, hostname);
    Ok(settings)
}
