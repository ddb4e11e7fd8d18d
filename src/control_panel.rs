/// Control panel facade
///
/// Every user action from the GUI or CLI goes through here and comes back as
/// a `Notice`. Errors stop at this boundary. While a timelapse is running the
/// serial and preview controls are locked out so the worker has sole use of
/// the port and the camera.

use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use log::{info, warn};

use crate::arduino_connection::{
    lock_connection, ArduinoConnectionManager, PortOpener, SharedConnection, SystemPortOpener,
};
use crate::camera::{
    lock_preview, CaptureSettings, LibcameraStill, PreviewController, PreviewLauncher,
    PreviewStart, PreviewStop, SharedPreview, StillCamera,
};
use crate::config_loader::{SessionDefaults, Settings};
use crate::error::{AutosliceError, Result};
use crate::serial_ports::{self, PortEntry};
use crate::timelapse::{
    Pacer, RunEvent, RunStatus, SessionConfig, TimelapseRunner, WallClockPacer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A user-facing message, shown modally by the GUI and printed by the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn info(title: &str, message: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Info, title: title.into(), message: message.into() }
    }

    pub fn warning(title: &str, message: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Warning, title: title.into(), message: message.into() }
    }

    pub fn error(title: &str, message: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Error, title: title.into(), message: message.into() }
    }

    pub fn is_error(&self) -> bool {
        self.level == NoticeLevel::Error
    }

    /// The end-of-run message.
    pub fn for_outcome(status: &RunStatus) -> Self {
        match status {
            RunStatus::Completed(r) if r.capture_failures == 0 && r.motor_failures == 0 => {
                Notice::info("Done", "Timelapse photography complete.")
            }
            RunStatus::Completed(r) => Notice::warning(
                "Done",
                format!(
                    "Timelapse photography complete with {} capture failure(s) and {} motor failure(s).",
                    r.capture_failures, r.motor_failures
                ),
            ),
            RunStatus::Cancelled(r) => Notice::info(
                "Stopped",
                format!("Timelapse stopped after {} of {} photos.", r.iterations_run, r.iterations_planned),
            ),
            RunStatus::Aborted { reason, .. } => Notice::error("Error", format!("Timelapse aborted: {}", reason)),
            RunStatus::Idle | RunStatus::Running => Notice::info("Timelapse", status.to_string()),
        }
    }
}

// -------------------- Session form --------------------

/// Raw text of the session fields, parsed only when a run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionForm {
    pub output_dir: String,
    pub interval: String,
    pub duration: String,
    pub shutter: String,
    pub gain: String,
    pub width: String,
    pub height: String,
}

impl SessionForm {
    pub fn from_defaults(d: &SessionDefaults) -> Self {
        Self {
            output_dir: d.output_dir.clone(),
            interval: d.interval_secs.to_string(),
            duration: d.duration_secs.to_string(),
            shutter: d.shutter_us.to_string(),
            gain: d.gain.to_string(),
            width: d.width.to_string(),
            height: d.height.to_string(),
        }
    }

    pub fn parse(&self) -> Result<SessionConfig> {
        let gain: f64 = parse_field("Gain", &self.gain)?;
        if !(gain.is_finite() && gain > 0.0) {
            return Err(AutosliceError::Configuration("Gain must be a positive number.".into()));
        }
        Ok(SessionConfig {
            output_dir: PathBuf::from(self.output_dir.trim()),
            interval_secs: parse_positive("Interval", &self.interval)?,
            duration_secs: parse_positive("Total Duration", &self.duration)?,
            capture: CaptureSettings {
                shutter_us: parse_positive("Shutter", &self.shutter)?,
                gain,
                width: parse_positive("Width", &self.width)?,
                height: parse_positive("Height", &self.height)?,
            },
        })
    }
}

impl Default for SessionForm {
    fn default() -> Self {
        Self::from_defaults(&SessionDefaults::default())
    }
}

fn parse_field<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| AutosliceError::Configuration(format!("{} must be a number, got '{}'.", name, raw.trim())))
}

fn parse_positive<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr + Default + PartialOrd,
{
    let value: T = parse_field(name, raw)?;
    if value <= T::default() {
        return Err(AutosliceError::Configuration(format!("{} must be positive.", name)));
    }
    Ok(value)
}

// -------------------- Panel --------------------

/// Hardware seams; `ControlPanel::new` wires the real ones.
pub struct Hardware {
    pub opener: Box<dyn PortOpener>,
    pub camera: Arc<dyn StillCamera>,
    pub preview: Arc<dyn PreviewLauncher>,
    pub pacer: Arc<dyn Pacer>,
}

impl Hardware {
    pub fn system(settings: &Settings) -> Self {
        let still = Arc::new(LibcameraStill::new(&settings.camera));
        Self {
            opener: Box::new(SystemPortOpener::new(settings.arduino.reset_delay)),
            camera: still.clone(),
            preview: still,
            pacer: Arc::new(WallClockPacer),
        }
    }
}

pub struct ControlPanel {
    settings: Settings,
    connection: SharedConnection,
    /// Mirror of the manager's port, updated only by connect/disconnect so
    /// status queries never wait on the worker's send.
    connected_port: Option<String>,
    preview: SharedPreview,
    runner: TimelapseRunner,
    events: Receiver<RunEvent>,
}

const BUSY: &str = "A timelapse is running. Wait for it to finish or stop it first.";

impl ControlPanel {
    pub fn new(settings: Settings) -> Self {
        let hardware = Hardware::system(&settings);
        Self::with_hardware(settings, hardware)
    }

    pub fn with_hardware(settings: Settings, hardware: Hardware) -> Self {
        let connection = ArduinoConnectionManager::new(hardware.opener, &settings.arduino).shared();
        let preview = PreviewController::new(hardware.preview).shared();
        let runner = TimelapseRunner::new(
            hardware.camera,
            Arc::clone(&preview),
            Arc::clone(&connection),
            settings.arduino.advance_command.clone(),
            settings.timelapse,
        )
        .with_pacer(hardware.pacer);
        let events = runner.events();
        Self { settings, connection, connected_port: None, preview, runner, events }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn session_form(&self) -> SessionForm {
        SessionForm::from_defaults(&self.settings.session)
    }

    // ---- ports ----

    /// Re-enumerate ports and pick the one to preselect.
    pub fn refresh_ports(&self) -> (Vec<PortEntry>, Option<String>) {
        let entries = serial_ports::list_ports();
        let selected = serial_ports::preferred_port(&entries, self.settings.arduino.port.as_deref());
        (entries, selected)
    }

    // ---- serial ----

    pub fn connect(&mut self, port: &str) -> Notice {
        if self.runner.is_running() {
            return Notice::error("Serial Error", BUSY);
        }
        let mut conn = lock_connection(&self.connection);
        let result = conn.connect(port);
        self.connected_port = conn.port_name().map(str::to_string);
        match result {
            Ok(()) => Notice::info(
                "Serial Info",
                format!("Connected to {} at {} baud.", port.trim(), self.settings.arduino.baud),
            ),
            Err(e) => Notice::error("Serial Error", e.to_string()),
        }
    }

    pub fn disconnect(&mut self) -> Notice {
        if self.runner.is_running() {
            return Notice::error("Serial Error", BUSY);
        }
        let result = lock_connection(&self.connection).disconnect();
        self.connected_port = None;
        match result {
            Ok(Some(_)) => Notice::info("Serial Info", "Disconnected from the serial port."),
            Ok(None) => Notice::info("Serial Info", "No serial port is currently connected."),
            Err(e) => Notice::error("Serial Error", e.to_string()),
        }
    }

    /// Free-text command; the response is shown back to the user.
    pub fn send_command(&mut self, command: &str) -> Notice {
        if command.trim().is_empty() {
            return Notice::warning("Input Error", "Command cannot be empty.");
        }
        if self.runner.is_running() {
            return Notice::error("Serial Error", BUSY);
        }
        match lock_connection(&self.connection).send(command) {
            Ok(response) => {
                info!(target: "control_panel", "Arduino response: {}", response);
                Notice::info("Command Sent", format!("Response: {}", response))
            }
            Err(e) => Notice::error("Serial Error", e.to_string()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected_port.is_some()
    }

    pub fn connected_port(&self) -> Option<String> {
        self.connected_port.clone()
    }

    // ---- preview ----

    /// `None` when the preview started quietly.
    pub fn start_preview(&mut self) -> Option<Notice> {
        if self.runner.is_running() {
            return Some(Notice::error("Error", BUSY));
        }
        match lock_preview(&self.preview).start() {
            Ok(PreviewStart::Started) => None,
            Ok(PreviewStart::AlreadyRunning) => Some(Notice::info("Info", "Preview is already running.")),
            Err(e) => Some(Notice::error("Error", e.to_string())),
        }
    }

    pub fn stop_preview(&mut self) -> Option<Notice> {
        match lock_preview(&self.preview).stop() {
            Ok(PreviewStop::Stopped) => None,
            Ok(PreviewStop::NotRunning) => Some(Notice::info("Info", "No preview to stop.")),
            Err(e) => Some(Notice::error("Error", e.to_string())),
        }
    }

    pub fn preview_active(&self) -> bool {
        lock_preview(&self.preview).is_active()
    }

    // ---- timelapse ----

    /// `None` once the worker is running; the outcome arrives as a
    /// `RunEvent::Finished` later.
    pub fn start_timelapse(&mut self, form: &SessionForm) -> Option<Notice> {
        let config = match form.parse() {
            Ok(c) => c,
            Err(e) => return Some(Notice::error("Error", e.to_string())),
        };
        match self.runner.start(config) {
            Ok(_) => None,
            Err(e) => Some(Notice::error("Error", e.to_string())),
        }
    }

    pub fn cancel_timelapse(&mut self) -> Option<Notice> {
        if self.runner.cancel() {
            info!(target: "control_panel", "Timelapse cancel requested");
            None
        } else {
            Some(Notice::info("Info", "No timelapse is running."))
        }
    }

    pub fn run_status(&self) -> RunStatus {
        self.runner.status()
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_running()
    }

    /// Drain pending run events without blocking.
    pub fn poll_events(&self) -> Vec<RunEvent> {
        self.events.try_iter().collect()
    }

    /// Block until the current run finishes.
    pub fn wait_for_run(&mut self) -> Option<RunStatus> {
        self.runner.wait()
    }

    // ---- lifecycle ----

    /// Stop everything: cancel and reap the run, kill the preview, close the port.
    pub fn shutdown(&mut self) {
        if self.runner.cancel() {
            info!(target: "control_panel", "Cancelling timelapse for shutdown");
        }
        self.runner.wait();
        if let Err(e) = lock_preview(&self.preview).stop() {
            warn!(target: "control_panel", "{}", e);
        }
        if let Err(e) = lock_connection(&self.connection).disconnect() {
            warn!(target: "control_panel", "{}", e);
        }
        self.connected_port = None;
    }
}

impl Drop for ControlPanel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_defaults() {
        let form = SessionForm::default();
        assert_eq!(form.interval, "10");
        assert_eq!(form.duration, "3600");
        assert_eq!(form.shutter, "100000");
        assert_eq!(form.gain, "5");
        assert_eq!(form.width, "2028");
        assert_eq!(form.height, "1080");
        assert!(form.output_dir.is_empty());
    }

    #[test]
    fn test_form_parse() {
        let form = SessionForm {
            output_dir: " /data/run ".into(),
            gain: "2.5".into(),
            ..SessionForm::default()
        };
        let cfg = form.parse().unwrap();
        assert_eq!(cfg.output_dir, PathBuf::from("/data/run"));
        assert_eq!(cfg.interval_secs, 10);
        assert_eq!(cfg.iterations(), 360);
        assert_eq!(cfg.capture.gain, 2.5);
    }

    #[test]
    fn test_form_rejects_bad_fields() {
        let bad = |f: SessionForm| match f.parse() {
            Err(AutosliceError::Configuration(msg)) => msg,
            other => panic!("expected configuration error, got {:?}", other),
        };
        assert!(bad(SessionForm { interval: "ten".into(), ..Default::default() }).starts_with("Interval"));
        assert!(bad(SessionForm { interval: "0".into(), ..Default::default() }).contains("positive"));
        assert!(bad(SessionForm { width: "-5".into(), ..Default::default() }).starts_with("Width"));
        assert!(bad(SessionForm { gain: "NaN".into(), ..Default::default() }).starts_with("Gain"));
        assert!(bad(SessionForm { gain: "0".into(), ..Default::default() }).starts_with("Gain"));
    }

    #[test]
    fn test_outcome_notices() {
        use crate::timelapse::RunReport;
        let clean = RunReport { iterations_planned: 2, iterations_run: 2, frames_captured: 2, ..Default::default() };
        assert_eq!(
            Notice::for_outcome(&RunStatus::Completed(clean)),
            Notice::info("Done", "Timelapse photography complete.")
        );
        let rough = RunReport { motor_failures: 1, ..clean };
        assert_eq!(Notice::for_outcome(&RunStatus::Completed(rough)).level, NoticeLevel::Warning);
        let aborted = RunStatus::Aborted { reason: "camera gone".into(), report: clean };
        assert!(Notice::for_outcome(&aborted).is_error());
    }
}
