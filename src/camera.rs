/// Camera control through the still-capture utility
///
/// Two modes share one physical camera: an unbounded live preview, owned by
/// `PreviewController`, and single blocking still captures through
/// `StillCamera`. They must never overlap.

use std::ffi::OsString;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config_loader::CameraSettings;
use crate::error::{AutosliceError, Result};

/// Exposure parameters for one still.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    pub shutter_us: u64,
    pub gain: f64,
    pub width: u32,
    pub height: u32,
}

/// Builds command lines for the capture utility.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraCommand {
    settings: CameraSettings,
}

impl CameraCommand {
    pub fn new(settings: CameraSettings) -> Self {
        Self { settings }
    }

    pub fn still_args(&self, output: &Path, capture: &CaptureSettings) -> Vec<OsString> {
        let s = &self.settings;
        let mut args: Vec<OsString> = vec!["-o".into(), output.as_os_str().to_owned()];
        for (flag, value) in [
            ("--shutter", capture.shutter_us.to_string()),
            ("--gain", capture.gain.to_string()),
            ("--width", capture.width.to_string()),
            ("--height", capture.height.to_string()),
            ("--timeout", s.capture_timeout_ms.to_string()),
            ("--awb", s.awb.clone()),
            ("--ev", s.ev.to_string()),
        ] {
            args.push(flag.into());
            args.push(value.into());
        }
        args
    }

    pub fn preview_args(&self) -> Vec<OsString> {
        vec![
            "-t".into(),
            "0".into(),
            "--preview".into(),
            self.settings.preview_geometry.clone().into(),
        ]
    }

    pub fn still(&self, output: &Path, capture: &CaptureSettings) -> Command {
        let mut cmd = Command::new(&self.settings.command);
        cmd.args(self.still_args(output, capture));
        cmd
    }

    pub fn preview(&self) -> Command {
        let mut cmd = Command::new(&self.settings.command);
        cmd.args(self.preview_args());
        cmd
    }

    pub fn program(&self) -> &str {
        &self.settings.command
    }
}

// -------------------- Still capture --------------------

/// One blocking still capture. Success means the utility exited cleanly; the
/// written file is not inspected.
pub trait StillCamera: Send + Sync {
    fn capture(&self, output: &Path, settings: &CaptureSettings) -> Result<()>;
}

/// Spawns the capture utility and supervises it until exit or watchdog expiry.
#[derive(Debug, Clone)]
pub struct LibcameraStill {
    command: CameraCommand,
    watchdog: Duration,
}

impl LibcameraStill {
    pub fn new(settings: &CameraSettings) -> Self {
        Self {
            command: CameraCommand::new(settings.clone()),
            watchdog: settings.watchdog,
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

impl StillCamera for LibcameraStill {
    fn capture(&self, output: &Path, settings: &CaptureSettings) -> Result<()> {
        let failure = |reason: String| AutosliceError::CaptureFailure {
            path: output.to_path_buf(),
            reason,
        };

        let mut cmd = self.command.still(output, settings);
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| failure(format!("failed to launch {}: {}", self.command.program(), e)))?;
        debug!(target: "camera", "Capture started (PID: {}) -> {}", child.id(), output.display());

        // Drain stderr so a chatty utility never blocks on a full pipe; keep
        // the last line as the failure reason.
        let stderr_tail = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let mut last = None;
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    debug!(target: "camera::stderr", "{}", line);
                    if !line.trim().is_empty() {
                        last = Some(line);
                    }
                }
                last
            })
        });

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) if started.elapsed() >= self.watchdog => {
                    warn!(target: "camera", "Capture exceeded {:?}, killing PID {}", self.watchdog, child.id());
                    let _ = child.kill();
                    let _ = child.wait();
                    break Err(failure(format!("no exit after {:?}", self.watchdog)));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    break Err(failure(format!("error checking capture status: {}", e)));
                }
            }
        };
        // After a watchdog kill a grandchild may still hold stderr open, so
        // only join the drain thread when the utility exited by itself.
        let status = status?;
        let tail = stderr_tail.and_then(|h| h.join().ok()).flatten();

        if status.success() {
            Ok(())
        } else {
            let reason = match tail {
                Some(line) => format!("{} ({})", status, line),
                None => status.to_string(),
            };
            Err(failure(reason))
        }
    }
}

// -------------------- Preview --------------------

/// A running preview that can be torn down.
pub trait PreviewProcess: Send {
    fn id(&self) -> u32;
    fn terminate(&mut self) -> std::io::Result<()>;
}

impl PreviewProcess for Child {
    fn id(&self) -> u32 {
        Child::id(self)
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        match self.kill() {
            Ok(()) => {}
            // Already exited on its own.
            Err(e) if e.kind() == ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        self.wait().map(|_| ())
    }
}

pub trait PreviewLauncher: Send + Sync {
    fn launch(&self) -> Result<Box<dyn PreviewProcess>>;
}

impl PreviewLauncher for LibcameraStill {
    fn launch(&self) -> Result<Box<dyn PreviewProcess>> {
        let mut cmd = self.command.preview();
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        let child = cmd.spawn().map_err(|e| {
            AutosliceError::PreviewFailure(format!("failed to launch {}: {}", self.command.program(), e))
        })?;
        Ok(Box::new(child))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewStart {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewStop {
    Stopped,
    NotRunning,
}

/// Owns the preview process handle; the handle never leaves this type.
pub struct PreviewController {
    launcher: Arc<dyn PreviewLauncher>,
    active: Option<Box<dyn PreviewProcess>>,
}

pub type SharedPreview = Arc<Mutex<PreviewController>>;

pub fn lock_preview(preview: &SharedPreview) -> MutexGuard<'_, PreviewController> {
    preview.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PreviewController {
    pub fn new(launcher: Arc<dyn PreviewLauncher>) -> Self {
        Self { launcher, active: None }
    }

    pub fn shared(self) -> SharedPreview {
        Arc::new(Mutex::new(self))
    }

    pub fn start(&mut self) -> Result<PreviewStart> {
        if self.active.is_some() {
            return Ok(PreviewStart::AlreadyRunning);
        }
        let process = self.launcher.launch()?;
        info!(target: "camera", "Preview launched (PID: {})", process.id());
        self.active = Some(process);
        Ok(PreviewStart::Started)
    }

    /// Idempotent. The handle is cleared even if termination reports an error.
    pub fn stop(&mut self) -> Result<PreviewStop> {
        let Some(mut process) = self.active.take() else {
            return Ok(PreviewStop::NotRunning);
        };
        let pid = process.id();
        match process.terminate() {
            Ok(()) => {
                info!(target: "camera", "Preview stopped (PID: {})", pid);
                Ok(PreviewStop::Stopped)
            }
            Err(e) => {
                error!(target: "camera", "Failed to stop preview (PID: {}): {}", pid, e);
                Err(AutosliceError::PreviewFailure(format!("failed to stop preview: {}", e)))
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for PreviewController {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
