/// Timelapse orchestration
///
/// One run = a dedicated worker thread doing, for each of
/// `duration / interval` iterations: stop preview, capture `{i}.jpg`, advance
/// the stage one step if a board is connected, wait one interval.
///
/// Capture failures follow `CaptureErrorPolicy`. Motor failures are logged and
/// the run carries on. Cancellation is cooperative: checked at the top of each
/// iteration and while waiting.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, warn};

use crate::arduino_connection::{lock_connection, SharedConnection};
use crate::camera::{lock_preview, CaptureSettings, SharedPreview, StillCamera};
use crate::config_loader::TimelapseSettings;
use crate::error::{AutosliceError, Result};

/// What to do when a still capture fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureErrorPolicy {
    /// Log it and move on to the motor step.
    #[default]
    Continue,
    /// End the run as Aborted.
    Abort,
}

impl FromStr for CaptureErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "abort" => Ok(Self::Abort),
            other => Err(format!("expected 'continue' or 'abort', got '{}'", other)),
        }
    }
}

/// Snapshot of the run parameters, taken once when the run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub output_dir: PathBuf,
    pub interval_secs: u64,
    pub duration_secs: u64,
    pub capture: CaptureSettings,
}

impl SessionConfig {
    pub fn iterations(&self) -> u64 {
        iteration_count(self.duration_secs, self.interval_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    fn preflight(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(AutosliceError::Configuration("Please select an output folder.".into()));
        }
        if self.interval_secs == 0 {
            return Err(AutosliceError::Configuration(
                "Interval must be a positive number of seconds.".into(),
            ));
        }
        std::fs::create_dir_all(&self.output_dir)?;
        Ok(())
    }
}

/// Whole intervals that fit in the duration; zero when the interval is longer.
pub fn iteration_count(duration_secs: u64, interval_secs: u64) -> u64 {
    duration_secs.checked_div(interval_secs).unwrap_or(0)
}

/// Frames are named by their zero-based index.
pub fn frame_path(output_dir: &Path, index: u64) -> PathBuf {
    output_dir.join(format!("{}.jpg", index))
}

// -------------------- Status --------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub iterations_planned: u64,
    pub iterations_run: u64,
    pub frames_captured: u64,
    pub capture_failures: u64,
    pub motor_failures: u64,
    /// Iterations where no board was connected.
    pub motor_skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Completed(RunReport),
    Cancelled(RunReport),
    Aborted { reason: String, report: RunReport },
}

impl RunStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, RunStatus::Running)
    }

    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunStatus::Completed(r) | RunStatus::Cancelled(r) => Some(r),
            RunStatus::Aborted { report, .. } => Some(report),
            RunStatus::Idle | RunStatus::Running => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "idle"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed(r) => write!(
                f,
                "completed: {}/{} frames captured",
                r.frames_captured, r.iterations_planned
            ),
            RunStatus::Cancelled(r) => write!(
                f,
                "cancelled after {}/{} iterations",
                r.iterations_run, r.iterations_planned
            ),
            RunStatus::Aborted { reason, .. } => write!(f, "aborted: {}", reason),
        }
    }
}

/// Sent to the control surface at the start and end of a run only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Started { iterations: u64 },
    Finished(RunStatus),
}

// -------------------- Waiting --------------------

/// Waits out the inter-shot gap.
pub trait Pacer: Send + Sync {
    /// Wait up to `duration`; return `true` if cancelled meanwhile.
    fn wait(&self, duration: Duration, cancel: &Receiver<()>) -> bool;
}

/// Real wall-clock wait that wakes early on cancel.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClockPacer;

impl Pacer for WallClockPacer {
    fn wait(&self, duration: Duration, cancel: &Receiver<()>) -> bool {
        match cancel.recv_timeout(duration) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            // Handle dropped: nobody can cancel any more.
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(duration);
                false
            }
        }
    }
}

fn cancel_requested(cancel: &Receiver<()>) -> bool {
    match cancel.try_recv() {
        Ok(()) => true,
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => false,
    }
}

// -------------------- Run handle --------------------

fn lock_status(status: &Mutex<RunStatus>) -> MutexGuard<'_, RunStatus> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Query / cancel / join a run.
#[derive(Debug)]
pub struct RunHandle {
    status: Arc<Mutex<RunStatus>>,
    cancel_tx: Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl RunHandle {
    fn settled(status: RunStatus) -> Self {
        let (cancel_tx, _) = bounded(1);
        Self {
            status: Arc::new(Mutex::new(status)),
            cancel_tx,
            worker: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        lock_status(&self.status).clone()
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    /// Ask the worker to stop at its next check. Repeated calls are harmless.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.try_send(());
    }

    /// Block until the worker exits and return the final status.
    pub fn join(&mut self) -> RunStatus {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(target: "timelapse", "Timelapse worker panicked");
                let mut status = lock_status(&self.status);
                if status.is_running() {
                    *status = RunStatus::Aborted {
                        reason: "worker thread panicked".into(),
                        report: RunReport::default(),
                    };
                }
            }
        }
        self.status()
    }
}

// -------------------- Runner --------------------

/// Everything the worker thread touches.
#[derive(Clone)]
struct LoopContext {
    camera: Arc<dyn StillCamera>,
    preview: SharedPreview,
    connection: SharedConnection,
    pacer: Arc<dyn Pacer>,
    advance_command: String,
    settings: TimelapseSettings,
}

/// Starts runs and keeps the handle of the latest one. Only one run may be
/// active at a time.
pub struct TimelapseRunner {
    ctx: LoopContext,
    current: Option<RunHandle>,
    events_tx: Sender<RunEvent>,
    events_rx: Receiver<RunEvent>,
}

impl TimelapseRunner {
    pub fn new(
        camera: Arc<dyn StillCamera>,
        preview: SharedPreview,
        connection: SharedConnection,
        advance_command: impl Into<String>,
        settings: TimelapseSettings,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            ctx: LoopContext {
                camera,
                preview,
                connection,
                pacer: Arc::new(WallClockPacer),
                advance_command: advance_command.into(),
                settings,
            },
            current: None,
            events_tx,
            events_rx,
        }
    }

    pub fn with_pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.ctx.pacer = pacer;
        self
    }

    pub fn events(&self) -> Receiver<RunEvent> {
        self.events_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.current.as_ref().map(RunHandle::is_running).unwrap_or(false)
    }

    pub fn status(&self) -> RunStatus {
        self.current.as_ref().map(RunHandle::status).unwrap_or_default()
    }

    /// Validate `config`, create the output folder and spawn the worker.
    /// Returns the planned iteration count. Configuration problems are
    /// returned here, before any thread exists, and leave the status Aborted.
    pub fn start(&mut self, config: SessionConfig) -> Result<u64> {
        if self.is_running() {
            return Err(AutosliceError::Busy("A timelapse is already running.".into()));
        }
        // Reap the previous worker, if any.
        if let Some(mut previous) = self.current.take() {
            previous.join();
        }

        if let Err(e) = config.preflight() {
            warn!(target: "timelapse", "Timelapse not started: {}", e);
            self.current = Some(RunHandle::settled(RunStatus::Aborted {
                reason: e.to_string(),
                report: RunReport::default(),
            }));
            return Err(e);
        }

        let iterations = config.iterations();
        let interval_secs = config.interval_secs;
        let output_dir = config.output_dir.display().to_string();
        let status = Arc::new(Mutex::new(RunStatus::Running));
        let (cancel_tx, cancel_rx) = bounded(1);
        let ctx = self.ctx.clone();
        let events = self.events_tx.clone();
        let worker_status = Arc::clone(&status);

        let worker = thread::Builder::new()
            .name("timelapse".into())
            .spawn(move || {
                let _ = events.send(RunEvent::Started { iterations });
                let outcome = run_session(&ctx, &config, &cancel_rx);
                info!(target: "timelapse", "Timelapse {}", outcome);
                *lock_status(&worker_status) = outcome.clone();
                let _ = events.send(RunEvent::Finished(outcome));
            })?;

        info!(target: "timelapse",
              "Timelapse started: {} iterations every {}s into {}",
              iterations, interval_secs, output_dir);
        self.current = Some(RunHandle {
            status,
            cancel_tx,
            worker: Some(worker),
        });
        Ok(iterations)
    }

    pub fn cancel(&self) -> bool {
        match self.current.as_ref() {
            Some(handle) if handle.is_running() => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    /// Block until the current run (if any) finishes.
    pub fn wait(&mut self) -> Option<RunStatus> {
        self.current.as_mut().map(RunHandle::join)
    }
}

/// The loop body, run on the worker thread.
fn run_session(ctx: &LoopContext, config: &SessionConfig, cancel: &Receiver<()>) -> RunStatus {
    let planned = config.iterations();
    let interval = config.interval();
    let mut report = RunReport {
        iterations_planned: planned,
        ..RunReport::default()
    };

    for index in 0..planned {
        if cancel_requested(cancel) {
            info!(target: "timelapse", "Cancel requested before iteration {}", index);
            return RunStatus::Cancelled(report);
        }
        let iteration_started = Instant::now();

        ensure_preview_stopped(ctx);

        let path = frame_path(&config.output_dir, index);
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        match ctx.camera.capture(&path, &config.capture) {
            Ok(()) => {
                report.frames_captured += 1;
                info!(target: "timelapse", "[{}] frame {}/{} -> {}", stamp, index + 1, planned, path.display());
            }
            Err(e) => {
                report.capture_failures += 1;
                error!(target: "timelapse", "[{}] frame {}/{}: {}", stamp, index + 1, planned, e);
                if ctx.settings.capture_policy == CaptureErrorPolicy::Abort {
                    report.iterations_run += 1;
                    return RunStatus::Aborted {
                        reason: e.to_string(),
                        report,
                    };
                }
            }
        }

        advance_stage(ctx, &mut report);
        report.iterations_run += 1;

        let wait = if ctx.settings.compensate_drift {
            interval.saturating_sub(iteration_started.elapsed())
        } else {
            interval
        };
        if ctx.pacer.wait(wait, cancel) && report.iterations_run < planned {
            info!(target: "timelapse", "Cancelled during wait after iteration {}", index);
            return RunStatus::Cancelled(report);
        }
    }

    RunStatus::Completed(report)
}

fn ensure_preview_stopped(ctx: &LoopContext) {
    if let Err(e) = lock_preview(&ctx.preview).stop() {
        warn!(target: "timelapse", "{}", e);
    }
}

/// Best-effort stage advance; never fails the run.
fn advance_stage(ctx: &LoopContext, report: &mut RunReport) {
    let mut conn = lock_connection(&ctx.connection);
    if !conn.is_connected() {
        report.motor_skipped += 1;
        debug!(target: "timelapse", "No board connected, skipping advance");
        return;
    }
    match conn.send(&ctx.advance_command) {
        Ok(response) => {
            info!(target: "timelapse", "Arduino response: {}", response);
        }
        Err(e) => {
            report.motor_failures += 1;
            let failure = AutosliceError::MotorCommandFailure {
                command: ctx.advance_command.clone(),
                reason: e.to_string(),
            };
            warn!(target: "timelapse", "{}", failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arduino_connection::{ArduinoConnectionManager, PortOpener, SerialLink};
    use crate::camera::{PreviewController, PreviewLauncher, PreviewProcess};
    use crate::config_loader::ArduinoSettings;

    struct NoPorts;

    impl PortOpener for NoPorts {
        fn open(&self, port_path: &str, _baud: u32, _timeout: Duration) -> Result<Box<dyn SerialLink>> {
            Err(AutosliceError::ConnectionFailure { port: port_path.into(), reason: "absent".into() })
        }
    }

    struct NoPreview;

    impl PreviewLauncher for NoPreview {
        fn launch(&self) -> Result<Box<dyn PreviewProcess>> {
            Err(AutosliceError::PreviewFailure("no display".into()))
        }
    }

    /// Writes an empty file per capture; fails on the listed indices.
    #[derive(Default)]
    struct FileCamera {
        fail_on: Vec<String>,
        delay: Duration,
        shots: Mutex<Vec<PathBuf>>,
    }

    impl StillCamera for FileCamera {
        fn capture(&self, output: &Path, _settings: &CaptureSettings) -> Result<()> {
            thread::sleep(self.delay);
            self.shots.lock().unwrap().push(output.to_path_buf());
            let name = output.file_name().unwrap().to_string_lossy().into_owned();
            if self.fail_on.contains(&name) {
                return Err(AutosliceError::CaptureFailure { path: output.into(), reason: "exit status: 1".into() });
            }
            std::fs::write(output, b"")?;
            Ok(())
        }
    }

    /// Never sleeps; cancels once `cancel_after` waits have happened.
    #[derive(Default)]
    struct InstantPacer {
        waits: Mutex<Vec<Duration>>,
        cancel_after: Option<usize>,
    }

    impl Pacer for InstantPacer {
        fn wait(&self, duration: Duration, _cancel: &Receiver<()>) -> bool {
            let mut waits = self.waits.lock().unwrap();
            waits.push(duration);
            self.cancel_after.map(|n| waits.len() >= n).unwrap_or(false)
        }
    }

    fn runner(camera: Arc<FileCamera>, pacer: Arc<InstantPacer>, settings: TimelapseSettings) -> TimelapseRunner {
        let preview = PreviewController::new(Arc::new(NoPreview)).shared();
        let conn = ArduinoConnectionManager::new(Box::new(NoPorts), &ArduinoSettings::default()).shared();
        TimelapseRunner::new(camera, preview, conn, "c2f1", settings).with_pacer(pacer)
    }

    fn session(dir: &Path, interval_secs: u64, duration_secs: u64) -> SessionConfig {
        SessionConfig {
            output_dir: dir.to_path_buf(),
            interval_secs,
            duration_secs,
            capture: CaptureSettings { shutter_us: 100000, gain: 5.0, width: 2028, height: 1080 },
        }
    }

    #[test]
    fn test_iteration_count() {
        assert_eq!(iteration_count(3600, 10), 360);
        assert_eq!(iteration_count(35, 10), 3);
        assert_eq!(iteration_count(10, 10), 1);
        assert_eq!(iteration_count(5, 10), 0);
        assert_eq!(iteration_count(5, 0), 0);
    }

    #[test]
    fn test_frame_path() {
        assert_eq!(frame_path(Path::new("/data/run"), 12), PathBuf::from("/data/run/12.jpg"));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(" Abort ".parse::<CaptureErrorPolicy>().unwrap(), CaptureErrorPolicy::Abort);
        assert_eq!("continue".parse::<CaptureErrorPolicy>().unwrap(), CaptureErrorPolicy::Continue);
        assert!("retry".parse::<CaptureErrorPolicy>().is_err());
    }

    #[test]
    fn test_run_produces_indexed_frames() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("frames");
        let camera = Arc::new(FileCamera::default());
        let pacer = Arc::new(InstantPacer::default());
        let mut r = runner(camera.clone(), pacer.clone(), TimelapseSettings::default());

        assert_eq!(r.start(session(&out, 10, 35)).unwrap(), 3);
        let status = r.wait().unwrap();

        let report = *status.report().unwrap();
        assert!(matches!(status, RunStatus::Completed(_)));
        assert_eq!(report.frames_captured, 3);
        assert_eq!(report.motor_skipped, 3);
        for i in 0..3 {
            assert!(out.join(format!("{}.jpg", i)).is_file());
        }
        assert!(!out.join("3.jpg").exists());
        assert_eq!(pacer.waits.lock().unwrap().as_slice(), [Duration::from_secs(10); 3]);
    }

    #[test]
    fn test_interval_longer_than_duration_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let camera = Arc::new(FileCamera::default());
        let mut r = runner(camera.clone(), Arc::new(InstantPacer::default()), TimelapseSettings::default());

        assert_eq!(r.start(session(dir.path(), 60, 30)).unwrap(), 0);
        let status = r.wait().unwrap();
        assert_eq!(status, RunStatus::Completed(RunReport::default()));
        assert!(camera.shots.lock().unwrap().is_empty());
    }

    #[test]
    fn test_empty_output_dir_never_captures() {
        let camera = Arc::new(FileCamera::default());
        let mut r = runner(camera.clone(), Arc::new(InstantPacer::default()), TimelapseSettings::default());

        let err = r.start(session(Path::new(""), 10, 100)).unwrap_err();
        assert!(matches!(err, AutosliceError::Configuration(_)));
        assert!(matches!(r.status(), RunStatus::Aborted { .. }));
        assert!(!r.is_running());
        assert!(camera.shots.lock().unwrap().is_empty());
    }

    #[test]
    fn test_capture_failure_continue_policy() {
        let dir = tempfile::tempdir().unwrap();
        let camera = Arc::new(FileCamera { fail_on: vec!["1.jpg".into()], ..Default::default() });
        let mut r = runner(camera.clone(), Arc::new(InstantPacer::default()), TimelapseSettings::default());

        r.start(session(dir.path(), 1, 3)).unwrap();
        let status = r.wait().unwrap();
        let report = status.report().unwrap();
        assert!(matches!(status, RunStatus::Completed(_)));
        assert_eq!((report.frames_captured, report.capture_failures), (2, 1));
        assert_eq!(camera.shots.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_capture_failure_abort_policy() {
        let dir = tempfile::tempdir().unwrap();
        let camera = Arc::new(FileCamera { fail_on: vec!["1.jpg".into()], ..Default::default() });
        let settings = TimelapseSettings { capture_policy: CaptureErrorPolicy::Abort, compensate_drift: false };
        let mut r = runner(camera.clone(), Arc::new(InstantPacer::default()), settings);

        r.start(session(dir.path(), 1, 3)).unwrap();
        match r.wait().unwrap() {
            RunStatus::Aborted { reason, report } => {
                assert!(reason.contains("1.jpg"));
                assert_eq!(report.iterations_run, 2);
                assert_eq!(report.frames_captured, 1);
            }
            other => panic!("expected Aborted, got {:?}", other),
        }
        assert_eq!(camera.shots.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_cancel_during_wait() {
        let dir = tempfile::tempdir().unwrap();
        let camera = Arc::new(FileCamera::default());
        let pacer = Arc::new(InstantPacer { cancel_after: Some(2), ..Default::default() });
        let mut r = runner(camera.clone(), pacer, TimelapseSettings::default());

        r.start(session(dir.path(), 1, 10)).unwrap();
        match r.wait().unwrap() {
            RunStatus::Cancelled(report) => {
                assert_eq!(report.iterations_run, 2);
                assert_eq!(report.iterations_planned, 10);
            }
            other => panic!("expected Cancelled, got {:?}", other),
        }
        assert_eq!(camera.shots.lock().unwrap().len(), 2);
    }

    fn waits_with_slow_camera(compensate_drift: bool) -> Vec<Duration> {
        let dir = tempfile::tempdir().unwrap();
        let pacer = Arc::new(InstantPacer::default());
        let camera = Arc::new(FileCamera { delay: Duration::from_millis(50), ..Default::default() });
        let settings = TimelapseSettings { capture_policy: CaptureErrorPolicy::Continue, compensate_drift };
        let mut r = runner(camera, pacer.clone(), settings);

        r.start(session(dir.path(), 5, 10)).unwrap();
        r.wait().unwrap();
        let waits = pacer.waits.lock().unwrap().clone();
        waits
    }

    #[test]
    fn test_drift_compensation_shortens_wait() {
        let waits = waits_with_slow_camera(true);
        assert_eq!(waits.len(), 2);
        for w in waits {
            assert!(w <= Duration::from_millis(4950), "wait {:?} not shortened by capture time", w);
        }
    }

    #[test]
    fn test_full_interval_without_compensation() {
        assert_eq!(waits_with_slow_camera(false), [Duration::from_secs(5); 2]);
    }

    #[test]
    fn test_wall_clock_pacer_wakes_on_cancel() {
        let (tx, rx) = bounded(1);
        tx.send(()).unwrap();
        let started = Instant::now();
        assert!(WallClockPacer.wait(Duration::from_secs(30), &rx));
        assert!(started.elapsed() < Duration::from_secs(5));

        let (_tx, rx) = bounded::<()>(1);
        assert!(!WallClockPacer.wait(Duration::from_millis(10), &rx));
    }
}
