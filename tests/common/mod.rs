//! In-memory hardware for control panel integration tests.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use autoslice::arduino_connection::{PortOpener, SerialLink};
use autoslice::camera::{CaptureSettings, PreviewLauncher, PreviewProcess, StillCamera};
use autoslice::config_loader::Settings;
use autoslice::timelapse::Pacer;
use autoslice::{AutosliceError, ControlPanel, Hardware, Result, SessionForm};
use crossbeam_channel::Receiver;

/// Ordered record of hardware actions shared by all fakes.
pub type Journal = Arc<Mutex<Vec<String>>>;

#[allow(dead_code)]
pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// What a test can observe about one opened link.
#[derive(Clone, Default)]
pub struct LinkProbe {
    pub port: String,
    pub written: Arc<Mutex<Vec<u8>>>,
    pub closed: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl LinkProbe {
    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Answers every command line with `reply`.
struct MemoryLink {
    probe: LinkProbe,
    reply: String,
    pending: Vec<u8>,
    fail_writes: bool,
    read_delay: Duration,
}

impl Read for MemoryLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.read_delay.is_zero() {
            std::thread::sleep(self.read_delay);
        }
        if self.pending.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Write for MemoryLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        self.probe.written.lock().unwrap().extend_from_slice(buf);
        for _ in buf.iter().filter(|b| **b == b'\n') {
            self.pending.extend_from_slice(self.reply.as_bytes());
            self.pending.push(b'\n');
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.probe.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct FakeOpener {
    pub reply: String,
    pub fail_writes: bool,
    /// Every read blocks this long, like a board slow to answer.
    pub read_delay: Duration,
    pub opened: Arc<Mutex<Vec<LinkProbe>>>,
}

#[allow(dead_code)]
impl FakeOpener {
    pub fn replying(reply: &str) -> Self {
        Self { reply: reply.into(), ..Default::default() }
    }

    pub fn broken() -> Self {
        Self { fail_writes: true, ..Default::default() }
    }

    pub fn sluggish(read_delay: Duration) -> Self {
        Self { read_delay, ..Default::default() }
    }

    pub fn probes(&self) -> Vec<LinkProbe> {
        self.opened.lock().unwrap().clone()
    }
}

impl PortOpener for FakeOpener {
    fn open(&self, port_path: &str, _baud: u32, _timeout: Duration) -> Result<Box<dyn SerialLink>> {
        if port_path.contains("missing") {
            return Err(AutosliceError::ConnectionFailure {
                port: port_path.into(),
                reason: "No such file or directory".into(),
            });
        }
        let probe = LinkProbe { port: port_path.into(), ..Default::default() };
        self.opened.lock().unwrap().push(probe.clone());
        Ok(Box::new(MemoryLink {
            probe,
            reply: self.reply.clone(),
            pending: Vec::new(),
            fail_writes: self.fail_writes,
            read_delay: self.read_delay,
        }))
    }
}

/// Writes an empty file per frame and journals `capture:<file name>`.
pub struct RecordingCamera {
    pub journal: Journal,
    pub shots: Mutex<Vec<PathBuf>>,
}

impl StillCamera for RecordingCamera {
    fn capture(&self, output: &Path, _settings: &CaptureSettings) -> Result<()> {
        let name = output.file_name().unwrap().to_string_lossy().into_owned();
        self.journal.lock().unwrap().push(format!("capture:{}", name));
        self.shots.lock().unwrap().push(output.to_path_buf());
        std::fs::write(output, b"jpeg")?;
        Ok(())
    }
}

struct FakePreviewProcess {
    journal: Journal,
}

impl PreviewProcess for FakePreviewProcess {
    fn id(&self) -> u32 {
        4242
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.journal.lock().unwrap().push("preview:stop".into());
        Ok(())
    }
}

pub struct FakePreviewLauncher {
    pub journal: Journal,
}

impl PreviewLauncher for FakePreviewLauncher {
    fn launch(&self) -> Result<Box<dyn PreviewProcess>> {
        self.journal.lock().unwrap().push("preview:start".into());
        Ok(Box::new(FakePreviewProcess { journal: Arc::clone(&self.journal) }))
    }
}

/// Never sleeps.
pub struct InstantPacer;

impl Pacer for InstantPacer {
    fn wait(&self, _duration: Duration, _cancel: &Receiver<()>) -> bool {
        false
    }
}

/// Holds every wait open until the run is cancelled.
pub struct BlockingPacer;

impl Pacer for BlockingPacer {
    fn wait(&self, _duration: Duration, cancel: &Receiver<()>) -> bool {
        cancel.recv().is_ok()
    }
}

pub struct Rig {
    pub panel: ControlPanel,
    pub opener: FakeOpener,
    pub camera: Arc<RecordingCamera>,
    pub journal: Journal,
}

#[allow(dead_code)]
pub fn rig(opener: FakeOpener) -> Rig {
    rig_with_pacer(opener, Arc::new(InstantPacer))
}

pub fn rig_with_pacer(opener: FakeOpener, pacer: Arc<dyn Pacer>) -> Rig {
    let journal: Journal = Arc::default();
    let camera = Arc::new(RecordingCamera { journal: Arc::clone(&journal), shots: Mutex::default() });
    let hardware = Hardware {
        opener: Box::new(opener.clone()),
        camera: camera.clone(),
        preview: Arc::new(FakePreviewLauncher { journal: Arc::clone(&journal) }),
        pacer,
    };
    let panel = ControlPanel::with_hardware(Settings::default(), hardware);
    Rig { panel, opener, camera, journal }
}

#[allow(dead_code)]
pub fn form(output_dir: &Path, interval: u64, duration: u64) -> SessionForm {
    SessionForm {
        output_dir: output_dir.display().to_string(),
        interval: interval.to_string(),
        duration: duration.to_string(),
        ..SessionForm::default()
    }
}
