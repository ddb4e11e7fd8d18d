/// Arduino connection manager
///
/// Owns at most one open serial link to the stage controller. The protocol is
/// plain ASCII: one command line out, one response line back. There is no
/// framing or acknowledgement; any line that comes back counts as success.

use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config_loader::ArduinoSettings;
use crate::error::{AutosliceError, Result};
use crate::serial_ports::validate_selection;

/// Byte stream to the board. Dropping it closes the port.
pub trait SerialLink: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> SerialLink for T {}

/// Opens links; swapped out in tests for an in-memory transport.
pub trait PortOpener: Send {
    fn open(&self, port_path: &str, baud: u32, timeout: Duration) -> Result<Box<dyn SerialLink>>;
}

/// Opens real ports through `serialport`.
#[derive(Debug, Clone)]
pub struct SystemPortOpener {
    reset_delay: Duration,
}

impl SystemPortOpener {
    pub fn new(reset_delay: Duration) -> Self {
        Self { reset_delay }
    }
}

impl PortOpener for SystemPortOpener {
    fn open(&self, port_path: &str, baud: u32, timeout: Duration) -> Result<Box<dyn SerialLink>> {
        let port = serialport::new(port_path, baud)
            .timeout(timeout)
            .open()
            .map_err(|e| AutosliceError::ConnectionFailure {
                port: port_path.to_string(),
                reason: e.to_string(),
            })?;
        if !self.reset_delay.is_zero() {
            std::thread::sleep(self.reset_delay); // Arduino reset delay
        }
        Ok(Box::new(port))
    }
}

/// Shared between the control thread and the timelapse worker.
pub type SharedConnection = Arc<Mutex<ArduinoConnectionManager>>;

/// Lock the shared manager, recovering the guard if a holder panicked.
pub fn lock_connection(conn: &SharedConnection) -> MutexGuard<'_, ArduinoConnectionManager> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ArduinoConnectionManager {
    opener: Box<dyn PortOpener>,
    link: Option<Box<dyn SerialLink>>,
    port_path: Option<String>,
    baud: u32,
    read_timeout: Duration,
}

impl std::fmt::Debug for ArduinoConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArduinoConnectionManager")
            .field("port_path", &self.port_path)
            .field("baud", &self.baud)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

impl ArduinoConnectionManager {
    pub fn new(opener: Box<dyn PortOpener>, settings: &ArduinoSettings) -> Self {
        Self {
            opener,
            link: None,
            port_path: None,
            baud: settings.baud,
            read_timeout: settings.read_timeout,
        }
    }

    pub fn shared(self) -> SharedConnection {
        Arc::new(Mutex::new(self))
    }

    /// Open `port_path`. An existing link is closed before the new port is
    /// opened, so at most one handle is ever live. If the new open fails the
    /// manager is left disconnected.
    pub fn connect(&mut self, port_path: &str) -> Result<()> {
        let port_path = validate_selection(port_path)?;
        if let Some(previous) = self.port_path.clone() {
            log::info!(target: "arduino", "Closing {} before connecting to {}", previous, port_path);
            self.close_link();
        }
        match self.opener.open(port_path, self.baud, self.read_timeout) {
            Ok(link) => {
                self.link = Some(link);
                self.port_path = Some(port_path.to_string());
                log::info!(target: "arduino", "Connected to {} at {} baud", port_path, self.baud);
                Ok(())
            }
            Err(e) => {
                log::error!(target: "arduino", "Connection to {} failed: {}", port_path, e);
                Err(match e {
                    AutosliceError::ConnectionFailure { .. } => e,
                    other => AutosliceError::ConnectionFailure {
                        port: port_path.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Close the link. Returns the port that was closed, or `None` when
    /// nothing was connected. The manager ends up disconnected either way.
    pub fn disconnect(&mut self) -> Result<Option<String>> {
        let Some(port_path) = self.port_path.clone() else {
            return Ok(None);
        };
        let flushed = match self.link.as_mut() {
            Some(link) => link.flush(),
            None => Ok(()),
        };
        self.close_link();
        log::info!(target: "arduino", "Disconnected from {}", port_path);
        flushed.map_err(|e| AutosliceError::TransportFailure(format!("Failed to disconnect: {}", e)))?;
        Ok(Some(port_path))
    }

    fn close_link(&mut self) {
        self.link = None;
        self.port_path = None;
    }

    /// Write `command` plus `\n`, then read one response line with trailing
    /// whitespace removed. A read timeout with nothing received yields an
    /// empty response.
    pub fn send(&mut self, command: &str) -> Result<String> {
        let command = command.trim();
        if command.is_empty() {
            return Err(AutosliceError::Configuration("Command cannot be empty.".into()));
        }
        let read_timeout = self.read_timeout;
        let link = self.link.as_mut().ok_or(AutosliceError::NotConnected)?;

        let mut frame = Vec::with_capacity(command.len() + 1);
        frame.extend_from_slice(command.as_bytes());
        frame.push(b'\n');
        link.write_all(&frame)
            .and_then(|_| link.flush())
            .map_err(|e| AutosliceError::TransportFailure(format!("Failed to send command: {}", e)))?;

        let raw = read_line(&mut **link, read_timeout)?;
        let response = String::from_utf8_lossy(&raw).trim_end().to_string();
        if raw.is_empty() {
            log::warn!(target: "arduino", "No response to '{}' within {:?}", command, read_timeout);
        } else {
            log::debug!(target: "arduino", "'{}' -> '{}'", command, response);
        }
        Ok(response)
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_path.as_deref()
    }
}

/// Read up to and including `\n`, giving up once `timeout` has elapsed.
/// A timeout too large to represent means no deadline beyond the port's own.
fn read_line(link: &mut dyn SerialLink, timeout: Duration) -> Result<Vec<u8>> {
    let deadline = Instant::now().checked_add(timeout);
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match link.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(AutosliceError::TransportFailure(format!("Read error: {}", e))),
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
    }
    Ok(line)
}
