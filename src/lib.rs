/// Autoslice Library
///
/// Time-lapse control: still captures through the camera utility, one stage
/// step per frame through the Arduino serial link.

pub mod error;
pub mod config_loader;
pub mod serial_ports;
pub mod arduino_connection;
pub mod camera;
pub mod timelapse;
pub mod control_panel;
#[cfg(feature = "gui")]
pub mod gui;

pub use control_panel::{ControlPanel, Hardware, Notice, NoticeLevel, SessionForm};
pub use error::{AutosliceError, Result};

/// Logger for the binaries: `--debug` picks the baseline level and a
/// `RUST_LOG` value, when given, overrides it.
pub fn logger(debug: bool, rust_log: Option<&str>) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(if debug { log::LevelFilter::Debug } else { log::LevelFilter::Info });
    if let Some(filters) = rust_log {
        builder.parse_filters(filters);
    }
    builder
}
