/// Serial port enumeration
///
/// Stateless: every call asks the OS again. Callers decide what to do with an
/// empty list.

use serialport::{SerialPortInfo, SerialPortType};

use crate::error::{AutosliceError, Result};

/// Shown in the port selector when enumeration finds nothing.
pub const NO_PORTS_PLACEHOLDER: &str = "No ports available";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEntry {
    pub name: String,
    pub description: String,
}

impl PortEntry {
    pub fn label(&self) -> String {
        if self.description.is_empty() {
            self.name.clone()
        } else {
            format!("{} ({})", self.name, self.description)
        }
    }
}

pub fn describe(info: &SerialPortInfo) -> PortEntry {
    let description = match &info.port_type {
        SerialPortType::UsbPort(usb) => {
            let parts: Vec<&str> = [usb.manufacturer.as_deref(), usb.product.as_deref()]
                .into_iter()
                .flatten()
                .collect();
            if parts.is_empty() {
                "USB Serial".to_string()
            } else {
                parts.join(" ")
            }
        }
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::Unknown => String::new(),
    };
    PortEntry {
        name: info.port_name.clone(),
        description,
    }
}

/// Ports currently visible to the OS, sorted by name.
pub fn list_ports() -> Vec<PortEntry> {
    match serialport::available_ports() {
        Ok(ports) => {
            let mut entries: Vec<PortEntry> = ports.iter().map(describe).collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            log::debug!(target: "serial_ports", "Found {} port(s)", entries.len());
            entries
        }
        Err(e) => {
            log::warn!(target: "serial_ports", "Port enumeration failed: {}", e);
            Vec::new()
        }
    }
}

/// The configured port when it is present, otherwise the first one.
pub fn preferred_port(entries: &[PortEntry], configured: Option<&str>) -> Option<String> {
    if let Some(wanted) = configured {
        if let Some(e) = entries.iter().find(|e| e.name == wanted) {
            return Some(e.name.clone());
        }
    }
    entries.first().map(|e| e.name.clone())
}

/// Reject an empty selection or the placeholder text.
pub fn validate_selection(selection: &str) -> Result<&str> {
    let selection = selection.trim();
    if selection.is_empty() || selection == NO_PORTS_PLACEHOLDER {
        return Err(AutosliceError::PortUnavailable("Please select a valid port.".into()));
    }
    Ok(selection)
}
