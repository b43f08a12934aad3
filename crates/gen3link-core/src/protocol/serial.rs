//! Serial port handling
//!
//! Discovery, opening and line setup for the machine's USB serial link.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ProtocolError, POLL_INTERVAL_MS};

/// USB vendor IDs of the bridges found on Gen3 electronics
/// (FTDI, Arduino, WCH CH340)
const CONTROLLER_VIDS: [u16; 3] = [0x0403, 0x2341, 0x1A86];

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }

    /// Whether the USB bridge is one commonly used on motion controllers
    pub fn is_likely_controller(&self) -> bool {
        self.vid.is_some_and(|vid| CONTROLLER_VIDS.contains(&vid))
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Sort key: known controller bridges first, then ttyUSB*/ttyACM* by
/// number, then everything else by name
fn port_sort_key(port: &PortInfo) -> (u8, u8, usize, String) {
    let basename = port.name.rsplit('/').next().unwrap_or(&port.name);
    let bridge = if port.is_likely_controller() { 0 } else { 1 };
    for (rank, prefix) in [(0u8, "ttyUSB"), (1u8, "ttyACM")] {
        if let Some(rest) = basename.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (bridge, rank, num, basename.to_string());
        }
    }
    (bridge, 2, 0, basename.to_string())
}

/// List available serial ports in a stable, most-likely-first order
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // udev sometimes lags behind; pick up device nodes the API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    ports.sort_by_key(port_sort_key);
    ports
}

/// Open a serial port at the given baud rate
pub fn open_port(name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>, ProtocolError> {
    debug!("opening {} at {} baud", name, baud_rate);
    serialport::new(name, baud_rate)
        .timeout(Duration::from_millis(POLL_INTERVAL_MS))
        .open()
        .map_err(|e| match e.kind {
            serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(name.to_string()),
            _ => ProtocolError::SerialError(e.to_string()),
        })
}

/// Configure 8N1 without flow control, as the firmware expects
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_parity(serialport::Parity::None)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_stop_bits(serialport::StopBits::One)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;

    // DTR is wired to the board's reset line; hold it asserted so the
    // controller is not rebooted mid-session
    if let Err(e) = port.write_data_terminal_ready(true) {
        warn!("configure_port: failed to set DTR high: {} (continuing)", e);
    }
    Ok(())
}

/// Pulse RTS low to reset a board that did not answer the handshake
pub fn pulse_reset(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.write_request_to_send(false)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    std::thread::sleep(Duration::from_millis(100));
    port.write_request_to_send(true)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))
}
