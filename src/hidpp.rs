//! HID++ 2.0 transport for Logitech devices
//!
//! Uses direct hidraw device access: scan /sys/class/hidraw for Logitech
//! devices, open the node non-blocking, and speak HID++ 2.0 over short/long
//! reports. Feature controllers resolve their feature index once through
//! the IRoot/IFeatureSet tables and issue synchronous request/response
//! calls; a wire error or timeout surfaces to whichever caller issued the
//! request.
//!
//! SPDX-License-Identifier: GPL-3.0

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

// ============================================================================
// Constants
// ============================================================================

/// Logitech vendor ID
pub const LOGITECH_VENDOR_ID: u16 = 0x046D;

/// HID++ report types
pub mod report_type {
    /// Short HID++ report (7 bytes)
    pub const SHORT: u8 = 0x10;
    /// Long HID++ report (20 bytes)
    pub const LONG: u8 = 0x11;
}

/// HID++ 2.0 feature IDs used by this daemon
pub mod features {
    /// IRoot - protocol version, ping, feature lookup
    pub const I_ROOT: u16 = 0x0000;
    /// IFeatureSet - enumerate device features
    pub const I_FEATURE_SET: u16 = 0x0001;
    /// SmartShift - ratchet/free-spin wheel control
    pub const SMART_SHIFT: u16 = 0x2110;
}

/// Software ID stamped into every request so responses can be matched
const SOFTWARE_ID: u8 = 0x01;

/// Receiver product IDs
const BOLT_RECEIVER_PID: u16 = 0xC548;
const UNIFYING_RECEIVER_PID: u16 = 0xC52B;

/// Bus types from the sysfs HID_ID line
const BUS_BLUETOOTH: u16 = 0x0005;

/// Response poll budget: 100 attempts at 10ms each
const POLL_ATTEMPTS: u32 = 100;
const POLL_INTERVAL_MS: u64 = 10;

// ============================================================================
// Errors
// ============================================================================

/// HID++ transport and protocol error type
#[derive(Debug)]
pub enum HidppError {
    /// No compatible Logitech device found
    DeviceNotFound,
    /// Permission denied opening the hidraw node
    PermissionDenied,
    /// Device does not answer the HID++ 2.0 ping
    ProtocolUnsupported,
    /// Device lacks a HID++ feature; recoverable, the registry skips the
    /// corresponding daemon feature for this device
    UnsupportedFeature(u16),
    /// Device answered with a HID++ error report
    Error { code: u8 },
    /// No matching response arrived within the poll budget
    Timeout { feature_index: u8, function: u8 },
    /// I/O error during communication
    Io(std::io::Error),
}

impl fmt::Display for HidppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HidppError::DeviceNotFound => write!(f, "No Logitech HID++ device found"),
            HidppError::PermissionDenied => {
                write!(f, "Permission denied accessing hidraw device")
            }
            HidppError::ProtocolUnsupported => {
                write!(f, "Device does not support HID++ 2.0")
            }
            HidppError::UnsupportedFeature(id) => {
                write!(f, "Device does not support HID++ feature 0x{:04X}", id)
            }
            HidppError::Error { code } => {
                write!(f, "HID++ error response: {} ({})", error_name(*code), code)
            }
            HidppError::Timeout {
                feature_index,
                function,
            } => write!(
                f,
                "HID++ request timed out (feature index {}, function {})",
                feature_index, function
            ),
            HidppError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for HidppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HidppError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Human-readable name for a HID++ wire error code
pub fn error_name(code: u8) -> &'static str {
    match code {
        0x00 => "No error",
        0x01 => "Unknown function",
        0x02 => "Function not available",
        0x03 => "Invalid argument",
        0x04 => "Not supported",
        0x05 => "Out of range",
        0x06 => "Device busy",
        0x07 => "Connection failed",
        0x08 => "Invalid address",
        _ => "Unknown error",
    }
}

// ============================================================================
// Connection Type
// ============================================================================

/// How the device is attached to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionType {
    /// Direct USB connection
    Usb,
    /// Via Logitech Bolt receiver
    Bolt,
    /// Direct Bluetooth connection
    Bluetooth,
    /// Via Unifying receiver
    Unifying,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Usb => write!(f, "USB"),
            ConnectionType::Bolt => write!(f, "Bolt"),
            ConnectionType::Bluetooth => write!(f, "Bluetooth"),
            ConnectionType::Unifying => write!(f, "Unifying"),
        }
    }
}

/// HID++ device index for a connection type.
///
/// Direct connections address the device itself (0xFF); receivers address
/// the paired device slot.
fn device_index_for(connection: ConnectionType) -> u8 {
    match connection {
        ConnectionType::Usb | ConnectionType::Bluetooth => 0xFF,
        ConnectionType::Bolt => 0x02,
        ConnectionType::Unifying => 0x01,
    }
}

// ============================================================================
// Device discovery
// ============================================================================

/// One Logitech hidraw candidate from the sysfs scan
#[derive(Debug, Clone, Serialize)]
pub struct DeviceCandidate {
    /// /dev/hidrawN node
    pub path: PathBuf,
    /// Device name from HID_NAME
    pub name: String,
    /// USB/Bluetooth vendor ID
    pub vendor_id: u16,
    /// Product ID
    pub product_id: u16,
    /// Connection classification
    pub connection: ConnectionType,
}

/// Parse bus, vendor, product, and name out of a sysfs uevent blob.
///
/// The relevant lines look like `HID_ID=0003:0000046D:0000C548` and
/// `HID_NAME=Logitech MX Master 3S`.
fn parse_uevent(uevent: &str) -> Option<(u16, u16, u16, String)> {
    let mut hid_id = None;
    let mut name = String::new();

    for line in uevent.lines() {
        if let Some(id) = line.strip_prefix("HID_ID=") {
            hid_id = Some(id);
        } else if let Some(n) = line.strip_prefix("HID_NAME=") {
            name = n.trim().to_string();
        }
    }

    let mut parts = hid_id?.split(':');
    let bus = u16::from_str_radix(parts.next()?, 16).ok()?;
    let vendor = u32::from_str_radix(parts.next()?, 16).ok()? as u16;
    let product = u32::from_str_radix(parts.next()?, 16).ok()? as u16;

    Some((bus, vendor, product, name))
}

fn classify_connection(bus: u16, product_id: u16) -> ConnectionType {
    match product_id {
        BOLT_RECEIVER_PID => ConnectionType::Bolt,
        UNIFYING_RECEIVER_PID => ConnectionType::Unifying,
        _ if bus == BUS_BLUETOOTH => ConnectionType::Bluetooth,
        _ => ConnectionType::Usb,
    }
}

/// Scan /sys/class/hidraw for Logitech devices
pub fn scan_devices() -> Vec<DeviceCandidate> {
    let hidraw_dir = PathBuf::from("/sys/class/hidraw");
    let mut candidates = Vec::new();

    let entries = match std::fs::read_dir(&hidraw_dir) {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to read /sys/class/hidraw");
            return candidates;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let uevent_path = path.join("device/uevent");

        let uevent = match std::fs::read_to_string(&uevent_path) {
            Ok(u) => u,
            Err(_) => continue,
        };

        let Some((bus, vendor_id, product_id, name)) = parse_uevent(&uevent) else {
            continue;
        };
        if vendor_id != LOGITECH_VENDOR_ID {
            continue;
        }

        let Some(node) = path.file_name() else {
            continue;
        };

        candidates.push(DeviceCandidate {
            path: PathBuf::from("/dev").join(node),
            name,
            vendor_id,
            product_id,
            connection: classify_connection(bus, product_id),
        });
    }

    candidates
}

/// Pick the best candidate for HID++ communication.
///
/// Receivers carry the HID++ control channel for their paired devices, so
/// they win over direct nodes when both are present.
fn find_device() -> Result<DeviceCandidate, HidppError> {
    let candidates = scan_devices();

    candidates
        .iter()
        .find(|c| matches!(c.connection, ConnectionType::Bolt | ConnectionType::Unifying))
        .or_else(|| candidates.first())
        .cloned()
        .ok_or(HidppError::DeviceNotFound)
}

// ============================================================================
// HID++ Message
// ============================================================================

/// HID++ 2.0 short request (7 bytes)
#[derive(Debug, Clone, Copy)]
pub struct HidppShortMessage {
    /// Device index (0xFF for direct, paired slot for receivers)
    pub device_index: u8,
    /// Feature index in the device's feature table
    pub feature_index: u8,
    /// Function ID (upper nibble) | software ID (lower nibble)
    pub function_sw_id: u8,
    /// Parameters (3 bytes)
    pub params: [u8; 3],
}

impl HidppShortMessage {
    pub fn new(device_index: u8, feature_index: u8, function: u8) -> Self {
        Self {
            device_index,
            feature_index,
            function_sw_id: (function << 4) | (SOFTWARE_ID & 0x0F),
            params: [0; 3],
        }
    }

    pub fn with_params(mut self, params: &[u8]) -> Self {
        let len = params.len().min(3);
        self.params[..len].copy_from_slice(&params[..len]);
        self
    }

    /// Wire bytes, report type first
    pub fn to_bytes(&self) -> [u8; 7] {
        [
            report_type::SHORT,
            self.device_index,
            self.feature_index,
            self.function_sw_id,
            self.params[0],
            self.params[1],
            self.params[2],
        ]
    }
}

// ============================================================================
// HID++ Device
// ============================================================================

/// An open HID++ 2.0 device.
///
/// One handle per physical device, shared between its feature controllers
/// behind a mutex; every request blocks until the device answers or the
/// poll budget runs out.
pub struct HidppDevice {
    device: File,
    path: PathBuf,
    name: String,
    device_index: u8,
    connection: ConnectionType,
    /// Cached feature table (feature_id -> feature_index)
    feature_table: HashMap<u16, u8>,
}

impl HidppDevice {
    /// Find, open, and validate a HID++ 2.0 device.
    pub fn open() -> Result<Self, HidppError> {
        let candidate = find_device()?;
        Self::open_candidate(candidate)
    }

    fn open_candidate(candidate: DeviceCandidate) -> Result<Self, HidppError> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&candidate.path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    tracing::warn!(
                        path = %candidate.path.display(),
                        "Permission denied opening hidraw device. Check udev rules."
                    );
                    HidppError::PermissionDenied
                } else {
                    HidppError::Io(e)
                }
            })?;

        let mut hidpp = Self {
            device,
            path: candidate.path,
            name: candidate.name,
            device_index: device_index_for(candidate.connection),
            connection: candidate.connection,
            feature_table: HashMap::new(),
        };

        if !hidpp.validate_hidpp20() {
            tracing::debug!(
                path = %hidpp.path.display(),
                connection = %hidpp.connection,
                "Device does not answer the HID++ 2.0 ping"
            );
            return Err(HidppError::ProtocolUnsupported);
        }

        hidpp.enumerate_features();

        tracing::info!(
            path = %hidpp.path.display(),
            name = %hidpp.name,
            connection = %hidpp.connection,
            features = hidpp.feature_table.len(),
            "Connected to HID++ device"
        );

        Ok(hidpp)
    }

    /// Device name from the sysfs scan
    pub fn name(&self) -> &str {
        &self.name
    }

    /// /dev/hidrawN node this handle speaks through
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Connection classification
    pub fn connection(&self) -> ConnectionType {
        self.connection
    }

    /// Discard any stale reports so the next read sees our response
    fn drain_buffer(&mut self) {
        let mut drain_buf = [0u8; 64];
        loop {
            match self.device.read(&mut drain_buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    /// Send a HID++ request and block until the matching response arrives.
    ///
    /// The response is matched on device index, feature index, function, and
    /// software ID; a wire error report for our feature becomes
    /// `HidppError::Error`.
    pub fn request(
        &mut self,
        feature_index: u8,
        function: u8,
        params: &[u8],
    ) -> Result<Vec<u8>, HidppError> {
        self.drain_buffer();

        let request = HidppShortMessage::new(self.device_index, feature_index, function)
            .with_params(params)
            .to_bytes();

        tracing::trace!(feature_index, function, "HID++ request: {:02X?}", &request);

        self.device.write_all(&request).map_err(HidppError::Io)?;

        let mut response = [0u8; 20];
        let mut attempts = 0;

        loop {
            match self.device.read(&mut response) {
                Ok(len) if len >= 7 => {
                    let report = response[0];
                    if report != report_type::SHORT && report != report_type::LONG {
                        continue;
                    }

                    let resp_function = (response[3] >> 4) & 0x0F;
                    let resp_sw_id = response[3] & 0x0F;

                    if response[1] == self.device_index
                        && response[2] == feature_index
                        && resp_function == function
                        && resp_sw_id == SOFTWARE_ID
                    {
                        tracing::trace!("HID++ response: {:02X?}", &response[..len]);
                        return Ok(response[..len].to_vec());
                    }

                    // Error report: feature index 0xFF, original feature and
                    // function echoed, error code in byte 5
                    if response[2] == 0xFF && response[3] == feature_index {
                        let code = response[5];
                        tracing::warn!(
                            code,
                            error = error_name(code),
                            feature_index,
                            function,
                            "HID++ error response"
                        );
                        return Err(HidppError::Error { code });
                    }

                    tracing::trace!(
                        "Unrelated HID++ report while waiting: {:02X?}",
                        &response[..len]
                    );
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(HidppError::Io(e)),
            }

            attempts += 1;
            if attempts > POLL_ATTEMPTS {
                return Err(HidppError::Timeout {
                    feature_index,
                    function,
                });
            }

            std::thread::sleep(std::time::Duration::from_millis(POLL_INTERVAL_MS));
        }
    }

    /// Validate HID++ 2.0 support via the IRoot ping echo
    fn validate_hidpp20(&mut self) -> bool {
        // IRoot function 0x01: ping, echoes the third parameter back
        match self.request(0x00, 0x01, &[0x00, 0x00, 0xAA]) {
            Ok(resp) => resp.len() >= 7 && resp[6] == 0xAA,
            Err(_) => false,
        }
    }

    /// Enumerate device features through IFeatureSet and cache the table
    fn enumerate_features(&mut self) {
        let feature_set_index = match self.lookup_feature_index(features::I_FEATURE_SET) {
            Some(idx) => idx,
            None => {
                tracing::debug!("Device does not expose IFeatureSet");
                return;
            }
        };

        // IFeatureSet function 0x00: feature count
        let count = match self.request(feature_set_index, 0x00, &[]) {
            Ok(resp) if resp.len() >= 5 => resp[4],
            _ => return,
        };

        // IFeatureSet function 0x01: feature ID at index (1-based)
        for i in 0..count {
            let resp = match self.request(feature_set_index, 0x01, &[i + 1, 0, 0]) {
                Ok(r) if r.len() >= 6 => r,
                _ => continue,
            };

            let feature_id = u16::from_be_bytes([resp[4], resp[5]]);
            self.feature_table.insert(feature_id, i + 1);

            tracing::debug!(
                feature_id = format!("0x{:04X}", feature_id),
                feature_index = i + 1,
                "Found feature"
            );
        }

        tracing::debug!(
            feature_count = self.feature_table.len(),
            "Feature enumeration complete"
        );
    }

    /// Query IRoot for a feature's table index (function 0x00)
    fn lookup_feature_index(&mut self, feature_id: u16) -> Option<u8> {
        let params = [(feature_id >> 8) as u8, (feature_id & 0xFF) as u8, 0];

        match self.request(0x00, 0x00, &params) {
            Ok(resp) if resp.len() >= 5 && resp[4] != 0 => Some(resp[4]),
            _ => None,
        }
    }

    /// Resolve a feature ID to its index, or `UnsupportedFeature`.
    ///
    /// Feature controllers call this once at construction; the result is the
    /// recoverable skip-this-feature signal when the capability is missing.
    pub fn feature_index(&mut self, feature_id: u16) -> Result<u8, HidppError> {
        if let Some(idx) = self.feature_table.get(&feature_id) {
            return Ok(*idx);
        }

        match self.lookup_feature_index(feature_id) {
            Some(idx) => {
                self.feature_table.insert(feature_id, idx);
                Ok(idx)
            }
            None => Err(HidppError::UnsupportedFeature(feature_id)),
        }
    }
}

impl fmt::Debug for HidppDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HidppDevice")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("connection", &self.connection)
            .field("device_index", &self.device_index)
            .finish()
    }
}

/// Shared device handle: one per physical device, shared by its feature
/// controllers
pub type SharedHidppDevice = Arc<Mutex<HidppDevice>>;

/// Wrap a device handle for sharing
pub fn new_shared_device(device: HidppDevice) -> SharedHidppDevice {
    Arc::new(Mutex::new(device))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const BOLT_UEVENT: &str = "DRIVER=logitech-hidpp-device\n\
                               HID_ID=0003:0000046D:0000C548\n\
                               HID_NAME=Logitech USB Receiver\n\
                               HID_PHYS=usb-0000:00:14.0-2/input2\n";

    #[test]
    fn test_parse_uevent() {
        let (bus, vendor, product, name) = parse_uevent(BOLT_UEVENT).unwrap();
        assert_eq!(bus, 0x0003);
        assert_eq!(vendor, LOGITECH_VENDOR_ID);
        assert_eq!(product, 0xC548);
        assert_eq!(name, "Logitech USB Receiver");
    }

    #[test]
    fn test_parse_uevent_bluetooth() {
        let uevent = "HID_ID=0005:0000046D:0000B034\nHID_NAME=MX Master 4\n";
        let (bus, _, product, _) = parse_uevent(uevent).unwrap();
        assert_eq!(bus, BUS_BLUETOOTH);
        assert_eq!(classify_connection(bus, product), ConnectionType::Bluetooth);
    }

    #[test]
    fn test_parse_uevent_missing_id() {
        assert!(parse_uevent("DRIVER=hid-generic\n").is_none());
    }

    #[test]
    fn test_classify_connection() {
        assert_eq!(
            classify_connection(0x0003, BOLT_RECEIVER_PID),
            ConnectionType::Bolt
        );
        assert_eq!(
            classify_connection(0x0003, UNIFYING_RECEIVER_PID),
            ConnectionType::Unifying
        );
        assert_eq!(classify_connection(0x0003, 0xB034), ConnectionType::Usb);
        assert_eq!(classify_connection(0x0005, 0xB034), ConnectionType::Bluetooth);
    }

    #[test]
    fn test_device_index_for() {
        assert_eq!(device_index_for(ConnectionType::Usb), 0xFF);
        assert_eq!(device_index_for(ConnectionType::Bluetooth), 0xFF);
        assert_eq!(device_index_for(ConnectionType::Bolt), 0x02);
        assert_eq!(device_index_for(ConnectionType::Unifying), 0x01);
    }

    #[test]
    fn test_short_message_layout() {
        let bytes = HidppShortMessage::new(0xFF, 0x05, 0x01)
            .with_params(&[0xAA, 0xBB, 0xCC])
            .to_bytes();

        assert_eq!(bytes[0], report_type::SHORT);
        assert_eq!(bytes[1], 0xFF);
        assert_eq!(bytes[2], 0x05);
        assert_eq!(bytes[3], 0x11); // function 1, software ID 1
        assert_eq!(&bytes[4..], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_short_message_truncates_params() {
        let bytes = HidppShortMessage::new(0x02, 0x08, 0x00)
            .with_params(&[1, 2, 3, 4, 5])
            .to_bytes();
        assert_eq!(&bytes[4..], &[1, 2, 3]);
    }

    #[test]
    fn test_error_name() {
        assert_eq!(error_name(0x04), "Not supported");
        assert_eq!(error_name(0x06), "Device busy");
        assert_eq!(error_name(0xAB), "Unknown error");
    }

    #[test]
    fn test_error_display() {
        assert!(HidppError::DeviceNotFound.to_string().contains("No Logitech"));
        assert!(HidppError::PermissionDenied.to_string().contains("Permission"));
        assert!(HidppError::UnsupportedFeature(0x2110)
            .to_string()
            .contains("0x2110"));
        assert!(HidppError::Error { code: 0x06 }.to_string().contains("busy"));
    }

    #[test]
    fn test_candidate_serializes() {
        let candidate = DeviceCandidate {
            path: PathBuf::from("/dev/hidraw3"),
            name: "MX Master 4".into(),
            vendor_id: LOGITECH_VENDOR_ID,
            product_id: 0xB034,
            connection: ConnectionType::Bolt,
        };

        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["name"], "MX Master 4");
        assert_eq!(json["connection"], "Bolt");
        assert_eq!(json["vendor_id"], 0x046D);
    }
}
