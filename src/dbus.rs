//! D-Bus IPC for smartshiftd
//!
//! Each device gets a node under `/org/smartshiftd/devices`, and each
//! feature exports its own interface on a child path of that node.
//!
//! ## Interface: org.smartshiftd.SmartShift (at `<device node>/smartshift`)
//!
//! ### Methods:
//! - `GetStatus() -> (active: b, threshold: y, defaultThreshold: y)` -
//!   live hardware status
//! - `SetStatus(active: (bb), threshold: (by), defaultThreshold: (by))` -
//!   each argument is an (explicitly-set, value) pair; set fields are
//!   persisted and pushed to hardware, unset fields are left alone

use zbus::{fdo, interface};

use crate::feature::{SharedSmartShiftFeature, SmartShiftFeature};
use crate::smartshift::SmartShiftStatus;

/// D-Bus bus name
pub const DBUS_NAME: &str = "org.smartshiftd";

/// Root path for per-device nodes
pub const DBUS_DEVICES_PATH: &str = "/org/smartshiftd/devices";

/// SmartShift D-Bus interface name
pub const SMARTSHIFT_INTERFACE: &str = "org.smartshiftd.SmartShift";

// ============================================================================
// Paths
// ============================================================================

/// Per-device IPC node path, derived from the device name.
///
/// D-Bus path elements only allow `[A-Za-z0-9_]`, so anything else in the
/// device name becomes an underscore.
pub fn device_node_path(name: &str) -> String {
    let elem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    let elem = if elem.is_empty() {
        "device".to_string()
    } else {
        elem
    };

    format!("{}/{}", DBUS_DEVICES_PATH, elem)
}

/// SmartShift interface path under a device node
pub fn smartshift_path(device_node: &str) -> String {
    format!("{}/{}", device_node, SmartShiftFeature::NAME)
}

// ============================================================================
// SmartShift interface
// ============================================================================

/// D-Bus interface object for one device's SmartShift feature.
///
/// Holds a non-owning handle to the feature controller; dispatch is
/// serialized per feature instance by the controller's mutex, so remote
/// reads and writes never race on the same device.
pub struct SmartShiftIpc {
    feature: SharedSmartShiftFeature,
}

impl SmartShiftIpc {
    pub fn new(feature: SharedSmartShiftFeature) -> Self {
        Self { feature }
    }
}

#[interface(name = "org.smartshiftd.SmartShift")]
impl SmartShiftIpc {
    /// Read the live SmartShift status from the device.
    ///
    /// Live values are always concrete, so the reply carries no
    /// explicitly-set flags. A hardware failure is reported to this caller
    /// only.
    async fn get_status(&self) -> fdo::Result<(bool, u8, u8)> {
        let feature = match self.feature.lock() {
            Ok(f) => f,
            Err(e) => return Err(fdo::Error::Failed(format!("Lock error: {}", e))),
        };

        match feature.get_status() {
            Ok(status) => Ok(status_tuple(&status)),
            Err(e) => {
                tracing::error!(error = %e, "GetStatus hardware read failed");
                Err(fdo::Error::Failed(format!(
                    "Failed to read SmartShift status: {}",
                    e
                )))
            }
        }
    }

    /// Write SmartShift settings.
    ///
    /// Each argument is an (explicitly-set, value) pair; fields whose flag
    /// is false keep both their persisted and their hardware state. The
    /// write is merged into the persisted settings (durable on the next
    /// config save) and the incoming fields are applied to hardware.
    async fn set_status(
        &self,
        active: (bool, bool),
        threshold: (bool, u8),
        default_threshold: (bool, u8),
    ) -> fdo::Result<()> {
        let incoming = status_from_args(active, threshold, default_threshold);
        tracing::info!(incoming = ?incoming, "SetStatus called");

        let mut feature = match self.feature.lock() {
            Ok(f) => f,
            Err(e) => return Err(fdo::Error::Failed(format!("Lock error: {}", e))),
        };

        feature.merge_settings(&incoming);

        // Hardware gets the raw incoming status, not the merged result:
        // fields this call left unset stay untouched on the device even
        // where the persisted config has a value for them.
        match feature.set_status(&incoming) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "SetStatus hardware write failed");
                Err(fdo::Error::Failed(format!(
                    "Failed to write SmartShift status: {}",
                    e
                )))
            }
        }
    }
}

/// Build the tri-state status from the wire argument pairs
fn status_from_args(
    active: (bool, bool),
    threshold: (bool, u8),
    default_threshold: (bool, u8),
) -> SmartShiftStatus {
    SmartShiftStatus {
        active: active.0.then_some(active.1),
        auto_disengage: threshold.0.then_some(threshold.1),
        default_auto_disengage: default_threshold.0.then_some(default_threshold.1),
    }
}

/// Flatten a live status into the GetStatus reply tuple
fn status_tuple(status: &SmartShiftStatus) -> (bool, u8, u8) {
    (
        status.active.unwrap_or(false),
        status.auto_disengage.unwrap_or(0),
        status.default_auto_disengage.unwrap_or(0),
    )
}

// ============================================================================
// Registration
// ============================================================================

/// Connect to the session bus and claim the daemon's well-known name.
///
/// Feature interfaces are exported on this connection as devices come up.
pub async fn init_dbus_service() -> zbus::Result<zbus::Connection> {
    let connection = zbus::connection::Builder::session()?
        .name(DBUS_NAME)?
        .build()
        .await?;

    tracing::info!(name = DBUS_NAME, "D-Bus service registered");

    Ok(connection)
}

/// Export a device's SmartShift interface at `<device node>/smartshift`
pub async fn register_smartshift(
    connection: &zbus::Connection,
    device_node: &str,
    feature: SharedSmartShiftFeature,
) -> zbus::Result<()> {
    let path = smartshift_path(device_node);
    connection
        .object_server()
        .at(path.as_str(), SmartShiftIpc::new(feature))
        .await?;

    tracing::info!(
        path = %path,
        interface = SMARTSHIFT_INTERFACE,
        "SmartShift IPC interface exported"
    );
    Ok(())
}

/// Remove a device's SmartShift interface from the bus.
///
/// Must run before the feature is dropped so no dispatch can land on a
/// dangling back-reference.
pub async fn deregister_smartshift(
    connection: &zbus::Connection,
    device_node: &str,
) -> zbus::Result<bool> {
    let path = smartshift_path(device_node);
    let removed = connection
        .object_server()
        .remove::<SmartShiftIpc, _>(path.as_str())
        .await?;

    tracing::debug!(path = %path, removed, "SmartShift IPC interface removed");
    Ok(removed)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dbus_constants() {
        assert_eq!(DBUS_NAME, "org.smartshiftd");
        assert_eq!(DBUS_DEVICES_PATH, "/org/smartshiftd/devices");
        assert_eq!(SMARTSHIFT_INTERFACE, "org.smartshiftd.SmartShift");
    }

    #[test]
    fn test_device_node_path_sanitizes() {
        assert_eq!(
            device_node_path("MX Master 4"),
            "/org/smartshiftd/devices/mx_master_4"
        );
        assert_eq!(
            device_node_path("Logitech USB Receiver"),
            "/org/smartshiftd/devices/logitech_usb_receiver"
        );
        assert_eq!(device_node_path(""), "/org/smartshiftd/devices/device");
    }

    #[test]
    fn test_smartshift_path() {
        let node = device_node_path("MX Master 4");
        assert_eq!(
            smartshift_path(&node),
            "/org/smartshiftd/devices/mx_master_4/smartshift"
        );
    }

    #[test]
    fn test_status_from_args_all_set() {
        let status = status_from_args((true, true), (true, 7), (true, 30));
        assert_eq!(status.active, Some(true));
        assert_eq!(status.auto_disengage, Some(7));
        assert_eq!(status.default_auto_disengage, Some(30));
    }

    #[test]
    fn test_status_from_args_unset_flags_drop_values() {
        // A value whose flag is false must not leak into the status
        let status = status_from_args((false, true), (true, 7), (false, 99));
        assert_eq!(status.active, None);
        assert_eq!(status.auto_disengage, Some(7));
        assert_eq!(status.default_auto_disengage, None);
    }

    #[test]
    fn test_status_from_args_set_false_is_explicit() {
        let status = status_from_args((true, false), (false, 0), (false, 0));
        assert_eq!(status.active, Some(false));
        assert!(!status.is_unset());
    }

    #[test]
    fn test_status_tuple() {
        let status = SmartShiftStatus {
            active: Some(true),
            auto_disengage: Some(12),
            default_auto_disengage: Some(30),
        };
        assert_eq!(status_tuple(&status), (true, 12, 30));

        // Live statuses are always fully populated; unset fields only
        // appear in degenerate cases and read as zeros
        assert_eq!(status_tuple(&SmartShiftStatus::default()), (false, 0, 0));
    }
}
