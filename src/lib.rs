//! SmartShift Daemon Library
//!
//! Public API for testing and integration.

pub mod dbus;
pub mod device;
pub mod feature;
pub mod hidpp;
pub mod settings;
pub mod smartshift;

/// Re-export commonly used types
pub use dbus::{
    init_dbus_service, SmartShiftIpc, DBUS_DEVICES_PATH, DBUS_NAME, SMARTSHIFT_INTERFACE,
};
pub use device::Device;
pub use feature::{
    DeviceFeature, SharedFeature, SharedSmartShiftFeature, SmartShiftConfig, SmartShiftFeature,
};
pub use hidpp::{
    new_shared_device, DeviceCandidate, HidppDevice, HidppError, SharedHidppDevice,
    LOGITECH_VENDOR_ID,
};
pub use settings::{load_shared_tree, ConfigTree, SettingsError, SharedConfigTree};
pub use smartshift::{SmartShiftBackend, SmartShiftStatus};
