//! Per-device composition root
//!
//! A `Device` owns the shared HID++ handle and builds the feature set the
//! hardware actually supports: each feature is constructed in turn, and a
//! missing capability skips that one feature instead of failing the
//! device. Constructed features then run the uniform configure/listen
//! lifecycle and are swept back into the settings tree on save.

use std::sync::{Arc, Mutex};

use crate::dbus;
use crate::feature::{SharedFeature, SharedSmartShiftFeature, SmartShiftFeature};
use crate::hidpp::{new_shared_device, HidppDevice, HidppError, SharedHidppDevice};
use crate::settings::ConfigTree;

/// One connected Logitech device and its constructed features
pub struct Device {
    hidpp: SharedHidppDevice,
    name: String,
    ipc_node: String,
    /// Features in lifecycle order
    features: Vec<SharedFeature>,
    /// Concrete SmartShift handle for IPC export
    smartshift: Option<SharedSmartShiftFeature>,
}

impl Device {
    /// Wrap an opened HID++ device. Features are not constructed yet;
    /// call `init_features` next.
    pub fn new(hidpp: HidppDevice) -> Self {
        let name = hidpp.name().to_string();
        let ipc_node = dbus::device_node_path(&name);

        Self {
            hidpp: new_shared_device(hidpp),
            name,
            ipc_node,
            features: Vec::new(),
            smartshift: None,
        }
    }

    /// Device name from the hardware scan
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This device's IPC node path
    pub fn ipc_node(&self) -> &str {
        &self.ipc_node
    }

    /// Number of successfully constructed features
    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    /// Construct every feature the device supports.
    ///
    /// A device without a capability skips that feature with a debug log;
    /// any other construction failure is logged as an error. Neither stops
    /// the remaining features.
    pub fn init_features(&mut self, tree: &ConfigTree) {
        match SmartShiftFeature::new(&self.hidpp, tree) {
            Ok(feature) => {
                let shared: SharedSmartShiftFeature = Arc::new(Mutex::new(feature));
                self.smartshift = Some(shared.clone());
                self.features.push(shared);
                tracing::info!(
                    device = %self.name,
                    feature = SmartShiftFeature::NAME,
                    "Feature initialized"
                );
            }
            Err(HidppError::UnsupportedFeature(id)) => {
                tracing::debug!(
                    device = %self.name,
                    feature = SmartShiftFeature::NAME,
                    feature_id = format!("0x{:04X}", id),
                    "Capability not supported, skipping feature"
                );
            }
            Err(e) => {
                tracing::error!(
                    device = %self.name,
                    feature = SmartShiftFeature::NAME,
                    error = %e,
                    "Feature construction failed"
                );
            }
        }
    }

    /// Export the IPC interfaces of constructed features on the bus
    pub async fn export_ipc(&self, connection: &zbus::Connection) {
        if let Some(smartshift) = &self.smartshift {
            if let Err(e) =
                dbus::register_smartshift(connection, &self.ipc_node, smartshift.clone()).await
            {
                tracing::warn!(
                    device = %self.name,
                    error = %e,
                    "Failed to export SmartShift IPC interface"
                );
            }
        }
    }

    /// Push persisted settings for every feature into hardware.
    ///
    /// Idempotent; a failing feature is logged and does not stop the pass.
    pub fn configure(&self) {
        for feature in &self.features {
            let feature = match feature.lock() {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!(device = %self.name, error = %e, "Feature lock poisoned");
                    continue;
                }
            };

            if let Err(e) = feature.configure() {
                tracing::error!(
                    device = %self.name,
                    feature = feature.name(),
                    error = %e,
                    "Failed to configure feature"
                );
            }
        }
    }

    /// Start event listeners for every feature
    pub fn listen(&self) {
        for feature in &self.features {
            if let Ok(feature) = feature.lock() {
                feature.listen();
            }
        }
    }

    /// Sweep every feature's settings into the tree
    pub fn save_config(&self, tree: &mut ConfigTree) {
        for feature in &self.features {
            match feature.lock() {
                Ok(feature) => feature.save_config(tree),
                Err(e) => {
                    tracing::error!(device = %self.name, error = %e, "Feature lock poisoned, skipping save");
                }
            }
        }
    }

    /// Remove IPC interfaces from the bus.
    ///
    /// Must complete before the device (and its features) drop, so no
    /// in-flight dispatch can land on a dangling feature.
    pub async fn shutdown(&self, connection: &zbus::Connection) {
        if self.smartshift.is_some() {
            if let Err(e) = dbus::deregister_smartshift(connection, &self.ipc_node).await {
                tracing::warn!(
                    device = %self.name,
                    error = %e,
                    "Failed to remove SmartShift IPC interface"
                );
            }
        }
    }
}
