//! SmartShift Daemon
//!
//! Persists and synchronizes the SmartShift scroll wheel mode of Logitech
//! MX mice on Linux: settings load from disk at startup and push to the
//! device, and a D-Bus interface lets desktop tooling read and write the
//! live status at runtime.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use smartshiftd::{
    dbus::init_dbus_service,
    device::Device,
    hidpp::{self, HidppDevice, HidppError},
    settings::{load_shared_tree, SharedConfigTree},
};

/// Device polling interval when no device is found (2 seconds)
const DEVICE_POLL_INTERVAL_SECS: u64 = 2;

/// Periodic settings save interval (60 seconds)
const CONFIG_SAVE_INTERVAL_SECS: u64 = 60;

/// SmartShift daemon - scroll wheel mode control for Logitech MX mice
#[derive(Parser, Debug)]
#[command(name = "smartshiftd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (defaults to ~/.config/smartshiftd/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// List all Logitech hidraw devices and exit
    #[arg(long)]
    list_devices: bool,

    /// With --list-devices, print JSON instead of text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("SmartShift daemon starting...");

    // Handle --list-devices flag
    if args.list_devices {
        list_logitech_devices(args.json);
        return Ok(());
    }

    // Load the settings tree (a broken or missing file degrades to empty)
    let tree = load_shared_tree(args.config.as_deref());

    // Wait for a HID++ 2.0 device to show up
    let hidpp = wait_for_device().await;
    let mut device = Device::new(hidpp);
    info!(device = %device.name(), node = %device.ipc_node(), "Device ready");

    // Connect to the session bus before exporting feature interfaces
    let connection = match init_dbus_service().await {
        Ok(conn) => {
            info!("D-Bus service initialized successfully");
            conn
        }
        Err(e) => {
            error!("Failed to initialize D-Bus service: {}", e);
            return Err(e.into());
        }
    };

    // Construct the features this device supports and apply persisted
    // settings: configure, then listen, for each feature
    {
        let tree = tree.read().unwrap();
        device.init_features(&tree);
    }
    device.export_ipc(&connection).await;
    device.configure();
    device.listen();

    if device.feature_count() == 0 {
        warn!(
            device = %device.name(),
            "Device supports none of the daemon's features; staying up for reconnects"
        );
    }

    let device = Arc::new(device);

    // Spawn the periodic settings saver; runtime IPC writes only become
    // durable when this pass (or the shutdown save) runs
    let saver_device = device.clone();
    let saver_tree = tree.clone();
    let save_handle = tokio::spawn(async move {
        run_config_saver(saver_device, saver_tree).await
    });

    info!("SmartShift daemon ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting...");
        }
        result = save_handle => {
            if let Err(e) = result {
                error!("Settings saver task panicked: {:?}", e);
            }
        }
    }

    // Final save, then take the IPC interfaces off the bus before the
    // device drops
    save_all(&device, &tree);
    device.shutdown(&connection).await;

    Ok(())
}

/// List all detected Logitech hidraw devices
fn list_logitech_devices(json: bool) {
    let devices = hidpp::scan_devices();

    if json {
        match serde_json::to_string_pretty(&devices) {
            Ok(out) => println!("{}", out),
            Err(e) => eprintln!("Failed to serialize device list: {}", e),
        }
        return;
    }

    println!("Scanning for Logitech hidraw devices...\n");

    if devices.is_empty() {
        println!("No Logitech devices found.");
        println!("\nTroubleshooting:");
        println!("  - Ensure your mouse or receiver is connected");
        println!("  - Check that udev rules are installed");
        return;
    }

    println!("Found {} Logitech device(s):\n", devices.len());

    for (i, device) in devices.iter().enumerate() {
        println!("{}. {} [{}]", i + 1, device.name, device.connection);
        println!("   Path:    {:?}", device.path);
        println!("   Vendor:  0x{:04X}", device.vendor_id);
        println!("   Product: 0x{:04X}", device.product_id);
        println!();
    }
}

/// Poll until a HID++ 2.0 device opens and validates
async fn wait_for_device() -> HidppDevice {
    loop {
        match HidppDevice::open() {
            Ok(device) => return device,
            Err(HidppError::DeviceNotFound) => {
                info!(
                    "Waiting for Logitech HID++ device... (polling every {}s)",
                    DEVICE_POLL_INTERVAL_SECS
                );
            }
            Err(HidppError::PermissionDenied) => {
                error!("Permission denied accessing hidraw devices.");
                error!("Ensure udev rules are installed.");
            }
            Err(e) => {
                error!("Error opening HID++ device: {}. Will retry...", e);
            }
        }

        sleep(Duration::from_secs(DEVICE_POLL_INTERVAL_SECS)).await;
    }
}

/// Sweep feature settings into the tree and write it to disk
fn save_all(device: &Device, tree: &SharedConfigTree) {
    match tree.write() {
        Ok(mut tree) => {
            device.save_config(&mut tree);
            if let Err(e) = tree.save() {
                warn!("Failed to save settings: {}", e);
            }
        }
        Err(e) => {
            error!("Settings lock poisoned, skipping save: {}", e);
        }
    }
}

/// Periodically persist settings, so runtime IPC writes survive a crash
async fn run_config_saver(device: Arc<Device>, tree: SharedConfigTree) {
    let mut interval = tokio::time::interval(Duration::from_secs(CONFIG_SAVE_INTERVAL_SECS));

    loop {
        interval.tick().await;
        save_all(&device, &tree);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_poll_interval() {
        assert_eq!(DEVICE_POLL_INTERVAL_SECS, 2);
    }

    #[test]
    fn test_config_save_interval() {
        assert_eq!(CONFIG_SAVE_INTERVAL_SECS, 60);
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["smartshiftd"]);
        assert!(args.config.is_none());
        assert!(!args.verbose);
        assert!(!args.list_devices);
        assert!(!args.json);
    }

    #[test]
    fn test_args_verbose() {
        let args = Args::parse_from(["smartshiftd", "--verbose"]);
        assert!(args.verbose);
    }

    #[test]
    fn test_args_config_path() {
        let args = Args::parse_from(["smartshiftd", "--config", "/tmp/test.json"]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/test.json")));
    }

    #[test]
    fn test_args_list_devices() {
        let args = Args::parse_from(["smartshiftd", "--list-devices", "--json"]);
        assert!(args.list_devices);
        assert!(args.json);
    }
}
