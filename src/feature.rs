//! Device feature lifecycle and the SmartShift feature
//!
//! Every daemon feature follows the same lifecycle: construct against the
//! device (which fails recoverably when the device lacks the capability),
//! `configure()` to push persisted settings into hardware, `listen()` for
//! hardware event streams, and `save_config()` to serialize back into the
//! settings tree. The SmartShift feature pairs that controller with a
//! config facet holding the tri-state status that persistence and IPC
//! writes merge into.

use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

use crate::hidpp::{HidppError, SharedHidppDevice};
use crate::settings::{self, ConfigTree};
use crate::smartshift::{SmartShiftBackend, SmartShiftStatus};

/// Settings keys inside the `smartshift` group
const KEY_ON: &str = "on";
const KEY_THRESHOLD: &str = "threshold";
const KEY_DEFAULT_THRESHOLD: &str = "default_threshold";

// ============================================================================
// Feature lifecycle
// ============================================================================

/// Uniform lifecycle implemented by every device feature.
pub trait DeviceFeature: Send {
    /// Settings group / IPC node name of this feature
    fn name(&self) -> &'static str;

    /// Push persisted settings into hardware. Called once after
    /// construction and again whenever settings must be reapplied;
    /// idempotent.
    fn configure(&self) -> Result<(), HidppError>;

    /// Start listening for hardware events
    fn listen(&self);

    /// Serialize current settings into the tree
    fn save_config(&self, tree: &mut ConfigTree);
}

/// A feature instance shared between the registry and its IPC interface
pub type SharedFeature = Arc<Mutex<dyn DeviceFeature>>;

// ============================================================================
// SmartShift config facet
// ============================================================================

/// Persisted-settings facet for SmartShift.
///
/// Holds the tri-state status loaded from the settings tree; absent keys
/// stay unset, and only explicitly-set fields are ever written back.
/// Owns no hardware connection.
#[derive(Debug, Default)]
pub struct SmartShiftConfig {
    status: SmartShiftStatus,
}

impl SmartShiftConfig {
    /// Load the facet from the settings tree.
    ///
    /// A missing group, a group of the wrong type, or unusable values all
    /// degrade to unset fields. Loading never fails: a misconfigured
    /// feature runs with hardware defaults.
    pub fn load(tree: &ConfigTree) -> Self {
        let mut status = SmartShiftStatus::default();

        match tree.get(SmartShiftFeature::NAME) {
            None => {
                // Feature not configured; hardware defaults apply.
            }
            Some(node) => match node.as_object() {
                None => {
                    tracing::warn!(
                        line = tree.line_of_key(SmartShiftFeature::NAME).unwrap_or(0),
                        "smartshift must be a group, ignoring"
                    );
                }
                Some(group) => {
                    status.active = settings::lookup_bool(group, KEY_ON);
                    status.auto_disengage = settings::lookup_u8(group, KEY_THRESHOLD);
                    status.default_auto_disengage =
                        settings::lookup_u8(group, KEY_DEFAULT_THRESHOLD);
                }
            },
        }

        Self { status }
    }

    /// The held tri-state status
    pub fn settings(&self) -> SmartShiftStatus {
        self.status
    }

    /// Overlay an incoming status onto the persisted one, so a runtime
    /// write becomes durable on the next save
    pub fn merge(&mut self, incoming: &SmartShiftStatus) {
        self.status.merge(incoming);
    }

    /// Rewrite this feature's group in the tree.
    ///
    /// The group is replaced wholesale with exactly the explicitly-set
    /// fields; unset fields are written as absent keys, which is how they
    /// survive a save/load round trip.
    pub fn save(&self, tree: &mut ConfigTree) {
        let mut group = Map::new();

        if let Some(active) = self.status.active {
            group.insert(KEY_ON.into(), Value::Bool(active));
        }
        if let Some(threshold) = self.status.auto_disengage {
            group.insert(KEY_THRESHOLD.into(), Value::from(threshold));
        }
        if let Some(default_threshold) = self.status.default_auto_disengage {
            group.insert(KEY_DEFAULT_THRESHOLD.into(), Value::from(default_threshold));
        }

        tree.set_group(SmartShiftFeature::NAME, group);
    }
}

// ============================================================================
// SmartShift feature controller
// ============================================================================

/// SmartShift feature controller: owns the backend client and the config
/// facet.
///
/// Either fully constructed (capability present, config loaded) or never
/// created; there is no partially-initialized state.
#[derive(Debug)]
pub struct SmartShiftFeature {
    backend: SmartShiftBackend,
    config: SmartShiftConfig,
}

impl SmartShiftFeature {
    pub const NAME: &'static str = "smartshift";

    /// Construct the feature for a device.
    ///
    /// Returns `HidppError::UnsupportedFeature` when the device lacks the
    /// SmartShift capability; the feature registry catches that and skips
    /// this feature without touching the settings tree or the bus.
    pub fn new(device: &SharedHidppDevice, tree: &ConfigTree) -> Result<Self, HidppError> {
        let backend = SmartShiftBackend::new(device)?;
        let config = SmartShiftConfig::load(tree);
        Ok(Self { backend, config })
    }

    /// Live hardware status; no caching, every call hits the device
    pub fn get_status(&self) -> Result<SmartShiftStatus, HidppError> {
        self.backend.get_status()
    }

    /// Forward a status to hardware verbatim.
    ///
    /// Persistence is the caller's responsibility; the IPC facet is the
    /// one caller that also merges into the config facet.
    pub fn set_status(&self, status: &SmartShiftStatus) -> Result<(), HidppError> {
        self.backend.set_status(status)
    }

    /// Merge an incoming status into the persisted settings
    pub fn merge_settings(&mut self, incoming: &SmartShiftStatus) {
        self.config.merge(incoming);
    }

    /// Currently persisted settings
    pub fn settings(&self) -> SmartShiftStatus {
        self.config.settings()
    }
}

impl DeviceFeature for SmartShiftFeature {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn configure(&self) -> Result<(), HidppError> {
        self.backend.set_status(&self.config.settings())
    }

    fn listen(&self) {
        // SmartShift has no hardware event stream to subscribe to.
    }

    fn save_config(&self, tree: &mut ConfigTree) {
        self.config.save(tree);
    }
}

/// Shared SmartShift feature, serialized per instance for IPC dispatch
pub type SharedSmartShiftFeature = Arc<Mutex<SmartShiftFeature>>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree_with_group(entries: &[(&str, Value)]) -> ConfigTree {
        let mut tree = ConfigTree::new();
        let mut group = Map::new();
        for (key, value) in entries {
            group.insert((*key).to_string(), value.clone());
        }
        tree.set_group(SmartShiftFeature::NAME, group);
        tree
    }

    #[test]
    fn test_load_absent_group_is_unset() {
        let config = SmartShiftConfig::load(&ConfigTree::new());
        assert!(config.settings().is_unset());
    }

    #[test]
    fn test_load_full_group() {
        let tree = tree_with_group(&[
            ("on", json!(true)),
            ("threshold", json!(15)),
            ("default_threshold", json!(30)),
        ]);

        let status = SmartShiftConfig::load(&tree).settings();
        assert_eq!(status.active, Some(true));
        assert_eq!(status.auto_disengage, Some(15));
        assert_eq!(status.default_auto_disengage, Some(30));
    }

    #[test]
    fn test_load_partial_group() {
        let tree = tree_with_group(&[("on", json!(true))]);

        let status = SmartShiftConfig::load(&tree).settings();
        assert_eq!(status.active, Some(true));
        assert_eq!(status.auto_disengage, None);
        assert_eq!(status.default_auto_disengage, None);
    }

    #[test]
    fn test_load_non_group_node_is_unset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{\n  \"smartshift\": 42\n}\n").unwrap();

        let tree = ConfigTree::load(&path).unwrap();
        let config = SmartShiftConfig::load(&tree);
        assert!(config.settings().is_unset());
    }

    #[test]
    fn test_load_malformed_values_left_unset() {
        let tree = tree_with_group(&[
            ("on", json!("true")),
            ("threshold", json!(500)),
            ("default_threshold", json!(30)),
        ]);

        let status = SmartShiftConfig::load(&tree).settings();
        assert_eq!(status.active, None);
        assert_eq!(status.auto_disengage, None);
        assert_eq!(status.default_auto_disengage, Some(30));
    }

    #[test]
    fn test_save_writes_only_set_fields() {
        let mut config = SmartShiftConfig::default();
        config.merge(&SmartShiftStatus {
            active: Some(false),
            ..Default::default()
        });

        let mut tree = ConfigTree::new();
        config.save(&mut tree);

        let group = tree
            .get(SmartShiftFeature::NAME)
            .unwrap()
            .as_object()
            .unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group.get("on"), Some(&json!(false)));
    }

    #[test]
    fn test_save_is_destructive_replace() {
        let mut tree = ConfigTree::new();

        let first = SmartShiftConfig {
            status: SmartShiftStatus {
                active: Some(true),
                auto_disengage: Some(10),
                ..Default::default()
            },
        };
        first.save(&mut tree);

        let second = SmartShiftConfig {
            status: SmartShiftStatus {
                default_auto_disengage: Some(20),
                ..Default::default()
            },
        };
        second.save(&mut tree);

        let group = tree
            .get(SmartShiftFeature::NAME)
            .unwrap()
            .as_object()
            .unwrap();
        assert!(group.get("on").is_none());
        assert!(group.get("threshold").is_none());
        assert_eq!(group.get("default_threshold"), Some(&json!(20)));
    }

    #[test]
    fn test_save_load_round_trip_in_memory() {
        let original = SmartShiftStatus {
            active: Some(true),
            auto_disengage: None,
            default_auto_disengage: Some(40),
        };
        let config = SmartShiftConfig { status: original };

        let mut tree = ConfigTree::new();
        config.save(&mut tree);

        assert_eq!(SmartShiftConfig::load(&tree).settings(), original);
    }

    #[test]
    fn test_save_load_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let original = SmartShiftStatus {
            active: Some(false),
            auto_disengage: Some(25),
            default_auto_disengage: None,
        };

        let mut tree = ConfigTree::load(&path).unwrap();
        SmartShiftConfig { status: original }.save(&mut tree);
        tree.save().unwrap();

        let reloaded = ConfigTree::load(&path).unwrap();
        assert_eq!(SmartShiftConfig::load(&reloaded).settings(), original);
    }

    #[test]
    fn test_merge_scenario_runtime_write() {
        // On disk: on=true, no threshold. A runtime write sets
        // active=false and threshold=7; the persisted status afterwards
        // holds exactly the overlay result.
        let tree = tree_with_group(&[("on", json!(true))]);
        let mut config = SmartShiftConfig::load(&tree);

        let incoming = SmartShiftStatus {
            active: Some(false),
            auto_disengage: Some(7),
            default_auto_disengage: None,
        };
        config.merge(&incoming);

        let merged = config.settings();
        assert_eq!(merged.active, Some(false));
        assert_eq!(merged.auto_disengage, Some(7));
        assert_eq!(merged.default_auto_disengage, None);
    }

    #[test]
    fn test_merge_preserves_unset_in_incoming() {
        let tree = tree_with_group(&[("on", json!(true)), ("threshold", json!(12))]);
        let mut config = SmartShiftConfig::load(&tree);

        config.merge(&SmartShiftStatus {
            default_auto_disengage: Some(9),
            ..Default::default()
        });

        let merged = config.settings();
        assert_eq!(merged.active, Some(true));
        assert_eq!(merged.auto_disengage, Some(12));
        assert_eq!(merged.default_auto_disengage, Some(9));
    }
}
