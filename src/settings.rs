//! Persisted settings tree for smartshiftd
//!
//! A hierarchical key/value store backed by JSON, stored at
//! `~/.config/smartshiftd/config.json`. Feature config facets read typed
//! values out of named groups under the root and rewrite their group
//! wholesale on save; a key that is absent on disk reloads as "unset",
//! never as a default value.

use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

// ============================================================================
// Constants
// ============================================================================

/// Default config directory name
const CONFIG_DIR: &str = "smartshiftd";

/// Default config file name
const CONFIG_FILE: &str = "config.json";

// ============================================================================
// Config Tree
// ============================================================================

/// The persisted settings tree.
///
/// The root is always a JSON object; feature groups (`smartshift`, ...) hang
/// directly off it. The raw file text is retained so diagnostics can point
/// at a source line even though serde_json keeps no node spans.
#[derive(Debug, Default)]
pub struct ConfigTree {
    /// Root object of the tree
    root: Map<String, Value>,
    /// Raw file text, kept for line-number diagnostics
    source: Option<String>,
    /// File this tree was loaded from / saves to
    path: Option<PathBuf>,
}

impl ConfigTree {
    /// Create an empty tree with no backing file
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the default config directory path
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(CONFIG_DIR))
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load a settings tree from a file path.
    ///
    /// A missing file is not an error: the daemon then runs with hardware
    /// defaults and the file is created on the first save.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!(path = %path.display(), "Settings file not found, starting empty");
            return Ok(Self {
                root: Map::new(),
                source: None,
                path: Some(path.to_path_buf()),
            });
        }

        let contents = fs::read_to_string(path).map_err(SettingsError::Io)?;
        let value: Value =
            serde_json::from_str(&contents).map_err(SettingsError::Parse)?;

        let root = match value {
            Value::Object(map) => map,
            other => {
                tracing::warn!(
                    path = %path.display(),
                    found = other_type_name(&other),
                    "Settings root must be an object, ignoring file contents"
                );
                Map::new()
            }
        };

        tracing::info!(
            path = %path.display(),
            groups = root.len(),
            "Settings loaded"
        );

        Ok(Self {
            root,
            source: Some(contents),
            path: Some(path.to_path_buf()),
        })
    }

    /// Load from the given path (or the default location), degrading to an
    /// empty tree on any failure. Used at daemon startup, where a broken
    /// settings file must never prevent the daemon from running.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_config_path(),
        };

        let path = match path {
            Some(p) => p,
            None => {
                tracing::warn!("Could not determine config directory, settings will not persist");
                return Self::new();
            }
        };

        match Self::load(&path) {
            Ok(tree) => tree,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load settings, starting empty");
                Self {
                    root: Map::new(),
                    source: None,
                    path: Some(path),
                }
            }
        }
    }

    /// Save the tree back to its file
    pub fn save(&self) -> Result<(), SettingsError> {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => Self::default_config_path().ok_or(SettingsError::NoPath)?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(SettingsError::Io)?;
        }

        let contents = serde_json::to_string_pretty(&self.root).map_err(SettingsError::Parse)?;
        fs::write(&path, contents).map_err(SettingsError::Io)?;

        tracing::debug!(path = %path.display(), "Settings saved");
        Ok(())
    }

    /// Look up a node directly under the root
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// Remove a node directly under the root, returning it if present
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.root.remove(key)
    }

    /// Replace (or create) a group node under the root.
    ///
    /// Any existing node with this name is dropped entirely, so stale keys
    /// from a previous save cannot survive.
    pub fn set_group(&mut self, key: &str, group: Map<String, Value>) {
        self.root.insert(key.to_string(), Value::Object(group));
    }

    /// Number of nodes under the root
    pub fn len(&self) -> usize {
        self.root.len()
    }

    /// Whether the tree holds no nodes
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Best-effort source line (1-based) of a key in the loaded file.
    ///
    /// serde_json discards spans, so the line is recovered by scanning the
    /// raw text for the quoted key. Returns None for trees that were never
    /// loaded from disk or keys that cannot be found verbatim.
    pub fn line_of_key(&self, key: &str) -> Option<usize> {
        let source = self.source.as_deref()?;
        let needle = format!("\"{}\"", key);
        source
            .lines()
            .position(|line| line.contains(&needle))
            .map(|idx| idx + 1)
    }
}

/// Short JSON type name for diagnostics
fn other_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Typed lookups
// ============================================================================

/// Look up a boolean key in a group. A present key of the wrong type is
/// malformed input: it is logged and treated as unset.
pub fn lookup_bool(group: &Map<String, Value>, key: &str) -> Option<bool> {
    let value = group.get(key)?;
    match value.as_bool() {
        Some(b) => Some(b),
        None => {
            tracing::warn!(key, value = %value, "Ignoring non-boolean settings value");
            None
        }
    }
}

/// Look up a byte-sized integer key in a group. Non-integers and values
/// outside 0..=255 are logged and treated as unset.
pub fn lookup_u8(group: &Map<String, Value>, key: &str) -> Option<u8> {
    let value = group.get(key)?;
    match value.as_i64().and_then(|v| u8::try_from(v).ok()) {
        Some(v) => Some(v),
        None => {
            tracing::warn!(key, value = %value, "Ignoring out-of-range settings value");
            None
        }
    }
}

// ============================================================================
// Shared tree (periodic save task + IPC writers)
// ============================================================================

/// Thread-safe shared settings tree
pub type SharedConfigTree = Arc<RwLock<ConfigTree>>;

/// Load a shared settings tree, degrading to empty on failure
pub fn load_shared_tree(path: Option<&Path>) -> SharedConfigTree {
    Arc::new(RwLock::new(ConfigTree::load_or_default(path)))
}

// ============================================================================
// Error Types
// ============================================================================

/// Settings error type
#[derive(Debug)]
pub enum SettingsError {
    /// I/O error reading/writing the file
    Io(std::io::Error),
    /// JSON parse or serialize error
    Parse(serde_json::Error),
    /// No config path could be determined
    NoPath,
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Io(e) => write!(f, "I/O error: {}", e),
            SettingsError::Parse(e) => write!(f, "Parse error: {}", e),
            SettingsError::NoPath => write!(f, "No settings path available"),
        }
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SettingsError::Io(e) => Some(e),
            SettingsError::Parse(e) => Some(e),
            SettingsError::NoPath => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
