//! Application metadata loader.
//!
//! Each installed app ships an `app_meta.json` describing its entrypoints,
//! lifecycle policy and minimum host size. Files are loaded fresh on every use.
//! Older schema versions are migrated in sequence before validation.

use std::fmt;
use std::path::{Path, PathBuf};

use harbor_core::{AppName, HostSize};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ControlError, Result};

/// File name of the metadata document inside an installation directory.
pub const META_FILE: &str = "app_meta.json";

/// Schema version produced by the migration chain.
pub const CURRENT_VERSION: &str = "1.2";

/// Idle timeout given to apps written before lifecycles were declared.
pub const DEFAULT_IDLE_SECONDS: u64 = 60;

/// Shortest idle timeout an app may declare.
pub const MIN_IDLE_SECONDS: u64 = 5;

/// Validated app metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMeta {
    /// Schema version.
    pub v: String,
    /// Version of the app itself.
    #[serde(default)]
    pub app_version: String,
    /// Name the app is installed under.
    pub name: String,
    /// Human readable name.
    #[serde(default)]
    pub pretty_name: String,
    /// Ports exposed through the reverse proxy.
    #[serde(default)]
    pub entrypoints: Vec<Entrypoint>,
    /// When the app may be stopped.
    pub lifecycle: Lifecycle,
    /// Smallest host size the app may run on.
    pub minimum_portal_size: HostSize,
}

impl AppMeta {
    /// Returns true if the app may run on a host of the given size.
    #[must_use]
    pub fn fits(&self, host_size: Option<HostSize>) -> bool {
        HostSize::allows(host_size, self.minimum_portal_size)
    }
}

/// A container port exposed through the reverse proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entrypoint {
    /// Container the traffic is routed to.
    pub container_name: String,
    /// Port inside the container.
    pub container_port: u16,
    /// Which proxy entrypoint the port is exposed on.
    pub entrypoint_port: EntrypointKind,
}

/// Proxy entrypoint kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntrypointKind {
    /// HTTPS on port 443.
    #[serde(rename = "https_443")]
    Https443,
    /// MQTT over TLS on port 1883.
    #[serde(rename = "mqtt_1883")]
    Mqtt1883,
}

impl EntrypointKind {
    /// The name used in metadata files and router keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Https443 => "https_443",
            Self::Mqtt1883 => "mqtt_1883",
        }
    }
}

impl fmt::Display for EntrypointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When an app may be stopped by the lifecycle controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LifecycleDoc", into = "LifecycleDoc")]
pub enum Lifecycle {
    /// Keep running whenever the host allows it.
    AlwaysOn,
    /// Stop after this many seconds without a routed request.
    IdleTimeout(u64),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LifecycleDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    always_on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    idle_time_for_shutdown: Option<u64>,
}

impl TryFrom<LifecycleDoc> for Lifecycle {
    type Error = String;

    fn try_from(doc: LifecycleDoc) -> std::result::Result<Self, Self::Error> {
        match (doc.always_on, doc.idle_time_for_shutdown) {
            (Some(true), None) => Ok(Self::AlwaysOn),
            (Some(true), Some(_)) => {
                Err("always_on and idle_time_for_shutdown are mutually exclusive".to_string())
            }
            (_, Some(secs)) if secs < MIN_IDLE_SECONDS => Err(format!(
                "idle_time_for_shutdown must be at least {MIN_IDLE_SECONDS}, got {secs}"
            )),
            (_, Some(secs)) => Ok(Self::IdleTimeout(secs)),
            (_, None) => Err("lifecycle needs always_on or idle_time_for_shutdown".to_string()),
        }
    }
}

impl From<Lifecycle> for LifecycleDoc {
    fn from(lifecycle: Lifecycle) -> Self {
        match lifecycle {
            Lifecycle::AlwaysOn => Self {
                always_on: Some(true),
                idle_time_for_shutdown: None,
            },
            Lifecycle::IdleTimeout(secs) => Self {
                always_on: None,
                idle_time_for_shutdown: Some(secs),
            },
        }
    }
}

/// Loads metadata from app installation directories.
#[derive(Debug, Clone)]
pub struct AppMetaLoader {
    root: PathBuf,
}

impl AppMetaLoader {
    /// Create a loader over the directory holding every installation directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of an app's metadata file.
    #[must_use]
    pub fn meta_path(&self, app: &AppName) -> PathBuf {
        self.root.join(app.as_str()).join(META_FILE)
    }

    /// Load, migrate and validate an app's metadata.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::MetadataNotFound` if the file is missing,
    /// malformed, of an unknown version or fails validation.
    pub fn load(&self, app: &AppName) -> Result<AppMeta> {
        let not_found = |reason: String| ControlError::MetadataNotFound {
            app: app.clone(),
            reason,
        };

        let path = self.meta_path(app);
        let raw = read_file(&path).map_err(&not_found)?;
        let doc: Value = serde_json::from_str(&raw).map_err(|e| not_found(e.to_string()))?;
        let doc = migrate(doc).map_err(&not_found)?;
        let meta: AppMeta = serde_json::from_value(doc).map_err(|e| not_found(e.to_string()))?;
        validate(&meta).map_err(not_found)?;

        Ok(meta)
    }
}

fn read_file(path: &Path) -> std::result::Result<String, String> {
    std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))
}

/// Bring a metadata document up to `CURRENT_VERSION`.
fn migrate(mut doc: Value) -> std::result::Result<Value, String> {
    loop {
        let version = doc
            .get("v")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing schema version".to_string())?
            .to_string();

        let Some(obj) = doc.as_object_mut() else {
            return Err("metadata is not an object".to_string());
        };

        match version.as_str() {
            "1.0" => {
                obj.entry("lifecycle")
                    .or_insert_with(|| json!({ "idle_time_for_shutdown": DEFAULT_IDLE_SECONDS }));
                obj.insert("v".to_string(), json!("1.1"));
            }
            "1.1" => {
                obj.entry("minimum_portal_size")
                    .or_insert_with(|| json!(HostSize::Xs.as_str()));
                obj.insert("v".to_string(), json!("1.2"));
            }
            CURRENT_VERSION => return Ok(doc),
            other => return Err(format!("unsupported schema version {other}")),
        }
    }
}

fn validate(meta: &AppMeta) -> std::result::Result<(), String> {
    for entrypoint in &meta.entrypoints {
        if entrypoint.container_name.is_empty() {
            return Err("entrypoint container_name is empty".to_string());
        }
        if entrypoint.container_port == 0 {
            return Err(format!(
                "entrypoint {} has port 0",
                entrypoint.container_name
            ));
        }
    }
    Ok(())
}
