//! Orchestrator configuration.

use std::path::PathBuf;
use std::time::Duration;

use harbor_core::{AppName, HostSize};
use serde::{Deserialize, Serialize};

use crate::proxy::ProxySettings;

/// Configuration for the orchestrator daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Root of all persisted state.
    pub data_dir: PathBuf,
    /// Address for the health endpoints.
    pub listen_addr: String,
    /// Base URL of the app store.
    pub store_url: String,
    /// Store branch used when an install does not name one.
    pub store_branch: String,
    /// Program and leading arguments of the compose tool.
    pub compose_command: Vec<String>,
    /// Where the reverse-proxy dynamic config is written.
    pub proxy_config_path: PathBuf,
    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,
    /// Window in which repeated starts of one app collapse into one.
    pub start_throttle: Duration,
    /// Upper bound on engine calls in flight during one reconciliation pass.
    pub max_concurrent_engine_calls: usize,
    /// Interval between disk usage samples.
    pub disk_check_interval: Duration,
    /// Size assigned to this host, if known.
    pub host_size: Option<HostSize>,
    /// Parent domain of the host's derived domain.
    pub base_domain: String,
    /// Public key the host identity is derived from.
    pub host_key: Option<String>,
    /// Upstream URL of the orchestrator's own API.
    pub core_upstream: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data"),
            listen_addr: "0.0.0.0:8080".to_string(),
            store_url: "https://raw.githubusercontent.com/harbor-apps/store".to_string(),
            store_branch: "main".to_string(),
            compose_command: vec!["docker".to_string(), "compose".to_string()],
            proxy_config_path: PathBuf::from("/data/core/proxy/dynamic.yml"),
            reconcile_interval: Duration::from_secs(30),
            start_throttle: Duration::from_secs(5),
            max_concurrent_engine_calls: 4,
            disk_check_interval: Duration::from_secs(60),
            host_size: None,
            base_domain: "harbor.local".to_string(),
            host_key: None,
            core_upstream: "http://harbor-core:8080".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Create a config rooted at `data_dir`, with every derived path under it.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            proxy_config_path: data_dir.join("core").join("proxy").join("dynamic.yml"),
            data_dir,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `HARBOR_DATA_DIR`: Root of all persisted state
    /// - `HARBOR_LISTEN_ADDR`: Address for the health endpoints
    /// - `HARBOR_STORE_URL`: Base URL of the app store
    /// - `HARBOR_STORE_BRANCH`: Default store branch
    /// - `HARBOR_COMPOSE_BINARY`: Compose command, split on whitespace
    /// - `HARBOR_PROXY_CONFIG_PATH`: Reverse-proxy dynamic config file
    /// - `HARBOR_RECONCILE_INTERVAL_SECONDS`: Reconciliation interval
    /// - `HARBOR_START_THROTTLE_SECONDS`: Start throttle window
    /// - `HARBOR_MAX_CONCURRENT_ENGINE_CALLS`: Engine calls per pass
    /// - `HARBOR_DISK_CHECK_INTERVAL_SECONDS`: Disk sampling interval
    /// - `HARBOR_HOST_SIZE`: Host size (`xs`, `s`, `m`, `l`, `xl`)
    /// - `HARBOR_BASE_DOMAIN`: Parent of the host domain
    /// - `HARBOR_HOST_KEY`: Public key used to derive the host identity
    /// - `HARBOR_CORE_UPSTREAM`: Upstream URL of the orchestrator API
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = match std::env::var("HARBOR_DATA_DIR") {
            Ok(val) => Self::with_data_dir(val),
            Err(_) => Self::default(),
        };

        if let Ok(val) = std::env::var("HARBOR_LISTEN_ADDR") {
            config.listen_addr = val;
        }
        if let Ok(val) = std::env::var("HARBOR_STORE_URL") {
            config.store_url = val.trim_end_matches('/').to_string();
        }
        if let Ok(val) = std::env::var("HARBOR_STORE_BRANCH") {
            config.store_branch = val;
        }
        if let Ok(val) = std::env::var("HARBOR_COMPOSE_BINARY") {
            let parts: Vec<String> = val.split_whitespace().map(str::to_string).collect();
            if !parts.is_empty() {
                config.compose_command = parts;
            }
        }
        if let Ok(val) = std::env::var("HARBOR_PROXY_CONFIG_PATH") {
            config.proxy_config_path = PathBuf::from(val);
        }
        if let Some(secs) = env_u64("HARBOR_RECONCILE_INTERVAL_SECONDS") {
            config.reconcile_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_u64("HARBOR_START_THROTTLE_SECONDS") {
            config.start_throttle = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("HARBOR_MAX_CONCURRENT_ENGINE_CALLS") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_concurrent_engine_calls = n.max(1);
            }
        }
        if let Some(secs) = env_u64("HARBOR_DISK_CHECK_INTERVAL_SECONDS") {
            config.disk_check_interval = Duration::from_secs(secs.max(1));
        }
        if let Ok(val) = std::env::var("HARBOR_HOST_SIZE") {
            match val.parse() {
                Ok(size) => config.host_size = Some(size),
                Err(e) => tracing::warn!(error = %e, "Ignoring HARBOR_HOST_SIZE"),
            }
        }
        if let Ok(val) = std::env::var("HARBOR_BASE_DOMAIN") {
            config.base_domain = val;
        }
        if let Ok(val) = std::env::var("HARBOR_HOST_KEY") {
            config.host_key = Some(val);
        }
        if let Ok(val) = std::env::var("HARBOR_CORE_UPSTREAM") {
            config.core_upstream = val;
        }

        config
    }

    /// Directory holding the `RocksDB` database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("core").join("db")
    }

    /// Directory holding every app's installation directory.
    #[must_use]
    pub fn installed_apps_dir(&self) -> PathBuf {
        self.data_dir.join("core").join("installed_apps")
    }

    /// An app's installation directory: extracted archive and compose file.
    #[must_use]
    pub fn installation_dir(&self, app: &AppName) -> PathBuf {
        self.installed_apps_dir().join(app.as_str())
    }

    /// Parent of every app's data directory.
    #[must_use]
    pub fn all_app_data_dir(&self) -> PathBuf {
        self.data_dir.join("user_data").join("app_data")
    }

    /// An app's persistent data directory.
    #[must_use]
    pub fn app_data_dir(&self, app: &AppName) -> PathBuf {
        self.all_app_data_dir().join(app.as_str())
    }

    /// Directory shared between all apps.
    #[must_use]
    pub fn shared_dir(&self) -> PathBuf {
        self.data_dir.join("user_data").join("shared")
    }

    /// Directory operators place custom app archives in.
    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("core").join("custom_apps")
    }

    /// Location of an app's pre-staged archive.
    #[must_use]
    pub fn archive_path(&self, app: &AppName) -> PathBuf {
        self.archive_dir().join(format!("{app}.zip"))
    }

    /// Settings for the reverse-proxy compiler.
    #[must_use]
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings::new(&self.core_upstream)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|val| val.parse().ok())
}
