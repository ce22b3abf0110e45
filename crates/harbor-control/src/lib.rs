//! App lifecycle and installation orchestrator for harbor hosts.
//!
//! This crate installs, removes and reinstalls containerized apps, starts and
//! stops their containers as demand and host resources change, and keeps the
//! reverse-proxy routing config in step with the set of installed apps.
//!
//! # Architecture
//!
//! ```text
//!   install / uninstall / reinstall          routed requests
//!                 │                                 │
//!                 ▼                                 ▼
//!        ┌─────────────────┐              ┌──────────────────┐
//!        │  Orchestrator   │              │    Lifecycle     │◄── disk / size
//!        │ (enqueue API)   │              │    Controller    │    (HostState)
//!        └─────────────────┘              └──────────────────┘
//!                 │ FIFO                             │
//!                 ▼                                  │
//!        ┌─────────────────┐                         │
//!        │  Installation   │── fetch ──► App store   │
//!        │     Worker      │── extract / render      │
//!        └─────────────────┘                         │
//!           │          │                             │
//!           │          ▼                             ▼
//!           │   ┌─────────────┐            ┌──────────────────┐
//!           │   │ Proxy config│            │  Engine Adapter  │──► compose CLI
//!           │   │  compiler   │            │ (status gated)   │
//!           │   └─────────────┘            └──────────────────┘
//!           │                                        │
//!           └──────────────┬─────────────────────────┘
//!                          ▼
//!                  ┌──────────────┐
//!                  │    Store     │
//!                  │  (RocksDB)   │
//!                  └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use harbor_control::{
//!     AppMetaLoader, ComposeCli, EngineAdapter, EventBus, HttpStoreClient,
//!     InstallationWorker, Orchestrator, OrchestratorConfig, ProxyConfigWriter,
//! };
//! use harbor_core::{AppName, HostIdentity};
//! use harbor_store::{RocksStore, Store};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(OrchestratorConfig::with_data_dir("/tmp/harbor"));
//! let store: Arc<dyn Store> = Arc::new(RocksStore::open(config.db_path())?);
//! let runtime = Arc::new(ComposeCli::new(&config.compose_command)?);
//! let events = EventBus::default();
//!
//! let worker = InstallationWorker {
//!     config: Arc::clone(&config),
//!     store: Arc::clone(&store),
//!     engine: Arc::new(EngineAdapter::new(
//!         runtime,
//!         Arc::clone(&store),
//!         config.installed_apps_dir(),
//!         config.start_throttle,
//!     )),
//!     store_client: Arc::new(HttpStoreClient::new(config.store_url.clone())?),
//!     loader: Arc::new(AppMetaLoader::new(config.installed_apps_dir())),
//!     proxy: Arc::new(ProxyConfigWriter::new(
//!         &config.proxy_config_path,
//!         config.proxy_settings(),
//!     )),
//!     identity: HostIdentity::derive(b"host-public-key", &config.base_domain),
//!     events: events.clone(),
//! };
//! let (queue, handle) = worker.spawn(CancellationToken::new());
//!
//! let orchestrator = Orchestrator::new(config, store, queue, events);
//! orchestrator.install_from_store(&AppName::new("nextcloud")?, None)?;
//!
//! handle.shutdown_and_join().await;
//! # Ok(())
//! # }
//! ```
//!
//! # State Machine
//!
//! - (absent) → `InstallationQueued` → `Installing` → `Stopped` or `Error`
//! - `Stopped` / `Down` → `Running` (start), `Running` → `Stopped` (stop)
//! - `Stopped` / `Running` → `Down` (shutdown)
//! - `Stopped` / `Running` / `Down` / `Error` → `UninstallationQueued` →
//!   `Uninstalling` → (record deleted)
//! - `Stopped` / `Error` → `ReinstallationQueued` → `Reinstalling` →
//!   `Stopped` or `Error`
//! - any status other than `Error` → `Error`
//!
//! See the [`lifecycle`] module for transition validation helpers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod archive;
pub mod config;
pub mod controller;
pub mod disk;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod metadata;
pub mod periodic;
pub mod proxy;
pub mod service;
pub mod store_client;
pub mod template;
pub mod throttle;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::OrchestratorConfig;
pub use controller::{Action, LifecycleController, ReconcileSummary};
pub use disk::{DiskMonitor, DiskUsage, HostState};
pub use engine::{CommandOutput, ComposeCli, ComposeCommand, ContainerRuntime, EngineAdapter};
pub use error::{ControlError, Result};
pub use events::{AppEvent, EventBus};
pub use metadata::{AppMeta, AppMetaLoader, Entrypoint, EntrypointKind, Lifecycle};
pub use proxy::{DynamicConfig, ProxyConfigWriter, ProxySettings};
pub use service::Orchestrator;
pub use store_client::{AppStoreClient, HttpStoreClient};
pub use worker::{InstallationQueue, InstallationTask, InstallationWorker, TaskType, WorkerHandle};

#[cfg(any(test, feature = "test-utils"))]
pub use engine::mock::MockRuntime;
#[cfg(any(test, feature = "test-utils"))]
pub use store_client::mock::MockStoreClient;

// Re-export commonly used types from dependencies for convenience
pub use harbor_core::{AppName, HostIdentity, HostSize};
pub use harbor_store::{AppStatus, InstallationReason, InstalledApp, Store};
