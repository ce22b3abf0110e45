//! Lifecycle controller.
//!
//! Keeps running containers in line with demand and host constraints. Inbound
//! requests wake stopped apps; a periodic pass stops idle apps, starts
//! always-on apps and, while the disk is nearly full, stops everything.
//!
//! The controller never changes status directly. It asks the
//! [`EngineAdapter`], whose status gates make overlapping requests from the
//! worker, inbound traffic and the periodic pass harmless. Its stops only
//! ever act on `Running` apps, so an app the worker is removing is left to
//! the worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use harbor_core::{AppName, HostSize};
use harbor_store::{InstalledApp, Store, StoreError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::disk::HostState;
use crate::engine::EngineAdapter;
use crate::error::{ControlError, Result};
use crate::lifecycle;
use crate::metadata::{AppMeta, AppMetaLoader, Lifecycle};
use crate::periodic::spawn_periodic;

/// What a reconciliation pass should do with one app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start the app's containers.
    Start,
    /// Stop the app's containers.
    Stop,
    /// Leave the app as it is.
    Leave,
}

/// Decide what to do with an app.
///
/// Disk pressure wins over everything. Always-on apps run when the host is
/// large enough and are stopped otherwise. Other apps are never started here,
/// only stopped once idle for their timeout. An app that was never accessed
/// counts as idle.
#[must_use]
pub fn decide(
    record: &InstalledApp,
    meta: Option<&AppMeta>,
    disk_low: bool,
    host_size: Option<HostSize>,
    now: DateTime<Utc>,
) -> Action {
    if disk_low {
        return Action::Stop;
    }
    let Some(meta) = meta else {
        return Action::Leave;
    };

    match meta.lifecycle {
        Lifecycle::AlwaysOn if meta.fits(host_size) => Action::Start,
        Lifecycle::AlwaysOn => Action::Stop,
        Lifecycle::IdleTimeout(timeout) => {
            let Some(last) = record.last_access else {
                return Action::Stop;
            };
            let idle = (now - last).num_seconds();
            if idle >= i64::try_from(timeout).unwrap_or(i64::MAX) {
                Action::Stop
            } else {
                Action::Leave
            }
        }
    }
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Apps whose containers were started.
    pub started: usize,
    /// Apps whose containers were stopped.
    pub stopped: usize,
}

/// Starts and stops apps based on demand, lifecycle policy and host state.
pub struct LifecycleController {
    store: Arc<dyn Store>,
    engine: Arc<EngineAdapter>,
    loader: Arc<AppMetaLoader>,
    host: Arc<HostState>,
    max_concurrent: usize,
    interval: Duration,
}

impl LifecycleController {
    /// Create a controller.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<EngineAdapter>,
        loader: Arc<AppMetaLoader>,
        host: Arc<HostState>,
        max_concurrent: usize,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            loader,
            host,
            max_concurrent: max_concurrent.max(1),
            interval,
        }
    }

    /// Record a routed request for `app` and wake it if needed.
    ///
    /// The access time is always recorded. The start is skipped while the disk
    /// is low, while the app is being installed or removed, when its metadata
    /// cannot be read and when the host is too small for it. Otherwise the
    /// start runs in the background and its handle is returned.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::AppNotFound` if the app is not installed.
    pub fn on_request(self: &Arc<Self>, app: &AppName) -> Result<Option<JoinHandle<()>>> {
        match self.store.record_access(app, Utc::now()) {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Err(ControlError::AppNotFound(app.clone())),
            Err(e) => return Err(e.into()),
        }

        if self.host.disk_is_low() {
            tracing::debug!(app = %app, "Not starting app, disk is low");
            return Ok(None);
        }

        let status = lifecycle::current_status(self.store.as_ref(), app)?;
        if lifecycle::is_busy(status) {
            tracing::debug!(app = %app, %status, "Not starting busy app");
            return Ok(None);
        }

        let meta = match self.loader.load(app) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(app = %app, error = %e, "Not starting app without metadata");
                return Ok(None);
            }
        };
        if !meta.fits(self.host.host_size()) {
            tracing::info!(
                app = %app,
                minimum = %meta.minimum_portal_size,
                "Not starting app, host is too small"
            );
            return Ok(None);
        }

        let controller = Arc::clone(self);
        let app = app.clone();
        Ok(Some(tokio::spawn(async move {
            if let Err(e) = controller.engine.start(&app).await {
                tracing::warn!(app = %app, error = %e, "Start on request failed");
            }
        })))
    }

    /// Run one reconciliation pass over every installed app.
    ///
    /// # Errors
    ///
    /// Returns an error if the app records cannot be listed. Failures for
    /// individual apps are logged and skipped.
    pub async fn reconcile_once(&self) -> Result<ReconcileSummary> {
        let disk_low = self.host.disk_is_low();
        let host_size = self.host.host_size();
        let now = Utc::now();

        let apps: Vec<InstalledApp> = self
            .store
            .list_apps()?
            .into_iter()
            .filter(|app| !lifecycle::is_busy(app.status))
            .collect();

        let started = AtomicUsize::new(0);
        let stopped = AtomicUsize::new(0);

        futures::stream::iter(apps)
            .for_each_concurrent(self.max_concurrent, |record| {
                let started = &started;
                let stopped = &stopped;
                async move {
                    let meta = self.loader.load(&record.name).ok();
                    let action = decide(&record, meta.as_ref(), disk_low, host_size, now);

                    let (result, counter) = match action {
                        Action::Leave => return,
                        Action::Start => (self.engine.start(&record.name).await, started),
                        Action::Stop => (self.engine.stop_running(&record.name).await, stopped),
                    };

                    match result {
                        Ok(true) => {
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(
                                app = %record.name,
                                action = ?action,
                                error = %e,
                                "Reconcile action failed"
                            );
                        }
                    }
                }
            })
            .await;

        let summary = ReconcileSummary {
            started: started.into_inner(),
            stopped: stopped.into_inner(),
        };
        if summary != ReconcileSummary::default() {
            tracing::info!(
                started = summary.started,
                stopped = summary.stopped,
                disk_low,
                "Reconciled apps"
            );
        }

        Ok(summary)
    }

    /// Reconcile every interval until cancelled.
    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.interval;
        spawn_periodic("lifecycle-controller", period, cancel, move || {
            let controller = Arc::clone(&self);
            async move {
                if let Err(e) = controller.reconcile_once().await {
                    tracing::error!(error = %e, "Reconciliation pass failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskUsage;
    use crate::engine::mock::MockRuntime;
    use crate::engine::{CommandOutput, ComposeCommand, ContainerRuntime};
    use crate::metadata::META_FILE;
    use async_trait::async_trait;
    use harbor_store::{AppStatus, InstallationReason, RocksStore};
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: Arc<dyn Store>,
        host: Arc<HostState>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store: Arc<dyn Store> =
                Arc::new(RocksStore::open(dir.path().join("db")).unwrap());
            Self {
                dir,
                store,
                host: Arc::new(HostState::default()),
            }
        }

        fn apps_dir(&self) -> std::path::PathBuf {
            self.dir.path().join("apps")
        }

        fn controller(
            &self,
            runtime: Arc<dyn ContainerRuntime>,
            limit: usize,
        ) -> Arc<LifecycleController> {
            let engine = EngineAdapter::new(
                runtime,
                Arc::clone(&self.store),
                self.apps_dir(),
                Duration::ZERO,
            );
            Arc::new(LifecycleController::new(
                Arc::clone(&self.store),
                Arc::new(engine),
                Arc::new(AppMetaLoader::new(self.apps_dir())),
                Arc::clone(&self.host),
                limit,
                Duration::from_secs(30),
            ))
        }

        fn install(
            &self,
            name: &str,
            status: AppStatus,
            lifecycle: serde_json::Value,
            size: &str,
        ) -> AppName {
            let app = AppName::new(name).unwrap();
            let meta = json!({
                "v": "1.2",
                "name": name,
                "entrypoints": [],
                "lifecycle": lifecycle,
                "minimum_portal_size": size,
            });
            let dir = self.apps_dir().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(META_FILE), meta.to_string()).unwrap();

            self.store
                .put_app(&InstalledApp::new(app.clone(), InstallationReason::Store, status))
                .unwrap();
            app
        }

        fn status(&self, app: &AppName) -> AppStatus {
            self.store.get_app(app).unwrap().unwrap().status
        }

        fn accessed_ago(&self, app: &AppName, secs: i64) {
            self.store
                .record_access(app, Utc::now() - chrono::Duration::seconds(secs))
                .unwrap();
        }
    }

    fn idle(secs: u64) -> serde_json::Value {
        json!({ "idle_time_for_shutdown": secs })
    }

    fn always_on() -> serde_json::Value {
        json!({ "always_on": true })
    }

    fn record(last_access: Option<DateTime<Utc>>) -> InstalledApp {
        let mut app = InstalledApp::new(
            AppName::new("foo").unwrap(),
            InstallationReason::Store,
            AppStatus::Running,
        );
        app.last_access = last_access;
        app
    }

    fn meta(lifecycle: Lifecycle, minimum: HostSize) -> AppMeta {
        AppMeta {
            v: "1.2".to_string(),
            app_version: String::new(),
            name: "foo".to_string(),
            pretty_name: String::new(),
            entrypoints: Vec::new(),
            lifecycle,
            minimum_portal_size: minimum,
        }
    }

    #[test]
    fn decide_idle_timeout() {
        let now = Utc::now();
        let meta = meta(Lifecycle::IdleTimeout(60), HostSize::Xs);

        let recent = record(Some(now - chrono::Duration::seconds(10)));
        assert_eq!(decide(&recent, Some(&meta), false, None, now), Action::Leave);

        let idle = record(Some(now - chrono::Duration::seconds(60)));
        assert_eq!(decide(&idle, Some(&meta), false, None, now), Action::Stop);

        let never = record(None);
        assert_eq!(decide(&never, Some(&meta), false, None, now), Action::Stop);
    }

    #[test]
    fn decide_idle_boundary() {
        let now = Utc::now();
        let meta = meta(Lifecycle::IdleTimeout(60), HostSize::Xs);

        let over = record(Some(now - chrono::Duration::seconds(61)));
        assert_eq!(decide(&over, Some(&meta), false, None, now), Action::Stop);

        let under = record(Some(now - chrono::Duration::seconds(59)));
        assert_eq!(decide(&under, Some(&meta), false, None, now), Action::Leave);
    }

    #[test]
    fn decide_always_on_ignores_last_access() {
        let now = Utc::now();
        let meta = meta(Lifecycle::AlwaysOn, HostSize::Xs);

        let stale = record(Some(now - chrono::Duration::days(30)));
        assert_eq!(decide(&stale, Some(&meta), false, None, now), Action::Start);
    }

    #[test]
    fn decide_always_on_respects_host_size() {
        let now = Utc::now();
        let app = record(None);
        let large = meta(Lifecycle::AlwaysOn, HostSize::L);

        assert_eq!(decide(&app, Some(&large), false, None, now), Action::Start);
        assert_eq!(decide(&app, Some(&large), false, Some(HostSize::Xl), now), Action::Start);
        assert_eq!(decide(&app, Some(&large), false, Some(HostSize::S), now), Action::Stop);
    }

    #[test]
    fn decide_disk_pressure_wins() {
        let now = Utc::now();
        let app = record(Some(now));
        let meta = meta(Lifecycle::AlwaysOn, HostSize::Xs);

        assert_eq!(decide(&app, Some(&meta), true, None, now), Action::Stop);
        assert_eq!(decide(&app, None, true, None, now), Action::Stop);
        assert_eq!(decide(&app, None, false, None, now), Action::Leave);
    }

    #[tokio::test]
    async fn stops_idle_apps() {
        let f = Fixture::new();
        let runtime = Arc::new(MockRuntime::new());
        let stale = f.install("stale", AppStatus::Running, idle(60), "xs");
        let fresh = f.install("fresh", AppStatus::Running, idle(60), "xs");
        f.accessed_ago(&stale, 120);
        f.accessed_ago(&fresh, 5);

        let summary = f.controller(runtime.clone(), 4).reconcile_once().await.unwrap();

        assert_eq!(summary, ReconcileSummary { started: 0, stopped: 1 });
        assert_eq!(f.status(&stale), AppStatus::Stopped);
        assert_eq!(f.status(&fresh), AppStatus::Running);
        assert_eq!(runtime.app_call_count("stale", ComposeCommand::Stop), 1);
    }

    #[tokio::test]
    async fn leaves_stale_always_on_app_running() {
        let f = Fixture::new();
        let runtime = Arc::new(MockRuntime::new());
        let app = f.install("always", AppStatus::Running, always_on(), "xs");
        f.accessed_ago(&app, 30 * 24 * 60 * 60);

        let summary = f.controller(runtime.clone(), 4).reconcile_once().await.unwrap();

        assert_eq!(summary, ReconcileSummary::default());
        assert_eq!(f.status(&app), AppStatus::Running);
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn never_starts_idle_apps() {
        let f = Fixture::new();
        let runtime = Arc::new(MockRuntime::new());
        let app = f.install("foo", AppStatus::Stopped, idle(60), "xs");
        f.accessed_ago(&app, 1);

        f.controller(runtime.clone(), 4).reconcile_once().await.unwrap();

        assert_eq!(f.status(&app), AppStatus::Stopped);
        assert_eq!(runtime.call_count(ComposeCommand::Up), 0);
    }

    #[tokio::test]
    async fn starts_always_on_apps_that_fit() {
        let f = Fixture::new();
        f.host.set_host_size(Some(HostSize::M));
        let runtime = Arc::new(MockRuntime::new());
        let small = f.install("small", AppStatus::Down, always_on(), "s");
        let huge = f.install("huge", AppStatus::Running, always_on(), "xl");

        let summary = f.controller(runtime.clone(), 4).reconcile_once().await.unwrap();

        assert_eq!(summary, ReconcileSummary { started: 1, stopped: 1 });
        assert_eq!(f.status(&small), AppStatus::Running);
        assert_eq!(f.status(&huge), AppStatus::Stopped);
    }

    #[tokio::test]
    async fn disk_pressure_stops_running_apps() {
        let f = Fixture::new();
        f.host.set_disk_usage(DiskUsage::from_bytes(100 << 30, 1 << 20));
        let runtime = Arc::new(MockRuntime::new());
        let always = f.install("always", AppStatus::Running, always_on(), "xs");
        let broken = AppName::new("broken").unwrap();
        f.store
            .put_app(&InstalledApp::new(
                broken.clone(),
                InstallationReason::Custom,
                AppStatus::Running,
            ))
            .unwrap();

        let summary = f.controller(runtime.clone(), 4).reconcile_once().await.unwrap();

        assert_eq!(summary.stopped, 2);
        assert_eq!(f.status(&always), AppStatus::Stopped);
        assert_eq!(f.status(&broken), AppStatus::Stopped);
        assert_eq!(runtime.call_count(ComposeCommand::Up), 0);
    }

    #[tokio::test]
    async fn busy_apps_are_left_alone() {
        let f = Fixture::new();
        f.host.set_disk_usage(DiskUsage::from_bytes(100 << 30, 1 << 20));
        let runtime = Arc::new(MockRuntime::new());
        f.install("a", AppStatus::Installing, always_on(), "xs");
        f.install("b", AppStatus::UninstallationQueued, always_on(), "xs");
        f.install("c", AppStatus::Reinstalling, always_on(), "xs");

        f.controller(runtime.clone(), 4).reconcile_once().await.unwrap();

        assert!(runtime.calls().is_empty());
    }

    struct ConcurrencyGauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ContainerRuntime for ConcurrencyGauge {
        async fn compose(&self, _dir: &Path, _command: ComposeCommand) -> Result<CommandOutput> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(CommandOutput::success())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn engine_calls_are_bounded() {
        let f = Fixture::new();
        let gauge = Arc::new(ConcurrencyGauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        for i in 0..6 {
            f.install(&format!("app{i}"), AppStatus::Stopped, always_on(), "xs");
        }

        let summary = f.controller(gauge.clone(), 2).reconcile_once().await.unwrap();

        assert_eq!(summary.started, 6);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn request_wakes_stopped_app() {
        let f = Fixture::new();
        let runtime = Arc::new(MockRuntime::new());
        let app = f.install("foo", AppStatus::Stopped, idle(60), "xs");
        let controller = f.controller(runtime.clone(), 4);

        let handle = controller.on_request(&app).unwrap().unwrap();
        handle.await.unwrap();

        assert_eq!(f.status(&app), AppStatus::Running);
        assert!(f.store.get_app(&app).unwrap().unwrap().last_access.is_some());

        // Already running: the engine gate turns the second start into a no-op.
        controller.on_request(&app).unwrap().unwrap().await.unwrap();
        assert_eq!(runtime.call_count(ComposeCommand::Up), 1);
    }

    #[tokio::test]
    async fn request_under_disk_pressure_only_records_access() {
        let f = Fixture::new();
        f.host.set_disk_usage(DiskUsage::from_bytes(100 << 30, 1 << 20));
        let runtime = Arc::new(MockRuntime::new());
        let app = f.install("foo", AppStatus::Stopped, idle(60), "xs");

        let handle = f.controller(runtime.clone(), 4).on_request(&app).unwrap();

        assert!(handle.is_none());
        assert!(f.store.get_app(&app).unwrap().unwrap().last_access.is_some());
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn request_skips_busy_and_oversized_apps() {
        let f = Fixture::new();
        f.host.set_host_size(Some(HostSize::Xs));
        let runtime = Arc::new(MockRuntime::new());
        let controller = f.controller(runtime.clone(), 4);
        let busy = f.install("busy", AppStatus::Installing, idle(60), "xs");
        let big = f.install("big", AppStatus::Stopped, idle(60), "l");

        assert!(controller.on_request(&busy).unwrap().is_none());
        assert!(controller.on_request(&big).unwrap().is_none());
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn request_for_unknown_app_fails() {
        let f = Fixture::new();
        let controller = f.controller(Arc::new(MockRuntime::new()), 4);

        let err = controller.on_request(&AppName::new("ghost").unwrap()).unwrap_err();
        assert!(matches!(err, ControlError::AppNotFound(_)));
    }
}
