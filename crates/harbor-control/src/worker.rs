//! Installation worker.
//!
//! A single consumer drains an unbounded FIFO queue of install, uninstall and
//! reinstall tasks, one at a time. Every task touches the shared proxy config
//! and the engine's working directories, so tasks never run concurrently, not
//! even for different apps.
//!
//! A failing task moves its app to `Error`, publishes `InstallationFailed` and
//! the loop carries on with the next task. Only cancellation ends the loop; a
//! task already running is finished first.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use harbor_core::{AppName, HostIdentity};
use harbor_store::{AppStatus, Store};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::archive;
use crate::config::OrchestratorConfig;
use crate::engine::EngineAdapter;
use crate::error::{ControlError, Result};
use crate::events::{AppEvent, EventBus};
use crate::lifecycle;
use crate::metadata::AppMetaLoader;
use crate::proxy::ProxyConfigWriter;
use crate::store_client::AppStoreClient;
use crate::template::{self, TemplateVars};

/// What a task does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskType {
    /// Download the archive from the store and install it.
    InstallFromStore {
        /// Store branch; the configured default when absent.
        branch: Option<String>,
    },
    /// Install from an archive pre-staged on the host.
    InstallFromArchive,
    /// Remove the app and its data.
    Uninstall,
    /// Remove the app's installation and data, then install it again.
    Reinstall,
}

/// A unit of work for the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationTask {
    /// The app the task is for.
    pub app_name: AppName,
    /// What to do.
    pub task_type: TaskType,
}

impl InstallationTask {
    /// Create a task.
    #[must_use]
    pub const fn new(app_name: AppName, task_type: TaskType) -> Self {
        Self {
            app_name,
            task_type,
        }
    }
}

/// Sending side of the task queue.
#[derive(Debug, Clone)]
pub struct InstallationQueue {
    tx: mpsc::UnboundedSender<InstallationTask>,
}

impl InstallationQueue {
    /// A queue with no worker behind it, for inspecting enqueued tasks.
    #[cfg(any(test, feature = "test-utils"))]
    #[must_use]
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<InstallationTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Append a task. Never blocks.
    ///
    /// Tasks enqueued after the worker stopped are dropped with a warning.
    pub fn enqueue(&self, task: InstallationTask) {
        tracing::debug!(app = %task.app_name, task = ?task.task_type, "Enqueued task");
        if let Err(mpsc::error::SendError(task)) = self.tx.send(task) {
            tracing::warn!(app = %task.app_name, "Worker stopped, dropping task");
        }
    }
}

/// Handle for stopping the worker.
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker to stop after the task it is running, if any.
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Stop the worker and wait for it to finish.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "Installation worker panicked");
        }
    }
}

enum ArchiveSource {
    Store { branch: Option<String> },
    Staged,
}

/// Executes installation tasks.
pub struct InstallationWorker {
    /// Paths and defaults.
    pub config: Arc<OrchestratorConfig>,
    /// App records.
    pub store: Arc<dyn Store>,
    /// Container engine.
    pub engine: Arc<EngineAdapter>,
    /// Store download client.
    pub store_client: Arc<dyn AppStoreClient>,
    /// Metadata loader over the installation directories.
    pub loader: Arc<AppMetaLoader>,
    /// Reverse-proxy config writer.
    pub proxy: Arc<ProxyConfigWriter>,
    /// The host identity used for templates and routes.
    pub identity: HostIdentity,
    /// Event bus for outbound notifications.
    pub events: EventBus,
}

impl InstallationWorker {
    /// Start the consumer loop.
    ///
    /// Returns the queue to send tasks with and a handle to stop the loop.
    #[must_use]
    pub fn spawn(self, cancel: CancellationToken) -> (InstallationQueue, WorkerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(self.run(rx, cancel.clone()));

        (InstallationQueue { tx }, WorkerHandle { cancel, join })
    }

    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<InstallationTask>,
        cancel: CancellationToken,
    ) {
        tracing::info!("Installation worker started");

        loop {
            let task = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            self.process(task).await;
        }

        tracing::info!("Installation worker stopped");
    }

    /// Run one task to completion, recording any failure on the app.
    pub async fn process(&self, task: InstallationTask) {
        let app = &task.app_name;
        tracing::info!(app = %app, task = ?task.task_type, "Processing task");

        let result = match &task.task_type {
            TaskType::InstallFromStore { branch } => {
                self.install(app, ArchiveSource::Store {
                    branch: branch.clone(),
                })
                .await
            }
            TaskType::InstallFromArchive => self.install(app, ArchiveSource::Staged).await,
            TaskType::Uninstall => self.uninstall(app).await,
            TaskType::Reinstall => self.reinstall(app).await,
        };

        match result {
            Ok(()) => tracing::info!(app = %app, task = ?task.task_type, "Task completed"),
            Err(e) => self.fail(app, &e),
        }
    }

    async fn install(&self, app: &AppName, source: ArchiveSource) -> Result<()> {
        self.claim(app, AppStatus::InstallationQueued, AppStatus::Installing)?;

        self.install_steps(app, source).await?;

        lifecycle::transition(self.store.as_ref(), app, AppStatus::Stopped)?;
        self.refresh_proxy()?;
        self.events.emit(AppEvent::AppsChanged);

        tracing::info!(app = %app, "Installed app");

        Ok(())
    }

    async fn uninstall(&self, app: &AppName) -> Result<()> {
        self.claim(app, AppStatus::UninstallationQueued, AppStatus::Uninstalling)?;

        if let Err(e) = self.engine.stop(app, false).await {
            tracing::warn!(app = %app, error = %e, "Stop failed during uninstall");
        }
        if let Err(e) = self.engine.shutdown(app, false, false).await {
            tracing::warn!(app = %app, error = %e, "Shutdown failed during uninstall");
        }

        remove_dir_if_exists(&self.config.installation_dir(app)).await?;
        remove_dir_if_exists(&self.config.app_data_dir(app)).await?;

        self.store.delete_app(app)?;
        self.refresh_proxy()?;
        self.events.emit(AppEvent::AppsChanged);

        tracing::info!(app = %app, "Uninstalled app");

        Ok(())
    }

    async fn reinstall(&self, app: &AppName) -> Result<()> {
        self.claim(app, AppStatus::ReinstallationQueued, AppStatus::Reinstalling)?;

        if let Err(e) = self.engine.shutdown(app, true, false).await {
            tracing::warn!(app = %app, error = %e, "Shutdown failed during reinstall");
        }

        remove_dir_if_exists(&self.config.installation_dir(app)).await?;
        remove_dir_if_exists(&self.config.app_data_dir(app)).await?;

        let source = if tokio::fs::try_exists(self.config.archive_path(app))
            .await
            .unwrap_or(false)
        {
            ArchiveSource::Staged
        } else {
            ArchiveSource::Store { branch: None }
        };
        self.install_steps(app, source).await?;

        lifecycle::transition(self.store.as_ref(), app, AppStatus::Stopped)?;
        self.refresh_proxy()?;
        self.events.emit(AppEvent::AppsChanged);

        tracing::info!(app = %app, "Reinstalled app");

        Ok(())
    }

    /// Fetch, extract, render and create containers.
    async fn install_steps(&self, app: &AppName, source: ArchiveSource) -> Result<()> {
        let bytes = self.fetch(app, source).await?;

        let installation_dir = self.config.installation_dir(app);
        remove_dir_if_exists(&installation_dir).await?;
        archive::extract_async(bytes, &installation_dir).await?;

        // Refuse archives without usable metadata before touching the engine.
        self.loader.load(app)?;

        tokio::fs::create_dir_all(self.config.app_data_dir(app)).await?;
        tokio::fs::create_dir_all(self.config.shared_dir()).await?;

        let vars = TemplateVars::for_app(&self.config, &self.identity, app);
        template::render_compose_file(&installation_dir, &vars).await?;

        self.engine.create_containers(app).await
    }

    async fn fetch(&self, app: &AppName, source: ArchiveSource) -> Result<Vec<u8>> {
        match source {
            ArchiveSource::Store { branch } => {
                let branch = branch.unwrap_or_else(|| self.config.store_branch.clone());
                self.store_client.fetch_archive(app, &branch).await
            }
            ArchiveSource::Staged => {
                let path = self.config.archive_path(app);
                match tokio::fs::read(&path).await {
                    Ok(bytes) => Ok(bytes),
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        Err(ControlError::ArchiveNotFound {
                            app: app.clone(),
                            path,
                        })
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn claim(&self, app: &AppName, expected: AppStatus, to: AppStatus) -> Result<()> {
        lifecycle::claim(self.store.as_ref(), app, expected, to)
    }

    fn refresh_proxy(&self) -> Result<()> {
        self.proxy
            .refresh(self.store.as_ref(), &self.loader, &self.identity)
            .map(|_| ())
    }

    fn fail(&self, app: &AppName, err: &ControlError) {
        tracing::error!(app = %app, error = %err, "Task failed");

        if let Err(e) = lifecycle::mark_error(self.store.as_ref(), app, &err.to_string()) {
            tracing::error!(app = %app, error = %e, "Failed to record task failure");
        }
        if let Err(e) = self.refresh_proxy() {
            tracing::warn!(app = %app, error = %e, "Failed to refresh proxy config after failure");
        }

        self.events.emit(AppEvent::InstallationFailed {
            app: app.clone(),
            reason: err.to_string(),
        });
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockRuntime;
    use crate::engine::ComposeCommand;
    use crate::store_client::mock::MockStoreClient;
    use crate::template::COMPOSE_FILE;
    use crate::testing::{app_archive, RecordingStore};
    use harbor_core::HostId;
    use harbor_store::{InstallationReason, InstalledApp, RocksStore};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    struct Fixture {
        _dir: TempDir,
        config: Arc<OrchestratorConfig>,
        store: Arc<RecordingStore<RocksStore>>,
        runtime: Arc<MockRuntime>,
        store_client: Arc<MockStoreClient>,
        events: EventBus,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let config = Arc::new(OrchestratorConfig::with_data_dir(dir.path()));
            let store = Arc::new(RecordingStore::new(
                RocksStore::open(config.db_path()).unwrap(),
            ));
            Self {
                _dir: dir,
                config,
                store,
                runtime: Arc::new(MockRuntime::new()),
                store_client: Arc::new(MockStoreClient::new()),
                events: EventBus::default(),
            }
        }

        fn worker(&self) -> InstallationWorker {
            let store: Arc<dyn Store> = self.store.clone();
            InstallationWorker {
                config: Arc::clone(&self.config),
                store: Arc::clone(&store),
                engine: Arc::new(EngineAdapter::new(
                    self.runtime.clone(),
                    store,
                    self.config.installed_apps_dir(),
                    Duration::ZERO,
                )),
                store_client: self.store_client.clone(),
                loader: Arc::new(AppMetaLoader::new(self.config.installed_apps_dir())),
                proxy: Arc::new(ProxyConfigWriter::new(
                    &self.config.proxy_config_path,
                    self.config.proxy_settings(),
                )),
                identity: HostIdentity::new(HostId::from_bytes([7u8; 32]), "070707.harbor.local"),
                events: self.events.clone(),
            }
        }

        fn queue(&self, name: &str, status: AppStatus) -> AppName {
            let app = AppName::new(name).unwrap();
            self.store
                .put_app(&InstalledApp::new(app.clone(), InstallationReason::Store, status))
                .unwrap();
            app
        }

        fn proxy_yaml(&self) -> String {
            std::fs::read_to_string(&self.config.proxy_config_path).unwrap_or_default()
        }
    }

    fn store_install(app: &AppName) -> InstallationTask {
        InstallationTask::new(app.clone(), TaskType::InstallFromStore { branch: None })
    }

    fn drain(rx: &mut broadcast::Receiver<AppEvent>) -> Vec<AppEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn install_from_store() {
        let f = Fixture::new();
        let mut rx = f.events.subscribe();
        let foo = f.queue("foo", AppStatus::InstallationQueued);
        f.store_client.insert(&foo, app_archive("foo"));

        f.worker().process(store_install(&foo)).await;

        assert_eq!(
            f.store.statuses(&foo),
            [AppStatus::InstallationQueued, AppStatus::Installing, AppStatus::Stopped]
        );
        assert_eq!(f.store_client.fetches(), vec![(foo.clone(), "main".to_string())]);
        assert_eq!(f.runtime.call_count(ComposeCommand::Create), 1);

        let compose =
            std::fs::read_to_string(f.config.installation_dir(&foo).join(COMPOSE_FILE)).unwrap();
        assert!(compose.contains("070707.harbor.local"));
        assert!(f.config.app_data_dir(&foo).is_dir());
        assert!(f.proxy_yaml().contains("foo_https_443"));
        assert_eq!(drain(&mut rx), [AppEvent::AppsChanged]);
    }

    #[tokio::test]
    async fn install_from_staged_archive() {
        let f = Fixture::new();
        let foo = f.queue("foo", AppStatus::InstallationQueued);
        std::fs::create_dir_all(f.config.archive_dir()).unwrap();
        std::fs::write(f.config.archive_path(&foo), app_archive("foo")).unwrap();

        f.worker()
            .process(InstallationTask::new(foo.clone(), TaskType::InstallFromArchive))
            .await;

        assert_eq!(f.store.get_app(&foo).unwrap().unwrap().status, AppStatus::Stopped);
        assert!(f.store_client.fetches().is_empty());
    }

    #[tokio::test]
    async fn missing_store_archive_fails_once() {
        let f = Fixture::new();
        let mut rx = f.events.subscribe();
        let bar = f.queue("bar", AppStatus::InstallationQueued);

        f.worker().process(store_install(&bar)).await;

        assert_eq!(
            f.store.statuses(&bar),
            [AppStatus::InstallationQueued, AppStatus::Installing, AppStatus::Error]
        );
        let record = f.store.get_app(&bar).unwrap().unwrap();
        assert!(record.error_message.unwrap().contains("does not exist in the store"));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AppEvent::InstallationFailed { app, .. } if *app == bar));
        assert_eq!(f.runtime.calls().len(), 0);
    }

    #[tokio::test]
    async fn archive_without_metadata_fails_before_engine() {
        let f = Fixture::new();
        let foo = f.queue("foo", AppStatus::InstallationQueued);
        f.store_client
            .insert(&foo, crate::testing::build_zip(&[("readme.txt", "hi")]));

        f.worker().process(store_install(&foo)).await;

        assert_eq!(f.store.get_app(&foo).unwrap().unwrap().status, AppStatus::Error);
        assert!(f.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn wrong_status_is_illegal() {
        let f = Fixture::new();
        let foo = f.queue("foo", AppStatus::Running);
        let mut rx = f.events.subscribe();

        f.worker()
            .process(InstallationTask::new(foo.clone(), TaskType::Reinstall))
            .await;

        assert_eq!(f.store.get_app(&foo).unwrap().unwrap().status, AppStatus::Error);
        let events = drain(&mut rx);
        assert!(matches!(
            &events[..],
            [AppEvent::InstallationFailed { reason, .. }] if reason.contains("illegal status")
        ));
    }

    #[tokio::test]
    async fn uninstall_removes_everything() {
        let f = Fixture::new();
        let foo = f.queue("foo", AppStatus::InstallationQueued);
        f.store_client.insert(&foo, app_archive("foo"));
        let worker = f.worker();
        worker.process(store_install(&foo)).await;
        f.store.update_app_status(&foo, AppStatus::Running).unwrap();
        f.store
            .update_app_status(&foo, AppStatus::UninstallationQueued)
            .unwrap();

        worker
            .process(InstallationTask::new(foo.clone(), TaskType::Uninstall))
            .await;

        assert!(f.store.get_app(&foo).unwrap().is_none());
        assert!(f.store.was_deleted(&foo));
        assert!(!f.config.installation_dir(&foo).exists());
        assert!(!f.config.app_data_dir(&foo).exists());
        assert!(!f.proxy_yaml().contains("foo_"));
        assert_eq!(f.runtime.call_count(ComposeCommand::Stop), 1);
        assert_eq!(f.runtime.call_count(ComposeCommand::Down), 1);
    }

    #[tokio::test]
    async fn uninstall_survives_engine_failures() {
        let f = Fixture::new();
        let foo = f.queue("foo", AppStatus::UninstallationQueued);
        f.runtime.fail_on(ComposeCommand::Stop, "daemon unreachable");
        f.runtime.fail_on(ComposeCommand::Down, "daemon unreachable");

        f.worker()
            .process(InstallationTask::new(foo.clone(), TaskType::Uninstall))
            .await;

        assert!(f.store.get_app(&foo).unwrap().is_none());
    }

    #[tokio::test]
    async fn reinstall_replaces_installation_and_data() {
        let f = Fixture::new();
        let foo = f.queue("foo", AppStatus::InstallationQueued);
        f.store_client.insert(&foo, app_archive("foo"));
        let worker = f.worker();
        worker.process(store_install(&foo)).await;

        let marker = f.config.app_data_dir(&foo).join("db.sqlite");
        std::fs::write(&marker, "data").unwrap();
        let stale = f.config.installation_dir(&foo).join("stale.txt");
        std::fs::write(&stale, "old").unwrap();
        f.store
            .update_app_status(&foo, AppStatus::ReinstallationQueued)
            .unwrap();

        worker
            .process(InstallationTask::new(foo.clone(), TaskType::Reinstall))
            .await;

        assert_eq!(f.store.get_app(&foo).unwrap().unwrap().status, AppStatus::Stopped);
        assert!(!marker.exists());
        assert!(!stale.exists());
        assert!(f.config.app_data_dir(&foo).is_dir());
        assert_eq!(f.runtime.call_count(ComposeCommand::Down), 1);
        assert_eq!(f.runtime.call_count(ComposeCommand::Create), 2);
    }

    #[tokio::test]
    async fn failed_reinstall_reports_once() {
        let f = Fixture::new();
        let mut rx = f.events.subscribe();
        let foo = f.queue("foo", AppStatus::ReinstallationQueued);
        std::fs::create_dir_all(f.config.app_data_dir(&foo)).unwrap();

        f.worker()
            .process(InstallationTask::new(foo.clone(), TaskType::Reinstall))
            .await;

        assert_eq!(
            f.store.statuses(&foo),
            [AppStatus::ReinstallationQueued, AppStatus::Reinstalling, AppStatus::Error]
        );
        let record = f.store.get_app(&foo).unwrap().unwrap();
        assert!(record.error_message.unwrap().contains("does not exist in the store"));
        assert!(!f.config.app_data_dir(&foo).exists());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AppEvent::InstallationFailed { app, .. } if *app == foo));
        assert_eq!(f.runtime.call_count(ComposeCommand::Create), 0);
    }

    #[tokio::test]
    async fn queue_is_fifo_and_survives_failures() {
        let f = Fixture::new();
        let mut rx = f.events.subscribe();
        let a = f.queue("a", AppStatus::InstallationQueued);
        let b = f.queue("b", AppStatus::InstallationQueued);
        let c = f.queue("c", AppStatus::InstallationQueued);
        f.store_client.insert(&a, app_archive("a"));
        f.store_client.insert(&c, app_archive("c"));

        let cancel = CancellationToken::new();
        let (queue, handle) = f.worker().spawn(cancel);
        for app in [&a, &b, &c] {
            queue.enqueue(InstallationTask::new(
                app.clone(),
                TaskType::InstallFromStore { branch: None },
            ));
        }

        let mut seen = Vec::new();
        while seen.len() < 3 {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(event);
        }
        handle.shutdown_and_join().await;

        assert_eq!(seen[0], AppEvent::AppsChanged);
        assert!(matches!(&seen[1], AppEvent::InstallationFailed { app, .. } if *app == b));
        assert_eq!(seen[2], AppEvent::AppsChanged);
        let fetched: Vec<_> = f.store_client.fetches().into_iter().map(|(app, _)| app).collect();
        assert_eq!(fetched, [a, b, c]);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_dropped() {
        let f = Fixture::new();
        let (queue, handle) = f.worker().spawn(CancellationToken::new());
        handle.shutdown_and_join().await;

        queue.enqueue(InstallationTask::new(
            AppName::new("late").unwrap(),
            TaskType::Uninstall,
        ));
    }
}
