//! Enqueue-time API.
//!
//! [`Orchestrator`] validates a request against the app's record, writes the
//! queued status and hands the task to the installation worker. Anything that
//! can be rejected up front is returned to the caller; everything after the
//! enqueue is reported through [`AppEvent`]s.

use std::sync::Arc;

use harbor_core::AppName;
use harbor_store::{AppStatus, InstallationReason, InstalledApp, Store, StoreError};
use tokio::sync::broadcast;

use crate::config::OrchestratorConfig;
use crate::error::{ControlError, Result};
use crate::events::{AppEvent, EventBus};
use crate::lifecycle;
use crate::worker::{InstallationQueue, InstallationTask, TaskType};

const INTERRUPTED: &str = "interrupted by restart";

/// Front door for install, uninstall and reinstall requests.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    store: Arc<dyn Store>,
    queue: InstallationQueue,
    events: EventBus,
}

impl Orchestrator {
    /// Create an orchestrator feeding `queue`.
    #[must_use]
    pub fn new(
        config: Arc<OrchestratorConfig>,
        store: Arc<dyn Store>,
        queue: InstallationQueue,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            events,
        }
    }

    /// Queue an install from the app store.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::AlreadyInstalled` if the app has a record.
    pub fn install_from_store(&self, app: &AppName, branch: Option<String>) -> Result<()> {
        self.queue_install(app, InstallationReason::Store)?;
        self.queue
            .enqueue(InstallationTask::new(app.clone(), TaskType::InstallFromStore { branch }));
        Ok(())
    }

    /// Queue an install from the archive pre-staged on the host.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::ArchiveNotFound` if no archive was staged and
    /// `ControlError::AlreadyInstalled` if the app has a record.
    pub fn install_from_archive(&self, app: &AppName) -> Result<()> {
        let path = self.config.archive_path(app);
        if !path.is_file() {
            return Err(ControlError::ArchiveNotFound {
                app: app.clone(),
                path,
            });
        }

        self.queue_install(app, InstallationReason::Custom)?;
        self.queue
            .enqueue(InstallationTask::new(app.clone(), TaskType::InstallFromArchive));
        Ok(())
    }

    /// Queue removal of an app and its data.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::AppNotFound` if the app is not installed and
    /// `ControlError::InvalidTransition` if it cannot be uninstalled from its
    /// current status.
    pub fn uninstall(&self, app: &AppName) -> Result<()> {
        self.queue_transition(app, AppStatus::UninstallationQueued)?;
        self.queue
            .enqueue(InstallationTask::new(app.clone(), TaskType::Uninstall));
        Ok(())
    }

    /// Queue a reinstall of an app, discarding its data.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::AppNotFound` if the app is not installed and
    /// `ControlError::InvalidTransition` if it cannot be reinstalled from its
    /// current status.
    pub fn reinstall(&self, app: &AppName) -> Result<()> {
        self.queue_transition(app, AppStatus::ReinstallationQueued)?;
        self.queue
            .enqueue(InstallationTask::new(app.clone(), TaskType::Reinstall));
        Ok(())
    }

    /// Settle records left behind by a previous run.
    ///
    /// Tasks that were executing are marked `Error`, since their side effects
    /// are unknown. Tasks that were still queued are queued again, in name
    /// order. Returns the number of tasks re-queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let mut queued = Vec::new();

        for status in AppStatus::ALL {
            if lifecycle::is_in_progress(status) {
                for record in self.store.list_apps_by_status(status)? {
                    self.fail_interrupted(record.name, status)?;
                }
            } else if lifecycle::is_queued(status) {
                queued.extend(self.store.list_apps_by_status(status)?);
            }
        }

        queued.sort_by(|a, b| a.name.cmp(&b.name));
        let requeued = queued.len();

        for record in queued {
            let app = record.name;
            let task_type = match record.status {
                AppStatus::UninstallationQueued => TaskType::Uninstall,
                AppStatus::ReinstallationQueued => TaskType::Reinstall,
                _ if self.config.archive_path(&app).is_file() => TaskType::InstallFromArchive,
                _ => TaskType::InstallFromStore { branch: None },
            };

            tracing::info!(app = %app, task = ?task_type, "Re-queuing task");
            self.queue.enqueue(InstallationTask::new(app, task_type));
        }

        Ok(requeued)
    }

    /// Subscribe to app events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    fn queue_install(&self, app: &AppName, reason: InstallationReason) -> Result<()> {
        let record = InstalledApp::new(app.clone(), reason, AppStatus::InstallationQueued);
        match self.store.insert_app(&record) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                return Err(ControlError::AlreadyInstalled(app.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(app = %app, ?reason, "Install queued");

        Ok(())
    }

    fn fail_interrupted(&self, app: AppName, status: AppStatus) -> Result<()> {
        tracing::warn!(app = %app, %status, "Task interrupted by restart");
        lifecycle::mark_error(self.store.as_ref(), &app, INTERRUPTED)?;
        self.events.emit(AppEvent::InstallationFailed {
            app,
            reason: INTERRUPTED.to_string(),
        });
        Ok(())
    }

    fn queue_transition(&self, app: &AppName, to: AppStatus) -> Result<()> {
        let from = lifecycle::transition(self.store.as_ref(), app, to)?;

        tracing::info!(app = %app, %from, %to, "Task queued");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingStore;
    use harbor_store::RocksStore;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    // Builds an orchestrator whose queue is read back directly, without a worker.
    fn setup() -> (
        TempDir,
        Orchestrator,
        Arc<RecordingStore<RocksStore>>,
        mpsc::UnboundedReceiver<InstallationTask>,
    ) {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(OrchestratorConfig::with_data_dir(dir.path()));
        let store = Arc::new(RecordingStore::new(
            RocksStore::open(config.db_path()).unwrap(),
        ));
        let (queue, rx) = InstallationQueue::detached();
        let orchestrator = Orchestrator::new(config, store.clone(), queue, EventBus::default());
        (dir, orchestrator, store, rx)
    }

    fn app(name: &str) -> AppName {
        AppName::new(name).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<InstallationTask>) -> Vec<InstallationTask> {
        let mut tasks = Vec::new();
        while let Ok(task) = rx.try_recv() {
            tasks.push(task);
        }
        tasks
    }

    #[test]
    fn install_from_store_queues_task() {
        let (_dir, orchestrator, store, mut rx) = setup();
        let foo = app("foo");

        orchestrator
            .install_from_store(&foo, Some("beta".to_string()))
            .unwrap();

        let record = store.get_app(&foo).unwrap().unwrap();
        assert_eq!(record.status, AppStatus::InstallationQueued);
        assert_eq!(record.installation_reason, InstallationReason::Store);
        assert_eq!(
            drain(&mut rx),
            [InstallationTask::new(
                foo,
                TaskType::InstallFromStore {
                    branch: Some("beta".to_string())
                }
            )]
        );
    }

    #[test]
    fn install_twice_is_rejected() {
        let (_dir, orchestrator, _store, mut rx) = setup();
        let foo = app("foo");

        orchestrator.install_from_store(&foo, None).unwrap();
        let err = orchestrator.install_from_store(&foo, None).unwrap_err();

        assert!(matches!(err, ControlError::AlreadyInstalled(_)));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn install_from_archive_requires_staged_file() {
        let (dir, orchestrator, store, mut rx) = setup();
        let foo = app("foo");

        let err = orchestrator.install_from_archive(&foo).unwrap_err();
        assert!(matches!(err, ControlError::ArchiveNotFound { .. }));
        assert!(store.get_app(&foo).unwrap().is_none());

        let config = OrchestratorConfig::with_data_dir(dir.path());
        std::fs::create_dir_all(config.archive_dir()).unwrap();
        std::fs::write(config.archive_path(&foo), b"zip").unwrap();

        orchestrator.install_from_archive(&foo).unwrap();
        assert_eq!(
            store.get_app(&foo).unwrap().unwrap().installation_reason,
            InstallationReason::Custom
        );
        assert_eq!(
            drain(&mut rx),
            [InstallationTask::new(foo, TaskType::InstallFromArchive)]
        );
    }

    #[test]
    fn concurrent_installs_queue_one_task() {
        let (_dir, orchestrator, store, mut rx) = setup();
        let foo = app("foo");

        let accepted = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| orchestrator.install_from_store(&foo, None)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(Result::is_ok)
                .count()
        });

        assert_eq!(accepted, 1);
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(store.statuses(&foo), [AppStatus::InstallationQueued]);
    }

    #[test]
    fn uninstall_and_reinstall_check_status() {
        let (_dir, orchestrator, store, mut rx) = setup();
        let foo = app("foo");

        assert!(matches!(
            orchestrator.uninstall(&foo).unwrap_err(),
            ControlError::AppNotFound(_)
        ));

        store
            .put_app(&InstalledApp::new(foo.clone(), InstallationReason::Store, AppStatus::Running))
            .unwrap();
        assert!(matches!(
            orchestrator.reinstall(&foo).unwrap_err(),
            ControlError::InvalidTransition { .. }
        ));

        orchestrator.uninstall(&foo).unwrap();
        assert_eq!(
            store.get_app(&foo).unwrap().unwrap().status,
            AppStatus::UninstallationQueued
        );
        assert_eq!(
            drain(&mut rx),
            [InstallationTask::new(foo, TaskType::Uninstall)]
        );
    }

    #[test]
    fn errored_app_can_be_reinstalled() {
        let (_dir, orchestrator, store, mut rx) = setup();
        let foo = app("foo");
        store
            .put_app(&InstalledApp::new(foo.clone(), InstallationReason::Store, AppStatus::Error))
            .unwrap();

        orchestrator.reinstall(&foo).unwrap();

        assert_eq!(
            store.statuses(&foo),
            [AppStatus::Error, AppStatus::ReinstallationQueued]
        );
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn recovery_fails_in_progress_and_requeues_queued() {
        let (_dir, orchestrator, store, mut rx) = setup();
        let mut events = orchestrator.subscribe();
        for (name, status) in [
            ("a", AppStatus::Installing),
            ("b", AppStatus::UninstallationQueued),
            ("c", AppStatus::Running),
            ("d", AppStatus::InstallationQueued),
            ("e", AppStatus::ReinstallationQueued),
        ] {
            store
                .put_app(&InstalledApp::new(app(name), InstallationReason::Store, status))
                .unwrap();
        }

        let requeued = orchestrator.recover_interrupted().unwrap();

        assert_eq!(requeued, 3);
        let a = store.get_app(&app("a")).unwrap().unwrap();
        assert_eq!(a.status, AppStatus::Error);
        assert_eq!(a.error_message.as_deref(), Some(INTERRUPTED));
        assert!(matches!(
            events.try_recv().unwrap(),
            AppEvent::InstallationFailed { app, .. } if app.as_str() == "a"
        ));

        let tasks = drain(&mut rx);
        assert_eq!(
            tasks,
            [
                InstallationTask::new(app("b"), TaskType::Uninstall),
                InstallationTask::new(app("d"), TaskType::InstallFromStore { branch: None }),
                InstallationTask::new(app("e"), TaskType::Reinstall),
            ]
        );
    }
}
