//! App status state machine.
//!
//! Every component that changes an app's status goes through this module, so
//! the worker, the engine adapter and the lifecycle controller all agree on
//! which edges exist.
//!
//! # State Machine
//!
//! ```text
//!   (absent) ──install──▶ InstallationQueued ──▶ Installing ──┬──▶ Stopped
//!                                                             └──▶ Error
//!
//!   Stopped ◀──stop── Running ◀──start── Stopped | Down
//!   Stopped | Running ──shutdown──▶ Down
//!
//!   Stopped | Running | Down | Error ──uninstall──▶ UninstallationQueued
//!   UninstallationQueued ──▶ Uninstalling ──▶ (record deleted)
//!
//!   Stopped | Error ──reinstall──▶ ReinstallationQueued
//!   ReinstallationQueued ──▶ Reinstalling ──┬──▶ Stopped
//!                                           └──▶ Error
//!
//!   any status except Error ──failure──▶ Error
//! ```

use harbor_core::AppName;
use harbor_store::{AppStatus, StatusChange, Store, StoreError};

use crate::error::{ControlError, Result};

/// Check if a status transition is an edge of the state machine.
#[must_use]
pub const fn is_valid_transition(from: AppStatus, to: AppStatus) -> bool {
    use AppStatus::{
        Down, Error, InstallationQueued, Installing, ReinstallationQueued, Reinstalling,
        Running, Stopped, UninstallationQueued, Uninstalling,
    };

    matches!(
        (from, to),
        (InstallationQueued, Installing)
            | (Installing | Reinstalling, Stopped)
            | (Stopped | Running | Down | Error, UninstallationQueued)
            | (UninstallationQueued, Uninstalling)
            | (Stopped | Error, ReinstallationQueued)
            | (ReinstallationQueued, Reinstalling)
            | (Stopped | Down, Running)
            | (Running, Stopped)
            | (Stopped | Running, Down)
            | (
                InstallationQueued
                    | Installing
                    | Stopped
                    | Running
                    | Down
                    | UninstallationQueued
                    | Uninstalling
                    | ReinstallationQueued
                    | Reinstalling,
                Error
            )
    )
}

/// Returns true while an install, uninstall or reinstall is queued or running.
///
/// The lifecycle controller leaves such apps alone.
#[must_use]
pub const fn is_busy(status: AppStatus) -> bool {
    matches!(
        status,
        AppStatus::InstallationQueued
            | AppStatus::Installing
            | AppStatus::UninstallationQueued
            | AppStatus::Uninstalling
            | AppStatus::ReinstallationQueued
            | AppStatus::Reinstalling
    )
}

/// Returns true if the status is a queued status awaiting the worker.
#[must_use]
pub const fn is_queued(status: AppStatus) -> bool {
    matches!(
        status,
        AppStatus::InstallationQueued
            | AppStatus::UninstallationQueued
            | AppStatus::ReinstallationQueued
    )
}

/// Returns true if a worker task was executing when the status was written.
#[must_use]
pub const fn is_in_progress(status: AppStatus) -> bool {
    matches!(
        status,
        AppStatus::Installing | AppStatus::Uninstalling | AppStatus::Reinstalling
    )
}

/// Returns true if the app should appear in the reverse-proxy config.
#[must_use]
pub const fn is_routable(status: AppStatus) -> bool {
    !matches!(status, AppStatus::InstallationQueued | AppStatus::Error)
}

/// Move an app to `to`, validating the edge against the recorded status.
///
/// The check and the write are one store operation, so two callers racing
/// on the same app cannot both take an edge from the same status.
///
/// Returns the previous status.
///
/// # Errors
///
/// Returns `ControlError::AppNotFound` if there is no record and
/// `ControlError::InvalidTransition` if the edge does not exist.
pub fn transition(store: &dyn Store, app: &AppName, to: AppStatus) -> Result<AppStatus> {
    let change = compare_and_set(store, app, to, &|from| is_valid_transition(from, to))?;
    match change {
        StatusChange::Applied(from) => {
            tracing::debug!(app = %app, %from, %to, "Status transition");
            Ok(from)
        }
        StatusChange::Rejected(from) => Err(ControlError::InvalidTransition {
            app: app.clone(),
            from,
            to,
        }),
    }
}

/// Move an app from exactly `expected` to `to`.
///
/// The worker uses this to claim a task: any other recorded status means the
/// task is stale.
///
/// # Errors
///
/// Returns `ControlError::AppNotFound` if there is no record and
/// `ControlError::IllegalStatus` if the app is not in `expected`.
pub fn claim(store: &dyn Store, app: &AppName, expected: AppStatus, to: AppStatus) -> Result<()> {
    match compare_and_set(store, app, to, &|from| from == expected)? {
        StatusChange::Applied(_) => {
            tracing::debug!(app = %app, from = %expected, %to, "Status transition");
            Ok(())
        }
        StatusChange::Rejected(actual) => Err(ControlError::IllegalStatus {
            app: app.clone(),
            expected,
            actual,
        }),
    }
}

fn compare_and_set(
    store: &dyn Store,
    app: &AppName,
    to: AppStatus,
    allow: &dyn Fn(AppStatus) -> bool,
) -> Result<StatusChange> {
    match store.compare_and_set_status(app, to, allow) {
        Ok(change) => Ok(change),
        Err(StoreError::NotFound(_)) => Err(ControlError::AppNotFound(app.clone())),
        Err(e) => Err(e.into()),
    }
}

/// Move an app to `Error` and record why.
///
/// Every status may move to `Error`, and an app already there gets the new
/// reason. A missing record is not an error, since a failed uninstall may
/// already have removed it.
///
/// # Errors
///
/// Returns an error if the store operation fails.
pub fn mark_error(store: &dyn Store, app: &AppName, reason: &str) -> Result<()> {
    match store.update_app_error(app, AppStatus::Error, Some(reason.to_string())) {
        Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Read the recorded status of an app.
///
/// # Errors
///
/// Returns `ControlError::AppNotFound` if there is no record.
pub fn current_status(store: &dyn Store, app: &AppName) -> Result<AppStatus> {
    store
        .get_app(app)?
        .map(|record| record.status)
        .ok_or_else(|| ControlError::AppNotFound(app.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_store::{InstallationReason, InstalledApp, RocksStore};
    use tempfile::TempDir;

    fn foo() -> AppName {
        AppName::new("foo").unwrap()
    }

    #[test]
    fn install_path() {
        use AppStatus::*;

        assert!(is_valid_transition(InstallationQueued, Installing));
        assert!(is_valid_transition(Installing, Stopped));
        assert!(is_valid_transition(Installing, Error));
        assert!(is_valid_transition(Stopped, Running));
        assert!(is_valid_transition(Running, Stopped));
        assert!(is_valid_transition(Running, Down));
        assert!(is_valid_transition(Down, Running));
    }

    #[test]
    fn uninstall_requires_queue() {
        use AppStatus::*;

        assert!(!is_valid_transition(Stopped, Uninstalling));
        assert!(!is_valid_transition(Running, Uninstalling));
        assert!(is_valid_transition(Stopped, UninstallationQueued));
        assert!(is_valid_transition(UninstallationQueued, Uninstalling));
        assert!(is_valid_transition(Error, UninstallationQueued));
    }

    #[test]
    fn invalid_transitions() {
        use AppStatus::*;

        assert!(!is_valid_transition(Installing, Running));
        assert!(!is_valid_transition(Running, ReinstallationQueued));
        assert!(!is_valid_transition(Down, ReinstallationQueued));
        assert!(!is_valid_transition(InstallationQueued, Stopped));
        assert!(!is_valid_transition(Error, Error));
        assert!(!is_valid_transition(Error, Running));
        assert!(!is_valid_transition(Uninstalling, Stopped));
    }

    #[test]
    fn error_is_reachable_from_everything_else() {
        for status in AppStatus::ALL {
            assert_eq!(
                is_valid_transition(status, AppStatus::Error),
                status != AppStatus::Error
            );
        }
    }

    #[test]
    fn error_leaves_only_through_queues() {
        let targets: Vec<_> = AppStatus::ALL
            .into_iter()
            .filter(|to| is_valid_transition(AppStatus::Error, *to))
            .collect();
        assert_eq!(
            targets,
            [AppStatus::UninstallationQueued, AppStatus::ReinstallationQueued]
        );
    }

    #[test]
    fn busy_statuses() {
        assert!(is_busy(AppStatus::InstallationQueued));
        assert!(is_busy(AppStatus::Installing));
        assert!(is_busy(AppStatus::Uninstalling));
        assert!(!is_busy(AppStatus::Stopped));
        assert!(!is_busy(AppStatus::Running));
        assert!(!is_busy(AppStatus::Error));
    }

    #[test]
    fn routable_statuses() {
        assert!(!is_routable(AppStatus::InstallationQueued));
        assert!(!is_routable(AppStatus::Error));
        assert!(is_routable(AppStatus::Installing));
        assert!(is_routable(AppStatus::Running));
    }

    #[test]
    fn transition_through_store() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store
            .put_app(&InstalledApp::new(
                foo(),
                InstallationReason::Store,
                AppStatus::InstallationQueued,
            ))
            .unwrap();

        let from = transition(&store, &foo(), AppStatus::Installing).unwrap();
        assert_eq!(from, AppStatus::InstallationQueued);
        match transition(&store, &foo(), AppStatus::Running) {
            Err(ControlError::InvalidTransition { from, to, .. }) => {
                assert_eq!(from, AppStatus::Installing);
                assert_eq!(to, AppStatus::Running);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
        assert_eq!(current_status(&store, &foo()).unwrap(), AppStatus::Installing);

        mark_error(&store, &foo(), "boom").unwrap();
        let record = store.get_app(&foo()).unwrap().unwrap();
        assert_eq!(record.status, AppStatus::Error);
        assert_eq!(record.error_message.as_deref(), Some("boom"));

        // Already in error: reason is replaced.
        mark_error(&store, &foo(), "again").unwrap();
        let record = store.get_app(&foo()).unwrap().unwrap();
        assert_eq!(record.error_message.as_deref(), Some("again"));

        let missing = AppName::new("missing").unwrap();
        assert!(mark_error(&store, &missing, "gone").is_ok());
        assert!(matches!(
            transition(&store, &missing, AppStatus::Installing),
            Err(ControlError::AppNotFound(_))
        ));
    }

    #[test]
    fn claim_requires_exact_status() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store
            .put_app(&InstalledApp::new(foo(), InstallationReason::Store, AppStatus::Stopped))
            .unwrap();

        // Stopped -> Reinstalling is not an edge either way, but a claim
        // reports the stale task rather than the edge.
        match claim(&store, &foo(), AppStatus::ReinstallationQueued, AppStatus::Reinstalling) {
            Err(ControlError::IllegalStatus { expected, actual, .. }) => {
                assert_eq!(expected, AppStatus::ReinstallationQueued);
                assert_eq!(actual, AppStatus::Stopped);
            }
            other => panic!("expected IllegalStatus, got {other:?}"),
        }

        transition(&store, &foo(), AppStatus::ReinstallationQueued).unwrap();
        claim(&store, &foo(), AppStatus::ReinstallationQueued, AppStatus::Reinstalling).unwrap();
        assert_eq!(current_status(&store, &foo()).unwrap(), AppStatus::Reinstalling);
    }

    #[test]
    fn racing_transitions_take_one_edge() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store
            .put_app(&InstalledApp::new(foo(), InstallationReason::Store, AppStatus::Running))
            .unwrap();

        // Half the callers stop the app and half queue its removal. Every
        // edge taken must start from the status the previous winner wrote.
        let results: Vec<(AppStatus, Result<AppStatus>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let to = if i % 2 == 0 {
                        AppStatus::Stopped
                    } else {
                        AppStatus::UninstallationQueued
                    };
                    let store = &store;
                    scope.spawn(move || (to, transition(store, &foo(), to)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut applied: Vec<(AppStatus, AppStatus)> = results
            .iter()
            .filter_map(|(to, result)| result.as_ref().ok().map(|from| (*from, *to)))
            .collect();
        applied.sort_by_key(|(from, _)| *from != AppStatus::Running);

        // Either Running -> UninstallationQueued, or Running -> Stopped
        // followed by Stopped -> UninstallationQueued.
        assert!(
            applied == [(AppStatus::Running, AppStatus::UninstallationQueued)]
                || applied
                    == [
                        (AppStatus::Running, AppStatus::Stopped),
                        (AppStatus::Stopped, AppStatus::UninstallationQueued),
                    ],
            "unexpected edges: {applied:?}"
        );
        assert_eq!(
            current_status(&store, &foo()).unwrap(),
            AppStatus::UninstallationQueued
        );
    }
}
