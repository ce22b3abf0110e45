//! Test fixtures shared by unit tests.

use std::io::{Cursor, Write};

use chrono::{DateTime, Utc};
use harbor_core::AppName;
use harbor_store::{AppStatus, InstalledApp, StatusChange, Store};
use parking_lot::Mutex;
use serde_json::json;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::metadata::META_FILE;
use crate::template::TEMPLATE_FILE;

/// Build an in-memory zip archive from `(path, contents)` pairs.
///
/// # Panics
///
/// Panics if the archive cannot be written.
#[must_use]
pub fn build_zip(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (path, contents) in files {
        writer
            .start_file(*path, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A valid archive for `app` with one HTTPS entrypoint and an idle lifecycle.
#[must_use]
pub fn app_archive(app: &str) -> Vec<u8> {
    let meta = json!({
        "v": "1.2",
        "app_version": "1.0.0",
        "name": app,
        "pretty_name": app,
        "entrypoints": [
            {
                "container_name": format!("{app}-web"),
                "container_port": 80,
                "entrypoint_port": "https_443"
            }
        ],
        "lifecycle": {"idle_time_for_shutdown": 60},
        "minimum_portal_size": "xs"
    });
    let template = concat!(
        "services:\n",
        "  web:\n",
        "    volumes:\n",
        "      - {{ app_data }}:/data\n",
        "    labels:\n",
        "      host: {{ portal.domain }}\n",
    );

    build_zip(&[(META_FILE, &meta.to_string()), (TEMPLATE_FILE, template)])
}

/// A store wrapper recording every status it is asked to write.
pub struct RecordingStore<S> {
    inner: S,
    history: Mutex<Vec<(AppName, Option<AppStatus>)>>,
}

impl<S: Store> RecordingStore<S> {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Statuses written for `app`, in order. Deletion is not included.
    #[must_use]
    pub fn statuses(&self, app: &AppName) -> Vec<AppStatus> {
        self.history
            .lock()
            .iter()
            .filter(|(name, _)| name == app)
            .filter_map(|(_, status)| *status)
            .collect()
    }

    /// Returns true if the record for `app` was deleted.
    #[must_use]
    pub fn was_deleted(&self, app: &AppName) -> bool {
        self.history
            .lock()
            .iter()
            .any(|(name, status)| name == app && status.is_none())
    }

    fn record(&self, app: &AppName, status: Option<AppStatus>) {
        self.history.lock().push((app.clone(), status));
    }
}

impl<S: Store> Store for RecordingStore<S> {
    fn put_app(&self, app: &InstalledApp) -> harbor_store::Result<()> {
        self.inner.put_app(app)?;
        self.record(&app.name, Some(app.status));
        Ok(())
    }

    fn insert_app(&self, app: &InstalledApp) -> harbor_store::Result<()> {
        self.inner.insert_app(app)?;
        self.record(&app.name, Some(app.status));
        Ok(())
    }

    fn get_app(&self, name: &AppName) -> harbor_store::Result<Option<InstalledApp>> {
        self.inner.get_app(name)
    }

    fn delete_app(&self, name: &AppName) -> harbor_store::Result<()> {
        self.inner.delete_app(name)?;
        self.record(name, None);
        Ok(())
    }

    fn list_apps(&self) -> harbor_store::Result<Vec<InstalledApp>> {
        self.inner.list_apps()
    }

    fn list_apps_by_status(&self, status: AppStatus) -> harbor_store::Result<Vec<InstalledApp>> {
        self.inner.list_apps_by_status(status)
    }

    fn update_app_status(&self, name: &AppName, status: AppStatus) -> harbor_store::Result<()> {
        self.inner.update_app_status(name, status)?;
        self.record(name, Some(status));
        Ok(())
    }

    fn compare_and_set_status(
        &self,
        name: &AppName,
        status: AppStatus,
        allow: &dyn Fn(AppStatus) -> bool,
    ) -> harbor_store::Result<StatusChange> {
        let change = self.inner.compare_and_set_status(name, status, allow)?;
        if let StatusChange::Applied(_) = change {
            self.record(name, Some(status));
        }
        Ok(change)
    }

    fn update_app_error(
        &self,
        name: &AppName,
        status: AppStatus,
        error_message: Option<String>,
    ) -> harbor_store::Result<()> {
        self.inner.update_app_error(name, status, error_message)?;
        self.record(name, Some(status));
        Ok(())
    }

    fn record_access(&self, name: &AppName, at: DateTime<Utc>) -> harbor_store::Result<()> {
        self.inner.record_access(name, at)
    }
}
