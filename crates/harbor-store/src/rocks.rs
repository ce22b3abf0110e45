//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use harbor_core::AppName;
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{AppStatus, InstalledApp, StatusChange};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    // Serializes read-modify-write updates so a status change and an access
    // timestamp written concurrently do not overwrite each other.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::MissingColumnFamily(name.to_string()))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn write_app(&self, app: &InstalledApp) -> Result<()> {
        let cf_apps = self.cf(cf::APPS)?;
        let cf_by_status = self.cf(cf::APPS_BY_STATUS)?;

        let app_key = keys::app_key(&app.name);
        let status_key = keys::status_app_key(app.status.as_u8(), &app.name);
        let value = Self::serialize(app)?;

        let old_status = self
            .db
            .get_cf(&cf_apps, &app_key)?
            .map(|data| Self::deserialize::<InstalledApp>(&data))
            .transpose()?
            .map(|a| a.status);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_apps, &app_key, &value);

        if let Some(old) = old_status {
            if old != app.status {
                let old_status_key = keys::status_app_key(old.as_u8(), &app.name);
                batch.delete_cf(&cf_by_status, &old_status_key);
            }
        }
        batch.put_cf(&cf_by_status, &status_key, []);

        self.db.write(batch)?;
        Ok(())
    }

    fn modify_app(&self, name: &AppName, f: impl FnOnce(&mut InstalledApp)) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut app = self.get_app(name)?.ok_or_else(|| StoreError::NotFound(name.clone()))?;
        f(&mut app);
        app.updated_at = Utc::now();
        self.write_app(&app)
    }
}

fn set_status(app: &mut InstalledApp, status: AppStatus) {
    app.status = status;
    if status != AppStatus::Error {
        app.error_message = None;
    }
}

impl Store for RocksStore {
    fn put_app(&self, app: &InstalledApp) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.write_app(app)
    }

    fn insert_app(&self, app: &InstalledApp) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.get_app(&app.name)?.is_some() {
            return Err(StoreError::AlreadyExists(app.name.clone()));
        }
        self.write_app(app)
    }

    fn get_app(&self, name: &AppName) -> Result<Option<InstalledApp>> {
        let cf = self.cf(cf::APPS)?;
        let key = keys::app_key(name);

        self.db
            .get_cf(&cf, key)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn delete_app(&self, name: &AppName) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf_apps = self.cf(cf::APPS)?;
        let cf_by_status = self.cf(cf::APPS_BY_STATUS)?;

        let app = self.get_app(name)?.ok_or_else(|| StoreError::NotFound(name.clone()))?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_apps, keys::app_key(name));
        batch.delete_cf(&cf_by_status, keys::status_app_key(app.status.as_u8(), name));

        self.db.write(batch)?;
        Ok(())
    }

    fn list_apps(&self) -> Result<Vec<InstalledApp>> {
        let cf = self.cf(cf::APPS)?;

        let mut apps = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            apps.push(Self::deserialize(&value)?);
        }

        Ok(apps)
    }

    fn list_apps_by_status(&self, status: AppStatus) -> Result<Vec<InstalledApp>> {
        let cf_by_status = self.cf(cf::APPS_BY_STATUS)?;
        let prefix = keys::status_prefix(status.as_u8());

        let mut apps = Vec::new();
        let iter = self.db.iterator_cf(
            &cf_by_status,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, _) = item?;

            if !key.starts_with(&prefix) {
                break;
            }

            let Some(name) = keys::extract_name_from_status_app_key(&key) else {
                tracing::warn!(?key, "Skipping malformed status index key");
                continue;
            };

            if let Some(app) = self.get_app(&name)? {
                apps.push(app);
            }
        }

        Ok(apps)
    }

    fn update_app_status(&self, name: &AppName, status: AppStatus) -> Result<()> {
        self.modify_app(name, |app| set_status(app, status))
    }

    fn compare_and_set_status(
        &self,
        name: &AppName,
        status: AppStatus,
        allow: &dyn Fn(AppStatus) -> bool,
    ) -> Result<StatusChange> {
        let _guard = self.write_lock.lock();
        let mut app = self.get_app(name)?.ok_or_else(|| StoreError::NotFound(name.clone()))?;

        let previous = app.status;
        if !allow(previous) {
            return Ok(StatusChange::Rejected(previous));
        }

        set_status(&mut app, status);
        app.updated_at = Utc::now();
        self.write_app(&app)?;

        Ok(StatusChange::Applied(previous))
    }

    fn update_app_error(
        &self,
        name: &AppName,
        status: AppStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        self.modify_app(name, |app| {
            app.status = status;
            app.error_message = error_message;
        })
    }

    fn record_access(&self, name: &AppName, at: DateTime<Utc>) -> Result<()> {
        self.modify_app(name, |app| app.last_access = Some(at))
    }
}
