//! HTTP client for the app store.
//!
//! Archives are served as static files at
//! `{base_url}/{branch}/all_apps/{name}/{name}.zip`.

use std::time::Duration;

use async_trait::async_trait;
use harbor_core::AppName;

use crate::error::{ControlError, Result};

/// Trait for downloading app archives.
///
/// This trait abstracts the store transport, allowing for mock
/// implementations in tests.
#[async_trait]
pub trait AppStoreClient: Send + Sync {
    /// Fetch the archive for an app from the given branch.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::AppNotInStore` if the store answers with a
    /// non-success status and `ControlError::Transport` if the request fails.
    async fn fetch_archive(&self, app: &AppName, branch: &str) -> Result<Vec<u8>>;
}

/// HTTP client for the app store.
#[derive(Debug, Clone)]
pub struct HttpStoreClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStoreClient {
    /// Create a new store client.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Transport` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self::with_client(client, base_url))
    }

    /// Create a new store client with a custom reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Get the base URL of the store.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of an app's archive on a branch.
    #[must_use]
    pub fn archive_url(&self, app: &AppName, branch: &str) -> String {
        format!("{}/{branch}/all_apps/{app}/{app}.zip", self.base_url)
    }
}

#[async_trait]
impl AppStoreClient for HttpStoreClient {
    async fn fetch_archive(&self, app: &AppName, branch: &str) -> Result<Vec<u8>> {
        let url = self.archive_url(app, branch);
        tracing::debug!(app = %app, url = %url, "Downloading app archive");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            tracing::warn!(
                app = %app,
                branch = %branch,
                status = %response.status(),
                "App archive not available in store"
            );
            return Err(ControlError::AppNotInStore(app.clone()));
        }

        let bytes = response.bytes().await?;

        tracing::info!(app = %app, branch = %branch, size = bytes.len(), "Downloaded app archive");

        Ok(bytes.to_vec())
    }
}

/// An in-memory store for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// A mock store that serves archives from memory.
    #[derive(Default)]
    pub struct MockStoreClient {
        archives: Mutex<HashMap<AppName, Vec<u8>>>,
        fetches: Mutex<Vec<(AppName, String)>>,
    }

    impl MockStoreClient {
        /// Create an empty mock store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Publish an archive for an app.
        pub fn insert(&self, app: &AppName, archive: Vec<u8>) {
            self.archives.lock().insert(app.clone(), archive);
        }

        /// Every `(app, branch)` fetched so far.
        #[must_use]
        pub fn fetches(&self) -> Vec<(AppName, String)> {
            self.fetches.lock().clone()
        }
    }

    #[async_trait]
    impl AppStoreClient for MockStoreClient {
        async fn fetch_archive(&self, app: &AppName, branch: &str) -> Result<Vec<u8>> {
            self.fetches.lock().push((app.clone(), branch.to_string()));
            self.archives
                .lock()
                .get(app)
                .cloned()
                .ok_or_else(|| ControlError::AppNotInStore(app.clone()))
        }
    }
}
