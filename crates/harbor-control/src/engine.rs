//! Container engine adapter.
//!
//! This module provides the [`EngineAdapter`], which runs compose commands for
//! an app and gates each one on the app's recorded status. A call whose
//! precondition does not hold is a no-op returning `Ok(false)`: the lifecycle
//! controller, inbound requests and the installation worker may all ask for
//! the same transition, and only the call whose precondition currently holds
//! takes effect.
//!
//! | Operation | Allowed from | Command | Status after |
//! |-----------|--------------|---------|--------------|
//! | `create_containers` | any | `up --no-start` | unchanged |
//! | `start` | stopped, down | `up -d` | running |
//! | `stop` | running, uninstalling | `stop` | stopped (optional) |
//! | `stop_running` | running | `stop` | stopped |
//! | `shutdown` | stopped, uninstalling, or forced | `down` | down (optional) |
//!
//! The status written after a command is checked against the record again.
//! If another caller moved the app while compose ran, the write is refused
//! with `ControlError::InvalidTransition` and the other caller's status stays.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harbor_core::AppName;
use harbor_store::{AppStatus, Store};

use crate::error::{ControlError, Result};
use crate::lifecycle;
use crate::throttle::Throttle;

/// Compose subcommands issued by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComposeCommand {
    /// Create containers without starting them.
    Create,
    /// Create and start containers in the background.
    Up,
    /// Stop running containers.
    Stop,
    /// Stop and remove containers and networks.
    Down,
}

impl ComposeCommand {
    /// Arguments passed after the compose program.
    #[must_use]
    pub const fn args(self) -> &'static [&'static str] {
        match self {
            Self::Create => &["up", "--no-start"],
            Self::Up => &["up", "-d"],
            Self::Stop => &["stop"],
            Self::Down => &["down"],
        }
    }
}

impl fmt::Display for ComposeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args().join(" "))
    }
}

/// Result of a finished compose process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful run with no output.
    #[must_use]
    pub fn success() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::default()
        }
    }

    /// Returns true if the process exited with status 0.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs compose commands in an app's working directory.
///
/// This trait abstracts process execution, allowing for mock
/// implementations in tests.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run `command` with `working_dir` as the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error only if the process could not be run. A non-zero exit
    /// is reported through [`CommandOutput::exit_code`].
    async fn compose(&self, working_dir: &Path, command: ComposeCommand) -> Result<CommandOutput>;
}

/// Runs the compose CLI as a subprocess.
#[derive(Debug, Clone)]
pub struct ComposeCli {
    program: String,
    base_args: Vec<String>,
    timeout: Duration,
}

impl ComposeCli {
    /// Default time a single compose invocation may take.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    /// Create a runner from a command line such as `["docker", "compose"]`.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Internal` if the command line is empty.
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, base_args) = command
            .split_first()
            .ok_or_else(|| ControlError::Internal("compose command is empty".to_string()))?;

        Ok(Self {
            program: program.clone(),
            base_args: base_args.to_vec(),
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

}

#[async_trait]
impl ContainerRuntime for ComposeCli {
    async fn compose(&self, working_dir: &Path, command: ComposeCommand) -> Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.base_args)
            .args(command.args())
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            program = %self.program,
            command = %command,
            cwd = %working_dir.display(),
            "Running compose"
        );

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                ControlError::Internal(format!(
                    "compose {command} timed out after {}s",
                    self.timeout.as_secs()
                ))
            })??;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Status-gated compose operations for installed apps.
pub struct EngineAdapter {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn Store>,
    apps_dir: PathBuf,
    start_throttle: Throttle<AppName>,
}

impl EngineAdapter {
    /// Create an adapter running compose in `{apps_dir}/{app}`.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn Store>,
        apps_dir: impl Into<PathBuf>,
        start_throttle: Duration,
    ) -> Self {
        Self {
            runtime,
            store,
            apps_dir: apps_dir.into(),
            start_throttle: Throttle::new(start_throttle),
        }
    }

    /// Create the app's containers without starting them.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Engine` if compose fails.
    pub async fn create_containers(&self, app: &AppName) -> Result<()> {
        self.run(app, ComposeCommand::Create).await
    }

    /// Start the app's containers and mark it `Running`.
    ///
    /// Only acts on apps that are `Stopped` or `Down`. Calls for the same app
    /// within the throttle window collapse into the first one.
    ///
    /// Returns true if compose was invoked.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Engine` if compose fails.
    pub async fn start(&self, app: &AppName) -> Result<bool> {
        let Some(status) = self.gate(app, "start", |s| {
            matches!(s, AppStatus::Stopped | AppStatus::Down)
        })?
        else {
            return Ok(false);
        };

        if !self.start_throttle.try_acquire(app) {
            tracing::debug!(app = %app, "Start throttled");
            return Ok(false);
        }

        self.run(app, ComposeCommand::Up).await?;
        lifecycle::transition(self.store.as_ref(), app, AppStatus::Running)?;

        tracing::info!(app = %app, from = %status, "Started app");

        Ok(true)
    }

    /// Stop the app's containers.
    ///
    /// Only acts on apps that are `Running` or `Uninstalling`. With
    /// `set_status`, a running app is marked `Stopped`.
    ///
    /// Returns true if compose was invoked.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Engine` if compose fails.
    pub async fn stop(&self, app: &AppName, set_status: bool) -> Result<bool> {
        self.stop_gated(app, set_status, |s| {
            matches!(s, AppStatus::Running | AppStatus::Uninstalling)
        })
        .await
    }

    /// Stop a running app and mark it `Stopped`.
    ///
    /// Used by the lifecycle controller, which must not touch an app the
    /// worker is removing.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Engine` if compose fails.
    pub async fn stop_running(&self, app: &AppName) -> Result<bool> {
        self.stop_gated(app, true, |s| s == AppStatus::Running).await
    }

    async fn stop_gated(
        &self,
        app: &AppName,
        set_status: bool,
        allowed: impl Fn(AppStatus) -> bool,
    ) -> Result<bool> {
        let Some(status) = self.gate(app, "stop", allowed)? else {
            return Ok(false);
        };

        self.run(app, ComposeCommand::Stop).await?;
        if set_status && status == AppStatus::Running {
            lifecycle::transition(self.store.as_ref(), app, AppStatus::Stopped)?;
        }

        tracing::info!(app = %app, "Stopped app");

        Ok(true)
    }

    /// Remove the app's containers.
    ///
    /// Only acts on apps that are `Stopped` or `Uninstalling`, unless `force`
    /// is set. With `set_status`, a stopped or running app is marked `Down`.
    ///
    /// Returns true if compose was invoked.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Engine` if compose fails.
    pub async fn shutdown(&self, app: &AppName, force: bool, set_status: bool) -> Result<bool> {
        let Some(status) = self.gate(app, "shutdown", |s| {
            force || matches!(s, AppStatus::Stopped | AppStatus::Uninstalling)
        })?
        else {
            return Ok(false);
        };

        self.run(app, ComposeCommand::Down).await?;
        if set_status && matches!(status, AppStatus::Stopped | AppStatus::Running) {
            lifecycle::transition(self.store.as_ref(), app, AppStatus::Down)?;
        }

        tracing::info!(app = %app, forced = force, "Shut down app");

        Ok(true)
    }

    /// Working directory of an app.
    #[must_use]
    pub fn working_dir(&self, app: &AppName) -> PathBuf {
        self.apps_dir.join(app.as_str())
    }

    /// Read the status and check `allowed`; `None` means skip.
    fn gate(
        &self,
        app: &AppName,
        operation: &'static str,
        allowed: impl Fn(AppStatus) -> bool,
    ) -> Result<Option<AppStatus>> {
        let Some(record) = self.store.get_app(app)? else {
            tracing::debug!(app = %app, operation, "Skipping engine call for unknown app");
            return Ok(None);
        };

        if allowed(record.status) {
            Ok(Some(record.status))
        } else {
            tracing::debug!(
                app = %app,
                operation,
                status = %record.status,
                "Skipping engine call, precondition not met"
            );
            Ok(None)
        }
    }

    async fn run(&self, app: &AppName, command: ComposeCommand) -> Result<()> {
        let output = self
            .runtime
            .compose(&self.working_dir(app), command)
            .await?;

        if output.is_success() {
            return Ok(());
        }

        tracing::warn!(
            app = %app,
            command = %command,
            exit_code = ?output.exit_code,
            stderr = %output.stderr.trim(),
            "Compose command failed"
        );

        Err(ControlError::Engine {
            app: app.clone(),
            command: command.to_string(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// A recording runtime for tests without a container engine.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// A runtime that records every call and succeeds unless told otherwise.
    #[derive(Default)]
    pub struct MockRuntime {
        calls: Mutex<Vec<(PathBuf, ComposeCommand)>>,
        failures: Mutex<HashMap<ComposeCommand, CommandOutput>>,
        delay: Mutex<Option<Duration>>,
    }

    impl MockRuntime {
        /// Create a runtime where every command succeeds.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make `command` exit with status 1 and the given stderr.
        pub fn fail_on(&self, command: ComposeCommand, stderr: &str) {
            self.failures.lock().insert(
                command,
                CommandOutput {
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                },
            );
        }

        /// Delay every command, to simulate a slow engine.
        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock() = Some(delay);
        }

        /// Every call so far.
        #[must_use]
        pub fn calls(&self) -> Vec<(PathBuf, ComposeCommand)> {
            self.calls.lock().clone()
        }

        /// Number of times `command` was run.
        #[must_use]
        pub fn call_count(&self, command: ComposeCommand) -> usize {
            self.calls.lock().iter().filter(|(_, c)| *c == command).count()
        }

        /// Number of times `command` was run in a directory ending with `app`.
        #[must_use]
        pub fn app_call_count(&self, app: &str, command: ComposeCommand) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|(dir, c)| *c == command && dir.ends_with(app))
                .count()
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn compose(
            &self,
            working_dir: &Path,
            command: ComposeCommand,
        ) -> Result<CommandOutput> {
            self.calls.lock().push((working_dir.to_path_buf(), command));

            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let failure = self.failures.lock().get(&command).cloned();
            Ok(failure.unwrap_or_else(CommandOutput::success))
        }
    }
}
