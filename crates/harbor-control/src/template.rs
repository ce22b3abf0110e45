//! Compose template rendering.
//!
//! Archives carry a `docker-compose.yml.template` with `{{ name }}`
//! placeholders. Rendering substitutes host paths and the host identity and
//! writes `docker-compose.yml` next to it.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use harbor_core::{AppName, HostIdentity};
use regex::{Captures, Regex};

use crate::config::OrchestratorConfig;
use crate::error::{ControlError, Result};

/// Template file name inside an installation directory.
pub const TEMPLATE_FILE: &str = "docker-compose.yml.template";

/// Rendered compose file name.
pub const COMPOSE_FILE: &str = "docker-compose.yml";

#[allow(clippy::expect_used)] // literal pattern
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\s*\}\}")
        .expect("placeholder regex is valid")
});

/// Variables available to compose templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateVars {
    /// The app's persistent data directory.
    pub app_data: PathBuf,
    /// Parent of every app's data directory.
    pub all_app_data: PathBuf,
    /// Directory shared between apps.
    pub shared: PathBuf,
    /// The app's installation directory.
    pub installation_dir: PathBuf,
    /// Full host id.
    pub portal_id: String,
    /// Short host id.
    pub portal_short_id: String,
    /// Host domain.
    pub portal_domain: String,
}

impl TemplateVars {
    /// Build the variable set for an app.
    #[must_use]
    pub fn for_app(config: &OrchestratorConfig, identity: &HostIdentity, app: &AppName) -> Self {
        Self {
            app_data: config.app_data_dir(app),
            all_app_data: config.all_app_data_dir(),
            shared: config.shared_dir(),
            installation_dir: config.installation_dir(app),
            portal_id: identity.id().to_hex(),
            portal_short_id: identity.short_id(),
            portal_domain: identity.domain().to_string(),
        }
    }

    fn lookup(&self, key: &str) -> Option<String> {
        let value = match key {
            "app_data" => self.app_data.display().to_string(),
            "all_app_data" => self.all_app_data.display().to_string(),
            "shared" => self.shared.display().to_string(),
            "installation_dir" => self.installation_dir.display().to_string(),
            "portal.id" => self.portal_id.clone(),
            "portal.short_id" => self.portal_short_id.clone(),
            "portal.domain" => self.portal_domain.clone(),
            _ => return None,
        };
        Some(value)
    }
}

/// Substitute every placeholder in `template`.
///
/// # Errors
///
/// Returns `ControlError::Template` if a placeholder names an unknown variable.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String> {
    if let Some(unknown) = PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .find(|key| vars.lookup(key).is_none())
    {
        return Err(ControlError::Template(format!("unknown variable {unknown}")));
    }

    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        vars.lookup(&caps[1]).unwrap_or_default()
    });
    Ok(rendered.into_owned())
}

/// Render the compose template in `installation_dir` into the compose file.
///
/// # Errors
///
/// Returns `ControlError::Template` if the template is missing or refers to an
/// unknown variable.
pub async fn render_compose_file(installation_dir: &Path, vars: &TemplateVars) -> Result<()> {
    let template_path = installation_dir.join(TEMPLATE_FILE);
    let template = tokio::fs::read_to_string(&template_path)
        .await
        .map_err(|e| ControlError::Template(format!("{}: {e}", template_path.display())))?;

    let rendered = render(&template, vars)?;
    tokio::fs::write(installation_dir.join(COMPOSE_FILE), rendered).await?;

    Ok(())
}
