//! Reverse-proxy config compiler.
//!
//! Compiles the installed apps and their metadata into a dynamic routing
//! document for the reverse proxy, and writes it where the proxy watches for
//! changes.
//!
//! The document always carries a fixed scaffold for the orchestrator's own
//! API. Each HTTPS entrypoint of each app adds an HTTP router and service
//! keyed `{app}_https_443`; each MQTT entrypoint adds a TCP router and service
//! keyed `{app}_mqtt_1883`. The `tcp` section is left out entirely when no app
//! has a TCP entrypoint, since the proxy rejects empty sections.
//!
//! All maps are ordered, so compiling the same inputs always yields
//! byte-identical YAML and the proxy does not reload needlessly.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use harbor_core::{AppName, HostIdentity};
use harbor_store::Store;
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};
use crate::lifecycle;
use crate::metadata::{AppMeta, AppMetaLoader, EntrypointKind};

/// Router serving the orchestrator's unauthenticated endpoints.
pub const ROUTER_PUBLIC: &str = "orchestrator_public";
/// Router serving the orchestrator's authenticated endpoints.
pub const ROUTER_PROTECTED: &str = "orchestrator_protected";
/// Lowest priority router catching every unmatched host.
pub const ROUTER_CATCH_ALL: &str = "catch_all";
/// Service pointing at the orchestrator.
pub const SERVICE_ORCHESTRATOR: &str = "orchestrator";
/// Forward-auth middleware.
pub const MIDDLEWARE_AUTH: &str = "auth";
/// Middleware removing the core prefix before forwarding to the orchestrator.
pub const MIDDLEWARE_STRIP_CORE: &str = "strip_core_prefix";

/// Settings for the scaffold routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// URL of the orchestrator API.
    pub core_upstream: String,
    /// Path prefix of the orchestrator API on the host domain.
    pub core_prefix: String,
    /// Forward-auth endpoint.
    pub auth_address: String,
    /// Certificate resolver name.
    pub cert_resolver: String,
    /// Proxy entrypoint for HTTPS traffic.
    pub https_entrypoint: String,
    /// Proxy entrypoint for MQTT traffic.
    pub mqtt_entrypoint: String,
}

impl ProxySettings {
    /// Settings for an orchestrator reachable at `core_upstream`.
    #[must_use]
    pub fn new(core_upstream: &str) -> Self {
        let core_upstream = core_upstream.trim_end_matches('/').to_string();
        Self {
            auth_address: format!("{core_upstream}/auth/verify"),
            core_upstream,
            core_prefix: "/core".to_string(),
            cert_resolver: "letsencrypt".to_string(),
            https_entrypoint: "websecure".to_string(),
            mqtt_entrypoint: "mqtt".to_string(),
        }
    }
}

/// The dynamic config document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicConfig {
    /// HTTP routing.
    pub http: HttpSection,
    /// TCP routing, absent when no app exposes a TCP entrypoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpSection>,
}

/// HTTP routers, services and middlewares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSection {
    /// Routers by name.
    pub routers: BTreeMap<String, HttpRouter>,
    /// Services by name.
    pub services: BTreeMap<String, HttpService>,
    /// Middlewares by name.
    pub middlewares: BTreeMap<String, Middleware>,
}

/// TCP routers and services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpSection {
    /// Routers by name.
    pub routers: BTreeMap<String, TcpRouter>,
    /// Services by name.
    pub services: BTreeMap<String, TcpService>,
}

/// An HTTP router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouter {
    /// Proxy entrypoints the router listens on.
    pub entry_points: Vec<String>,
    /// Matching rule.
    pub rule: String,
    /// Target service.
    pub service: String,
    /// Middlewares applied in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,
    /// Explicit priority; rule length is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    /// TLS settings.
    pub tls: RouterTls,
}

/// A TCP router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpRouter {
    /// Proxy entrypoints the router listens on.
    pub entry_points: Vec<String>,
    /// Matching rule.
    pub rule: String,
    /// Target service.
    pub service: String,
    /// TLS settings; SNI matching needs TLS.
    pub tls: RouterTls,
}

/// Router TLS settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterTls {
    /// Certificate resolver.
    pub cert_resolver: String,
    /// Domains the certificate covers.
    pub domains: Vec<TlsDomain>,
}

/// A certificate domain with its alternative names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsDomain {
    /// Main domain.
    pub main: String,
    /// Subject alternative names.
    pub sans: Vec<String>,
}

/// An HTTP service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpService {
    /// Backends.
    pub load_balancer: HttpLoadBalancer,
}

/// HTTP backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpLoadBalancer {
    /// Backend servers.
    pub servers: Vec<HttpServer>,
}

/// An HTTP backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpServer {
    /// Backend URL.
    pub url: String,
}

/// A TCP service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpService {
    /// Backends.
    pub load_balancer: TcpLoadBalancer,
}

/// TCP backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpLoadBalancer {
    /// Backend servers.
    pub servers: Vec<TcpServer>,
}

/// A TCP backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpServer {
    /// `host:port` address.
    pub address: String,
}

/// An HTTP middleware. Exactly one field is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Middleware {
    /// Delegate authentication to an external endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_auth: Option<ForwardAuth>,
    /// Remove path prefixes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_prefix: Option<StripPrefix>,
}

/// Forward-auth middleware settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardAuth {
    /// Authentication endpoint.
    pub address: String,
    /// Trust `X-Forwarded-*` headers from clients.
    pub trust_forward_header: bool,
}

/// Strip-prefix middleware settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripPrefix {
    /// Prefixes to remove.
    pub prefixes: Vec<String>,
}

/// An app together with its metadata, as compiled into routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedApp {
    /// App name, used as the subdomain.
    pub name: AppName,
    /// Metadata declaring the app's entrypoints.
    pub meta: AppMeta,
}

impl DynamicConfig {
    /// Render as YAML.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Internal` if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ControlError::Internal(e.to_string()))
    }
}

/// Compile the routing document for `apps` on the given host.
#[must_use]
pub fn compile(
    apps: &[RoutedApp],
    identity: &HostIdentity,
    settings: &ProxySettings,
) -> DynamicConfig {
    let domain = identity.domain();
    let tls = RouterTls {
        cert_resolver: settings.cert_resolver.clone(),
        domains: vec![TlsDomain {
            main: domain.to_string(),
            sans: vec![format!("*.{domain}")],
        }],
    };

    let mut http = scaffold(domain, settings, &tls);
    let mut tcp = TcpSection::default();

    for app in apps {
        let host = identity.app_domain(app.name.as_str());

        for entrypoint in &app.meta.entrypoints {
            let key = format!("{}_{}", app.name, entrypoint.entrypoint_port);

            match entrypoint.entrypoint_port {
                EntrypointKind::Https443 => {
                    http.routers.insert(
                        key.clone(),
                        HttpRouter {
                            entry_points: vec![settings.https_entrypoint.clone()],
                            rule: format!("Host(`{host}`)"),
                            service: key.clone(),
                            middlewares: vec![MIDDLEWARE_AUTH.to_string()],
                            priority: None,
                            tls: tls.clone(),
                        },
                    );
                    http.services.insert(
                        key,
                        http_service(format!(
                            "http://{}:{}",
                            entrypoint.container_name, entrypoint.container_port
                        )),
                    );
                }
                EntrypointKind::Mqtt1883 => {
                    tcp.routers.insert(
                        key.clone(),
                        TcpRouter {
                            entry_points: vec![settings.mqtt_entrypoint.clone()],
                            rule: format!("HostSNI(`{host}`)"),
                            service: key.clone(),
                            tls: tls.clone(),
                        },
                    );
                    tcp.services.insert(
                        key,
                        TcpService {
                            load_balancer: TcpLoadBalancer {
                                servers: vec![TcpServer {
                                    address: format!(
                                        "{}:{}",
                                        entrypoint.container_name, entrypoint.container_port
                                    ),
                                }],
                            },
                        },
                    );
                }
            }
        }
    }

    DynamicConfig {
        http,
        tcp: (!tcp.routers.is_empty()).then_some(tcp),
    }
}

fn scaffold(domain: &str, settings: &ProxySettings, tls: &RouterTls) -> HttpSection {
    let router = |rule: String, middlewares: &[&str], priority: u32| HttpRouter {
        entry_points: vec![settings.https_entrypoint.clone()],
        rule,
        service: SERVICE_ORCHESTRATOR.to_string(),
        middlewares: middlewares.iter().map(ToString::to_string).collect(),
        priority: Some(priority),
        tls: tls.clone(),
    };
    let prefix = &settings.core_prefix;

    let mut section = HttpSection::default();
    section.routers.insert(
        ROUTER_PUBLIC.to_string(),
        router(
            format!("Host(`{domain}`) && PathPrefix(`{prefix}/public`)"),
            &[MIDDLEWARE_STRIP_CORE],
            200,
        ),
    );
    section.routers.insert(
        ROUTER_PROTECTED.to_string(),
        router(
            format!("Host(`{domain}`) && PathPrefix(`{prefix}`)"),
            &[MIDDLEWARE_AUTH, MIDDLEWARE_STRIP_CORE],
            100,
        ),
    );
    section.routers.insert(
        ROUTER_CATCH_ALL.to_string(),
        router("HostRegexp(`.+`)".to_string(), &[], 1),
    );

    section.services.insert(
        SERVICE_ORCHESTRATOR.to_string(),
        http_service(settings.core_upstream.clone()),
    );

    section.middlewares.insert(
        MIDDLEWARE_AUTH.to_string(),
        Middleware {
            forward_auth: Some(ForwardAuth {
                address: settings.auth_address.clone(),
                trust_forward_header: true,
            }),
            ..Middleware::default()
        },
    );
    section.middlewares.insert(
        MIDDLEWARE_STRIP_CORE.to_string(),
        Middleware {
            strip_prefix: Some(StripPrefix {
                prefixes: vec![prefix.clone()],
            }),
            ..Middleware::default()
        },
    );

    section
}

fn http_service(url: String) -> HttpService {
    HttpService {
        load_balancer: HttpLoadBalancer {
            servers: vec![HttpServer { url }],
        },
    }
}

/// Writes the compiled document where the reverse proxy reads it.
#[derive(Debug, Clone)]
pub struct ProxyConfigWriter {
    path: PathBuf,
    settings: ProxySettings,
}

impl ProxyConfigWriter {
    /// Create a writer for the given file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, settings: ProxySettings) -> Self {
        Self {
            path: path.into(),
            settings,
        }
    }

    /// Path of the config file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `config` atomically.
    ///
    /// Returns false without touching the file when it already holds the same
    /// content.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Io` if the file cannot be written.
    pub fn write(&self, config: &DynamicConfig) -> Result<bool> {
        let yaml = config.to_yaml()?;

        match std::fs::read_to_string(&self.path) {
            Ok(existing) if existing == yaml => {
                tracing::debug!(path = %self.path.display(), "Proxy config unchanged");
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(yaml.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| ControlError::Io(e.error))?;

        tracing::info!(path = %self.path.display(), "Wrote proxy config");

        Ok(true)
    }

    /// Recompile from the current app records and write the result.
    ///
    /// Apps still queued for installation or in `Error` are left out, as are
    /// apps whose metadata cannot be loaded. An app mid-install has no
    /// metadata yet, so a missing file is only logged at debug level.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the file cannot be
    /// written.
    pub fn refresh(
        &self,
        store: &dyn Store,
        loader: &AppMetaLoader,
        identity: &HostIdentity,
    ) -> Result<bool> {
        let mut apps = Vec::new();

        for record in store.list_apps()? {
            if !lifecycle::is_routable(record.status) {
                continue;
            }
            match loader.load(&record.name) {
                Ok(meta) => apps.push(RoutedApp {
                    name: record.name,
                    meta,
                }),
                Err(e) if e.is_not_found() => {
                    tracing::debug!(app = %record.name, "No metadata yet, not routing app");
                }
                Err(e) => {
                    tracing::warn!(
                        app = %record.name,
                        error = %e,
                        "Leaving app out of proxy config"
                    );
                }
            }
        }

        let config = compile(&apps, identity, &self.settings);
        self.write(&config)
    }
}
