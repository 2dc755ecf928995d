//! Default Traefik configuration files.
//!
//! All writers are idempotent: an existing file is operator-owned and is
//! never overwritten.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::{NETWORK_NAME, PlatformPaths};

pub const STATIC_CONFIG_FILE: &str = "traefik.yml";
pub const MIDDLEWARES_FILE: &str = "middlewares.yml";
pub const SERVER_CONFIG_FILE: &str = "shipyard.yml";

/// Path where the dynamic directory is mounted inside the Traefik container.
const CONTAINER_DYNAMIC_DIR: &str = "/etc/shipyard/traefik/dynamic";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StaticConfig {
    global: Global,
    providers: Providers,
    api: Api,
    entry_points: BTreeMap<String, EntryPoint>,
    certificates_resolvers: BTreeMap<String, CertificateResolver>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Global {
    send_anonymous_usage: bool,
}

#[derive(Debug, Serialize)]
struct Providers {
    docker: DockerProvider,
    file: FileProvider,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DockerProvider {
    exposed_by_default: bool,
    network: String,
}

#[derive(Debug, Serialize)]
struct FileProvider {
    directory: String,
    watch: bool,
}

#[derive(Debug, Serialize)]
struct Api {
    insecure: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryPoint {
    address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    http: Option<EntryPointHttp>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryPointHttp {
    tls: EntryPointTls,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryPointTls {
    cert_resolver: String,
}

#[derive(Debug, Serialize)]
struct CertificateResolver {
    acme: Acme,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Acme {
    email: String,
    storage: String,
    http_challenge: HttpChallenge,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpChallenge {
    entry_point: String,
}

/// `http:` section of a dynamic configuration file.
#[derive(Debug, Default, Serialize)]
struct DynamicConfig {
    http: DynamicHttp,
}

#[derive(Debug, Default, Serialize)]
struct DynamicHttp {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    routers: BTreeMap<String, HttpRouter>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    services: BTreeMap<String, HttpService>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    middlewares: BTreeMap<String, Middleware>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpRouter {
    rule: String,
    service: String,
    entry_points: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    middlewares: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpService {
    load_balancer: LoadBalancer,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadBalancer {
    servers: Vec<Server>,
    pass_host_header: bool,
}

#[derive(Debug, Serialize)]
struct Server {
    url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Middleware {
    redirect_scheme: RedirectScheme,
}

#[derive(Debug, Serialize)]
struct RedirectScheme {
    scheme: String,
    permanent: bool,
}

pub fn static_config_yaml() -> Result<String> {
    let mut entry_points = BTreeMap::new();
    entry_points.insert(
        "web".to_string(),
        EntryPoint {
            address: ":80".to_string(),
            http: None,
        },
    );
    entry_points.insert(
        "websecure".to_string(),
        EntryPoint {
            address: ":443".to_string(),
            http: Some(EntryPointHttp {
                tls: EntryPointTls {
                    cert_resolver: "letsencrypt".to_string(),
                },
            }),
        },
    );

    let mut certificates_resolvers = BTreeMap::new();
    certificates_resolvers.insert(
        "letsencrypt".to_string(),
        CertificateResolver {
            acme: Acme {
                email: "test@localhost.com".to_string(),
                storage: "/etc/shipyard/traefik/dynamic/acme.json".to_string(),
                http_challenge: HttpChallenge {
                    entry_point: "web".to_string(),
                },
            },
        },
    );

    let config = StaticConfig {
        global: Global {
            send_anonymous_usage: false,
        },
        providers: Providers {
            docker: DockerProvider {
                exposed_by_default: false,
                network: NETWORK_NAME.to_string(),
            },
            file: FileProvider {
                directory: CONTAINER_DYNAMIC_DIR.to_string(),
                watch: true,
            },
        },
        api: Api { insecure: true },
        entry_points,
        certificates_resolvers,
    };
    serde_yaml::to_string(&config).context("Failed to serialize Traefik static config")
}

pub fn middlewares_yaml() -> Result<String> {
    let mut config = DynamicConfig::default();
    config.http.middlewares.insert(
        "redirect-to-https".to_string(),
        Middleware {
            redirect_scheme: RedirectScheme {
                scheme: "https".to_string(),
                permanent: true,
            },
        },
    );
    serde_yaml::to_string(&config).context("Failed to serialize Traefik middlewares")
}

/// Routes the platform's own hostname to this server on `port`.
pub fn server_config_yaml(port: u16) -> Result<String> {
    let mut config = DynamicConfig::default();
    config.http.routers.insert(
        "shipyard-router-app".to_string(),
        HttpRouter {
            rule: "Host(`shipyard.docker.localhost`) && PathPrefix(`/`)".to_string(),
            service: "shipyard-service-app".to_string(),
            entry_points: vec!["web".to_string()],
            middlewares: Vec::new(),
        },
    );
    config.http.services.insert(
        "shipyard-service-app".to_string(),
        HttpService {
            load_balancer: LoadBalancer {
                servers: vec![Server {
                    url: format!("http://shipyard:{}", port),
                }],
                pass_host_header: true,
            },
        },
    );
    serde_yaml::to_string(&config).context("Failed to serialize Traefik server config")
}

/// Write `contents` to `path` unless a file is already there. Returns
/// whether the file was written.
pub fn write_if_absent(path: &Path, contents: &str) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

pub fn create_default_traefik_config(paths: &PlatformPaths) -> Result<bool> {
    write_if_absent(
        &paths.traefik_dir().join(STATIC_CONFIG_FILE),
        &static_config_yaml()?,
    )
}

pub fn create_default_middlewares(paths: &PlatformPaths) -> Result<bool> {
    write_if_absent(&paths.dynamic_dir().join(MIDDLEWARES_FILE), &middlewares_yaml()?)
}

pub fn create_default_server_traefik_config(paths: &PlatformPaths, port: u16) -> Result<bool> {
    write_if_absent(
        &paths.dynamic_dir().join(SERVER_CONFIG_FILE),
        &server_config_yaml(port)?,
    )
}
