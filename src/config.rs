use crate::error::ConfigError;
use http::{Method, StatusCode};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CLIENT_MAX_BODY_SIZE: usize = 1024 * 1024;
pub const DEFAULT_CGI_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Clone)]
struct RawConfig {
    servers: Vec<ServerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub ports: Vec<u16>,
    pub server_names: Option<Vec<String>>,
    pub root: Option<String>,
    pub error_pages: Option<HashMap<u16, String>>,
    pub client_max_body_size: Option<usize>,
    pub cgi_timeout: Option<u64>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    pub path: String,
    pub root: Option<String>,
    pub index: Option<String>,
    pub methods: Option<Vec<String>>,
    pub autoindex: Option<bool>,
    pub redirect: Option<String>,
    pub upload_store: Option<String>,
    pub error_pages: Option<HashMap<u16, String>>,
    pub client_max_body_size: Option<usize>,
    pub cgi_extensions: Option<Vec<String>>,
    pub cgi_path: Option<String>,
    pub cgi_timeout: Option<u64>,
}

/// A route with every inherited server setting already applied. Cycles own a
/// copy of this for the lifetime of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationConfig {
    pub path: String,
    pub root: PathBuf,
    pub index: Option<String>,
    pub methods: Vec<Method>,
    pub autoindex: bool,
    pub redirect: Option<String>,
    pub upload_store: Option<PathBuf>,
    pub client_max_body_size: usize,
    pub error_pages: HashMap<u16, String>,
    pub cgi_extensions: Vec<String>,
    pub cgi_path: Option<PathBuf>,
    pub cgi_timeout: Duration,
}

impl LocationConfig {
    pub fn allows(&self, method: &Method) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    pub fn error_page(&self, status: StatusCode) -> Option<&str> {
        self.error_pages.get(&status.as_u16()).map(String::as_str)
    }

    pub fn cgi_enabled(&self) -> bool {
        !self.cgi_extensions.is_empty()
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        LocationConfig {
            path: "/".to_string(),
            root: PathBuf::from("."),
            index: None,
            methods: default_methods(),
            autoindex: false,
            redirect: None,
            upload_store: None,
            client_max_body_size: DEFAULT_CLIENT_MAX_BODY_SIZE,
            error_pages: HashMap::new(),
            cgi_extensions: Vec::new(),
            cgi_path: None,
            cgi_timeout: Duration::from_secs(DEFAULT_CGI_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VirtualServer {
    pub host: IpAddr,
    pub ports: Vec<u16>,
    pub server_names: Vec<String>,
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub servers: Vec<VirtualServer>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(content)?;
        if raw.servers.is_empty() {
            return Err(ConfigError::Invalid("no servers defined".to_string()));
        }
        let servers = raw
            .servers
            .iter()
            .map(flatten_server)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Config { servers })
    }

    /// Every distinct address some server listens on.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        let mut seen = HashSet::new();
        let mut addrs = Vec::new();
        for server in &self.servers {
            for port in &server.ports {
                let addr = SocketAddr::new(server.host, *port);
                if seen.insert(addr) {
                    addrs.push(addr);
                }
            }
        }
        addrs
    }

    /// Picks the virtual server for the accepting address and `Host`, then the
    /// longest route matching `path` on a segment boundary.
    pub fn resolve(
        &self,
        local: SocketAddr,
        host: Option<&str>,
        path: &str,
    ) -> Result<LocationConfig, StatusCode> {
        let candidates: Vec<&VirtualServer> = self
            .servers
            .iter()
            .filter(|s| {
                s.ports.contains(&local.port())
                    && (s.host.is_unspecified() || s.host == local.ip())
            })
            .collect();
        let Some(first) = candidates.first() else {
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        };

        let name = host.map(|h| strip_port(h).to_ascii_lowercase());
        let server = name
            .as_deref()
            .and_then(|n| {
                candidates
                    .iter()
                    .find(|s| s.server_names.iter().any(|sn| sn.eq_ignore_ascii_case(n)))
            })
            .unwrap_or(first);

        server
            .locations
            .iter()
            .filter(|l| route_matches(&l.path, path))
            .max_by_key(|l| l.path.len())
            .cloned()
            .ok_or(StatusCode::NOT_FOUND)
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [v6]:port
        return host.split(']').next().map(|h| &h[1..]).unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}

fn route_matches(route: &str, path: &str) -> bool {
    if !path.starts_with(route) {
        return false;
    }
    route.ends_with('/') || path.len() == route.len() || path.as_bytes()[route.len()] == b'/'
}

fn default_methods() -> Vec<Method> {
    vec![Method::GET, Method::HEAD, Method::POST, Method::DELETE]
}

fn parse_host(host: &str) -> Result<IpAddr, ConfigError> {
    if host == "localhost" {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    host.parse()
        .map_err(|_| ConfigError::Invalid(format!("bad host address {host:?}")))
}

fn validate_error_pages(pages: &HashMap<u16, String>) -> Result<(), ConfigError> {
    for (code, uri) in pages {
        if !(400..=599).contains(code) {
            return Err(ConfigError::Invalid(format!("error page for bad status {code}")));
        }
        if !uri.starts_with('/') {
            return Err(ConfigError::Invalid(format!("error page {uri:?} must be a URI path")));
        }
    }
    Ok(())
}

fn flatten_server(server: &ServerConfig) -> Result<VirtualServer, ConfigError> {
    if server.ports.is_empty() {
        return Err(ConfigError::Invalid(format!("server {} has no ports", server.host)));
    }
    let host = parse_host(&server.host)?;
    let server_pages = server.error_pages.clone().unwrap_or_default();
    validate_error_pages(&server_pages)?;

    let mut locations = Vec::with_capacity(server.routes.len());
    for route in &server.routes {
        if !route.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!("route {:?} must start with '/'", route.path)));
        }

        let methods = match &route.methods {
            Some(names) => names
                .iter()
                .map(|m| {
                    Method::from_bytes(m.as_bytes())
                        .map_err(|_| ConfigError::Invalid(format!("bad method {m:?}")))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => default_methods(),
        };

        let cgi_extensions = route.cgi_extensions.clone().unwrap_or_default();
        if let Some(ext) = cgi_extensions.iter().find(|e| !e.starts_with('.') || e.len() < 2) {
            return Err(ConfigError::Invalid(format!("bad cgi extension {ext:?}")));
        }

        let mut error_pages = server_pages.clone();
        if let Some(pages) = &route.error_pages {
            validate_error_pages(pages)?;
            error_pages.extend(pages.iter().map(|(k, v)| (*k, v.clone())));
        }

        let root = route
            .root
            .as_deref()
            .or(server.root.as_deref())
            .unwrap_or(".");

        locations.push(LocationConfig {
            path: route.path.clone(),
            root: PathBuf::from(root),
            index: route.index.clone(),
            methods,
            autoindex: route.autoindex.unwrap_or(false),
            redirect: route.redirect.clone(),
            upload_store: route.upload_store.as_ref().map(PathBuf::from),
            client_max_body_size: route
                .client_max_body_size
                .or(server.client_max_body_size)
                .unwrap_or(DEFAULT_CLIENT_MAX_BODY_SIZE),
            error_pages,
            cgi_extensions,
            cgi_path: route.cgi_path.as_ref().map(PathBuf::from),
            cgi_timeout: Duration::from_secs(
                route
                    .cgi_timeout
                    .or(server.cgi_timeout)
                    .unwrap_or(DEFAULT_CGI_TIMEOUT_SECS),
            ),
        });
    }

    Ok(VirtualServer {
        host,
        ports: server.ports.clone(),
        server_names: server.server_names.clone().unwrap_or_default(),
        locations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
servers:
  - host: 127.0.0.1
    ports: [8080]
    server_names: [example.com]
    root: /srv/www
    client_max_body_size: 2048
    error_pages: { 404: /errors/404.html }
    routes:
      - path: /
        index: index.html
      - path: /cgi-bin
        methods: [GET, POST]
        cgi_extensions: [.py, .sh]
        cgi_path: /usr/bin/python3
        cgi_timeout: 5
        error_pages: { 500: /errors/500.html }
  - host: 127.0.0.1
    ports: [8080, 8081]
    server_names: [other.org]
    routes:
      - path: /
        root: /srv/other
"#;

    fn local(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn routes_inherit_server_settings() {
        let config = Config::from_yaml(YAML).unwrap();
        let cgi = &config.servers[0].locations[1];
        assert_eq!(cgi.root, PathBuf::from("/srv/www"));
        assert_eq!(cgi.client_max_body_size, 2048);
        assert_eq!(cgi.cgi_timeout, Duration::from_secs(5));
        assert_eq!(cgi.methods, vec![Method::GET, Method::POST]);
        assert_eq!(cgi.error_page(StatusCode::NOT_FOUND), Some("/errors/404.html"));
        assert_eq!(cgi.error_page(StatusCode::INTERNAL_SERVER_ERROR), Some("/errors/500.html"));

        let root = &config.servers[0].locations[0];
        assert_eq!(root.methods, default_methods());
        assert_eq!(root.cgi_timeout, Duration::from_secs(DEFAULT_CGI_TIMEOUT_SECS));
        assert!(!root.cgi_enabled());
    }

    #[test]
    fn listen_addrs_are_deduplicated() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.listen_addrs(), vec![local(8080), local(8081)]);
    }

    #[test]
    fn resolve_uses_longest_segment_match() {
        let config = Config::from_yaml(YAML).unwrap();
        let loc = config.resolve(local(8080), Some("example.com"), "/cgi-bin/a.py").unwrap();
        assert_eq!(loc.path, "/cgi-bin");
        let loc = config.resolve(local(8080), Some("example.com"), "/cgi-binx").unwrap();
        assert_eq!(loc.path, "/");
    }

    #[test]
    fn resolve_selects_server_by_host() {
        let config = Config::from_yaml(YAML).unwrap();
        let loc = config.resolve(local(8080), Some("other.org:8080"), "/").unwrap();
        assert_eq!(loc.root, PathBuf::from("/srv/other"));
        let loc = config.resolve(local(8080), Some("unknown"), "/").unwrap();
        assert_eq!(loc.root, PathBuf::from("/srv/www"));
        let loc = config.resolve(local(8081), None, "/").unwrap();
        assert_eq!(loc.root, PathBuf::from("/srv/other"));
    }

    #[test]
    fn resolve_without_server_is_internal_error() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(
            config.resolve(local(9999), None, "/"),
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        );
    }

    #[test]
    fn rejects_bad_cgi_extension() {
        let yaml = "servers:\n  - host: 0.0.0.0\n    ports: [80]\n    routes:\n      - path: /\n        cgi_extensions: [py]\n";
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_relative_error_page() {
        let yaml = "servers:\n  - host: 0.0.0.0\n    ports: [80]\n    error_pages: { 404: errors/404.html }\n";
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Invalid(_))));
    }
}
