//! CGI/1.1 meta-variables (RFC 3875, section 4.1).

use crate::config::LocationConfig;
use crate::cycle::ClientInfo;
use crate::http::{Request, SERVER_SOFTWARE};
use http::header;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const GATEWAY_INTERFACE: &str = "CGI/1.1";

/// Where a request path splits into the script and the extra path after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTarget {
    pub script_name: String,
    pub path_info: String,
    pub script_path: PathBuf,
}

impl ScriptTarget {
    /// Returns `None` when no segment of `path` names a CGI script for this
    /// location.
    pub fn locate(path: &str, location: &LocationConfig) -> Option<Self> {
        if !location.cgi_enabled() {
            return None;
        }
        let (script_name, path_info) = split_script_path(path, &location.cgi_extensions)?;
        if script_name.split('/').any(|segment| segment == "..") {
            return None;
        }
        Some(ScriptTarget {
            script_name: script_name.to_string(),
            path_info: path_info.to_string(),
            script_path: location.root.join(script_name.trim_start_matches('/')),
        })
    }
}

/// Splits after the longest run of whole segments whose last segment itself
/// ends in a registered extension. `/a.py.d/x` does not match `.py`.
pub fn split_script_path<'a>(path: &'a str, extensions: &[String]) -> Option<(&'a str, &'a str)> {
    let mut best = None;
    let mut segment_start = 0;
    let ends = path
        .char_indices()
        .filter(|&(_, c)| c == '/')
        .map(|(i, _)| i)
        .chain(std::iter::once(path.len()));

    for end in ends {
        let segment = &path[segment_start..end];
        if extensions
            .iter()
            .any(|ext| segment.len() > ext.len() && segment.ends_with(ext.as_str()))
        {
            best = Some(end);
        }
        segment_start = end + 1;
    }
    best.map(|end| path.split_at(end))
}

/// The ordered variable set handed to a CGI child. Building it has no side
/// effects, so identical inputs always yield identical environments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgiEnvironment {
    vars: BTreeMap<String, String>,
}

impl CgiEnvironment {
    pub fn build(
        request: &Request,
        target: &ScriptTarget,
        client: &ClientInfo,
        location: &LocationConfig,
    ) -> Self {
        let mut env = CgiEnvironment::default();

        env.set("GATEWAY_INTERFACE", GATEWAY_INTERFACE);
        env.set("SERVER_SOFTWARE", SERVER_SOFTWARE);
        env.set("SERVER_PROTOCOL", &request.version);
        let server_name = request
            .host()
            .map(|h| h.rsplit_once(':').map_or(h, |(name, _)| name).to_string())
            .unwrap_or_else(|| client.local.ip().to_string());
        env.set("SERVER_NAME", &server_name);
        env.set("SERVER_PORT", &client.local.port().to_string());
        env.set("REMOTE_ADDR", &client.remote.ip().to_string());
        env.set("REMOTE_PORT", &client.remote.port().to_string());

        env.set("REQUEST_METHOD", request.method.as_str());
        env.set("QUERY_STRING", &request.query);
        env.set("SCRIPT_NAME", &target.script_name);
        env.set("SCRIPT_FILENAME", &target.script_path.to_string_lossy());
        env.set("PATH_INFO", &target.path_info);
        if !target.path_info.is_empty() {
            let translated = location.root.join(target.path_info.trim_start_matches('/'));
            env.set("PATH_TRANSLATED", &translated.to_string_lossy());
        }

        if !request.body.is_empty() {
            env.set("CONTENT_LENGTH", &request.body.len().to_string());
            if let Some(content_type) = request.header(header::CONTENT_TYPE) {
                env.set("CONTENT_TYPE", content_type);
            }
        }

        for name in request.headers.keys() {
            if name == header::CONTENT_TYPE
                || name == header::CONTENT_LENGTH
                || name == header::AUTHORIZATION
            {
                continue;
            }
            let values: Vec<String> = request
                .headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .filter(|v| !v.is_empty())
                .collect();
            if values.is_empty() {
                continue;
            }
            let var = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
            env.set(&var, &values.join(", "));
        }

        env
    }

    fn set(&mut self, name: &str, value: &str) {
        self.vars.insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `NAME=VALUE` strings, sorted by name.
    pub fn to_strings(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}
