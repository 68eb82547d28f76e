use http::StatusCode;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] io::Error),
    #[error("invalid config syntax: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything that can go wrong while running a CGI program. None of these
/// leave the gateway; they are turned into a response status instead.
#[derive(Debug, Error)]
pub enum CgiError {
    #[error("cgi target is not an executable regular file: {}", .0.display())]
    Path(PathBuf),
    #[error("cannot fork cgi process: {0}")]
    Spawn(#[source] io::Error),
    #[error("cannot exec cgi program: {0}")]
    Exec(String),
    #[error("cgi pipe i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("cgi process exceeded its {0:?} budget")]
    Timeout(Duration),
    #[error("malformed cgi response")]
    MalformedResponse,
    #[error("local redirect limit of {0} reached")]
    RedirectLimit(usize),
}

impl CgiError {
    pub fn status(&self) -> StatusCode {
        match self {
            CgiError::Path(_) => StatusCode::FORBIDDEN,
            CgiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CgiError::Spawn(_)
            | CgiError::Exec(_)
            | CgiError::Io(_)
            | CgiError::MalformedResponse
            | CgiError::RedirectLimit(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Built-in diagnostic page, used whenever no configured error page applies.
pub fn default_error_body(status: StatusCode) -> Vec<u8> {
    let title = format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    );
    format!(
        "<html>\n<head><title>{title}</title></head>\n<body>\n<center><h1>{title}</h1></center>\n<hr><center>{}</center>\n</body>\n</html>\n",
        crate::http::SERVER_SOFTWARE
    )
    .into_bytes()
}

pub const REDIRECT_LIMIT_BODY: &[u8] =
    b"<html>\n<head><title>500 Internal Server Error</title></head>\n<body>\n<center><h1>500 Internal Server Error</h1></center>\n<p>Too many local redirects from CGI.</p>\n</body>\n</html>\n";
