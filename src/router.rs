use crate::config::LocationConfig;
use crate::http::{Request, Response};
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Serves everything that is not a CGI script.
pub fn handle(request: &Request, location: &LocationConfig) -> Response {
    if let Some(redirect) = &location.redirect {
        let mut res = Response::new(StatusCode::MOVED_PERMANENTLY);
        match HeaderValue::from_str(redirect) {
            Ok(value) => {
                res.headers.insert(header::LOCATION, value);
            }
            Err(_) => return Response::new(StatusCode::INTERNAL_SERVER_ERROR),
        }
        return res;
    }

    if !location.allows(&request.method) {
        return method_not_allowed(location);
    }

    let Some(path) = local_path(&location.root, &request.path) else {
        return Response::new(StatusCode::FORBIDDEN);
    };

    match request.method {
        Method::GET | Method::HEAD => handle_get(&path, &request.path, location),
        Method::POST => handle_upload(request, location),
        Method::DELETE => handle_delete(&path),
        _ => method_not_allowed(location),
    }
}

fn method_not_allowed(location: &LocationConfig) -> Response {
    let mut res = Response::new(StatusCode::METHOD_NOT_ALLOWED);
    let allow = location
        .methods
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if let Ok(value) = HeaderValue::from_str(&allow) {
        res.headers.insert(header::ALLOW, value);
    }
    res
}

/// Maps a decoded request path under `root`. Any `..` segment is refused.
fn local_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = request_path.trim_start_matches('/');
    if relative.split('/').any(|segment| segment == "..") {
        return None;
    }
    Some(root.join(relative))
}

fn handle_get(path: &Path, request_path: &str, location: &LocationConfig) -> Response {
    let mut path = path.to_path_buf();
    if path.is_dir() {
        let index = location
            .index
            .as_ref()
            .map(|index| path.join(index))
            .filter(|candidate| candidate.is_file());
        match index {
            Some(index) => path = index,
            None if location.autoindex => return list_directory(&path, request_path),
            None => return Response::new(StatusCode::FORBIDDEN),
        }
    }

    match fs::read(&path) {
        Ok(content) => {
            let mut res = Response::new(StatusCode::OK);
            res.set_body(content, mime_type(&path));
            res
        }
        Err(e) => Response::new(io_status(&e)),
    }
}

fn mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn io_status(e: &io::Error) -> StatusCode {
    match e.kind() {
        io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn handle_upload(request: &Request, location: &LocationConfig) -> Response {
    let Some(store) = &location.upload_store else {
        return method_not_allowed(location);
    };
    if let Err(e) = fs::create_dir_all(store) {
        warn!("cannot create upload store {}: {}", store.display(), e);
        return Response::new(io_status(&e));
    }

    let name = request
        .path
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(str::to_string)
        .unwrap_or_else(|| {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            format!("upload-{secs}")
        });
    let path = unique_path(store, &name);

    match fs::write(&path, &request.body) {
        Ok(()) => {
            debug!("stored {} bytes at {}", request.body.len(), path.display());
            let mut res = Response::new(StatusCode::CREATED);
            let stored = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let base = request.path.rsplit_once('/').map_or("", |(dir, _)| dir);
            if let Ok(value) = HeaderValue::from_str(&format!("{base}/{stored}")) {
                res.headers.insert(header::LOCATION, value);
            }
            res.set_body(b"File uploaded successfully\n".to_vec(), "text/plain");
            res
        }
        Err(e) => {
            warn!("upload to {} failed: {}", path.display(), e);
            Response::new(io_status(&e))
        }
    }
}

fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (name, String::new()),
    };
    (1..)
        .map(|n| dir.join(format!("{stem}-{n}{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

fn handle_delete(path: &Path) -> Response {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Response::new(StatusCode::FORBIDDEN),
        Ok(_) => match fs::remove_file(path) {
            Ok(()) => Response::new(StatusCode::NO_CONTENT),
            Err(e) => Response::new(io_status(&e)),
        },
        Err(e) => Response::new(io_status(&e)),
    }
}

fn list_directory(path: &Path, request_path: &str) -> Response {
    let base = request_path.trim_end_matches('/');
    let mut names: Vec<String> = match fs::read_dir(path) {
        Ok(entries) => entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                Some(if is_dir { format!("{name}/") } else { name })
            })
            .collect(),
        Err(e) => return Response::new(io_status(&e)),
    };
    names.sort();

    let mut html = format!("<html><head><title>Index of {base}/</title></head><body><h1>Index of {base}/</h1><ul>");
    for name in names {
        html.push_str(&format!("<li><a href=\"{base}/{name}\">{name}</a></li>"));
    }
    html.push_str("</ul></body></html>");

    let mut res = Response::new(StatusCode::OK);
    res.set_body(html.into_bytes(), "text/html");
    res
}
