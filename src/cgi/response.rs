//! Parsing and classification of CGI program output (RFC 3875, section 6).

use crate::http::trim_ows;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use log::{debug, warn};

const MAX_FIELD_LINE: usize = 8 * 1024;

const REDIRECT_STATUSES: [StatusCode; 5] = [
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::SEE_OTHER,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiType {
    Document,
    LocalRedirect,
    ClientRedirect,
    ClientRedirectDocument,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct CgiResponse {
    /// `None` until the script sends `Status:` or a default is applied.
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub cgi_type: CgiType,
}

impl Default for CgiResponse {
    fn default() -> Self {
        CgiResponse {
            status: None,
            headers: HeaderMap::new(),
            body: Vec::new(),
            cgi_type: CgiType::Invalid,
        }
    }
}

impl CgiResponse {
    pub fn location(&self) -> Option<&str> {
        self.headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
    }

    fn declared_length(&self) -> Option<usize> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    fn content_type(&self) -> bool {
        self.headers.contains_key(header::CONTENT_TYPE)
    }

    fn classify(&self) -> CgiType {
        if self.status == Some(StatusCode::INTERNAL_SERVER_ERROR) {
            return CgiType::Invalid;
        }
        let Some(location) = self.location() else {
            return if self.content_type() {
                CgiType::Document
            } else {
                CgiType::Invalid
            };
        };

        let only_location = self.headers.len() == 1;
        if is_local_uri(location) {
            if only_location && self.body.is_empty() && self.status.is_none() {
                return CgiType::LocalRedirect;
            }
        } else if location.contains("://") {
            if only_location && self.status.is_none() {
                return CgiType::ClientRedirect;
            }
            let redirect_status = self
                .status
                .is_some_and(|s| REDIRECT_STATUSES.contains(&s));
            if self.content_type() && !self.body.is_empty() && redirect_status {
                return CgiType::ClientRedirectDocument;
            }
        }
        CgiType::Invalid
    }
}

/// Fields a CGI response may carry at most once.
fn single_valued(name: &HeaderName) -> bool {
    name == header::CONTENT_TYPE
        || name == header::CONTENT_LENGTH
        || name == header::TRANSFER_ENCODING
        || name == header::LOCATION
}

fn is_local_uri(location: &str) -> bool {
    location.starts_with('/') && !location.starts_with("//")
}

/// Incremental parser over a child's stdout. Feed it every chunk as it is
/// read, then call [`finish`](Self::finish) at EOF.
#[derive(Debug, Default)]
pub struct CgiResponseParser {
    buffer: Vec<u8>,
    response: CgiResponse,
    headers_done: bool,
    failed: bool,
}

impl CgiResponseParser {
    pub fn new() -> Self {
        CgiResponseParser::default()
    }

    pub fn headers_complete(&self) -> bool {
        self.headers_done
    }

    /// A malformed header section was seen; further input is ignored.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn feed(&mut self, data: &[u8]) {
        if self.failed {
            return;
        }
        if self.headers_done {
            self.response.body.extend_from_slice(data);
            return;
        }
        self.buffer.extend_from_slice(data);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > MAX_FIELD_LINE {
                self.fail("header line too long");
                return;
            }
            if line.is_empty() {
                self.headers_done = true;
                if let Err(reason) = self.validate_headers() {
                    self.fail(reason);
                    return;
                }
                self.response.body.append(&mut self.buffer);
                return;
            }
            if let Err(reason) = self.parse_field(&line) {
                self.fail(reason);
                return;
            }
        }
        if self.buffer.len() > MAX_FIELD_LINE {
            self.fail("header line too long");
        }
    }

    /// Ends the input and classifies what was received.
    pub fn finish(self) -> CgiResponse {
        let mut response = self.response;
        if self.failed || !self.headers_done {
            if !self.headers_done && !self.failed {
                debug!("cgi output ended before the header section did");
            }
            response.cgi_type = CgiType::Invalid;
            return response;
        }
        if response.headers.contains_key(header::TRANSFER_ENCODING) {
            match dechunk(&response.body) {
                Some(body) => response.body = body,
                None => {
                    debug!("cgi output has a broken chunked body");
                    response.cgi_type = CgiType::Invalid;
                    return response;
                }
            }
        }
        if let Some(declared) = response.declared_length() {
            if declared != response.body.len() {
                warn!(
                    "cgi declared Content-Length {declared} but sent {} bytes",
                    response.body.len()
                );
                response.cgi_type = CgiType::Invalid;
                return response;
            }
        }
        response.cgi_type = response.classify();
        response
    }

    fn fail(&mut self, reason: &str) {
        debug!("malformed cgi header section: {reason}");
        self.failed = true;
        self.response.status = Some(StatusCode::INTERNAL_SERVER_ERROR);
        self.buffer.clear();
    }

    fn parse_field(&mut self, line: &[u8]) -> Result<(), &'static str> {
        if line.iter().any(|&b| (b < 0x20 && b != b'\t') || b == 0x7f) {
            return Err("control character in header line");
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or("header line without colon")?;
        let name = HeaderName::from_bytes(&line[..colon]).map_err(|_| "invalid header name")?;
        let value = trim_ows(&line[colon + 1..]);
        if value.is_empty() {
            return Ok(());
        }

        if name.as_str() == "status" {
            if self.response.status.is_some() {
                return Err("duplicate Status field");
            }
            self.response.status = Some(parse_status(value).ok_or("invalid Status field")?);
            return Ok(());
        }
        if single_valued(&name) && self.response.headers.contains_key(&name) {
            return Err("duplicate single-valued field");
        }
        let value = HeaderValue::from_bytes(value).map_err(|_| "invalid header value")?;
        self.response.headers.append(name, value);
        Ok(())
    }

    fn validate_headers(&self) -> Result<(), &'static str> {
        let headers = &self.response.headers;
        if let Some(length) = headers.get(header::CONTENT_LENGTH) {
            if headers.contains_key(header::TRANSFER_ENCODING) {
                return Err("both Content-Length and Transfer-Encoding");
            }
            let length = length.as_bytes();
            if !length.iter().all(u8::is_ascii_digit) {
                return Err("non-numeric Content-Length");
            }
        }
        if let Some(encoding) = headers.get(header::TRANSFER_ENCODING) {
            if !encoding.as_bytes().eq_ignore_ascii_case(b"chunked") {
                return Err("unsupported Transfer-Encoding");
            }
        }
        Ok(())
    }
}

/// `NNN Reason-Phrase`, where the phrase must be the registered one.
fn parse_status(value: &[u8]) -> Option<StatusCode> {
    let value = std::str::from_utf8(value).ok()?;
    let (code, reason) = value.split_once(' ')?;
    if code.len() != 3 {
        return None;
    }
    let code: u16 = code.parse().ok()?;
    if !(100..=599).contains(&code) {
        return None;
    }
    let status = StatusCode::from_u16(code).ok()?;
    (status.canonical_reason() == Some(reason)).then_some(status)
}

fn dechunk(mut data: &[u8]) -> Option<Vec<u8>> {
    let mut body = Vec::with_capacity(data.len());
    loop {
        let eol = data.iter().position(|&b| b == b'\n')?;
        let size_line = std::str::from_utf8(&data[..eol]).ok()?;
        let size = size_line.split(';').next()?.trim();
        let size = usize::from_str_radix(size, 16).ok()?;
        data = &data[eol + 1..];
        if size == 0 {
            return Some(body);
        }
        if data.len() < size {
            return None;
        }
        body.extend_from_slice(&data[..size]);
        data = &data[size..];
        data = data
            .strip_prefix(b"\r\n")
            .or_else(|| data.strip_prefix(b"\n"))?;
    }
}
