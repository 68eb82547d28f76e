use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use percent_encoding::percent_decode_str;
use std::mem;
use std::time::SystemTime;

pub const SERVER_SOFTWARE: &str = "RustCgiServer/0.1.0";

const MAX_REQUEST_LINE: usize = 8 * 1024;
const MAX_HEADER_SECTION: usize = 32 * 1024;
const MAX_CHUNK_LINE: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Raw request-target as received.
    pub target: String,
    /// Percent-decoded path component of the target.
    pub path: String,
    /// Raw query string, without the `?`.
    pub query: String,
    pub version: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub chunked: bool,
}

impl Default for Request {
    fn default() -> Self {
        Request::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Request {
            method: Method::GET,
            target: String::new(),
            path: String::new(),
            query: String::new(),
            version: "HTTP/1.1".to_string(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            chunked: false,
        }
    }

    /// A body-less request the server issues to itself, e.g. for error pages.
    pub fn internal(method: Method, target: &str, host: Option<HeaderValue>) -> Self {
        let mut request = Request::new();
        request.method = method;
        request.set_target(target);
        if let Some(host) = host {
            request.headers.insert(header::HOST, host);
        }
        request
    }

    pub fn set_target(&mut self, target: &str) {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, q),
            None => (target, ""),
        };
        self.target = target.to_string();
        self.path = percent_decode_str(path).decode_utf8_lossy().into_owned();
        self.query = query.to_string();
    }

    /// Rewrites this request in place for a CGI local redirect. The previous
    /// method, target and body are gone afterwards.
    pub fn redirect_to(&mut self, location: &str) {
        self.method = Method::GET;
        self.set_target(location);
        self.body.clear();
        self.chunked = false;
        self.headers.remove(header::CONTENT_LENGTH);
        self.headers.remove(header::CONTENT_TYPE);
        self.headers.remove(header::TRANSFER_ENCODING);
    }

    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn host(&self) -> Option<&str> {
        self.header(header::HOST)
    }

    pub fn keep_alive(&self) -> bool {
        let connection = self
            .header(header::CONNECTION)
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if self.version == "HTTP/1.0" {
            connection.contains("keep-alive")
        } else {
            !connection.contains("close")
        }
    }

    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.target, self.version)
    }
}

#[derive(Debug, PartialEq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    ChunkSize,
    ChunkData,
    ChunkTrailer,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    NeedMoreData,
    Complete,
    Error(StatusCode),
}

pub struct Parser {
    pub state: ParseState,
    pub request: Request,
    buffer: Vec<u8>,
    chunk_size: usize,
    content_length: usize,
    header_bytes: usize,
    error: StatusCode,
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser::with_pending(Vec::new())
    }

    /// Starts a parser over bytes left behind by the previous request on the
    /// same connection.
    pub fn with_pending(buffer: Vec<u8>) -> Self {
        Parser {
            state: ParseState::RequestLine,
            request: Request::new(),
            buffer,
            chunk_size: 0,
            content_length: 0,
            header_bytes: 0,
            error: StatusCode::BAD_REQUEST,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// True once the header section is in; the body may still be arriving.
    pub fn head_complete(&self) -> bool {
        !matches!(
            self.state,
            ParseState::RequestLine | ParseState::Headers | ParseState::Error
        )
    }

    pub fn declared_length(&self) -> Option<usize> {
        (!self.request.chunked && self.head_complete()).then_some(self.content_length)
    }

    /// Body bytes received so far plus whatever the chunk being read still
    /// announces, so a limit can be enforced before that chunk is buffered.
    pub fn body_len(&self) -> usize {
        let announced = if self.state == ParseState::ChunkData {
            self.chunk_size
        } else {
            0
        };
        self.request.body.len().saturating_add(announced)
    }

    pub fn take_request(&mut self) -> Request {
        mem::take(&mut self.request)
    }

    pub fn into_pending(self) -> Vec<u8> {
        self.buffer
    }

    pub fn parse(&mut self, data: &[u8]) -> ParseStatus {
        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                ParseState::RequestLine => {
                    let Some(line) = self.next_line() else {
                        if self.buffer.len() > MAX_REQUEST_LINE {
                            return self.fail(StatusCode::URI_TOO_LONG);
                        }
                        break;
                    };
                    if line.is_empty() {
                        continue;
                    }
                    if line.len() > MAX_REQUEST_LINE {
                        return self.fail(StatusCode::URI_TOO_LONG);
                    }
                    if let Err(status) = self.parse_request_line(&line) {
                        return self.fail(status);
                    }
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some(line) = self.next_line() else {
                        if self.header_bytes + self.buffer.len() > MAX_HEADER_SECTION {
                            return self.fail(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
                        }
                        break;
                    };
                    self.header_bytes += line.len() + 2;
                    if self.header_bytes > MAX_HEADER_SECTION {
                        return self.fail(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
                    }
                    let result = if line.is_empty() {
                        self.finish_headers()
                    } else {
                        self.parse_header_line(&line)
                    };
                    if let Err(status) = result {
                        return self.fail(status);
                    }
                }
                ParseState::Body => {
                    let remaining = self.content_length - self.request.body.len();
                    let take = remaining.min(self.buffer.len());
                    self.request.body.extend(self.buffer.drain(..take));
                    if self.request.body.len() == self.content_length {
                        self.state = ParseState::Done;
                    } else {
                        break;
                    }
                }
                ParseState::ChunkSize => {
                    let Some(line) = self.next_line() else {
                        if self.buffer.len() > MAX_CHUNK_LINE {
                            return self.fail(StatusCode::BAD_REQUEST);
                        }
                        break;
                    };
                    if line.len() > MAX_CHUNK_LINE {
                        return self.fail(StatusCode::BAD_REQUEST);
                    }
                    let size = String::from_utf8_lossy(&line);
                    let size = size.split(';').next().unwrap_or("").trim();
                    match usize::from_str_radix(size, 16) {
                        Ok(0) => self.state = ParseState::ChunkTrailer,
                        Ok(n) => {
                            let fits = n
                                .checked_add(2)
                                .and_then(|end| end.checked_add(self.request.body.len()));
                            if fits.is_none() {
                                return self.fail(StatusCode::PAYLOAD_TOO_LARGE);
                            }
                            self.chunk_size = n;
                            self.state = ParseState::ChunkData;
                        }
                        Err(_) => return self.fail(StatusCode::BAD_REQUEST),
                    }
                }
                ParseState::ChunkData => {
                    let Some(end) = self.chunk_size.checked_add(2) else {
                        return self.fail(StatusCode::PAYLOAD_TOO_LARGE);
                    };
                    if self.buffer.len() < end {
                        break;
                    }
                    if &self.buffer[self.chunk_size..end] != b"\r\n" {
                        return self.fail(StatusCode::BAD_REQUEST);
                    }
                    self.request
                        .body
                        .extend_from_slice(&self.buffer[..self.chunk_size]);
                    self.buffer.drain(..end);
                    self.chunk_size = 0;
                    self.state = ParseState::ChunkSize;
                }
                ParseState::ChunkTrailer => {
                    let Some(line) = self.next_line() else {
                        if self.buffer.len() > MAX_CHUNK_LINE {
                            return self.fail(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
                        }
                        break;
                    };
                    self.header_bytes += line.len() + 2;
                    if self.header_bytes > MAX_HEADER_SECTION {
                        return self.fail(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
                    }
                    if line.is_empty() {
                        self.state = ParseState::Done;
                    }
                }
                ParseState::Done => return ParseStatus::Complete,
                ParseState::Error => return ParseStatus::Error(self.error),
            }
        }
        ParseStatus::NeedMoreData
    }

    fn fail(&mut self, status: StatusCode) -> ParseStatus {
        self.state = ParseState::Error;
        self.error = status;
        ParseStatus::Error(status)
    }

    /// Pops one CRLF (or bare LF) terminated line off the buffer.
    fn next_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), StatusCode> {
        let line = std::str::from_utf8(line).map_err(|_| StatusCode::BAD_REQUEST)?;
        let parts: Vec<&str> = line.split(' ').collect();
        if parts.len() != 3 {
            return Err(StatusCode::BAD_REQUEST);
        }
        let method = Method::from_bytes(parts[0].as_bytes()).map_err(|_| StatusCode::BAD_REQUEST)?;
        if !parts[1].starts_with('/') {
            return Err(StatusCode::BAD_REQUEST);
        }
        match parts[2] {
            "HTTP/1.1" | "HTTP/1.0" => {}
            v if v.starts_with("HTTP/") => return Err(StatusCode::HTTP_VERSION_NOT_SUPPORTED),
            _ => return Err(StatusCode::BAD_REQUEST),
        }
        self.request.method = method;
        self.request.set_target(parts[1]);
        self.request.version = parts[2].to_string();
        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), StatusCode> {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(StatusCode::BAD_REQUEST)?;
        let name = HeaderName::from_bytes(&line[..colon]).map_err(|_| StatusCode::BAD_REQUEST)?;
        let value = trim_ows(&line[colon + 1..]);
        let value = HeaderValue::from_bytes(value).map_err(|_| StatusCode::BAD_REQUEST)?;
        self.request.headers.append(name, value);
        Ok(())
    }

    fn finish_headers(&mut self) -> Result<(), StatusCode> {
        let headers = &self.request.headers;
        if self.request.version == "HTTP/1.1" && !headers.contains_key(header::HOST) {
            return Err(StatusCode::BAD_REQUEST);
        }
        let has_length = headers.contains_key(header::CONTENT_LENGTH);
        let encoding = headers.get(header::TRANSFER_ENCODING);

        if let Some(encoding) = encoding {
            if has_length {
                return Err(StatusCode::BAD_REQUEST);
            }
            if !encoding.as_bytes().eq_ignore_ascii_case(b"chunked") {
                return Err(StatusCode::NOT_IMPLEMENTED);
            }
            self.request.chunked = true;
            self.state = ParseState::ChunkSize;
            return Ok(());
        }

        let mut lengths = headers.get_all(header::CONTENT_LENGTH).iter();
        let length = match lengths.next() {
            Some(first) => {
                if lengths.any(|other| other != first) {
                    return Err(StatusCode::BAD_REQUEST);
                }
                let text = first.to_str().map_err(|_| StatusCode::BAD_REQUEST)?;
                if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(StatusCode::BAD_REQUEST);
                }
                text.parse::<usize>().map_err(|_| StatusCode::PAYLOAD_TOO_LARGE)?
            }
            None => 0,
        };
        self.content_length = length;
        self.state = if length == 0 {
            ParseState::Done
        } else {
            ParseState::Body
        };
        Ok(())
    }
}

pub(crate) fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Response::new(StatusCode::OK)
    }
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn set_body(&mut self, body: Vec<u8>, content_type: &'static str) {
        self.body = body;
        self.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }

    pub fn is_error(&self) -> bool {
        self.status.is_client_error() || self.status.is_server_error()
    }

    pub fn to_bytes(&self, head_only: bool, keep_alive: bool) -> Vec<u8> {
        let reason = self.status.canonical_reason().unwrap_or("Unknown");
        let mut resp = format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), reason).into_bytes();

        for (name, value) in &self.headers {
            if name == header::CONTENT_LENGTH
                || name == header::CONNECTION
                || name == header::TRANSFER_ENCODING
            {
                continue;
            }
            push_header(&mut resp, &title_case(name.as_str()), value.as_bytes());
        }
        if !self.headers.contains_key(header::SERVER) {
            push_header(&mut resp, "Server", SERVER_SOFTWARE.as_bytes());
        }
        if !self.headers.contains_key(header::DATE) {
            let date = httpdate::fmt_http_date(SystemTime::now());
            push_header(&mut resp, "Date", date.as_bytes());
        }
        let bodyless = self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED;
        if !bodyless {
            push_header(&mut resp, "Content-Length", self.body.len().to_string().as_bytes());
        }
        let connection: &[u8] = if keep_alive { b"keep-alive" } else { b"close" };
        push_header(&mut resp, "Connection", connection);
        resp.extend_from_slice(b"\r\n");

        if !head_only && !bodyless {
            resp.extend_from_slice(&self.body);
        }
        resp
    }
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        out.push(if upper { c.to_ascii_uppercase() } else { c });
        upper = c == '-';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_with_query() {
        let mut parser = Parser::new();
        let status = parser.parse(b"GET /a%20b/c?x=1&y=two+words HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(status, ParseStatus::Complete);
        let req = parser.take_request();
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.path, "/a b/c");
        assert_eq!(req.query, "x=1&y=two+words");
        assert_eq!(req.host(), Some("example.com"));
    }

    #[test]
    fn parses_across_partial_reads() {
        let mut parser = Parser::new();
        assert_eq!(parser.parse(b"POST /up HTTP/1.1\r\nHo"), ParseStatus::NeedMoreData);
        assert_eq!(parser.parse(b"st: x\r\nContent-Length: 5\r\n\r\nhe"), ParseStatus::NeedMoreData);
        assert!(parser.head_complete());
        assert_eq!(parser.declared_length(), Some(5));
        assert_eq!(parser.body_len(), 2);
        assert_eq!(parser.parse(b"llo"), ParseStatus::Complete);
        assert_eq!(parser.take_request().body, b"hello");
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let mut parser = Parser::new();
        parser.parse(b"GET / HTTP/1.1\r\nhost: a\r\nX-Thing: 1\r\nx-thing: 2\r\n\r\n");
        let req = parser.take_request();
        let values: Vec<_> = req.headers.get_all("X-THING").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn decodes_chunked_body() {
        let mut parser = Parser::new();
        let status = parser.parse(
            b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\n",
        );
        assert_eq!(status, ParseStatus::Complete);
        let req = parser.take_request();
        assert!(req.chunked);
        assert_eq!(req.body, b"hello world");
    }

    #[test]
    fn oversized_chunk_is_rejected_without_panicking() {
        let mut parser = Parser::new();
        let status = parser.parse(
            b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nxyz",
        );
        assert_eq!(status, ParseStatus::Error(StatusCode::PAYLOAD_TOO_LARGE));
    }

    #[test]
    fn announced_chunk_counts_toward_body_length() {
        let mut parser = Parser::new();
        let status = parser.parse(
            b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n100000\r\nxy",
        );
        assert_eq!(status, ParseStatus::NeedMoreData);
        assert_eq!(parser.body_len(), 3 + 0x100000);
    }

    #[test]
    fn caps_chunk_size_line() {
        let mut parser = Parser::new();
        parser.parse(b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n");
        let line = "0".repeat(MAX_CHUNK_LINE + 1);
        assert_eq!(
            parser.parse(line.as_bytes()),
            ParseStatus::Error(StatusCode::BAD_REQUEST)
        );
    }

    #[test]
    fn keeps_pipelined_bytes() {
        let mut parser = Parser::new();
        parser.parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\nGET /next HTTP/1.1\r\n");
        assert!(parser.has_pending());
        let mut next = Parser::with_pending(parser.into_pending());
        assert_eq!(next.parse(b"Host: a\r\n\r\n"), ParseStatus::Complete);
        assert_eq!(next.take_request().path, "/next");
    }

    #[test]
    fn rejects_bad_requests() {
        let cases: &[(&[u8], StatusCode)] = &[
            (b"GET /\r\n\r\n", StatusCode::BAD_REQUEST),
            (b"GET / HTTP/2.0\r\n\r\n", StatusCode::HTTP_VERSION_NOT_SUPPORTED),
            (b"GET / HTTP/1.1\r\n\r\n", StatusCode::BAD_REQUEST),
            (b"GET / HTTP/1.1\r\nHost a\r\n\r\n", StatusCode::BAD_REQUEST),
            (
                b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 1\r\nTransfer-Encoding: chunked\r\n\r\n",
                StatusCode::BAD_REQUEST,
            ),
            (
                b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: gzip\r\n\r\n",
                StatusCode::NOT_IMPLEMENTED,
            ),
            (b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: x\r\n\r\n", StatusCode::BAD_REQUEST),
        ];
        for (input, expected) in cases {
            let mut parser = Parser::new();
            assert_eq!(
                parser.parse(input),
                ParseStatus::Error(*expected),
                "{}",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn rejects_overlong_request_line() {
        let mut parser = Parser::new();
        let line = format!("GET /{} HTTP/1.1", "a".repeat(MAX_REQUEST_LINE + 1));
        assert_eq!(
            parser.parse(line.as_bytes()),
            ParseStatus::Error(StatusCode::URI_TOO_LONG)
        );
    }

    #[test]
    fn keep_alive_follows_version_and_connection() {
        let mut req = Request::new();
        assert!(req.keep_alive());
        req.headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        assert!(!req.keep_alive());
        let mut old = Request::new();
        old.version = "HTTP/1.0".to_string();
        assert!(!old.keep_alive());
    }

    #[test]
    fn redirect_rewrites_request() {
        let mut req = Request::new();
        req.method = Method::POST;
        req.set_target("/form.py");
        req.body = b"a=1".to_vec();
        req.headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        req.redirect_to("/done?ok=1");
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.path, "/done");
        assert_eq!(req.query, "ok=1");
        assert!(req.body.is_empty());
        assert!(!req.headers.contains_key(header::CONTENT_LENGTH));
    }

    #[test]
    fn serializes_response() {
        let mut res = Response::new(StatusCode::OK);
        res.set_body(b"hi".to_vec(), "text/plain");
        let text = String::from_utf8(res.to_bytes(false, true)).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));

        let head = String::from_utf8(res.to_bytes(true, false)).unwrap();
        assert!(head.contains("Content-Length: 2\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn content_length_is_recomputed() {
        let mut res = Response::new(StatusCode::OK);
        res.headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        res.body = b"abc".to_vec();
        let text = String::from_utf8(res.to_bytes(false, false)).unwrap();
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(!text.contains("999"));
    }
}
