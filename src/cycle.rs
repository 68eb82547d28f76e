//! One HTTP request from first byte to last byte written, driven one
//! readiness event at a time.

use crate::cgi::{CgiGateway, CgiInvocation, ScriptTarget};
use crate::config::{Config, LocationConfig};
use crate::error::default_error_body;
use crate::http::{ParseStatus, Parser, Request, Response};
use crate::redirect::RedirectGuard;
use crate::router;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use log::{debug, info, warn};
use mio::{Registry, Token};
use std::io::{self, Read, Write};
use std::mem;
use std::net::SocketAddr;
use std::rc::Rc;

const READ_BUFFER_SIZE: usize = 4096;

/// Addresses of the connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// Where CGI pipes of a connection get registered.
#[derive(Clone)]
pub struct PipeWatch {
    pub registry: Rc<Registry>,
    pub token: Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPendingState {
    /// Kept-alive connection waiting for the first byte of its next request.
    StartReading,
    RequestReading,
    CgiBodySending,
    CgiOutputReading,
    /// The request must be routed (again). Set after a CGI local redirect and
    /// as the starting point of nested cycles.
    CgiLocalRedirectPending,
    /// Waiting on a nested cycle fetching the configured error page.
    ErrorLocalRedirectPending,
    ResponseStart,
    ResponseSending,
    /// Handling is finished; the response is ready to be finalized.
    NoIoPending,
    EndResponse,
}

pub struct RequestCycle<S> {
    stream: Option<S>,
    config: Rc<Config>,
    client: ClientInfo,
    watch: Option<PipeWatch>,
    state: IoPendingState,
    parser: Parser,
    received: usize,
    request: Request,
    location: Option<LocationConfig>,
    guard: RedirectGuard,
    gateway: CgiGateway,
    response: Response,
    error_cycle: Option<Box<RequestCycle<S>>>,
    out: Vec<u8>,
    written: usize,
    keep_alive: bool,
    /// Fixed when the client's request arrives; local redirects turn the
    /// request itself into a GET.
    head_only: bool,
    parse_failed: bool,
    nested: bool,
}

impl<S: Read + Write> RequestCycle<S> {
    pub fn new(stream: S, config: Rc<Config>, client: ClientInfo, watch: Option<PipeWatch>) -> Self {
        RequestCycle {
            stream: Some(stream),
            config,
            client,
            watch,
            state: IoPendingState::RequestReading,
            parser: Parser::new(),
            received: 0,
            request: Request::new(),
            location: None,
            guard: RedirectGuard::new(),
            gateway: CgiGateway::new(),
            response: Response::default(),
            error_cycle: None,
            out: Vec::new(),
            written: 0,
            keep_alive: false,
            head_only: false,
            parse_failed: false,
            nested: false,
        }
    }

    /// A socket-less cycle that serves `request` on behalf of its parent.
    fn nested(
        request: Request,
        config: Rc<Config>,
        client: ClientInfo,
        watch: Option<PipeWatch>,
        guard: RedirectGuard,
    ) -> Self {
        RequestCycle {
            stream: None,
            config,
            client,
            watch,
            state: IoPendingState::CgiLocalRedirectPending,
            parser: Parser::new(),
            received: 0,
            request,
            location: None,
            guard,
            gateway: CgiGateway::new(),
            response: Response::default(),
            error_cycle: None,
            out: Vec::new(),
            written: 0,
            keep_alive: false,
            head_only: false,
            parse_failed: false,
            nested: true,
        }
    }

    pub fn state(&self) -> IoPendingState {
        self.state
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn redirect_depth(&self) -> usize {
        self.guard.depth()
    }

    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    /// The connection may carry another request once this one has ended.
    pub fn keep_alive(&self) -> bool {
        self.state == IoPendingState::EndResponse && self.keep_alive
    }

    /// True while progress depends on a CGI child rather than the client.
    pub fn waiting_on_cgi(&self) -> bool {
        matches!(
            self.state,
            IoPendingState::CgiBodySending
                | IoPendingState::CgiOutputReading
                | IoPendingState::ErrorLocalRedirectPending
        )
    }

    /// Advances as far as possible without blocking. Safe to call on every
    /// readiness event, relevant or not.
    pub fn run(&mut self) {
        loop {
            let next = match self.state {
                IoPendingState::StartReading | IoPendingState::RequestReading => self.read_request(),
                IoPendingState::CgiBodySending => self.gateway.continue_body_sending(
                    &mut self.request,
                    &mut self.guard,
                    &mut self.response,
                ),
                IoPendingState::CgiOutputReading => self.gateway.continue_output_reading(
                    &mut self.request,
                    &mut self.guard,
                    &mut self.response,
                ),
                IoPendingState::CgiLocalRedirectPending => self.dispatch(),
                IoPendingState::ErrorLocalRedirectPending => self.continue_error_page(),
                IoPendingState::NoIoPending => self.finalize(),
                IoPendingState::ResponseStart => self.start_response(),
                IoPendingState::ResponseSending => self.send_response(),
                IoPendingState::EndResponse => return,
            };
            let blocked = next == self.state && next != IoPendingState::CgiLocalRedirectPending;
            if next != self.state {
                debug!("{:?} -> {:?}", self.state, next);
            }
            self.state = next;
            if blocked {
                return;
            }
        }
    }

    /// Ends the cycle now, killing any CGI child it or its error-page fetch
    /// still owns.
    pub fn abort(&mut self) {
        self.gateway.abort();
        if let Some(mut child) = self.error_cycle.take() {
            child.abort();
        }
        self.keep_alive = false;
        self.state = IoPendingState::EndResponse;
    }

    /// Prepares for the next request on a kept-alive connection. Bytes that
    /// arrived past the end of the previous request are kept.
    pub fn reset(&mut self) {
        let pending = mem::take(&mut self.parser).into_pending();
        self.parser = Parser::with_pending(pending);
        self.received = 0;
        self.request = Request::new();
        self.location = None;
        self.guard = RedirectGuard::new();
        self.gateway.abort();
        self.response = Response::default();
        self.error_cycle = None;
        self.out.clear();
        self.written = 0;
        self.keep_alive = false;
        self.head_only = false;
        self.parse_failed = false;
        self.state = IoPendingState::StartReading;
    }

    fn read_request(&mut self) -> IoPendingState {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut status = self.parser.parse(&[]);
        if self.parser.has_pending() {
            self.received = self.received.max(1);
        }

        loop {
            if let ParseStatus::Error(status) = status {
                return self.request_failed(status);
            }
            if self.body_limit_exceeded() {
                return self.request_failed(StatusCode::PAYLOAD_TOO_LARGE);
            }
            if status == ParseStatus::Complete {
                return self.request_complete();
            }

            let result = match self.stream.as_mut() {
                Some(stream) => stream.read(&mut buf),
                None => return IoPendingState::EndResponse,
            };
            match result {
                Ok(0) => {
                    if self.received > 0 {
                        debug!("{} closed the connection mid-request", self.client.remote);
                    }
                    return IoPendingState::EndResponse;
                }
                Ok(n) => {
                    self.received += n;
                    status = self.parser.parse(&buf[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if self.received == 0 {
                        self.state
                    } else {
                        IoPendingState::RequestReading
                    };
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("read from {} failed: {}", self.client.remote, e);
                    return IoPendingState::EndResponse;
                }
            }
        }
    }

    /// Checked as soon as the header section is in, before the body has
    /// been buffered.
    fn body_limit_exceeded(&mut self) -> bool {
        if !self.parser.head_complete() {
            return false;
        }
        if self.location.is_none() {
            let request = &self.parser.request;
            self.location = self
                .config
                .resolve(self.client.local, request.host(), &request.path)
                .ok();
        }
        let Some(location) = &self.location else {
            return false;
        };
        let limit = location.client_max_body_size;
        self.parser.declared_length().is_some_and(|len| len > limit)
            || self.parser.body_len() > limit
    }

    fn request_failed(&mut self, status: StatusCode) -> IoPendingState {
        warn!("bad request from {}: {}", self.client.remote, status);
        self.request = self.parser.take_request();
        self.head_only = self.request.method == Method::HEAD;
        self.parse_failed = true;
        self.keep_alive = false;
        self.response = Response::new(status);
        IoPendingState::NoIoPending
    }

    fn request_complete(&mut self) -> IoPendingState {
        self.request = self.parser.take_request();
        self.keep_alive = self.request.keep_alive();
        self.head_only = self.request.method == Method::HEAD;
        debug!("{} {}", self.client.remote, self.request.request_line());
        self.dispatch()
    }

    /// Routes the current request: resolves its location from scratch, then
    /// hands it to the CGI gateway or the static handlers.
    fn dispatch(&mut self) -> IoPendingState {
        self.response = Response::default();
        let location = match self.config.resolve(
            self.client.local,
            self.request.host(),
            &self.request.path,
        ) {
            Ok(location) => location,
            Err(status) => {
                self.location = None;
                self.response = Response::new(status);
                return IoPendingState::NoIoPending;
            }
        };

        let target = if location.redirect.is_none() && location.allows(&self.request.method) {
            ScriptTarget::locate(&self.request.path, &location)
        } else {
            None
        };
        let next = match target {
            Some(target) => {
                let invocation = CgiInvocation {
                    target,
                    location: &location,
                    client: &self.client,
                    watch: self.watch.as_ref(),
                };
                self.gateway.execute_initial(
                    invocation,
                    &mut self.request,
                    &mut self.guard,
                    &mut self.response,
                )
            }
            None => {
                self.response = router::handle(&self.request, &location);
                IoPendingState::NoIoPending
            }
        };
        self.location = Some(location);
        next
    }

    fn finalize(&mut self) -> IoPendingState {
        if self.nested {
            return IoPendingState::EndResponse;
        }
        let page = self
            .location
            .as_ref()
            .filter(|_| self.response.is_error())
            .and_then(|location| location.error_page(self.response.status))
            .map(str::to_string);

        if let Some(uri) = page {
            match self.guard.child() {
                Ok(guard) => {
                    debug!("fetching error page {} for {}", uri, self.response.status);
                    let host = self.request.headers.get(header::HOST).cloned();
                    let request = Request::internal(Method::GET, &uri, host);
                    let mut child = RequestCycle::nested(
                        request,
                        self.config.clone(),
                        self.client,
                        self.watch.clone(),
                        guard,
                    );
                    child.run();
                    if child.state() != IoPendingState::EndResponse {
                        self.error_cycle = Some(Box::new(child));
                        return IoPendingState::ErrorLocalRedirectPending;
                    }
                    self.apply_error_page(&child);
                    return IoPendingState::ResponseStart;
                }
                Err(e) => warn!("error page {uri} skipped: {e}"),
            }
        }
        self.fill_default_body();
        IoPendingState::ResponseStart
    }

    fn continue_error_page(&mut self) -> IoPendingState {
        let Some(child) = self.error_cycle.as_mut() else {
            self.fill_default_body();
            return IoPendingState::ResponseStart;
        };
        child.run();
        if child.state() != IoPendingState::EndResponse {
            return IoPendingState::ErrorLocalRedirectPending;
        }
        if let Some(child) = self.error_cycle.take() {
            self.apply_error_page(&child);
        }
        IoPendingState::ResponseStart
    }

    /// Only a successful fetch replaces the body; the status stays ours.
    fn apply_error_page(&mut self, child: &RequestCycle<S>) {
        if child.response.status.is_success() {
            self.response.headers = child.response.headers.clone();
            self.response.body = child.response.body.clone();
        } else {
            warn!(
                "error page {} answered {}",
                child.request.target, child.response.status
            );
            self.response.headers.clear();
            self.response.body.clear();
            self.fill_default_body();
        }
    }

    fn fill_default_body(&mut self) {
        if self.response.is_error() && self.response.body.is_empty() {
            let status = self.response.status;
            self.response.body = default_error_body(status);
            self.response
                .headers
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        }
    }

    fn start_response(&mut self) -> IoPendingState {
        self.keep_alive = self.keep_alive && !self.parse_failed;
        self.out = self.response.to_bytes(self.head_only, self.keep_alive);
        self.written = 0;

        let line = if self.request.target.is_empty() {
            "-".to_string()
        } else {
            self.request.request_line()
        };
        if self.redirect_depth() > 0 {
            debug!("{} answered after {} local redirects", line, self.redirect_depth());
        }
        info!(
            target: "access",
            "{} \"{}\" {} {}",
            self.client.remote,
            line,
            self.response.status.as_u16(),
            self.response.body.len()
        );
        IoPendingState::ResponseSending
    }

    fn send_response(&mut self) -> IoPendingState {
        loop {
            if self.written == self.out.len() {
                return IoPendingState::EndResponse;
            }
            let result = match self.stream.as_mut() {
                Some(stream) => stream.write(&self.out[self.written..]),
                None => return IoPendingState::EndResponse,
            };
            match result {
                Ok(0) => {
                    self.keep_alive = false;
                    return IoPendingState::EndResponse;
                }
                Ok(n) => self.written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return IoPendingState::ResponseSending;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("write to {} failed: {}", self.client.remote, e);
                    self.keep_alive = false;
                    return IoPendingState::EndResponse;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgi::process::tests::write_script;
    use crate::error::REDIRECT_LIMIT_BODY;
    use crate::redirect::MAX_REDIRECTS;
    use std::fs;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    /// Non-blocking in-memory socket: hands out its input a few bytes at a
    /// time, then reports `WouldBlock` (or EOF once closed).
    struct MockStream {
        input: Vec<u8>,
        pos: usize,
        chunk: usize,
        closed: bool,
        output: Vec<u8>,
    }

    impl MockStream {
        fn new(input: &[u8]) -> Self {
            MockStream {
                input: input.to_vec(),
                pos: 0,
                chunk: 7,
                closed: false,
                output: Vec::new(),
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.input.len() {
                return if self.closed {
                    Ok(0)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            }
            let n = buf.len().min(self.chunk).min(self.input.len() - self.pos);
            buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn config(root: &Path, extra: &str) -> Rc<Config> {
        let yaml = format!(
            "servers:\n  - host: 127.0.0.1\n    ports: [8080]\n    root: {}\n{extra}    routes:\n      - path: /\n        index: index.html\n        cgi_extensions: [.sh]\n",
            root.display()
        );
        Rc::new(Config::from_yaml(&yaml).unwrap())
    }

    fn client() -> ClientInfo {
        ClientInfo {
            local: "127.0.0.1:8080".parse().unwrap(),
            remote: "127.0.0.1:50000".parse().unwrap(),
        }
    }

    fn cycle(config: Rc<Config>, input: &[u8]) -> RequestCycle<MockStream> {
        RequestCycle::new(MockStream::new(input), config, client(), None)
    }

    /// Runs until the cycle ends or stalls waiting for the client.
    fn drive(cycle: &mut RequestCycle<MockStream>) {
        for _ in 0..3000 {
            cycle.run();
            match cycle.state() {
                IoPendingState::EndResponse
                | IoPendingState::StartReading
                | IoPendingState::RequestReading => return,
                _ => thread::sleep(Duration::from_millis(2)),
            }
        }
        panic!("cycle stuck in {:?}", cycle.state());
    }

    fn output(cycle: &mut RequestCycle<MockStream>) -> String {
        let stream = cycle.stream_mut().unwrap();
        String::from_utf8_lossy(&mem::take(&mut stream.output)).into_owned()
    }

    #[test]
    fn serves_static_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<p>hi</p>").unwrap();
        let mut c = cycle(config(dir.path(), ""), b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        drive(&mut c);
        assert_eq!(c.state(), IoPendingState::EndResponse);
        assert!(c.keep_alive());
        let out = output(&mut c);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Connection: keep-alive\r\n"));
        assert!(out.ends_with("<p>hi</p>"));
    }

    #[test]
    fn runs_cgi_with_request_body() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "echo.sh",
            r#"printf 'Content-Type: text/plain\n\n'; printf '%s:' "$REQUEST_METHOD"; cat"#,
        );
        let mut c = cycle(
            config(dir.path(), ""),
            b"POST /echo.sh HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello",
        );
        drive(&mut c);
        let out = output(&mut c);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
        assert!(out.contains("Content-Length: 10\r\n"));
        assert!(out.ends_with("POST:hello"));
    }

    #[test]
    fn local_redirect_reroutes_request() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("done.html"), "done").unwrap();
        write_script(dir.path(), "go.sh", r"printf 'Location: /done.html\n\n'");
        let mut c = cycle(config(dir.path(), ""), b"GET /go.sh HTTP/1.1\r\nHost: localhost\r\n\r\n");
        drive(&mut c);
        assert_eq!(c.redirect_depth(), 1);
        assert_eq!(c.request().path, "/done.html");
        let out = output(&mut c);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("done"));
    }

    #[test]
    fn head_survives_local_redirect() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("done.html"), "BODYBYTES").unwrap();
        write_script(dir.path(), "go.sh", r"printf 'Location: /done.html\n\n'");
        let mut c = cycle(config(dir.path(), ""), b"HEAD /go.sh HTTP/1.1\r\nHost: localhost\r\n\r\n");
        drive(&mut c);
        assert_eq!(c.request().method, Method::GET);
        assert!(c.keep_alive());
        let out = output(&mut c);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
        assert!(out.contains("Content-Length: 9\r\n"));
        assert!(out.ends_with("\r\n\r\n"), "{out}");
        assert!(!out.contains("BODYBYTES"));
    }

    #[test]
    fn redirect_loop_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "loop.sh",
            r"echo run >> calls.log; printf 'Location: /loop.sh\n\n'",
        );
        let mut c = cycle(config(dir.path(), ""), b"GET /loop.sh HTTP/1.1\r\nHost: localhost\r\n\r\n");
        drive(&mut c);
        assert_eq!(c.redirect_depth(), MAX_REDIRECTS);
        let out = output(&mut c);
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.ends_with(std::str::from_utf8(REDIRECT_LIMIT_BODY).unwrap()));
        // The first run plus one per allowed redirect.
        let calls = fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert_eq!(calls.lines().count(), MAX_REDIRECTS + 1);
    }

    #[test]
    fn serves_configured_error_page_with_original_status() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("errors")).unwrap();
        fs::write(dir.path().join("errors/404.html"), "custom missing").unwrap();
        let cfg = config(dir.path(), "    error_pages: { 404: /errors/404.html }\n");
        let mut c = cycle(cfg, b"GET /nothing HTTP/1.1\r\nHost: localhost\r\n\r\n");
        drive(&mut c);
        let out = output(&mut c);
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.ends_with("custom missing"));
    }

    #[test]
    fn error_page_may_come_from_cgi() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "err.sh",
            r"sleep 0.1; printf 'Content-Type: text/plain\n\nscripted'",
        );
        let cfg = config(dir.path(), "    error_pages: { 404: /err.sh }\n");
        let mut c = cycle(cfg, b"GET /nothing HTTP/1.1\r\nHost: localhost\r\n\r\n");
        c.run();
        assert_eq!(c.state(), IoPendingState::ErrorLocalRedirectPending);
        assert!(c.waiting_on_cgi());
        drive(&mut c);
        let out = output(&mut c);
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.contains("Content-Type: text/plain\r\n"));
        assert!(out.ends_with("scripted"));
    }

    #[test]
    fn missing_error_page_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), "    error_pages: { 404: /errors/gone.html }\n");
        let mut c = cycle(cfg, b"GET /nothing HTTP/1.1\r\nHost: localhost\r\n\r\n");
        drive(&mut c);
        let out = output(&mut c);
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.contains("<h1>404 Not Found</h1>"));
    }

    #[test]
    fn parse_error_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cycle(config(dir.path(), ""), b"BROKEN\r\n\r\n");
        drive(&mut c);
        assert!(!c.keep_alive());
        let out = output(&mut c);
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(out.contains("Connection: close\r\n"));
    }

    #[test]
    fn enforces_body_limit_before_body_arrives() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), "    client_max_body_size: 4\n");
        let mut c = cycle(cfg, b"POST /up HTTP/1.1\r\nHost: localhost\r\nContent-Length: 100\r\n\r\n");
        drive(&mut c);
        assert_eq!(c.state(), IoPendingState::EndResponse);
        assert!(output(&mut c).starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[test]
    fn announced_chunk_over_limit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), "    client_max_body_size: 4\n");
        let mut input =
            b"POST /up HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n100000\r\n".to_vec();
        input.extend(vec![b'x'; 200_000]);
        let mut c = cycle(cfg, &input);
        drive(&mut c);
        assert_eq!(c.state(), IoPendingState::EndResponse);
        assert!(output(&mut c).starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(c.stream_mut().unwrap().pos < 1_000);
    }

    #[test]
    fn keep_alive_carries_pipelined_request() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "A").unwrap();
        fs::write(dir.path().join("b.txt"), "B").unwrap();
        let mut c = cycle(
            config(dir.path(), ""),
            b"GET /a.txt HTTP/1.1\r\nHost: localhost\r\n\r\nGET /b.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        drive(&mut c);
        assert!(c.keep_alive());
        assert!(output(&mut c).ends_with("\r\n\r\nA"));

        c.reset();
        assert_eq!(c.state(), IoPendingState::StartReading);
        drive(&mut c);
        assert!(!c.keep_alive());
        assert!(output(&mut c).ends_with("\r\n\r\nB"));
    }

    #[test]
    fn idle_connection_stays_in_start_reading() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cycle(config(dir.path(), ""), b"");
        c.reset();
        c.run();
        assert_eq!(c.state(), IoPendingState::StartReading);
        c.stream_mut().unwrap().closed = true;
        c.run();
        assert_eq!(c.state(), IoPendingState::EndResponse);
        assert!(output(&mut c).is_empty());
    }

    #[test]
    fn cgi_timeout_is_gateway_timeout() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "slow.sh", "sleep 30");
        let yaml = format!(
            "servers:\n  - host: 127.0.0.1\n    ports: [8080]\n    root: {}\n    cgi_timeout: 1\n    routes:\n      - path: /\n        cgi_extensions: [.sh]\n",
            dir.path().display()
        );
        let cfg = Rc::new(Config::from_yaml(&yaml).unwrap());
        let mut c = cycle(cfg, b"GET /slow.sh HTTP/1.1\r\nHost: localhost\r\n\r\n");
        drive(&mut c);
        assert!(output(&mut c).starts_with("HTTP/1.1 504 Gateway Timeout\r\n"));
    }

    #[test]
    fn abort_ends_cycle_and_releases_cgi() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "slow.sh", "sleep 30");
        let mut c = cycle(config(dir.path(), ""), b"GET /slow.sh HTTP/1.1\r\nHost: localhost\r\n\r\n");
        c.run();
        assert_eq!(c.state(), IoPendingState::CgiOutputReading);
        c.abort();
        assert_eq!(c.state(), IoPendingState::EndResponse);
        assert!(!c.waiting_on_cgi());
        assert!(!c.keep_alive());
    }
}
