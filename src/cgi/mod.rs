//! The CGI gateway: runs one script per request without ever blocking the
//! event loop and folds whatever happens into the outbound [`Response`].

pub mod env;
pub mod process;
pub mod response;

pub use env::{CgiEnvironment, ScriptTarget};
pub use process::{CgiProcess, ProcessStatus, ReadOutcome, WriteOutcome};
pub use response::{CgiResponse, CgiResponseParser, CgiType};

use crate::config::LocationConfig;
use crate::cycle::{ClientInfo, IoPendingState, PipeWatch};
use crate::error::{CgiError, REDIRECT_LIMIT_BODY};
use crate::http::{Request, Response};
use crate::redirect::RedirectGuard;
use http::header::{self, HeaderValue};
use http::StatusCode;
use log::{debug, info, warn};
use std::io;
use std::mem;

/// Everything `execute_initial` needs besides the request itself.
pub struct CgiInvocation<'a> {
    pub target: ScriptTarget,
    pub location: &'a LocationConfig,
    pub client: &'a ClientInfo,
    pub watch: Option<&'a PipeWatch>,
}

#[derive(Default)]
pub struct CgiGateway {
    process: Option<CgiProcess>,
    parser: CgiResponseParser,
}

impl CgiGateway {
    pub fn new() -> Self {
        CgiGateway::default()
    }

    /// True while a child process is owned.
    pub fn is_active(&self) -> bool {
        self.process.is_some()
    }

    /// Spawns the script and takes the first write/read turn.
    pub fn execute_initial(
        &mut self,
        invocation: CgiInvocation<'_>,
        request: &mut Request,
        guard: &mut RedirectGuard,
        response: &mut Response,
    ) -> IoPendingState {
        self.release();
        self.parser = CgiResponseParser::new();

        let CgiInvocation {
            target,
            location,
            client,
            watch,
        } = invocation;
        let env = CgiEnvironment::build(request, &target, client, location);
        let has_body = !request.body.is_empty();
        debug!("cgi environment for {}: {}", target.script_name, env.to_strings().join(" "));
        let mut process = match CgiProcess::spawn(
            &target.script_path,
            location.cgi_path.as_deref(),
            &env,
            has_body,
            location.cgi_timeout,
        ) {
            Ok(process) => process,
            Err(e) => return self.fail(e, response),
        };
        info!(
            "cgi {} started as pid {} for {}",
            env.get("SCRIPT_FILENAME").unwrap_or(&target.script_name),
            process.id(),
            request.request_line()
        );

        if let Some(watch) = watch {
            if let Err(e) = process.register(watch.registry.clone(), watch.token) {
                self.process = Some(process);
                return self.fail(CgiError::Io(e), response);
            }
        }
        self.process = Some(process);

        if has_body {
            self.continue_body_sending(request, guard, response)
        } else {
            self.continue_output_reading(request, guard, response)
        }
    }

    /// Pushes more of the request body into the child. Output is only read
    /// once the whole body has been written.
    pub fn continue_body_sending(
        &mut self,
        request: &mut Request,
        guard: &mut RedirectGuard,
        response: &mut Response,
    ) -> IoPendingState {
        let Some(process) = self.process.as_mut() else {
            return IoPendingState::NoIoPending;
        };
        if process.poll() == ProcessStatus::TimedOut {
            let budget = process.timeout();
            return self.fail(CgiError::Timeout(budget), response);
        }

        loop {
            match process.write_chunk(&request.body) {
                WriteOutcome::Progress(_) => continue,
                WriteOutcome::Complete => {
                    debug!("cgi request body of {} bytes written", request.body.len());
                    return self.continue_output_reading(request, guard, response);
                }
                WriteOutcome::WouldBlock => return IoPendingState::CgiBodySending,
                WriteOutcome::Error => {
                    let err = if process.timed_out() {
                        CgiError::Timeout(process.timeout())
                    } else {
                        CgiError::Io(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "cgi stdin closed before the body was written",
                        ))
                    };
                    return self.fail(err, response);
                }
            }
        }
    }

    /// Drains the child's stdout into the parser and, at EOF, classifies
    /// and dispatches the result.
    pub fn continue_output_reading(
        &mut self,
        request: &mut Request,
        guard: &mut RedirectGuard,
        response: &mut Response,
    ) -> IoPendingState {
        let Some(process) = self.process.as_mut() else {
            return IoPendingState::NoIoPending;
        };

        loop {
            match process.read_chunk() {
                ReadOutcome::Progress(bytes) => {
                    self.parser.feed(bytes);
                    if self.parser.is_failed() {
                        break;
                    }
                }
                ReadOutcome::Complete => {
                    if !self.parser.headers_complete() {
                        debug!("cgi output ended inside the header section");
                    }
                    break;
                }
                ReadOutcome::WouldBlock => {
                    if process.poll() == ProcessStatus::TimedOut {
                        let budget = process.timeout();
                        return self.fail(CgiError::Timeout(budget), response);
                    }
                    return IoPendingState::CgiOutputReading;
                }
                ReadOutcome::Error => {
                    let err = if process.timed_out() {
                        CgiError::Timeout(process.timeout())
                    } else {
                        CgiError::Io(io::Error::other("reading cgi output failed"))
                    };
                    return self.fail(err, response);
                }
            }
        }
        self.finish_output(request, guard, response)
    }

    /// Kills and reaps the child, if any. Used when the client goes away.
    pub fn abort(&mut self) {
        if let Some(process) = &self.process {
            debug!(
                "aborting cgi pid {} (stdin {:?}, stdout {:?})",
                process.id(),
                process.write_state(),
                process.read_state()
            );
        }
        self.release();
    }

    fn finish_output(
        &mut self,
        request: &mut Request,
        guard: &mut RedirectGuard,
        response: &mut Response,
    ) -> IoPendingState {
        let parser = mem::take(&mut self.parser);
        let mut exec_failed = false;
        if let Some(process) = self.process.as_mut() {
            process.poll();
            process.release();
            exec_failed = process.exec_failed();
            debug!(
                "cgi pid {} finished with {:?} after {} bytes of output",
                process.id(),
                process.exit_status(),
                process.output_len()
            );
        }
        self.release();

        if exec_failed {
            return self.fail(
                CgiError::Exec("interpreter exited with status 127 and no output".to_string()),
                response,
            );
        }
        self.dispatch(parser.finish(), request, guard, response)
    }

    fn dispatch(
        &mut self,
        cgi: CgiResponse,
        request: &mut Request,
        guard: &mut RedirectGuard,
        response: &mut Response,
    ) -> IoPendingState {
        match cgi.cgi_type {
            CgiType::Document => copy_response(cgi, response, StatusCode::OK),
            CgiType::ClientRedirect => copy_response(cgi, response, StatusCode::FOUND),
            CgiType::ClientRedirectDocument => copy_response(cgi, response, StatusCode::FOUND),
            CgiType::LocalRedirect => {
                let Some(location) = cgi.location().map(str::to_string) else {
                    return self.fail(CgiError::MalformedResponse, response);
                };
                if let Err(e) = guard.advance() {
                    warn!("{e} while redirecting {} to {location}", request.target);
                    response.status = StatusCode::INTERNAL_SERVER_ERROR;
                    response.headers.clear();
                    response.body = REDIRECT_LIMIT_BODY.to_vec();
                    response
                        .headers
                        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
                    return IoPendingState::NoIoPending;
                }
                debug!(
                    "cgi local redirect {} -> {location} (depth {})",
                    request.target,
                    guard.depth()
                );
                request.redirect_to(&location);
                return IoPendingState::CgiLocalRedirectPending;
            }
            CgiType::Invalid => return self.fail(CgiError::MalformedResponse, response),
        }
        IoPendingState::NoIoPending
    }

    fn fail(&mut self, err: CgiError, response: &mut Response) -> IoPendingState {
        warn!("cgi request failed: {err}");
        self.release();
        response.status = err.status();
        response.headers.clear();
        response.body.clear();
        IoPendingState::NoIoPending
    }

    fn release(&mut self) {
        if let Some(mut process) = self.process.take() {
            if !process.is_released() {
                process.release();
            }
        }
    }
}

fn copy_response(cgi: CgiResponse, response: &mut Response, default: StatusCode) {
    response.status = cgi.status.unwrap_or(default);
    response.headers = cgi.headers;
    response.body = cgi.body;
}
