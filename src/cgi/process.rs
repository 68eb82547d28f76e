use crate::cgi::env::CgiEnvironment;
use crate::error::CgiError;
use log::{debug, warn};
use mio::unix::pipe::{Receiver, Sender};
use mio::{Interest, Registry, Token};
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Exit status shells and `env` use when the program could not be executed.
const EXEC_FAILURE_CODE: i32 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Idle,
    Writing,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Idle,
    Reading,
    Done,
    Error,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Progress(usize),
    Complete,
    WouldBlock,
    Error,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome<'a> {
    Progress(&'a [u8]),
    Complete,
    WouldBlock,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    ExitedNormally,
    ExitedAbnormally(ExitStatus),
    TimedOut,
}

/// One running CGI child and the parent's ends of its stdin/stdout pipes.
///
/// Dropping the value releases it, so the child is reaped and the pipes are
/// closed on every exit path.
pub struct CgiProcess {
    child: Child,
    stdin: Option<Sender>,
    stdout: Option<Receiver>,
    written: usize,
    read_buf: Box<[u8]>,
    output_len: usize,
    started: Instant,
    timeout: Duration,
    write_state: WriteState,
    read_state: ReadState,
    exit: Option<ExitStatus>,
    timed_out: bool,
    released: bool,
    registry: Option<Rc<Registry>>,
}

impl CgiProcess {
    /// Checks the script (and interpreter), then starts the child. With
    /// `has_body` false the child's stdin is `/dev/null`.
    pub fn spawn(
        script: &Path,
        interpreter: Option<&Path>,
        env: &CgiEnvironment,
        has_body: bool,
        timeout: Duration,
    ) -> Result<CgiProcess, CgiError> {
        let script = check_script(script)?;
        if let Some(interpreter) = interpreter {
            check_interpreter(interpreter)?;
        }

        let mut command = match interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&script);
                cmd
            }
            None => Command::new(&script),
        };
        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }
        command
            .envs(env.iter())
            .stdin(if has_body { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        // std reports a failed exec through its own CLOEXEC status pipe, so an
        // error here is either fork trouble or the exec itself.
        let mut child = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory => CgiError::Spawn(e),
            _ => CgiError::Exec(format!("{}: {}", script.display(), e)),
        })?;
        debug!("spawned cgi process {} for {}", child.id(), script.display());

        let stdin = child.stdin.take().map(Sender::from);
        let stdout = child.stdout.take().map(Receiver::from);
        let process = CgiProcess {
            child,
            stdin,
            stdout,
            written: 0,
            read_buf: vec![0; READ_BUFFER_SIZE].into_boxed_slice(),
            output_len: 0,
            started: Instant::now(),
            timeout,
            write_state: if has_body { WriteState::Idle } else { WriteState::Done },
            read_state: ReadState::Idle,
            exit: None,
            timed_out: false,
            released: false,
            registry: None,
        };
        // On error `process` is dropped here, which kills and reaps the child.
        if let Some(stdin) = &process.stdin {
            stdin.set_nonblocking(true)?;
        }
        if let Some(stdout) = &process.stdout {
            stdout.set_nonblocking(true)?;
        }
        Ok(process)
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn write_state(&self) -> WriteState {
        self.write_state
    }

    pub fn read_state(&self) -> ReadState {
        self.read_state
    }

    pub fn output_len(&self) -> usize {
        self.output_len
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Watches both pipes under `token` so pipe readiness wakes the owner.
    pub fn register(&mut self, registry: Rc<Registry>, token: Token) -> io::Result<()> {
        if let Some(stdin) = self.stdin.as_mut() {
            registry.register(stdin, token, Interest::WRITABLE)?;
        }
        if let Some(stdout) = self.stdout.as_mut() {
            registry.register(stdout, token, Interest::READABLE)?;
        }
        self.registry = Some(registry);
        Ok(())
    }

    /// Writes the next slice of `body` to the child's stdin. Once everything
    /// is written the pipe is closed so the child sees EOF.
    pub fn write_chunk(&mut self, body: &[u8]) -> WriteOutcome {
        match self.write_state {
            WriteState::Done => return WriteOutcome::Complete,
            WriteState::Error => return WriteOutcome::Error,
            WriteState::Idle | WriteState::Writing => {}
        }
        if self.written >= body.len() {
            self.close_stdin();
            self.write_state = WriteState::Done;
            return WriteOutcome::Complete;
        }
        let Some(stdin) = self.stdin.as_mut() else {
            self.write_state = WriteState::Error;
            return WriteOutcome::Error;
        };

        self.write_state = WriteState::Writing;
        match stdin.write(&body[self.written..]) {
            Ok(0) => {
                self.write_state = WriteState::Error;
                WriteOutcome::Error
            }
            Ok(n) => {
                self.written += n;
                if self.written == body.len() {
                    self.close_stdin();
                    self.write_state = WriteState::Done;
                    WriteOutcome::Complete
                } else {
                    WriteOutcome::Progress(n)
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => WriteOutcome::WouldBlock,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => WriteOutcome::Progress(0),
            Err(e) => {
                warn!("write to cgi process {} failed: {}", self.child.id(), e);
                self.close_stdin();
                self.write_state = WriteState::Error;
                WriteOutcome::Error
            }
        }
    }

    /// Reads whatever the child has written so far. `Complete` means EOF.
    pub fn read_chunk(&mut self) -> ReadOutcome<'_> {
        match self.read_state {
            ReadState::Done => return ReadOutcome::Complete,
            ReadState::Error => return ReadOutcome::Error,
            ReadState::Idle | ReadState::Reading => {}
        }
        let result = match self.stdout.as_mut() {
            Some(stdout) => stdout.read(&mut self.read_buf),
            None => {
                self.read_state = ReadState::Error;
                return ReadOutcome::Error;
            }
        };

        self.read_state = ReadState::Reading;
        match result {
            Ok(0) => {
                self.close_stdout();
                self.read_state = ReadState::Done;
                ReadOutcome::Complete
            }
            Ok(n) => {
                self.output_len += n;
                ReadOutcome::Progress(&self.read_buf[..n])
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::Progress(&[]),
            Err(e) => {
                warn!("read from cgi process {} failed: {}", self.child.id(), e);
                self.close_stdout();
                self.read_state = ReadState::Error;
                ReadOutcome::Error
            }
        }
    }

    /// Non-blocking status check. Past the timeout the child is killed and
    /// reaped, and both channels are put into `Error`.
    pub fn poll(&mut self) -> ProcessStatus {
        if self.timed_out {
            return ProcessStatus::TimedOut;
        }
        if let Some(status) = self.exit {
            return exit_to_status(status);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                return exit_to_status(status);
            }
            Ok(None) => {}
            Err(e) => warn!("cannot query cgi process {}: {}", self.child.id(), e),
        }

        if self.started.elapsed() < self.timeout {
            return ProcessStatus::Running;
        }
        warn!(
            "cgi process {} exceeded {:?}, terminating",
            self.child.id(),
            self.timeout
        );
        self.terminate();
        self.timed_out = true;
        self.close_stdin();
        self.close_stdout();
        self.write_state = WriteState::Error;
        self.read_state = ReadState::Error;
        ProcessStatus::TimedOut
    }

    /// True when the child could not run its program: the interpreter (or
    /// shell) exited with 127 and produced nothing.
    pub fn exec_failed(&self) -> bool {
        self.output_len == 0
            && self
                .exit
                .and_then(|s| s.code())
                .is_some_and(|code| code == EXEC_FAILURE_CODE)
    }

    /// Closes any open pipe and reaps the child. Safe to call repeatedly; only
    /// the first call does anything.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.close_stdin();
        self.close_stdout();
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.exit = Some(status),
                _ => self.terminate(),
            }
        }
        self.registry = None;
        debug!("released cgi process {} ({:?})", self.child.id(), self.exit);
    }

    fn terminate(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("kill cgi process {}: {}", self.child.id(), e);
        }
        match self.child.wait() {
            Ok(status) => self.exit = Some(status),
            Err(e) => warn!("cannot reap cgi process {}: {}", self.child.id(), e),
        }
    }

    fn close_stdin(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            if let Some(registry) = &self.registry {
                let _ = registry.deregister(&mut stdin);
            }
        }
    }

    fn close_stdout(&mut self) {
        if let Some(mut stdout) = self.stdout.take() {
            if let Some(registry) = &self.registry {
                let _ = registry.deregister(&mut stdout);
            }
        }
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        self.release();
    }
}

fn exit_to_status(status: ExitStatus) -> ProcessStatus {
    if status.success() {
        ProcessStatus::ExitedNormally
    } else {
        ProcessStatus::ExitedAbnormally(status)
    }
}

fn check_script(script: &Path) -> Result<PathBuf, CgiError> {
    let path_error = || CgiError::Path(script.to_path_buf());
    let script = fs::canonicalize(script).map_err(|_| path_error())?;
    let meta = fs::metadata(&script).map_err(|_| path_error())?;
    if !meta.is_file() || meta.permissions().mode() & 0o100 == 0 {
        return Err(path_error());
    }
    Ok(script)
}

fn check_interpreter(interpreter: &Path) -> Result<(), CgiError> {
    let meta = fs::metadata(interpreter).map_err(|_| CgiError::Path(interpreter.to_path_buf()))?;
    if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
        return Err(CgiError::Path(interpreter.to_path_buf()));
    }
    Ok(())
}
