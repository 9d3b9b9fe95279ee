//! Queued, non-blocking pipe over sockets, child processes and PTYs.
//!
//! A [`Pipe`] owns one bidirectional byte stream and pumps it from a single
//! task: reads are delivered as [`PipeEvent::Read`] chunks, writes are
//! queued and flushed as the peer accepts them. When the pipe is backed by
//! a child process the final [`PipeEvent::Closed`] is gated on *both* the
//! stream draining and the child being reaped, and carries the exit status.
//!
//! Construction never fails synchronously. Connect and spawn errors are
//! reported through a deferred `Closed` event so the caller always observes
//! the pipe through its event stream.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use nix::pty::Winsize;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Problem;
use crate::flow::{BacklogGauge, PressureSet, PressureValve, QUEUE_PRESSURE};

/// How much to pull off the descriptor per read.
pub const READ_CHUNK: usize = 1024;

nix::ioctl_write_ptr_bad!(ioctl_set_winsize, libc::TIOCSWINSZ, Winsize);
nix::ioctl_write_int_bad!(ioctl_set_ctty, libc::TIOCSCTTY);

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitInfo {
    /// Normal exit with this status; `-1` for opaque non-exit statuses.
    Status(i32),
    /// Killed by a signal, named without the `SIG` prefix ("TERM", "KILL").
    Signal(&'static str),
}

/// Events delivered by a pipe, in order. `Closed` is always last and always
/// delivered exactly once.
#[derive(Debug)]
pub enum PipeEvent {
    /// A chunk of input. `eof` is set on the final (possibly empty) read.
    Read { data: Bytes, eof: bool },
    /// The pipe is done. For process pipes this fires only after the child
    /// has been reaped; `exit` describes how it went. `stderr` carries
    /// captured stderr output when [`StderrMode::Capture`] was requested.
    Closed {
        problem: Option<Problem>,
        exit: Option<ExitInfo>,
        stderr: Option<String>,
    },
}

/// Where a spawned child's stderr goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StderrMode {
    /// Inherit the parent's stderr.
    #[default]
    Inherit,
    /// Merge into the stdout pipe.
    ToStdout,
    /// Discard.
    Ignore,
    /// Buffer in memory and deliver with the close event.
    Capture,
}

/// Terminal dimensions for PTY pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl WindowSize {
    /// Clamp arbitrary (possibly JSON-sourced) numbers into the u16 range.
    pub fn clamped(rows: i64, cols: i64) -> Self {
        Self {
            rows: rows.clamp(0, u16::MAX as i64) as u16,
            cols: cols.clamp(0, u16::MAX as i64) as u16,
        }
    }

    fn to_winsize(self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

/// Map a waitpid status to the exit info exposed on channel close.
pub fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        ExitInfo::Status(code)
    } else if let Some(signo) = status.signal() {
        ExitInfo::Signal(signal_name(signo))
    } else {
        ExitInfo::Status(-1)
    }
}

/// Symbolic name of a signal number, without the `SIG` prefix.
pub fn signal_name(signo: i32) -> &'static str {
    match Signal::try_from(signo) {
        Ok(signal) => {
            let name = signal.as_str();
            name.strip_prefix("SIG").unwrap_or(name)
        }
        Err(_) => "UNKNOWN",
    }
}

enum PipeCommand {
    Write(Bytes),
    Close { problem: Option<Problem> },
    Window(WindowSize),
    Throttle(PressureValve),
}

/// Cloneable control surface of a pipe: writes, close, window, throttling.
#[derive(Clone)]
pub struct PipeHandle {
    name: String,
    is_process: bool,
    commands: mpsc::UnboundedSender<PipeCommand>,
    gauge: BacklogGauge,
}

impl PipeHandle {
    /// Queue data for writing. Never blocks; the backlog gauge raises
    /// pressure when the queue grows past the high-water mark.
    pub fn write(&self, data: Bytes) {
        self.gauge.add(data.len());
        if self.commands.send(PipeCommand::Write(data)).is_err() {
            debug!("{}: write after pump exit, dropped", self.name);
        }
    }

    /// Close the pipe. With a problem, I/O stops immediately (a live child
    /// is sent SIGTERM and still reaped). Without one, queued output is
    /// flushed, the write side is half-closed and reading continues to EOF.
    pub fn close(&self, problem: Option<Problem>) {
        let _ = self.commands.send(PipeCommand::Close { problem });
    }

    /// Update the PTY window size. Ignored for non-PTY pipes.
    pub fn set_window(&self, window: WindowSize) {
        let _ = self.commands.send(PipeCommand::Window(window));
    }

    /// Pause reads while `valve` is engaged.
    pub fn throttle(&self, valve: PressureValve) {
        let _ = self.commands.send(PipeCommand::Throttle(valve));
    }

    /// Valve observing this pipe's write backlog.
    pub fn backlog_valve(&self) -> PressureValve {
        self.gauge.valve()
    }

    pub fn is_process(&self) -> bool {
        self.is_process
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A pumped byte stream; see the module docs.
pub struct Pipe {
    handle: PipeHandle,
    events: Option<mpsc::UnboundedReceiver<PipeEvent>>,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The prepared endpoints handed to the pump.
struct Endpoints {
    reader: Option<BoxedReader>,
    writer: Option<BoxedWriter>,
    child: Option<Child>,
    stderr_task: Option<JoinHandle<Vec<u8>>>,
    /// Extra dup of the PTY master for window-size ioctls.
    window_fd: Option<OwnedFd>,
}

impl Endpoints {
    fn plain(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: Some(reader),
            writer: Some(writer),
            child: None,
            stderr_task: None,
            window_fd: None,
        }
    }
}

enum Setup {
    Ready(Endpoints),
    /// Connect happens inside the pump so failures arrive as events.
    Connect(PathBuf),
    /// Spawn or PTY setup failed; report the problem from the pump.
    Failed(Problem),
}

impl Pipe {
    /// Connect to a UNIX socket. The returned pipe is usable right away;
    /// connection failure arrives later as a `Closed` event.
    pub fn connect(path: impl Into<PathBuf>) -> Pipe {
        let path = path.into();
        let name = path.display().to_string();
        Pipe::start(name, false, Setup::Connect(path))
    }

    /// Spawn `argv` with stdin/stdout wired to the pipe.
    ///
    /// `env` entries are `KEY=VALUE` additions on top of the inherited
    /// environment. Spawn failure arrives as a deferred `Closed` event.
    pub fn spawn(
        argv: &[String],
        env: &[String],
        directory: Option<&str>,
        stderr: StderrMode,
    ) -> Pipe {
        let name = argv.first().cloned().unwrap_or_default();
        let setup = match prepare_spawn(argv, env, directory, stderr) {
            Ok(endpoints) => Setup::Ready(endpoints),
            Err(problem) => Setup::Failed(problem),
        };
        Pipe::start(name, true, setup)
    }

    /// Spawn `argv` on a freshly allocated pseudo-terminal.
    pub fn pty(
        argv: &[String],
        env: &[String],
        directory: Option<&str>,
        window: WindowSize,
    ) -> Pipe {
        let name = argv.first().cloned().unwrap_or_default();
        let setup = match prepare_pty(argv, env, directory, window) {
            Ok(endpoints) => Setup::Ready(endpoints),
            Err(problem) => Setup::Failed(problem),
        };
        Pipe::start(name, true, setup)
    }

    /// A pipe over this process's stdin and stdout.
    pub fn stdio() -> Pipe {
        let endpoints = Endpoints::plain(Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()));
        Pipe::start("stdio".to_string(), false, Setup::Ready(endpoints))
    }

    /// Wrap an already-connected stream (tests, socketpair transports).
    pub fn from_unix_stream(name: impl Into<String>, stream: UnixStream) -> Pipe {
        let (read_half, write_half) = stream.into_split();
        let endpoints = Endpoints::plain(Box::new(read_half), Box::new(write_half));
        Pipe::start(name.into(), false, Setup::Ready(endpoints))
    }

    fn start(name: String, is_process: bool, setup: Setup) -> Pipe {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let gauge = BacklogGauge::new(QUEUE_PRESSURE);
        let handle = PipeHandle {
            name: name.clone(),
            is_process,
            commands: command_tx,
            gauge: gauge.clone(),
        };
        tokio::spawn(async move {
            let pump = Pump {
                name,
                commands: command_rx,
                events: event_tx,
                gauge,
                throttle: PressureSet::new(),
                out_queue: VecDeque::new(),
                closing: false,
                problem: None,
            };
            pump.run(setup).await;
        });
        Pipe {
            handle,
            events: Some(event_rx),
        }
    }

    /// Take the event stream. Yields `None` after `Closed` has been
    /// delivered. Can only be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PipeEvent>> {
        self.events.take()
    }

    pub fn handle(&self) -> PipeHandle {
        self.handle.clone()
    }

    pub fn write(&self, data: Bytes) {
        self.handle.write(data);
    }

    pub fn close(&self, problem: Option<Problem>) {
        self.handle.close(problem);
    }

    pub fn set_window(&self, window: WindowSize) {
        self.handle.set_window(window);
    }

    pub fn throttle(&self, valve: PressureValve) {
        self.handle.throttle(valve);
    }

    pub fn backlog_valve(&self) -> PressureValve {
        self.handle.backlog_valve()
    }

    pub fn is_process(&self) -> bool {
        self.handle.is_process
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }
}

struct Pump {
    name: String,
    commands: mpsc::UnboundedReceiver<PipeCommand>,
    events: mpsc::UnboundedSender<PipeEvent>,
    gauge: BacklogGauge,
    throttle: PressureSet,
    out_queue: VecDeque<Bytes>,
    closing: bool,
    problem: Option<Problem>,
}

impl Pump {
    async fn run(mut self, setup: Setup) {
        let endpoints = match setup {
            Setup::Ready(endpoints) => endpoints,
            Setup::Failed(problem) => {
                self.finish(Some(problem), None, None);
                return;
            }
            Setup::Connect(path) => match UnixStream::connect(&path).await {
                Ok(stream) => {
                    let (read_half, write_half) = stream.into_split();
                    Endpoints::plain(Box::new(read_half), Box::new(write_half))
                }
                Err(err) => {
                    let problem = Problem::from_connect_error(&err);
                    warn!("{}: couldn't connect: {}", self.name, err);
                    self.finish(Some(problem), None, None);
                    return;
                }
            },
        };

        let Endpoints {
            mut reader,
            mut writer,
            mut child,
            stderr_task,
            window_fd,
        } = endpoints;

        let mut exit: Option<ExitInfo> = None;

        loop {
            if self.problem.is_some() {
                // Abort: stop I/O now, terminate a live child, reap below.
                reader = None;
                writer = None;
                for dropped in self.out_queue.drain(..) {
                    self.gauge.sub(dropped.len());
                }
                if exit.is_none() {
                    if let Some(child) = &child {
                        terminate(&self.name, child);
                    }
                }
                break;
            }

            // Flushed and closing (or EOF seen): half-close the write side.
            if self.out_queue.is_empty() && self.closing {
                if let Some(mut done) = writer.take() {
                    debug!("{}: end of output", self.name);
                    let _ = done.shutdown().await;
                }
            }

            // Input and output both done.
            if reader.is_none() && self.out_queue.is_empty() {
                break;
            }

            let throttled = self.throttle.engaged();
            let can_write = writer.is_some() && !self.out_queue.is_empty();
            let can_read = reader.is_some() && !throttled;
            let wait_throttle = reader.is_some() && throttled;
            let reaping = child.is_some() && exit.is_none();
            let throttle = self.throttle.clone();

            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.apply(command, &mut writer, window_fd.as_ref()),
                        None => {
                            // Every handle dropped: dispose semantics.
                            self.problem = Some(Problem::Terminated);
                        }
                    }
                }

                result = write_front(&mut writer, &mut self.out_queue), if can_write => {
                    match result {
                        Ok(written) => {
                            self.gauge.sub(written);
                            if let Some(front) = self.out_queue.front_mut() {
                                front.advance(written);
                                if front.is_empty() {
                                    self.out_queue.pop_front();
                                }
                            }
                        }
                        Err(err) => {
                            warn!("{}: couldn't write: {}", self.name, err);
                            self.problem = Some(Problem::InternalError);
                        }
                    }
                }

                status = wait_child(&mut child), if reaping => {
                    exit = Some(status);
                }

                result = read_chunk(&mut reader), if can_read => {
                    match result {
                        Ok(data) => {
                            let eof = data.is_empty();
                            if eof {
                                debug!("{}: end of input", self.name);
                                reader = None;
                            }
                            // A dropped listener is fine; keep draining quietly.
                            let _ = self.events.send(PipeEvent::Read { data, eof });
                        }
                        Err(err) => {
                            warn!("{}: couldn't read: {}", self.name, err);
                            self.problem = Some(Problem::InternalError);
                        }
                    }
                }

                _ = throttle.wait_released(), if wait_throttle => {}
            }
        }

        // Gate the final close on child reap.
        if exit.is_none() {
            if let Some(child) = &mut child {
                match child.wait().await {
                    Ok(status) => exit = Some(exit_info(status)),
                    Err(err) => warn!("{}: couldn't wait for child: {}", self.name, err),
                }
            }
        }

        let stderr = match stderr_task {
            Some(task) => task.await.ok().and_then(|buffer| {
                if buffer.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(&buffer).into_owned())
                }
            }),
            None => None,
        };

        let exit = if child.is_some() { exit } else { None };
        let problem = self.problem;
        self.finish(problem, exit, stderr);
    }

    fn apply(
        &mut self,
        command: PipeCommand,
        writer: &mut Option<BoxedWriter>,
        window_fd: Option<&OwnedFd>,
    ) {
        match command {
            PipeCommand::Write(data) => {
                if self.closing || writer.is_none() {
                    debug!("{}: dropping message on closing pipe", self.name);
                    self.gauge.sub(data.len());
                } else {
                    self.out_queue.push_back(data);
                }
            }
            PipeCommand::Close { problem } => {
                self.closing = true;
                if problem.is_some() {
                    self.problem = problem;
                }
            }
            PipeCommand::Window(window) => {
                if let Some(fd) = window_fd {
                    let size = window.to_winsize();
                    if let Err(err) = unsafe { ioctl_set_winsize(fd.as_raw_fd(), &size) } {
                        warn!("{}: cannot set terminal size: {}", self.name, err);
                    }
                }
            }
            PipeCommand::Throttle(valve) => {
                self.throttle.insert(valve);
            }
        }
    }

    fn finish(
        &mut self,
        problem: Option<Problem>,
        exit: Option<ExitInfo>,
        stderr: Option<String>,
    ) {
        debug!(
            "{}: closed{}{}",
            self.name,
            if problem.is_some() { ": " } else { "" },
            problem.map(|p| p.as_str()).unwrap_or("")
        );
        let _ = self.events.send(PipeEvent::Closed {
            problem,
            exit,
            stderr,
        });
    }
}

async fn read_chunk(reader: &mut Option<BoxedReader>) -> io::Result<Bytes> {
    let reader = reader.as_mut().expect("guarded by select");
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    reader.read_buf(&mut buffer).await?;
    Ok(buffer.freeze())
}

async fn write_front(
    writer: &mut Option<BoxedWriter>,
    out_queue: &mut VecDeque<Bytes>,
) -> io::Result<usize> {
    let writer = writer.as_mut().expect("guarded by select");
    let front = out_queue.front().expect("guarded by select");
    writer.write(&front[..]).await
}

async fn wait_child(child: &mut Option<Child>) -> ExitInfo {
    let child = child.as_mut().expect("guarded by select");
    match child.wait().await {
        Ok(status) => exit_info(status),
        Err(_) => ExitInfo::Status(-1),
    }
}

fn terminate(name: &str, child: &Child) {
    if let Some(pid) = child.id() {
        debug!("{}: terminating child: {}", name, pid);
        let _ = nix::sys::signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

fn prepare_command(argv: &[String], env: &[String], directory: Option<&str>) -> Command {
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    for entry in env {
        if let Some((key, value)) = entry.split_once('=') {
            command.env(key, value);
        }
    }
    if let Some(directory) = directory {
        command.current_dir(directory);
    }
    command
}

fn prepare_spawn(
    argv: &[String],
    env: &[String],
    directory: Option<&str>,
    stderr: StderrMode,
) -> Result<Endpoints, Problem> {
    if argv.is_empty() {
        return Err(Problem::NotFound);
    }

    let mut command = prepare_command(argv, env, directory);
    command.stdin(Stdio::piped());

    // With merged stderr both child fds point at one pipe we read from.
    let merged_reader = match stderr {
        StderrMode::ToStdout => {
            let (read_end, write_end) = nix::unistd::pipe().map_err(|err| {
                warn!("couldn't create pipe: {}", err);
                Problem::InternalError
            })?;
            let duplicate = write_end.try_clone().map_err(|err| {
                warn!("couldn't dup pipe: {}", err);
                Problem::InternalError
            })?;
            command.stdout(Stdio::from(duplicate));
            command.stderr(Stdio::from(write_end));
            Some(read_end)
        }
        StderrMode::Inherit => {
            command.stdout(Stdio::piped());
            command.stderr(Stdio::inherit());
            None
        }
        StderrMode::Ignore => {
            command.stdout(Stdio::piped());
            command.stderr(Stdio::null());
            None
        }
        StderrMode::Capture => {
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
            None
        }
    };

    let mut child = command.spawn().map_err(|err| {
        let problem = Problem::from_spawn_error(&err);
        warn!("couldn't run {}: {}", argv[0], err);
        problem
    })?;
    debug!("spawned: {}", argv[0]);

    let writer: BoxedWriter = Box::new(child.stdin.take().expect("stdin was piped"));
    let reader: BoxedReader = match merged_reader {
        Some(fd) => Box::new(FdStream::new(fd, false).map_err(|err| {
            warn!("couldn't watch pipe: {}", err);
            Problem::InternalError
        })?),
        None => Box::new(child.stdout.take().expect("stdout was piped")),
    };

    let stderr_task = match stderr {
        StderrMode::Capture => {
            let mut pipe = child.stderr.take().expect("stderr was piped");
            Some(tokio::spawn(async move {
                let mut buffer = Vec::new();
                let _ = pipe.read_to_end(&mut buffer).await;
                buffer
            }))
        }
        _ => None,
    };

    Ok(Endpoints {
        reader: Some(reader),
        writer: Some(writer),
        child: Some(child),
        stderr_task,
        window_fd: None,
    })
}

fn prepare_pty(
    argv: &[String],
    env: &[String],
    directory: Option<&str>,
    window: WindowSize,
) -> Result<Endpoints, Problem> {
    if argv.is_empty() {
        return Err(Problem::NotFound);
    }

    let size = window.to_winsize();
    let pty = nix::pty::openpty(Some(&size), None).map_err(|err| {
        warn!("couldn't allocate pty: {}", err);
        Problem::InternalError
    })?;

    let mut command = prepare_command(argv, env, directory);
    let dup = |fd: &OwnedFd| {
        fd.try_clone().map_err(|err| {
            warn!("couldn't dup pty fd: {}", err);
            Problem::InternalError
        })
    };
    command.stdin(Stdio::from(dup(&pty.slave)?));
    command.stdout(Stdio::from(dup(&pty.slave)?));
    command.stderr(Stdio::from(pty.slave));
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(io::Error::from)?;
            // Stdin is the pty slave; make it the controlling terminal.
            ioctl_set_ctty(0, 0).map_err(io::Error::from)?;
            Ok(())
        })
    };

    let child = command.spawn().map_err(|err| {
        let problem = Problem::from_spawn_error(&err);
        warn!("couldn't run {}: {}", argv[0], err);
        problem
    })?;
    debug!("spawned pty: {}", argv[0]);

    let window_fd = dup(&pty.master)?;
    let write_fd = dup(&pty.master)?;
    // Reads on a pty master fail with EIO once the slave side is gone;
    // that is this device's way of saying EOF.
    let reader: BoxedReader = Box::new(FdStream::new(pty.master, true).map_err(|err| {
        warn!("couldn't watch pty: {}", err);
        Problem::InternalError
    })?);
    let writer: BoxedWriter = Box::new(FdStream::new(write_fd, true).map_err(|err| {
        warn!("couldn't watch pty: {}", err);
        Problem::InternalError
    })?);

    Ok(Endpoints {
        reader: Some(reader),
        writer: Some(writer),
        child: Some(child),
        stderr_task: None,
        window_fd: Some(window_fd),
    })
}

/// Readiness-driven stream over a raw descriptor (pty master, plain pipe).
struct FdStream {
    fd: AsyncFd<OwnedFd>,
    eio_is_eof: bool,
}

impl FdStream {
    fn new(fd: OwnedFd, eio_is_eof: bool) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
            eio_is_eof,
        })
    }
}

fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl AsyncRead for FdStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = match this.fd.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            };
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        unfilled.as_mut_ptr() as *mut libc::c_void,
                        unfilled.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => {
                    if this.eio_is_eof && err.raw_os_error() == Some(libc::EIO) {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(err));
                }
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for FdStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = match this.fd.poll_write_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            };
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.get_ref().as_raw_fd(),
                        data.as_ptr() as *const libc::c_void,
                        data.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_size_clamps() {
        let window = WindowSize::clamped(-5, 1_000_000);
        assert_eq!(window.rows, 0);
        assert_eq!(window.cols, u16::MAX);
        let window = WindowSize::clamped(1234, 4567);
        assert_eq!(window.rows, 1234);
        assert_eq!(window.cols, 4567);
    }

    #[test]
    fn signal_names_drop_prefix() {
        assert_eq!(signal_name(libc::SIGTERM), "TERM");
        assert_eq!(signal_name(libc::SIGKILL), "KILL");
        assert_eq!(signal_name(libc::SIGHUP), "HUP");
    }

    #[test]
    fn default_window_is_vt100ish() {
        let window = WindowSize::default();
        assert_eq!((window.rows, window.cols), (24, 80));
    }
}
