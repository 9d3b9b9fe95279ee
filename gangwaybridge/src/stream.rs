//! The `stream` and `text-stream` channel payloads.
//!
//! Glue between a [`Pipe`] (socket connection, spawned process or PTY) and
//! a channel: bytes read from the pipe go out as data frames, inbound data
//! frames are written to the pipe. The `text-stream` variant scrubs both
//! directions to valid UTF-8, replacing offending bytes with U+FFFD.
//!
//! Channel options at open (and later via `options` control messages):
//!
//! - `unix`: socket path to connect to, or
//! - `spawn`: argv to execute (mutually exclusive with `unix`)
//! - `environ`, `directory`, `pty`, `err` ("out" | "ignore" | "message"),
//!   `window` ({rows, cols}), `batch`, `latency`

use bytes::{Bytes, BytesMut};
use tracing::warn;

use gangwaywire::error::Problem;
use gangwaywire::pipe::{ExitInfo, Pipe, PipeHandle, StderrMode, WindowSize};

use crate::channel::{Channel, ChannelCore, ChannelEvent};
use crate::protocol::ControlMessage;

/// Batch latency applied when `batch` is set but `latency` is not.
const DEFAULT_LATENCY_MS: i64 = 75;

pub struct StreamChannel {
    /// Scrub traffic to UTF-8 (`text-stream`).
    text: bool,
    pipe: Option<PipeHandle>,
    open: bool,
    closing: bool,
    pty: bool,
    batch: i64,
    latency: i64,
    /// Data read from the pipe, held back while batching.
    accumulated: BytesMut,
    timer_scheduled: bool,
}

impl StreamChannel {
    /// The binary `stream` payload.
    pub fn binary() -> Box<dyn Channel> {
        Box::new(Self::new(false))
    }

    /// The UTF-8-enforcing `text-stream` payload.
    pub fn text() -> Box<dyn Channel> {
        Box::new(Self::new(true))
    }

    fn new(text: bool) -> Self {
        Self {
            text,
            pipe: None,
            open: false,
            closing: false,
            pty: false,
            batch: 0,
            latency: DEFAULT_LATENCY_MS,
            accumulated: BytesMut::new(),
            timer_scheduled: false,
        }
    }

    /// Apply `batch`, `latency` and `window` settings from an open or
    /// `options` message. Returns false after scheduling an error close.
    fn apply_options(&mut self, core: &mut ChannelCore, message: &ControlMessage) -> bool {
        match message.int_field("batch") {
            Ok(Some(batch)) => self.batch = batch,
            Ok(None) => {}
            Err(_) => {
                core.fail(
                    Problem::ProtocolError,
                    "invalid \"batch\" option for stream channel",
                );
                return false;
            }
        }
        match message.int_field("latency") {
            Ok(Some(latency)) if latency >= 0 => self.latency = latency,
            Ok(None) => {}
            _ => {
                core.fail(
                    Problem::ProtocolError,
                    "invalid \"latency\" option for stream channel",
                );
                return false;
            }
        }

        // Window changes only make sense once a pty is up.
        if self.pty {
            if let Some(pipe) = &self.pipe {
                match window_option(message, 0, 0) {
                    Some(window) if window.rows > 0 && window.cols > 0 => {
                        pipe.set_window(window);
                    }
                    Some(_) => {}
                    None => warn!(
                        "{}: invalid \"window.rows\" or \"window.cols\" option for stream channel",
                        core.id()
                    ),
                }
            }
        }
        true
    }

    /// Forward accumulated pipe data to the peer.
    fn flush(&mut self, core: &mut ChannelCore) {
        if !self.accumulated.is_empty() {
            let data = self.accumulated.split().freeze();
            let data = if self.text { force_utf8(data) } else { data };
            core.send(data);
        }
    }
}

impl Channel for StreamChannel {
    fn prepare(&mut self, core: &mut ChannelCore) {
        let options = core.options().clone();

        let spawn = match options.strv_field("spawn") {
            Ok(spawn) => spawn,
            Err(_) => {
                core.fail(
                    Problem::ProtocolError,
                    "invalid \"spawn\" option for stream channel",
                );
                return;
            }
        };
        let unix = match options.str_field("unix") {
            Ok(unix) => unix,
            Err(_) => {
                core.fail(
                    Problem::ProtocolError,
                    "invalid \"unix\" option for stream channel",
                );
                return;
            }
        };

        // Options in the open message count too.
        if !self.apply_options(core, &options) {
            return;
        }

        let mut pipe = match (spawn, unix) {
            (Some(argv), None) => {
                if argv.is_empty() {
                    core.fail(
                        Problem::ProtocolError,
                        "\"spawn\" array must not be empty",
                    );
                    return;
                }
                match self.prepare_spawn(core, &options, argv) {
                    Some(pipe) => pipe,
                    None => return,
                }
            }
            (None, Some(path)) => Pipe::connect(path),
            (Some(_), Some(_)) => {
                core.fail(
                    Problem::ProtocolError,
                    "received both a unix and spawn option",
                );
                return;
            }
            (None, None) => {
                core.fail(
                    Problem::ProtocolError,
                    "did not receive a unix or spawn option",
                );
                return;
            }
        };

        // A full transport queue pauses the pipe; a full pipe queue pauses
        // the transport. Slow consumers throttle fast producers both ways.
        pipe.throttle(core.transport_backlog_valve());
        core.throttle_transport(pipe.backlog_valve());

        core.forward_pipe_events(pipe.take_events().expect("fresh pipe"));
        self.pipe = Some(pipe.handle());
        self.open = true;
        core.ready();
    }

    fn recv(&mut self, _core: &mut ChannelCore, data: Bytes) {
        // Data after `done` would race the half-close; drop it.
        if self.open && !self.closing {
            let data = if self.text { force_utf8(data) } else { data };
            if let Some(pipe) = &self.pipe {
                pipe.write(data);
            }
        }
    }

    fn control(&mut self, core: &mut ChannelCore, command: &str, message: &ControlMessage) -> bool {
        match command {
            "options" => {
                if self.apply_options(core, message) {
                    self.flush(core);
                }
                true
            }
            "done" => {
                // Peer input is finished: flush, then half-close the pipe's
                // write side and keep reading until the process is done.
                self.closing = true;
                self.flush(core);
                if self.open {
                    if let Some(pipe) = &self.pipe {
                        pipe.close(None);
                    }
                }
                true
            }
            _ => false,
        }
    }

    fn on_event(&mut self, core: &mut ChannelCore, event: ChannelEvent) {
        match event {
            ChannelEvent::PipeRead { data, eof } => {
                let held = self.accumulated.len() + data.len();
                self.accumulated.extend_from_slice(&data);
                if !eof && self.batch > 0 && (held as i64) < self.batch {
                    // Coalesce small reads for up to `latency` ms.
                    if !self.timer_scheduled {
                        self.timer_scheduled = true;
                        core.pump_after(self.latency as u64);
                    }
                } else {
                    self.flush(core);
                }

                if eof {
                    if let Some(pipe) = &self.pipe {
                        if self.open {
                            pipe.close(None);
                        }
                    }
                }
            }
            ChannelEvent::Pump => {
                self.timer_scheduled = false;
                self.flush(core);
            }
            ChannelEvent::PipeClosed {
                problem,
                exit,
                stderr,
            } => {
                self.flush(core);
                self.open = false;

                let options = core.close_options_mut();
                match exit {
                    Some(ExitInfo::Status(status)) => {
                        options.insert("exit-status".to_string(), status.into());
                    }
                    Some(ExitInfo::Signal(signal)) => {
                        options.insert("exit-signal".to_string(), signal.into());
                    }
                    None => {}
                }
                if let Some(stderr) = stderr {
                    options.insert("message".to_string(), stderr.into());
                }

                if problem.is_none() {
                    core.send_done();
                }
                core.close(problem);
            }
            _ => {}
        }
    }

    fn close(&mut self, _core: &mut ChannelCore, problem: Option<Problem>) {
        // Closed from outside (peer close, transport gone) while the pipe
        // is still up: tear the pipe down hard so a child doesn't linger.
        if self.open {
            if let Some(pipe) = &self.pipe {
                pipe.close(Some(problem.unwrap_or(Problem::Terminated)));
            }
            self.open = false;
        }
    }
}

impl StreamChannel {
    fn prepare_spawn(
        &mut self,
        core: &mut ChannelCore,
        options: &ControlMessage,
        argv: Vec<String>,
    ) -> Option<Pipe> {
        let environ = match options.strv_field("environ") {
            Ok(environ) => environ.unwrap_or_default(),
            Err(_) => {
                core.fail(
                    Problem::ProtocolError,
                    "invalid \"environ\" option for stream channel",
                );
                return None;
            }
        };
        let directory = match options.str_field("directory") {
            Ok(directory) => directory,
            Err(_) => {
                core.fail(
                    Problem::ProtocolError,
                    "invalid \"directory\" option for stream channel",
                );
                return None;
            }
        };
        let pty = match options.bool_field("pty") {
            Ok(pty) => pty.unwrap_or(false),
            Err(_) => {
                core.fail(
                    Problem::ProtocolError,
                    "invalid \"pty\" option for stream channel",
                );
                return None;
            }
        };

        if pty {
            self.pty = true;
            let window = window_option(options, 24, 80).unwrap_or_else(|| {
                warn!(
                    "{}: invalid \"window.rows\" or \"window.cols\" option for stream channel",
                    core.id()
                );
                WindowSize::default()
            });
            Some(Pipe::pty(&argv, &environ, directory, window))
        } else {
            let stderr = match options.str_field("err") {
                Ok(err) => match err {
                    Some("out") => StderrMode::ToStdout,
                    Some("ignore") => StderrMode::Ignore,
                    Some("message") => StderrMode::Capture,
                    _ => StderrMode::Inherit,
                },
                Err(_) => {
                    core.fail(
                        Problem::ProtocolError,
                        "invalid \"err\" option for stream channel",
                    );
                    return None;
                }
            };
            Some(Pipe::spawn(&argv, &environ, directory, stderr))
        }
    }
}

/// Read `window: {rows, cols}` from a message. `None` on invalid types;
/// absent members fall back to the defaults.
fn window_option(message: &ControlMessage, default_rows: u16, default_cols: u16) -> Option<WindowSize> {
    let window = match message.object_field("window") {
        Ok(Some(window)) => window.clone(),
        Ok(None) => {
            return Some(WindowSize {
                rows: default_rows,
                cols: default_cols,
            })
        }
        Err(_) => return None,
    };

    let rows = match window.get("rows") {
        None => default_rows as i64,
        Some(value) => value.as_i64()?,
    };
    let cols = match window.get("cols") {
        None => default_cols as i64,
        Some(value) => value.as_i64()?,
    };
    Some(WindowSize::clamped(rows, cols))
}

/// Position and width of the first offending byte run in `data`, or `None`
/// when the whole slice is clean. An embedded NUL counts as an offence:
/// `std::str::from_utf8` accepts it, this payload type does not.
fn first_offence(data: &[u8]) -> Option<(usize, usize)> {
    match std::str::from_utf8(data) {
        Ok(text) => text.find('\0').map(|position| (position, 1)),
        Err(err) => {
            let valid = err.valid_up_to();
            if let Some(position) = data[..valid].iter().position(|&b| b == 0) {
                return Some((position, 1));
            }
            // A truncated sequence at the end swallows the rest.
            Some((valid, err.error_len().unwrap_or(data.len() - valid)))
        }
    }
}

/// Force data to valid UTF-8, replacing each offending byte run (invalid
/// sequences and NUL bytes alike) with one U+FFFD. Clean input passes
/// through untouched.
pub fn force_utf8(data: Bytes) -> Bytes {
    const REPLACEMENT: &[u8] = b"\xef\xbf\xbd";

    if first_offence(&data).is_none() {
        return data;
    }

    let mut scrubbed = BytesMut::with_capacity(data.len() + 16);
    let mut rest = &data[..];
    while let Some((valid, skip)) = first_offence(rest) {
        scrubbed.extend_from_slice(&rest[..valid]);
        scrubbed.extend_from_slice(REPLACEMENT);
        rest = &rest[valid + skip..];
    }
    scrubbed.extend_from_slice(rest);
    scrubbed.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_utf8_is_untouched() {
        let data = Bytes::from_static("marmalade präserves".as_bytes());
        assert_eq!(force_utf8(data.clone()), data);
    }

    #[test]
    fn nul_bytes_become_replacement_chars() {
        let data = Bytes::from_static(b"\x00Marmalaade!\x00");
        let clean = force_utf8(data);
        assert_eq!(&clean[..], b"\xef\xbf\xbdMarmalaade!\xef\xbf\xbd");
    }

    #[test]
    fn invalid_sequence_mid_string() {
        let data = Bytes::from_static(b"oo\xfe\xfeoo");
        let clean = force_utf8(data);
        assert_eq!(&clean[..], b"oo\xef\xbf\xbd\xef\xbf\xbdoo");
    }

    #[test]
    fn truncated_sequence_at_end() {
        // A lone leading byte of a two-byte sequence.
        let data = Bytes::from_static(b"ok\xc3");
        let clean = force_utf8(data);
        assert_eq!(&clean[..], b"ok\xef\xbf\xbd");
    }

    #[test]
    fn nul_before_an_invalid_sequence() {
        let data = Bytes::from_static(b"a\x00b\xffc");
        let clean = force_utf8(data);
        assert_eq!(&clean[..], b"a\xef\xbf\xbdb\xef\xbf\xbdc");
    }

    #[test]
    fn empty_chunk_is_a_noop() {
        assert_eq!(force_utf8(Bytes::new()), Bytes::new());
    }

    #[test]
    fn window_defaults_apply() {
        let message = ControlMessage::parse(br#"{"command":"open"}"#).unwrap();
        let window = window_option(&message, 24, 80).unwrap();
        assert_eq!((window.rows, window.cols), (24, 80));
    }

    #[test]
    fn window_values_clamp() {
        let message = ControlMessage::parse(
            br#"{"command":"open","window":{"rows":100000,"cols":-4}}"#,
        )
        .unwrap();
        let window = window_option(&message, 24, 80).unwrap();
        assert_eq!((window.rows, window.cols), (u16::MAX, 0));
    }

    #[test]
    fn window_bad_types_are_rejected() {
        let message =
            ControlMessage::parse(br#"{"command":"open","window":{"rows":"x"}}"#).unwrap();
        assert!(window_option(&message, 24, 80).is_none());
        let message = ControlMessage::parse(br#"{"command":"open","window":7}"#).unwrap();
        assert!(window_option(&message, 24, 80).is_none());
    }
}
