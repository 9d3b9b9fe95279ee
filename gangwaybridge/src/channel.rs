//! Channel machinery shared by every payload implementation.
//!
//! A channel is a logical substream identified by an ASCII-digit id chosen
//! by the opener. The multiplexer owns one [`ChannelCore`] plus one boxed
//! [`Channel`] handler per open channel; handlers run to completion inside
//! the multiplexer loop and never block.
//!
//! Inbound data that arrives before the handler declares itself ready is
//! buffered in the core and replayed in order when [`ChannelCore::ready`]
//! is called. A handler never tears itself down synchronously: close
//! requests go through the multiplexer's internal event queue, so an open
//! that fails immediately still produces an observable event one turn
//! later, and the channel's close frame is the last frame it emits.

use std::collections::VecDeque;

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use gangwaywire::error::Problem;
use gangwaywire::flow::PressureValve;
use gangwaywire::pipe::{ExitInfo, PipeEvent};
use gangwaywire::transport::TransportSender;

use crate::protocol::ControlMessage;

/// Inbound frames buffered before `ready()`; a peer this far ahead of the
/// open handshake is broken.
const PRE_READY_LIMIT: usize = 4096;

/// Asynchronous happenings delivered to a channel through the multiplexer
/// loop, tagged with the channel id.
#[derive(Debug)]
pub enum ChannelEvent {
    PipeRead {
        data: Bytes,
        eof: bool,
    },
    PipeClosed {
        problem: Option<Problem>,
        exit: Option<ExitInfo>,
        stderr: Option<String>,
    },
    /// A cooperative work tick, self-scheduled via [`ChannelCore::pump`].
    Pump,
    /// The handler wants the peer challenged; the multiplexer registers the
    /// cookie and emits the `authorize` control message.
    AuthorizeRequest { cookie: String, challenge: String },
    /// The peer answered an `authorize` challenge.
    AuthorizeResponse { cookie: String, response: String },
    /// Deferred close requested through [`ChannelCore::close`].
    CloseRequest,
}

/// A payload implementation. All methods are invoked from the multiplexer
/// loop and must return without suspending.
pub trait Channel: Send {
    /// Called once right after the channel record is created. May start
    /// asynchronous work, call [`ChannelCore::ready`], or schedule an error
    /// close via [`ChannelCore::fail`].
    fn prepare(&mut self, core: &mut ChannelCore);

    /// One inbound data frame, delivered only after `ready()`.
    fn recv(&mut self, core: &mut ChannelCore, data: Bytes);

    /// A control command addressed to this channel (`done`, `options`,
    /// ...). Return false to leave it to the default handling.
    fn control(&mut self, _core: &mut ChannelCore, _command: &str, _message: &ControlMessage) -> bool {
        false
    }

    /// An internal event scheduled for this channel.
    fn on_event(&mut self, _core: &mut ChannelCore, _event: ChannelEvent) {}

    /// Final teardown. Called exactly once, right before the close frame is
    /// emitted (or after the transport is gone).
    fn close(&mut self, _core: &mut ChannelCore, _problem: Option<Problem>) {}
}

/// Per-channel state owned by the multiplexer: identity, the open options,
/// the pre-ready queue and the outbound helpers handlers use.
pub struct ChannelCore {
    id: String,
    options: ControlMessage,
    transport: TransportSender,
    internal: mpsc::UnboundedSender<(String, ChannelEvent)>,
    ready: bool,
    pending: VecDeque<Bytes>,
    sent_done: bool,
    received_done: bool,
    close_requested: bool,
    close_problem: Option<Problem>,
    close_options: Map<String, Value>,
    authorize_seq: u64,
}

impl ChannelCore {
    pub(crate) fn new(
        id: String,
        options: ControlMessage,
        transport: TransportSender,
        internal: mpsc::UnboundedSender<(String, ChannelEvent)>,
    ) -> Self {
        Self {
            id,
            options,
            transport,
            internal,
            ready: false,
            pending: VecDeque::new(),
            sent_done: false,
            received_done: false,
            close_requested: false,
            close_problem: None,
            close_options: Map::new(),
            authorize_seq: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The JSON options this channel was opened with.
    pub fn options(&self) -> &ControlMessage {
        &self.options
    }

    /// Send a data frame on this channel. Allowed before `ready()`; the
    /// peer has already seen the open and will accept it.
    pub fn send(&self, data: Bytes) {
        self.transport.send(&self.id, data);
    }

    /// Send a control message on channel 0.
    pub fn control_send(&self, message: &ControlMessage) {
        self.transport.send_control(message.to_bytes());
    }

    /// Announce readiness: tell the peer and replay buffered frames (the
    /// multiplexer feeds them through `recv` in arrival order, ahead of
    /// anything that arrives later).
    pub fn ready(&mut self) {
        if !self.ready {
            self.ready = true;
            self.control_send(&ControlMessage::new("ready", Some(&self.id)));
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Tell the peer no more data frames will be sent on this channel.
    pub fn send_done(&mut self) {
        if !self.sent_done {
            self.sent_done = true;
            self.control_send(&ControlMessage::new("done", Some(&self.id)));
        }
    }

    pub fn sent_done(&self) -> bool {
        self.sent_done
    }

    pub fn received_done(&self) -> bool {
        self.received_done
    }

    pub(crate) fn set_received_done(&mut self) {
        self.received_done = true;
    }

    /// Request an orderly close. Deferred through the event queue; the
    /// handler's `close` runs on a later loop turn, then the close frame
    /// goes out carrying `problem` and the accumulated close options.
    pub fn close(&mut self, problem: Option<Problem>) {
        if !self.close_requested {
            self.close_requested = true;
            self.close_problem = problem;
            let _ = self.internal.send((self.id.clone(), ChannelEvent::CloseRequest));
        }
    }

    /// Log a failure and close with `problem`.
    pub fn fail(&mut self, problem: Problem, message: &str) {
        warn!("{}: {}", self.id, message);
        self.close(Some(problem));
    }

    pub fn close_problem(&self) -> Option<Problem> {
        self.close_problem
    }

    /// Side-channel options attached to the final close frame
    /// (`exit-status`, `message`, ...).
    pub fn close_options_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.close_options
    }

    pub(crate) fn take_close_options(&mut self) -> Map<String, Value> {
        std::mem::take(&mut self.close_options)
    }

    /// Challenge the peer for user input (password, host key confirmation).
    /// The reply arrives later as [`ChannelEvent::AuthorizeResponse`] with
    /// the returned cookie.
    pub fn authorize(&mut self, challenge: &str) -> String {
        self.authorize_seq += 1;
        let cookie = format!("{}-{}", self.id, self.authorize_seq);
        let _ = self.internal.send((
            self.id.clone(),
            ChannelEvent::AuthorizeRequest {
                cookie: cookie.clone(),
                challenge: challenge.to_string(),
            },
        ));
        cookie
    }

    /// Schedule a [`ChannelEvent::Pump`] for the next loop turn.
    pub fn pump(&self) {
        let _ = self.internal.send((self.id.clone(), ChannelEvent::Pump));
    }

    /// Schedule a [`ChannelEvent::Pump`] after `millis` milliseconds.
    pub fn pump_after(&self, millis: u64) {
        let internal = self.internal.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
            let _ = internal.send((id, ChannelEvent::Pump));
        });
    }

    /// Forward a pipe's events into this channel's event stream.
    pub fn forward_pipe_events(&self, mut events: mpsc::UnboundedReceiver<PipeEvent>) {
        let internal = self.internal.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let mapped = match event {
                    PipeEvent::Read { data, eof } => ChannelEvent::PipeRead { data, eof },
                    PipeEvent::Closed {
                        problem,
                        exit,
                        stderr,
                    } => ChannelEvent::PipeClosed {
                        problem,
                        exit,
                        stderr,
                    },
                };
                if internal.send((id.clone(), mapped)).is_err() {
                    break;
                }
            }
        });
    }

    /// Register `valve` to pause the whole transport's inbound reads while
    /// engaged (a slow consumer on this channel throttles the peer).
    pub fn throttle_transport(&self, valve: PressureValve) {
        self.transport.throttle(valve);
    }

    /// Valve observing the transport's outbound backlog; producers feeding
    /// this channel throttle on it.
    pub fn transport_backlog_valve(&self) -> PressureValve {
        self.transport.backlog_valve()
    }

    /// Buffer an inbound frame that arrived before `ready()`. Returns false
    /// when the peer has overrun the pre-ready bound.
    pub(crate) fn push_pending(&mut self, data: Bytes) -> bool {
        if self.pending.len() >= PRE_READY_LIMIT {
            return false;
        }
        debug!("{}: queued message before channel is ready", self.id);
        self.pending.push_back(data);
        true
    }

    /// Next buffered frame to replay, once ready.
    pub(crate) fn next_pending(&mut self) -> Option<Bytes> {
        if self.ready {
            self.pending.pop_front()
        } else {
            None
        }
    }
}
