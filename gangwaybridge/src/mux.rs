//! The channel multiplexer: routes frames between one transport and many
//! channels, and owns the open/close protocol.
//!
//! Lifecycle: on startup each side sends an `init` with the protocol
//! version; until the peer's `init` arrives, any other control message is
//! fatal. After that, `open` messages create channels through the payload
//! factory, data frames are routed by id (buffered until the channel is
//! ready), and every channel ends with exactly one outbound `close` frame
//! carrying its problem and side-channel options.
//!
//! Everything channel-visible runs on this one loop: transport frames and
//! channel-internal events (pipe reads, pump ticks, deferred closes) are
//! funneled through it in order, so handlers never need locks.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, info, warn};

use gangwaywire::error::Problem;
use gangwaywire::frame::valid_channel_id;
use gangwaywire::transport::{Transport, TransportEvent, TransportSender};
use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelCore, ChannelEvent};
use crate::protocol::{ControlMessage, PROTOCOL_VERSION};

/// Maps a payload type to a fresh handler, or `None` for unsupported types.
pub type ChannelFactory = Box<dyn Fn(&str) -> Option<Box<dyn Channel>> + Send>;

struct Entry {
    core: ChannelCore,
    handler: Box<dyn Channel>,
}

/// One multiplexed session over one transport.
pub struct Multiplexer {
    sender: TransportSender,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    factory: ChannelFactory,
    capabilities: Vec<String>,
    channels: HashMap<String, Entry>,
    internal_tx: mpsc::UnboundedSender<(String, ChannelEvent)>,
    internal_rx: mpsc::UnboundedReceiver<(String, ChannelEvent)>,
    /// Outstanding authorize cookies, mapped to the asking channel.
    authorize: HashMap<String, String>,
    peer_inited: bool,
    fatal: Option<Problem>,
}

impl Multiplexer {
    pub fn new(mut transport: Transport, factory: ChannelFactory) -> Self {
        let events = transport
            .take_events()
            .expect("transport already claimed by another multiplexer");
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            sender: transport.sender(),
            events,
            factory,
            capabilities: Vec::new(),
            channels: HashMap::new(),
            internal_tx,
            internal_rx,
            authorize: HashMap::new(),
            peer_inited: false,
            fatal: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Run the session until the transport closes. Returns the transport's
    /// problem, if any.
    pub async fn run(mut self) -> Option<Problem> {
        self.sender
            .send_control(ControlMessage::init(&self.capabilities).to_bytes());

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(TransportEvent::Recv { channel, payload }) => {
                            self.dispatch_frame(channel, payload);
                        }
                        Some(TransportEvent::Closed { problem }) => {
                            return self.shutdown(problem);
                        }
                        None => {
                            return self.shutdown(Some(Problem::InternalError));
                        }
                    }
                }
                internal = self.internal_rx.recv() => {
                    // The mux holds a sender, so this never yields None.
                    if let Some((id, event)) = internal {
                        self.dispatch_internal(id, event);
                    }
                }
            }

            if let Some(problem) = self.fatal.take() {
                self.sender.close(Some(problem));
                // Channel teardown happens when the Closed event arrives.
            }
        }
    }

    /// Tear down every remaining channel. No frames are emitted; the
    /// transport is gone.
    fn shutdown(&mut self, problem: Option<Problem>) -> Option<Problem> {
        let each = problem.unwrap_or(Problem::Disconnected);
        for (id, mut entry) in self.channels.drain() {
            debug!("{}: closed: {}", id, each);
            entry.handler.close(&mut entry.core, Some(each));
        }
        info!(
            "transport closed{}{}",
            if problem.is_some() { ": " } else { "" },
            problem.map(|p| p.as_str()).unwrap_or("")
        );
        problem
    }

    fn dispatch_frame(&mut self, channel: String, payload: Bytes) {
        if channel == gangwaywire::frame::CONTROL_CHANNEL {
            match ControlMessage::parse(&payload) {
                Ok(message) => self.dispatch_control(message),
                Err(err) => {
                    warn!("received invalid control message: {}", err);
                    self.fatal = Some(Problem::ProtocolError);
                }
            }
        } else {
            self.dispatch_data(channel, payload);
        }
    }

    fn dispatch_control(&mut self, message: ControlMessage) {
        if !self.peer_inited {
            if message.command != "init" {
                warn!(
                    "received \"{}\" control message before init",
                    message.command
                );
                self.fatal = Some(Problem::ProtocolError);
                return;
            }
            match message.int_field("version") {
                Ok(Some(PROTOCOL_VERSION)) => {
                    debug!("peer initialised");
                    self.peer_inited = true;
                }
                _ => {
                    warn!("peer offered an unsupported protocol version");
                    self.fatal = Some(Problem::ProtocolError);
                }
            }
            return;
        }

        match message.command.as_str() {
            "init" => debug!("ignoring spurious init message"),
            "open" => self.handle_open(message),
            "close" => self.handle_close(message),
            "done" => self.handle_done(message),
            "options" | "ready" => self.handle_channel_control(message),
            "authorize" => self.handle_authorize(message),
            other => warn!("received unknown control command: {}", other),
        }
    }

    fn handle_open(&mut self, message: ControlMessage) {
        let id = match message.channel.as_deref() {
            Some(id) if valid_channel_id(id) => id.to_string(),
            _ => {
                warn!("received open message with invalid channel id");
                self.fatal = Some(Problem::ProtocolError);
                return;
            }
        };
        if self.channels.contains_key(&id) {
            warn!("{}: received open for already open channel", id);
            self.fatal = Some(Problem::ProtocolError);
            return;
        }

        let handler = match message.str_field("payload") {
            Ok(Some(payload)) => match (self.factory)(payload) {
                Some(handler) => handler,
                None => {
                    warn!("{}: unsupported payload type: {}", id, payload);
                    self.reply_close(&id, Problem::NotSupported);
                    return;
                }
            },
            _ => {
                warn!("{}: open message has no payload type", id);
                self.reply_close(&id, Problem::ProtocolError);
                return;
            }
        };

        debug!("{}: opening channel", id);
        let core = ChannelCore::new(
            id.clone(),
            message,
            self.sender.clone(),
            self.internal_tx.clone(),
        );
        let mut entry = Entry { core, handler };
        entry.handler.prepare(&mut entry.core);
        drain_ready(&mut entry);
        self.channels.insert(id, entry);
    }

    /// A `close` for a channel that was never (or is no longer) recorded.
    fn reply_close(&self, id: &str, problem: Problem) {
        let message =
            ControlMessage::new("close", Some(id)).with_field("problem", problem.as_str());
        self.sender.send_control(message.to_bytes());
    }

    fn handle_close(&mut self, message: ControlMessage) {
        let Some(id) = message.channel.clone() else {
            warn!("received close message without channel id");
            self.fatal = Some(Problem::ProtocolError);
            return;
        };
        match self.channels.remove(&id) {
            Some(entry) => {
                debug!("{}: peer closed channel", id);
                self.finalize(entry, message.problem());
            }
            None => debug!("{}: close for unknown channel", id),
        }
    }

    fn handle_done(&mut self, message: ControlMessage) {
        let Some(entry) = self.lookup(&message) else {
            return;
        };
        entry.core.set_received_done();
        if !entry.handler.control(&mut entry.core, "done", &message) {
            debug!("{}: unhandled done message", entry.core.id());
        }
        let id = entry.core.id().to_string();
        self.drain_channel(&id);
    }

    fn handle_channel_control(&mut self, message: ControlMessage) {
        let command = message.command.clone();
        let Some(entry) = self.lookup(&message) else {
            return;
        };
        if !entry.handler.control(&mut entry.core, &command, &message) {
            debug!("{}: unhandled {} message", entry.core.id(), command);
        }
        let id = entry.core.id().to_string();
        self.drain_channel(&id);
    }

    fn handle_authorize(&mut self, message: ControlMessage) {
        let cookie = match message.str_field("cookie") {
            Ok(Some(cookie)) => cookie.to_string(),
            _ => {
                warn!("received authorize message without cookie");
                return;
            }
        };
        let response = message
            .str_field("response")
            .ok()
            .flatten()
            .unwrap_or_default()
            .to_string();

        let Some(id) = self.authorize.remove(&cookie) else {
            warn!("received authorize reply with unknown cookie");
            return;
        };
        if let Some(entry) = self.channels.get_mut(&id) {
            entry.handler.on_event(
                &mut entry.core,
                ChannelEvent::AuthorizeResponse { cookie, response },
            );
            self.drain_channel(&id);
        }
    }

    fn dispatch_data(&mut self, id: String, payload: Bytes) {
        let Some(entry) = self.channels.get_mut(&id) else {
            // The peer may legitimately send after our close; not fatal.
            debug!("{}: dropping data for unknown channel", id);
            return;
        };
        if entry.core.is_ready() {
            entry.handler.recv(&mut entry.core, payload);
            drain_ready(entry);
        } else if !entry.core.push_pending(payload) {
            entry
                .core
                .fail(Problem::ProtocolError, "pre-ready queue overflow");
        }
    }

    fn dispatch_internal(&mut self, id: String, event: ChannelEvent) {
        match event {
            ChannelEvent::CloseRequest => {
                if let Some(entry) = self.channels.remove(&id) {
                    let problem = entry.core.close_problem();
                    self.finalize(entry, problem);
                }
            }
            ChannelEvent::AuthorizeRequest { cookie, challenge } => {
                if self.channels.contains_key(&id) {
                    self.authorize.insert(cookie.clone(), id);
                    let message = ControlMessage::new("authorize", None)
                        .with_field("cookie", cookie)
                        .with_field("challenge", challenge);
                    self.sender.send_control(message.to_bytes());
                }
            }
            other => {
                if let Some(entry) = self.channels.get_mut(&id) {
                    entry.handler.on_event(&mut entry.core, other);
                    drain_ready(entry);
                }
            }
        }
    }

    /// Run the handler's teardown and emit the channel's final close frame.
    fn finalize(&mut self, mut entry: Entry, problem: Option<Problem>) {
        entry.handler.close(&mut entry.core, problem);

        let mut message = ControlMessage::new("close", Some(entry.core.id()));
        if let Some(problem) = problem {
            message
                .fields
                .insert("problem".to_string(), Value::from(problem.as_str()));
        }
        for (key, value) in entry.core.take_close_options() {
            message.fields.insert(key, value);
        }
        debug!(
            "{}: closed{}{}",
            entry.core.id(),
            if problem.is_some() { ": " } else { "" },
            problem.map(|p| p.as_str()).unwrap_or("")
        );
        self.sender.send_control(message.to_bytes());
        // The entry drops here: destroyed only after its close frame was
        // handed to the transport.
    }

    fn lookup(&mut self, message: &ControlMessage) -> Option<&mut Entry> {
        let id = message.channel.as_deref()?;
        let entry = self.channels.get_mut(id);
        if entry.is_none() {
            debug!("{}: {} for unknown channel", id, message.command);
        }
        entry
    }

    fn drain_channel(&mut self, id: &str) {
        if let Some(entry) = self.channels.get_mut(id) {
            drain_ready(entry);
        }
    }
}

/// Replay pre-ready frames through `recv` once the handler declares itself
/// ready. FIFO, and strictly before any later-arriving frame.
fn drain_ready(entry: &mut Entry) {
    while let Some(data) = entry.core.next_pending() {
        entry.handler.recv(&mut entry.core, data);
    }
}
