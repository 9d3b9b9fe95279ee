//! A framed transport over one [`Pipe`].
//!
//! Owns the incremental frame parser and turns pipe reads into
//! [`TransportEvent::Recv`] frames. Exactly one `Closed` event is delivered,
//! always last. A stream that ends mid-frame is a protocol error; a clean
//! EOF with an empty parse buffer is a normal close.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Problem, WireError};
use crate::flow::PressureValve;
use crate::frame::{Frame, FrameCodec};
use crate::pipe::{Pipe, PipeEvent, PipeHandle};

/// Events delivered by a transport, in order.
#[derive(Debug)]
pub enum TransportEvent {
    Recv { channel: String, payload: Bytes },
    Closed { problem: Option<Problem> },
}

/// Cloneable outbound face of a transport: frame writes and close.
#[derive(Clone)]
pub struct TransportSender {
    pipe: PipeHandle,
}

impl TransportSender {
    /// Queue one frame. The header and payload are handed to the pipe as
    /// two buffers; the pipe may coalesce them on the wire.
    pub fn send(&self, channel: &str, payload: Bytes) {
        let frame = Frame::new(channel, payload);
        debug!(
            "{}: queued {} byte payload for channel {}",
            self.pipe.name(),
            frame.payload.len(),
            frame.channel
        );
        self.pipe.write(frame.header());
        self.pipe.write(frame.payload);
    }

    /// Queue a control frame (channel 0).
    pub fn send_control(&self, payload: Bytes) {
        self.send(crate::frame::CONTROL_CHANNEL, payload);
    }

    pub fn close(&self, problem: Option<Problem>) {
        self.pipe.close(problem);
    }

    /// Pause inbound reads on the transport while `valve` is engaged.
    pub fn throttle(&self, valve: PressureValve) {
        self.pipe.throttle(valve);
    }

    /// Valve observing the transport's outbound backlog. Producers that can
    /// pause (a child process's stdout, a chunk pump) throttle on this.
    pub fn backlog_valve(&self) -> PressureValve {
        self.pipe.backlog_valve()
    }
}

/// One framed byte stream carrying all channels.
pub struct Transport {
    sender: TransportSender,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl Transport {
    /// Frame a pipe. The pipe's event stream must not have been taken.
    pub fn new(mut pipe: Pipe) -> Transport {
        let pipe_events = pipe
            .take_events()
            .expect("pipe already claimed by another transport");
        let handle = pipe.handle();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let sender = TransportSender {
            pipe: handle.clone(),
        };
        tokio::spawn(parse_pump(handle, pipe_events, event_tx));

        Transport {
            sender,
            events: Some(event_rx),
        }
    }

    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    pub fn send(&self, channel: &str, payload: Bytes) {
        self.sender.send(channel, payload);
    }

    pub fn close(&self, problem: Option<Problem>) {
        self.sender.close(problem);
    }

    /// Pause inbound frame delivery while `valve` is engaged. The underlying
    /// descriptor stops being read, so the peer eventually blocks too.
    pub fn throttle(&self, valve: PressureValve) {
        self.sender.pipe.throttle(valve);
    }

    pub fn backlog_valve(&self) -> PressureValve {
        self.sender.backlog_valve()
    }

    /// Take the inbound event stream. Can only be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }
}

async fn parse_pump(
    pipe: PipeHandle,
    mut pipe_events: mpsc::UnboundedReceiver<PipeEvent>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let codec = FrameCodec::new();
    let mut buffer = BytesMut::new();

    while let Some(event) = pipe_events.recv().await {
        match event {
            PipeEvent::Read { data, eof } => {
                buffer.extend_from_slice(&data);

                loop {
                    match codec.decode(&mut buffer) {
                        Ok(Some(Frame { channel, payload })) => {
                            debug!(
                                "{}: received a {} byte payload for channel {}",
                                pipe.name(),
                                payload.len(),
                                channel
                            );
                            let _ = events.send(TransportEvent::Recv { channel, payload });
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!("{}: {}", pipe.name(), err);
                            let _ = events.send(TransportEvent::Closed {
                                problem: Some(err.problem()),
                            });
                            pipe.close(Some(err.problem()));
                            return;
                        }
                    }
                }

                if eof && !buffer.is_empty() {
                    let err = WireError::Truncated(buffer.len());
                    warn!("{}: {}", pipe.name(), err);
                    let _ = events.send(TransportEvent::Closed {
                        problem: Some(err.problem()),
                    });
                    pipe.close(Some(err.problem()));
                    return;
                }
            }
            PipeEvent::Closed { problem, .. } => {
                let _ = events.send(TransportEvent::Closed { problem });
                return;
            }
        }
    }
}
