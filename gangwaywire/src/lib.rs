//! Gangway transport layer -- framed byte streams for the session bridge.
//!
//! Everything here is payload-agnostic plumbing:
//! - **frame**: the length-prefixed wire format carrying all channels
//! - **pipe**: queued non-blocking I/O over sockets, child processes, PTYs
//! - **transport**: the frame parser/emitter over one pipe
//! - **flow**: back-pressure signalling between producers and consumers
//!
//! Channel semantics (open/close protocol, payload types) live a layer up,
//! in `gangwaybridge`.

pub mod error;
pub mod flow;
pub mod frame;
pub mod pipe;
pub mod transport;

// Re-export key public types at crate root.
pub use error::{Problem, WireError};
pub use flow::{BacklogGauge, PressureSet, PressureSource, PressureValve};
pub use frame::{Frame, FrameCodec, CONTROL_CHANNEL, MAX_FRAME_SIZE};
pub use pipe::{ExitInfo, Pipe, PipeEvent, PipeHandle, StderrMode, WindowSize};
pub use transport::{Transport, TransportEvent, TransportSender};
