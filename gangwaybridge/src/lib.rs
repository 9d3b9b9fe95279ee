//! Gangway session bridge -- multiplexes logical channels over one framed
//! byte stream between a remote frontend and local OS resources.
//!
//! The transport plumbing lives in `gangwaywire`; this crate is the
//! protocol brain on top of it:
//! - **protocol**: the JSON control commands on channel 0
//! - **channel** / **mux**: channel lifecycle and frame routing
//! - **stream**: the `stream`/`text-stream` payloads (processes, sockets, PTYs)
//! - **packages** / **template**: the content-addressed package index
//! - **resource**: the `resource1`/`resource2` payloads streaming package files
//! - **knownhosts**: the append-only host key store

pub mod channel;
pub mod knownhosts;
pub mod mux;
pub mod packages;
pub mod protocol;
pub mod resource;
pub mod stream;
pub mod template;

pub use channel::{Channel, ChannelCore, ChannelEvent};
pub use mux::{ChannelFactory, Multiplexer};
pub use packages::{Listing, Package, PackageDirs};
pub use protocol::ControlMessage;
pub use resource::ResourceChannel;
pub use stream::StreamChannel;

/// The standard payload table served by the bridge.
pub fn default_factory() -> ChannelFactory {
    Box::new(|payload| match payload {
        "stream" => Some(StreamChannel::binary()),
        "text-stream" => Some(StreamChannel::text()),
        "resource1" => Some(ResourceChannel::v1()),
        "resource2" => Some(ResourceChannel::v2()),
        _ => None,
    })
}
