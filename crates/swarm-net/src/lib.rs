//! Networking primitives for the peer swarm
//!
//! This crate provides:
//! - The reactor event queue shared by every node component
//! - Signaling transports (mailbox store and chat relay backends)
//! - The connection primitive boundary and an in-process implementation
//! - Data-channel framing

pub mod connection;
pub mod event;
pub mod framing;
pub mod loopback;
pub mod mailbox;
pub mod relay;
pub mod signaling;

pub use connection::{ConnectionConfig, Connector, LinkError, PeerConnection};
pub use event::{
    event_channel, Command, ConnectionEvent, Event, EventReceiver, EventSender, LinkId,
    PeerConnectionState,
};
pub use framing::{ChannelFrame, FrameError, FrameType, FRAME_VERSION};
pub use loopback::{LoopbackConnector, LoopbackNetwork};
pub use mailbox::{MailboxNotice, MailboxStore, MailboxTransport};
pub use relay::{RelayHub, RelayNotice, RelayTransport};
pub use signaling::{SignalingTransport, TransportError};
