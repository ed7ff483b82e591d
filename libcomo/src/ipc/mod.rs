//! Typed, framed, length-prefixed IPC over local stream sockets.
//!
//! Every CoMo process runs one `Endpoint`: a cooperative, single-threaded
//! poll loop over its peer sockets. One handler runs to completion before
//! the next message is read on any socket; ordering is FIFO per peer.

pub mod peer;
pub mod frame;
pub mod endpoint;

pub use endpoint::{Endpoint, Envelope, Handler, Mailbox, PeerSlot};
pub use frame::{msg, FrameHeader};
pub use peer::{class, PeerId};
