//! Tunnel Module
//!
//! Local, X11 and reverse forwarding over one authenticated SSH session.
//! Every tunnel runs a single worker that multiplexes all of its
//! (channel, socket) pairs.

mod local_socket;
pub mod pump;
pub mod registry;
mod tunnel;
pub mod x11;

pub use local_socket::{LocalSocket, NonBlockingWrite};
pub use registry::{flush_pending, ChannelRegistry, FlushOutcome, Pair, PendingBuffer};
pub use tunnel::{InitCallback, Tunnel, TunnelCallback, TunnelCallbacks, TunnelInfo, TunnelKind};
