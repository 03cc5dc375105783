//! Connection multiplexing and packet-dispatch core for a QUIC transport
//! engine.
//!
//! An [`Engine`] owns every live connection in a single address space. It
//! routes incoming datagrams to their connections, ticks connections in
//! deadline and priority order, and batches outgoing packets onto a
//! caller-supplied [`DatagramSink`]. The crate performs no I/O and no
//! cryptography of its own: connections are driven through the
//! [`ConnectionDriver`] trait, datagrams come in through
//! [`Engine::packet_in`], and packets leave through the sink.
//!
//! The engine has roughly three kinds of methods:
//!
//! - Handlers for input from the network, i.e. [`Engine::packet_in`].
//! - Processing entry points the application calls periodically:
//!   [`Engine::process_conns`] and [`Engine::send_unsent_packets`].
//! - Queries that tell the application when to call back, i.e.
//!   [`Engine::earliest_adv_tick`].
//!
//! The usual driver loop feeds received datagrams to `packet_in`, calls
//! `process_conns` whenever `earliest_adv_tick` says a tick is due, and
//! sleeps until the returned instant otherwise. Care should be taken that
//! the `now` values passed in represent monotonically increasing time.
//!
//! The engine is not safe for concurrent use; callers serialize externally.
//! Public entry points are also not re-entrant: calling into the engine
//! from inside a [`ConnectionDriver`] or [`DatagramSink`] callback is a
//! contract violation.

use std::fmt;

pub use std::time::{Duration, Instant};

mod attq;
mod heap;
mod registry;

mod cid;
pub use cid::{ConnectionId, ResetToken};

mod config;
pub use config::{ConfigError, EngineConfig, QuicVersion, Side, VersionSet};

mod conn;
pub use conn::{ConnectionDriver, EncData, EncryptStatus, PacketOut, TickResult};

mod engine;
pub use engine::{
    CidError, ConnectError, Dispatch, DispatchError, Engine, INITIAL_OUT_BATCH_SIZE,
    MAX_OUT_BATCH_SIZE, MIN_OUT_BATCH_SIZE,
};

mod packet;
pub use packet::{PacketIn, ParseError, ParserKind};

mod shared;
pub use shared::{
    DatagramSink, EcnCodepoint, HeapAllocator, PacketBufAllocator, PeerCtx, Transmit,
};

/// Largest connection ID length the engine routes on, in bytes
pub const MAX_CID_SIZE: usize = 18;

/// Smallest non-empty source connection ID length a server may configure
pub const MIN_CID_SIZE: usize = 4;

/// Length of a stateless reset token
pub const RESET_TOKEN_SIZE: usize = 16;

/// Shortest datagram that can carry a stateless reset
///
/// One flags byte, at least four bytes of unpredictable data, and the
/// trailing token.
pub const MIN_STATELESS_RESET_SIZE: usize = 1 + 4 + RESET_TOKEN_SIZE;

/// Handle to a connection owned by an [`Engine`]
///
/// The handle stays valid until the engine destroys the connection, which
/// happens the moment the last queue referencing it lets go. Using a stale
/// handle is a contract violation and panics.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub usize);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> Self {
        x.0
    }
}
