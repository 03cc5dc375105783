use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::ConnectionHandle;

/// Explicit congestion notification codepoint
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EcnCodepoint {
    /// The ECT(0) codepoint, indicating that an endpoint is ECN-capable
    Ect0 = 0b10,
    /// The ECT(1) codepoint, indicating that an endpoint is ECN-capable
    Ect1 = 0b01,
    /// The CE codepoint, signalling that congestion was experienced
    Ce = 0b11,
}

impl EcnCodepoint {
    /// Extract the codepoint from the low two bits of an IP TOS field
    pub fn from_bits(x: u8) -> Option<Self> {
        use EcnCodepoint::*;
        Some(match x & 0b11 {
            0b10 => Ect0,
            0b01 => Ect1,
            0b11 => Ce,
            _ => return None,
        })
    }

    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// Opaque per-peer context threaded through to the sink and the allocator
///
/// The engine never inspects it; it records whatever the caller last passed
/// for the connection and hands it back on every outgoing datagram.
pub type PeerCtx = Arc<dyn Any + Send + Sync>;

/// One outgoing datagram within a batch handed to the [`DatagramSink`]
pub struct Transmit {
    /// Bytes to put on the wire, encrypted unless the packet opted out
    pub contents: Bytes,
    /// ECN codepoint to set on the datagram, if any
    pub ecn: Option<EcnCodepoint>,
    /// Local address to send from
    pub local: SocketAddr,
    /// Peer address to send to
    pub destination: SocketAddr,
    /// Context the caller associated with the peer
    pub peer_ctx: Option<PeerCtx>,
    /// Connection the packet belongs to
    pub handle: ConnectionHandle,
    /// When the packet was stamped as sent, set just before the sink call
    pub sent: Instant,
}

impl std::fmt::Debug for Transmit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transmit")
            .field("len", &self.contents.len())
            .field("ecn", &self.ecn)
            .field("destination", &self.destination)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Destination for batches of outgoing datagrams
///
/// Supplied at engine construction. The return value steers backpressure:
/// a value less than `batch.len()` means the sink could not take the whole
/// batch and the engine stops sending until re-armed; a negative value is
/// an error and is treated as zero datagrams sent.
pub trait DatagramSink {
    fn send(&mut self, batch: &[Transmit]) -> isize;
}

impl<F: FnMut(&[Transmit]) -> isize> DatagramSink for F {
    fn send(&mut self, batch: &[Transmit]) -> isize {
        self(batch)
    }
}

/// Source of buffers for encrypted packet data
///
/// `release` returns a buffer whose contents made it onto the wire;
/// `reclaim` returns one that never did (the re-encryption path after a
/// peer address family change). The stock implementation allocates on the
/// heap and drops on return; a pooling implementation may use
/// `Bytes::try_into_mut` to recycle.
pub trait PacketBufAllocator {
    fn alloc(&mut self, peer_ctx: Option<&PeerCtx>, size: usize, is_ipv6: bool) -> BytesMut;
    fn release(&mut self, peer_ctx: Option<&PeerCtx>, buf: Bytes, is_ipv6: bool);
    fn reclaim(&mut self, peer_ctx: Option<&PeerCtx>, buf: Bytes, is_ipv6: bool);
}

/// Stock allocator: plain heap allocations, freed on release
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl PacketBufAllocator for HeapAllocator {
    fn alloc(&mut self, _peer_ctx: Option<&PeerCtx>, size: usize, _is_ipv6: bool) -> BytesMut {
        BytesMut::with_capacity(size)
    }

    fn release(&mut self, _peer_ctx: Option<&PeerCtx>, buf: Bytes, _is_ipv6: bool) {
        drop(buf);
    }

    fn reclaim(&mut self, _peer_ctx: Option<&PeerCtx>, buf: Bytes, _is_ipv6: bool) {
        drop(buf);
    }
}
