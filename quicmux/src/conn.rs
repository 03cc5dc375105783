use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use bitflags::bitflags;
use bytes::Bytes;

use crate::shared::{PacketBufAllocator, PeerCtx};
use crate::{ConnectionId, EcnCodepoint, PacketIn, QuicVersion, ResetToken};

bitflags! {
    /// Indicators a connection returns from [`ConnectionDriver::tick`]
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct TickResult: u8 {
        /// The connection has packets to send
        const SEND = 1 << 0;
        /// The connection wants to be destroyed at the end of the round
        const CLOSE = 1 << 1;
    }
}

/// Outcome of [`ConnectionDriver::encrypt_packet`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EncryptStatus {
    /// The packet's encrypted form is ready in [`PacketOut::enc`]
    Ok,
    /// No buffer could be produced; try again later
    NoMem,
    /// Keys are unusable; the connection must be torn down
    BadCrypt,
}

/// Encrypted form of an outgoing packet
#[derive(Debug, Clone)]
pub struct EncData {
    pub buf: Bytes,
    /// Address family the packet was encrypted for; a mismatch with the
    /// current peer address forces re-encryption
    pub ipv6: bool,
}

/// An outgoing packet as handed over by a connection
///
/// The engine owns the packet from [`ConnectionDriver::next_packet_to_send`]
/// until it is returned through `packet_sent` or `packet_not_sent`. Sent
/// packets come back stripped of their encrypted buffer; unsent ones keep it
/// so a retry does not have to encrypt again.
#[derive(Debug, Clone)]
pub struct PacketOut {
    /// Serialized plaintext packet
    pub data: Bytes,
    /// Encrypted rendition, if one has been produced
    pub enc: Option<EncData>,
    /// Packet goes on the wire as-is, without encryption
    pub no_encrypt: bool,
    /// ECN codepoint to request for the datagram
    pub ecn: Option<EcnCodepoint>,
    /// Packet number, for logging
    pub packno: u64,
    /// When the packet was last handed to the sink
    pub sent: Option<Instant>,
}

impl PacketOut {
    pub fn new(data: Bytes, packno: u64) -> Self {
        Self {
            data,
            enc: None,
            no_encrypt: false,
            ecn: None,
            packno,
            sent: None,
        }
    }
}

/// The contract a connection exposes to the engine
///
/// The engine never looks inside a connection; everything it needs goes
/// through this trait. Implementations hold the actual transport state
/// machine (handshake, streams, ACK and congestion logic) and must uphold
/// two rules: `tick` indicators describe the connection's state truthfully,
/// and none of these methods call back into the engine.
pub trait ConnectionDriver {
    /// Advance the connection's state machine
    fn tick(&mut self, now: Instant) -> TickResult;

    /// Hand the engine the next packet awaiting transmission
    fn next_packet_to_send(&mut self) -> Option<PacketOut>;

    /// The packet was written to the sink
    fn packet_sent(&mut self, packet: PacketOut);

    /// The packet could not be written; it is back in the connection's care
    fn packet_not_sent(&mut self, packet: PacketOut);

    /// An incoming packet was routed to this connection
    fn packet_in(&mut self, packet: PacketIn);

    /// Whether the connection wants a tick in the next processing round
    fn is_tickable(&self) -> bool;

    /// When the connection next wants to be ticked, if ever
    fn next_tick_time(&self) -> Option<Instant>;

    /// A stateless reset matching one of this connection's tokens arrived
    fn stateless_reset(&mut self);

    /// The engine is about to drop the connection
    fn destroy(&mut self);

    /// Produce `packet.enc` from `packet.data`
    fn encrypt_packet(
        &mut self,
        packet: &mut PacketOut,
        alloc: &mut dyn PacketBufAllocator,
    ) -> EncryptStatus;

    /// Complete version-specific header parsing (e.g. packet number decode)
    fn parse_packet_in_finish(&mut self, _packet: &mut PacketIn) {}

    /// The connection's primary CID, if it has one
    fn primary_cid(&self) -> Option<ConnectionId>;

    /// Version negotiated for this connection; selects the header parser in
    /// address-routed mode
    fn negotiated_version(&self) -> QuicVersion;
}

bitflags! {
    /// Engine-side connection state bits
    ///
    /// The low six bits are references: each names one queue that may hold
    /// the connection, the connection is alive exactly while one of them is
    /// set, and no queue may hold it twice. The rest are plain state.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub(crate) struct ConnFlags: u16 {
        /// Published in the connection registry
        const HASHED = 1 << 0;
        /// On the outgoing heap
        const HAS_OUTGOING = 1 << 1;
        /// On the tickable heap
        const TICKABLE = 1 << 2;
        /// On the current round's ticked list
        const TICKED = 1 << 3;
        /// On the current round's closing list
        const CLOSING = 1 << 4;
        /// On the advisory tick-time queue
        const ATTQ = 1 << 5;

        /// Destruction has begun; refuse tickable inserts
        const NEVER_TICKABLE = 1 << 6;
        /// On the egress iterator's active list
        const COI_ACTIVE = 1 << 7;
        /// On the egress iterator's inactive list
        const COI_INACTIVE = 1 << 8;
        /// Short-lived connection outside normal iterator reactivation
        const EVANESCENT = 1 << 9;

        const REF_MASK = Self::HASHED.bits()
            | Self::HAS_OUTGOING.bits()
            | Self::TICKABLE.bits()
            | Self::TICKED.bits()
            | Self::CLOSING.bits()
            | Self::ATTQ.bits();
    }
}

/// Compact rendering of the reference bits for trace logs
pub(crate) struct FlagStr(pub(crate) ConnFlags);

impl fmt::Display for FlagStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (flag, c) in [
            (ConnFlags::CLOSING, 'C'),
            (ConnFlags::HASHED, 'H'),
            (ConnFlags::HAS_OUTGOING, 'O'),
            (ConnFlags::TICKABLE, 'T'),
            (ConnFlags::ATTQ, 'A'),
            (ConnFlags::TICKED, 'K'),
        ] {
            if self.0.contains(flag) {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// How many CIDs a connection may have published at once
pub(crate) const MAX_CID_ENTRIES: usize = 8;

/// Engine-side state for one owned connection
pub(crate) struct Conn {
    pub(crate) driver: Box<dyn ConnectionDriver>,
    pub(crate) flags: ConnFlags,
    /// Tick-order stamp; a counter stacked on a timestamp, not a clock
    pub(crate) last_ticked: Instant,
    /// Send-order stamp, same discipline
    pub(crate) last_sent: Instant,
    /// CID slots; `published_mask` says which are in the registry
    pub(crate) cids: [Option<ConnectionId>; MAX_CID_ENTRIES],
    pub(crate) published_mask: u8,
    /// CID used to double-check address-routed lookups
    pub(crate) primary_cid: Option<ConnectionId>,
    pub(crate) local: SocketAddr,
    pub(crate) peer: SocketAddr,
    pub(crate) peer_ctx: Option<PeerCtx>,
    /// Stateless reset tokens registered for this connection
    pub(crate) reset_tokens: Vec<ResetToken>,
}

impl Conn {
    pub(crate) fn new(
        driver: Box<dyn ConnectionDriver>,
        local: SocketAddr,
        peer: SocketAddr,
        peer_ctx: Option<PeerCtx>,
        epoch: Instant,
    ) -> Self {
        let primary_cid = driver.primary_cid();
        let mut cids = [None; MAX_CID_ENTRIES];
        cids[0] = primary_cid;
        Self {
            driver,
            flags: ConnFlags::empty(),
            // The epoch stamp sorts new connections ahead of any
            // connection that has sent or ticked since
            last_ticked: epoch,
            last_sent: epoch,
            cids,
            published_mask: 0,
            primary_cid,
            local,
            peer,
            peer_ctx,
            reset_tokens: Vec::new(),
        }
    }

    pub(crate) fn refs(&self) -> ConnFlags {
        self.flags & ConnFlags::REF_MASK
    }
}
