use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use slab::Slab;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::attq::Attq;
use crate::config::{EngineConfig, Side, VersionSet};
use crate::conn::{Conn, ConnFlags, ConnectionDriver, EncryptStatus, FlagStr, MAX_CID_ENTRIES};
use crate::heap::ConnHeap;
use crate::packet::{PacketIn, ParseError, ParserKind};
use crate::registry::{Key, Registry};
use crate::shared::{DatagramSink, EcnCodepoint, HeapAllocator, PacketBufAllocator, PeerCtx, Transmit};
use crate::{
    ConnectionHandle, ConnectionId, PacketOut, ResetToken, TickResult, MIN_STATELESS_RESET_SIZE,
    RESET_TOKEN_SIZE,
};

/// The batch of outgoing packets grows and shrinks dynamically
pub const MAX_OUT_BATCH_SIZE: usize = 1024;
pub const MIN_OUT_BATCH_SIZE: usize = 4;
pub const INITIAL_OUT_BATCH_SIZE: usize = 32;

/// How long after a short sink write the engine re-arms sending on its own
const RESUME_SENDING_DELAY: Duration = Duration::from_micros(1_000_000);

/// What became of a datagram fed to [`Engine::packet_in`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Dispatch {
    /// At least one packet reached a connection
    Routed,
    /// Every packet was handled, but none by a connection
    Unclaimed,
}

/// Error dispatching an incoming datagram
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum DispatchError {
    /// Address-routed engines reject datagrams for unknown local addresses
    #[error("no connection on the receiving address")]
    NoConnection,
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Error admitting a connection into the engine
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConnectError {
    #[error("connect must only be called in client mode")]
    ServerEngine,
    #[error("cannot have more than one connection on the same port")]
    PortInUse,
    #[error("connection supplies no connection ID to hash by")]
    MissingCid,
    #[error("cannot add connection to the registry")]
    RegistryConflict,
}

/// Error publishing an additional CID
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum CidError {
    #[error("all CID slots are in use")]
    NoFreeSlot,
    #[error("CID is already registered")]
    Duplicate,
}

/// Outgoing packets staged for the next sink call
#[derive(Default)]
struct OutBatch {
    outs: Vec<Transmit>,
    conns: Vec<ConnectionHandle>,
    packets: Vec<PacketOut>,
}

/// One egress round's view of the outgoing queue
///
/// Connections are drained from the outgoing heap into the `active` list
/// and then walked round-robin, one packet per turn, so a connection with
/// a deep send queue cannot monopolize the batch. Connections with nothing
/// more to send park on `inactive` until the final reheap.
#[derive(Default)]
struct OutIter {
    active: VecDeque<ConnectionHandle>,
    inactive: Vec<ConnectionHandle>,
    #[cfg(debug_assertions)]
    last_heap_key: Option<Instant>,
}

/// Multiplexes every live connection in one address space
///
/// See the crate docs for the driving contract. Connections are admitted
/// through [`Engine::connect`] (client) or [`Engine::insert_conn`] (the
/// server-side accept path), fed through [`Engine::packet_in`], and driven
/// by [`Engine::process_conns`].
pub struct Engine {
    side: Side,
    config: EngineConfig,
    /// Connections are routed by local port instead of CID
    hash_by_addr: bool,
    conns: Slab<Conn>,
    registry: Registry,
    /// Stateless reset tokens, present only when resets are honored
    srst: Option<FxHashMap<ResetToken, ConnectionHandle>>,
    conns_tickable: ConnHeap,
    conns_out: ConnHeap,
    attq: Attq,
    sink: Box<dyn DatagramSink>,
    alloc: Box<dyn PacketBufAllocator>,
    batch: OutBatch,
    batch_size: usize,
    /// Stamp of the last send round; `last_sent` orderings never go past it
    last_sent: Instant,
    /// Construction time; new connections start here so they sort first
    epoch: Instant,
    n_conns: usize,
    /// Real-clock bound on the current processing call
    deadline: Option<Instant>,
    past_deadline: bool,
    can_send: bool,
    resume_sending_at: Option<Instant>,
    /// Guard against re-entrant public calls
    in_process: bool,
    destroying: bool,
}

impl Engine {
    /// Create an engine with the stock heap allocator
    pub fn new(
        side: Side,
        config: EngineConfig,
        sink: Box<dyn DatagramSink>,
    ) -> Result<Self, crate::ConfigError> {
        Self::with_allocator(side, config, sink, Box::new(HeapAllocator))
    }

    /// Create an engine with a caller-supplied packet buffer allocator
    pub fn with_allocator(
        side: Side,
        config: EngineConfig,
        sink: Box<dyn DatagramSink>,
        alloc: Box<dyn PacketBufAllocator>,
    ) -> Result<Self, crate::ConfigError> {
        config.validate(side)?;
        let hash_by_addr = config.hash_conns_by_addr();
        let srst = config.honor_prst.then(FxHashMap::default);
        let epoch = Instant::now();
        info!(?side, "instantiated engine");
        Ok(Self {
            side,
            hash_by_addr,
            config,
            conns: Slab::new(),
            registry: Registry::new(),
            srst,
            conns_tickable: ConnHeap::new(),
            conns_out: ConnHeap::new(),
            attq: Attq::new(),
            sink,
            alloc,
            batch: OutBatch::default(),
            batch_size: INITIAL_OUT_BATCH_SIZE,
            last_sent: epoch,
            epoch,
            n_conns: 0,
            deadline: None,
            past_deadline: false,
            can_send: true,
            resume_sending_at: None,
            in_process: false,
            destroying: false,
        })
    }

    /// Number of live connections
    pub fn n_conns(&self) -> usize {
        self.n_conns
    }

    /// QUIC versions this engine offers
    pub fn quic_versions(&self) -> VersionSet {
        self.config.versions
    }

    /// Whether any connection still has packets queued for the sink
    pub fn has_unsent_packets(&self) -> bool {
        !self.conns_out.is_empty()
    }

    // Process guard. Nested calls into the engine are not supported.

    fn enter_process(&mut self) {
        assert!(!self.in_process, "re-entrant call into the engine");
        self.in_process = true;
    }

    fn exit_process(&mut self) {
        debug_assert!(self.in_process);
        self.in_process = false;
    }

    // Reference flags. Each queue that may hold a connection owns one bit;
    // the connection is destroyed the moment the last bit clears.

    fn incref(&mut self, h: ConnectionHandle, flag: ConnFlags) {
        let conn = &mut self.conns[h.0];
        debug_assert!(ConnFlags::REF_MASK.contains(flag));
        assert!(!conn.flags.contains(flag), "queue already references conn");
        let before = conn.refs();
        conn.flags |= flag;
        trace!(conn = h.0, "incref '{}' -> '{}'", FlagStr(before), FlagStr(conn.refs()));
    }

    /// Drop one reference; returns the handle while the connection survives
    fn decref(&mut self, h: ConnectionHandle, flag: ConnFlags) -> Option<ConnectionHandle> {
        let conn = &mut self.conns[h.0];
        debug_assert!(ConnFlags::REF_MASK.contains(flag));
        assert!(conn.flags.contains(flag), "queue does not reference conn");
        if flag == ConnFlags::CLOSING {
            debug_assert!(!conn.flags.contains(ConnFlags::HASHED));
        }
        let before = conn.refs();
        conn.flags -= flag;
        trace!(conn = h.0, "decref '{}' -> '{}'", FlagStr(before), FlagStr(conn.refs()));
        if self.conns[h.0].refs().is_empty() {
            self.destroy_conn(h);
            None
        } else {
            Some(h)
        }
    }

    fn destroy_conn(&mut self, h: ConnectionHandle) {
        let conn = &mut self.conns[h.0];
        conn.flags |= ConnFlags::NEVER_TICKABLE;
        self.n_conns -= 1;
        if let Some(srst) = &mut self.srst {
            for token in &conn.reset_tokens {
                srst.remove(token);
            }
        }
        let mut conn = self.conns.remove(h.0);
        conn.driver.destroy();
        debug!(conn = h.0, "destroyed connection");
    }

    // Registry maintenance

    fn insert_all_cids(&mut self, h: ConnectionHandle) -> Result<(), ()> {
        let entries: Vec<(usize, ConnectionId)> = self.conns[h.0]
            .cids
            .iter()
            .enumerate()
            .filter_map(|(i, cid)| cid.map(|c| (i, c)))
            .collect();
        let mut done: u8 = 0;
        for &(idx, cid) in &entries {
            if self.registry.insert(Key::Cid(cid), h).is_ok() {
                done |= 1 << idx;
            } else {
                // Roll back: all of a connection's CIDs are in or none are
                for &(idx, cid) in &entries {
                    if done & (1 << idx) != 0 {
                        self.registry.remove(&Key::Cid(cid));
                    }
                }
                return Err(());
            }
        }
        self.conns[h.0].published_mask = done;
        Ok(())
    }

    fn add_conn_to_hash(&mut self, h: ConnectionHandle) -> Result<(), ()> {
        if self.hash_by_addr {
            let key = Key::from_local_addr(&self.conns[h.0].local);
            self.registry.insert(key, h)?;
            self.conns[h.0].published_mask = 1;
            Ok(())
        } else {
            self.insert_all_cids(h)
        }
    }

    fn remove_all_keys(&mut self, h: ConnectionHandle) {
        if self.hash_by_addr {
            if self.conns[h.0].published_mask & 1 != 0 {
                let key = Key::from_local_addr(&self.conns[h.0].local);
                self.registry.remove(&key);
            }
        } else {
            let mask = self.conns[h.0].published_mask;
            for idx in 0..MAX_CID_ENTRIES {
                if mask & (1 << idx) != 0 {
                    if let Some(cid) = self.conns[h.0].cids[idx] {
                        self.registry.remove(&Key::Cid(cid));
                    }
                }
            }
        }
        self.conns[h.0].published_mask = 0;
    }

    fn remove_conn_from_hash(&mut self, h: ConnectionHandle) -> Option<ConnectionHandle> {
        self.remove_all_keys(h);
        self.decref(h, ConnFlags::HASHED)
    }

    /// Publish an additional CID for `handle`
    pub fn add_cid(&mut self, handle: ConnectionHandle, cid: ConnectionId) -> Result<usize, CidError> {
        debug_assert!(!self.hash_by_addr, "CIDs are not routing keys in address mode");
        let conn = &self.conns[handle.0];
        let Some(idx) = conn.cids.iter().position(|c| c.is_none()) else {
            return Err(CidError::NoFreeSlot);
        };
        if self.registry.insert(Key::Cid(cid), handle).is_err() {
            warn!(%cid, "could not add new CID to the registry");
            return Err(CidError::Duplicate);
        }
        let conn = &mut self.conns[handle.0];
        conn.cids[idx] = Some(cid);
        conn.published_mask |= 1 << idx;
        debug!(%cid, "registered new CID");
        Ok(idx)
    }

    /// Withdraw the CID in slot `idx` from the registry
    pub fn retire_cid(&mut self, handle: ConnectionHandle, idx: usize) {
        assert!(idx < MAX_CID_ENTRIES);
        let conn = &mut self.conns[handle.0];
        let Some(cid) = conn.cids[idx].take() else {
            return;
        };
        if conn.published_mask & (1 << idx) != 0 {
            conn.published_mask &= !(1 << idx);
            self.registry.remove(&Key::Cid(cid));
        }
        debug!(%cid, "retired CID");
    }

    /// Register a stateless reset token for `handle`
    ///
    /// Ignored unless the engine was configured to honor resets.
    pub fn insert_reset_token(&mut self, handle: ConnectionHandle, token: ResetToken) {
        let Some(srst) = &mut self.srst else {
            return;
        };
        srst.insert(token, handle);
        self.conns[handle.0].reset_tokens.push(token);
    }

    // Connection admission

    /// Open a client connection
    ///
    /// The engine must have been created as a client. `driver` carries the
    /// connection's transport state; its primary CID is published in the
    /// registry unless the engine routes by address.
    pub fn connect(
        &mut self,
        now: Instant,
        driver: Box<dyn ConnectionDriver>,
        local: SocketAddr,
        peer: SocketAddr,
        peer_ctx: Option<PeerCtx>,
    ) -> Result<ConnectionHandle, ConnectError> {
        self.enter_process();
        let res = if self.side.is_server() {
            error!("connect must only be called in client mode");
            Err(ConnectError::ServerEngine)
        } else {
            self.insert_conn_inner(now, driver, local, peer, peer_ctx)
        };
        self.exit_process();
        res
    }

    /// Admit a connection created outside the engine
    ///
    /// The accept path for servers: once the (out-of-scope) handshake layer
    /// has built a connection, this takes ownership and starts scheduling
    /// it.
    pub fn insert_conn(
        &mut self,
        now: Instant,
        driver: Box<dyn ConnectionDriver>,
        local: SocketAddr,
        peer: SocketAddr,
        peer_ctx: Option<PeerCtx>,
    ) -> Result<ConnectionHandle, ConnectError> {
        self.enter_process();
        let res = self.insert_conn_inner(now, driver, local, peer, peer_ctx);
        self.exit_process();
        res
    }

    fn insert_conn_inner(
        &mut self,
        _now: Instant,
        driver: Box<dyn ConnectionDriver>,
        local: SocketAddr,
        peer: SocketAddr,
        peer_ctx: Option<PeerCtx>,
    ) -> Result<ConnectionHandle, ConnectError> {
        if self.hash_by_addr
            && self
                .registry
                .get(&Key::from_local_addr(&local))
                .is_some()
        {
            error!("cannot have more than one connection on the same port");
            return Err(ConnectError::PortInUse);
        }
        let conn = Conn::new(driver, local, peer, peer_ctx, self.epoch);
        if !self.hash_by_addr && conn.primary_cid.is_none() {
            return Err(ConnectError::MissingCid);
        }
        self.maybe_grow_conn_heaps();
        let handle = ConnectionHandle(self.conns.insert(conn));
        self.n_conns += 1;
        if self.add_conn_to_hash(handle).is_err() {
            warn!(conn = handle.0, "cannot add connection to the registry - destroy");
            self.destroy_conn(handle);
            return Err(ConnectError::RegistryConflict);
        }
        debug_assert!(self.conns[handle.0].refs().is_empty());
        // A new connection's stamp predates every send, so it sorts ahead
        // of existing connections once it becomes outgoing
        debug_assert!(self.conns[handle.0].last_sent <= self.last_sent);
        self.incref(handle, ConnFlags::HASHED);
        let key = self.conns[handle.0].last_ticked;
        self.conns_tickable.insert(key, handle);
        self.incref(handle, ConnFlags::TICKABLE);
        Ok(handle)
    }

    /// Both conn heaps share one growth event so their capacities stay equal
    fn maybe_grow_conn_heaps(&mut self) {
        if self.n_conns < self.conns_tickable.capacity() {
            return;
        }
        let cap = self.conns_tickable.capacity();
        let new_cap = if cap == 0 { 4 } else { cap * 2 };
        self.conns_tickable.grow_to(new_cap);
        self.conns_out.grow_to(new_cap);
        debug!(capacity = new_cap, "grew connection heaps");
    }

    // Scheduling hooks available to connection owners

    /// Ask for `handle` to be ticked in the next processing round
    ///
    /// No-op while a processing call is running (the loop re-queries
    /// tickability itself) and for connections being destroyed.
    pub fn mark_tickable(&mut self, handle: ConnectionHandle) {
        if self.in_process {
            return;
        }
        let conn = &self.conns[handle.0];
        if conn
            .flags
            .intersects(ConnFlags::TICKABLE | ConnFlags::NEVER_TICKABLE)
        {
            return;
        }
        let key = conn.last_ticked;
        self.conns_tickable.insert(key, handle);
        self.incref(handle, ConnFlags::TICKABLE);
    }

    /// Schedule (or reschedule) an advisory tick for `handle`
    pub fn schedule_tick_at(&mut self, handle: ConnectionHandle, tick_time: Instant) {
        let flags = self.conns[handle.0].flags;
        if flags.contains(ConnFlags::TICKABLE) {
            // About to be ticked anyway; its next tick time will be
            // queried afresh afterwards
        } else if flags.contains(ConnFlags::ATTQ) {
            if self.attq.adv_time(handle) != Some(tick_time) {
                self.attq.remove(handle);
                self.attq.add(handle, tick_time);
            }
        } else {
            self.attq.add(handle, tick_time);
            self.incref(handle, ConnFlags::ATTQ);
        }
    }

    // Ingress

    /// Feed one received datagram (possibly several coalesced packets)
    ///
    /// Returns [`Dispatch::Routed`] if at least one packet reached a
    /// connection. A header that fails to parse drops that packet and
    /// surfaces as an error even when earlier packets in the datagram were
    /// delivered.
    pub fn packet_in(
        &mut self,
        now: Instant,
        data: Bytes,
        local: SocketAddr,
        peer: SocketAddr,
        peer_ctx: Option<PeerCtx>,
        ecn: Option<EcnCodepoint>,
    ) -> Result<Dispatch, DispatchError> {
        self.enter_process();
        let res = self.packet_in_inner(now, data, local, peer, peer_ctx, ecn);
        self.exit_process();
        res
    }

    fn packet_in_inner(
        &mut self,
        now: Instant,
        data: Bytes,
        local: SocketAddr,
        peer: SocketAddr,
        peer_ctx: Option<PeerCtx>,
        ecn: Option<EcnCodepoint>,
    ) -> Result<Dispatch, DispatchError> {
        let parser = if self.hash_by_addr {
            // The packet format is whatever the connection on this address
            // negotiated; without a connection there is nothing to go by
            let Some(h) = self.registry.get(&Key::from_local_addr(&local)) else {
                return Err(DispatchError::NoConnection);
            };
            ParserKind::for_version(self.conns[h.0].driver.negotiated_version())
        } else {
            ParserKind::Generic
        };

        let mut off = 0;
        let mut n_routed = 0usize;
        loop {
            let hdr = match parser.parse_begin(
                &data[off..],
                self.side.is_server(),
                self.config.scid_len,
            ) {
                Ok(hdr) => hdr,
                Err(e) => {
                    debug!("cannot parse incoming packet's header");
                    return Err(e.into());
                }
            };
            let packet = PacketIn {
                data: data.slice(off..off + hdr.len),
                dcid: hdr.dcid,
                received: now,
                ecn,
                long_header: hdr.long_header,
                gquic: hdr.gquic,
                gquic_prst: hdr.gquic_prst,
                version: hdr.version,
            };
            off += hdr.len;
            if self.process_packet_in(packet, &local, &peer, &peer_ctx) {
                n_routed += 1;
            } else {
                break;
            }
            if off >= data.len() {
                break;
            }
        }
        Ok(if n_routed > 0 {
            Dispatch::Routed
        } else {
            Dispatch::Unclaimed
        })
    }

    /// Route one parsed packet; true if a connection took it
    fn process_packet_in(
        &mut self,
        mut packet: PacketIn,
        local: &SocketAddr,
        peer: &SocketAddr,
        peer_ctx: &Option<PeerCtx>,
    ) -> bool {
        if packet.gquic_prst && !self.config.honor_prst {
            debug!("public reset packet: discarding");
            return false;
        }

        let Some(h) = self.find_conn(&mut packet, local) else {
            if self.config.honor_prst && !packet.gquic {
                if let Some(h) = self.find_conn_by_srst(&packet) {
                    debug!(conn = h.0, "got stateless reset");
                    let conn = &mut self.conns[h.0];
                    conn.driver.stateless_reset();
                    let conn = &self.conns[h.0];
                    if !conn.flags.contains(ConnFlags::TICKABLE) && conn.driver.is_tickable() {
                        let key = conn.last_ticked;
                        self.conns_tickable.insert(key, h);
                        self.incref(h, ConnFlags::TICKABLE);
                    }
                }
            }
            return false;
        };

        if !self.conns[h.0].flags.contains(ConnFlags::TICKABLE) {
            let key = self.conns[h.0].last_ticked;
            self.conns_tickable.insert(key, h);
            self.incref(h, ConnFlags::TICKABLE);
        }
        let conn = &mut self.conns[h.0];
        conn.local = *local;
        conn.peer = *peer;
        conn.peer_ctx = peer_ctx.clone();
        conn.driver.packet_in(packet);
        true
    }

    fn find_conn(
        &mut self,
        packet: &mut PacketIn,
        local: &SocketAddr,
    ) -> Option<ConnectionHandle> {
        let h = if self.hash_by_addr {
            self.registry.get(&Key::from_local_addr(local))?
        } else if let Some(dcid) = packet.dcid {
            self.registry.get(&Key::Cid(dcid))?
        } else {
            debug!("packet header does not have connection ID: discarding");
            return None;
        };

        let conn = &mut self.conns[h.0];
        conn.driver.parse_packet_in_finish(packet);
        if self.hash_by_addr {
            if let Some(dcid) = packet.dcid {
                if conn.primary_cid != Some(dcid) {
                    debug!("connection IDs do not match");
                    return None;
                }
            }
        }
        Some(h)
    }

    fn find_conn_by_srst(&self, packet: &PacketIn) -> Option<ConnectionHandle> {
        let srst = self.srst.as_ref()?;
        if packet.data.len() < MIN_STATELESS_RESET_SIZE || packet.data[0] & 0xc0 != 0x40 {
            return None;
        }
        let tail = &packet.data[packet.data.len() - RESET_TOKEN_SIZE..];
        let mut token = [0u8; RESET_TOKEN_SIZE];
        token.copy_from_slice(tail);
        srst.get(&ResetToken::new(token)).copied()
    }

    // Process loop

    /// Tick every connection that is due, then drain outgoing packets
    pub fn process_conns(&mut self, now: Instant) {
        self.enter_process();

        while let Some(h) = self.attq.pop(now) {
            if let Some(h) = self.decref(h, ConnFlags::ATTQ) {
                if !self.conns[h.0].flags.contains(ConnFlags::TICKABLE) {
                    let key = self.conns[h.0].last_ticked;
                    self.conns_tickable.insert(key, h);
                    self.incref(h, ConnFlags::TICKABLE);
                }
            }
        }

        self.process_connections(now);
        self.exit_process();
    }

    fn process_connections(&mut self, now: Instant) {
        self.reset_deadline(Instant::now());

        if !self.can_send {
            if let Some(resume_at) = self.resume_sending_at {
                if now > resume_at {
                    info!("failsafe activated: resume sending packets again after timeout");
                    self.can_send = true;
                }
            }
        }

        let mut closed: Vec<ConnectionHandle> = Vec::new();
        let mut ticked: Vec<ConnectionHandle> = Vec::new();

        let mut i: u64 = 0;
        while let Some(h) = self.next_tickable() {
            let conn = &mut self.conns[h.0];
            let tick_res = conn.driver.tick(now);
            // `i` maintains relative order when ticks share a timestamp
            conn.last_ticked = now + Duration::from_micros(i);
            i += 1;
            if tick_res.contains(TickResult::SEND)
                && !self.conns[h.0].flags.contains(ConnFlags::HAS_OUTGOING)
            {
                let key = self.conns[h.0].last_sent;
                self.conns_out.insert(key, h);
                self.incref(h, ConnFlags::HAS_OUTGOING);
            }
            if tick_res.contains(TickResult::CLOSE) {
                closed.push(h);
                self.incref(h, ConnFlags::CLOSING);
                if self.conns[h.0].flags.contains(ConnFlags::HASHED) {
                    self.remove_conn_from_hash(h);
                }
            } else {
                ticked.push(h);
                self.incref(h, ConnFlags::TICKED);
            }
        }

        if self.can_send && self.has_unsent_packets() {
            self.send_packets_out(now, &mut ticked, &mut closed);
        }

        for h in closed.drain(..) {
            let _ = self.decref(h, ConnFlags::CLOSING);
        }

        for h in ticked.drain(..) {
            let Some(h) = self.decref(h, ConnFlags::TICKED) else {
                continue;
            };
            let conn = &self.conns[h.0];
            if !conn.flags.contains(ConnFlags::TICKABLE) && conn.driver.is_tickable() {
                let key = conn.last_ticked;
                self.conns_tickable.insert(key, h);
                self.incref(h, ConnFlags::TICKABLE);
            } else if !self.conns[h.0].flags.contains(ConnFlags::ATTQ) {
                match self.conns[h.0].driver.next_tick_time() {
                    Some(tick_time) => {
                        self.attq.add(h, tick_time);
                        self.incref(h, ConnFlags::ATTQ);
                    }
                    None => {
                        // Nothing in the connection contract forbids this;
                        // the connection stays dormant until an external
                        // event wakes it
                        warn!(conn = h.0, "ticked connection reports no next tick time");
                    }
                }
            }
        }
    }

    /// Pop the oldest-ticked connection, dropping its ATTQ entry if any
    fn next_tickable(&mut self) -> Option<ConnectionHandle> {
        let (_, h) = self.conns_tickable.pop()?;
        let h = self.decref(h, ConnFlags::TICKABLE)?;
        if self.conns[h.0].flags.contains(ConnFlags::ATTQ) {
            self.attq.remove(h);
            return self.decref(h, ConnFlags::ATTQ);
        }
        Some(h)
    }

    // Egress

    /// Drain outgoing packets without ticking anything first
    ///
    /// Also re-arms sending if a previous sink shortfall paused it.
    pub fn send_unsent_packets(&mut self, now: Instant) {
        self.enter_process();
        let mut closed: Vec<ConnectionHandle> = Vec::new();
        let mut ticked: Vec<ConnectionHandle> = Vec::new();
        self.reset_deadline(Instant::now());
        if !self.can_send {
            debug!("can send again");
            self.can_send = true;
        }
        self.send_packets_out(now, &mut ticked, &mut closed);
        for h in closed.drain(..) {
            let _ = self.decref(h, ConnFlags::CLOSING);
        }
        self.exit_process();
    }

    fn send_packets_out(
        &mut self,
        now: Instant,
        ticked: &mut Vec<ConnectionHandle>,
        closed: &mut Vec<ConnectionHandle>,
    ) {
        let mut iter = OutIter::default();
        let mut n_batches_sent = 0usize;
        let mut n_sent = 0usize;
        let mut shrink = false;
        let mut deadline_exceeded = false;

        'conns: while let Some(h) = self.coi_next(&mut iter) {
            let Some(mut packet) = self.conns[h.0].driver.next_packet_to_send() else {
                trace!(conn = h.0, "batched all outgoing packets");
                self.coi_deactivate(&mut iter, h);
                continue;
            };

            let peer_ipv6 = self.conns[h.0].peer.is_ipv6();
            if packet.enc.as_ref().map_or(false, |enc| enc.ipv6 != peer_ipv6) {
                // Peer address family changed since the packet was
                // encrypted; the buffer goes back for re-encryption
                if let Some(enc) = packet.enc.take() {
                    let ctx = self.conns[h.0].peer_ctx.clone();
                    self.alloc.reclaim(ctx.as_ref(), enc.buf, enc.ipv6);
                }
            }

            if packet.enc.is_none() && !packet.no_encrypt {
                let status = {
                    let Self { conns, alloc, .. } = self;
                    conns[h.0].driver.encrypt_packet(&mut packet, alloc.as_mut())
                };
                match status {
                    EncryptStatus::NoMem => {
                        // Send what we have and wait for a better moment
                        self.conns[h.0].driver.packet_not_sent(packet);
                        break 'conns;
                    }
                    EncryptStatus::BadCrypt => {
                        self.conns[h.0].driver.packet_not_sent(packet);
                        info!(conn = h.0, "connection has unsendable packets");
                        if !self.conns[h.0].flags.contains(ConnFlags::EVANESCENT) {
                            if !self.conns[h.0].flags.contains(ConnFlags::CLOSING) {
                                closed.push(h);
                                self.incref(h, ConnFlags::CLOSING);
                                if self.conns[h.0].flags.contains(ConnFlags::HASHED) {
                                    self.remove_conn_from_hash(h);
                                }
                            }
                            self.coi_deactivate(&mut iter, h);
                            if self.conns[h.0].flags.contains(ConnFlags::TICKED) {
                                ticked.retain(|&x| x != h);
                                let _ = self.decref(h, ConnFlags::TICKED);
                            }
                        }
                        continue;
                    }
                    EncryptStatus::Ok => {}
                }
            }

            let conn = &self.conns[h.0];
            let contents = match &packet.enc {
                Some(enc) => enc.buf.clone(),
                None => packet.data.clone(),
            };
            trace!(conn = h.0, packno = packet.packno, "batched packet");
            self.batch.outs.push(Transmit {
                contents,
                ecn: packet.ecn,
                local: conn.local,
                destination: conn.peer,
                peer_ctx: conn.peer_ctx.clone(),
                handle: h,
                sent: now,
            });
            self.batch.conns.push(h);
            self.batch.packets.push(packet);

            if self.batch.outs.len() == self.batch_size {
                let batch_size = self.batch_size;
                let w = self.send_batch(now, &mut iter);
                n_batches_sent += 1;
                n_sent += w;
                if w < batch_size {
                    shrink = true;
                    break;
                }
                deadline_exceeded = self.check_deadline();
                if deadline_exceeded {
                    break;
                }
                self.grow_batch_size();
            }
        }

        let n = self.batch.outs.len();
        if n > 0 {
            let w = self.send_batch(now, &mut iter);
            n_sent += w;
            shrink = w < n;
            n_batches_sent += 1;
            deadline_exceeded = self.check_deadline();
        }

        if shrink {
            self.shrink_batch_size();
        } else if n_batches_sent > 1 && !deadline_exceeded {
            self.grow_batch_size();
        }

        self.coi_reheap(&mut iter);

        debug!(n_sent, "send round done");
    }

    /// Hand the staged batch to the sink and settle every packet's fate
    fn send_batch(&mut self, now: Instant, iter: &mut OutIter) -> usize {
        let n_to_send = self.batch.outs.len();
        // Stamp sent time before the write so a blocking sink cannot make
        // the peer's RTT look shorter than it is
        for (out, packet) in self
            .batch
            .outs
            .iter_mut()
            .zip(self.batch.packets.iter_mut())
        {
            out.sent = now;
            packet.sent = Some(now);
        }

        let ret = self.sink.send(&self.batch.outs);
        if ret < n_to_send as isize {
            self.can_send = false;
            self.resume_sending_at = Some(now + RESUME_SENDING_DELAY);
            debug!("cannot send packets");
        }
        let n_sent = if ret >= 0 {
            debug!(returned = ret, out_of = n_to_send, "packets out");
            ret as usize
        } else {
            error!(code = ret, "packets out returned an error");
            0
        };
        if n_sent > 0 {
            self.last_sent = now + Duration::from_micros(n_sent as u64);
        }

        let conns = mem::take(&mut self.batch.conns);
        let mut packets = mem::take(&mut self.batch.packets);
        self.batch.outs.clear();
        let unsent = packets.split_off(n_sent.min(packets.len()));

        for (i, mut packet) in packets.into_iter().enumerate() {
            let h = conns[i];
            // `i` maintains relative order between packets stamped with the
            // same `now`
            self.conns[h.0].last_sent = now + Duration::from_micros(i as u64);
            // The buffer is returned as soon as the packet is out; unsent
            // packets keep theirs until the retry
            if let Some(enc) = packet.enc.take() {
                let ctx = self.conns[h.0].peer_ctx.clone();
                self.alloc.release(ctx.as_ref(), enc.buf, enc.ipv6);
            }
            self.conns[h.0].driver.packet_sent(packet);
        }

        // Unsent packets go back in reverse so the connection's transmit
        // order survives the retry
        for (j, packet) in unsent.into_iter().enumerate().rev() {
            let h = conns[n_sent + j];
            self.conns[h.0].driver.packet_not_sent(packet);
            if !self.conns[h.0]
                .flags
                .intersects(ConnFlags::COI_ACTIVE | ConnFlags::EVANESCENT)
            {
                self.coi_reactivate(iter, h);
            }
        }

        n_sent
    }

    fn grow_batch_size(&mut self) {
        self.batch_size = (self.batch_size << 1).min(MAX_OUT_BATCH_SIZE);
    }

    fn shrink_batch_size(&mut self) {
        self.batch_size = (self.batch_size >> 1).max(MIN_OUT_BATCH_SIZE);
    }

    fn reset_deadline(&mut self, real_now: Instant) {
        self.deadline = self.config.proc_time_thresh.map(|t| real_now + t);
        self.past_deadline = false;
    }

    /// True (and latches) once the current call overran its time budget
    fn check_deadline(&mut self) -> bool {
        let Some(deadline) = self.deadline else {
            return false;
        };
        if Instant::now() > deadline {
            info!(
                thresh = ?self.config.proc_time_thresh,
                "went past processing threshold, stop sending"
            );
            self.past_deadline = true;
            true
        } else {
            false
        }
    }

    // Egress iterator plumbing

    fn coi_next(&mut self, iter: &mut OutIter) -> Option<ConnectionHandle> {
        if let Some((key, h)) = self.conns_out.pop() {
            #[cfg(debug_assertions)]
            {
                if let Some(last) = iter.last_heap_key {
                    debug_assert!(last <= key);
                }
                iter.last_heap_key = Some(key);
            }
            #[cfg(not(debug_assertions))]
            let _ = key;
            iter.active.push_back(h);
            self.conns[h.0].flags |= ConnFlags::COI_ACTIVE;
            return Some(h);
        }
        // Rotate through whatever is still active
        let h = iter.active.pop_front()?;
        iter.active.push_back(h);
        Some(h)
    }

    fn coi_deactivate(&mut self, iter: &mut OutIter, h: ConnectionHandle) {
        if self.conns[h.0].flags.contains(ConnFlags::EVANESCENT) {
            return;
        }
        debug_assert!(self.conns[h.0].flags.contains(ConnFlags::COI_ACTIVE));
        if let Some(pos) = iter.active.iter().position(|&x| x == h) {
            iter.active.remove(pos);
        }
        self.conns[h.0].flags -= ConnFlags::COI_ACTIVE;
        iter.inactive.push(h);
        self.conns[h.0].flags |= ConnFlags::COI_INACTIVE;
    }

    fn coi_reactivate(&mut self, iter: &mut OutIter, h: ConnectionHandle) {
        debug_assert!(self.conns[h.0].flags.contains(ConnFlags::COI_INACTIVE));
        if let Some(pos) = iter.inactive.iter().position(|&x| x == h) {
            iter.inactive.remove(pos);
        }
        self.conns[h.0].flags -= ConnFlags::COI_INACTIVE;
        iter.active.push_back(h);
        self.conns[h.0].flags |= ConnFlags::COI_ACTIVE;
    }

    /// Put every connection touched this round back where it belongs
    fn coi_reheap(&mut self, iter: &mut OutIter) {
        while let Some(h) = iter.active.pop_front() {
            self.conns[h.0].flags -= ConnFlags::COI_ACTIVE;
            let key = self.conns[h.0].last_sent;
            self.conns_out.insert(key, h);
        }
        for h in iter.inactive.drain(..) {
            self.conns[h.0].flags -= ConnFlags::COI_INACTIVE;
            let _ = self.decref(h, ConnFlags::HAS_OUTGOING);
        }
    }

    // Wakeup queries

    /// When the application should next call [`Engine::process_conns`]
    ///
    /// `Some(now)` means immediately: a connection is tickable, or a
    /// previous round overran its deadline with packets still queued.
    /// `None` means nothing is pending at all.
    pub fn earliest_adv_tick(&self, now: Instant) -> Option<Instant> {
        if (self.past_deadline && !self.conns_out.is_empty()) || !self.conns_tickable.is_empty() {
            return Some(now);
        }
        let next_attq = self.attq.next_time();
        if self.can_send {
            next_attq
        } else {
            match (next_attq, self.resume_sending_at) {
                (Some(a), Some(r)) => Some(a.min(r)),
                (Some(a), None) => Some(a),
                (None, r) => r,
            }
        }
    }

    /// Number of advisory ticks scheduled within `from_now` microseconds
    ///
    /// Negative offsets measure the same distance into the future.
    pub fn count_attq(&self, now: Instant, from_now: i64) -> usize {
        let t = now + Duration::from_micros(from_now.unsigned_abs());
        self.attq.count_before(t)
    }

    // Test-only audit of the reference-flag invariants

    #[cfg(test)]
    pub(crate) fn audit_refs(&self) {
        assert!(!self.in_process);
        assert!((MIN_OUT_BATCH_SIZE..=MAX_OUT_BATCH_SIZE).contains(&self.batch_size));
        for (i, conn) in self.conns.iter() {
            let h = ConnectionHandle(i);
            let refs = conn.refs();
            assert!(!refs.is_empty(), "live connection with empty ref mask");
            let mut memberships = 0u32;
            let tickable = self.conns_tickable.count_of(h);
            assert_eq!(tickable, conn.flags.contains(ConnFlags::TICKABLE) as usize);
            memberships += tickable as u32;
            let outgoing = self.conns_out.count_of(h);
            assert_eq!(outgoing, conn.flags.contains(ConnFlags::HAS_OUTGOING) as usize);
            memberships += outgoing as u32;
            let attq = self.attq.contains(h) as usize;
            assert_eq!(attq, conn.flags.contains(ConnFlags::ATTQ) as usize);
            memberships += attq as u32;
            if conn.flags.contains(ConnFlags::HASHED) {
                assert!(self.registry.count_of(h) >= 1);
                memberships += 1;
            } else {
                assert_eq!(self.registry.count_of(h), 0);
            }
            // Transient lists only exist inside a processing call
            assert!(!conn.flags.intersects(ConnFlags::TICKED | ConnFlags::CLOSING));
            assert_eq!(memberships, refs.bits().count_ones());
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        debug!("destroying engine");
        self.destroying = true;

        while let Some((_, h)) = self.conns_out.pop() {
            debug_assert!(self.conns[h.0].flags.contains(ConnFlags::HAS_OUTGOING));
            let _ = self.decref(h, ConnFlags::HAS_OUTGOING);
        }
        while let Some((_, h)) = self.conns_tickable.pop() {
            debug_assert!(self.conns[h.0].flags.contains(ConnFlags::TICKABLE));
            let _ = self.decref(h, ConnFlags::TICKABLE);
        }

        let handles: Vec<ConnectionHandle> =
            self.conns.iter().map(|(i, _)| ConnectionHandle(i)).collect();
        for h in handles {
            self.force_close_conn(h);
        }
        debug_assert_eq!(self.n_conns, 0);
        debug_assert_eq!(self.conns_out.len(), 0);
        debug_assert_eq!(self.conns_tickable.len(), 0);
        debug_assert_eq!(self.attq.len(), 0);
        debug_assert_eq!(self.registry.len(), 0);
    }
}

impl Engine {
    /// Engine-teardown path only (`Drop`)
    fn force_close_conn(&mut self, h: ConnectionHandle) {
        debug_assert!(self.destroying);
        let flags = self.conns[h.0].flags;
        debug_assert!(flags.intersects(ConnFlags::REF_MASK));
        debug_assert!(!flags.contains(ConnFlags::HAS_OUTGOING));
        debug_assert!(!flags.contains(ConnFlags::TICKABLE));
        debug_assert!(!flags.contains(ConnFlags::CLOSING));
        let mut alive = Some(h);
        if flags.contains(ConnFlags::ATTQ) {
            self.attq.remove(h);
            alive = self.decref(h, ConnFlags::ATTQ);
        }
        if let Some(h) = alive {
            if self.conns[h.0].flags.contains(ConnFlags::HASHED) {
                self.remove_conn_from_hash(h);
            }
        }
    }
}
