//! End-to-end scenarios driving the engine through its public surface only.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use quicmux::{
    ConnectionDriver, ConnectionId, DatagramSink, Dispatch, DispatchError, EncData, EncryptStatus,
    Engine, EngineConfig, PacketBufAllocator, PacketIn, PacketOut, QuicVersion, ResetToken, Side,
    TickResult, Transmit, VersionSet,
};

#[derive(Default)]
struct EchoState {
    received: Vec<usize>,
    echo_queue: VecDeque<usize>,
    sent: Vec<usize>,
    resets: usize,
    tickable: bool,
    next_tick: Option<Instant>,
    destroyed: bool,
}

/// Connection that answers every packet with one of the same length
struct EchoConn {
    cid: Option<ConnectionId>,
    version: QuicVersion,
    state: Rc<RefCell<EchoState>>,
}

impl EchoConn {
    fn boxed(
        cid: Option<ConnectionId>,
        version: QuicVersion,
        state: &Rc<RefCell<EchoState>>,
    ) -> Box<dyn ConnectionDriver> {
        Box::new(Self {
            cid,
            version,
            state: state.clone(),
        })
    }
}

impl ConnectionDriver for EchoConn {
    fn tick(&mut self, now: Instant) -> TickResult {
        let mut st = self.state.borrow_mut();
        st.tickable = false;
        st.next_tick = Some(now + Duration::from_millis(30));
        if st.echo_queue.is_empty() {
            TickResult::empty()
        } else {
            TickResult::SEND
        }
    }

    fn next_packet_to_send(&mut self) -> Option<PacketOut> {
        let len = self.state.borrow_mut().echo_queue.pop_front()?;
        Some(PacketOut::new(Bytes::from(vec![0u8; len]), len as u64))
    }

    fn packet_sent(&mut self, packet: PacketOut) {
        self.state.borrow_mut().sent.push(packet.data.len());
    }

    fn packet_not_sent(&mut self, packet: PacketOut) {
        self.state
            .borrow_mut()
            .echo_queue
            .push_front(packet.data.len());
    }

    fn packet_in(&mut self, packet: PacketIn) {
        let mut st = self.state.borrow_mut();
        st.received.push(packet.data.len());
        st.echo_queue.push_back(packet.data.len());
    }

    fn is_tickable(&self) -> bool {
        let st = self.state.borrow();
        st.tickable || !st.echo_queue.is_empty()
    }

    fn next_tick_time(&self) -> Option<Instant> {
        self.state.borrow().next_tick
    }

    fn stateless_reset(&mut self) {
        let mut st = self.state.borrow_mut();
        st.resets += 1;
        st.tickable = true;
    }

    fn destroy(&mut self) {
        self.state.borrow_mut().destroyed = true;
    }

    fn encrypt_packet(
        &mut self,
        packet: &mut PacketOut,
        alloc: &mut dyn PacketBufAllocator,
    ) -> EncryptStatus {
        let mut buf = alloc.alloc(None, packet.data.len(), false);
        buf.extend_from_slice(&packet.data);
        packet.enc = Some(EncData {
            buf: buf.freeze(),
            ipv6: false,
        });
        EncryptStatus::Ok
    }

    fn primary_cid(&self) -> Option<ConnectionId> {
        self.cid
    }

    fn negotiated_version(&self) -> QuicVersion {
        self.version
    }
}

/// Datagram lengths per sink invocation
type SinkLog = Rc<RefCell<Vec<Vec<usize>>>>;

fn accepting_sink(log: &SinkLog) -> Box<dyn DatagramSink> {
    let log = log.clone();
    Box::new(move |batch: &[Transmit]| -> isize {
        log.borrow_mut()
            .push(batch.iter().map(|t| t.contents.len()).collect());
        batch.len() as isize
    })
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

/// IETF Initial carrying `dcid`, padded out to `total` bytes
fn build_initial(dcid: &[u8], total: usize) -> Vec<u8> {
    let header = 1 + 4 + 1 + dcid.len() + 1 + 1 + 2;
    let payload = total - header;
    assert!(payload < 16384);
    let mut buf = vec![0xc0];
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.push(dcid.len() as u8);
    buf.extend_from_slice(dcid);
    buf.push(0); // zero-length SCID
    buf.push(0); // empty token
    buf.push(0x40 | (payload >> 8) as u8);
    buf.push(payload as u8);
    buf.extend_from_slice(&vec![0u8; payload]);
    buf
}

fn cid_server_config() -> EngineConfig {
    let mut config = EngineConfig::default_for(Side::Server);
    config.versions = VersionSet::V1;
    config
}

#[test]
fn singleton_round_trip() {
    let now = Instant::now();
    let log: SinkLog = Rc::default();
    let mut engine = Engine::new(Side::Server, cid_server_config(), accepting_sink(&log)).unwrap();

    let cid = ConnectionId::new(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    let state = Rc::new(RefCell::new(EchoState::default()));
    engine
        .insert_conn(
            now,
            EchoConn::boxed(Some(cid), QuicVersion::V1, &state),
            addr(4433),
            addr(50_000),
            None,
        )
        .unwrap();

    let datagram = build_initial(&cid, 1200);
    assert_eq!(datagram.len(), 1200);
    let res = engine
        .packet_in(
            now,
            Bytes::from(datagram),
            addr(4433),
            addr(50_000),
            None,
            None,
        )
        .unwrap();
    assert_eq!(res, Dispatch::Routed);
    assert_eq!(state.borrow().received, vec![1200]);

    engine.process_conns(now);

    // Exactly one sink call carrying the echoed datagram
    let batches = log.borrow();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0], vec![1200]);
    drop(batches);
    assert_eq!(state.borrow().sent, vec![1200]);

    // The connection parked itself on the advisory queue at a finite time
    assert_eq!(engine.count_attq(now, 60_000_000), 1);
    let wake = engine.earliest_adv_tick(now).unwrap();
    assert!(wake > now);

    // Idempotence: nothing due yet, so nothing more happens
    engine.process_conns(now + Duration::from_micros(1));
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(state.borrow().sent, vec![1200]);
}

#[test]
fn truncated_trailing_packet_surfaces_parse_error() {
    let now = Instant::now();
    let log: SinkLog = Rc::default();
    let mut engine = Engine::new(Side::Server, cid_server_config(), accepting_sink(&log)).unwrap();

    let cid = ConnectionId::new(&[9; 8]);
    let state = Rc::new(RefCell::new(EchoState::default()));
    engine
        .insert_conn(
            now,
            EchoConn::boxed(Some(cid), QuicVersion::V1, &state),
            addr(4433),
            addr(50_000),
            None,
        )
        .unwrap();

    let mut datagram = build_initial(&cid, 400);
    let mut second = build_initial(&cid, 200);
    second.truncate(150); // chop the second packet mid-payload
    datagram.extend_from_slice(&second);

    let err = engine
        .packet_in(
            now,
            Bytes::from(datagram),
            addr(4433),
            addr(50_000),
            None,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, DispatchError::Parse(_)));
    // The intact first packet was still delivered
    assert_eq!(state.borrow().received, vec![400]);
}

#[test]
fn stateless_reset_routes_by_token() {
    let now = Instant::now();
    let log: SinkLog = Rc::default();
    let mut config = cid_server_config();
    config.honor_prst = true;
    let mut engine = Engine::new(Side::Server, config, accepting_sink(&log)).unwrap();

    let cid = ConnectionId::new(&[0xaa; 8]);
    let state = Rc::new(RefCell::new(EchoState::default()));
    let handle = engine
        .insert_conn(
            now,
            EchoConn::boxed(Some(cid), QuicVersion::V1, &state),
            addr(4433),
            addr(50_000),
            None,
        )
        .unwrap();
    let token = ResetToken::new([7; 16]);
    engine.insert_reset_token(handle, token);

    // Park the connection first so the reset visibly re-wakes it
    engine.process_conns(now);
    assert!(engine.earliest_adv_tick(now) > Some(now));

    // Short-header shape, unknown DCID, trailing token
    let mut datagram = vec![0x45];
    datagram.extend_from_slice(&[0xee; 8]); // no such CID
    datagram.extend_from_slice(&[0; 8]);
    datagram.extend_from_slice(&[7; 16]);
    let res = engine
        .packet_in(
            now,
            Bytes::from(datagram),
            addr(4433),
            addr(50_000),
            None,
            None,
        )
        .unwrap();

    // Dropped from the caller's perspective, but the connection heard it
    assert_eq!(res, Dispatch::Unclaimed);
    assert_eq!(state.borrow().resets, 1);
    assert_eq!(engine.earliest_adv_tick(now), Some(now));
}

#[test]
fn one_connection_per_port_in_addressed_mode() {
    let now = Instant::now();
    let log: SinkLog = Rc::default();
    let mut config = EngineConfig::default_for(Side::Client);
    config.versions = VersionSet::V1;
    config.scid_len = 0;
    let mut engine = Engine::new(Side::Client, config, accepting_sink(&log)).unwrap();

    let first = Rc::new(RefCell::new(EchoState::default()));
    engine
        .connect(
            now,
            EchoConn::boxed(None, QuicVersion::V1, &first),
            addr(4433),
            addr(50_000),
            None,
        )
        .unwrap();

    let second = Rc::new(RefCell::new(EchoState::default()));
    let err = engine
        .connect(
            now,
            EchoConn::boxed(None, QuicVersion::V1, &second),
            addr(4433),
            addr(50_001),
            None,
        )
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot have more than one connection on the same port"
    );
    assert_eq!(engine.n_conns(), 1);
}

#[test]
fn addressed_mode_routes_by_local_port() {
    let now = Instant::now();
    let log: SinkLog = Rc::default();
    let mut config = EngineConfig::default_for(Side::Client);
    config.versions = VersionSet::V1;
    config.scid_len = 0;
    let mut engine = Engine::new(Side::Client, config, accepting_sink(&log)).unwrap();

    let state = Rc::new(RefCell::new(EchoState::default()));
    engine
        .connect(
            now,
            EchoConn::boxed(None, QuicVersion::V1, &state),
            addr(4433),
            addr(50_000),
            None,
        )
        .unwrap();

    // Short header; with zero-length CIDs the port does all the routing
    let mut datagram = vec![0x45];
    datagram.extend_from_slice(&[0; 32]);
    let res = engine
        .packet_in(
            now,
            Bytes::from(datagram.clone()),
            addr(4433),
            addr(50_000),
            None,
            None,
        )
        .unwrap();
    assert_eq!(res, Dispatch::Routed);
    assert_eq!(state.borrow().received, vec![33]);

    // A datagram for a port with no connection is an error outright
    let err = engine
        .packet_in(
            now,
            Bytes::from(datagram),
            addr(9999),
            addr(50_000),
            None,
            None,
        )
        .unwrap_err();
    assert_eq!(err, DispatchError::NoConnection);
}

#[test]
fn legacy_public_reset_dropped_unless_honored() {
    let now = Instant::now();
    let log: SinkLog = Rc::default();
    let mut config = EngineConfig::default_for(Side::Client);
    config.versions = VersionSet::Q043;
    config.support_tcid0 = true; // routes by address
    let mut engine = Engine::new(Side::Client, config, accepting_sink(&log)).unwrap();

    let state = Rc::new(RefCell::new(EchoState::default()));
    engine
        .connect(
            now,
            EchoConn::boxed(
                Some(ConnectionId::new(&[3; 8])),
                QuicVersion::Q043,
                &state,
            ),
            addr(4433),
            addr(50_000),
            None,
        )
        .unwrap();

    // gQUIC public reset: CID flag + reset flag
    let mut datagram = vec![0x08 | 0x02];
    datagram.extend_from_slice(&[3; 8]);
    datagram.extend_from_slice(&[0; 16]);
    let res = engine
        .packet_in(
            now,
            Bytes::from(datagram),
            addr(4433),
            addr(50_000),
            None,
            None,
        )
        .unwrap();
    assert_eq!(res, Dispatch::Unclaimed);
    assert!(state.borrow().received.is_empty());
}

#[test]
fn coalesced_packets_all_reach_the_connection() {
    let now = Instant::now();
    let log: SinkLog = Rc::default();
    let mut engine = Engine::new(Side::Server, cid_server_config(), accepting_sink(&log)).unwrap();

    let cid = ConnectionId::new(&[5; 8]);
    let state = Rc::new(RefCell::new(EchoState::default()));
    engine
        .insert_conn(
            now,
            EchoConn::boxed(Some(cid), QuicVersion::V1, &state),
            addr(4433),
            addr(50_000),
            None,
        )
        .unwrap();

    let mut datagram = build_initial(&cid, 600);
    datagram.extend_from_slice(&build_initial(&cid, 400));
    let res = engine
        .packet_in(
            now,
            Bytes::from(datagram),
            addr(4433),
            addr(50_000),
            None,
            None,
        )
        .unwrap();
    assert_eq!(res, Dispatch::Routed);
    assert_eq!(state.borrow().received, vec![600, 400]);

    // Both echoes leave in one batch, oldest connection first
    engine.process_conns(now);
    assert_eq!(*log.borrow(), vec![vec![600, 400]]);
}

#[test]
fn unknown_cid_is_unclaimed() {
    let now = Instant::now();
    let log: SinkLog = Rc::default();
    let mut engine = Engine::new(Side::Server, cid_server_config(), accepting_sink(&log)).unwrap();

    let datagram = build_initial(&[0xde; 8], 1200);
    let res = engine
        .packet_in(
            now,
            Bytes::from(datagram),
            addr(4433),
            addr(50_000),
            None,
            None,
        )
        .unwrap();
    assert_eq!(res, Dispatch::Unclaimed);
    assert_eq!(engine.earliest_adv_tick(now), None);
}
