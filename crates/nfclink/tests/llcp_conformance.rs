// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nfclink contributors

//! LLCP 1.1 / SNEP 1.0 wire conformance tests
//!
//! Drives the engine with literal byte sequences and inspects the emitted
//! PDUs byte-for-byte: link activation, connect by service name, windowed
//! I PDU exchange with fragmentation, service discovery, aggregated frames,
//! the SNEP Put path, and the terminal error states.
//!
//! # References
//!
//! - NFCForum-TS-LLCP_1.1 Sections 4.3, 5.2, 5.6
//! - NFCForum-TS-SNEP_1.0 Sections 3, 5, 6

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use nfclink::{
    ConnState, ConnectResult, ConnectionCtx, ConnectionHandler, Llc, LlcIo, LlcState,
    PeerConnection, PeerService, PeerServices, ServiceHandler, SnepServer, SnepState,
};

// ============================================================================
// Scripted I/O: the window is always open, every sent PDU is recorded
// ============================================================================

struct ScriptIo {
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
    fail: bool,
}

impl LlcIo for ScriptIo {
    fn start(&mut self) -> bool {
        true
    }

    fn can_send(&self) -> bool {
        true
    }

    fn send(&mut self, pdu: &[u8]) -> bool {
        if self.fail {
            return false;
        }
        self.sent.borrow_mut().push(pdu.to_vec());
        true
    }

    fn error(&self) -> bool {
        self.fail
    }
}

fn make_llc(services: PeerServices) -> (Llc, Rc<RefCell<Vec<Vec<u8>>>>) {
    let sent = Rc::new(RefCell::new(Vec::new()));
    let io = Rc::new(RefCell::new(ScriptIo {
        sent: Rc::clone(&sent),
        fail: false,
    }));
    (Llc::new(io, services, &[]), sent)
}

fn drain(sent: &Rc<RefCell<Vec<Vec<u8>>>>) -> Vec<Vec<u8>> {
    std::mem::take(&mut sent.borrow_mut())
}

// ============================================================================
// Byte-sink service: accepts connections, records delivered payloads
// ============================================================================

#[derive(Default, Clone)]
struct Sink {
    data: Rc<RefCell<Vec<u8>>>,
    datagrams: Rc<RefCell<Vec<Vec<u8>>>>,
}

struct SinkConnection {
    data: Rc<RefCell<Vec<u8>>>,
}

impl ConnectionHandler for SinkConnection {
    fn data_received(&mut self, _conn: &mut ConnectionCtx<'_>, data: &[u8]) {
        self.data.borrow_mut().extend_from_slice(data);
    }
}

impl ServiceHandler for Sink {
    fn new_accept(
        &mut self,
        _service: &PeerService,
        _rsap: u8,
    ) -> Option<Box<dyn ConnectionHandler>> {
        Some(Box::new(SinkConnection {
            data: Rc::clone(&self.data),
        }))
    }

    fn datagram_received(&mut self, _ssap: u8, data: &[u8]) {
        self.datagrams.borrow_mut().push(data.to_vec());
    }
}

fn capture_result(
    slot: &Rc<RefCell<Option<ConnectResult>>>,
) -> impl FnOnce(&PeerConnection, ConnectResult) + 'static {
    let slot = Rc::clone(slot);
    move |_conn, result| *slot.borrow_mut() = Some(result)
}

// ============================================================================
// S1: CONNECT by service name succeeds
// ============================================================================

#[test]
fn test_s1_connect_by_sn_succeeds() {
    let mut services = PeerServices::new();
    let client = PeerService::new(None, Box::new(Sink::default()));
    services.add(&client).unwrap();
    assert_eq!(client.sap(), 0x20);

    let (llc, sent) = make_llc(services);

    // Two SYMM keep-alives keep the link in START
    llc.io_received(&[0x00, 0x00]);
    llc.io_received(&[0x00, 0x00]);
    assert_eq!(llc.state(), LlcState::Start);

    let result = Rc::new(RefCell::new(None));
    let conn = llc
        .connect_sn(&client, "urn:nfc:sn:snep", capture_result(&result))
        .unwrap();
    assert_eq!(conn.state(), ConnState::Connecting);

    // CONNECT DSAP=1 SSAP=32 with MIUX=0x7ff, RW=15, SN=urn:nfc:sn:snep
    let frames = drain(&sent);
    assert_eq!(
        frames,
        vec![vec![
            0x05, 0x20, 0x02, 0x02, 0x07, 0xff, 0x05, 0x01, 0x0f, 0x06, 0x0f, 0x75, 0x72, 0x6e,
            0x3a, 0x6e, 0x66, 0x63, 0x3a, 0x73, 0x6e, 0x3a, 0x73, 0x6e, 0x65, 0x70,
        ]]
    );

    // Peer answers CC DSAP=32 SSAP=4 with MIUX=0x7ff, RW=15
    llc.io_received(&[0x81, 0x84, 0x02, 0x02, 0x07, 0xff, 0x05, 0x01, 0x0f]);
    assert_eq!(conn.state(), ConnState::Active);
    assert_eq!(conn.rsap(), 4, "remote SAP taken from the CC source");
    assert_eq!(conn.rmiu(), 2175);
    assert_eq!(*result.borrow(), Some(ConnectResult::Ok));
    assert_eq!(llc.state(), LlcState::Active);

    // RW(R)=15: two sends go out back to back without an acknowledgement
    assert!(conn.send(b"ab"));
    assert!(conn.send(b"cd"));
    let frames = drain(&sent);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], vec![0x13, 0x20, 0x00, b'a', b'b']);
    assert_eq!(frames[1], vec![0x13, 0x20, 0x10, b'c', b'd']);
    assert_eq!(conn.bytes_sent(), 4);
}

// ============================================================================
// S2: CONNECT rejected with DM
// ============================================================================

#[test]
fn test_s2_connect_rejected() {
    let mut services = PeerServices::new();
    let client = PeerService::new(None, Box::new(Sink::default()));
    services.add(&client).unwrap();

    let (llc, sent) = make_llc(services);
    let result = Rc::new(RefCell::new(None));
    let conn = llc
        .connect_sn(&client, "urn:nfc:sn:snep", capture_result(&result))
        .unwrap();
    drain(&sent);

    // DM DSAP=32 SSAP=0 reason=REJECT
    llc.io_received(&[0x81, 0xc0, 0x03]);
    assert_eq!(*result.borrow(), Some(ConnectResult::Rejected));
    assert_eq!(conn.state(), ConnState::Dead);

    // P7: sending into a dead connection fails
    assert!(!conn.send(b"late"));
}

// ============================================================================
// S3: fragmented I PDUs under RW(R)=1 (also P1 and P3)
// ============================================================================

#[test]
fn test_s3_fragmentation_and_window() {
    let mut services = PeerServices::new();
    let client = PeerService::new(None, Box::new(Sink::default()));
    services.add(&client).unwrap();

    let (llc, sent) = make_llc(services);
    let result = Rc::new(RefCell::new(None));
    let conn = llc
        .connect(&client, 4, capture_result(&result))
        .unwrap();
    drain(&sent);

    // Bare CC: remote keeps MIU 128, RW 1 defaults
    llc.io_received(&[0x81, 0x84]);
    assert_eq!(conn.state(), ConnState::Active);
    assert_eq!(conn.rmiu(), 128);

    let payload: Vec<u8> = (0..264).map(|i| (i & 0xff) as u8).collect();
    assert!(conn.send(&payload));
    assert_eq!(conn.bytes_queued(), 264 - 128);

    // P1: exactly one I PDU in flight, V(S)=0, window now closed
    let frames = drain(&sent);
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..3], &[0x13, 0x20, 0x00]);
    assert_eq!(frames[0].len(), 3 + 128);

    // RR N(R)=1 reopens the window for the second fragment
    llc.io_received(&[0x83, 0x44, 0x01]);
    let frames = drain(&sent);
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..3], &[0x13, 0x20, 0x10], "N(S)=1");
    assert_eq!(frames[0].len(), 3 + 128);

    // RR N(R)=2 releases the 8-byte tail
    llc.io_received(&[0x83, 0x44, 0x02]);
    let frames = drain(&sent);
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..3], &[0x13, 0x20, 0x20], "N(S)=2");
    assert_eq!(frames[0].len(), 3 + 8);

    assert_eq!(conn.bytes_queued(), 0);
    assert_eq!(conn.bytes_sent(), 264);
}

#[test]
fn test_p3_concatenation_across_buffers() {
    let mut services = PeerServices::new();
    let client = PeerService::new(None, Box::new(Sink::default()));
    services.add(&client).unwrap();

    let (llc, sent) = make_llc(services);
    let conn = llc.connect(&client, 4, |_, _| {}).unwrap();
    drain(&sent);

    // CC with RW=15 so the whole queue can flush unacknowledged
    llc.io_received(&[0x81, 0x84, 0x05, 0x01, 0x0f]);

    // Many small buffers plus one large: the wire must carry their exact
    // concatenation, repacked into 128-byte frames
    let mut expect = Vec::new();
    for i in 0..10u8 {
        let chunk = vec![i; 50];
        expect.extend_from_slice(&chunk);
        assert!(conn.send(&chunk));
    }
    let frames = drain(&sent);
    let mut wire = Vec::new();
    for f in &frames {
        assert_eq!(f[0], 0x13);
        assert_eq!(f[1], 0x20);
        assert!(f.len() <= 3 + 128, "fragment exceeds RMIU");
        wire.extend_from_slice(&f[3..]);
    }
    assert_eq!(wire, expect, "byte stream preserved across fragmentation");
    // Full frames first: 500 bytes = 3 x 128 + 116
    assert_eq!(frames.len(), 4);
}

// ============================================================================
// S4: duplicate CONNECT answered with DM[REJECT]
// ============================================================================

#[test]
fn test_s4_duplicate_connect() {
    let mut services = PeerServices::new();
    let snep = SnepServer::new();
    services.add(snep.service()).unwrap();

    let (llc, sent) = make_llc(services);

    let connect = [
        0x05, 0x20, 0x02, 0x02, 0x07, 0xff, 0x05, 0x01, 0x0f, 0x06, 0x0f, 0x75, 0x72, 0x6e, 0x3a,
        0x6e, 0x66, 0x63, 0x3a, 0x73, 0x6e, 0x3a, 0x73, 0x6e, 0x65, 0x70,
    ];
    llc.io_received(&connect);

    // First CONNECT is accepted: CC DSAP=32 SSAP=4 with our MIUX/RW
    let frames = drain(&sent);
    assert_eq!(
        frames,
        vec![vec![0x81, 0x84, 0x02, 0x02, 0x07, 0xff, 0x05, 0x01, 0x0f]]
    );
    assert_eq!(snep.state(), SnepState::Receiving);

    // Second CONNECT for the same (DSAP,SSAP) without a DISC in between
    llc.io_received(&connect);
    let frames = drain(&sent);
    assert_eq!(frames, vec![vec![0x81, 0xc4, 0x03]], "DM[REJECT]");
}

// ============================================================================
// S5: SNEP Put, fragmented (also P6)
// ============================================================================

fn snep_handshake(llc: &Llc, sent: &Rc<RefCell<Vec<Vec<u8>>>>, ssap: u8) {
    // CONNECT DSAP=1 (SN=urn:nfc:sn:snep) with RW=15
    let mut connect = vec![0x05, ssap, 0x05, 0x01, 0x0f, 0x06, 0x0f];
    connect.extend_from_slice(b"urn:nfc:sn:snep");
    llc.io_received(&connect);
    let frames = drain(sent);
    assert_eq!(frames.len(), 1, "CC expected");
    assert_eq!(frames[0][0] >> 2, ssap, "CC addressed back to the caller");
}

#[test]
fn test_s5_snep_put_fragmented() {
    let mut services = PeerServices::new();
    let snep = SnepServer::new();
    services.add(snep.service()).unwrap();

    let ndef_count = Rc::new(Cell::new(0));
    {
        let ndef_count = Rc::clone(&ndef_count);
        snep.add_ndef_changed_handler(move || ndef_count.set(ndef_count.get() + 1));
    }

    let (llc, sent) = make_llc(services);
    snep_handshake(&llc, &sent, 0x20);

    // First fragment: the 6-byte header only, PUT, length 31
    llc.io_received(&[0x13, 0x20, 0x00, 0x10, 0x02, 0x00, 0x00, 0x00, 0x1f]);
    let frames = drain(&sent);
    assert_eq!(frames.len(), 1);
    assert_eq!(
        frames[0],
        vec![0x83, 0x04, 0x01, 0x10, 0x80, 0x00, 0x00, 0x00, 0x00],
        "Continue response piggybacks N(R)=1"
    );
    assert_eq!(ndef_count.get(), 0, "nothing committed mid-stream");
    assert!(snep.ndef().is_none());

    // Second fragment: the 31 NDEF bytes; peer acknowledges our Continue
    let body: Vec<u8> = (1..=31).collect();
    let mut pdu = vec![0x13, 0x20, 0x11];
    pdu.extend_from_slice(&body);
    llc.io_received(&pdu);

    assert_eq!(ndef_count.get(), 1, "ndef_changed after full reassembly");
    assert_eq!(snep.ndef().unwrap().bytes(), body.as_slice());

    let frames = drain(&sent);
    assert_eq!(
        frames[0],
        vec![0x83, 0x04, 0x12, 0x10, 0x81, 0x00, 0x00, 0x00, 0x00],
        "Success response before the disconnect"
    );
    assert_eq!(frames[1], vec![0x81, 0x44], "DISC 4 -> 32");

    // Peer's DM finishes the teardown
    llc.io_received(&[0x11, 0xe0, 0x00]);
    assert_eq!(snep.state(), SnepState::Listening);
}

#[test]
fn test_p6_same_put_twice_signals_twice() {
    let mut services = PeerServices::new();
    let snep = SnepServer::new();
    services.add(snep.service()).unwrap();

    let ndef_count = Rc::new(Cell::new(0));
    {
        let ndef_count = Rc::clone(&ndef_count);
        snep.add_ndef_changed_handler(move || ndef_count.set(ndef_count.get() + 1));
    }

    let (llc, sent) = make_llc(services);

    for ssap in [0x20u8, 0x21u8] {
        snep_handshake(&llc, &sent, ssap);
        // Complete Put in one fragment: 3 payload bytes
        let hdr = ((4u16 << 10) | (0x0c << 6) | u16::from(ssap)).to_be_bytes();
        let pdu = vec![hdr[0], hdr[1], 0x00, 0x10, 0x02, 0x00, 0x00, 0x00, 0x03, 0xd1, 0x01, 0x00];
        llc.io_received(&pdu);
        drain(&sent);
        // Finish the disconnect so the SAP pair is free again
        let dm = ((4u16 << 10) | (0x07 << 6) | u16::from(ssap)).to_be_bytes();
        llc.io_received(&[dm[0], dm[1], 0x00]);
    }

    assert_eq!(ndef_count.get(), 2, "each Put commits and signals");
    assert_eq!(snep.ndef().unwrap().bytes(), &[0xd1, 0x01, 0x00]);
}

// ============================================================================
// S6: protocol violation halts the engine (also P7)
// ============================================================================

#[test]
fn test_s6_protocol_violation_halts_engine() {
    let mut services = PeerServices::new();
    let snep = SnepServer::new();
    services.add(snep.service()).unwrap();

    let (llc, sent) = make_llc(services);
    snep_handshake(&llc, &sent, 0x20);
    let states = Rc::new(RefCell::new(Vec::new()));
    {
        let states = Rc::clone(&states);
        llc.add_state_changed_handler(move |s| states.borrow_mut().push(s));
    }

    // A single byte is not an LLCP PDU
    llc.io_received(&[0xaa]);
    assert_eq!(llc.state(), LlcState::Error);
    assert_eq!(&*states.borrow(), &[LlcState::Error]);
    assert_eq!(snep.state(), SnepState::Listening, "connections aborted");

    // Terminal is absorbing: further traffic is ignored, nothing is sent
    llc.io_received(&[0x00, 0x00]);
    llc.io_received(&[0x13, 0x20, 0x00, 0x10, 0x02, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(llc.state(), LlcState::Error);
    assert!(drain(&sent).is_empty(), "no further PDUs after ERROR");
}

#[test]
fn test_transmit_failure_is_peer_lost() {
    let mut services = PeerServices::new();
    let client = PeerService::new(None, Box::new(Sink::default()));
    services.add(&client).unwrap();

    let sent = Rc::new(RefCell::new(Vec::new()));
    let io = Rc::new(RefCell::new(ScriptIo {
        sent: Rc::clone(&sent),
        fail: false,
    }));
    let llc = Llc::new(io.clone(), services, &[]);

    io.borrow_mut().fail = true;
    let conn = llc.connect(&client, 4, |_, _| {}).unwrap();
    assert_eq!(llc.state(), LlcState::PeerLost);
    assert_eq!(conn.state(), ConnState::Dead);
}

// ============================================================================
// P2: RR acknowledgement follows every delivered I PDU
// ============================================================================

#[test]
fn test_p2_rr_acknowledges_delivery() {
    let mut services = PeerServices::new();
    let sink = Sink::default();
    let data = Rc::clone(&sink.data);
    let svc = PeerService::new(None, Box::new(sink));
    services.add(&svc).unwrap();
    assert_eq!(svc.sap(), 0x20);

    let (llc, sent) = make_llc(services);

    // CONNECT straight to SAP 0x20 from SSAP 0x21
    llc.io_received(&[0x81, 0x21]);
    let frames = drain(&sent);
    assert_eq!(&frames[0][..2], &[0x85, 0xa0], "CC 33 <- 32");

    // I PDU with 4 bytes; the sink sends nothing back, so a bare RR
    // carrying N(R)=V(R)=1 must follow
    llc.io_received(&[0x83, 0x21, 0x00, 0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(&*data.borrow(), &[0xde, 0xad, 0xbe, 0xef]);
    let frames = drain(&sent);
    assert_eq!(frames, vec![vec![0x87, 0x60, 0x01]]);

    // Out-of-sequence N(S) draws FRMR with the S flag and delivers nothing
    llc.io_received(&[0x83, 0x21, 0x70, 0xff]);
    assert_eq!(data.borrow().len(), 4);
    let frames = drain(&sent);
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..2], &[0x86, 0x20], "FRMR addressed back");
    assert_eq!(frames[0][2], (0x01 << 4) | 0x0c, "S flag, PTYPE I");
}

// ============================================================================
// P4: CONNECT requests are serialized
// ============================================================================

#[test]
fn test_p4_connect_serialization() {
    let mut services = PeerServices::new();
    let client = PeerService::new(None, Box::new(Sink::default()));
    services.add(&client).unwrap();

    let (llc, sent) = make_llc(services);
    let first = llc
        .connect_sn(&client, "urn:nfc:sn:snep", |_, _| {})
        .unwrap();
    let second = llc.connect_sn(&client, "urn:nfc:sn:other", |_, _| {}).unwrap();

    let frames = drain(&sent);
    assert_eq!(frames.len(), 1, "one CONNECT in flight at a time");

    // CC for the first releases the second CONNECT
    llc.io_received(&[0x81, 0x84]);
    assert_eq!(first.state(), ConnState::Active);
    assert_eq!(second.state(), ConnState::Connecting);
    let frames = drain(&sent);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0][0], 0x05, "second CONNECT goes to the SDP SAP");
}

#[test]
fn test_cancel_before_wire_never_transmits() {
    let mut services = PeerServices::new();
    let client = PeerService::new(None, Box::new(Sink::default()));
    services.add(&client).unwrap();

    let (llc, sent) = make_llc(services);
    let result = Rc::new(RefCell::new(None));
    let _first = llc.connect(&client, 4, |_, _| {}).unwrap();
    let second = llc.connect(&client, 5, capture_result(&result)).unwrap();
    drain(&sent);

    assert!(second.cancel());
    assert_eq!(*result.borrow(), Some(ConnectResult::Cancelled));
    assert_eq!(second.state(), ConnState::Dead);

    // Only the first request's CC retires the queue; nothing else was sent
    llc.io_received(&[0x81, 0x84]);
    assert!(drain(&sent).is_empty(), "cancelled CONNECT never transmitted");
}

// ============================================================================
// P8: AGF equivalence
// ============================================================================

#[test]
fn test_p8_agf_equivalent_to_sequential() {
    let run = |aggregated: bool| -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let mut services = PeerServices::new();
        let sink = Sink::default();
        let datagrams = Rc::clone(&sink.datagrams);
        let svc = PeerService::new(None, Box::new(sink));
        services.add(&svc).unwrap();
        let (llc, sent) = make_llc(services);

        let ui1 = [0x80, 0xe1, 0x11]; // UI 33 -> 32
        let ui2 = [0x80, 0xe1, 0x22];
        let disc = [0x81, 0x61]; // DISC for a connection that does not exist

        if aggregated {
            let mut agf = vec![0x00, 0x80];
            for pdu in [&ui1[..], &ui2[..], &disc[..]] {
                agf.extend_from_slice(&(pdu.len() as u16).to_be_bytes());
                agf.extend_from_slice(pdu);
            }
            llc.io_received(&agf);
        } else {
            llc.io_received(&ui1);
            llc.io_received(&ui2);
            llc.io_received(&disc);
        }
        let result = (datagrams.borrow().clone(), drain(&sent));
        result
    };

    let (datagrams_seq, replies_seq) = run(false);
    let (datagrams_agf, replies_agf) = run(true);
    assert_eq!(datagrams_seq, datagrams_agf, "same deliveries");
    assert_eq!(replies_seq, replies_agf, "same replies (FRMR for the DISC)");
    assert_eq!(datagrams_seq.len(), 2);
}

#[test]
fn test_agf_truncation_is_fatal() {
    let (llc, _sent) = make_llc(PeerServices::new());
    // Inner length says 4 bytes, only 2 present
    llc.io_received(&[0x00, 0x80, 0x00, 0x04, 0x00, 0x00]);
    assert_eq!(llc.state(), LlcState::Error);
}

// ============================================================================
// SNL: service discovery requests
// ============================================================================

#[test]
fn test_snl_resolution() {
    let mut services = PeerServices::new();
    let snep = SnepServer::new();
    services.add(snep.service()).unwrap();
    let (llc, sent) = make_llc(services);

    // Three SDREQs: snep (registered), sdp (built-in), unknown
    let mut snl = vec![0x06, 0x41];
    for (tid, uri) in [
        (0x01u8, "urn:nfc:sn:snep"),
        (0x02, "urn:nfc:sn:sdp"),
        (0x03, "urn:nfc:sn:nope"),
    ] {
        snl.push(0x08);
        snl.push((uri.len() + 1) as u8);
        snl.push(tid);
        snl.extend_from_slice(uri.as_bytes());
    }
    llc.io_received(&snl);

    let frames = drain(&sent);
    assert_eq!(
        frames,
        vec![vec![
            0x06, 0x41, // SNL 1 -> 1
            0x09, 0x02, 0x01, 0x04, // snep -> SAP 4
            0x09, 0x02, 0x02, 0x01, // sdp -> SAP 1 (built-in)
            0x09, 0x02, 0x03, 0x00, // unknown -> SAP 0
        ]]
    );
}

// ============================================================================
// Odds and ends: UI without a service, idle tracking, unknown PTYPE
// ============================================================================

#[test]
fn test_ui_without_service_draws_frmr() {
    let (llc, sent) = make_llc(PeerServices::new());
    llc.io_received(&[0x80, 0xe1, 0x00]); // UI 33 -> 32, nobody home
    let frames = drain(&sent);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0][2] >> 4, 0x04, "FRMR I flag");
    assert_eq!(frames[0][2] & 0x0f, 0x03, "offending PTYPE UI");
}

#[test]
fn test_idle_tracking() {
    let (llc, _sent) = make_llc(PeerServices::new());
    let idles = Rc::new(RefCell::new(Vec::new()));
    {
        let idles = Rc::clone(&idles);
        llc.add_idle_changed_handler(move |i| idles.borrow_mut().push(i));
    }
    assert!(!llc.idle());
    llc.io_received(&[]);
    assert!(llc.idle(), "empty receive with empty queues is idle");
    assert_eq!(&*idles.borrow(), &[true]);
}

#[test]
fn test_reserved_ptype_is_fatal() {
    let (llc, _sent) = make_llc(PeerServices::new());
    // PTYPE 0x0a is reserved
    llc.io_received(&[0x02, 0x80]);
    assert_eq!(llc.state(), LlcState::Error);
}

#[test]
fn test_disconnect_flushes_before_disc() {
    let mut services = PeerServices::new();
    let client = PeerService::new(None, Box::new(Sink::default()));
    services.add(&client).unwrap();
    let (llc, sent) = make_llc(services);
    let conn = llc.connect(&client, 4, |_, _| {}).unwrap();
    drain(&sent);
    llc.io_received(&[0x81, 0x84]); // bare CC, RW(R)=1

    // One frame goes out, the rest stays queued behind the closed window
    conn.send(&[0x55; 200]);
    assert_eq!(drain(&sent).len(), 1);

    conn.disconnect();
    assert_eq!(conn.state(), ConnState::Disconnecting);
    assert!(drain(&sent).is_empty(), "DISC waits for the queue to drain");

    // RR releases the tail, then the DISC follows
    llc.io_received(&[0x83, 0x44, 0x01]);
    let frames = drain(&sent);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].len(), 3 + 72, "tail fragment");
    assert_eq!(frames[1], vec![0x11, 0x60], "DISC 4 <- 32");

    // Peer's DM reply finishes it
    llc.io_received(&[0x81, 0xc4, 0x00]);
    assert_eq!(conn.state(), ConnState::Dead);
}

#[test]
fn test_remote_disc_draws_dm() {
    let mut services = PeerServices::new();
    let sink = Sink::default();
    let svc = PeerService::new(None, Box::new(sink));
    services.add(&svc).unwrap();
    let (llc, sent) = make_llc(services);

    llc.io_received(&[0x81, 0x21]); // CONNECT 33 -> 32
    drain(&sent);
    llc.io_received(&[0x81, 0x61]); // DISC 33 -> 32
    let frames = drain(&sent);
    assert_eq!(
        frames,
        vec![vec![0x85, 0xe0, 0x00]],
        "DM[DISC_RECEIVED] 33 <- 32"
    );
}

#[test]
fn test_rnr_suspends_until_rr() {
    let mut services = PeerServices::new();
    let client = PeerService::new(None, Box::new(Sink::default()));
    services.add(&client).unwrap();
    let (llc, sent) = make_llc(services);
    let conn = llc.connect(&client, 4, |_, _| {}).unwrap();
    drain(&sent);
    llc.io_received(&[0x81, 0x84, 0x05, 0x01, 0x0f]); // CC, RW(R)=15

    conn.send(&[0x01; 10]);
    assert_eq!(drain(&sent).len(), 1);

    // RNR: receiver busy. Despite the open window, nothing more is sent.
    llc.io_received(&[0x83, 0x84, 0x01]);
    conn.send(&[0x02; 10]);
    assert!(drain(&sent).is_empty(), "emission held while remote is busy");
    assert_eq!(conn.bytes_queued(), 10);

    // RR clears the latch and the queued frame leaves
    llc.io_received(&[0x83, 0x44, 0x01]);
    let frames = drain(&sent);
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][3..], &[0x02; 10]);
}
