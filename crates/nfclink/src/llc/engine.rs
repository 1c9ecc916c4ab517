// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nfclink contributors

//! LLC engine
//!
//! The link-layer state machine: parses and emits LLCP PDUs, owns the
//! connection table and the serialized connect queue, resolves service
//! discovery, and tracks link state and idleness.
//!
//! Everything runs on one cooperative event loop. The MAC-facing side
//! delivers events through [`Llc::io_received`], [`Llc::io_can_send`] and
//! [`Llc::io_error`]; PDU handlers run to completion without suspension.
//! Application-facing callbacks (observers, connect completions) are queued
//! during dispatch and run after the engine turn ends, so they may freely
//! re-enter the public API.
//!
//! # Link state
//!
//! ```text
//!   START -> ACTIVE     (first successfully processed non-SYMM PDU)
//!   ACTIVE -> ERROR     (link-level protocol violation, terminal)
//!   any   -> PEER_LOST  (transmit failure, terminal)
//! ```
//!
//! Entering a terminal state kills every connection and halts PDU emission.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use crate::io::{IoPoll, LlcIo};
use crate::llc::connection::{
    Conn, ConnId, ConnKey, ConnState, ConnectResult, ConnectionHandler, PeerConnection,
};
use crate::llc::service::PeerService;
use crate::llc::services::PeerServices;
use crate::protocol::param::{self, Param};
use crate::protocol::{
    self, frmr, DmReason, Ptype, LTO_DEFAULT_MS, MIU_DEFAULT, NAME_SDP, SAP_SDP,
};
use crate::{Error, Result};

/// Link state. `Error` and `PeerLost` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlcState {
    Start,
    Active,
    Error,
    PeerLost,
}

impl LlcState {
    fn name(self) -> &'static str {
        match self {
            LlcState::Start => "START",
            LlcState::Active => "ACTIVE",
            LlcState::Error => "ERROR",
            LlcState::PeerLost => "PEER_LOST",
        }
    }
}

/// Opaque observer registration token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(pub(crate) u64);

pub(crate) type CompleteFn = Box<dyn FnOnce(&PeerConnection, ConnectResult)>;

/// Queued outbound connect request; at most one is on the wire at a time.
pub(crate) struct ConnectReq {
    pub(crate) conn: ConnId,
    pub(crate) complete: Option<CompleteFn>,
    pub(crate) sent: bool,
}

/// Deferred application-facing callback, run once the engine turn ends.
pub(crate) enum Pending {
    State(LlcState),
    Idle(bool),
    Wks(u16),
    ConnState(PeerConnection),
    Complete {
        complete: CompleteFn,
        conn: PeerConnection,
        result: ConnectResult,
    },
    Call(Box<dyn FnOnce()>),
}

pub(crate) struct LlcInner {
    pub(crate) io: Rc<RefCell<dyn LlcIo>>,
    pub(crate) services: PeerServices,
    pub(crate) state: LlcState,
    pub(crate) idle: bool,
    pub(crate) version: u8,
    /// MIU announced by the peer; also the encode budget for
    /// parameter-bearing PDUs we send.
    pub(crate) miu: u16,
    pub(crate) lto: u32,
    /// Well-known-services bitmap announced by the peer.
    pub(crate) wks: u16,
    pub(crate) packets_handled: u64,
    pub(crate) pdu_queue: VecDeque<Vec<u8>>,
    pub(crate) connect_queue: VecDeque<ConnectReq>,
    pub(crate) conn_table: HashMap<ConnKey, ConnId>,
    pub(crate) conns: HashMap<ConnId, Conn>,
    next_conn: u64,
    pub(crate) pending: Vec<Pending>,
    state_observers: Vec<(HandlerId, Rc<dyn Fn(LlcState)>)>,
    idle_observers: Vec<(HandlerId, Rc<dyn Fn(bool)>)>,
    wks_observers: Vec<(HandlerId, Rc<dyn Fn(u16)>)>,
    next_handler: u64,
    pub(crate) self_weak: Weak<RefCell<LlcInner>>,
}

// ============================================================================
// Emission
// ============================================================================

impl LlcInner {
    pub(crate) fn terminal(&self) -> bool {
        matches!(self.state, LlcState::Error | LlcState::PeerLost)
    }

    /// Queue an encoded PDU and push it onto the wire if the window is open.
    pub(crate) fn submit(&mut self, pdu: Vec<u8>) {
        if self.terminal() {
            return;
        }
        self.pdu_queue.push_back(pdu);
        let can_send = self.io.borrow().can_send();
        if can_send {
            self.send_next_pdu();
        }
    }

    /// Emit the head of the PDU queue. After a successful I PDU transmit the
    /// owning connection gets another chance to fill the freed queue slot.
    pub(crate) fn send_next_pdu(&mut self) {
        if self.terminal() {
            return;
        }
        let Some(pdu) = self.pdu_queue.pop_front() else {
            return;
        };
        let hdr = u16::from_be_bytes([pdu[0], pdu[1]]);
        log_outbound(&pdu, hdr);

        let sent = self.io.borrow_mut().send(&pdu);
        if sent {
            if protocol::header_ptype(hdr) == Ptype::I as u8 {
                // Our DSAP/SSAP are the connection's remote/local pair
                let key = ConnKey {
                    lsap: protocol::header_ssap(hdr),
                    rsap: protocol::header_dsap(hdr),
                };
                if let Some(&id) = self.conn_table.get(&key) {
                    self.flush_conn(id);
                }
            }
        } else {
            log::debug!("LLC transmit failed");
            self.set_state(LlcState::PeerLost);
        }
    }

    pub(crate) fn submit_disc(&mut self, dsap: u8, ssap: u8) {
        let pdu = protocol::pdu_new(dsap, Ptype::Disc, ssap);
        self.submit(pdu);
    }

    pub(crate) fn submit_dm(&mut self, dsap: u8, ssap: u8, reason: DmReason) {
        let mut pdu = protocol::pdu_new(dsap, Ptype::Dm, ssap);
        pdu.push(reason as u8);
        self.submit(pdu);
    }

    fn submit_frmr(
        &mut self,
        dsap: u8,
        ssap: u8,
        flags: u8,
        ptype_bits: u8,
        seq: u8,
        conn: Option<ConnId>,
    ) {
        let mut pdu = protocol::pdu_new(dsap, Ptype::Frmr, ssap);
        pdu.push((flags << 4) | ptype_bits);
        pdu.push(seq);
        match conn.and_then(|id| self.conns.get(&id)) {
            Some(c) => {
                pdu.push((c.ps.vs << 4) | c.ps.vr);
                pdu.push((c.ps.vsa << 4) | c.ps.vra);
            }
            None => pdu.extend_from_slice(&[0, 0]),
        }
        self.submit(pdu);
    }

    fn submit_frmr_i(&mut self, dsap: u8, ssap: u8, ptype_bits: u8) {
        self.submit_frmr(dsap, ssap, frmr::FLAG_I, ptype_bits, 0, None);
    }

    /// CC carrying our connection-local MIUX/RW, budgeted to what the remote
    /// endpoint can receive.
    pub(crate) fn submit_cc(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get(&id) else {
            return;
        };
        let params = [Param::Miu(conn.lmiu), Param::Rw(conn.lrw)];
        let budget = conn.ps.rmiu as usize;
        let mut pdu = protocol::pdu_new(
            conn.shared.rsap.get(),
            Ptype::Cc,
            conn.shared.service.sap(),
        );
        param::encode(&params, &mut pdu, Some(budget));
        self.submit(pdu);
    }

    fn submit_connect_pdu(&mut self, dsap: u8, ssap: u8, params: &[Param]) {
        let mut pdu = protocol::pdu_new(dsap, Ptype::Connect, ssap);
        param::encode(params, &mut pdu, Some(self.miu as usize));
        self.submit(pdu);
    }

    /// Put the head of the connect queue on the wire, once.
    fn submit_next_connect(&mut self) {
        let Some(req) = self.connect_queue.front_mut() else {
            return;
        };
        if req.sent {
            return;
        }
        req.sent = true;
        let id = req.conn;
        let (lsap, rsap, name, lmiu, lrw) = {
            let conn = &self.conns[&id];
            (
                conn.shared.service.sap(),
                conn.shared.rsap.get(),
                conn.shared.name.clone(),
                conn.lmiu,
                conn.lrw,
            )
        };
        let mut params = vec![Param::Miu(lmiu), Param::Rw(lrw)];
        match name {
            Some(name) => {
                // Connect by name goes through the SDP SAP (4.5.6)
                params.push(Param::ServiceName(name));
                self.submit_connect_pdu(SAP_SDP, lsap, &params);
            }
            None => self.submit_connect_pdu(rsap, lsap, &params),
        }
    }
}

// ============================================================================
// Link state and parameters
// ============================================================================

impl LlcInner {
    pub(crate) fn set_state(&mut self, state: LlcState) {
        if self.state == state {
            return;
        }
        log::debug!("LLCP state {} -> {}", self.state.name(), state.name());
        self.state = state;
        self.pending.push(Pending::State(state));
        if self.terminal() {
            self.abort_link();
        }
    }

    /// Terminal-state cleanup: drop queued work, kill every connection.
    fn abort_link(&mut self) {
        self.pdu_queue.clear();
        // Dropping a request's completion uninvoked is the cancelled path
        self.connect_queue.clear();
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in ids {
            self.set_conn_state(id, ConnState::Dead);
        }
    }

    fn set_idle(&mut self, idle: bool) {
        if self.idle != idle {
            log::debug!("LLCP {}", if idle { "idle" } else { "busy" });
            self.idle = idle;
            self.pending.push(Pending::Idle(idle));
        }
    }

    /// Apply link parameters from activation or PAX; returns a bitmask of
    /// the parameter types that changed.
    fn apply_link_params(&mut self, params: &[Param]) -> u32 {
        let mut mask = 0u32;
        for p in params {
            match p {
                Param::Version(v) => {
                    if self.version != *v {
                        self.version = *v;
                        mask |= 1 << param::TYPE_VERSION;
                    }
                    log::debug!("  Version: {}.{}", v >> 4, v & 0x0f);
                }
                Param::Miu(miu) => {
                    if self.miu != *miu {
                        self.miu = *miu;
                        mask |= 1 << param::TYPE_MIUX;
                    }
                    log::debug!("  MIU: {} bytes", miu);
                }
                Param::Wks(wks) => {
                    if self.wks != *wks {
                        self.wks = *wks;
                        mask |= 1 << param::TYPE_WKS;
                    }
                    log::debug!("  WKS: 0x{:04x}", wks);
                }
                Param::Lto(ms) => {
                    if self.lto != *ms {
                        self.lto = *ms;
                        mask |= 1 << param::TYPE_LTO;
                    }
                    log::debug!("  Link Timeout: {} ms", ms);
                }
                _ => {}
            }
        }
        mask
    }
}

// ============================================================================
// PDU dispatch
// ============================================================================

impl LlcInner {
    /// Parse and dispatch one PDU. `false` means a link-level protocol
    /// violation; the caller moves the engine to ERROR.
    fn handle_pdu(&mut self, data: &[u8]) -> bool {
        if data.len() < 2 {
            log::warn!("Single byte LLCP packet received, bailing out");
            return false;
        }
        let hdr = u16::from_be_bytes([data[0], data[1]]);
        let dsap = protocol::header_dsap(hdr);
        let ssap = protocol::header_ssap(hdr);
        let payload = &data[2..];

        let Some(ptype) = Ptype::from_bits(protocol::header_ptype(hdr)) else {
            log::warn!("Packet 0x{:x} not handled", protocol::header_ptype(hdr));
            return false;
        };
        match ptype {
            Ptype::Symm => {
                if data.len() == 2 && dsap == 0 && ssap == 0 {
                    log::debug!("> SYMM");
                    return true;
                }
                log::debug!("> SYMM (malformed?)");
                false
            }
            Ptype::Pax => {
                self.packets_handled += 1;
                if dsap == 0 && ssap == 0 {
                    log::debug!("> PAX");
                    self.handle_pax(payload);
                } else {
                    log::debug!("> PAX {}:{} (malformed?)", ssap, dsap);
                    self.submit_frmr_i(ssap, dsap, Ptype::Pax as u8);
                }
                true
            }
            Ptype::Agf => {
                if dsap == 0 && ssap == 0 {
                    self.packets_handled += 1;
                    log::debug!("> AGF");
                    return self.handle_agf(payload);
                }
                log::debug!("> AGF (malformed?)");
                false
            }
            Ptype::Ui => {
                self.packets_handled += 1;
                log::debug!("> UI {}:{} ({} bytes)", ssap, dsap, payload.len());
                self.handle_ui(dsap, ssap, payload);
                true
            }
            Ptype::Connect => {
                self.packets_handled += 1;
                log::debug!("> CONNECT {}:{}", ssap, dsap);
                self.handle_connect(dsap, ssap, payload);
                true
            }
            Ptype::Disc => {
                if data.len() == 2 {
                    self.packets_handled += 1;
                    log::debug!("> DISC {}:{}", ssap, dsap);
                    self.handle_disc(dsap, ssap);
                    return true;
                }
                log::debug!("> DISC (malformed?)");
                false
            }
            Ptype::Cc => {
                self.packets_handled += 1;
                log::debug!("> CC {}:{}", ssap, dsap);
                self.handle_cc(dsap, ssap, payload);
                true
            }
            Ptype::Dm => {
                if data.len() == 3 {
                    self.packets_handled += 1;
                    log::debug!("> DM {}:{} (0x{:02x})", ssap, dsap, data[2]);
                    self.handle_dm(dsap, ssap, data[2]);
                    return true;
                }
                log::debug!("> DM {}:{} (malformed?)", ssap, dsap);
                false
            }
            Ptype::Frmr => {
                if data.len() == 6 {
                    self.packets_handled += 1;
                    log::debug!("> FRMR {}:{} (0x{:02x})", ssap, dsap, data[2] & 0x0f);
                    self.handle_frmr(dsap, ssap, data[2] & 0x0f);
                    return true;
                }
                log::debug!("> FRMR {}:{} (malformed?)", ssap, dsap);
                false
            }
            Ptype::Snl => {
                self.packets_handled += 1;
                if dsap == SAP_SDP && ssap == SAP_SDP {
                    log::debug!("> SNL");
                    self.handle_snl(payload);
                } else {
                    log::debug!("> SNL {}:{} (malformed?)", ssap, dsap);
                    self.submit_frmr_i(ssap, dsap, Ptype::Snl as u8);
                }
                true
            }
            Ptype::I => {
                if data.len() >= 3 {
                    self.packets_handled += 1;
                    log::debug!(
                        "> I {}:{} (0x{:02x}, {} bytes)",
                        ssap,
                        dsap,
                        data[2],
                        data.len() - 3
                    );
                    self.handle_i(dsap, ssap, data[2], &data[3..]);
                    return true;
                }
                log::debug!("> I {}:{} (malformed?)", ssap, dsap);
                false
            }
            Ptype::Rr => {
                if data.len() == 3 {
                    self.packets_handled += 1;
                    log::debug!("> RR {}:{} (0x{:02x})", ssap, dsap, data[2]);
                    self.handle_rr(dsap, ssap, data[2]);
                    return true;
                }
                log::debug!("> RR {}:{} (malformed?)", ssap, dsap);
                false
            }
            Ptype::Rnr => {
                if data.len() == 3 {
                    self.packets_handled += 1;
                    log::debug!("> RNR {}:{} (0x{:02x})", ssap, dsap, data[2]);
                    self.handle_rnr(dsap, ssap, data[2]);
                    return true;
                }
                log::debug!("> RNR {}:{} (malformed?)", ssap, dsap);
                false
            }
        }
    }

    fn handle_pax(&mut self, plist: &[u8]) {
        let params = param::decode(plist);
        let changed = self.apply_link_params(&params);
        if changed & (1 << param::TYPE_WKS) != 0 {
            self.pending.push(Pending::Wks(self.wks));
        }
    }

    /// Aggregated frame: `(u16 len_be, bytes[len])*`, dispatched in order.
    fn handle_agf(&mut self, data: &[u8]) -> bool {
        let mut off = 0;
        while off + 2 <= data.len() {
            let len = u16::from_be_bytes([data[off], data[off + 1]]) as usize;
            off += 2;
            if len == 0 {
                log::debug!("Skipping empty encapsulated PDU");
                continue;
            }
            if off + len > data.len() {
                log::warn!("Broken AGF frame");
                return false;
            }
            log::debug!("Handling encapsulated PDU ({} bytes)", len);
            if !self.handle_pdu(&data[off..off + len]) {
                return false;
            }
            off += len;
        }
        off == data.len()
    }

    fn handle_ui(&mut self, dsap: u8, ssap: u8, data: &[u8]) {
        match self.services.find_by_sap(dsap) {
            Some(service) => service.datagram_received(ssap, data),
            None => {
                log::debug!("No service at SAP {}", dsap);
                self.submit_frmr_i(ssap, dsap, Ptype::Ui as u8);
            }
        }
    }

    fn handle_connect(&mut self, dsap: u8, ssap: u8, plist: &[u8]) {
        let params = param::decode(plist);
        let mut dsap = dsap;
        let service = if dsap == SAP_SDP {
            // 4.5.6: an SN parameter sent to SAP 1 names the target service
            match param::find_service_name(&params) {
                Some(sn) => {
                    log::debug!("  SN: \"{}\"", sn);
                    let service = self.services.find_by_name(sn);
                    match &service {
                        Some(s) => {
                            dsap = s.sap();
                            log::debug!("  SAP: {}", dsap);
                        }
                        None => log::debug!("Service \"{}\" NOT FOUND", sn),
                    }
                    service
                }
                None => {
                    log::debug!("Rejecting connection to SDP SAP");
                    None
                }
            }
        } else {
            let service = self.services.find_by_sap(dsap);
            if service.is_none() {
                log::debug!("No service at SAP {}", dsap);
            }
            service
        };

        let Some(service) = service else {
            self.submit_dm(ssap, dsap, DmReason::NoService);
            return;
        };

        let key = ConnKey {
            lsap: dsap,
            rsap: ssap,
        };
        if self.conn_table.contains_key(&key) {
            // 5.6.3 requires a DM; Table 4 has no exact reason for an
            // already-connected SAP pair, REJECT comes closest
            log::warn!("Duplicate connection {}:{}", ssap, dsap);
            self.submit_dm(ssap, dsap, DmReason::Reject);
            return;
        }

        match service.new_accept_handler(ssap) {
            Some(handler) => {
                let id = self.create_conn(&service, ssap, None, ConnState::Accepting, handler);
                self.conn_table.insert(key, id);
                self.apply_remote_params(id, &params);
                self.call_handler(id, |h, ctx| h.accept(ctx));
            }
            None => self.submit_dm(ssap, dsap, DmReason::Reject),
        }
    }

    fn handle_disc(&mut self, dsap: u8, ssap: u8) {
        let key = ConnKey {
            lsap: dsap,
            rsap: ssap,
        };
        match self.conn_table.get(&key).copied() {
            Some(id) => {
                // 5.6.6: answer with DM and close the connection
                self.set_conn_state(id, ConnState::Dead);
                self.submit_dm(ssap, dsap, DmReason::DiscReceived);
            }
            None => {
                log::warn!("Non-existent connection {}:{}", dsap, ssap);
                self.submit_frmr_i(ssap, dsap, Ptype::Disc as u8);
            }
        }
    }

    fn handle_cc(&mut self, dsap: u8, ssap: u8, plist: &[u8]) {
        if let Some(req) = self.connect_queue.front() {
            let id = req.conn;
            let (lsap, rsap) = {
                let conn = &self.conns[&id];
                (conn.shared.service.sap(), conn.shared.rsap.get())
            };
            if lsap == dsap && (rsap == 0 || rsap == ssap) {
                let mut req = self.connect_queue.pop_front().expect("checked above");
                let shared = self.conn_shared(id).expect("queued connection");

                // The CC's source is authoritative for the remote SAP
                shared.rsap.set(ssap);
                if !plist.is_empty() {
                    let params = param::decode(plist);
                    self.apply_remote_params(id, &params);
                }

                let state = shared.state.get();
                if let Some(complete) = req.complete.take() {
                    let result = if state == ConnState::Connecting {
                        ConnectResult::Ok
                    } else {
                        ConnectResult::Cancelled
                    };
                    self.pending.push(Pending::Complete {
                        complete,
                        conn: PeerConnection {
                            shared: Rc::clone(&shared),
                        },
                        result,
                    });
                }

                let key = ConnKey { lsap, rsap: ssap };
                match state {
                    ConnState::Connecting => {
                        self.conn_table.insert(key, id);
                        self.set_conn_state(id, ConnState::Active);
                    }
                    ConnState::Abandoned => {
                        // Changed our mind; keep the entry around until the
                        // DM for our DISC comes back
                        self.conn_table.insert(key, id);
                        log::debug!("Abandoned {}:{}", lsap, ssap);
                        self.submit_disc(ssap, lsap);
                    }
                    _ => {}
                }
                self.submit_next_connect();
                return;
            }
        }
        log::warn!("Unexpected CC");
        self.submit_frmr_i(ssap, 0, Ptype::Cc as u8);
    }

    fn handle_dm(&mut self, dsap: u8, ssap: u8, reason: u8) {
        let key = ConnKey {
            lsap: dsap,
            rsap: ssap,
        };
        if let Some(id) = self.conn_table.get(&key).copied() {
            self.set_conn_state(id, ConnState::Dead);
            return;
        }
        if let Some(req) = self.connect_queue.front() {
            let id = req.conn;
            let lsap = self.conns[&id].shared.service.sap();
            // 5.6.3: DM addressed to the SSAP of an unacknowledged CONNECT
            // abandons the establishment
            if dsap == lsap {
                let mut req = self.connect_queue.pop_front().expect("checked above");
                let shared = self.conn_shared(id).expect("queued connection");
                if let Some(complete) = req.complete.take() {
                    let result = if shared.state.get() == ConnState::Abandoned {
                        ConnectResult::Cancelled
                    } else {
                        match DmReason::from_byte(reason) {
                            Some(DmReason::NoService) => ConnectResult::NoService,
                            Some(DmReason::Reject) => ConnectResult::Rejected,
                            _ => ConnectResult::Failed,
                        }
                    };
                    self.pending.push(Pending::Complete {
                        complete,
                        conn: PeerConnection {
                            shared: Rc::clone(&shared),
                        },
                        result,
                    });
                }
                self.set_conn_state(id, ConnState::Dead);
                self.submit_next_connect();
                return;
            }
        }
        log::warn!("Non-existent connection {}:{}", dsap, ssap);
        self.submit_frmr_i(ssap, dsap, Ptype::Dm as u8);
    }

    fn handle_frmr(&mut self, dsap: u8, ssap: u8, ptype_bits: u8) {
        let key = ConnKey {
            lsap: dsap,
            rsap: ssap,
        };
        if let Some(id) = self.conn_table.get(&key).copied() {
            self.set_conn_state(id, ConnState::Dead);
            return;
        }
        if ptype_bits == Ptype::Connect as u8 {
            if let Some(req) = self.connect_queue.front() {
                let id = req.conn;
                let (lsap, rsap) = {
                    let conn = &self.conns[&id];
                    (conn.shared.service.sap(), conn.shared.rsap.get())
                };
                if lsap == dsap && (rsap == 0 || rsap == ssap) {
                    let mut req = self.connect_queue.pop_front().expect("checked above");
                    let shared = self.conn_shared(id).expect("queued connection");
                    if let Some(complete) = req.complete.take() {
                        self.pending.push(Pending::Complete {
                            complete,
                            conn: PeerConnection { shared },
                            result: ConnectResult::Rejected,
                        });
                    }
                    self.set_conn_state(id, ConnState::Dead);
                    self.submit_next_connect();
                }
            }
        }
    }

    fn handle_snl(&mut self, plist: &[u8]) {
        let params = param::decode(plist);
        let mut responses = Vec::new();
        for p in &params {
            if let Param::SdReq { tid, uri } = p {
                let sap = match self.services.find_by_name(uri) {
                    Some(svc) => {
                        log::debug!("  \"{}\" => {}", uri, svc.sap());
                        svc.sap()
                    }
                    None if uri == NAME_SDP => {
                        log::debug!("  \"{}\" => {} (built-in)", uri, SAP_SDP);
                        SAP_SDP
                    }
                    None => {
                        log::debug!("  \"{}\" (unknown)", uri);
                        0
                    }
                };
                responses.push(Param::SdRes { tid: *tid, sap });
            }
        }
        let mut pdu = protocol::pdu_new(SAP_SDP, Ptype::Snl, SAP_SDP);
        param::encode(&responses, &mut pdu, Some(self.miu as usize));
        self.submit(pdu);
    }

    fn handle_i(&mut self, dsap: u8, ssap: u8, seq: u8, data: &[u8]) {
        let key = ConnKey {
            lsap: dsap,
            rsap: ssap,
        };
        let Some(id) = self.conn_table.get(&key).copied() else {
            self.submit_frmr_i(ssap, dsap, Ptype::I as u8);
            return;
        };
        let ns = seq >> 4;
        let nr = seq & 0x0f;

        let in_sequence = {
            let conn = self.conns.get_mut(&id).expect("table entry");
            // 5.6.1.2: V(SA) tracks the most recently received N(R)
            conn.ps.vsa = nr;
            conn.ps.vr == ns
        };
        if in_sequence {
            // 5.6.4.2: deliver the service data unit, advance V(R)
            let conn = self.conns.get_mut(&id).expect("table entry");
            conn.ps.vr = conn.ps.vr.wrapping_add(1) & 0x0f;
            conn.shared
                .bytes_received
                .set(conn.shared.bytes_received.get() + data.len() as u64);
            self.call_handler(id, |h, ctx| h.data_received(ctx, data));
            self.ack_conn(id, false);
        } else {
            self.submit_frmr(ssap, dsap, frmr::FLAG_S, Ptype::I as u8, seq, Some(id));
        }
        self.flush_conn(id);
    }

    fn handle_rr(&mut self, dsap: u8, ssap: u8, nr: u8) {
        let key = ConnKey {
            lsap: dsap,
            rsap: ssap,
        };
        match self.conn_table.get(&key).copied() {
            Some(id) => {
                let conn = self.conns.get_mut(&id).expect("table entry");
                conn.ps.vsa = nr & 0x0f;
                conn.ps.remote_busy = false;
                self.flush_conn(id);
            }
            None => self.submit_frmr_i(ssap, dsap, Ptype::Rr as u8),
        }
    }

    fn handle_rnr(&mut self, dsap: u8, ssap: u8, nr: u8) {
        let key = ConnKey {
            lsap: dsap,
            rsap: ssap,
        };
        match self.conn_table.get(&key).copied() {
            Some(id) => {
                let conn = self.conns.get_mut(&id).expect("table entry");
                conn.ps.vsa = nr & 0x0f;
                // Receiver busy: hold I PDU emission until the next RR
                conn.ps.remote_busy = true;
                self.flush_conn(id);
            }
            None => self.submit_frmr_i(ssap, dsap, Ptype::Rnr as u8),
        }
    }

    /// One inbound frame from the I/O adaptor; empty means "peer idle".
    fn receive(&mut self, data: &[u8]) -> IoPoll {
        if self.terminal() {
            return IoPoll::Idle;
        }
        let handled_before = self.packets_handled;
        if !data.is_empty() {
            if self.handle_pdu(data) {
                // SYMM keep-alives do not count as progress: the link goes
                // ACTIVE on the first processed non-SYMM PDU
                if self.state == LlcState::Start && self.packets_handled != handled_before {
                    self.set_state(LlcState::Active);
                }
            } else {
                log::warn!("LLC protocol error");
                self.set_state(LlcState::Error);
                return IoPoll::Idle;
            }
        }
        let can_send = self.io.borrow().can_send();
        if can_send {
            self.send_next_pdu();
        }
        let can_send = self.io.borrow().can_send();
        if self.packets_handled == handled_before && can_send {
            let idle = self.pdu_queue.is_empty() && self.connect_queue.is_empty();
            self.set_idle(idle);
            IoPoll::Idle
        } else {
            self.set_idle(false);
            IoPoll::ExpectMore
        }
    }

    fn create_conn(
        &mut self,
        service: &PeerService,
        rsap: u8,
        name: Option<String>,
        state: ConnState,
        handler: Box<dyn ConnectionHandler>,
    ) -> ConnId {
        self.next_conn += 1;
        let id = ConnId(self.next_conn);
        let conn = Conn::new(
            id,
            service.clone(),
            rsap,
            name,
            state,
            handler,
            self.self_weak.clone(),
        );
        self.conns.insert(id, conn);
        id
    }

    fn connect_internal(
        &mut self,
        service: &PeerService,
        rsap: u8,
        name: Option<&str>,
        handler: Option<Box<dyn ConnectionHandler>>,
        complete: Option<CompleteFn>,
    ) -> Result<PeerConnection> {
        if self.terminal() {
            return Err(Error::InvalidState);
        }
        let handler = match handler {
            Some(h) => h,
            None => service
                .new_connect_handler(rsap, name)
                .ok_or(Error::ConnectionRefused)?,
        };
        let id = self.create_conn(
            service,
            rsap,
            name.map(str::to_owned),
            ConnState::Connecting,
            handler,
        );
        let shared = self.conn_shared(id).expect("created above");
        let first = self.connect_queue.is_empty();
        self.connect_queue.push_back(ConnectReq {
            conn: id,
            complete,
            sent: false,
        });
        if first {
            self.submit_next_connect();
        }
        Ok(PeerConnection { shared })
    }
}

fn log_outbound(pdu: &[u8], hdr: u16) {
    if let Some(ptype) = Ptype::from_bits(protocol::header_ptype(hdr)) {
        let dsap = protocol::header_dsap(hdr);
        let ssap = protocol::header_ssap(hdr);
        match ptype {
            Ptype::Symm | Ptype::Pax | Ptype::Agf | Ptype::Snl => {
                log::debug!("< {}", ptype.name());
            }
            Ptype::Dm | Ptype::Rr => {
                log::debug!("< {} {}:{} (0x{:02x})", ptype.name(), ssap, dsap, pdu[2]);
            }
            Ptype::Frmr => {
                log::debug!("< FRMR {}:{} (0x{:02x})", ssap, dsap, pdu[2] & 0x0f);
            }
            Ptype::I => {
                log::debug!("< I {}:{} ({} bytes)", ssap, dsap, pdu.len() - 3);
            }
            _ => log::debug!("< {} {}:{}", ptype.name(), ssap, dsap),
        }
    }
}

// ============================================================================
// Deferred notifications
// ============================================================================

/// Run everything the engine queued for after-dispatch delivery. Safe to
/// nest: callbacks that re-enter the public API drain their own batch.
pub(crate) fn dispatch_pending(inner: &Rc<RefCell<LlcInner>>) {
    loop {
        let batch = std::mem::take(&mut inner.borrow_mut().pending);
        if batch.is_empty() {
            return;
        }
        for item in batch {
            match item {
                Pending::State(state) => {
                    let cbs: Vec<_> = inner
                        .borrow()
                        .state_observers
                        .iter()
                        .map(|(_, f)| Rc::clone(f))
                        .collect();
                    for f in cbs {
                        f(state);
                    }
                }
                Pending::Idle(idle) => {
                    let cbs: Vec<_> = inner
                        .borrow()
                        .idle_observers
                        .iter()
                        .map(|(_, f)| Rc::clone(f))
                        .collect();
                    for f in cbs {
                        f(idle);
                    }
                }
                Pending::Wks(wks) => {
                    let cbs: Vec<_> = inner
                        .borrow()
                        .wks_observers
                        .iter()
                        .map(|(_, f)| Rc::clone(f))
                        .collect();
                    for f in cbs {
                        f(wks);
                    }
                }
                Pending::ConnState(conn) => {
                    let cbs: Vec<_> = conn
                        .shared
                        .observers
                        .borrow()
                        .iter()
                        .map(|(_, f)| Rc::clone(f))
                        .collect();
                    for f in cbs {
                        f(&conn);
                    }
                }
                Pending::Complete {
                    complete,
                    conn,
                    result,
                } => complete(&conn, result),
                Pending::Call(f) => f(),
            }
        }
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// The LLC engine handle.
///
/// Cheap to clone. Dropping the last handle tears the link down: every
/// connection dies and queued work is discarded.
#[derive(Clone)]
pub struct Llc {
    inner: Rc<RefCell<LlcInner>>,
}

impl Llc {
    /// Build an engine over an I/O adaptor, a per-link service registry and
    /// the link parameters decoded from the activation general bytes.
    ///
    /// PAX exchange is not used for activation (TS-LLCP 1.1 Section 6.2.3.1:
    /// parameters ride in the ATR general bytes instead), which is why the
    /// parameters arrive here pre-decoded.
    pub fn new(io: Rc<RefCell<dyn LlcIo>>, services: PeerServices, params: &[Param]) -> Llc {
        let inner = Rc::new_cyclic(|self_weak| {
            RefCell::new(LlcInner {
                io,
                services,
                state: LlcState::Start,
                idle: false,
                version: 0,
                miu: MIU_DEFAULT,
                lto: LTO_DEFAULT_MS,
                wks: 0,
                packets_handled: 0,
                pdu_queue: VecDeque::new(),
                connect_queue: VecDeque::new(),
                conn_table: HashMap::new(),
                conns: HashMap::new(),
                next_conn: 0,
                pending: Vec::new(),
                state_observers: Vec::new(),
                idle_observers: Vec::new(),
                wks_observers: Vec::new(),
                next_handler: 0,
                self_weak: self_weak.clone(),
            })
        });
        {
            let mut engine = inner.borrow_mut();
            log::debug!("Initializing");
            engine.apply_link_params(params);
            let started = engine.io.borrow_mut().start();
            if !started {
                engine.idle = true;
                engine.state = LlcState::PeerLost;
            }
        }
        Llc { inner }
    }

    pub fn state(&self) -> LlcState {
        self.inner.borrow().state
    }

    /// No inbound activity and nothing queued to send.
    pub fn idle(&self) -> bool {
        self.inner.borrow().idle
    }

    /// Well-known-services bitmap announced by the peer.
    pub fn wks(&self) -> u16 {
        self.inner.borrow().wks
    }

    /// LLCP version announced by the peer, `(major << 4) | minor`.
    pub fn version(&self) -> u8 {
        self.inner.borrow().version
    }

    /// MIU announced by the peer.
    pub fn miu(&self) -> u16 {
        self.inner.borrow().miu
    }

    /// Link timeout announced by the peer, in milliseconds.
    pub fn lto(&self) -> u32 {
        self.inner.borrow().lto
    }

    /// Deliver one received LLCP PDU (empty input means "peer idle").
    ///
    /// The return value tells the I/O adaptor whether to poll the peer again
    /// immediately or fall back to the keep-alive cadence.
    pub fn io_received(&self, data: &[u8]) -> IoPoll {
        let r = self.inner.borrow_mut().receive(data);
        dispatch_pending(&self.inner);
        r
    }

    /// A fresh send window opened.
    pub fn io_can_send(&self) {
        self.inner.borrow_mut().send_next_pdu();
        dispatch_pending(&self.inner);
    }

    /// The MAC failed; the link is gone.
    pub fn io_error(&self) {
        log::debug!("LLC transmit failed");
        self.inner.borrow_mut().set_state(LlcState::PeerLost);
        dispatch_pending(&self.inner);
    }

    /// Connect to a fixed remote SAP. The connection handler comes from the
    /// service's [`ServiceHandler::new_connect`].
    ///
    /// [`ServiceHandler::new_connect`]: crate::llc::service::ServiceHandler::new_connect
    pub fn connect(
        &self,
        service: &PeerService,
        rsap: u8,
        complete: impl FnOnce(&PeerConnection, ConnectResult) + 'static,
    ) -> Result<PeerConnection> {
        let r = self.inner.borrow_mut().connect_internal(
            service,
            rsap,
            None,
            None,
            Some(Box::new(complete)),
        );
        dispatch_pending(&self.inner);
        r
    }

    /// Connect by service name through the remote SDP endpoint.
    pub fn connect_sn(
        &self,
        service: &PeerService,
        sn: &str,
        complete: impl FnOnce(&PeerConnection, ConnectResult) + 'static,
    ) -> Result<PeerConnection> {
        let r = self.inner.borrow_mut().connect_internal(
            service,
            0,
            Some(sn),
            None,
            Some(Box::new(complete)),
        );
        dispatch_pending(&self.inner);
        r
    }

    /// Like [`connect`](Llc::connect) with an explicit connection handler,
    /// bypassing the service's factory. Used by adaptors that bind extra
    /// state to the connection (e.g. the byte socket).
    pub fn connect_with_handler(
        &self,
        service: &PeerService,
        rsap: u8,
        handler: Box<dyn ConnectionHandler>,
        complete: impl FnOnce(&PeerConnection, ConnectResult) + 'static,
    ) -> Result<PeerConnection> {
        let r = self.inner.borrow_mut().connect_internal(
            service,
            rsap,
            None,
            Some(handler),
            Some(Box::new(complete)),
        );
        dispatch_pending(&self.inner);
        r
    }

    /// Like [`connect_sn`](Llc::connect_sn) with an explicit handler.
    pub fn connect_sn_with_handler(
        &self,
        service: &PeerService,
        sn: &str,
        handler: Box<dyn ConnectionHandler>,
        complete: impl FnOnce(&PeerConnection, ConnectResult) + 'static,
    ) -> Result<PeerConnection> {
        let r = self.inner.borrow_mut().connect_internal(
            service,
            0,
            Some(sn),
            Some(handler),
            Some(Box::new(complete)),
        );
        dispatch_pending(&self.inner);
        r
    }

    /// Register a service on this link and assign its SAP.
    pub fn register_service(&self, service: &PeerService) -> Result<u8> {
        self.inner.borrow_mut().services.add(service)
    }

    pub fn unregister_service(&self, service: &PeerService) {
        self.inner.borrow_mut().services.remove(service);
    }

    /// Acknowledge delivered data now; `last` marks the receiver busy (RNR).
    pub fn ack(&self, conn: &PeerConnection, last: bool) {
        self.inner.borrow_mut().ack_conn(conn.shared.id, last);
        dispatch_pending(&self.inner);
    }

    /// Whether an I PDU for this connection is waiting in the PDU queue.
    pub fn i_pdu_queued(&self, conn: &PeerConnection) -> bool {
        self.inner.borrow().i_pdu_queued_for(conn.shared.id)
    }

    pub fn add_state_changed_handler(&self, f: impl Fn(LlcState) + 'static) -> HandlerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_handler_id();
        inner.state_observers.push((id, Rc::new(f)));
        id
    }

    pub fn add_idle_changed_handler(&self, f: impl Fn(bool) + 'static) -> HandlerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_handler_id();
        inner.idle_observers.push((id, Rc::new(f)));
        id
    }

    pub fn add_wks_changed_handler(&self, f: impl Fn(u16) + 'static) -> HandlerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_handler_id();
        inner.wks_observers.push((id, Rc::new(f)));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) {
        let mut inner = self.inner.borrow_mut();
        inner.state_observers.retain(|(h, _)| *h != id);
        inner.idle_observers.retain(|(h, _)| *h != id);
        inner.wks_observers.retain(|(h, _)| *h != id);
    }
}

impl LlcInner {
    fn next_handler_id(&mut self) -> HandlerId {
        self.next_handler += 1;
        HandlerId(self.next_handler)
    }
}

impl Drop for Llc {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 {
            // Engine teardown kills every connection
            self.inner.borrow_mut().abort_link();
            dispatch_pending(&self.inner);
        }
    }
}
