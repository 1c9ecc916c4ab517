// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nfclink contributors

//! Data link connections
//!
//! Per-connection state machine, LLCP sequence variables, the windowed send
//! queue with cross-buffer fragmentation, and the capability surface through
//! which concrete connection kinds (raw, byte socket, SNEP) hook into the
//! engine.
//!
//! # State machine
//!
//! ```text
//!   [*]           -> CONNECTING    (local CONNECT sent)
//!   [*]           -> ACCEPTING     (remote CONNECT received)
//!   CONNECTING    -> ACTIVE        (CC received)
//!   CONNECTING    -> ABANDONED     (local disconnect before CC)
//!   ABANDONED     -> DEAD          (CC answered with DISC, or DM received)
//!   ACCEPTING     -> ACTIVE        (accepted, CC sent)
//!   ACCEPTING     -> DEAD          (rejected, DM sent)
//!   ACTIVE        -> DISCONNECTING (local disconnect, flush allowed)
//!   ACTIVE        -> DEAD          (DM/FRMR/DISC received)
//!   DISCONNECTING -> DEAD          (DM reply or link lost)
//! ```
//!
//! DEAD is absorbing.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::llc::engine::{dispatch_pending, HandlerId, LlcInner, Pending};
use crate::llc::service::PeerService;
use crate::protocol::{self, DmReason, Ptype, MIU_DEFAULT, MIU_MAX, RW_DEFAULT, RW_MAX, SEQ_MASK};

/// Connection state. The declaration order matters: everything up to and
/// including `Active` counts as "may still carry data".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    Connecting,
    Accepting,
    Abandoned,
    Active,
    Disconnecting,
    Dead,
}

impl ConnState {
    pub(crate) fn name(self) -> &'static str {
        match self {
            ConnState::Connecting => "CONNECTING",
            ConnState::Accepting => "ACCEPTING",
            ConnState::Abandoned => "ABANDONED",
            ConnState::Active => "ACTIVE",
            ConnState::Disconnecting => "DISCONNECTING",
            ConnState::Dead => "DEAD",
        }
    }
}

/// Outcome reported to the completion callback of a `connect` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    Ok,
    /// DM with reason `NoService` answered the CONNECT.
    NoService,
    /// DM with reason `Reject`, or FRMR, answered the CONNECT.
    Rejected,
    /// DM with another reason answered the CONNECT.
    Failed,
    /// The request was cancelled locally.
    Cancelled,
    /// Reserved for engine-internal use.
    Duplicate,
}

/// Engine-internal connection identifier, stable across the rsap rewrite
/// that a CC may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnId(pub(crate) u64);

/// Connection table key: (local SAP, remote SAP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    pub(crate) lsap: u8,
    pub(crate) rsap: u8,
}

/// LLCP sequence state (TS-LLCP 1.1 Section 5.6.1), all modulo 16.
#[derive(Debug, Clone)]
pub(crate) struct LlcpState {
    /// V(S): sequence number of the next I PDU to send.
    pub(crate) vs: u8,
    /// V(SA): most recently received N(R).
    pub(crate) vsa: u8,
    /// V(R): sequence number of the next expected I PDU.
    pub(crate) vr: u8,
    /// V(RA): most recently sent N(R).
    pub(crate) vra: u8,
    /// MIU advertised by the remote endpoint.
    pub(crate) rmiu: u16,
    /// RW(R): receive window advertised by the remote endpoint.
    pub(crate) rwr: u8,
    /// Latched by RNR, cleared by RR: hold I PDU emission.
    pub(crate) remote_busy: bool,
}

impl Default for LlcpState {
    fn default() -> Self {
        Self {
            vs: 0,
            vsa: 0,
            vr: 0,
            vra: 0,
            rmiu: MIU_DEFAULT,
            rwr: RW_DEFAULT,
            remote_busy: false,
        }
    }
}

/// Application-visible connection cells, shared between the engine entry and
/// any number of [`PeerConnection`] handles.
pub(crate) struct ConnShared {
    pub(crate) id: ConnId,
    pub(crate) service: PeerService,
    pub(crate) name: Option<String>,
    pub(crate) rsap: Cell<u8>,
    pub(crate) state: Cell<ConnState>,
    pub(crate) rmiu: Cell<u16>,
    pub(crate) bytes_queued: Cell<usize>,
    pub(crate) bytes_sent: Cell<u64>,
    pub(crate) bytes_received: Cell<u64>,
    pub(crate) llc: RefCell<Weak<RefCell<LlcInner>>>,
    pub(crate) observers: RefCell<Vec<(HandlerId, Rc<dyn Fn(&PeerConnection)>)>>,
    pub(crate) next_observer: Cell<u64>,
}

impl ConnShared {
    pub(crate) fn key(&self) -> ConnKey {
        ConnKey {
            lsap: self.service.sap(),
            rsap: self.rsap.get(),
        }
    }
}

/// Engine-owned connection entry.
pub(crate) struct Conn {
    pub(crate) shared: Rc<ConnShared>,
    pub(crate) ps: LlcpState,
    /// Local parameters announced in CONNECT/CC.
    pub(crate) lmiu: u16,
    pub(crate) lrw: u8,
    pub(crate) send_queue: std::collections::VecDeque<Vec<u8>>,
    pub(crate) send_off: usize,
    pub(crate) disc_sent: bool,
    pub(crate) handler: Option<Box<dyn ConnectionHandler>>,
    /// A state transition happened while the handler was out on a call;
    /// its `state_changed` hook is replayed when the call returns.
    pub(crate) hook_pending: bool,
}

impl Conn {
    pub(crate) fn new(
        id: ConnId,
        service: PeerService,
        rsap: u8,
        name: Option<String>,
        state: ConnState,
        handler: Box<dyn ConnectionHandler>,
        llc: Weak<RefCell<LlcInner>>,
    ) -> Conn {
        let shared = Rc::new(ConnShared {
            id,
            service,
            name,
            rsap: Cell::new(rsap),
            state: Cell::new(state),
            rmiu: Cell::new(MIU_DEFAULT),
            bytes_queued: Cell::new(0),
            bytes_sent: Cell::new(0),
            bytes_received: Cell::new(0),
            llc: RefCell::new(llc),
            observers: RefCell::new(Vec::new()),
            next_observer: Cell::new(1),
        });
        shared.service.connection_created(&shared);
        log::debug!(
            "Connection {}:{} {}",
            shared.service.sap(),
            rsap,
            state.name()
        );
        Conn {
            shared,
            ps: LlcpState::default(),
            lmiu: MIU_MAX,
            lrw: RW_MAX,
            send_queue: std::collections::VecDeque::new(),
            send_off: 0,
            disc_sent: false,
            handler: Some(handler),
            hook_pending: false,
        }
    }

    /// 5.6.4.1: no I PDU while `V(S) == (V(SA) + RW(R)) mod 16`, and none
    /// while the remote has declared itself busy.
    pub(crate) fn can_send_i(&self) -> bool {
        !self.ps.remote_busy && self.ps.vs != (self.ps.vsa.wrapping_add(self.ps.rwr)) & SEQ_MASK
    }
}

// ============================================================================
// Capability surface
// ============================================================================

/// Per-connection capability vtable.
///
/// Concrete connection kinds (raw PDU sink, byte socket, SNEP reassembler)
/// implement the hooks they care about; every hook runs synchronously on the
/// engine's event loop with bounded engine access through the context.
pub trait ConnectionHandler {
    /// The remote asked for this connection; decide its fate. The default
    /// accepts immediately (emits CC, goes ACTIVE). Call
    /// [`ConnectionCtx::rejected`] instead to answer DM\[REJECT\].
    fn accept(&mut self, conn: &mut ConnectionCtx<'_>) {
        conn.accepted();
    }

    /// A locally initiated disconnect killed the connection while it was
    /// still ACCEPTING.
    fn accept_cancelled(&mut self) {}

    /// The connection state changed; the new state is `conn.state()`.
    fn state_changed(&mut self, conn: &mut ConnectionCtx<'_>) {
        let _ = conn;
    }

    /// In-sequence I PDU payload arrived.
    fn data_received(&mut self, conn: &mut ConnectionCtx<'_>, data: &[u8]) {
        let _ = (conn, data);
    }

    /// Queued bytes left the send queue (emitted or dropped); room opened.
    fn data_dequeued(&mut self, conn: &mut ConnectionCtx<'_>) {
        let _ = conn;
    }
}

/// Handler that accepts everything and ignores all data.
pub struct NopConnectionHandler;

impl ConnectionHandler for NopConnectionHandler {}

/// Bounded engine access handed to [`ConnectionHandler`] hooks.
pub struct ConnectionCtx<'a> {
    pub(crate) llc: &'a mut LlcInner,
    pub(crate) id: ConnId,
    pub(crate) shared: Rc<ConnShared>,
}

impl ConnectionCtx<'_> {
    /// Handle to the connection this context addresses.
    pub fn connection(&self) -> PeerConnection {
        PeerConnection {
            shared: Rc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> ConnState {
        self.shared.state.get()
    }

    /// MIU advertised by the remote endpoint.
    pub fn rmiu(&self) -> u16 {
        self.shared.rmiu.get()
    }

    /// Accept an ACCEPTING connection: emit CC and go ACTIVE.
    pub fn accepted(&mut self) {
        self.llc.conn_accepted(self.id);
    }

    /// Reject an ACCEPTING connection: emit DM\[REJECT\] and die.
    pub fn rejected(&mut self) {
        self.llc.conn_rejected(self.id);
    }

    /// Queue bytes for transmission; see [`PeerConnection::send`].
    pub fn send(&mut self, data: &[u8]) -> bool {
        self.llc.conn_send(self.id, data)
    }

    /// Orderly disconnect; queued data is flushed first.
    pub fn disconnect(&mut self) {
        self.llc.disconnect_conn(self.id, true);
    }

    /// Acknowledge received data now instead of piggybacking; `last` sends
    /// RNR (receiver busy) instead of RR.
    pub fn ack(&mut self, last: bool) {
        self.llc.ack_conn(self.id, last);
    }

    /// Run a callback after the engine finishes the current dispatch. Use
    /// for application notifications that may re-enter the public API.
    pub fn defer(&mut self, f: impl FnOnce() + 'static) {
        self.llc.pending.push(Pending::Call(Box::new(f)));
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Application handle to a data link connection.
///
/// Cheap to clone; the engine owns the connection itself. Calls on a handle
/// whose engine is gone (or whose connection is DEAD) are no-ops returning
/// `false` where a result is expected.
#[derive(Clone)]
pub struct PeerConnection {
    pub(crate) shared: Rc<ConnShared>,
}

impl PeerConnection {
    pub fn state(&self) -> ConnState {
        self.shared.state.get()
    }

    /// Remote service name, for connections initiated by name.
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    /// Local SAP (the service's).
    pub fn sap(&self) -> u8 {
        self.shared.service.sap()
    }

    /// Remote SAP. Zero until a connect-by-name is answered with CC.
    pub fn rsap(&self) -> u8 {
        self.shared.rsap.get()
    }

    pub fn service(&self) -> &PeerService {
        &self.shared.service
    }

    /// MIU advertised by the remote endpoint.
    pub fn rmiu(&self) -> u16 {
        self.shared.rmiu.get()
    }

    /// Bytes accepted by `send` but not yet emitted in I PDUs.
    pub fn bytes_queued(&self) -> usize {
        self.shared.bytes_queued.get()
    }

    /// Bytes emitted in I PDUs so far.
    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.get()
    }

    /// Payload bytes delivered by in-sequence I PDUs so far.
    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.get()
    }

    /// Queue bytes for transmission.
    ///
    /// Accepted while CONNECTING, ACCEPTING or ACTIVE; data queued before
    /// the connection goes ACTIVE is flushed on that transition. Returns
    /// `false` once the connection is past ACTIVE.
    pub fn send(&self, data: &[u8]) -> bool {
        self.with_engine(|inner, id| inner.conn_send(id, data))
            .unwrap_or(false)
    }

    /// Orderly disconnect: queued data is flushed, then DISC is emitted.
    pub fn disconnect(&self) {
        let _ = self.with_engine(|inner, id| inner.disconnect_conn(id, true));
    }

    /// Cancel a pending connect, or tear down an active connection without
    /// flushing. Returns `true` when a queued connect request was cancelled.
    pub fn cancel(&self) -> bool {
        self.with_engine(|inner, id| inner.cancel_conn(id))
            .unwrap_or(false)
    }

    /// Observe state transitions. The callback runs after the engine turn
    /// that caused the transition and may call back into the API.
    pub fn add_state_changed_handler(
        &self,
        f: impl Fn(&PeerConnection) + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.shared.next_observer.get());
        self.shared.next_observer.set(id.0 + 1);
        self.shared.observers.borrow_mut().push((id, Rc::new(f)));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) {
        self.shared.observers.borrow_mut().retain(|(h, _)| *h != id);
    }

    fn with_engine<R>(&self, f: impl FnOnce(&mut LlcInner, ConnId) -> R) -> Option<R> {
        let rc = self.shared.llc.borrow().upgrade()?;
        let r = f(&mut rc.borrow_mut(), self.shared.id);
        dispatch_pending(&rc);
        Some(r)
    }
}

// ============================================================================
// Engine-side connection operations
// ============================================================================

impl LlcInner {
    pub(crate) fn conn_shared(&self, id: ConnId) -> Option<Rc<ConnShared>> {
        self.conns.get(&id).map(|c| Rc::clone(&c.shared))
    }

    /// Temporarily take the handler out of the entry, run `f` with a context
    /// borrowing the whole engine, then put the handler back. State
    /// transitions that happened while the handler was out get their
    /// `state_changed` hook replayed before this returns.
    pub(crate) fn call_handler(
        &mut self,
        id: ConnId,
        f: impl FnOnce(&mut dyn ConnectionHandler, &mut ConnectionCtx<'_>),
    ) {
        if !self.run_handler(id, f) {
            return;
        }
        loop {
            let pending = match self.conns.get_mut(&id) {
                Some(conn) => std::mem::replace(&mut conn.hook_pending, false),
                None => false,
            };
            if !pending {
                break;
            }
            if !self.run_handler(id, |h, ctx| h.state_changed(ctx)) {
                break;
            }
        }
    }

    /// One take/call/restore cycle; `false` when the handler is unavailable
    /// (already out on an enclosing call, or the entry is gone).
    pub(crate) fn run_handler(
        &mut self,
        id: ConnId,
        f: impl FnOnce(&mut dyn ConnectionHandler, &mut ConnectionCtx<'_>),
    ) -> bool {
        let Some(mut handler) = self.conns.get_mut(&id).and_then(|c| c.handler.take()) else {
            return false;
        };
        let shared = Rc::clone(&self.conns[&id].shared);
        {
            let mut ctx = ConnectionCtx {
                llc: self,
                id,
                shared,
            };
            f(handler.as_mut(), &mut ctx);
        }
        if let Some(conn) = self.conns.get_mut(&id) {
            if conn.handler.is_none() {
                conn.handler = Some(handler);
            }
        }
        true
    }

    /// Apply MIUX/RW from CONNECT or CC parameters; everything else is
    /// irrelevant at the connection level.
    pub(crate) fn apply_remote_params(&mut self, id: ConnId, params: &[protocol::param::Param]) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        for param in params {
            match param {
                protocol::param::Param::Miu(miu) => {
                    conn.ps.rmiu = *miu;
                    conn.shared.rmiu.set(*miu);
                    log::debug!("  MIU(R): {} bytes", miu);
                }
                protocol::param::Param::Rw(rw) => {
                    conn.ps.rwr = *rw;
                    log::debug!("  RW(R): {}", rw);
                }
                _ => {}
            }
        }
    }

    /// Drop everything still queued for transmission. Returns whether
    /// anything was dropped.
    pub(crate) fn drop_queued(&mut self, id: ConnId) -> bool {
        let Some(conn) = self.conns.get_mut(&id) else {
            return false;
        };
        if conn.send_queue.is_empty() {
            return false;
        }
        conn.send_queue.clear();
        conn.send_off = 0;
        conn.shared.bytes_queued.set(0);
        true
    }

    /// Move the connection to a new state and run the attached side effects.
    /// DEAD is absorbing.
    pub(crate) fn set_conn_state(&mut self, id: ConnId, state: ConnState) {
        let Some(conn) = self.conns.get(&id) else {
            return;
        };
        let old = conn.shared.state.get();
        if old == state || old == ConnState::Dead {
            return;
        }
        log::debug!(
            "Connection {}:{} {} -> {}",
            conn.shared.service.sap(),
            conn.shared.rsap.get(),
            old.name(),
            state.name()
        );
        conn.shared.state.set(state);
        let shared = Rc::clone(&conn.shared);

        if !self.run_handler(id, |h, ctx| h.state_changed(ctx)) {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.hook_pending = true;
            }
        }
        self.pending.push(Pending::ConnState(PeerConnection {
            shared: Rc::clone(&shared),
        }));

        // Hooks may have moved the state on; act on what is current.
        match shared.state.get() {
            ConnState::Dead => {
                let dropped = self.drop_queued(id);
                if let Some(conn) = self.conns.get(&id) {
                    let key = conn.shared.key();
                    if self.conn_table.get(&key) == Some(&id) {
                        self.conn_table.remove(&key);
                    }
                }
                shared.service.connection_dead(&shared);
                if dropped {
                    self.call_handler(id, |h, ctx| h.data_dequeued(ctx));
                }
                // Retire the entry unless a queued connect still references it
                if !self.connect_queue.iter().any(|r| r.conn == id) {
                    self.conns.remove(&id);
                }
            }
            ConnState::Active => self.flush_conn(id),
            _ => {}
        }
    }

    /// Queue application bytes; flush right away when ACTIVE.
    pub(crate) fn conn_send(&mut self, id: ConnId, data: &[u8]) -> bool {
        let Some(conn) = self.conns.get_mut(&id) else {
            return false;
        };
        match conn.shared.state.get() {
            ConnState::Connecting | ConnState::Accepting | ConnState::Active => {
                if !data.is_empty() {
                    let state = conn.shared.state.get();
                    conn.shared
                        .bytes_queued
                        .set(conn.shared.bytes_queued.get() + data.len());
                    conn.send_queue.push_back(data.to_vec());
                    if state == ConnState::Active {
                        self.flush_conn(id);
                    }
                }
                true
            }
            ConnState::Abandoned | ConnState::Disconnecting | ConnState::Dead => false,
        }
    }

    /// Emit as many I PDUs as the send window and the PDU queue allow,
    /// splitting and concatenating buffers to fill RMIU-sized frames.
    ///
    /// When an I PDU for this connection is already sitting in the engine's
    /// PDU queue, data keeps accumulating instead; the send path calls back
    /// here once that frame leaves for the wire.
    pub(crate) fn flush_conn(&mut self, id: ConnId) {
        let mut submitted = false;

        loop {
            let Some(conn) = self.conns.get(&id) else {
                return;
            };
            if conn.send_queue.is_empty() || !conn.can_send_i() {
                break;
            }
            if self.i_pdu_queued_for(id) {
                break;
            }

            let fragment = {
                let conn = self.conns.get_mut(&id).expect("checked above");
                let rmiu = conn.ps.rmiu as usize;
                let head_len = conn.send_queue.front().expect("non-empty").len();
                let remaining = head_len - conn.send_off;

                if remaining > rmiu {
                    // Full frame from the middle of this buffer
                    let head = conn.send_queue.front().expect("non-empty");
                    let frag = head[conn.send_off..conn.send_off + rmiu].to_vec();
                    conn.send_off += rmiu;
                    frag
                } else if remaining == rmiu || conn.send_queue.len() == 1 {
                    // The rest of this buffer makes exactly one frame
                    let head = conn.send_queue.pop_front().expect("non-empty");
                    let frag = head[conn.send_off..].to_vec();
                    conn.send_off = 0;
                    frag
                } else {
                    // Concatenate across buffer boundaries
                    let head = conn.send_queue.pop_front().expect("non-empty");
                    let mut buf = head[conn.send_off..].to_vec();
                    conn.send_off = 0;
                    while buf.len() < rmiu && !conn.send_queue.is_empty() {
                        let space = rmiu - buf.len();
                        let block_len = conn.send_queue.front().expect("non-empty").len();
                        if block_len <= space {
                            let block = conn.send_queue.pop_front().expect("non-empty");
                            buf.extend_from_slice(&block);
                        } else {
                            let block = conn.send_queue.front().expect("non-empty");
                            buf.extend_from_slice(&block[..space]);
                            conn.send_off = space;
                        }
                    }
                    buf
                }
            };

            self.submit_i_pdu(id, &fragment);
            submitted = true;
        }

        // Once the queue drains, a pending orderly disconnect emits its DISC
        let disc = self.conns.get(&id).is_some_and(|c| {
            c.send_queue.is_empty()
                && c.shared.state.get() == ConnState::Disconnecting
                && !c.disc_sent
        });
        if disc {
            let (rsap, lsap) = {
                let conn = self.conns.get_mut(&id).expect("checked above");
                conn.disc_sent = true;
                (conn.shared.rsap.get(), conn.shared.service.sap())
            };
            self.submit_disc(rsap, lsap);
        }

        if submitted {
            self.call_handler(id, |h, ctx| h.data_dequeued(ctx));
        }
    }

    /// Encode and queue one I PDU carrying `(V(S), V(R))`, then advance the
    /// sequence state (5.6.1.1, 5.6.1.4).
    pub(crate) fn submit_i_pdu(&mut self, id: ConnId, payload: &[u8]) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        let mut pdu = protocol::pdu_new(
            conn.shared.rsap.get(),
            Ptype::I,
            conn.shared.service.sap(),
        );
        pdu.push((conn.ps.vs << 4) | conn.ps.vr);
        pdu.extend_from_slice(payload);

        conn.ps.vs = conn.ps.vs.wrapping_add(1) & SEQ_MASK;
        conn.ps.vra = conn.ps.vr;

        let queued = conn.shared.bytes_queued.get();
        debug_assert!(queued >= payload.len());
        conn.shared.bytes_queued.set(queued.saturating_sub(payload.len()));
        conn.shared
            .bytes_sent
            .set(conn.shared.bytes_sent.get() + payload.len() as u64);

        self.submit(pdu);
    }

    /// Whether the PDU queue already holds an I PDU for this connection.
    pub(crate) fn i_pdu_queued_for(&self, id: ConnId) -> bool {
        let Some(conn) = self.conns.get(&id) else {
            return false;
        };
        let hdr = protocol::make_header(
            conn.shared.rsap.get(),
            Ptype::I as u8,
            conn.shared.service.sap(),
        );
        self.pdu_queue
            .iter()
            .any(|pdu| pdu.len() >= 2 && u16::from_be_bytes([pdu[0], pdu[1]]) == hdr)
    }

    /// 5.6.1.4: acknowledge received data with RR (or RNR when `last`) if
    /// V(RA) lags V(R) on an active connection.
    pub(crate) fn ack_conn(&mut self, id: ConnId, last: bool) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.shared.state.get() != ConnState::Active || conn.ps.vra == conn.ps.vr {
            return;
        }
        conn.ps.vra = conn.ps.vr;
        let ptype = if last { Ptype::Rnr } else { Ptype::Rr };
        let mut pdu = protocol::pdu_new(
            conn.shared.rsap.get(),
            ptype,
            conn.shared.service.sap(),
        );
        pdu.push(conn.ps.vra);
        self.submit(pdu);
    }

    /// Accept an ACCEPTING connection: CC out, then ACTIVE.
    pub(crate) fn conn_accepted(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get(&id) else {
            return;
        };
        if conn.shared.state.get() != ConnState::Accepting {
            return;
        }
        log::debug!(
            "Connection {}:{} accepted",
            conn.shared.service.sap(),
            conn.shared.rsap.get()
        );
        self.submit_cc(id);
        self.set_conn_state(id, ConnState::Active);
    }

    /// Reject an ACCEPTING connection: DM\[REJECT\] out, then DEAD.
    pub(crate) fn conn_rejected(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get(&id) else {
            return;
        };
        if conn.shared.state.get() != ConnState::Accepting {
            return;
        }
        let rsap = conn.shared.rsap.get();
        let lsap = conn.shared.service.sap();
        log::debug!("Connection {}:{} rejected", lsap, rsap);
        self.submit_dm(rsap, lsap, DmReason::Reject);
        self.set_conn_state(id, ConnState::Dead);
    }

    /// Local disconnect. With `flush` the queue drains first; without it the
    /// queued data is dropped on the floor.
    pub(crate) fn disconnect_conn(&mut self, id: ConnId, flush: bool) {
        let Some(conn) = self.conns.get(&id) else {
            return;
        };
        let state = conn.shared.state.get();
        let rsap = conn.shared.rsap.get();
        let lsap = conn.shared.service.sap();
        let mut dropped = false;

        match state {
            ConnState::Connecting => {
                log::debug!("Abandoning {}:{}", lsap, rsap);
                dropped = self.drop_queued(id);
                self.set_conn_state(id, ConnState::Abandoned);
            }
            ConnState::Accepting => {
                log::debug!("Connection {}:{} cancelled", lsap, rsap);
                dropped = self.drop_queued(id);
                self.call_handler(id, |h, _| h.accept_cancelled());
                self.set_conn_state(id, ConnState::Dead);
            }
            ConnState::Active => {
                self.ack_conn(id, true);
                log::debug!("Disconnecting {}:{}", lsap, rsap);
                if !flush {
                    dropped = self.drop_queued(id);
                }
                let empty = self
                    .conns
                    .get(&id)
                    .is_some_and(|c| c.send_queue.is_empty());
                if empty {
                    self.submit_disc(rsap, lsap);
                    if let Some(conn) = self.conns.get_mut(&id) {
                        conn.disc_sent = true;
                    }
                }
                self.set_conn_state(id, ConnState::Disconnecting);
            }
            ConnState::Abandoned | ConnState::Disconnecting | ConnState::Dead => {}
        }

        if dropped {
            self.call_handler(id, |h, ctx| h.data_dequeued(ctx));
        }
    }

    /// Cancel a queued connect request, or fall back to a non-flushing
    /// disconnect for anything already past the queue.
    pub(crate) fn cancel_conn(&mut self, id: ConnId) -> bool {
        if let Some(pos) = self.connect_queue.iter().position(|r| r.conn == id) {
            let sent = self.connect_queue[pos].sent;
            let complete = self.connect_queue[pos].complete.take();
            if let Some(complete) = complete {
                if let Some(shared) = self.conn_shared(id) {
                    self.pending.push(Pending::Complete {
                        complete,
                        conn: PeerConnection { shared },
                        result: ConnectResult::Cancelled,
                    });
                }
            }
            if !sent {
                // CONNECT never hit the wire: the request just disappears
                self.connect_queue.remove(pos);
                self.set_conn_state(id, ConnState::Dead);
            } else {
                // In flight: abandon, the CC/DM arrival retires the slot
                self.disconnect_conn(id, false);
            }
            return true;
        }
        self.disconnect_conn(id, false);
        false
    }
}
