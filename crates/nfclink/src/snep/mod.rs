// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nfclink contributors

//! SNEP default server
//!
//! The Put-accepting endpoint bound to `urn:nfc:sn:snep` at SAP 4
//! (NFCForum-TS-SNEP_1.0). Each incoming connection carries one SNEP
//! request; a complete, in-bounds Put replaces the server's NDEF snapshot
//! and is answered with Success before the connection is torn down.
//!
//! Message header (6 octets): `version(1) code(1) length(4 big-endian)`.
//! Requests larger than one MIU arrive across several I PDUs; the first
//! fragment must carry at least the full header and is acknowledged with a
//! Continue response while the rest streams in.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::llc::connection::{ConnState, ConnectionCtx, ConnectionHandler};
use crate::llc::engine::HandlerId;
use crate::llc::service::{PeerService, ServiceHandler};
use crate::ndef::NdefData;
use crate::protocol::NAME_SNEP;

/// SNEP protocol version 1.0: `(major << 4) | minor`.
pub const SNEP_VERSION: u8 = 0x10;
const SNEP_MAJOR_VERSION: u8 = 1;

/// Request codes (TS-SNEP 1.0 Table 2).
pub mod request {
    pub const CONTINUE: u8 = 0x00;
    pub const GET: u8 = 0x01;
    pub const PUT: u8 = 0x02;
    pub const REJECT: u8 = 0x7f;
}

/// Response codes (TS-SNEP 1.0 Table 3).
pub mod response {
    pub const CONTINUE: u8 = 0x80;
    pub const SUCCESS: u8 = 0x81;
    pub const NOT_FOUND: u8 = 0xc0;
    pub const EXCESS_DATA: u8 = 0xc1;
    pub const BAD_REQUEST: u8 = 0xc2;
    pub const NOT_IMPLEMENTED: u8 = 0xe0;
    pub const UNSUPPORTED_VERSION: u8 = 0xe1;
    pub const REJECT: u8 = 0xff;
}

/// Server state: RECEIVING while at least one connection is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnepState {
    Listening,
    Receiving,
}

struct SnepShared {
    state: Cell<SnepState>,
    state_dirty: Cell<bool>,
    ndef: RefCell<Option<NdefData>>,
    connections: Cell<usize>,
    state_observers: RefCell<Vec<(HandlerId, Rc<dyn Fn(SnepState)>)>>,
    ndef_observers: RefCell<Vec<(HandlerId, Rc<dyn Fn()>)>>,
    next_observer: Cell<u64>,
}

impl SnepShared {
    fn set_state(&self, state: SnepState) {
        if self.state.get() != state {
            self.state.set(state);
            self.state_dirty.set(true);
        }
    }

    fn connection_opened(&self) {
        let prev = self.connections.get();
        self.connections.set(prev + 1);
        if prev == 0 {
            self.set_state(SnepState::Receiving);
        }
    }

    fn connection_closed(&self) {
        let count = self.connections.get().saturating_sub(1);
        self.connections.set(count);
        if count == 0 {
            self.set_state(SnepState::Listening);
        }
    }

    fn notify_state(self: &Rc<Self>, ctx: &mut ConnectionCtx<'_>) {
        if !self.state_dirty.replace(false) {
            return;
        }
        let shared = Rc::clone(self);
        ctx.defer(move || {
            let state = shared.state.get();
            let cbs: Vec<_> = shared
                .state_observers
                .borrow()
                .iter()
                .map(|(_, f)| Rc::clone(f))
                .collect();
            for f in cbs {
                f(state);
            }
        });
    }
}

/// The SNEP default server.
///
/// Create one, then register [`service`](SnepServer::service) on the link.
/// The last complete Put is available as [`ndef`](SnepServer::ndef).
pub struct SnepServer {
    shared: Rc<SnepShared>,
    service: PeerService,
}

impl Default for SnepServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SnepServer {
    pub fn new() -> SnepServer {
        let shared = Rc::new(SnepShared {
            state: Cell::new(SnepState::Listening),
            state_dirty: Cell::new(false),
            ndef: RefCell::new(None),
            connections: Cell::new(0),
            state_observers: RefCell::new(Vec::new()),
            ndef_observers: RefCell::new(Vec::new()),
            next_observer: Cell::new(1),
        });
        let service = PeerService::new(
            Some(NAME_SNEP),
            Box::new(SnepService {
                shared: Rc::clone(&shared),
            }),
        );
        SnepServer { shared, service }
    }

    /// The service to register with the engine (name `urn:nfc:sn:snep`,
    /// SAP 4).
    pub fn service(&self) -> &PeerService {
        &self.service
    }

    pub fn state(&self) -> SnepState {
        self.shared.state.get()
    }

    /// The most recently received NDEF, if any Put completed yet.
    pub fn ndef(&self) -> Option<NdefData> {
        self.shared.ndef.borrow().clone()
    }

    pub fn add_state_changed_handler(&self, f: impl Fn(SnepState) + 'static) -> HandlerId {
        let id = self.next_observer();
        self.shared
            .state_observers
            .borrow_mut()
            .push((id, Rc::new(f)));
        id
    }

    /// Observe NDEF replacement. Fires once per completed Put, after the
    /// full message is reassembled and committed.
    pub fn add_ndef_changed_handler(&self, f: impl Fn() + 'static) -> HandlerId {
        let id = self.next_observer();
        self.shared
            .ndef_observers
            .borrow_mut()
            .push((id, Rc::new(f)));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) {
        self.shared
            .state_observers
            .borrow_mut()
            .retain(|(h, _)| *h != id);
        self.shared
            .ndef_observers
            .borrow_mut()
            .retain(|(h, _)| *h != id);
    }

    fn next_observer(&self) -> HandlerId {
        let id = HandlerId(self.shared.next_observer.get());
        self.shared.next_observer.set(id.0 + 1);
        id
    }
}

struct SnepService {
    shared: Rc<SnepShared>,
}

impl ServiceHandler for SnepService {
    fn new_accept(&mut self, _service: &PeerService, _rsap: u8) -> Option<Box<dyn ConnectionHandler>> {
        log::debug!("Accepting incoming SNEP connection");
        self.shared.connection_opened();
        Some(Box::new(SnepConnection {
            shared: Rc::clone(&self.shared),
            buf: None,
            ndef_length: 0,
            closed: false,
        }))
    }
}

/// Per-connection SNEP request parser and reassembler.
struct SnepConnection {
    shared: Rc<SnepShared>,
    /// Present while a fragmented Put is being reassembled.
    buf: Option<Vec<u8>>,
    ndef_length: usize,
    closed: bool,
}

impl SnepConnection {
    fn respond(ctx: &mut ConnectionCtx<'_>, code: u8) {
        let mut pkt = [0u8; 6];
        pkt[0] = SNEP_VERSION;
        pkt[1] = code;
        ctx.send(&pkt);
    }

    fn receive_ndef(&mut self, ctx: &mut ConnectionCtx<'_>, data: &[u8]) {
        let buf = self.buf.as_mut().expect("reassembly in progress");
        if buf.len() + data.len() > self.ndef_length {
            log::warn!(
                "Broken SNEP request ({} > {})",
                buf.len() + data.len(),
                self.ndef_length
            );
            ctx.disconnect();
            return;
        }
        buf.extend_from_slice(data);
        log::debug!("Received {} bytes", buf.len());
        if buf.len() == self.ndef_length {
            // Complete: parse, commit, answer Success, hang up
            let ndef = NdefData::parse(buf);
            let prev = self.shared.ndef.replace(ndef.clone());
            if prev.is_some() || ndef.is_some() {
                let shared = Rc::clone(&self.shared);
                ctx.defer(move || {
                    let cbs: Vec<_> = shared
                        .ndef_observers
                        .borrow()
                        .iter()
                        .map(|(_, f)| Rc::clone(f))
                        .collect();
                    for f in cbs {
                        f();
                    }
                });
            }
            Self::respond(ctx, response::SUCCESS);
            ctx.disconnect();
        }
    }
}

impl Drop for SnepConnection {
    fn drop(&mut self) {
        // Covers teardown paths that never saw the DEAD transition
        if !self.closed {
            self.shared.connection_closed();
        }
    }
}

impl ConnectionHandler for SnepConnection {
    fn state_changed(&mut self, conn: &mut ConnectionCtx<'_>) {
        if conn.state() == ConnState::Dead && !self.closed {
            self.closed = true;
            self.shared.connection_closed();
        }
        self.shared.notify_state(conn);
    }

    fn data_received(&mut self, conn: &mut ConnectionCtx<'_>, data: &[u8]) {
        if self.buf.is_some() {
            // Trailing fragments of a Put
            self.receive_ndef(conn, data);
            return;
        }
        if data.len() < 6 {
            // 2.1: the first fragment must carry the whole header
            log::warn!("Not enough bytes for SNEP header ({})", data.len());
            conn.disconnect();
            return;
        }
        let version = data[0];
        let op = data[1];
        log::debug!("SNEP Version {}.{}", version >> 4, version & 0x0f);
        if (version >> 4) != SNEP_MAJOR_VERSION {
            log::debug!("Unsupported SNEP Version {}", version >> 4);
            Self::respond(conn, response::UNSUPPORTED_VERSION);
            conn.disconnect();
        } else if op == request::GET {
            // 6.1: the default server does not accept Get
            log::debug!("NDEF Get not accepted");
            Self::respond(conn, response::NOT_IMPLEMENTED);
            conn.disconnect();
        } else if op != request::PUT {
            log::debug!("Unsupported SNEP Request 0x{:02x}", op);
            Self::respond(conn, response::BAD_REQUEST);
            conn.disconnect();
        } else {
            // 3.1.3: length is a 32-bit big-endian octet count
            self.ndef_length =
                u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;
            log::debug!("NDEF Put {} bytes", self.ndef_length);
            self.buf = Some(Vec::with_capacity(self.ndef_length));
            self.receive_ndef(conn, &data[6..]);
            if self
                .buf
                .as_ref()
                .is_some_and(|b| b.len() < self.ndef_length)
            {
                // 5.1: ready to take the remaining fragments
                Self::respond(conn, response::CONTINUE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_starts_listening() {
        let snep = SnepServer::new();
        assert_eq!(snep.state(), SnepState::Listening);
        assert!(snep.ndef().is_none());
        assert_eq!(snep.service().name(), Some(NAME_SNEP));
        assert_eq!(snep.service().sap(), crate::protocol::SAP_SNEP);
    }

    #[test]
    fn test_connection_count_drives_state() {
        let snep = SnepServer::new();
        snep.shared.connection_opened();
        assert_eq!(snep.state(), SnepState::Receiving);
        snep.shared.connection_opened();
        snep.shared.connection_closed();
        assert_eq!(snep.state(), SnepState::Receiving, "one connection left");
        snep.shared.connection_closed();
        assert_eq!(snep.state(), SnepState::Listening);
    }
}
