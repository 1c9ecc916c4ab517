// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nfclink contributors

//! Peer services
//!
//! A service is the application endpoint a SAP points at: it decides whether
//! incoming connections are accepted, supplies the connection handler for
//! outgoing ones, and receives connectionless (UI) datagrams.
//!
//! Services are shared between the application and the engine; the engine is
//! the only party that assigns the SAP. A service keeps weak back-references
//! to its live connections so the ownership graph stays acyclic.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::llc::connection::{ConnShared, ConnectionHandler, NopConnectionHandler, PeerConnection};
use crate::protocol::{NAME_SNEP, SAP_SNEP};

/// Capability vtable of a peer service.
///
/// All hooks run synchronously on the engine's event loop. The defaults make
/// a plain outbound-only service: outgoing connections get a no-op handler,
/// incoming connection requests are refused (the engine answers DM\[REJECT\]),
/// datagrams are dropped.
pub trait ServiceHandler {
    /// Produce the connection handler for a locally initiated connect.
    /// Returning `None` fails the connect call.
    fn new_connect(
        &mut self,
        service: &PeerService,
        rsap: u8,
        name: Option<&str>,
    ) -> Option<Box<dyn ConnectionHandler>> {
        let _ = (service, rsap, name);
        Some(Box::new(NopConnectionHandler))
    }

    /// Produce the connection handler for a remote connection request.
    /// Returning `None` makes the engine answer DM\[REJECT\].
    fn new_accept(&mut self, service: &PeerService, rsap: u8) -> Option<Box<dyn ConnectionHandler>> {
        let _ = (service, rsap);
        None
    }

    /// A peer link carrying this service registry came up.
    fn peer_arrived(&mut self) {}

    /// The peer link went away.
    fn peer_left(&mut self) {}

    /// Connectionless (UI PDU) datagram addressed to this service.
    fn datagram_received(&mut self, ssap: u8, data: &[u8]) {
        let _ = (ssap, data);
    }
}

/// The all-defaults [`ServiceHandler`].
pub struct DefaultServiceHandler;

impl ServiceHandler for DefaultServiceHandler {}

pub(crate) struct ServiceShared {
    pub(crate) name: Option<String>,
    pub(crate) sap: Cell<u8>,
    pub(crate) handler: RefCell<Box<dyn ServiceHandler>>,
    pub(crate) conns: RefCell<Vec<Weak<ConnShared>>>,
}

/// Application handle to a peer service. Cheap to clone; identity is the
/// underlying allocation, not the name.
#[derive(Clone)]
pub struct PeerService {
    pub(crate) shared: Rc<ServiceShared>,
}

impl PeerService {
    /// Create a service with the given well-known name (or `None` for an
    /// unnamed, dynamically addressed one) and its capability handler.
    ///
    /// `urn:nfc:sn:snep` presets SAP 4; every other SAP is assigned at
    /// registration time.
    pub fn new(name: Option<&str>, handler: Box<dyn ServiceHandler>) -> PeerService {
        let sap = if name == Some(NAME_SNEP) { SAP_SNEP } else { 0 };
        PeerService {
            shared: Rc::new(ServiceShared {
                name: name.map(str::to_owned),
                sap: Cell::new(sap),
                handler: RefCell::new(handler),
                conns: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    /// Assigned SAP; zero until registered (except for preset well-known
    /// names).
    pub fn sap(&self) -> u8 {
        self.shared.sap.get()
    }

    /// Disconnect every live connection of this service.
    pub fn disconnect_all(&self) {
        let handles: Vec<PeerConnection> = self
            .shared
            .conns
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|shared| PeerConnection { shared })
            .collect();
        for conn in handles {
            conn.disconnect();
        }
    }

    pub(crate) fn same(&self, other: &PeerService) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn connection_created(&self, conn: &Rc<ConnShared>) {
        self.shared.conns.borrow_mut().push(Rc::downgrade(conn));
    }

    pub(crate) fn connection_dead(&self, conn: &Rc<ConnShared>) {
        self.shared
            .conns
            .borrow_mut()
            .retain(|w| w.upgrade().is_some_and(|c| !Rc::ptr_eq(&c, conn)));
    }

    pub(crate) fn new_connect_handler(
        &self,
        rsap: u8,
        name: Option<&str>,
    ) -> Option<Box<dyn ConnectionHandler>> {
        self.shared.handler.borrow_mut().new_connect(self, rsap, name)
    }

    pub(crate) fn new_accept_handler(&self, rsap: u8) -> Option<Box<dyn ConnectionHandler>> {
        self.shared.handler.borrow_mut().new_accept(self, rsap)
    }

    pub(crate) fn datagram_received(&self, ssap: u8, data: &[u8]) {
        self.shared.handler.borrow_mut().datagram_received(ssap, data);
    }

    pub(crate) fn peer_arrived(&self) {
        self.shared.handler.borrow_mut().peer_arrived();
    }

    pub(crate) fn peer_left(&self) {
        self.shared.handler.borrow_mut().peer_left();
    }
}
