// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nfclink contributors

//! # nfclink - NFC Forum LLCP 1.1 link layer and SNEP server
//!
//! A pure Rust implementation of the NFC peer-to-peer stack above NFC-DEP:
//! the Logical Link Control Protocol engine (TS-LLCP 1.1) with windowed
//! flow control, fragmentation, service discovery and the symmetric
//! exchange procedure, plus the default SNEP server (TS-SNEP 1.0).
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use nfclink::{InitiatorIo, Llc, MacChannel, PeerServices, SnepServer};
//!
//! struct Mac;
//! impl MacChannel for Mac {
//!     fn transmit(&mut self, frame: &[u8]) -> bool {
//!         // hand the frame to the NFC-DEP driver
//!         let _ = frame;
//!         true
//!     }
//! }
//!
//! let mut services = PeerServices::new();
//! let snep = SnepServer::new();
//! services.add(snep.service()).unwrap();
//!
//! let io = Rc::new(RefCell::new(InitiatorIo::new(Mac)));
//! let llc = Llc::new(io.clone(), services, &[]);
//!
//! snep.add_ndef_changed_handler(|| println!("got an NDEF"));
//!
//! // MAC glue: for each reply frame from the peer
//! let reply: Vec<u8> = vec![0x00, 0x00];
//! let payload = io.borrow_mut().reply_received(&reply);
//! llc.io_received(&payload);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     Application Layer                        |
//! |   PeerService handlers | PeerSocket | SNEP observers         |
//! +--------------------------------------------------------------+
//! |                        LLC Layer                             |
//! |   Engine (PDU dispatch, conn table, SDP) | PeerConnection    |
//! |   (windowing, fragmentation) | Service registry (SAPs)       |
//! +--------------------------------------------------------------+
//! |                        I/O Layer                             |
//! |   InitiatorIo (SYMM drive) | TargetIo (respond-to-poll)      |
//! +--------------------------------------------------------------+
//! |                   MAC (out of scope)                         |
//! |   NFC-DEP activation, raw frame exchange: MacChannel seam    |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Llc`] | The link engine: one per activated peer link |
//! | [`PeerServices`] | Per-link service registry and SAP allocator |
//! | [`PeerService`] | An application endpoint bound to a SAP |
//! | [`PeerConnection`] | A data link connection with windowed delivery |
//! | [`SnepServer`] | The default `urn:nfc:sn:snep` Put server |
//! | [`PeerSocket`] | Byte-stream adaptor over a connection (Unix only) |
//!
//! ## Concurrency model
//!
//! Single-threaded and cooperative: every state transition happens on the
//! event loop that drives the engine, PDU handlers run to completion, and
//! there are no locks. Hosts with several links run one engine per link.
//! Application observers fire after the engine turn that triggered them,
//! so they may freely call back into the API.
//!
//! ## See Also
//!
//! - NFCForum-TS-LLCP_1.1 (Logical Link Control Protocol)
//! - NFCForum-TS-SNEP_1.0 (Simple NDEF Exchange Protocol)

pub mod io;
pub mod llc;
pub mod ndef;
pub mod protocol;
pub mod snep;
#[cfg(unix)]
pub mod socket;

pub use io::{InitiatorIo, IoPoll, LlcIo, MacChannel, TargetIo};
pub use llc::{
    ConnState, ConnectResult, ConnectionCtx, ConnectionHandler, DefaultServiceHandler, HandlerId,
    Llc, LlcState, NopConnectionHandler, PeerConnection, PeerService, PeerServices, ServiceHandler,
};
pub use ndef::NdefData;
pub use snep::{SnepServer, SnepState};
#[cfg(unix)]
pub use socket::PeerSocket;

/// Crate-level error type.
#[derive(Debug)]
pub enum Error {
    /// The engine is in a terminal state and takes no new work.
    InvalidState,
    /// `urn:nfc:sn:sdp` is served by the engine and cannot be registered.
    ServiceNameReserved,
    /// Another service already carries this name.
    DuplicateServiceName,
    /// The SAP range for this kind of service is full.
    SapExhausted,
    /// The requested well-known SAP is already bound.
    SapInUse,
    /// The service declined to produce a connection.
    ConnectionRefused,
    /// OS-level failure (socketpair creation and friends).
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidState => write!(f, "Link is in a terminal state"),
            Error::ServiceNameReserved => write!(f, "Service name is reserved"),
            Error::DuplicateServiceName => write!(f, "Duplicate service name"),
            Error::SapExhausted => write!(f, "No free SAP in the allocation range"),
            Error::SapInUse => write!(f, "SAP is already bound"),
            Error::ConnectionRefused => write!(f, "Service refused the connection"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Convenient alias for API results using the public [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
