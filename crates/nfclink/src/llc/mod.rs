// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nfclink contributors

//! Logical Link Control: engine, connections, services
//!
//! - [`engine`] - PDU dispatch, connection table, link state machine
//! - [`connection`] - per-connection state machine and windowed send queue
//! - [`service`] - service endpoints and their capability handlers
//! - [`services`] - per-link service registry and SAP allocator

pub mod connection;
pub mod engine;
pub mod service;
pub mod services;

pub use connection::{
    ConnState, ConnectResult, ConnectionCtx, ConnectionHandler, NopConnectionHandler,
    PeerConnection,
};
pub use engine::{HandlerId, Llc, LlcState};
pub use service::{DefaultServiceHandler, PeerService, ServiceHandler};
pub use services::PeerServices;
