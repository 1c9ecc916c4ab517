// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nfclink contributors

//! Target-role I/O adaptor
//!
//! The Target never transmits unsolicited: each inbound frame from the
//! Initiator opens exactly one response window. When the engine leaves the
//! window unused the adaptor closes the turn with a SYMM of its own, keeping
//! the symmetry procedure alive from the passive side.

use super::{LlcIo, MacChannel, SYMM_FRAME};

/// Target-side [`LlcIo`] implementation over a [`MacChannel`].
///
/// The host wires the MAC receive path to [`poll_received`] and calls
/// [`end_turn`] after the engine has run, so an unused response window is
/// answered with SYMM.
///
/// [`poll_received`]: TargetIo::poll_received
/// [`end_turn`]: TargetIo::end_turn
pub struct TargetIo<M: MacChannel> {
    mac: M,
    can_send: bool,
    error: bool,
    responded: bool,
}

impl<M: MacChannel> TargetIo<M> {
    pub fn new(mac: M) -> Self {
        Self {
            mac,
            can_send: false,
            error: false,
            responded: false,
        }
    }

    /// Feed one frame received from the Initiator.
    ///
    /// Opens the response window and returns the LLCP payload to hand to
    /// the engine.
    pub fn poll_received(&mut self, frame: &[u8]) -> Vec<u8> {
        self.can_send = true;
        self.responded = false;
        frame.to_vec()
    }

    /// Latch a MAC failure reported by the host.
    pub fn mac_failed(&mut self) {
        self.error = true;
        self.can_send = false;
    }

    /// Close the current turn.
    ///
    /// If the engine did not use the response window, answer the poll with
    /// SYMM so the Initiator is not left waiting.
    pub fn end_turn(&mut self) -> bool {
        if self.can_send && !self.responded && !self.error {
            log::debug!("< SYMM");
            return self.send(&SYMM_FRAME);
        }
        true
    }
}

impl<M: MacChannel> LlcIo for TargetIo<M> {
    fn start(&mut self) -> bool {
        // Wait for the first poll from the Initiator
        self.can_send = false;
        !self.error
    }

    fn can_send(&self) -> bool {
        self.can_send && !self.error
    }

    fn send(&mut self, pdu: &[u8]) -> bool {
        if !self.can_send || self.error {
            return false;
        }
        if self.mac.transmit(pdu) {
            self.can_send = false;
            self.responded = true;
            true
        } else {
            log::warn!("MAC transmit failed");
            self.error = true;
            self.can_send = false;
            false
        }
    }

    fn error(&self) -> bool {
        self.error
    }
}
