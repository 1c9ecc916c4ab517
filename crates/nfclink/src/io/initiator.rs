// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nfclink contributors

//! Initiator-role I/O adaptor
//!
//! In the Initiator role the local side drives the exchange: every transmit
//! is answered by exactly one frame from the peer, and silence must be
//! filled with SYMM PDUs so the peer keeps getting a chance to talk
//! (TS-LLCP 1.1 Section 5.3, symmetry procedure).

use std::time::{Duration, Instant};

use super::{LlcIo, MacChannel, SYMM_FRAME};

/// Default SYMM poll cadence while the link is quiet.
pub const DEFAULT_POLL_PERIOD_MS: u64 = 100;

/// Initiator-side [`LlcIo`] implementation over a [`MacChannel`].
///
/// The send window is open between a received reply and the next transmit.
/// The host wires the MAC receive path to [`reply_received`] and runs
/// [`poll`] on a timer (or immediately, when the engine reports
/// `IoPoll::ExpectMore`).
///
/// [`reply_received`]: InitiatorIo::reply_received
/// [`poll`]: InitiatorIo::poll
pub struct InitiatorIo<M: MacChannel> {
    mac: M,
    can_send: bool,
    error: bool,
    awaiting_reply: bool,
    poll_period: Duration,
    next_poll: Instant,
}

impl<M: MacChannel> InitiatorIo<M> {
    pub fn new(mac: M) -> Self {
        Self::with_poll_period(mac, Duration::from_millis(DEFAULT_POLL_PERIOD_MS))
    }

    pub fn with_poll_period(mac: M, poll_period: Duration) -> Self {
        Self {
            mac,
            can_send: false,
            error: false,
            awaiting_reply: false,
            poll_period,
            next_poll: Instant::now() + poll_period,
        }
    }

    /// Feed the peer's reply to the last transmitted frame.
    ///
    /// Opens the send window again and returns the LLCP payload to hand to
    /// the engine (may be empty when the peer answered with nothing but a
    /// MAC-level acknowledgement).
    pub fn reply_received(&mut self, frame: &[u8]) -> Vec<u8> {
        self.awaiting_reply = false;
        self.can_send = true;
        self.next_poll = Instant::now() + self.poll_period;
        frame.to_vec()
    }

    /// Latch a MAC failure reported by the host.
    pub fn mac_failed(&mut self) {
        self.error = true;
        self.can_send = false;
    }

    /// Whether the keep-alive poll is due.
    pub fn poll_due(&self, now: Instant) -> bool {
        self.can_send && !self.awaiting_reply && now >= self.next_poll
    }

    /// Send a SYMM to give the peer a transmit opportunity.
    ///
    /// Call when [`poll_due`] fires, or right after the engine returned
    /// `IoPoll::ExpectMore` to keep a busy exchange running without waiting
    /// out the poll period.
    ///
    /// [`poll_due`]: InitiatorIo::poll_due
    pub fn poll(&mut self) -> bool {
        if !self.can_send || self.error {
            return false;
        }
        log::debug!("< SYMM");
        self.send(&SYMM_FRAME)
    }
}

impl<M: MacChannel> LlcIo for InitiatorIo<M> {
    fn start(&mut self) -> bool {
        // The initiator owns the first transmit opportunity
        self.can_send = true;
        self.next_poll = Instant::now() + self.poll_period;
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
            self.awaiting_reply = true;
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

#[cfg(test)]
mod tests {
    use super::super::testutil::RecordingMac;
    use super::*;
    use std::rc::Rc;

    fn new_io() -> (InitiatorIo<RecordingMac>, Rc<std::cell::RefCell<Vec<Vec<u8>>>>) {
        let mac = RecordingMac::default();
        let frames = Rc::clone(&mac.frames);
        (InitiatorIo::new(mac), frames)
    }

    #[test]
    fn test_initiator_owns_first_window() {
        let (mut io, _) = new_io();
        assert!(!io.can_send(), "window closed before start");
        assert!(io.start());
        assert!(io.can_send());
    }

    #[test]
    fn test_window_closes_until_reply() {
        let (mut io, frames) = new_io();
        io.start();
        assert!(io.send(&[0x00, 0x00]));
        assert!(!io.can_send(), "one transmit per exchange");
        assert!(!io.send(&[0x00, 0x00]), "send without window fails");

        io.reply_received(&[0x00, 0x00]);
        assert!(io.can_send());
        assert_eq!(frames.borrow().len(), 1);
    }

    #[test]
    fn test_poll_sends_symm_when_due() {
        let (mut io, frames) = new_io();
        io.start();
        let later = Instant::now() + Duration::from_secs(1);
        assert!(io.poll_due(later));
        assert!(io.poll());
        assert_eq!(frames.borrow().last().unwrap(), &vec![0x00, 0x00]);
        assert!(!io.poll_due(later), "no poll while awaiting the reply");
    }

    #[test]
    fn test_transmit_failure_latches_error() {
        let mac = RecordingMac {
            fail: true,
            ..RecordingMac::default()
        };
        let mut io = InitiatorIo::new(mac);
        io.start();
        assert!(!io.send(&[0x00, 0x00]));
        assert!(io.error());
        assert!(!io.can_send());
    }
}
