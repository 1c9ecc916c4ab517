// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nfclink contributors

//! Byte-stream socket over a peer connection
//!
//! Bridges a frame-oriented [`PeerConnection`] to a plain byte channel: an
//! `AF_UNIX` stream socketpair whose far end is handed to the application
//! (or another process) while the near end feeds the connection.
//!
//! Inbound I PDU payloads are written to the socket; outbound bytes are
//! pulled off it in RMIU-sized chunks and queued on the connection. Reading
//! pauses while more than [`max_send_queue`] bytes sit unsent; flow control
//! towards the peer still comes from the LLCP receive window, the queue cap
//! only bounds local buffering. Closing either side disconnects.
//!
//! The near end is nonblocking; the host's event loop calls
//! [`process_readable`] / [`process_writable`] when it polls the
//! application endpoint's sibling as ready.
//!
//! [`max_send_queue`]: PeerSocket::max_send_queue
//! [`process_readable`]: PeerSocket::process_readable
//! [`process_writable`]: PeerSocket::process_writable

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use socket2::{Domain, Socket, Type};

use crate::llc::connection::{
    ConnState, ConnectResult, ConnectionCtx, ConnectionHandler, PeerConnection,
};
use crate::llc::engine::Llc;
use crate::llc::service::PeerService;
use crate::{Error, Result};

/// Stop pulling from the socket while this many bytes are queued unsent.
/// The limit can be exceeded by at most one MIU; no need to be strict.
pub const DEFAULT_MAX_SEND_QUEUE: usize = 128 * 1024;

struct SocketShared {
    sock: UnixStream,
    app_end: RefCell<Option<UnixStream>>,
    write_queue: RefCell<VecDeque<Vec<u8>>>,
    write_pos: Cell<usize>,
    max_send_queue: Cell<usize>,
    conn: RefCell<Option<PeerConnection>>,
    shut: Cell<bool>,
}

impl SocketShared {
    fn shutdown(&self) {
        if !self.shut.replace(true) {
            let _ = self.sock.shutdown(Shutdown::Both);
        }
    }

    /// Pull socket bytes onto the connection until the socket runs dry, the
    /// send queue cap is reached, or the connection stops taking data.
    fn pull(&self, ctx: &mut ConnectionCtx<'_>) {
        if self.shut.get() {
            return;
        }
        loop {
            let conn = ctx.connection();
            if conn.state() > ConnState::Active
                || conn.bytes_queued() > self.max_send_queue.get()
            {
                break;
            }
            let rmiu = ctx.rmiu() as usize;
            let mut buf = vec![0u8; rmiu];
            match (&self.sock).read(&mut buf) {
                Ok(0) => {
                    log::debug!("Connection {}:{} hung up", conn.sap(), conn.rsap());
                    self.shutdown();
                    ctx.disconnect();
                    break;
                }
                Ok(n) => {
                    buf.truncate(n);
                    if !ctx.send(&buf) {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!(
                        "Connection {}:{} read failed: {}",
                        conn.sap(),
                        conn.rsap(),
                        e
                    );
                    self.shutdown();
                    ctx.disconnect();
                    break;
                }
            }
        }
    }

    /// Flush queued inbound payloads into the socket. Returns `false` on a
    /// write error (the socket is shut down by then).
    fn flush_writes(&self) -> bool {
        if self.shut.get() {
            return false;
        }
        loop {
            let mut queue = self.write_queue.borrow_mut();
            let Some(front) = queue.front() else {
                return true;
            };
            let pos = self.write_pos.get();
            match (&self.sock).write(&front[pos..]) {
                Ok(n) => {
                    if pos + n < front.len() {
                        self.write_pos.set(pos + n);
                        return true; // wait for the next writable edge
                    }
                    self.write_pos.set(0);
                    queue.pop_front();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) => {
                    log::warn!("Socket write failed: {}", e);
                    drop(queue);
                    self.shutdown();
                    return false;
                }
            }
        }
    }
}

struct SocketHandler {
    shared: Rc<SocketShared>,
}

impl ConnectionHandler for SocketHandler {
    fn state_changed(&mut self, conn: &mut ConnectionCtx<'_>) {
        if self.shared.conn.borrow().is_none() {
            *self.shared.conn.borrow_mut() = Some(conn.connection());
        }
        match conn.state() {
            ConnState::Active => self.shared.pull(conn),
            ConnState::Dead => self.shared.shutdown(),
            _ => {}
        }
    }

    fn data_received(&mut self, conn: &mut ConnectionCtx<'_>, data: &[u8]) {
        let _ = conn;
        if data.is_empty() || self.shared.shut.get() {
            return;
        }
        self.shared
            .write_queue
            .borrow_mut()
            .push_back(data.to_vec());
        self.shared.flush_writes();
    }

    fn data_dequeued(&mut self, conn: &mut ConnectionCtx<'_>) {
        self.shared.pull(conn);
    }
}

/// Byte-stream adaptor over one peer connection.
pub struct PeerSocket {
    shared: Rc<SocketShared>,
}

impl PeerSocket {
    /// Connect to a fixed remote SAP, bridging the connection to a fresh
    /// socketpair.
    pub fn connect(
        llc: &Llc,
        service: &PeerService,
        rsap: u8,
        complete: impl FnOnce(&PeerConnection, ConnectResult) + 'static,
    ) -> Result<PeerSocket> {
        let (shared, handler) = Self::create()?;
        let conn = llc.connect_with_handler(service, rsap, handler, complete)?;
        *shared.conn.borrow_mut() = Some(conn);
        Ok(PeerSocket { shared })
    }

    /// Connect by service name, bridging to a fresh socketpair.
    pub fn connect_sn(
        llc: &Llc,
        service: &PeerService,
        sn: &str,
        complete: impl FnOnce(&PeerConnection, ConnectResult) + 'static,
    ) -> Result<PeerSocket> {
        let (shared, handler) = Self::create()?;
        let conn = llc.connect_sn_with_handler(service, sn, handler, complete)?;
        *shared.conn.borrow_mut() = Some(conn);
        Ok(PeerSocket { shared })
    }

    /// Build the socket side of an accepted connection. Use from a
    /// service's `new_accept`: hand the returned handler to the engine and
    /// keep the `PeerSocket`.
    pub fn accept() -> Result<(PeerSocket, Box<dyn ConnectionHandler>)> {
        let (shared, handler) = Self::create()?;
        Ok((PeerSocket { shared }, handler))
    }

    fn create() -> Result<(Rc<SocketShared>, Box<dyn ConnectionHandler>)> {
        // Create with socket2 (room for option tweaks), hand out std types
        let (app, near) = Socket::pair(Domain::UNIX, Type::STREAM, None).map_err(Error::Io)?;
        near.set_nonblocking(true).map_err(Error::Io)?;
        let app: UnixStream = app.into();
        let near: UnixStream = near.into();
        let shared = Rc::new(SocketShared {
            sock: near,
            app_end: RefCell::new(Some(app)),
            write_queue: RefCell::new(VecDeque::new()),
            write_pos: Cell::new(0),
            max_send_queue: Cell::new(DEFAULT_MAX_SEND_QUEUE),
            conn: RefCell::new(None),
            shut: Cell::new(false),
        });
        let handler = Box::new(SocketHandler {
            shared: Rc::clone(&shared),
        });
        Ok((shared, handler))
    }

    /// Take the application-side endpoint of the socketpair. Yields once.
    pub fn take_endpoint(&self) -> Option<UnixStream> {
        self.shared.app_end.borrow_mut().take()
    }

    /// The bridged connection, once the engine created it.
    pub fn connection(&self) -> Option<PeerConnection> {
        self.shared.conn.borrow().clone()
    }

    pub fn max_send_queue(&self) -> usize {
        self.shared.max_send_queue.get()
    }

    /// Adjust the local buffering cap and re-check the read gate.
    pub fn set_max_send_queue(&self, limit: usize) {
        if self.shared.max_send_queue.replace(limit) != limit {
            self.process_readable();
        }
    }

    /// The near end became readable: move bytes to the connection. Returns
    /// `false` when reading stopped for good (closed or disconnected).
    pub fn process_readable(&self) -> bool {
        let Some(conn) = self.connection() else {
            return false;
        };
        if self.shared.shut.get() {
            return false;
        }
        loop {
            if conn.state() > ConnState::Active
                || conn.bytes_queued() > self.shared.max_send_queue.get()
            {
                // Backpressured, not closed: the engine's dequeue hook
                // resumes the pull
                return true;
            }
            let mut buf = vec![0u8; conn.rmiu() as usize];
            match (&self.shared.sock).read(&mut buf) {
                Ok(0) => {
                    log::debug!("Connection {}:{} hung up", conn.sap(), conn.rsap());
                    self.shared.shutdown();
                    conn.disconnect();
                    return false;
                }
                Ok(n) => {
                    buf.truncate(n);
                    if !conn.send(&buf) {
                        return false;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) => {
                    log::debug!(
                        "Connection {}:{} read failed: {}",
                        conn.sap(),
                        conn.rsap(),
                        e
                    );
                    self.shared.shutdown();
                    conn.disconnect();
                    return false;
                }
            }
        }
    }

    /// The near end became writable: flush buffered inbound payloads.
    pub fn process_writable(&self) -> bool {
        if !self.shared.flush_writes() {
            if let Some(conn) = self.connection() {
                conn.disconnect();
            }
            return false;
        }
        true
    }

    /// Close the byte channel and disconnect the bridged connection.
    pub fn close(&self) {
        self.shared.shutdown();
        if let Some(conn) = self.connection() {
            conn.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socketpair_round_trip() {
        let (sock, _handler) = PeerSocket::accept().unwrap();
        let app = sock.take_endpoint().unwrap();
        assert!(sock.take_endpoint().is_none(), "endpoint yields once");

        // App writes; the near end reads it nonblocking
        (&app).write_all(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = (&sock.shared.sock).read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_flush_writes_reaches_app_end() {
        let (sock, _handler) = PeerSocket::accept().unwrap();
        let app = sock.take_endpoint().unwrap();

        sock.shared
            .write_queue
            .borrow_mut()
            .push_back(b"payload".to_vec());
        assert!(sock.shared.flush_writes());

        let mut buf = [0u8; 16];
        let n = (&app).read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
    }

    #[test]
    fn test_close_is_idempotent() {
        let (sock, _handler) = PeerSocket::accept().unwrap();
        sock.close();
        sock.close();
        assert!(!sock.process_readable());
    }

    #[test]
    fn test_default_queue_cap() {
        let (sock, _handler) = PeerSocket::accept().unwrap();
        assert_eq!(sock.max_send_queue(), DEFAULT_MAX_SEND_QUEUE);
        sock.set_max_send_queue(4096);
        assert_eq!(sock.max_send_queue(), 4096);
    }
}
