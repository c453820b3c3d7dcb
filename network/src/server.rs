//! Single-client TCP echo server
//!
//! One socket slot, one fixed port, one client at a time. Every session ends
//! in a disconnect and close of the slot whatever happened, then the next
//! session starts over from CLOSED. Socket failures are never fatal.

use crate::drivers::{Protocol, Socket, SocketDriver, SocketFlags, SocketStatus};
use embedded_hal::delay::DelayNs;
use embedded_io::{Error, ErrorKind, Write};
use log::{debug, info, warn};

/// Bytes read from the socket per receive call
pub const RECV_CHUNK: usize = 100;

/// Lifecycle of the served socket slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Listening,
    Established,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The socket could not be opened
    OpenFailed,
    /// The socket was opened but would not listen
    ListenFailed,
    /// The socket left LISTEN without a connection
    NotEstablished,
    /// A client connected and the connection ended
    Closed,
}

/// Destination for received bytes. Bytes are passed on unchanged.
pub trait EchoSink {
    fn put(&mut self, byte: u8) -> Result<(), ErrorKind>;
}

impl<W: Write> EchoSink for W {
    fn put(&mut self, byte: u8) -> Result<(), ErrorKind> {
        self.write_all(&[byte]).map_err(|e| e.kind())
    }
}

/// Echo server bound to one socket slot
pub struct EchoServer<'a, D, T> {
    driver: &'a mut D,
    delay: T,
    socket: Socket,
    port: u16,
    greeting: &'a [u8],
    poll_ms: u32,
    state: ConnectionState,
}

impl<'a, D: SocketDriver, T: DelayNs> EchoServer<'a, D, T> {
    pub fn new(
        driver: &'a mut D,
        delay: T,
        socket: Socket,
        port: u16,
        greeting: &'a [u8],
        poll_ms: u32,
    ) -> Self {
        Self {
            driver,
            delay,
            socket,
            port,
            greeting,
            poll_ms,
            state: ConnectionState::Closed,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Serve clients forever
    pub fn serve<S: EchoSink>(&mut self, sink: &mut S) -> ! {
        info!("echo server on port {}", self.port);
        loop {
            let outcome = self.run_session(sink);
            debug!("session ended: {:?}", outcome);
        }
    }

    /// Run one open -> listen -> accept -> echo -> teardown cycle
    pub fn run_session<S: EchoSink>(&mut self, sink: &mut S) -> SessionOutcome {
        let outcome = self.session(sink);
        self.teardown();
        outcome
    }

    fn session<S: EchoSink>(&mut self, sink: &mut S) -> SessionOutcome {
        if let Err(e) = self
            .driver
            .open(self.socket, Protocol::Tcp, self.port, SocketFlags::NONE)
        {
            warn!("socket {} open failed: {}", self.socket.index(), e);
            return SessionOutcome::OpenFailed;
        }

        if let Err(e) = self.driver.listen(self.socket) {
            warn!("socket {} listen failed: {}", self.socket.index(), e);
            return SessionOutcome::ListenFailed;
        }
        self.state = ConnectionState::Listening;
        info!("listening on port {}", self.port);

        let status = self.wait_for_client();
        if status != Some(SocketStatus::Established) {
            warn!("connection not established: {:?}", status);
            return SessionOutcome::NotEstablished;
        }
        self.state = ConnectionState::Established;
        info!("client connected");

        if let Err(e) = self.driver.send(self.socket, self.greeting) {
            warn!("greeting not sent: {}", e);
        }

        self.echo(sink);
        info!("client disconnected");
        SessionOutcome::Closed
    }

    /// Poll until the socket leaves LISTEN. `None` if the status is unreadable.
    fn wait_for_client(&mut self) -> Option<SocketStatus> {
        loop {
            match self.driver.status(self.socket) {
                Ok(SocketStatus::Listen | SocketStatus::SynReceived) => {
                    self.delay.delay_ms(self.poll_ms)
                }
                Ok(status) => return Some(status),
                Err(e) => {
                    warn!("socket status unavailable: {}", e);
                    return None;
                }
            }
        }
    }

    fn echo<S: EchoSink>(&mut self, sink: &mut S) {
        let mut buf = [0u8; RECV_CHUNK];
        while let Ok(SocketStatus::Established) = self.driver.status(self.socket) {
            match self.driver.recv(self.socket, &mut buf) {
                Ok(len) => {
                    for &byte in &buf[..len] {
                        if let Err(e) = sink.put(byte) {
                            debug!("echo sink: {:?}", e);
                        }
                    }
                }
                Err(e) => debug!("recv: {}", e),
            }
        }
    }

    /// Disconnect and close the slot. Safe to call on a closed socket.
    pub fn teardown(&mut self) {
        if let Err(e) = self.driver.disconnect(self.socket) {
            warn!("socket {} disconnect failed: {}", self.socket.index(), e);
        }
        if let Err(e) = self.driver.close(self.socket) {
            warn!("socket {} close failed: {}", self.socket.index(), e);
        }
        self.state = ConnectionState::Closed;
    }
}
