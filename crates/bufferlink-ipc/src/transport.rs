//! Socket endpoints for the buffer protocol.
//!
//! Both ends speak fixed 32-byte frames over a connected `AF_UNIX` stream
//! socket. Descriptors travel out of band (SCM_RIGHTS) attached to a single
//! dummy byte, one descriptor per message, directly after the frame that
//! announces them.
//!
//! * [`Host`] creates the socket pair and hands the peer end to a client.
//! * [`Client`] adopts a descriptor received from elsewhere.
//!
//! Sockets are non-blocking and registered with an [`EventLoop`]. Operations
//! that must block (descriptor receive, the pool handshake, writes into a full
//! socket buffer) wait on the socket with `poll(2)` outside the event loop.

use std::cell::Cell;
use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use mio::Token;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, recvmsg,
    send, sendmsg, socketpair,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::event_loop::EventLoop;
use crate::wire::{FRAME_SIZE, Frame};
use crate::Message;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("endpoint is not initialized")]
    NotInitialized,

    #[error("connection closed by peer")]
    Closed,

    #[error("message carried no descriptor")]
    MissingDescriptor,

    #[error("socket error: {0}")]
    Os(#[from] Errno),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result of draining an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Everything readable was delivered; more may arrive later.
    Open,
    /// The peer went away or the stream lost frame alignment. Nothing more
    /// will be delivered.
    Closed,
}

// ============================================================================
// Connection
// ============================================================================

enum ReadOutcome {
    Frame(Frame),
    WouldBlock,
    Closed,
}

/// Bytes of a frame whose remainder has not arrived yet
#[derive(Clone, Copy, Default)]
struct PartialFrame {
    bytes: [u8; FRAME_SIZE],
    filled: usize,
}

/// One registered, non-blocking stream socket
struct Connection {
    stream: UnixStream,
    token: Token,
    partial: Cell<PartialFrame>,
    /// A descriptor went missing, so frame boundaries can no longer be trusted.
    broken: Cell<bool>,
}

impl Connection {
    fn adopt(fd: OwnedFd, event_loop: &mut EventLoop) -> Result<Self, TransportError> {
        let stream = UnixStream::from(fd);
        stream.set_nonblocking(true)?;
        let token = event_loop.next_token();
        event_loop.register(stream.as_raw_fd(), token)?;
        Ok(Self {
            stream,
            token,
            partial: Cell::new(PartialFrame::default()),
            broken: Cell::new(false),
        })
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn wait(&self, flags: PollFlags) -> Result<(), TransportError> {
        let mut fds = [PollFd::new(self.stream.as_fd(), flags)];
        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn write_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame.as_bytes();
        let mut sent = 0;
        // A full socket buffer waits instead of failing so frames never split.
        while sent < bytes.len() {
            match send(self.raw_fd(), &bytes[sent..], MsgFlags::MSG_NOSIGNAL) {
                Ok(n) => sent += n,
                Err(Errno::EINTR) => {}
                Err(Errno::EAGAIN) => self.wait(PollFlags::POLLOUT)?,
                Err(Errno::EPIPE | Errno::ECONNRESET) => return Err(TransportError::Closed),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Read one frame without blocking.
    ///
    /// A frame that is only partly readable is kept and completed by a later
    /// call, so a stalled peer never holds up the event loop.
    fn read_frame(&self) -> Result<ReadOutcome, TransportError> {
        if self.broken.get() {
            return Ok(ReadOutcome::Closed);
        }
        let mut partial = self.partial.take();
        while partial.filled < FRAME_SIZE {
            match (&self.stream).read(&mut partial.bytes[partial.filled..]) {
                Ok(0) => {
                    if partial.filled > 0 {
                        debug!(
                            "Peer closed token {:?} after {} bytes of a frame",
                            self.token, partial.filled
                        );
                    }
                    return Ok(ReadOutcome::Closed);
                }
                Ok(n) => partial.filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.partial.set(partial);
                    return Ok(ReadOutcome::WouldBlock);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(ReadOutcome::Frame(Frame::from_bytes(&partial.bytes)))
    }

    fn send_fd(&self, fd: BorrowedFd<'_>) -> Result<(), TransportError> {
        let fds = [fd.as_raw_fd()];
        let dummy = [0u8; 1];
        let iov = [IoSlice::new(&dummy)];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        loop {
            match sendmsg::<()>(self.raw_fd(), &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => self.wait(PollFlags::POLLOUT)?,
                Err(Errno::EPIPE | Errno::ECONNRESET) => return Err(TransportError::Closed),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn receive_fd(&self) -> Result<OwnedFd, TransportError> {
        if self.broken.get() {
            return Err(TransportError::Closed);
        }
        loop {
            let mut dummy = [0u8; 1];
            let mut iov = [IoSliceMut::new(&mut dummy)];
            let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

            let msg = match recvmsg::<()>(
                self.raw_fd(),
                &mut iov,
                Some(cmsg_buffer.as_mut_slice()),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => msg,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    // The frame announcing the descriptor can be readable before
                    // the descriptor itself.
                    self.wait(PollFlags::POLLIN)?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if msg.bytes == 0 {
                self.broken.set(true);
                return Err(TransportError::Closed);
            }
            if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
                warn!("Ancillary data truncated while receiving a descriptor");
            }

            let mut received = None;
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    for fd in fds {
                        // SAFETY: the kernel just installed this descriptor for us
                        // and nothing else refers to it.
                        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                        if received.is_none() {
                            received = Some(owned);
                        } else {
                            warn!("Dropping extra descriptor {} attached to one message", fd);
                        }
                    }
                }
            }
            // The dummy byte we consumed belonged to the next frame.
            return received.ok_or_else(|| {
                self.broken.set(true);
                TransportError::MissingDescriptor
            });
        }
    }
}

/// Read whole frames until the socket would block.
fn drain<E>(
    endpoint: &E,
    connection: &Connection,
    handler: &mut impl FnMut(&E, Frame),
) -> DispatchStatus {
    loop {
        match connection.read_frame() {
            Ok(ReadOutcome::Frame(frame)) => handler(endpoint, frame),
            Ok(ReadOutcome::WouldBlock) => return DispatchStatus::Open,
            Ok(ReadOutcome::Closed) => {
                debug!("Peer closed connection on token {:?}", connection.token);
                return DispatchStatus::Closed;
            }
            Err(err) => {
                warn!("Read failed on token {:?}: {}", connection.token, err);
                return DispatchStatus::Closed;
            }
        }
    }
}

// ============================================================================
// Host endpoint
// ============================================================================

/// Endpoint that owns both ends of a fresh socket pair.
///
/// The local end is registered with the event loop; the peer end is handed
/// to the process that will run the matching [`Client`].
#[derive(Default)]
pub struct Host {
    connection: Option<Connection>,
    peer: Option<OwnedFd>,
    closed: bool,
}

impl Host {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the socket pair and start watching the local end.
    ///
    /// On failure the endpoint stays uninitialized: sends are dropped and
    /// dispatch delivers nothing.
    pub fn initialize(&mut self, event_loop: &mut EventLoop) -> Result<(), TransportError> {
        let (local, peer) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        let connection = Connection::adopt(local, event_loop)?;
        debug!(
            "Host endpoint ready: local={} peer={} token={:?}",
            connection.raw_fd(),
            peer.as_raw_fd(),
            connection.token
        );
        self.connection = Some(connection);
        self.peer = Some(peer);
        self.closed = false;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.connection.is_some()
    }

    pub fn token(&self) -> Option<Token> {
        self.connection.as_ref().map(|c| c.token)
    }

    /// Duplicate the peer end for handoff, optionally closing our copy of it.
    pub fn release_client_fd(&mut self, close_local: bool) -> Option<OwnedFd> {
        let duplicate = match self.peer.as_ref()?.try_clone() {
            Ok(fd) => fd,
            Err(err) => {
                warn!("Failed to duplicate client descriptor: {}", err);
                return None;
            }
        };
        if close_local {
            self.peer = None;
        }
        Some(duplicate)
    }

    /// Send a frame; failures are logged and dropped.
    pub fn send_message(&self, message: &Message) {
        let Some(connection) = self.live_connection() else {
            debug!("Dropping {:?}: endpoint not connected", message);
            return;
        };
        if let Err(err) = connection.write_frame(&message.encode()) {
            warn!("Failed to send {:?}: {}", message, err);
        }
    }

    /// Receive the descriptor that follows the frame being handled.
    pub fn receive_fd(&self) -> Result<OwnedFd, TransportError> {
        self.live_connection()
            .ok_or(TransportError::NotInitialized)?
            .receive_fd()
    }

    /// Deliver every complete frame currently readable to `handler`.
    pub fn dispatch(&mut self, mut handler: impl FnMut(&Self, Frame)) -> DispatchStatus {
        if self.closed {
            return DispatchStatus::Closed;
        }
        let Some(connection) = self.connection.as_ref() else {
            return DispatchStatus::Open;
        };
        let status = drain(&*self, connection, &mut handler);
        if status == DispatchStatus::Closed {
            self.closed = true;
        }
        status
    }

    /// Stop watching and close every descriptor still held. Idempotent.
    pub fn deinitialize(&mut self, event_loop: &EventLoop) {
        if let Some(connection) = self.connection.take() {
            if let Err(err) = event_loop.deregister(connection.raw_fd()) {
                debug!("Deregistering token {:?} failed: {}", connection.token, err);
            }
        }
        self.peer = None;
    }

    fn live_connection(&self) -> Option<&Connection> {
        if self.closed {
            return None;
        }
        self.connection.as_ref()
    }
}

// ============================================================================
// Client endpoint
// ============================================================================

/// Endpoint built around a descriptor handed over by a [`Host`].
#[derive(Default)]
pub struct Client {
    connection: Option<Connection>,
    closed: bool,
    backlog: VecDeque<Frame>,
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt `fd` and start watching it.
    pub fn initialize(
        &mut self,
        event_loop: &mut EventLoop,
        fd: OwnedFd,
    ) -> Result<(), TransportError> {
        let connection = Connection::adopt(fd, event_loop)?;
        debug!(
            "Client endpoint ready: fd={} token={:?}",
            connection.raw_fd(),
            connection.token
        );
        self.connection = Some(connection);
        self.closed = false;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.connection.is_some()
    }

    pub fn token(&self) -> Option<Token> {
        self.connection.as_ref().map(|c| c.token)
    }

    /// Send a frame; failures are logged and dropped.
    pub fn send_message(&self, message: &Message) {
        let Some(connection) = self.live_connection() else {
            debug!("Dropping {:?}: endpoint not connected", message);
            return;
        };
        if let Err(err) = connection.write_frame(&message.encode()) {
            warn!("Failed to send {:?}: {}", message, err);
        }
    }

    /// Send `message` and block until a frame with `reply_code` arrives.
    ///
    /// This bypasses the event loop. It is only sound for the pool handshake:
    /// if the peer never answers with `reply_code` the caller blocks forever.
    /// Other frames read while waiting are kept and delivered, in order, by
    /// the next [`Client::dispatch`].
    pub fn send_and_receive(
        &mut self,
        message: &Message,
        reply_code: u64,
    ) -> Result<Frame, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let Some(connection) = self.connection.as_ref() else {
            return Err(TransportError::NotInitialized);
        };
        connection.write_frame(&message.encode())?;

        loop {
            match connection.read_frame() {
                Ok(ReadOutcome::Frame(frame)) if frame.code == reply_code => return Ok(frame),
                Ok(ReadOutcome::Frame(frame)) => {
                    debug!("Deferring frame code {} until next dispatch", frame.code);
                    self.backlog.push_back(frame);
                }
                Ok(ReadOutcome::WouldBlock) => connection.wait(PollFlags::POLLIN)?,
                Ok(ReadOutcome::Closed) => {
                    self.closed = true;
                    return Err(TransportError::Closed);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Send one descriptor. The caller keeps its own copy; pass an exported one.
    pub fn send_fd(&self, fd: impl AsFd) -> Result<(), TransportError> {
        self.live_connection()
            .ok_or(TransportError::NotInitialized)?
            .send_fd(fd.as_fd())
    }

    /// Frames read by [`Client::send_and_receive`] that still wait for dispatch.
    pub fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }

    /// Deliver queued frames, then every complete frame currently readable.
    pub fn dispatch(&mut self, mut handler: impl FnMut(&Self, Frame)) -> DispatchStatus {
        while let Some(frame) = self.backlog.pop_front() {
            handler(&*self, frame);
        }
        if self.closed {
            return DispatchStatus::Closed;
        }
        let Some(connection) = self.connection.as_ref() else {
            return DispatchStatus::Open;
        };
        let status = drain(&*self, connection, &mut handler);
        if status == DispatchStatus::Closed {
            self.closed = true;
        }
        status
    }

    /// Stop watching and close the socket. Idempotent.
    pub fn deinitialize(&mut self, event_loop: &EventLoop) {
        if let Some(connection) = self.connection.take() {
            if let Err(err) = event_loop.deregister(connection.raw_fd()) {
                debug!("Deregistering token {:?} failed: {}", connection.token, err);
            }
        }
        self.backlog.clear();
    }

    fn live_connection(&self) -> Option<&Connection> {
        if self.closed {
            return None;
        }
        self.connection.as_ref()
    }
}
