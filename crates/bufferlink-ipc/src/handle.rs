//! Move-only owners for descriptors that cross the socket.
//!
//! A handle is freed when its owner drops it. Transfers never hand out the
//! owner's descriptor: [`NativeHandle::export`] makes an independent copy and
//! the transport consumes that copy.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// An opaque platform buffer (shared memory, dma-buf, hardware buffer).
#[derive(Debug)]
pub struct NativeHandle {
    fd: OwnedFd,
}

impl NativeHandle {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Duplicate for handing to the peer. The copy owns its own descriptor.
    pub fn export(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for NativeHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for NativeHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<OwnedFd> for NativeHandle {
    fn from(fd: OwnedFd) -> Self {
        Self::from_fd(fd)
    }
}

/// Synchronization fence signalled when rendering into a buffer finished.
#[derive(Debug)]
pub struct SyncFence {
    fd: OwnedFd,
}

impl SyncFence {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for SyncFence {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl From<OwnedFd> for SyncFence {
    fn from(fd: OwnedFd) -> Self {
        Self::from_fd(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    fn is_closed(probe: &UnixStream) -> bool {
        probe.set_nonblocking(true).unwrap();
        let mut byte = [0u8; 1];
        matches!((&*probe).read(&mut byte), Ok(0))
    }

    #[test]
    fn test_drop_frees_descriptor() {
        let (ours, probe) = UnixStream::pair().unwrap();
        let handle = NativeHandle::from_fd(ours.into());

        assert!(!is_closed(&probe));
        drop(handle);
        assert!(is_closed(&probe));
    }

    #[test]
    fn test_export_is_independent_copy() {
        let (ours, probe) = UnixStream::pair().unwrap();
        let handle = NativeHandle::from_fd(ours.into());
        let exported = handle.export().unwrap();

        assert_ne!(exported.as_raw_fd(), handle.as_raw_fd());
        drop(exported);
        assert!(!is_closed(&probe));
        drop(handle);
        assert!(is_closed(&probe));
    }
}
