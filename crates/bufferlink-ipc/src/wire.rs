//! Fixed-size binary frames exchanged between a renderer host and its clients.
//!
//! Every message on the stream socket is exactly one [`Frame`]: a 64-bit code
//! followed by a 24-byte payload area. Payloads are plain `#[repr(C)]` structs
//! copied into the payload area and zero-extended. Both peers run on the same
//! machine, so integers travel in native byte order.
//!
//! # Protocol Overview
//!
//! 1. **Handshake**: `PoolConstruction` → `PoolConstructionReply` on the
//!    client connection, then `RegisterPool` on the surface connection.
//! 2. **Buffers**: `BufferAllocation` + one descriptor (SCM_RIGHTS), later
//!    `BufferCommit` (+ one fence descriptor when flagged).
//! 3. **Recycling**: `ReleaseBuffer` and `FrameComplete` flow back to the client.

use std::mem;

use bytemuck::{Pod, Zeroable};

/// Total size of a frame on the wire.
pub const FRAME_SIZE: usize = 32;
/// Bytes available for a payload after the code.
pub const PAYLOAD_SIZE: usize = 24;

/// One message as it appears on the socket.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Frame {
    /// Message code, see [`codes`].
    pub code: u64,
    /// Payload bytes, zero padded.
    pub data: [u8; PAYLOAD_SIZE],
}

const _: () = assert!(Frame::size() == FRAME_SIZE);

impl Frame {
    /// Size of a frame in bytes
    pub const fn size() -> usize {
        mem::size_of::<Self>()
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_SIZE] {
        bytemuck::cast_ref(self)
    }

    pub fn from_bytes(bytes: &[u8; FRAME_SIZE]) -> Self {
        bytemuck::cast(*bytes)
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Message codes. Gaps are codes this protocol does not use.
pub mod codes {
    pub const POOL_CONSTRUCTION: u64 = 4;
    pub const POOL_CONSTRUCTION_REPLY: u64 = 5;
    pub const POOL_PURGE: u64 = 6;
    pub const REGISTER_POOL: u64 = 7;
    pub const UNREGISTER_POOL: u64 = 8;
    pub const BUFFER_ALLOCATION: u64 = 10;
    pub const BUFFER_COMMIT: u64 = 15;
    pub const RELEASE_BUFFER: u64 = 16;
    pub const FRAME_COMPLETE: u64 = 23;
}

/// A payload that can be written into and read out of a [`Frame`].
///
/// `from_frame` trusts the tag: callers switch on `frame.code` before decoding.
pub trait WirePayload: Pod {
    const CODE: u64;

    fn construct(frame: &mut Frame, payload: &Self) {
        let bytes = bytemuck::bytes_of(payload);
        frame.code = Self::CODE;
        frame.data = [0; PAYLOAD_SIZE];
        frame.data[..bytes.len()].copy_from_slice(bytes);
    }

    fn from_frame(frame: &Frame) -> Self {
        bytemuck::pod_read_unaligned(&frame.data[..mem::size_of::<Self>()])
    }
}

macro_rules! payload {
    ($(#[$meta:meta])* $name:ident = $code:expr, { $($field:ident),* $(,)? }) => {
        $(#[$meta])*
        #[repr(C)]
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
        pub struct $name {
            $(pub $field: u32,)*
        }

        const _: () = assert!(mem::size_of::<$name>() <= PAYLOAD_SIZE);

        impl WirePayload for $name {
            const CODE: u64 = $code;
        }
    };
}

payload!(
    /// Client asks the host to mint a new pool.
    PoolConstruction = codes::POOL_CONSTRUCTION, { reserved }
);
payload!(
    /// Host answer carrying the freshly minted pool id.
    PoolConstructionReply = codes::POOL_CONSTRUCTION_REPLY, { pool_id }
);
payload!(
    /// Drop every unlocked buffer of a pool.
    PoolPurge = codes::POOL_PURGE, { pool_id }
);
payload!(
    /// Sent on a surface connection: commits to this pool go to that surface.
    RegisterPool = codes::REGISTER_POOL, { pool_id }
);
payload!(
    UnregisterPool = codes::UNREGISTER_POOL, { pool_id }
);
payload!(
    /// Followed by exactly one buffer descriptor.
    BufferAllocation = codes::BUFFER_ALLOCATION, { pool_id, buffer_id }
);
payload!(
    /// Followed by one fence descriptor when `flags & COMMIT_HAS_FENCE`.
    BufferCommit = codes::BUFFER_COMMIT, { pool_id, buffer_id, flags }
);
payload!(
    ReleaseBuffer = codes::RELEASE_BUFFER, { pool_id, buffer_id }
);
payload!(
    FrameComplete = codes::FRAME_COMPLETE, { pool_id }
);

/// `BufferCommit::flags` bit: a fence descriptor follows the frame.
pub const COMMIT_HAS_FENCE: u32 = 1;
