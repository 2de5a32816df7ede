//! Bufferlink IPC Protocol
//!
//! Shared message types and transport endpoints used by the renderer host
//! (`bufferlink-host`) and its producers (`bufferlink-client`).

pub mod event_loop;
pub mod handle;
pub mod transport;
pub mod wire;

pub use event_loop::EventLoop;
pub use handle::{NativeHandle, SyncFence};
pub use transport::{Client, DispatchStatus, Host, TransportError};
pub use wire::{FRAME_SIZE, Frame, WirePayload};

use thiserror::Error;

/// Identifier of a buffer pool, minted by the host.
pub type PoolId = u32;
/// Slot index of a buffer inside its pool.
pub type BufferId = u32;

/// Number of buffer slots in every pool.
pub const POOL_DEPTH: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown message code {0}")]
    UnknownCode(u64),
}

// ============================================================================
// Messages
// ============================================================================

/// Every message understood by either side of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Client → host: mint a new pool (reply expected)
    PoolConstruction,

    /// Host → client: answer to `PoolConstruction`
    PoolConstructionReply { pool_id: PoolId },

    /// Client → host: drop the unlocked buffers of a pool
    PoolPurge { pool_id: PoolId },

    /// Client → surface: route commits for this pool to the surface
    RegisterPool { pool_id: PoolId },

    /// Client → surface: stop routing, the pool is gone
    UnregisterPool { pool_id: PoolId },

    /// Client → host: a buffer handle for this slot follows
    BufferAllocation { pool_id: PoolId, buffer_id: BufferId },

    /// Client → host: the slot holds a rendered frame, optionally with a fence
    BufferCommit {
        pool_id: PoolId,
        buffer_id: BufferId,
        has_fence: bool,
    },

    /// Host → client: the slot may be rendered into again
    ReleaseBuffer { pool_id: PoolId, buffer_id: BufferId },

    /// Host → client: the last frame of this pool reached the screen
    FrameComplete { pool_id: PoolId },
}

impl Message {
    pub fn encode(&self) -> Frame {
        let mut frame = Frame::default();
        match *self {
            Message::PoolConstruction => {
                WirePayload::construct(&mut frame, &wire::PoolConstruction::default())
            }
            Message::PoolConstructionReply { pool_id } => {
                WirePayload::construct(&mut frame, &wire::PoolConstructionReply { pool_id })
            }
            Message::PoolPurge { pool_id } => {
                WirePayload::construct(&mut frame, &wire::PoolPurge { pool_id })
            }
            Message::RegisterPool { pool_id } => {
                WirePayload::construct(&mut frame, &wire::RegisterPool { pool_id })
            }
            Message::UnregisterPool { pool_id } => {
                WirePayload::construct(&mut frame, &wire::UnregisterPool { pool_id })
            }
            Message::BufferAllocation { pool_id, buffer_id } => WirePayload::construct(
                &mut frame,
                &wire::BufferAllocation { pool_id, buffer_id },
            ),
            Message::BufferCommit {
                pool_id,
                buffer_id,
                has_fence,
            } => WirePayload::construct(
                &mut frame,
                &wire::BufferCommit {
                    pool_id,
                    buffer_id,
                    flags: if has_fence { wire::COMMIT_HAS_FENCE } else { 0 },
                },
            ),
            Message::ReleaseBuffer { pool_id, buffer_id } => WirePayload::construct(
                &mut frame,
                &wire::ReleaseBuffer { pool_id, buffer_id },
            ),
            Message::FrameComplete { pool_id } => {
                WirePayload::construct(&mut frame, &wire::FrameComplete { pool_id })
            }
        }
        frame
    }

    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        use wire::codes;

        let message = match frame.code {
            codes::POOL_CONSTRUCTION => Message::PoolConstruction,
            codes::POOL_CONSTRUCTION_REPLY => Message::PoolConstructionReply {
                pool_id: wire::PoolConstructionReply::from_frame(frame).pool_id,
            },
            codes::POOL_PURGE => Message::PoolPurge {
                pool_id: wire::PoolPurge::from_frame(frame).pool_id,
            },
            codes::REGISTER_POOL => Message::RegisterPool {
                pool_id: wire::RegisterPool::from_frame(frame).pool_id,
            },
            codes::UNREGISTER_POOL => Message::UnregisterPool {
                pool_id: wire::UnregisterPool::from_frame(frame).pool_id,
            },
            codes::BUFFER_ALLOCATION => {
                let payload = wire::BufferAllocation::from_frame(frame);
                Message::BufferAllocation {
                    pool_id: payload.pool_id,
                    buffer_id: payload.buffer_id,
                }
            }
            codes::BUFFER_COMMIT => {
                let payload = wire::BufferCommit::from_frame(frame);
                Message::BufferCommit {
                    pool_id: payload.pool_id,
                    buffer_id: payload.buffer_id,
                    has_fence: payload.flags & wire::COMMIT_HAS_FENCE != 0,
                }
            }
            codes::RELEASE_BUFFER => {
                let payload = wire::ReleaseBuffer::from_frame(frame);
                Message::ReleaseBuffer {
                    pool_id: payload.pool_id,
                    buffer_id: payload.buffer_id,
                }
            }
            codes::FRAME_COMPLETE => Message::FrameComplete {
                pool_id: wire::FrameComplete::from_frame(frame).pool_id,
            },
            other => return Err(DecodeError::UnknownCode(other)),
        };
        Ok(message)
    }

    /// Code this message carries on the wire.
    pub fn code(&self) -> u64 {
        self.encode().code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_every_message() {
        let messages = [
            Message::PoolConstruction,
            Message::PoolConstructionReply { pool_id: 0 },
            Message::PoolPurge { pool_id: 9 },
            Message::RegisterPool { pool_id: 1 },
            Message::UnregisterPool { pool_id: u32::MAX },
            Message::BufferAllocation {
                pool_id: 0,
                buffer_id: 2,
            },
            Message::BufferCommit {
                pool_id: 4,
                buffer_id: 3,
                has_fence: true,
            },
            Message::BufferCommit {
                pool_id: 4,
                buffer_id: 1,
                has_fence: false,
            },
            Message::ReleaseBuffer {
                pool_id: 0,
                buffer_id: 2,
            },
            Message::FrameComplete { pool_id: 12 },
        ];

        for message in messages {
            let frame = message.encode();
            assert_eq!(Message::decode(&frame), Ok(message));
        }
    }

    #[test]
    fn test_codes_match_wire_table() {
        assert_eq!(Message::PoolConstruction.code(), 4);
        assert_eq!(Message::PoolConstructionReply { pool_id: 0 }.code(), 5);
        assert_eq!(Message::PoolPurge { pool_id: 0 }.code(), 6);
        assert_eq!(Message::RegisterPool { pool_id: 0 }.code(), 7);
        assert_eq!(Message::UnregisterPool { pool_id: 0 }.code(), 8);
        assert_eq!(
            Message::BufferAllocation {
                pool_id: 0,
                buffer_id: 0
            }
            .code(),
            10
        );
        assert_eq!(
            Message::ReleaseBuffer {
                pool_id: 0,
                buffer_id: 0
            }
            .code(),
            16
        );
        assert_eq!(Message::FrameComplete { pool_id: 0 }.code(), 23);
    }

    #[test]
    fn test_unknown_code_is_rejected() {
        let frame = Frame {
            code: 11,
            data: [0; wire::PAYLOAD_SIZE],
        };

        match Message::decode(&frame) {
            Err(DecodeError::UnknownCode(code)) => assert_eq!(code, 11),
            other => panic!("Wrong decode result: {:?}", other),
        }
    }

    #[test]
    fn test_commit_fence_flag_on_wire() {
        let frame = Message::BufferCommit {
            pool_id: 1,
            buffer_id: 0,
            has_fence: true,
        }
        .encode();

        assert_eq!(&frame.data[8..12], &wire::COMMIT_HAS_FENCE.to_ne_bytes());
    }
}
