//! Host-side buffers and the fixed-depth pools that own them.

use bufferlink_ipc::{BufferId, NativeHandle, POOL_DEPTH, PoolId, SyncFence};
use thiserror::Error;
use tracing::debug;

use crate::ClientId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("buffer id {0} is outside the pool")]
    OutOfRange(BufferId),
}

/// What a release did to the buffer it named
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Unlocked and kept; the client may render into it again.
    Recycled,
    /// It was waiting for deletion and is now freed.
    Destroyed,
    /// Nothing matching was present.
    Ignored,
}

/// A client buffer received by the host
#[derive(Debug)]
pub struct Buffer {
    handle: NativeHandle,
    pool_id: PoolId,
    buffer_id: BufferId,
    locked: bool,
    pending_delete: bool,
}

impl Buffer {
    pub fn new(handle: NativeHandle, pool_id: PoolId, buffer_id: BufferId) -> Self {
        Self {
            handle,
            pool_id,
            buffer_id,
            locked: false,
            pending_delete: false,
        }
    }

    pub fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    pub fn buffer_id(&self) -> BufferId {
        self.buffer_id
    }

    /// Held by the presentation layer.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Freed on its next release instead of being recycled.
    pub fn is_pending_delete(&self) -> bool {
        self.pending_delete
    }

    pub fn into_handle(self) -> NativeHandle {
        self.handle
    }
}

/// A commit that arrived before its pool was registered with a surface
#[derive(Debug)]
pub(crate) struct ParkedCommit {
    pub(crate) buffer_id: BufferId,
    pub(crate) fence: Option<SyncFence>,
}

/// Fixed set of buffer slots belonging to one client pool.
///
/// Dropping a [`Buffer`] frees its handle, so every removal below is also the
/// single place that handle is freed.
#[derive(Debug)]
pub struct BufferPool {
    id: PoolId,
    client: ClientId,
    slots: [Option<Buffer>; POOL_DEPTH],
    /// Locked buffers displaced by a newer allocation into their slot.
    deferred: Vec<Buffer>,
    /// Set once a surface registered the pool, even if it unregistered since.
    registered: bool,
    parked: Vec<ParkedCommit>,
}

impl BufferPool {
    pub fn new(id: PoolId, client: ClientId) -> Self {
        Self {
            id,
            client,
            slots: Default::default(),
            deferred: Vec::new(),
            registered: false,
            parked: Vec::new(),
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// A surface has registered this pool at some point.
    pub fn was_registered(&self) -> bool {
        self.registered
    }

    pub(crate) fn mark_registered(&mut self) {
        self.registered = true;
    }

    /// Commits waiting for the pool's first registration.
    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    fn index(buffer_id: BufferId) -> Option<usize> {
        let index = usize::try_from(buffer_id).ok()?;
        (index < POOL_DEPTH).then_some(index)
    }

    pub fn get_buffer(&self, buffer_id: BufferId) -> Option<&Buffer> {
        self.slots[Self::index(buffer_id)?].as_ref()
    }

    /// Install `handle` in a slot.
    ///
    /// An out-of-range id frees the handle. An unlocked occupant is freed; a
    /// locked one is flagged pending-delete and freed at its release.
    pub fn set_buffer(&mut self, buffer_id: BufferId, handle: NativeHandle) -> Result<(), SlotError> {
        let Some(index) = Self::index(buffer_id) else {
            drop(handle);
            return Err(SlotError::OutOfRange(buffer_id));
        };

        let replacement = Buffer::new(handle, self.id, buffer_id);
        if let Some(mut previous) = self.slots[index].replace(replacement) {
            if previous.locked {
                debug!(
                    "Pool {} slot {} replaced while presented, deferring free",
                    self.id, buffer_id
                );
                previous.pending_delete = true;
                self.deferred.push(previous);
            }
        }
        Ok(())
    }

    /// Detach a slot's handle without freeing it.
    pub fn release_slot(&mut self, buffer_id: BufferId) -> Option<NativeHandle> {
        let slot = self.slots.get_mut(Self::index(buffer_id)?)?;
        slot.take().map(Buffer::into_handle)
    }

    /// Mark a slot as handed to presentation.
    pub fn lock(&mut self, buffer_id: BufferId) -> Option<&Buffer> {
        let buffer = self.slots.get_mut(Self::index(buffer_id)?)?.as_mut()?;
        buffer.locked = true;
        Some(buffer)
    }

    /// Lock a committed slot and hold the commit until a surface registers.
    ///
    /// Returns false if the slot is empty.
    pub(crate) fn park(&mut self, buffer_id: BufferId, fence: Option<SyncFence>) -> bool {
        if self.lock(buffer_id).is_none() {
            return false;
        }
        self.parked.push(ParkedCommit { buffer_id, fence });
        true
    }

    pub(crate) fn take_parked(&mut self) -> Vec<ParkedCommit> {
        std::mem::take(&mut self.parked)
    }

    /// Free unlocked buffers; flag locked ones pending-delete.
    ///
    /// Parked commits were never presented, so their buffers are freed too.
    pub fn purge(&mut self) {
        for parked in self.parked.drain(..) {
            let index = Self::index(parked.buffer_id);
            if let Some(buffer) = index.and_then(|i| self.slots[i].as_mut()) {
                buffer.locked = false;
            }
        }
        for slot in self.slots.iter_mut() {
            if let Some(buffer) = slot.as_mut().filter(|buffer| buffer.locked) {
                buffer.pending_delete = true;
            } else {
                *slot = None;
            }
        }
    }

    /// Presentation is done with `buffer_id`.
    pub fn release(&mut self, buffer_id: BufferId) -> ReleaseOutcome {
        // Displaced buffers were presented before the slot's current occupant.
        if let Some(position) = self
            .deferred
            .iter()
            .position(|buffer| buffer.buffer_id == buffer_id)
        {
            self.deferred.remove(position);
            return ReleaseOutcome::Destroyed;
        }

        let Some(index) = Self::index(buffer_id) else {
            return ReleaseOutcome::Ignored;
        };
        let slot = &mut self.slots[index];
        let (pending_delete, locked) = match slot.as_ref() {
            Some(buffer) => (buffer.pending_delete, buffer.locked),
            None => return ReleaseOutcome::Ignored,
        };
        if pending_delete {
            *slot = None;
            ReleaseOutcome::Destroyed
        } else if locked {
            if let Some(buffer) = slot.as_mut() {
                buffer.locked = false;
            }
            ReleaseOutcome::Recycled
        } else {
            ReleaseOutcome::Ignored
        }
    }

    /// No buffer is held anymore, locked or not.
    pub fn is_drained(&self) -> bool {
        self.deferred.is_empty() && self.slots.iter().all(Option::is_none)
    }
}
