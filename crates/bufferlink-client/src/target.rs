//! Per-surface producer state.
//!
//! A target cycles rendering through a fixed set of slots. A slot is locked
//! from the moment its buffer is committed until the host releases it, and is
//! never rendered into while locked.

use bufferlink_ipc::{BufferId, Client, NativeHandle, POOL_DEPTH, PoolId};
use tracing::debug;

/// Receives notifications about one target.
pub trait TargetListener {
    /// A newly allocated buffer was announced to the host.
    fn buffer_attached(&mut self, _buffer_id: BufferId, _handle: &NativeHandle) {}

    /// The host displayed a frame of this target.
    fn frame_displayed(&mut self);
}

#[derive(Debug)]
pub struct Slot {
    buffer_id: BufferId,
    locked: bool,
    handle: Option<NativeHandle>,
}

impl Slot {
    fn new(buffer_id: BufferId) -> Self {
        Self {
            buffer_id,
            locked: false,
            handle: None,
        }
    }

    pub fn buffer_id(&self) -> BufferId {
        self.buffer_id
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn handle(&self) -> Option<&NativeHandle> {
        self.handle.as_ref()
    }
}

pub struct Target {
    pub(crate) endpoint: Client,
    pub(crate) listener: Box<dyn TargetListener>,
    width: u32,
    height: u32,
    pool_id: Option<PoolId>,
    slots: [Slot; POOL_DEPTH],
    current: Option<usize>,
}

impl Target {
    pub(crate) fn new(endpoint: Client, listener: Box<dyn TargetListener>) -> Self {
        Self {
            endpoint,
            listener,
            width: 0,
            height: 0,
            pool_id: None,
            slots: std::array::from_fn(|index| Slot::new(index as BufferId)),
            current: None,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub(crate) fn set_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    /// Pool currently negotiated with the host, if any.
    pub fn pool_id(&self) -> Option<PoolId> {
        self.pool_id
    }

    pub(crate) fn set_pool_id(&mut self, pool_id: Option<PoolId>) {
        self.pool_id = pool_id;
    }

    pub fn slot(&self, buffer_id: BufferId) -> Option<&Slot> {
        self.slots.get(usize::try_from(buffer_id).ok()?)
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Slot being rendered into between `frame_will_render` and `frame_rendered`.
    pub fn current(&self) -> Option<&Slot> {
        self.current.map(|index| &self.slots[index])
    }

    /// Pick the first unlocked slot as the render destination.
    ///
    /// # Panics
    ///
    /// If every slot is locked: the host is holding more buffers than a pool
    /// has, and rendering cannot continue.
    pub(crate) fn select_current(&mut self) -> usize {
        let Some(index) = self.slots.iter().position(|slot| !slot.locked) else {
            panic!(
                "all {} buffers of pool {:?} are locked by the host",
                POOL_DEPTH, self.pool_id
            );
        };
        self.current = Some(index);
        index
    }

    pub(crate) fn take_current(&mut self) -> Option<usize> {
        self.current.take()
    }

    pub(crate) fn attach(&mut self, index: usize, handle: NativeHandle) -> &NativeHandle {
        self.slots[index].handle.insert(handle)
    }

    pub(crate) fn lock(&mut self, index: usize) {
        self.slots[index].locked = true;
    }

    /// The host is done with `buffer_id` of `pool_id`.
    pub(crate) fn release(&mut self, pool_id: PoolId, buffer_id: BufferId) {
        if self.pool_id != Some(pool_id) {
            debug!("Ignoring release of buffer {} from old pool {}", buffer_id, pool_id);
            return;
        }
        match usize::try_from(buffer_id).ok().and_then(|i| self.slots.get_mut(i)) {
            Some(slot) => slot.locked = false,
            None => debug!("Ignoring release of unknown buffer {}", buffer_id),
        }
    }

    /// Free every local buffer and forget all locks.
    pub(crate) fn drop_buffers(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.handle = None;
            slot.locked = false;
        }
        self.current = None;
    }
}
