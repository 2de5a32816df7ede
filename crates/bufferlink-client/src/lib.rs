//! Renderer backend
//!
//! Producer side of the buffer protocol. A [`RendererBackend`] holds the
//! connection to the renderer host and any number of render [`Target`]s, each
//! connected to one host surface. Targets negotiate a pool on their first
//! frame, allocate buffers lazily per slot and hand rendered buffers to the
//! host by committing them.
//!
//! Everything runs on the thread that calls [`RendererBackend::dispatch`].

pub mod allocator;
pub mod target;

use std::collections::HashMap;
use std::io;
use std::os::fd::OwnedFd;
use std::time::Duration;

use bufferlink_ipc::wire::codes;
use bufferlink_ipc::{
    BufferId, Client, DispatchStatus, EventLoop, Frame, Message, NativeHandle, PoolId, SyncFence,
    TransportError,
};
use mio::Token;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use allocator::{BufferAllocator, BufferDescriptor, BufferFormat, BufferUsage, MemfdAllocator};
pub use target::{Slot, Target, TargetListener};

/// A render target owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(u32);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to create event loop: {0}")]
    EventLoop(#[source] io::Error),

    #[error("event loop poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("unknown target {0:?}")]
    UnknownTarget(TargetId),

    #[error("target {0:?} has no frame in progress")]
    NoCurrentBuffer(TargetId),

    #[error("pool handshake answered with message code {0}")]
    UnexpectedReply(u64),

    #[error("buffer allocation failed: {0}")]
    Allocation(#[source] io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Connection from one producer process to the renderer host
pub struct RendererBackend {
    event_loop: EventLoop,
    endpoint: Client,
    allocator: Box<dyn BufferAllocator>,
    format: BufferFormat,
    targets: HashMap<TargetId, Target>,
    routes: HashMap<Token, TargetId>,
    /// Current and previous pool of each target, so frame completions for
    /// the frame shown across a resize still reach it.
    pools: HashMap<PoolId, TargetId>,
    next_target_id: u32,
}

impl RendererBackend {
    /// Connect over `host_fd`, a descriptor obtained from `RendererHost::create_client`.
    pub fn new(host_fd: OwnedFd, allocator: Box<dyn BufferAllocator>) -> Result<Self, BackendError> {
        let mut event_loop = EventLoop::new().map_err(BackendError::EventLoop)?;
        let mut endpoint = Client::new();
        endpoint.initialize(&mut event_loop, host_fd)?;

        Ok(Self {
            event_loop,
            endpoint,
            allocator,
            format: BufferFormat::default(),
            targets: HashMap::new(),
            routes: HashMap::new(),
            pools: HashMap::new(),
            next_target_id: 0,
        })
    }

    /// Pixel format used for buffers allocated from now on.
    pub fn with_format(mut self, format: BufferFormat) -> Self {
        self.format = format;
        self
    }

    pub fn target(&self, id: TargetId) -> Option<&Target> {
        self.targets.get(&id)
    }

    fn target_mut(&mut self, id: TargetId) -> Result<&mut Target, BackendError> {
        self.targets
            .get_mut(&id)
            .ok_or(BackendError::UnknownTarget(id))
    }

    // ========================================================================
    // Target lifecycle
    // ========================================================================

    /// Create a target that presents to the host surface behind `surface_fd`.
    pub fn create_target(
        &mut self,
        surface_fd: OwnedFd,
        listener: Box<dyn TargetListener>,
    ) -> Result<TargetId, BackendError> {
        let id = TargetId(self.next_target_id);
        self.next_target_id += 1;

        let mut endpoint = Client::new();
        endpoint.initialize(&mut self.event_loop, surface_fd)?;
        if let Some(token) = endpoint.token() {
            self.routes.insert(token, id);
        }
        self.targets.insert(id, Target::new(endpoint, listener));
        debug!("Created target {:?}", id);
        Ok(id)
    }

    pub fn initialize_target(
        &mut self,
        id: TargetId,
        width: u32,
        height: u32,
    ) -> Result<(), BackendError> {
        self.target_mut(id)?.set_size(width, height);
        Ok(())
    }

    /// Change the target size, abandoning its current pool.
    ///
    /// The next frame negotiates a fresh pool id; buffers of the old pool that
    /// the host still presents are freed there on release.
    pub fn resize(&mut self, id: TargetId, width: u32, height: u32) -> Result<(), BackendError> {
        let target = self
            .targets
            .get_mut(&id)
            .ok_or(BackendError::UnknownTarget(id))?;
        if target.size() == (width, height) {
            return Ok(());
        }
        target.set_size(width, height);

        if let Some(pool_id) = target.pool_id() {
            info!("Target {:?} resized to {}x{}, dropping pool {}", id, width, height, pool_id);
            self.endpoint.send_message(&Message::PoolPurge { pool_id });
            target
                .endpoint
                .send_message(&Message::UnregisterPool { pool_id });
            target.set_pool_id(None);
            forget_older_pools(&mut self.pools, id, pool_id);
        }
        target.drop_buffers();
        Ok(())
    }

    pub fn destroy_target(&mut self, id: TargetId) {
        let Some(mut target) = self.targets.remove(&id) else {
            return;
        };
        if let Some(pool_id) = target.pool_id() {
            target
                .endpoint
                .send_message(&Message::UnregisterPool { pool_id });
        }
        if let Some(token) = target.endpoint.token() {
            self.routes.remove(&token);
        }
        target.endpoint.deinitialize(&self.event_loop);
        target.drop_buffers();
        self.pools.retain(|_, owner| *owner != id);
        debug!("Destroyed target {:?}", id);
    }

    // ========================================================================
    // Frames
    // ========================================================================

    /// Make sure the target has a pool, negotiating one with the host if not.
    fn ensure_pool(&mut self, id: TargetId) -> Result<PoolId, BackendError> {
        if let Some(pool_id) = self.target_mut(id)?.pool_id() {
            return Ok(pool_id);
        }

        let reply: Frame = self
            .endpoint
            .send_and_receive(&Message::PoolConstruction, codes::POOL_CONSTRUCTION_REPLY)?;
        let pool_id = match Message::decode(&reply) {
            Ok(Message::PoolConstructionReply { pool_id }) => pool_id,
            _ => return Err(BackendError::UnexpectedReply(reply.code)),
        };

        let target = self.target_mut(id)?;
        target.set_pool_id(Some(pool_id));
        target
            .endpoint
            .send_message(&Message::RegisterPool { pool_id });
        self.pools.insert(pool_id, id);
        info!("Target {:?} got pool {}", id, pool_id);
        Ok(pool_id)
    }

    /// Pick the buffer the next frame renders into.
    ///
    /// Negotiates a pool on first use and allocates the slot's buffer if it
    /// has none yet, announcing it to the host.
    ///
    /// # Panics
    ///
    /// If the host holds every buffer of the pool.
    pub fn frame_will_render(&mut self, id: TargetId) -> Result<&NativeHandle, BackendError> {
        let pool_id = self.ensure_pool(id)?;
        let target = self
            .targets
            .get_mut(&id)
            .ok_or(BackendError::UnknownTarget(id))?;
        let index = target.select_current();

        if target.slots()[index].handle().is_none() {
            let (width, height) = target.size();
            let descriptor = BufferDescriptor::render_target(width, height, self.format);
            let buffer_id = target.slots()[index].buffer_id();

            let handle = match self.allocator.allocate(&descriptor) {
                Ok(handle) => handle,
                Err(err) => {
                    target.take_current();
                    return Err(BackendError::Allocation(err));
                }
            };
            let exported = match handle.export() {
                Ok(fd) => fd,
                Err(err) => {
                    target.take_current();
                    return Err(BackendError::Allocation(err));
                }
            };

            self.endpoint
                .send_message(&Message::BufferAllocation { pool_id, buffer_id });
            if let Err(err) = self.endpoint.send_fd(exported) {
                target.take_current();
                return Err(err.into());
            }
            debug!("Attached buffer {} to pool {}", buffer_id, pool_id);
            target.listener.buffer_attached(buffer_id, &handle);
            target.attach(index, handle);
        }

        match target.slots()[index].handle() {
            Some(handle) => Ok(handle),
            None => Err(BackendError::NoCurrentBuffer(id)),
        }
    }

    /// Hand the buffer picked by `frame_will_render` to the host.
    pub fn frame_rendered(
        &mut self,
        id: TargetId,
        fence: Option<SyncFence>,
    ) -> Result<(), BackendError> {
        let target = self
            .targets
            .get_mut(&id)
            .ok_or(BackendError::UnknownTarget(id))?;
        let (Some(index), Some(pool_id)) = (target.take_current(), target.pool_id()) else {
            return Err(BackendError::NoCurrentBuffer(id));
        };
        let buffer_id: BufferId = target.slots()[index].buffer_id();

        self.endpoint.send_message(&Message::BufferCommit {
            pool_id,
            buffer_id,
            has_fence: fence.is_some(),
        });
        target.lock(index);
        if let Some(fence) = fence {
            self.endpoint.send_fd(fence)?;
        }
        debug!("Committed pool {} buffer {}", pool_id, buffer_id);
        Ok(())
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Wait up to `timeout` and handle host traffic.
    ///
    /// Returns how many endpoints were serviced.
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<usize, BackendError> {
        let host_token = self.endpoint.token();
        // Frames queued by the handshake are ready now, do not sleep on them.
        let backlog = self.endpoint.has_backlog();
        let timeout = if backlog { Some(Duration::ZERO) } else { timeout };

        let mut tokens = self.event_loop.poll(timeout).map_err(BackendError::Poll)?;
        if backlog {
            if let Some(token) = host_token.filter(|token| !tokens.contains(token)) {
                tokens.push(token);
            }
        }

        for token in &tokens {
            if Some(*token) == host_token {
                self.dispatch_host();
            } else if let Some(id) = self.routes.get(token).copied() {
                self.dispatch_target(id);
            }
        }
        Ok(tokens.len())
    }

    fn dispatch_host(&mut self) {
        let pools = &self.pools;
        let targets = &mut self.targets;
        let status = self
            .endpoint
            .dispatch(|_, frame| handle_host_message(pools, targets, frame));
        if status == DispatchStatus::Closed {
            warn!("Renderer host closed the connection");
            self.endpoint.deinitialize(&self.event_loop);
        }
    }

    fn dispatch_target(&mut self, id: TargetId) {
        let Some(target) = self.targets.get_mut(&id) else {
            return;
        };
        let status = target.endpoint.dispatch(|_, frame| {
            warn!("Target {:?} ignoring surface frame code {}", id, frame.code)
        });
        if status == DispatchStatus::Closed {
            info!("Surface of target {:?} went away", id);
            if let Some(token) = target.endpoint.token() {
                self.routes.remove(&token);
            }
            target.endpoint.deinitialize(&self.event_loop);
        }
    }
}

/// Drop the routes of `target` except the one for `keep`.
fn forget_older_pools(pools: &mut HashMap<PoolId, TargetId>, target: TargetId, keep: PoolId) {
    pools.retain(|pool_id, owner| *owner != target || *pool_id == keep);
}

fn handle_host_message(
    pools: &HashMap<PoolId, TargetId>,
    targets: &mut HashMap<TargetId, Target>,
    frame: Frame,
) {
    let message = match Message::decode(&frame) {
        Ok(message) => message,
        Err(err) => {
            warn!("Renderer host sent a bad frame: {}", err);
            return;
        }
    };

    match message {
        Message::ReleaseBuffer { pool_id, buffer_id } => {
            match pools.get(&pool_id).and_then(|id| targets.get_mut(id)) {
                Some(target) => target.release(pool_id, buffer_id),
                None => debug!("Release for stale pool {}", pool_id),
            }
        }
        Message::FrameComplete { pool_id } => {
            match pools.get(&pool_id).and_then(|id| targets.get_mut(id)) {
                Some(target) => target.listener.frame_displayed(),
                None => debug!("Frame complete for stale pool {}", pool_id),
            }
        }
        other => warn!("Renderer host sent {:?}, which only clients emit", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Counter(Rc<Cell<u32>>);

    impl TargetListener for Counter {
        fn frame_displayed(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn target_with_pool(pool_id: PoolId, counter: Rc<Cell<u32>>) -> Target {
        let mut target = Target::new(Client::new(), Box::new(Counter(counter)));
        target.set_pool_id(Some(pool_id));
        target.lock(1);
        target
    }

    #[test]
    fn test_host_messages_route_by_pool() {
        let displayed = Rc::new(Cell::new(0));
        let mut targets = HashMap::new();
        targets.insert(TargetId(0), target_with_pool(5, displayed.clone()));
        let mut pools = HashMap::new();
        pools.insert(5, TargetId(0));

        let release = Message::ReleaseBuffer {
            pool_id: 5,
            buffer_id: 1,
        };
        handle_host_message(&pools, &mut targets, release.encode());
        handle_host_message(&pools, &mut targets, Message::FrameComplete { pool_id: 5 }.encode());
        handle_host_message(&pools, &mut targets, Message::FrameComplete { pool_id: 6 }.encode());

        let target = &targets[&TargetId(0)];
        assert!(!target.slot(1).unwrap().is_locked());
        assert_eq!(displayed.get(), 1);
    }

    #[test]
    fn test_resize_keeps_only_previous_pool_route() {
        let mut pools = HashMap::new();
        for pool_id in 0..5 {
            pools.insert(pool_id, TargetId(0));
        }
        pools.insert(9, TargetId(1));

        forget_older_pools(&mut pools, TargetId(0), 4);

        assert_eq!(pools.len(), 2);
        assert_eq!(pools.get(&4), Some(&TargetId(0)));
        assert_eq!(pools.get(&9), Some(&TargetId(1)));
    }
}
