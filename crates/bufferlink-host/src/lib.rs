//! Renderer host
//!
//! Compositor side of the buffer protocol. One [`RendererHost`] per process
//! accepts producer connections, mints buffer pools for them, routes committed
//! buffers to the surface each pool is registered with and sends releases and
//! frame completions back.
//!
//! The host is single threaded: the thread that owns it calls
//! [`RendererHost::dispatch`] and every other operation.

pub mod buffer;
mod client_proxy;
pub mod registry;
pub mod surface;

use std::collections::HashMap;
use std::io;
use std::os::fd::OwnedFd;
use std::time::Duration;

use bufferlink_ipc::{
    BufferId, DispatchStatus, EventLoop, Host, Message, PoolId, TransportError,
};
use mio::Token;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use buffer::{Buffer, BufferPool, ReleaseOutcome, SlotError};
pub use registry::Registry;
pub use surface::{Presentation, Surface};

use client_proxy::ClientProxy;

/// A producer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub(crate) u32);

/// A surface created by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub(crate) u32);

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to create event loop: {0}")]
    EventLoop(#[source] io::Error),

    #[error("event loop poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("failed to duplicate the peer descriptor")]
    Handoff,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy)]
enum Route {
    Client(ClientId),
    Surface(SurfaceId),
}

/// Process-wide registry of producer connections, pools and surfaces
pub struct RendererHost {
    event_loop: EventLoop,
    routes: HashMap<Token, Route>,
    clients: HashMap<ClientId, ClientProxy>,
    surfaces: HashMap<SurfaceId, Surface>,
    registry: Registry,
    next_client_id: u32,
    next_surface_id: u32,
}

impl RendererHost {
    pub fn new() -> Result<Self, HostError> {
        Ok(Self {
            event_loop: EventLoop::new().map_err(HostError::EventLoop)?,
            routes: HashMap::new(),
            clients: HashMap::new(),
            surfaces: HashMap::new(),
            registry: Registry::new(),
            next_client_id: 0,
            next_surface_id: 0,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Open a connection for a new producer and return its end of the socket.
    pub fn create_client(&mut self) -> Result<OwnedFd, HostError> {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;

        let mut endpoint = Host::new();
        endpoint.initialize(&mut self.event_loop)?;
        let fd = endpoint.release_client_fd(true).ok_or(HostError::Handoff)?;

        if let Some(token) = endpoint.token() {
            self.routes.insert(token, Route::Client(id));
        }
        self.clients.insert(id, ClientProxy::new(id, endpoint));
        info!("Client {:?} connected", id);
        Ok(fd)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn remove_client(&mut self, id: ClientId) {
        if let Some(mut proxy) = self.clients.remove(&id) {
            if let Some(token) = proxy.endpoint().token() {
                self.routes.remove(&token);
            }
            proxy.endpoint_mut().deinitialize(&self.event_loop);
        }
        let gone = self.registry.destroy_client_pools(id);
        for surface in self.surfaces.values_mut() {
            surface.forget_pools(&gone);
        }
        info!("Client {:?} disconnected, destroyed pools {:?}", id, gone);
    }

    // ========================================================================
    // Surfaces
    // ========================================================================

    /// Create a surface presenting through `presentation`.
    ///
    /// The renderer target for it connects with [`RendererHost::release_surface_fd`].
    pub fn create_surface(
        &mut self,
        presentation: Box<dyn Presentation>,
    ) -> Result<SurfaceId, HostError> {
        let id = SurfaceId(self.next_surface_id);
        self.next_surface_id += 1;

        let mut endpoint = Host::new();
        endpoint.initialize(&mut self.event_loop)?;
        if let Some(token) = endpoint.token() {
            self.routes.insert(token, Route::Surface(id));
        }
        self.surfaces
            .insert(id, Surface::new(id, endpoint, presentation));
        info!("Surface {:?} created", id);
        Ok(id)
    }

    /// Duplicate of the descriptor a renderer target uses for this surface.
    pub fn release_surface_fd(&mut self, id: SurfaceId) -> Option<OwnedFd> {
        self.surfaces
            .get_mut(&id)?
            .endpoint_mut()
            .release_client_fd(false)
    }

    pub fn surface(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.get(&id)
    }

    /// Drop a surface and every pool registration it holds.
    pub fn destroy_surface(&mut self, id: SurfaceId) {
        let Some(mut surface) = self.surfaces.remove(&id) else {
            return;
        };
        for pool_id in surface.take_pools() {
            self.registry.unregister_target(pool_id);
        }
        if let Some(token) = surface.endpoint().token() {
            self.routes.remove(&token);
        }
        surface.endpoint_mut().deinitialize(&self.event_loop);
        info!("Surface {:?} destroyed", id);
    }

    // ========================================================================
    // Presentation feedback
    // ========================================================================

    /// Presentation no longer needs `buffer_id` of `pool_id`.
    ///
    /// A buffer waiting for deletion is freed; any other is handed back to
    /// its producer with `ReleaseBuffer`.
    pub fn release_buffer(&mut self, pool_id: PoolId, buffer_id: BufferId) {
        match self.registry.release(pool_id, buffer_id) {
            Some((client, ReleaseOutcome::Recycled)) => match self.clients.get(&client) {
                Some(proxy) => proxy
                    .endpoint()
                    .send_message(&Message::ReleaseBuffer { pool_id, buffer_id }),
                None => debug!("Client {:?} gone, release of {} dropped", client, pool_id),
            },
            Some((_, ReleaseOutcome::Destroyed)) => {
                debug!("Freed pool {} buffer {} on release", pool_id, buffer_id)
            }
            Some((_, ReleaseOutcome::Ignored)) => {
                debug!("Pool {} buffer {} was not presented", pool_id, buffer_id)
            }
            None => warn!("Release for unknown pool {}", pool_id),
        }
    }

    /// Tell the producer of `pool_id` that its last frame was displayed.
    pub fn notify_frame_complete(&self, pool_id: PoolId) {
        let Some(client) = self.registry.owner(pool_id) else {
            warn!("Frame complete for unknown pool {}", pool_id);
            return;
        };
        if let Some(proxy) = self.clients.get(&client) {
            proxy
                .endpoint()
                .send_message(&Message::FrameComplete { pool_id });
        }
    }

    /// A frame of `pool_id` reached the screen of `surface`.
    pub fn frame_displayed(&mut self, surface: SurfaceId, pool_id: PoolId) {
        self.notify_frame_complete(pool_id);
        if let Some(surface) = self.surfaces.get_mut(&surface) {
            surface.presentation().on_frame_displayed(pool_id);
        }
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Wait up to `timeout` and handle everything that became readable.
    ///
    /// Returns how many endpoints were serviced.
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<usize, HostError> {
        let tokens = self.event_loop.poll(timeout).map_err(HostError::Poll)?;
        let mut surfaces = Vec::new();
        let mut clients = Vec::new();
        for token in &tokens {
            match self.routes.get(token).copied() {
                Some(Route::Client(id)) => clients.push(id),
                Some(Route::Surface(id)) => surfaces.push(id),
                None => debug!("Event for retired token {:?}", token),
            }
        }

        // A target registers its pool before committing into it, but on a
        // different socket. Registrations go first; commits that still beat
        // theirs are held on the pool until it is registered.
        for id in surfaces {
            self.dispatch_surface(id);
        }
        for id in clients {
            self.dispatch_client(id);
        }
        Ok(tokens.len())
    }

    fn dispatch_client(&mut self, id: ClientId) {
        let Some(proxy) = self.clients.get_mut(&id) else {
            return;
        };
        if proxy.dispatch(&mut self.registry, &mut self.surfaces) == DispatchStatus::Closed {
            self.remove_client(id);
        }
    }

    fn dispatch_surface(&mut self, id: SurfaceId) {
        let Some(surface) = self.surfaces.get_mut(&id) else {
            return;
        };
        if surface.dispatch(&mut self.registry) == DispatchStatus::Closed {
            info!("Renderer target of surface {:?} disconnected", id);
            for pool_id in surface.take_pools() {
                self.registry.unregister_target(pool_id);
            }
            if let Some(token) = surface.endpoint().token() {
                self.routes.remove(&token);
            }
            surface.endpoint_mut().deinitialize(&self.event_loop);
        }
    }
}
