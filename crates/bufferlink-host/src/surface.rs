//! Consumer side of a renderer target.
//!
//! A surface owns its own socket pair. The renderer target on the other end
//! uses it to announce which pools present to this surface; committed buffers
//! themselves arrive over the client connection and are routed here through
//! the registry.

use bufferlink_ipc::{DispatchStatus, Frame, Host, Message, PoolId, SyncFence};
use tracing::{debug, info, warn};

use crate::buffer::{Buffer, BufferPool};
use crate::registry::Registry;
use crate::SurfaceId;

/// Where committed buffers end up (a compositor, a view, a test recorder).
pub trait Presentation {
    /// `buffer` is locked until [`crate::RendererHost::release_buffer`] is
    /// called with its pool and buffer id. Wait on `fence` before reading it.
    fn on_buffer_ready(&mut self, buffer: &Buffer, fence: Option<SyncFence>);

    /// The frame committed from `pool_id` reached the screen.
    fn on_frame_displayed(&mut self, _pool_id: PoolId) {}
}

pub struct Surface {
    id: SurfaceId,
    endpoint: Host,
    pools: Vec<PoolId>,
    presentation: Box<dyn Presentation>,
}

impl Surface {
    pub(crate) fn new(id: SurfaceId, endpoint: Host, presentation: Box<dyn Presentation>) -> Self {
        Self {
            id,
            endpoint,
            pools: Vec::new(),
            presentation,
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// Pools currently registered by the renderer target.
    pub fn pools(&self) -> &[PoolId] {
        &self.pools
    }

    pub(crate) fn endpoint(&self) -> &Host {
        &self.endpoint
    }

    pub(crate) fn endpoint_mut(&mut self) -> &mut Host {
        &mut self.endpoint
    }

    pub(crate) fn presentation(&mut self) -> &mut dyn Presentation {
        self.presentation.as_mut()
    }

    pub(crate) fn forget_pools(&mut self, gone: &[PoolId]) {
        self.pools.retain(|pool| !gone.contains(pool));
    }

    pub(crate) fn take_pools(&mut self) -> Vec<PoolId> {
        std::mem::take(&mut self.pools)
    }

    pub(crate) fn dispatch(&mut self, registry: &mut Registry) -> DispatchStatus {
        let id = self.id;
        let pools = &mut self.pools;
        let presentation = self.presentation.as_mut();
        self.endpoint.dispatch(|_, frame| {
            handle_message(id, pools, registry, presentation, frame)
        })
    }
}

fn handle_message(
    id: SurfaceId,
    pools: &mut Vec<PoolId>,
    registry: &mut Registry,
    presentation: &mut dyn Presentation,
    frame: Frame,
) {
    match Message::decode(&frame) {
        Ok(Message::RegisterPool { pool_id }) => {
            info!("Surface {:?} registered pool {}", id, pool_id);
            if !pools.contains(&pool_id) {
                pools.push(pool_id);
            }
            registry.register_target(pool_id, id);
            if let Some(pool) = registry.buffer_pool_mut(pool_id) {
                present_parked(pool, presentation);
            }
        }
        Ok(Message::UnregisterPool { pool_id }) => {
            if !pools.contains(&pool_id) {
                debug!("Surface {:?} never registered pool {}", id, pool_id);
                return;
            }
            info!("Surface {:?} unregistered pool {}", id, pool_id);
            pools.retain(|pool| *pool != pool_id);
            registry.destroy_pool(pool_id);
        }
        Ok(other) => warn!("Surface {:?} ignoring unexpected {:?}", id, other),
        Err(err) => warn!("Surface {:?} received a bad frame: {}", id, err),
    }
}

/// Hand over commits that arrived before the pool was registered.
fn present_parked(pool: &mut BufferPool, presentation: &mut dyn Presentation) {
    for parked in pool.take_parked() {
        match pool.get_buffer(parked.buffer_id) {
            Some(buffer) => {
                debug!(
                    "Presenting held pool {} buffer {}",
                    pool.id(),
                    parked.buffer_id
                );
                presentation.on_buffer_ready(buffer, parked.fence);
            }
            None => debug!("Held buffer {} of pool {} is gone", parked.buffer_id, pool.id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientId;
    use bufferlink_ipc::{BufferId, NativeHandle};
    use std::os::unix::net::UnixStream;

    #[derive(Default)]
    struct Recorder(Vec<(PoolId, BufferId)>);

    impl Presentation for Recorder {
        fn on_buffer_ready(&mut self, buffer: &Buffer, _fence: Option<SyncFence>) {
            self.0.push((buffer.pool_id(), buffer.buffer_id()));
        }
    }

    fn handle() -> NativeHandle {
        let (ours, _) = UnixStream::pair().unwrap();
        NativeHandle::from_fd(ours.into())
    }

    #[test]
    fn test_registration_presents_held_commits() {
        let mut registry = Registry::new();
        let pool_id = registry.create_buffer_pool(ClientId(0));
        let pool = registry.find_buffer_pool(pool_id).unwrap();
        pool.set_buffer(0, handle()).unwrap();
        pool.set_buffer(1, handle()).unwrap();
        pool.park(1, None);
        pool.park(0, None);
        let mut pools = Vec::new();
        let mut recorder = Recorder::default();

        let register = Message::RegisterPool { pool_id }.encode();
        handle_message(SurfaceId(0), &mut pools, &mut registry, &mut recorder, register);

        assert_eq!(recorder.0, vec![(pool_id, 1), (pool_id, 0)]);
        let pool = registry.buffer_pool(pool_id).unwrap();
        assert_eq!(pool.parked_count(), 0);
        assert!(pool.get_buffer(1).unwrap().is_locked());
    }

    #[test]
    fn test_register_then_unregister_pool() {
        let mut registry = Registry::new();
        let pool_id = registry.create_buffer_pool(ClientId(0));
        let mut pools = Vec::new();
        let mut recorder = Recorder::default();

        let register = Message::RegisterPool { pool_id }.encode();
        handle_message(SurfaceId(1), &mut pools, &mut registry, &mut recorder, register);
        handle_message(SurfaceId(1), &mut pools, &mut registry, &mut recorder, register);
        assert_eq!(pools, vec![pool_id]);
        assert_eq!(registry.find_target(pool_id), Some(SurfaceId(1)));

        let unregister = Message::UnregisterPool { pool_id }.encode();
        handle_message(SurfaceId(1), &mut pools, &mut registry, &mut recorder, unregister);
        handle_message(SurfaceId(1), &mut pools, &mut registry, &mut recorder, unregister);
        assert!(pools.is_empty());
        assert!(registry.find_target(pool_id).is_none());
        assert!(registry.buffer_pool(pool_id).is_none());
    }
}
