//! Pools and target registrations of one renderer host.

use std::collections::HashMap;

use bufferlink_ipc::{BufferId, PoolId};
use tracing::{debug, warn};

use crate::buffer::{BufferPool, ReleaseOutcome};
use crate::{ClientId, SurfaceId};

/// Every pool minted by a host and the surface each one presents to
#[derive(Debug, Default)]
pub struct Registry {
    pools: HashMap<PoolId, BufferPool>,
    /// Destroyed pools still holding buffers the presentation has not released.
    retired: HashMap<PoolId, BufferPool>,
    /// Non-owning: surfaces live in the runtime and unregister on destruction.
    targets: HashMap<PoolId, SurfaceId>,
    /// Live and retired pools only; dropped once a pool is fully freed.
    owners: HashMap<PoolId, ClientId>,
    next_pool_id: PoolId,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh pool for `client`. Ids are never handed out twice.
    pub fn create_buffer_pool(&mut self, client: ClientId) -> PoolId {
        let id = self.next_pool_id;
        self.next_pool_id = self.next_pool_id.wrapping_add(1);
        self.pools.insert(id, BufferPool::new(id, client));
        self.owners.insert(id, client);
        debug!("Created pool {} for client {:?}", id, client);
        id
    }

    pub fn find_buffer_pool(&mut self, id: PoolId) -> Option<&mut BufferPool> {
        let pool = self.pools.get_mut(&id);
        if pool.is_none() {
            warn!("Buffer pool {} not found", id);
        }
        pool
    }

    /// Look up a pool without logging a miss.
    pub fn buffer_pool(&self, id: PoolId) -> Option<&BufferPool> {
        self.pools.get(&id)
    }

    pub(crate) fn buffer_pool_mut(&mut self, id: PoolId) -> Option<&mut BufferPool> {
        self.pools.get_mut(&id)
    }

    /// Look up a target without logging a miss.
    pub fn target(&self, id: PoolId) -> Option<SurfaceId> {
        self.targets.get(&id).copied()
    }

    pub fn find_target(&self, id: PoolId) -> Option<SurfaceId> {
        let target = self.targets.get(&id).copied();
        if target.is_none() {
            warn!("No target registered for pool {}", id);
        }
        target
    }

    pub fn register_target(&mut self, pool_id: PoolId, surface: SurfaceId) {
        if let Some(pool) = self.pools.get_mut(&pool_id) {
            pool.mark_registered();
        }
        if let Some(previous) = self.targets.insert(pool_id, surface) {
            if previous != surface {
                warn!(
                    "Pool {} moved from surface {:?} to {:?}",
                    pool_id, previous, surface
                );
            }
        }
    }

    pub fn unregister_target(&mut self, pool_id: PoolId) {
        self.targets.remove(&pool_id);
    }

    /// Client that minted `pool_id`, while the pool is live or retired and
    /// that client is connected.
    pub fn owner(&self, pool_id: PoolId) -> Option<ClientId> {
        self.owners.get(&pool_id).copied()
    }

    /// Purge a pool and stop accepting traffic for it.
    ///
    /// Buffers still held by the presentation keep the pool around in the
    /// retired set until each of them is released.
    pub fn destroy_pool(&mut self, id: PoolId) {
        self.unregister_target(id);
        let Some(mut pool) = self.pools.remove(&id) else {
            debug!("Pool {} already destroyed", id);
            return;
        };
        pool.purge();
        if pool.is_drained() {
            debug!("Destroyed pool {}", id);
            self.owners.remove(&id);
        } else {
            debug!("Retired pool {} with buffers still presented", id);
            self.retired.insert(id, pool);
        }
    }

    /// Tear down everything a disconnected client owned.
    pub fn destroy_client_pools(&mut self, client: ClientId) -> Vec<PoolId> {
        let owned: Vec<PoolId> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == client)
            .map(|(id, _)| *id)
            .collect();
        for id in &owned {
            self.destroy_pool(*id);
            self.owners.remove(id);
        }
        owned
    }

    /// Hand a presented buffer back to its pool.
    pub(crate) fn release(
        &mut self,
        pool_id: PoolId,
        buffer_id: BufferId,
    ) -> Option<(ClientId, ReleaseOutcome)> {
        if let Some(pool) = self.pools.get_mut(&pool_id) {
            return Some((pool.client(), pool.release(buffer_id)));
        }

        let pool = self.retired.get_mut(&pool_id)?;
        let outcome = pool.release(buffer_id);
        let client = pool.client();
        if pool.is_drained() {
            debug!("Retired pool {} drained", pool_id);
            self.retired.remove(&pool_id);
            self.owners.remove(&pool_id);
        }
        Some((client, outcome))
    }

    /// Live pools.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Destroyed pools still waiting on presented buffers.
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Pools whose owner is still tracked.
    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bufferlink_ipc::NativeHandle;
    use std::os::unix::net::UnixStream;

    fn handle() -> NativeHandle {
        let (ours, _) = UnixStream::pair().unwrap();
        NativeHandle::from_fd(ours.into())
    }

    #[test]
    fn test_pool_ids_are_monotonic() {
        let mut registry = Registry::new();
        let first = registry.create_buffer_pool(ClientId(0));
        let second = registry.create_buffer_pool(ClientId(1));
        registry.destroy_pool(first);
        let third = registry.create_buffer_pool(ClientId(0));

        assert_eq!((first, second, third), (0, 1, 2));
        assert_eq!(registry.pool_count(), 2);
    }

    #[test]
    fn test_find_misses_return_none() {
        let mut registry = Registry::new();
        assert!(registry.find_buffer_pool(5).is_none());
        assert!(registry.find_target(5).is_none());
    }

    #[test]
    fn test_register_and_unregister_target() {
        let mut registry = Registry::new();
        let pool = registry.create_buffer_pool(ClientId(0));
        registry.register_target(pool, SurfaceId(3));

        assert_eq!(registry.find_target(pool), Some(SurfaceId(3)));
        assert!(registry.find_target(pool + 1).is_none());

        registry.unregister_target(pool);
        registry.unregister_target(pool);
        assert!(registry.find_target(pool).is_none());
    }

    #[test]
    fn test_destroyed_pool_waits_for_presented_buffers() {
        let mut registry = Registry::new();
        let id = registry.create_buffer_pool(ClientId(0));
        let pool = registry.find_buffer_pool(id).unwrap();
        pool.set_buffer(0, handle()).unwrap();
        pool.set_buffer(1, handle()).unwrap();
        pool.lock(1).unwrap();

        registry.destroy_pool(id);
        assert!(registry.find_buffer_pool(id).is_none());
        assert_eq!(registry.retired_count(), 1);

        assert_eq!(
            registry.release(id, 1),
            Some((ClientId(0), ReleaseOutcome::Destroyed))
        );
        assert_eq!(registry.retired_count(), 0);
        assert!(registry.release(id, 1).is_none());
    }

    #[test]
    fn test_owner_forgotten_once_pool_is_freed() {
        let mut registry = Registry::new();
        for _ in 0..100 {
            let id = registry.create_buffer_pool(ClientId(0));
            registry.destroy_pool(id);
        }
        assert_eq!(registry.owner_count(), 0);

        let id = registry.create_buffer_pool(ClientId(0));
        let pool = registry.find_buffer_pool(id).unwrap();
        pool.set_buffer(0, handle()).unwrap();
        pool.lock(0).unwrap();
        registry.destroy_pool(id);
        assert_eq!(registry.owner(id), Some(ClientId(0)));

        registry.release(id, 0);
        assert_eq!(registry.owner(id), None);
        assert_eq!(registry.owner_count(), 0);
    }

    #[test]
    fn test_register_target_marks_pool() {
        let mut registry = Registry::new();
        let id = registry.create_buffer_pool(ClientId(0));
        assert!(!registry.buffer_pool(id).unwrap().was_registered());

        registry.register_target(id, SurfaceId(0));
        registry.unregister_target(id);
        assert!(registry.buffer_pool(id).unwrap().was_registered());
        assert_eq!(registry.target(id), None);
    }

    #[test]
    fn test_client_teardown_destroys_only_its_pools() {
        let mut registry = Registry::new();
        let gone = registry.create_buffer_pool(ClientId(0));
        let kept = registry.create_buffer_pool(ClientId(1));
        registry.register_target(gone, SurfaceId(0));

        assert_eq!(registry.destroy_client_pools(ClientId(0)), vec![gone]);
        assert!(registry.buffer_pool(gone).is_none());
        assert!(registry.buffer_pool(kept).is_some());
        assert!(registry.find_target(gone).is_none());
        assert_eq!(registry.owner(gone), None);
        assert_eq!(registry.owner(kept), Some(ClientId(1)));
    }
}
