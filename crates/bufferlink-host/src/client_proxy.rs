//! Host side of one producer connection.

use std::collections::HashMap;

use bufferlink_ipc::{
    BufferId, DispatchStatus, Frame, Host, Message, NativeHandle, PoolId, SyncFence,
};
use tracing::{debug, warn};

use crate::registry::Registry;
use crate::surface::Surface;
use crate::{ClientId, SurfaceId};

pub(crate) struct ClientProxy {
    id: ClientId,
    endpoint: Host,
}

impl ClientProxy {
    pub(crate) fn new(id: ClientId, endpoint: Host) -> Self {
        Self { id, endpoint }
    }

    pub(crate) fn endpoint(&self) -> &Host {
        &self.endpoint
    }

    pub(crate) fn endpoint_mut(&mut self) -> &mut Host {
        &mut self.endpoint
    }

    pub(crate) fn dispatch(
        &mut self,
        registry: &mut Registry,
        surfaces: &mut HashMap<SurfaceId, Surface>,
    ) -> DispatchStatus {
        let id = self.id;
        self.endpoint.dispatch(|endpoint, frame| {
            handle_message(id, endpoint, registry, surfaces, frame)
        })
    }
}

fn handle_message(
    client: ClientId,
    endpoint: &Host,
    registry: &mut Registry,
    surfaces: &mut HashMap<SurfaceId, Surface>,
    frame: Frame,
) {
    let message = match Message::decode(&frame) {
        Ok(message) => message,
        Err(err) => {
            warn!("Client {:?} sent a bad frame: {}", client, err);
            return;
        }
    };

    match message {
        Message::PoolConstruction => {
            let pool_id = registry.create_buffer_pool(client);
            endpoint.send_message(&Message::PoolConstructionReply { pool_id });
        }
        Message::PoolPurge { pool_id } => match owned_pool(registry, client, pool_id) {
            Some(pool) => {
                debug!("Purging pool {}", pool_id);
                pool.purge();
            }
            None => debug!("Ignoring purge of stale pool {}", pool_id),
        },
        Message::BufferAllocation { pool_id, buffer_id } => {
            // The descriptor is always consumed so the stream stays in step.
            let handle = match endpoint.receive_fd() {
                Ok(fd) => NativeHandle::from_fd(fd),
                Err(err) => {
                    warn!(
                        "No handle for pool {} buffer {}: {}",
                        pool_id, buffer_id, err
                    );
                    return;
                }
            };
            match owned_pool(registry, client, pool_id) {
                Some(pool) => {
                    if let Err(err) = pool.set_buffer(buffer_id, handle) {
                        warn!("Dropping allocation for pool {}: {}", pool_id, err);
                    }
                }
                None => debug!(
                    "Freeing buffer {} allocated into stale pool {}",
                    buffer_id, pool_id
                ),
            }
        }
        Message::BufferCommit {
            pool_id,
            buffer_id,
            has_fence,
        } => {
            let fence = if has_fence {
                match endpoint.receive_fd() {
                    Ok(fd) => Some(SyncFence::from_fd(fd)),
                    Err(err) => {
                        warn!("Fence for pool {} buffer {} lost: {}", pool_id, buffer_id, err);
                        None
                    }
                }
            } else {
                None
            };
            commit(client, registry, surfaces, pool_id, buffer_id, fence);
        }
        other => warn!("Client {:?} sent {:?}, which only the host emits", client, other),
    }
}

fn owned_pool(
    registry: &mut Registry,
    client: ClientId,
    pool_id: PoolId,
) -> Option<&mut crate::buffer::BufferPool> {
    let pool = registry.find_buffer_pool(pool_id)?;
    if pool.client() != client {
        warn!("Client {:?} named pool {} it does not own", client, pool_id);
        return None;
    }
    Some(pool)
}

fn commit(
    client: ClientId,
    registry: &mut Registry,
    surfaces: &mut HashMap<SurfaceId, Surface>,
    pool_id: PoolId,
    buffer_id: BufferId,
    fence: Option<SyncFence>,
) {
    let target = registry.target(pool_id);
    let Some(pool) = owned_pool(registry, client, pool_id) else {
        debug!("Dropping commit of buffer {} to stale pool {}", buffer_id, pool_id);
        return;
    };

    let Some(surface) = target.and_then(|id| surfaces.get_mut(&id)) else {
        // Registration travels on the surface socket and can trail the
        // commit. Only a pool whose surface went away drops its frames.
        if !pool.was_registered() {
            if pool.park(buffer_id, fence) {
                debug!(
                    "Holding pool {} buffer {} until its surface registers",
                    pool_id, buffer_id
                );
            } else {
                warn!("Commit for empty slot {} of pool {}", buffer_id, pool_id);
            }
            return;
        }
        warn!(
            "Pool {} has no surface, freeing committed buffer {}",
            pool_id, buffer_id
        );
        drop(pool.release_slot(buffer_id));
        return;
    };

    match pool.lock(buffer_id) {
        Some(buffer) => {
            debug!(
                "Presenting pool {} buffer {} on surface {:?}",
                pool_id,
                buffer_id,
                surface.id()
            );
            surface.presentation().on_buffer_ready(buffer, fence);
        }
        None => warn!("Commit for empty slot {} of pool {}", buffer_id, pool_id),
    }
}
