//! Renderer host and a synthetic producer wired together in one process.
//!
//! The host runs on the calling thread; the producer gets its own thread and
//! talks to the host only through the descriptors the host hands out, exactly
//! as a separate process would.

use std::cell::Cell;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileExt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result, anyhow};
use bufferlink_client::{MemfdAllocator, RendererBackend, TargetListener};
use bufferlink_host::{Buffer, Presentation, RendererHost};
use bufferlink_ipc::{BufferId, NativeHandle, PoolId, SyncFence};
use tracing::{debug, info, warn};

use crate::config::Config;

/// What a loopback run achieved
#[derive(Debug, Default, Clone, Copy)]
pub struct Summary {
    /// Buffers handed to the presentation by the host.
    pub presented: u32,
    /// Frame completions seen by the producer.
    pub displayed: u32,
}

struct Presented {
    pool_id: PoolId,
    buffer_id: BufferId,
}

/// Presentation that "shows" a buffer by reporting it back to the host loop.
struct ChannelPresentation {
    presented: mpsc::Sender<Presented>,
}

impl Presentation for ChannelPresentation {
    fn on_buffer_ready(&mut self, buffer: &Buffer, fence: Option<SyncFence>) {
        // CPU-written shared memory, the fence is only carried through.
        drop(fence);
        let presented = Presented {
            pool_id: buffer.pool_id(),
            buffer_id: buffer.buffer_id(),
        };
        if self.presented.send(presented).is_err() {
            warn!("Host loop gone, buffer {} stays locked", buffer.buffer_id());
        }
    }

    fn on_frame_displayed(&mut self, pool_id: PoolId) {
        debug!("Frame of pool {} displayed", pool_id);
    }
}

struct DisplayCounter(Rc<Cell<u32>>);

impl TargetListener for DisplayCounter {
    fn buffer_attached(&mut self, buffer_id: BufferId, _handle: &NativeHandle) {
        debug!("Producer attached buffer {}", buffer_id);
    }

    fn frame_displayed(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

/// Run the host loop until the producer finishes or `shutdown` is raised.
pub fn run(config: &Config, shutdown: Arc<AtomicBool>) -> Result<Summary> {
    let mut host = RendererHost::new().context("Failed to create renderer host")?;
    let (presented_tx, presented_rx) = mpsc::channel();
    let surface = host
        .create_surface(Box::new(ChannelPresentation {
            presented: presented_tx,
        }))
        .context("Failed to create surface")?;
    let client_fd = host.create_client().context("Failed to create client")?;
    let surface_fd = host
        .release_surface_fd(surface)
        .context("Surface has no descriptor to hand out")?;

    let producer_config = config.clone();
    let producer_shutdown = shutdown.clone();
    let producer = thread::Builder::new()
        .name("bufferlink-producer".into())
        .spawn(move || produce(&producer_config, client_fd, surface_fd, &producer_shutdown))
        .context("Failed to spawn producer thread")?;

    let timeout = config.transport.poll_timeout();
    let mut summary = Summary::default();
    while !producer.is_finished() {
        host.dispatch(Some(timeout))?;
        while let Ok(Presented { pool_id, buffer_id }) = presented_rx.try_recv() {
            summary.presented += 1;
            host.frame_displayed(surface, pool_id);
            host.release_buffer(pool_id, buffer_id);
        }
    }

    summary.displayed = producer
        .join()
        .map_err(|_| anyhow!("Producer thread panicked"))??;
    host.destroy_surface(surface);
    info!(
        "Loopback finished: {} presented, {} displayed",
        summary.presented, summary.displayed
    );
    Ok(summary)
}

fn produce(
    config: &Config,
    host_fd: OwnedFd,
    surface_fd: OwnedFd,
    shutdown: &AtomicBool,
) -> Result<u32> {
    let mut backend = RendererBackend::new(host_fd, Box::new(MemfdAllocator::new()))
        .context("Failed to connect to renderer host")?
        .with_format(config.producer.format);
    let displayed = Rc::new(Cell::new(0));
    let target = backend.create_target(surface_fd, Box::new(DisplayCounter(displayed.clone())))?;

    let (mut width, mut height) = (config.surface.width, config.surface.height);
    backend.initialize_target(target, width, height)?;
    let timeout = config.transport.poll_timeout();
    let resize_every = config.producer.resize_every;

    for frame in 0..config.producer.frames {
        if shutdown.load(Ordering::Relaxed) {
            info!("Producer stopping after {} frames", frame);
            break;
        }
        if resize_every > 0 && frame > 0 && frame % resize_every == 0 {
            width += 16;
            height += 16;
            backend.resize(target, width, height)?;
        }

        let handle = backend.frame_will_render(target)?;
        paint(handle, frame, width).context("Failed to draw frame")?;
        backend.frame_rendered(target, None)?;

        while displayed.get() <= frame && !shutdown.load(Ordering::Relaxed) {
            backend.dispatch(Some(timeout))?;
        }
        thread::sleep(config.producer.frame_interval());
    }

    backend.destroy_target(target);
    Ok(displayed.get())
}

/// Stamp the first row of the buffer with a colour derived from the frame number.
fn paint(handle: &NativeHandle, frame: u32, width: u32) -> Result<()> {
    let file = File::from(handle.export()?);
    let pixel = frame.wrapping_mul(0x0101_0101) | 0xff00_0000;
    let row: Vec<u8> = (0..width).flat_map(|_| pixel.to_ne_bytes()).collect();
    file.write_all_at(&row, 0)?;
    Ok(())
}
