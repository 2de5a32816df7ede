//! Buffer allocation for render targets.

use std::io;

use bitflags::bitflags;
use bufferlink_ipc::NativeHandle;
use nix::sys::memfd::{MFdFlags, memfd_create};
use nix::unistd::ftruncate;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Pixel layout of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferFormat {
    #[default]
    Rgba8888,
    Rgbx8888,
    Rgb565,
}

impl BufferFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            BufferFormat::Rgba8888 | BufferFormat::Rgbx8888 => 4,
            BufferFormat::Rgb565 => 2,
        }
    }
}

bitflags! {
    /// How a buffer will be accessed. Bit values follow the platform
    /// hardware-buffer usage flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u64 {
        const CPU_WRITE_OFTEN = 0x30;
        const GPU_SAMPLED_IMAGE = 0x100;
        const GPU_FRAMEBUFFER = 0x200;
        const COMPOSER_OVERLAY = 0x800;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub format: BufferFormat,
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    /// A single-layer buffer rendered by the GPU and scanned out by the compositor.
    pub fn render_target(width: u32, height: u32, format: BufferFormat) -> Self {
        Self {
            width,
            height,
            layers: 1,
            format,
            usage: BufferUsage::GPU_FRAMEBUFFER
                | BufferUsage::GPU_SAMPLED_IMAGE
                | BufferUsage::COMPOSER_OVERLAY,
        }
    }

    pub fn byte_size(&self) -> u64 {
        u64::from(self.width)
            * u64::from(self.height)
            * u64::from(self.layers)
            * u64::from(self.format.bytes_per_pixel())
    }
}

/// Source of buffer handles for a render target (a GPU allocator in
/// production, shared memory for the loopback runner and tests).
pub trait BufferAllocator {
    fn allocate(&mut self, descriptor: &BufferDescriptor) -> io::Result<NativeHandle>;
}

/// Allocates buffers as anonymous shared memory.
#[derive(Debug, Default)]
pub struct MemfdAllocator {
    allocated: usize,
}

impl MemfdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers handed out so far.
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

impl BufferAllocator for MemfdAllocator {
    fn allocate(&mut self, descriptor: &BufferDescriptor) -> io::Result<NativeHandle> {
        let size = nix::libc::off_t::try_from(descriptor.byte_size())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "buffer too large"))?;
        let fd = memfd_create("bufferlink-buffer", MFdFlags::MFD_CLOEXEC)?;
        ftruncate(&fd, size)?;

        self.allocated += 1;
        debug!(
            "Allocated {}x{} {:?} buffer ({} bytes)",
            descriptor.width,
            descriptor.height,
            descriptor.format,
            size
        );
        Ok(NativeHandle::from_fd(fd))
    }
}
