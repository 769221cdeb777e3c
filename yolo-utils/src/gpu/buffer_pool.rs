use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::gpu::GpuContext;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BufferPoolError {
    #[error(
        "GPU memory limit exceeded (allocation size: {size}, current usage: {usage}, limit: {limit})"
    )]
    MemoryLimitExceeded { size: u64, usage: u64, limit: u64 },
    #[error("GPU buffer of {size} bytes exceeds the device maximum of {max}")]
    TooLarge { size: u64, max: u64 },
}

struct BufferEntry {
    buffer: wgpu::Buffer,
    size: u64,
}

/// Best-fit pool for `wgpu::Buffer` allocations keyed by usage flags.
///
/// `memory_usage` counts every byte allocated through the pool that has not
/// been released with [`GpuBufferPool::clear`] or [`GpuBufferPool::forget`].
pub struct GpuBufferPool {
    context: Arc<GpuContext>,
    idle: Mutex<HashMap<wgpu::BufferUsages, Vec<BufferEntry>>>,
    allocated_bytes: AtomicU64,
    max_memory: Option<u64>,
}

impl GpuBufferPool {
    pub fn new(context: Arc<GpuContext>, max_memory: Option<u64>) -> Self {
        Self {
            context,
            idle: Mutex::new(HashMap::new()),
            allocated_bytes: AtomicU64::new(0),
            max_memory,
        }
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    /// Reuse the smallest idle buffer that fits or allocate a new one.
    pub fn acquire(
        &self,
        size: u64,
        usage: wgpu::BufferUsages,
        label: Option<&str>,
    ) -> Result<wgpu::Buffer, BufferPoolError> {
        if let Some(entry) = self.take_best_fit(size, usage) {
            return Ok(entry.buffer);
        }

        let max = self.context.limits().max_buffer_size;
        if size > max {
            return Err(BufferPoolError::TooLarge { size, max });
        }

        if let Some(limit) = self.max_memory
            && self.memory_usage() + size > limit
        {
            // Idle buffers are the only memory we can give back.
            self.clear();
            let usage_after_clear = self.memory_usage();
            if usage_after_clear + size > limit {
                return Err(BufferPoolError::MemoryLimitExceeded {
                    size,
                    usage: usage_after_clear,
                    limit,
                });
            }
        }

        let buffer = self
            .context
            .device()
            .create_buffer(&wgpu::BufferDescriptor {
                label,
                size,
                usage,
                mapped_at_creation: false,
            });
        self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(buffer)
    }

    /// Return a buffer so later acquisitions can reuse it.
    pub fn recycle(&self, buffer: wgpu::Buffer, size: u64, usage: wgpu::BufferUsages) {
        self.lock_idle()
            .entry(usage)
            .or_default()
            .push(BufferEntry { buffer, size });
    }

    /// Stop accounting for a buffer the caller dropped instead of recycling.
    pub fn forget(&self, size: u64) {
        let _ = self
            .allocated_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(size))
            });
    }

    /// Number of idle buffers across all usages.
    pub fn available(&self) -> usize {
        self.lock_idle().values().map(Vec::len).sum()
    }

    /// Bytes currently allocated through this pool (idle or in use).
    pub fn memory_usage(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Drop every idle buffer and release its bytes from the accounting.
    pub fn clear(&self) {
        let freed: u64 = {
            let mut idle = self.lock_idle();
            let freed = idle.values().flatten().map(|entry| entry.size).sum();
            idle.clear();
            freed
        };
        self.forget(freed);
    }

    fn take_best_fit(&self, size: u64, usage: wgpu::BufferUsages) -> Option<BufferEntry> {
        let mut idle = self.lock_idle();
        let buffers = idle.get_mut(&usage)?;
        let index = buffers
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.size >= size)
            .min_by_key(|(_, entry)| entry.size)
            .map(|(index, _)| index)?;
        Some(buffers.swap_remove(index))
    }

    fn lock_idle(&self) -> MutexGuard<'_, HashMap<wgpu::BufferUsages, Vec<BufferEntry>>> {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for GpuBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBufferPool")
            .field("idle_buffers", &self.available())
            .field("memory_usage", &self.memory_usage())
            .field("max_memory", &self.max_memory)
            .finish()
    }
}
