// src/renderer/storage/buffer_pool.rs
use std::collections::HashMap;

use crate::error::RasterResult;
use crate::gpu::{BufferId, BufferKind, GpuContext};

const MIN_POOLED_SIZE: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PooledBuffer {
    pub id: BufferId,
    pub kind: BufferKind,
    pub size: u64,
}

/// Recycles dynamic buffers across frames, bucketed by kind and the next
/// power-of-two size.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: HashMap<(BufferKind, u64), Vec<BufferId>>,
    released: Vec<PooledBuffer>,
    allocated: usize,
}

impl BufferPool {
    pub fn bucket_size(min_size: u64) -> u64 {
        min_size.max(MIN_POOLED_SIZE).next_power_of_two()
    }

    pub fn acquire(
        &mut self,
        ctx: &mut dyn GpuContext,
        kind: BufferKind,
        min_size: u64,
    ) -> RasterResult<PooledBuffer> {
        let size = Self::bucket_size(min_size);
        if let Some(id) = self.free.get_mut(&(kind, size)).and_then(Vec::pop) {
            return Ok(PooledBuffer { id, kind, size });
        }

        let id = ctx.create_buffer(kind, size)?;
        self.allocated += 1;
        log::debug!("Allocated pooled {:?} buffer of {} bytes", kind, size);
        Ok(PooledBuffer { id, kind, size })
    }

    /// Hands a buffer back. It becomes reusable after [`Self::end_frame`],
    /// since draws recorded this frame may still reference it.
    pub fn release(&mut self, buffer: PooledBuffer) {
        self.released.push(buffer);
    }

    pub fn end_frame(&mut self) {
        for buffer in self.released.drain(..) {
            self.free
                .entry((buffer.kind, buffer.size))
                .or_default()
                .push(buffer.id);
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn free_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessContext;

    #[test]
    fn sizes_round_up_to_power_of_two() {
        assert_eq!(BufferPool::bucket_size(1), 256);
        assert_eq!(BufferPool::bucket_size(257), 512);
        assert_eq!(BufferPool::bucket_size(4096), 4096);
    }

    #[test]
    fn released_buffers_are_reused_after_frame_end() {
        let mut ctx = HeadlessContext::new(8, 8);
        let mut pool = BufferPool::default();

        let first = pool.acquire(&mut ctx, BufferKind::Instance, 300).expect("buffer");
        pool.release(first);

        let second = pool.acquire(&mut ctx, BufferKind::Instance, 400).expect("buffer");
        assert_ne!(first.id, second.id, "buffers released this frame stay in flight");
        pool.release(second);

        pool.end_frame();
        let reused = pool.acquire(&mut ctx, BufferKind::Instance, 512).expect("buffer");
        assert!(reused.id == first.id || reused.id == second.id);
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.free_count(), 1);
    }
}
