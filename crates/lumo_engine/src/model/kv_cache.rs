//! Per-model key/value cache in device memory.

use anyhow::{bail, Result};
use ocl::Buffer;

use crate::device::Gpu;
use crate::memory;

/// Two half-float buffers of shape [capacity, heads, head_dim] plus the
/// filled-position count. Append is monotone; `reset` only clears the count.
pub struct KvCache {
    pub k: Buffer<u16>,
    pub v: Buffer<u16>,
    pub length: usize,
    pub capacity: usize,
    row_elems: usize,
}

impl KvCache {
    pub fn new(gpu: &Gpu, capacity: usize, num_heads: usize, head_dim: usize) -> Result<Self> {
        let row_elems = num_heads * head_dim;
        let len = capacity * row_elems;
        let k = memory::create_buffer::<u16>(gpu, len, ocl::flags::MEM_READ_WRITE)?;
        let v = memory::create_buffer::<u16>(gpu, len, ocl::flags::MEM_READ_WRITE)?;
        Ok(Self { k, v, length: 0, capacity, row_elems })
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.length
    }

    pub fn reset(&mut self) {
        self.length = 0;
    }

    /// Enqueue a copy of `seq_len` freshly projected K/V rows onto the end of
    /// the cache. The copy rides the in-order queue, so the attention
    /// dispatch that follows observes it without explicit synchronization.
    pub fn append(&mut self, new_k: &Buffer<u16>, new_v: &Buffer<u16>, seq_len: usize) -> Result<()> {
        if self.length + seq_len > self.capacity {
            bail!(
                "KV-cache overflow: {} + {} exceeds capacity {}",
                self.length,
                seq_len,
                self.capacity
            );
        }
        let dst = self.length * self.row_elems;
        let len = seq_len * self.row_elems;
        new_k.copy(&self.k, Some(dst), Some(len)).enq()?;
        new_v.copy(&self.v, Some(dst), Some(len)).enq()?;
        self.length += seq_len;
        Ok(())
    }
}
