//! Tiered pool of connection data buffers
//!
//! Buffers are grouped into power-of-two size bands starting at
//! [`MIN_BUFFER_SIZE`]. Buffers that grew past [`POOL_CUTOFF_BUFFER_SIZE`]
//! are dropped instead of retained.

use std::sync::OnceLock;

use parking_lot::Mutex;

/// Smallest buffer handed out.
pub const MIN_BUFFER_SIZE: usize = 8 * 1024;
/// Largest buffer kept for reuse.
pub const POOL_CUTOFF_BUFFER_SIZE: usize = 1024 * 1024;
/// Buffers retained per band.
const MAX_BUFFERS_PER_TIER: usize = 512;

/// Size-banded buffer pool
pub struct BufferPool {
    tiers: Vec<Mutex<Vec<Vec<u8>>>>,
    min_size: usize,
    max_size: usize,
}

impl BufferPool {
    pub fn new(min_size: usize, max_size: usize) -> Self {
        let min_size = min_size.next_power_of_two();
        let max_size = max_size.next_power_of_two().max(min_size);
        let tier_count = (max_size / min_size).trailing_zeros() as usize + 1;
        let tiers = (0..tier_count).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            tiers,
            min_size,
            max_size,
        }
    }

    /// Process-wide pool shared by all connections.
    pub fn global() -> &'static BufferPool {
        static POOL: OnceLock<BufferPool> = OnceLock::new();
        POOL.get_or_init(|| BufferPool::new(MIN_BUFFER_SIZE, POOL_CUTOFF_BUFFER_SIZE))
    }

    /// Band that serves a request of `size` bytes.
    fn tier_for_request(&self, size: usize) -> Option<usize> {
        if size > self.max_size {
            return None;
        }
        let band = size.max(self.min_size).next_power_of_two();
        Some((band / self.min_size).trailing_zeros() as usize)
    }

    /// Band a returned buffer of `capacity` belongs to (rounded down).
    fn tier_for_capacity(&self, capacity: usize) -> Option<usize> {
        if capacity < self.min_size || capacity > self.max_size {
            return None;
        }
        let band = if capacity.is_power_of_two() {
            capacity
        } else {
            capacity.next_power_of_two() / 2
        };
        Some((band / self.min_size).trailing_zeros() as usize)
    }

    /// Get a zero-length buffer with at least `size` bytes of capacity.
    pub fn get(&self, size: usize) -> Vec<u8> {
        match self.tier_for_request(size) {
            Some(tier) => {
                let recycled = self.tiers[tier].lock().pop();
                match recycled {
                    Some(mut buf) => {
                        buf.clear();
                        buf
                    }
                    None => Vec::with_capacity(self.min_size << tier),
                }
            }
            None => Vec::with_capacity(size),
        }
    }

    /// Return a buffer; oversized buffers are released.
    pub fn put(&self, buf: Vec<u8>) {
        if let Some(tier) = self.tier_for_capacity(buf.capacity()) {
            let mut slot = self.tiers[tier].lock();
            if slot.len() < MAX_BUFFERS_PER_TIER {
                slot.push(buf);
            }
        }
    }

    /// Buffers currently retained, across all bands.
    pub fn retained(&self) -> usize {
        self.tiers.iter().map(|t| t.lock().len()).sum()
    }
}
