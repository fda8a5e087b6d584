//! Fixed-size chunk pools over reserved virtual ranges.
//!
//! A pool hands out virtual address tokens; it never touches page tables itself. Backing the
//! chunks is up to the caller (see [`Regions`](crate::Regions)). Pools are created once and live
//! for the lifetime of the kernel.

use alloc::boxed::Box;

use crate::{Bitmap, Bugcode, MemoryError, VirtualAddress, fatal};

struct PoolState {
    chunks: Bitmap<Box<[u32]>>,
    used: usize,
}

pub struct Pool {
    name: &'static str,
    base: VirtualAddress,
    chunk_size: usize,
    size: usize,
    state: spin::Mutex<PoolState>,
}

impl Pool {
    /// Creates a pool of `size / chunk_size` chunks starting at `base`.
    ///
    /// `size` must be a non-zero multiple of `chunk_size`.
    pub fn new(
        name: &'static str,
        chunk_size: usize,
        size: usize,
        base: VirtualAddress,
    ) -> Result<Self, MemoryError> {
        if chunk_size == 0 || size == 0 || size % chunk_size != 0 {
            return Err(MemoryError::InvalidArgument);
        }
        if base.checked_add(size).is_none() {
            return Err(MemoryError::InvalidRange);
        }

        log::debug!(
            "pool {}: {} chunks of {:#x} bytes at {}",
            name,
            size / chunk_size,
            chunk_size,
            base
        );

        Ok(Self {
            name,
            base,
            chunk_size,
            size,
            state: spin::Mutex::new(PoolState {
                chunks: Bitmap::new_boxed(size / chunk_size),
                used: 0,
            }),
        })
    }

    /// Like [`new`](Self::new), but a misconfigured pool stops the system.
    pub fn create(name: &'static str, chunk_size: usize, size: usize, base: VirtualAddress) -> Self {
        match Self::new(name, chunk_size, size, base) {
            Ok(pool) => pool,
            Err(err) => fatal(
                Bugcode::PoolMisconfigured,
                "pool",
                format_args!("{name}: size {size:#x} / chunk {chunk_size:#x} at {base}: {err}"),
            ),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total bytes covered by the pool.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.size / self.chunk_size
    }

    /// Bytes currently handed out.
    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    pub fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.base && address - self.base < self.size
    }

    /// Chunks needed to cover `bytes`.
    pub fn chunks_for(&self, bytes: usize) -> usize {
        bytes.div_ceil(self.chunk_size)
    }

    pub fn allocate_chunk(&self) -> Result<VirtualAddress, MemoryError> {
        self.allocate_chunks(1)
    }

    /// Allocates `count` adjacent chunks.
    ///
    /// Exhaustion is reported, not fatal; callers decide whether they can live without.
    pub fn allocate_chunks(&self, count: usize) -> Result<VirtualAddress, MemoryError> {
        if count == 0 {
            return Err(MemoryError::InvalidArgument);
        }
        let mut state = self.state.lock();
        let Some(first) = state.chunks.first_clear_run(count) else {
            log::warn!(
                "pool {}: cannot satisfy {} chunks ({:#x}/{:#x} bytes used)",
                self.name,
                count,
                state.used,
                self.size
            );
            return Err(MemoryError::PoolExhausted);
        };
        for chunk in first..first + count {
            state.chunks.set(chunk);
        }
        state.used += count * self.chunk_size;
        Ok(self.base + first * self.chunk_size)
    }

    pub fn free_chunk(&self, address: VirtualAddress) -> Result<(), MemoryError> {
        self.free_chunks(address, 1)
    }

    /// Returns `count` chunks starting at `address`.
    ///
    /// Addresses outside the pool, not on a chunk boundary, or not currently allocated are
    /// logged and ignored.
    pub fn free_chunks(&self, address: VirtualAddress, count: usize) -> Result<(), MemoryError> {
        if !self.contains(address) || (address - self.base) + count * self.chunk_size > self.size {
            log::warn!("pool {}: ignoring free of {} outside the pool", self.name, address);
            return Err(MemoryError::InvalidRange);
        }
        let offset = address - self.base;
        if offset % self.chunk_size != 0 {
            log::warn!("pool {}: ignoring free of unaligned chunk {}", self.name, address);
            return Err(MemoryError::BadAlignment);
        }

        let first = offset / self.chunk_size;
        let mut state = self.state.lock();
        if (first..first + count).any(|chunk| !state.chunks.test(chunk)) {
            log::warn!("pool {}: ignoring free of unallocated chunk {}", self.name, address);
            return Err(MemoryError::NotAllocated);
        }
        for chunk in first..first + count {
            state.chunks.clear(chunk);
        }
        state.used -= count * self.chunk_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    fn setup(chunks: usize) -> Pool {
        Pool::new("test", PAGE_SIZE, chunks * PAGE_SIZE, VirtualAddress::new(0xF000_0000)).unwrap()
    }

    #[test]
    fn exactly_capacity_allocations_succeed() {
        let pool = setup(7);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..7 {
            let chunk = pool.allocate_chunk().unwrap();
            assert!(pool.contains(chunk));
            assert!(seen.insert(chunk));
        }
        assert_eq!(pool.allocate_chunk(), Err(MemoryError::PoolExhausted));
        assert_eq!(pool.used(), pool.size());
    }

    #[test]
    fn runs_are_first_fit() {
        let pool = setup(10);
        let a = pool.allocate_chunks(3).unwrap();
        let b = pool.allocate_chunks(2).unwrap();
        assert_eq!(a, pool.base());
        assert_eq!(b, pool.base() + 3 * PAGE_SIZE);
        pool.free_chunks(a, 3).unwrap();
        // The hole before `b` is too small for four.
        assert_eq!(pool.allocate_chunks(4), Ok(pool.base() + 5 * PAGE_SIZE));
        assert_eq!(pool.allocate_chunks(3), Ok(a));
        assert_eq!(pool.used(), 9 * PAGE_SIZE);
        assert_eq!(pool.allocate_chunks(2), Err(MemoryError::PoolExhausted));
    }

    #[test]
    fn bad_frees_are_rejected() {
        let pool = setup(4);
        let chunk = pool.allocate_chunk().unwrap();
        assert_eq!(pool.free_chunk(chunk + 1), Err(MemoryError::BadAlignment));
        assert_eq!(
            pool.free_chunk(VirtualAddress::new(0x1000)),
            Err(MemoryError::InvalidRange)
        );
        assert_eq!(pool.free_chunks(chunk, 5), Err(MemoryError::InvalidRange));
        assert_eq!(pool.free_chunk(chunk + PAGE_SIZE), Err(MemoryError::NotAllocated));
        assert_eq!(pool.used(), PAGE_SIZE);
        pool.free_chunk(chunk).unwrap();
        assert_eq!(pool.free_chunk(chunk), Err(MemoryError::NotAllocated));
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn size_must_be_multiple_of_chunk() {
        let base = VirtualAddress::new(0xF000_0000);
        assert_eq!(
            Pool::new("bad", PAGE_SIZE, PAGE_SIZE + 1, base).err(),
            Some(MemoryError::InvalidArgument)
        );
        assert_eq!(Pool::new("bad", 0, PAGE_SIZE, base).err(), Some(MemoryError::InvalidArgument));
    }

    #[test]
    #[should_panic(expected = "POOL_MISCONFIGURED")]
    fn misconfigured_pool_is_fatal() {
        Pool::create("dma", PAGE_SIZE, 3 * PAGE_SIZE + 16, VirtualAddress::new(0xF000_0000));
    }
}
