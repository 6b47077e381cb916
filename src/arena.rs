use crate::dtype::DType;
use crate::tensor::{Storage, Tensor};
use std::collections::HashMap;
use std::sync::Arc;

/// Default chunk capacity in elements (64 Mi).
pub const ARENA_SIZE: usize = 64 * 1024 * 1024;

/// Counters describing how the arena has been used. Tests observe batching
/// behavior through these (one batched op allocates once, however many
/// originals it stands in for).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Number of tensors handed out of arena chunks.
    pub allocations: usize,
    /// Number of chunks opened.
    pub chunks_opened: usize,
    /// Number of requests too large for a chunk, served standalone.
    pub bypassed: usize,
}

struct Chunk {
    buf: Arc<Storage>,
    used: usize,
}

/// Bump allocator for tensor storage.
///
/// Allocations are monotonic: there is no free list, and a chunk whose
/// remainder cannot hold a request is abandoned for a fresh one. Chunks are
/// released when the allocator (and the engine owning it) is dropped. One
/// chunk sequence is kept per dtype.
pub struct ArenaAllocator {
    capacity: usize,
    chunks: HashMap<DType, Chunk>,
    stats: ArenaStats,
}

impl ArenaAllocator {
    pub fn new() -> ArenaAllocator {
        ArenaAllocator::with_capacity(ARENA_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> ArenaAllocator {
        ArenaAllocator {
            capacity,
            chunks: HashMap::new(),
            stats: ArenaStats::default(),
        }
    }

    pub fn stats(&self) -> ArenaStats {
        self.stats
    }

    /// Returns a tensor over a fresh sub-range of the current chunk.
    ///
    /// Requests larger than a whole chunk bypass the arena and get their own
    /// storage.
    pub fn allocate(&mut self, shape: &[usize], dtype: DType) -> Tensor {
        let len: usize = shape.iter().product();
        if len > self.capacity {
            self.stats.bypassed += 1;
            return Tensor::zeros(shape, dtype);
        }
        let capacity = self.capacity;
        let mut opened = 0usize;
        let chunk = self.chunks.entry(dtype).or_insert_with(|| {
            opened += 1;
            Chunk {
                buf: Storage::zeroed(capacity),
                used: 0,
            }
        });
        if len > capacity - chunk.used {
            // abandon the remainder and start over
            chunk.buf = Storage::zeroed(capacity);
            chunk.used = 0;
            opened += 1;
        }
        let offset = chunk.used;
        chunk.used += len;
        self.stats.allocations += 1;
        self.stats.chunks_opened += opened;
        Tensor::view_of(chunk.buf.clone(), offset, shape.to_vec(), dtype)
    }
}

impl Default for ArenaAllocator {
    fn default() -> Self {
        ArenaAllocator::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_allocation_shares_chunk() {
        let mut arena = ArenaAllocator::with_capacity(16);
        let a = arena.allocate(&[4], DType::F32);
        let b = arena.allocate(&[2, 3], DType::F32);
        assert_eq!(a.shape(), &[4]);
        assert_eq!(b.shape(), &[2, 3]);
        let s = arena.stats();
        assert_eq!(s.allocations, 2);
        assert_eq!(s.chunks_opened, 1);
        // writes to one allocation must not disturb the other
        a.set_all(1.0);
        b.set_all(2.0);
        assert!(a.to_array().iter().all(|&x| x == 1.0));
        assert!(b.to_array().iter().all(|&x| x == 2.0));
    }

    #[test]
    fn test_residue_abandoned_when_chunk_full() {
        let mut arena = ArenaAllocator::with_capacity(8);
        let _a = arena.allocate(&[6], DType::F32);
        let _b = arena.allocate(&[5], DType::F32); // does not fit the residue
        assert_eq!(arena.stats().chunks_opened, 2);
        assert_eq!(arena.stats().allocations, 2);
    }

    #[test]
    fn test_oversized_request_bypasses_arena() {
        let mut arena = ArenaAllocator::with_capacity(8);
        let big = arena.allocate(&[3, 5], DType::F32);
        assert_eq!(big.len(), 15);
        assert_eq!(arena.stats().bypassed, 1);
        assert_eq!(arena.stats().allocations, 0);
    }

    #[test]
    fn test_chunks_are_per_dtype() {
        let mut arena = ArenaAllocator::with_capacity(8);
        let _a = arena.allocate(&[4], DType::F32);
        let _b = arena.allocate(&[4], DType::F16);
        assert_eq!(arena.stats().chunks_opened, 2);
    }
}
