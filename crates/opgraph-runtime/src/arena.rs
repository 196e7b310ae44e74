//! A growable arena that hands out aligned byte ranges.
//!
//! Ranges are tracked as offsets until [`Allocator::base_ptr`] is called; at
//! that point a single zeroed buffer covering the high-water mark is created
//! and the arena stops accepting new allocations. Freed ranges are reused
//! best-fit and merged with free neighbours.

use std::collections::BTreeMap;
use std::ptr::NonNull;

use opgraph_ir::{AllocError, Allocator};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// The backing buffer is a `Vec<u64>`.
const MAX_ALIGNMENT: usize = std::mem::align_of::<u64>();

/// Arena configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Every offset and size is rounded up to this many bytes (a power of two, at most 8)
    pub alignment: usize,
    /// Upper bound on the arena size in bytes
    pub limit: Option<usize>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            alignment: 8,
            limit: None,
        }
    }
}

impl ArenaConfig {
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn check(&self) -> Result<(), String> {
        if !self.alignment.is_power_of_two() {
            return Err(format!(
                "arena alignment must be a power of two, got {}",
                self.alignment
            ));
        }
        if self.alignment > MAX_ALIGNMENT {
            return Err(format!(
                "arena alignment {} exceeds the backing buffer alignment of {}",
                self.alignment, MAX_ALIGNMENT
            ));
        }
        Ok(())
    }
}

/// Usage counters of an [`ArenaAllocator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    /// Bytes currently handed out (after alignment)
    pub used: usize,
    /// Highest offset ever handed out
    pub peak: usize,
    pub allocations: usize,
    pub frees: usize,
    /// Allocations served from a freed block
    pub reused: usize,
}

#[derive(Debug)]
pub struct ArenaAllocator {
    config: ArenaConfig,
    /// offset -> size of free blocks; none of them touches `top`
    free: BTreeMap<usize, usize>,
    /// offset -> size of live blocks
    live: BTreeMap<usize, usize>,
    /// End of the highest block ever handed out
    top: usize,
    stats: ArenaStats,
    buffer: Option<Vec<u64>>,
}

impl Default for ArenaAllocator {
    fn default() -> Self {
        Self::new(ArenaConfig::default())
    }
}

impl ArenaAllocator {
    pub fn new(config: ArenaConfig) -> Self {
        Self {
            config,
            free: BTreeMap::new(),
            live: BTreeMap::new(),
            top: 0,
            stats: ArenaStats::default(),
            buffer: None,
        }
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn stats(&self) -> ArenaStats {
        self.stats
    }

    pub fn peak_bytes(&self) -> usize {
        self.stats.peak
    }

    pub fn is_materialized(&self) -> bool {
        self.buffer.is_some()
    }

    /// Drops every block and the backing buffer.
    pub fn reset(&mut self) {
        self.free.clear();
        self.live.clear();
        self.top = 0;
        self.stats = ArenaStats::default();
        self.buffer = None;
    }

    /// `None` when rounding up overflows.
    fn align(&self, bytes: usize) -> Option<usize> {
        bytes.checked_next_multiple_of(self.config.alignment.max(1))
    }

    fn out_of_memory(&self, bytes: usize) -> AllocError {
        AllocError::OutOfMemory {
            requested: bytes,
            limit: self.config.limit.unwrap_or(usize::MAX),
        }
    }

    /// Smallest free block that fits `size`.
    fn best_fit(&self, size: usize) -> Option<(usize, usize)> {
        self.free
            .iter()
            .filter(|&(_, &len)| len >= size)
            .min_by_key(|&(&offset, &len)| (len, offset))
            .map(|(&offset, &len)| (offset, len))
    }

    fn insert_free(&mut self, mut offset: usize, mut size: usize) {
        // Merge with the preceding free block.
        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                offset = prev;
                size += prev_len;
            }
        }
        // Merge with the following free block.
        if let Some(&next_len) = self.free.get(&(offset + size)) {
            self.free.remove(&(offset + size));
            size += next_len;
        }
        // A free block touching the top just lowers it.
        if offset + size == self.top {
            self.top = offset;
            return;
        }
        self.free.insert(offset, size);
    }
}

impl Allocator for ArenaAllocator {
    fn alloc(&mut self, bytes: usize) -> Result<usize, AllocError> {
        if self.buffer.is_some() {
            return Err(AllocError::Materialized);
        }
        let size = self.align(bytes).ok_or_else(|| self.out_of_memory(bytes))?;
        if size == 0 {
            // Empty ranges occupy no bytes and are never tracked.
            self.stats.allocations += 1;
            return Ok(self.top);
        }

        let offset = if let Some((offset, len)) = self.best_fit(size) {
            self.free.remove(&offset);
            if len > size {
                self.free.insert(offset + size, len - size);
            }
            self.stats.reused += 1;
            offset
        } else {
            let start = self.top;
            let end = start
                .checked_add(size)
                .filter(|&end| self.config.limit.map_or(true, |limit| end <= limit))
                .ok_or_else(|| self.out_of_memory(bytes))?;
            self.top = end;
            start
        };

        self.live.insert(offset, size);
        self.stats.used += size;
        self.stats.allocations += 1;
        self.stats.peak = self.stats.peak.max(offset + size);
        debug!(offset, bytes, aligned = size, "arena alloc");
        Ok(offset)
    }

    fn free(&mut self, offset: usize, bytes: usize) -> Result<(), AllocError> {
        let size = self
            .align(bytes)
            .ok_or(AllocError::InvalidFree { offset, bytes })?;
        if size == 0 {
            return Ok(());
        }
        match self.live.get(&offset) {
            Some(&len) if len == size => {
                self.live.remove(&offset);
            }
            _ => return Err(AllocError::InvalidFree { offset, bytes }),
        }
        self.stats.used -= size;
        self.stats.frees += 1;
        self.insert_free(offset, size);
        debug!(offset, bytes, "arena free");
        Ok(())
    }

    fn base_ptr(&mut self) -> Result<NonNull<u8>, AllocError> {
        let words = self.stats.peak.div_ceil(std::mem::size_of::<u64>()).max(1);
        let buffer = self.buffer.get_or_insert_with(|| vec![0u64; words]);
        Ok(NonNull::from(buffer.as_mut_slice()).cast())
    }

    fn info(&self) {
        info!(
            used = self.stats.used,
            peak = self.stats.peak,
            live_blocks = self.live.len(),
            free_blocks = self.free.len(),
            allocations = self.stats.allocations,
            reused = self.stats.reused,
            materialized = self.buffer.is_some(),
            "arena usage"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_aligned_and_disjoint() {
        let mut arena = ArenaAllocator::default();
        let a = arena.alloc(3).unwrap();
        let b = arena.alloc(10).unwrap();
        let c = arena.alloc(8).unwrap();
        assert_eq!((a, b, c), (0, 8, 24));
        assert_eq!(arena.stats().used, 32);
        assert_eq!(arena.peak_bytes(), 32);
    }

    #[test]
    fn test_best_fit_reuse() {
        let mut arena = ArenaAllocator::default();
        let big = arena.alloc(64).unwrap();
        let _sep1 = arena.alloc(8).unwrap();
        let small = arena.alloc(16).unwrap();
        let _sep2 = arena.alloc(8).unwrap();
        arena.free(big, 64).unwrap();
        arena.free(small, 16).unwrap();

        // 16 fits both holes; the smaller one wins.
        assert_eq!(arena.alloc(16).unwrap(), small);
        assert_eq!(arena.alloc(24).unwrap(), big);
        assert_eq!(arena.stats().reused, 2);
    }

    #[test]
    fn test_neighbours_coalesce() {
        let mut arena = ArenaAllocator::default();
        let a = arena.alloc(8).unwrap();
        let b = arena.alloc(8).unwrap();
        let _c = arena.alloc(8).unwrap();
        arena.free(a, 8).unwrap();
        arena.free(b, 8).unwrap();
        assert_eq!(arena.alloc(16).unwrap(), 0);
    }

    #[test]
    fn test_tail_free_lowers_top() {
        let mut arena = ArenaAllocator::default();
        let _a = arena.alloc(8).unwrap();
        let b = arena.alloc(32).unwrap();
        arena.free(b, 32).unwrap();
        assert_eq!(arena.alloc(48).unwrap(), 8);
        assert_eq!(arena.peak_bytes(), 56);
    }

    #[test]
    fn test_limit() {
        let mut arena = ArenaAllocator::new(ArenaConfig::default().with_limit(32));
        arena.alloc(24).unwrap();
        let err = arena.alloc(16).unwrap_err();
        assert_eq!(
            err,
            AllocError::OutOfMemory {
                requested: 16,
                limit: 32
            }
        );
        assert_eq!(arena.alloc(8).unwrap(), 24);
    }

    #[test]
    fn test_huge_requests_do_not_overflow() {
        let mut arena = ArenaAllocator::default();
        assert_eq!(
            arena.alloc(usize::MAX).unwrap_err(),
            AllocError::OutOfMemory {
                requested: usize::MAX,
                limit: usize::MAX
            }
        );

        arena.alloc(8).unwrap();
        let near_max = usize::MAX - 7;
        assert!(matches!(
            arena.alloc(near_max),
            Err(AllocError::OutOfMemory { .. })
        ));

        let mut limited = ArenaAllocator::new(ArenaConfig::default().with_limit(64));
        limited.alloc(8).unwrap();
        assert_eq!(
            limited.alloc(near_max).unwrap_err(),
            AllocError::OutOfMemory {
                requested: near_max,
                limit: 64
            }
        );
        assert!(matches!(
            arena.free(0, usize::MAX),
            Err(AllocError::InvalidFree { .. })
        ));
        assert_eq!(arena.stats().used, 8);
    }

    #[test]
    fn test_invalid_free() {
        let mut arena = ArenaAllocator::default();
        let a = arena.alloc(16).unwrap();
        assert!(matches!(
            arena.free(a + 8, 8),
            Err(AllocError::InvalidFree { .. })
        ));
        arena.free(a, 16).unwrap();
        assert!(arena.free(a, 16).is_err());
    }

    #[test]
    fn test_materialize_freezes_arena() {
        let mut arena = ArenaAllocator::default();
        arena.alloc(100).unwrap();
        let base = arena.base_ptr().unwrap();
        assert_eq!(arena.base_ptr().unwrap(), base);
        assert!(arena.is_materialized());
        assert_eq!(arena.alloc(1).unwrap_err(), AllocError::Materialized);

        arena.reset();
        assert!(!arena.is_materialized());
        assert_eq!(arena.alloc(1).unwrap(), 0);
    }

    #[test]
    fn test_zero_sized_requests() {
        let mut arena = ArenaAllocator::default();
        let a = arena.alloc(0).unwrap();
        let b = arena.alloc(8).unwrap();
        assert_eq!((a, b), (0, 0));
        arena.free(a, 0).unwrap();
        assert!(arena.base_ptr().is_ok());
    }

    #[test]
    fn test_config_check() {
        assert!(ArenaConfig::default().check().is_ok());
        assert!(ArenaConfig::default().with_alignment(12).check().is_err());
        assert!(ArenaConfig::default().with_alignment(16).check().is_err());
    }
}
