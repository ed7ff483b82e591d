//! Power-of-two pool allocator.
//!
//! Requests round up to the smallest `2^k` that fits header plus payload.
//! Free blocks of size `2^k` sit in list `k`; a bitmap marks non-empty
//! lists. Allocation splits larger blocks by halving; blocks returned from
//! a closing memmap are reinserted without buddy-merging, so fragmentation
//! is an observed cost, never an invariant violation.
//!
//! Every block carries a two-word header in the region: a magic sentinel
//! and the block size. The magic is the only cross-process defense against
//! heap corruption; a block that fails the check aborts the detecting
//! process and nothing else.

use crate::error::{ComoError, ComoResult};
use crate::logging::{self, Logger};
use crate::mem::region::Region;

/// Smallest block is `2^MIN_CLASS` bytes, largest `2^MAX_CLASS`.
pub const MIN_CLASS: u32 = 5;
pub const MAX_CLASS: u32 = 30;

const NCLASSES: usize = (MAX_CLASS - MIN_CLASS + 1) as usize;

/// Block header: `{ magic: u64, size: u64 }`, stored in the region.
pub const BLOCK_HEADER: u64 = 16;

const MAGIC_FREE: u64 = 0x9191_9191;
const MAGIC_IN_USE: u64 = 0x0050_b50b;

/// Handle to an allocated block. `ofs` is the first payload byte; the
/// header sits at `ofs - BLOCK_HEADER`. Valid in any process mapping the
/// same region.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Block {
    pub ofs: u64,
    pub class: u32,
}

impl Block {
    /// Total block size, header included.
    #[inline]
    pub fn size(&self) -> u64 {
        1 << self.class
    }

    /// Usable payload bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        (self.size() - BLOCK_HEADER) as usize
    }

    #[inline]
    fn raw_ofs(&self) -> u64 {
        self.ofs - BLOCK_HEADER
    }
}

pub struct Pool {
    region: Region,
    free: Vec<Vec<u64>>,
    bitmap: u32,
    usage: u64,
    peak: u64,
    log: Logger,
}

impl Pool {
    /// Builds a pool over the whole region. The region size must be a power
    /// of two of at least `2^MIN_CLASS` bytes.
    pub fn new(region: Region, log: &Logger) -> ComoResult<Pool> {
        let size = region.size();
        if !size.is_power_of_two() || size < (1 << MIN_CLASS) {
            return Err(ComoError::Malformed("pool size not a power of two"));
        }

        let mut pool = Pool {
            region,
            free: (0..NCLASSES).map(|_| Vec::new()).collect(),
            bitmap: 0,
            usage: 0,
            peak: 0,
            log: log.new(logging::o!("unit" => "pool")),
        };

        // Seed the free lists: one maximal block per MAX_CLASS-sized run.
        let mut ofs = 0;
        while ofs < size {
            let class = u64::min(size - ofs, 1 << MAX_CLASS).trailing_zeros();
            pool.seed_free(ofs, class)?;
            ofs += 1 << class;
        }

        Ok(pool)
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut Region {
        &mut self.region
    }

    /// Bytes currently allocated, block headers included.
    #[inline]
    pub fn usage(&self) -> u64 {
        self.usage
    }

    /// High-water mark of `usage`; never decreases.
    #[inline]
    pub fn peak(&self) -> u64 {
        self.peak
    }

    /// Allocates a block able to hold `size` payload bytes.
    pub fn alloc(&mut self, size: usize) -> ComoResult<Block> {
        let total = size as u64 + BLOCK_HEADER;
        let class = u32::max(total.next_power_of_two().trailing_zeros(), MIN_CLASS);
        if class > MAX_CLASS {
            return Err(ComoError::Overload);
        }

        // Smallest non-empty list that can satisfy the request.
        let avail = self.bitmap >> (class - MIN_CLASS);
        if avail == 0 {
            logging::warn!(self.log, "pool exhausted";
                           "request" => size, "usage" => self.usage);
            return Err(ComoError::Overload);
        }
        let mut have = class + avail.trailing_zeros();

        let mut raw = self.pop_free(have);

        // Split by halving until the block matches the request class; the
        // upper halves go back to the free lists.
        while have > class {
            have -= 1;
            let half = raw + (1u64 << have);
            self.seed_free(half, have)?;
        }

        self.write_header(raw, MAGIC_IN_USE, 1 << class)?;

        self.usage += 1 << class;
        if self.usage > self.peak {
            self.peak = self.usage;
        }

        Ok(Block {
            ofs: raw + BLOCK_HEADER,
            class,
        })
    }

    /// Returns a block to the free lists. The block must lie inside the
    /// pool and carry the in-use magic.
    pub fn free(&mut self, block: Block) -> ComoResult<()> {
        let raw = self.checked_raw(block)?;

        self.write_header(raw, MAGIC_FREE, block.size())?;
        self.push_free(raw, block.class);
        self.usage -= block.size();

        Ok(())
    }

    /// Verifies a block handle received from another process before its
    /// payload is trusted.
    pub fn verify(region: &Region, block: Block) -> ComoResult<()> {
        let raw = block
            .ofs
            .checked_sub(BLOCK_HEADER)
            .ok_or(ComoError::Malformed("block before pool start"))?;
        let magic = region.read_u64(raw)?;
        let size = region.read_u64(raw + 8)?;

        if magic != MAGIC_IN_USE {
            return Err(ComoError::Malformed("bad block magic"));
        }
        if size != block.size() {
            return Err(ComoError::Malformed("block size mismatch"));
        }
        Ok(())
    }

    /// Immutable payload view of an in-use block.
    pub fn payload(&self, block: Block) -> ComoResult<&[u8]> {
        Self::verify(&self.region, block)?;
        self.region.bytes(block.ofs, block.capacity())
    }

    /// Mutable payload view of an in-use block.
    pub fn payload_mut(&mut self, block: Block) -> ComoResult<&mut [u8]> {
        Self::verify(&self.region, block)?;
        self.region.bytes_mut(block.ofs, block.capacity())
    }

    fn checked_raw(&self, block: Block) -> ComoResult<u64> {
        if block.class < MIN_CLASS || block.class > MAX_CLASS {
            return Err(ComoError::Malformed("block class out of range"));
        }

        let raw = block
            .ofs
            .checked_sub(BLOCK_HEADER)
            .ok_or(ComoError::Malformed("block before pool start"))?;
        if raw + block.size() > self.region.size() {
            return Err(ComoError::Malformed("block outside pool"));
        }

        let magic = self.region.read_u64(raw)?;
        if magic == MAGIC_FREE {
            return Err(ComoError::Malformed("double free"));
        }
        if magic != MAGIC_IN_USE {
            // Neither sentinel: the heap itself is gone.
            return Err(ComoError::Fatal("pool corruption"));
        }

        let size = self.region.read_u64(raw + 8)?;
        if size != block.size() {
            return Err(ComoError::Fatal("pool corruption"));
        }

        Ok(raw)
    }

    fn seed_free(&mut self, raw: u64, class: u32) -> ComoResult<()> {
        self.write_header(raw, MAGIC_FREE, 1 << class)?;
        self.push_free(raw, class);
        Ok(())
    }

    fn write_header(&mut self, raw: u64, magic: u64, size: u64) -> ComoResult<()> {
        self.region.write_u64(raw, magic)?;
        self.region.write_u64(raw + 8, size)
    }

    #[inline]
    fn push_free(&mut self, raw: u64, class: u32) {
        let idx = (class - MIN_CLASS) as usize;
        self.free[idx].push(raw);
        self.bitmap |= 1 << idx;
    }

    #[inline]
    fn pop_free(&mut self, class: u32) -> u64 {
        let idx = (class - MIN_CLASS) as usize;
        let raw = self.free[idx].pop().expect("bitmap out of sync");
        if self.free[idx].is_empty() {
            self.bitmap &= !(1 << idx);
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;

    fn make_pool(size: u64) -> Pool {
        let region = Region::anonymous(size).unwrap();
        Pool::new(region, &logging::discard()).unwrap()
    }

    #[test]
    fn test_alloc_rounds_to_power_of_two() {
        let mut pool = make_pool(1 << 16);

        // 100 + 16 byte header fits in 128.
        let block = pool.alloc(100).unwrap();
        assert_eq!(block.size(), 128);
        assert_eq!(block.capacity(), 112);

        // Exactly one byte over the boundary doubles the block.
        let block = pool.alloc(113).unwrap();
        assert_eq!(block.size(), 256);
    }

    #[test]
    fn test_min_class_floor() {
        let mut pool = make_pool(1 << 12);
        let block = pool.alloc(1).unwrap();
        assert_eq!(block.size(), 1 << MIN_CLASS);
    }

    #[test]
    fn test_free_restores_usage_peak_monotonic() {
        let mut pool = make_pool(1 << 16);
        let before = pool.usage();

        let block = pool.alloc(1000).unwrap();
        assert_eq!(pool.usage(), before + block.size());

        pool.free(block).unwrap();
        assert_eq!(pool.usage(), before);
        assert!(pool.peak() >= block.size());

        let peak = pool.peak();
        let small = pool.alloc(10).unwrap();
        pool.free(small).unwrap();
        assert!(pool.peak() >= peak);
    }

    #[test]
    fn test_split_and_reuse() {
        let mut pool = make_pool(1 << 12);

        // First allocation splits the single 4k block down to 32 bytes.
        let a = pool.alloc(10).unwrap();
        assert_eq!(a.size(), 32);

        // The sibling halves are immediately reusable.
        let b = pool.alloc(10).unwrap();
        assert_ne!(a.ofs, b.ofs);

        let c = pool.alloc(2000).unwrap();
        assert_eq!(c.size(), 2048);
    }

    #[test]
    fn test_double_free_detected() {
        let mut pool = make_pool(1 << 12);
        let block = pool.alloc(10).unwrap();

        pool.free(block).unwrap();
        assert_eq!(
            pool.free(block).unwrap_err(),
            ComoError::Malformed("double free")
        );
    }

    #[test]
    fn test_corrupted_magic_is_fatal() {
        let mut pool = make_pool(1 << 12);
        let block = pool.alloc(10).unwrap();

        pool.region_mut()
            .write_u64(block.ofs - BLOCK_HEADER, 0x1234)
            .unwrap();

        assert_eq!(
            pool.free(block).unwrap_err(),
            ComoError::Fatal("pool corruption")
        );
    }

    #[test]
    fn test_exhaustion_is_overload() {
        let mut pool = make_pool(1 << 10);

        let block = pool.alloc(500).unwrap();
        assert_eq!(block.size(), 1024);

        assert_eq!(pool.alloc(500).unwrap_err(), ComoError::Overload);
    }

    #[test]
    fn test_payload_roundtrip_and_verify() {
        let mut pool = make_pool(1 << 12);
        let block = pool.alloc(64).unwrap();

        pool.payload_mut(block).unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&pool.payload(block).unwrap()[..4], &[1, 2, 3, 4]);

        pool.free(block).unwrap();
        assert!(Pool::verify(pool.region(), block).is_err());
    }

    #[test]
    fn test_oversized_request_is_overload() {
        let mut pool = make_pool(1 << 12);
        assert_eq!(
            pool.alloc((1usize << MAX_CLASS) + 1).unwrap_err(),
            ComoError::Overload
        );
    }
}
