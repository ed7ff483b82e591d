//! Per-module memory maps.
//!
//! A memmap is a bag of pool blocks owned by one module in one process.
//! Blocks freed by the module are cached for reuse inside the map and only
//! returned to the main pool when the map is released, which is where the
//! pool's bulk reinsertion happens. Releasing is the one moment the main
//! pool's free lists are touched by module-owned memory.

use crate::error::{ComoError, ComoResult};
use crate::mem::pool::{Block, Pool};

/// The three map kinds differ only in when they are released: the capture
/// sub-arena at every flush, the export arena when its window table is
/// dropped, the persistent map on module removal.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MapKind {
    Capture,
    ExportWindow,
    Persistent,
}

pub struct Memmap {
    kind: MapKind,
    live: Vec<Block>,
    cached: Vec<Block>,
    usage: u64,
}

impl Memmap {
    pub fn new(kind: MapKind) -> Memmap {
        Memmap {
            kind,
            live: Vec::new(),
            cached: Vec::new(),
            usage: 0,
        }
    }

    #[inline]
    pub fn kind(&self) -> MapKind {
        self.kind
    }

    /// Pool bytes pinned by this map, freed-but-cached blocks included.
    #[inline]
    pub fn usage(&self) -> u64 {
        self.usage
    }

    #[inline]
    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }

    /// Allocates from the map, reusing a cached block of the right class
    /// before going to the main pool.
    pub fn alloc(&mut self, pool: &mut Pool, size: usize) -> ComoResult<Block> {
        if let Some(pos) = self
            .cached
            .iter()
            .position(|b| b.capacity() >= size && b.capacity() / 2 < size)
        {
            let block = self.cached.swap_remove(pos);
            self.live.push(block);
            return Ok(block);
        }

        let block = pool.alloc(size)?;
        self.usage += block.size();
        self.live.push(block);
        Ok(block)
    }

    /// Releases one block back into the map's cache. Freeing a block this
    /// map does not own is a defined error.
    pub fn free(&mut self, block: Block) -> ComoResult<()> {
        let pos = self
            .live
            .iter()
            .position(|b| *b == block)
            .ok_or(ComoError::Malformed("block not in this map"))?;

        self.live.swap_remove(pos);
        self.cached.push(block);
        Ok(())
    }

    /// Returns every block, live and cached, to the main pool. The map
    /// itself stays usable; the capture path calls this at every window
    /// flush.
    pub fn release(&mut self, pool: &mut Pool) -> ComoResult<()> {
        for block in self.live.drain(..).chain(self.cached.drain(..)) {
            pool.free(block)?;
        }
        self.usage = 0;
        Ok(())
    }

    /// Final close on module removal: bulk-return and consume the map.
    pub fn close(mut self, pool: &mut Pool) -> ComoResult<()> {
        self.release(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use crate::mem::region::Region;

    fn make_pool() -> Pool {
        let region = Region::anonymous(1 << 16).unwrap();
        Pool::new(region, &logging::discard()).unwrap()
    }

    #[test]
    fn test_release_returns_everything() {
        let mut pool = make_pool();
        let mut map = Memmap::new(MapKind::Capture);

        let baseline = pool.usage();

        for _ in 0..8 {
            map.alloc(&mut pool, 100).unwrap();
        }
        assert!(pool.usage() > baseline);
        assert_eq!(map.live_blocks(), 8);

        map.release(&mut pool).unwrap();
        assert_eq!(pool.usage(), baseline);
        assert_eq!(map.usage(), 0);
        assert_eq!(map.live_blocks(), 0);
    }

    #[test]
    fn test_freed_blocks_cached_not_returned() {
        let mut pool = make_pool();
        let mut map = Memmap::new(MapKind::ExportWindow);

        let block = map.alloc(&mut pool, 100).unwrap();
        let usage_after_alloc = pool.usage();

        map.free(block).unwrap();
        // Coalescing happens only on release; pool usage is unchanged.
        assert_eq!(pool.usage(), usage_after_alloc);
        assert_eq!(map.usage(), block.size());

        // Same-class allocation reuses the cached block.
        let again = map.alloc(&mut pool, 100).unwrap();
        assert_eq!(again, block);
        assert_eq!(pool.usage(), usage_after_alloc);
    }

    #[test]
    fn test_foreign_free_is_error() {
        let mut pool = make_pool();
        let mut map_a = Memmap::new(MapKind::Capture);
        let mut map_b = Memmap::new(MapKind::Capture);

        let block = map_a.alloc(&mut pool, 50).unwrap();

        assert_eq!(
            map_b.free(block).unwrap_err(),
            ComoError::Malformed("block not in this map")
        );
    }

    #[test]
    fn test_close_consumes_map() {
        let mut pool = make_pool();
        let mut map = Memmap::new(MapKind::Persistent);
        let baseline = pool.usage();

        map.alloc(&mut pool, 200).unwrap();
        map.close(&mut pool).unwrap();

        assert_eq!(pool.usage(), baseline);
    }
}
