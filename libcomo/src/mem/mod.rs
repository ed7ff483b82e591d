//! Shared-memory pool allocator and per-module memory maps.
//!
//! One process-wide arena is partitioned into power-of-two blocks; modules
//! draw from it through per-module `Memmap` sub-pools that can be bulk
//! reclaimed at window boundaries. Blocks are identified by region offsets,
//! not pointers, so handles stay valid in every process that maps the
//! backing file.

pub mod region;
pub mod pool;
pub mod memmap;

pub use memmap::{MapKind, Memmap};
pub use pool::{Block, Pool, MAX_CLASS, MIN_CLASS};
pub use region::Region;
