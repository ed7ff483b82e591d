//! Backing memory for the pool allocator.
//!
//! A region is either private (anonymous mapping, used by export's window
//! arenas) or shared (file-backed mapping under `db-path`, mapped by both
//! capture and export). Offsets into a shared region are meaningful in
//! every process that opened it.

use crate::error::{ComoError, ComoResult};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub struct Region {
    map: MmapMut,
    path: Option<PathBuf>,
    size: u64,
}

impl Region {
    /// Private anonymous region.
    pub fn anonymous(size: u64) -> ComoResult<Region> {
        let map = MmapMut::map_anon(size as usize)?;
        Ok(Region {
            map,
            path: None,
            size,
        })
    }

    /// Creates (or truncates) the shared backing file and maps it.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> ComoResult<Region> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(size)?;

        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Region {
            map,
            path: Some(path.as_ref().to_path_buf()),
            size,
        })
    }

    /// Maps an existing shared backing file created by another process.
    pub fn open<P: AsRef<Path>>(path: P) -> ComoResult<Region> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let size = file.metadata()?.len();

        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Region {
            map,
            path: Some(path.as_ref().to_path_buf()),
            size,
        })
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// True when the region is backed by a file other processes can map.
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[inline]
    pub fn bytes(&self, ofs: u64, len: usize) -> ComoResult<&[u8]> {
        self.check(ofs, len)?;
        Ok(&self.map[ofs as usize..ofs as usize + len])
    }

    #[inline]
    pub fn bytes_mut(&mut self, ofs: u64, len: usize) -> ComoResult<&mut [u8]> {
        self.check(ofs, len)?;
        Ok(&mut self.map[ofs as usize..ofs as usize + len])
    }

    #[inline]
    pub fn read_u64(&self, ofs: u64) -> ComoResult<u64> {
        let bytes = self.bytes(ofs, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    #[inline]
    pub fn write_u64(&mut self, ofs: u64, val: u64) -> ComoResult<()> {
        let bytes = self.bytes_mut(ofs, 8)?;
        bytes.copy_from_slice(&val.to_be_bytes());
        Ok(())
    }

    #[inline]
    fn check(&self, ofs: u64, len: usize) -> ComoResult<()> {
        if ofs.checked_add(len as u64).map_or(true, |end| end > self.size) {
            return Err(ComoError::Malformed("offset outside region"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_region_rw() {
        let mut region = Region::anonymous(4096).unwrap();
        assert!(!region.is_shared());

        region.write_u64(100, 0xdead_beef).unwrap();
        assert_eq!(region.read_u64(100).unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_bounds_check() {
        let region = Region::anonymous(4096).unwrap();
        assert!(region.bytes(4090, 8).is_err());
        assert!(region.bytes(u64::max_value(), 8).is_err());
        assert!(region.bytes(4088, 8).is_ok());
    }

    #[test]
    fn test_shared_region_visible_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shmem");

        let mut writer = Region::create(&path, 8192).unwrap();
        writer.write_u64(0, 42).unwrap();
        writer.map.flush().unwrap();

        let reader = Region::open(&path).unwrap();
        assert!(reader.is_shared());
        assert_eq!(reader.size(), 8192);
        assert_eq!(reader.read_u64(0).unwrap(), 42);
    }
}
