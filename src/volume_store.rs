//! Page-granular read/write over a `ByteRegion`. Same alignment and
//! short-read/short-write discipline as a direct-I/O segment store,
//! driven by `pread`/`pwrite` loops (`region::pread_exact`/
//! `pwrite_exact`) rather than an async submission queue.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};
use crate::page::AlignedBuf;
use crate::region::ByteRegion;

fn block_size_of(file: &File) -> u32 {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let ok = unsafe { libc::fstat(file.as_raw_fd(), &mut stat) } == 0;
    if ok && stat.st_blksize > 0 {
        stat.st_blksize as u32
    } else {
        4096
    }
}

pub struct VolumeStore {
    region: ByteRegion,
    bytes_per_page: u32,
    block_size: u32,
}

impl VolumeStore {
    /// Opens a volume store backed by `region`, validating that
    /// `bytes_per_page` is a positive multiple of 4096.
    pub fn open(region: ByteRegion, bytes_per_page: u32, file_for_stat: &File) -> Result<Self> {
        if bytes_per_page == 0 || bytes_per_page % 4096 != 0 {
            return Err(Error::InvalidArgument(format!(
                "bytes_per_page {bytes_per_page} must be a positive multiple of 4096"
            )));
        }
        let block_size = block_size_of(file_for_stat);
        Ok(Self {
            region,
            bytes_per_page,
            block_size,
        })
    }

    pub fn bytes_per_page(&self) -> u32 {
        self.bytes_per_page
    }

    /// Idempotent by construction: dropping the store releases the
    /// region reference, and calling `close` twice is just two drops of
    /// (at most one) value.
    pub fn close(self) {
        drop(self)
    }

    pub fn page_new(&self) -> Result<AlignedBuf> {
        AlignedBuf::new(self.bytes_per_page as usize, self.block_size as usize)
    }

    pub fn read_page(&self, physical_page_index: u64, page: &mut AlignedBuf) -> Result<()> {
        let offset = physical_page_index * self.bytes_per_page as u64;
        self.region.read_at(offset, page.as_mut_slice())
    }

    pub fn write_page(&self, physical_page_index: u64, page: &AlignedBuf) -> Result<()> {
        let offset = physical_page_index * self.bytes_per_page as u64;
        self.region.write_at(offset, page.as_slice())
    }

    pub fn sync(&self) -> Result<()> {
        self.region.sync()
    }

    /// Advisory hint only; safe to ignore.
    pub fn prefetch(&self, _first_page: u64, _count: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use std::sync::Arc;

    fn store_over_scratch(pages: u64, bytes_per_page: u32) -> VolumeStore {
        let mut f = tempfile::tempfile().unwrap();
        let len = pages * bytes_per_page as u64;
        f.seek(SeekFrom::Start(len.max(1) - 1)).unwrap();
        f.write_all(&[0]).unwrap();
        let arc = Arc::new(f);
        let region = ByteRegion::new(Arc::clone(&arc), 0, len);
        VolumeStore::open(region, bytes_per_page, &arc).unwrap()
    }

    #[test]
    fn write_then_read_round_trip() {
        let store = store_over_scratch(4, 4096);
        let mut write_buf = store.page_new().unwrap();
        write_buf.as_mut_slice().fill(0x42);
        store.write_page(2, &write_buf).unwrap();

        let mut read_buf = store.page_new().unwrap();
        store.read_page(2, &mut read_buf).unwrap();
        assert_eq!(read_buf.as_slice(), write_buf.as_slice());
    }

    #[test]
    fn rejects_unaligned_page_size() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&[0; 4096]).unwrap();
        let arc = Arc::new(f);
        let region = ByteRegion::new(Arc::clone(&arc), 0, 4096);
        assert!(VolumeStore::open(region, 100, &arc).is_err());
    }

    #[test]
    fn read_past_region_end_is_rejected() {
        let store = store_over_scratch(1, 4096);
        let mut buf = store.page_new().unwrap();
        assert!(store.read_page(5, &mut buf).is_err());
    }
}
