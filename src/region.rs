//! A byte-addressed window onto a shared file descriptor. `Layout`
//! carves these out of the backing device/file; `VolumeStore` wraps
//! one in page-granular semantics. Kept as its own small module since
//! both need it and neither owns it conceptually.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct ByteRegion {
    file: Arc<File>,
    base_offset: u64,
    len: u64,
}

impl ByteRegion {
    pub fn new(file: Arc<File>, base_offset: u64, len: u64) -> Self {
        Self {
            file,
            base_offset,
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Carves a bounds-checked sub-window out of this region, used by
    /// `Layout` to hand `VolumeStore` exactly the `DATA_REGION` bytes.
    pub fn sub_region(&self, rel_offset: u64, len: u64) -> Result<ByteRegion> {
        if rel_offset.saturating_add(len) > self.len {
            return Err(Error::InvalidArgument(format!(
                "sub-region [{rel_offset}, {}) exceeds region length {}",
                rel_offset + len,
                self.len
            )));
        }
        Ok(ByteRegion {
            file: Arc::clone(&self.file),
            base_offset: self.base_offset + rel_offset,
            len,
        })
    }

    fn bounds_check(&self, rel_offset: u64, len: usize) -> Result<()> {
        if rel_offset.saturating_add(len as u64) > self.len {
            return Err(Error::InvalidArgument(format!(
                "access [{rel_offset}, {}) exceeds region length {}",
                rel_offset + len as u64,
                self.len
            )));
        }
        Ok(())
    }

    pub fn read_at(&self, rel_offset: u64, buf: &mut [u8]) -> Result<()> {
        self.bounds_check(rel_offset, buf.len())?;
        pread_exact(&self.file, buf, self.base_offset + rel_offset)
    }

    pub fn write_at(&self, rel_offset: u64, buf: &[u8]) -> Result<()> {
        self.bounds_check(rel_offset, buf.len())?;
        pwrite_exact(&self.file, buf, self.base_offset + rel_offset)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(Error::Io)
    }
}

/// Loops over `pread(2)` until `buf` is fully populated, retrying on
/// `EINTR` and on short reads. Returns `UnexpectedEof` on a zero-byte
/// read before completion.
pub fn pread_exact(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let fd = file.as_raw_fd();
    let mut done = 0usize;
    while done < buf.len() {
        let ret = unsafe {
            libc::pread(
                fd,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
                (offset + done as u64) as libc::off_t,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }
        if ret == 0 {
            return Err(Error::UnexpectedEof {
                got: done,
                expected: buf.len(),
            });
        }
        done += ret as usize;
    }
    Ok(())
}

/// Loops over `pwrite(2)` until `buf` is fully written, retrying on
/// `EINTR` and on short writes.
pub fn pwrite_exact(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    let fd = file.as_raw_fd();
    let mut done = 0usize;
    while done < buf.len() {
        let ret = unsafe {
            libc::pwrite(
                fd,
                buf[done..].as_ptr() as *const libc::c_void,
                buf.len() - done,
                (offset + done as u64) as libc::off_t,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }
        done += ret as usize;
    }
    Ok(())
}
