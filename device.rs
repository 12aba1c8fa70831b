//! Block I/O service consumed by the superblock code.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::linux::fs::MetadataExt;
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{BchError, Result};

use nix::{ioctl_read, request_code_none};
use parking_lot::Mutex;

/// Byte addressed device for fixed offset I/O (pread/pwrite semantics).
///
/// Every call blocks until the I/O has completed.
pub trait ByteDevice: Send + Sync + fmt::Debug {
    /// Name used in log messages
    fn name(&self) -> &str;

    /// Total length in bytes
    fn len_bytes(&self) -> u64;

    /// Smallest addressable unit of the device, in bytes
    fn block_size(&self) -> u64;

    /// Read exactly `buf.len()` bytes at `offset`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush written data to stable storage
    fn sync(&self) -> Result<()>;
}

const BLKPBSZGET_IOC_MAGIC: u8 = 0x12;
const BLKPBSZGET_IOC_TYPE_MODE: u8 = 123;

/// Thin wrapper around ioctl(BLKPBSZGET)
unsafe fn blkpbszget(fd: libc::c_int, data: *mut libc::c_uint) -> Result<libc::c_int> {
    let res = libc::ioctl(
        fd,
        request_code_none!(BLKPBSZGET_IOC_MAGIC, BLKPBSZGET_IOC_TYPE_MODE),
        data,
    );
    if res != 0 {
        Err(io::Error::last_os_error().into())
    } else {
        Ok(res)
    }
}

const BLKGETSIZE64_IOC_MAGIC: u8 = 0x12;
const BLKGETSIZE64_IOC_TYPE_MODE: u8 = 114;

ioctl_read!(
    blkgetsize64,
    BLKGETSIZE64_IOC_MAGIC,
    BLKGETSIZE64_IOC_TYPE_MODE,
    u64
);

/// Get the device block size in bytes
fn get_blocksize(f: &File) -> Result<u64> {
    let meta = f.metadata()?;
    let ft = meta.file_type();

    if !ft.is_block_device() {
        // regular files are treated as having 512 byte sectors
        Ok(512)
    } else {
        let mut data: libc::c_uint = 0;
        unsafe { blkpbszget(f.as_raw_fd(), &mut data)? };
        Ok(u64::from(data))
    }
}

/// Get the device size in bytes
fn get_size(f: &File) -> Result<u64> {
    let meta = f.metadata()?;
    let ft = meta.file_type();

    if !ft.is_block_device() {
        Ok(meta.st_size())
    } else {
        let mut data = 0u64;
        unsafe { blkgetsize64(f.as_raw_fd(), &mut data)? };
        Ok(data)
    }
}

/// A regular file or block device
#[derive(Debug)]
pub struct FileDevice {
    name: String,
    file: File,
    len: u64,
    block_size: u64,
}

impl FileDevice {
    /// Open a device for reading, and for writing unless `read_only`
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<FileDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path.as_ref())?;
        let len = get_size(&file)?;
        let block_size = get_blocksize(&file)?;
        Ok(FileDevice {
            name: path.as_ref().display().to_string(),
            file,
            len,
            block_size,
        })
    }
}

impl ByteDevice for FileDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        Ok(self.file.read_exact_at(buf, offset)?)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        Ok(self.file.write_all_at(buf, offset)?)
    }

    fn sync(&self) -> Result<()> {
        Ok(self.file.sync_data()?)
    }
}

/// An in-memory device image.
///
/// Supports fault injection: failing every write, or silently dropping
/// writes after a number of successful ones to simulate a crash.
#[derive(Debug)]
pub struct MemDevice {
    name: String,
    block_size: u64,
    bytes: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    drop_writes_after: Mutex<Option<usize>>,
    writes: AtomicUsize,
}

impl MemDevice {
    /// Create a zeroed image of `len` bytes
    pub fn new(name: &str, len: usize, block_size: u64) -> MemDevice {
        MemDevice {
            name: name.to_string(),
            block_size,
            bytes: Mutex::new(vec![0u8; len]),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            drop_writes_after: Mutex::new(None),
            writes: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent write fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent read fail with an I/O error
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Accept `n` more writes, then report success without storing anything
    pub fn drop_writes_after(&self, n: Option<usize>) {
        *self.drop_writes_after.lock() = n;
    }

    /// Number of writes that reached the image
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Copy out `len` bytes at `offset`
    pub fn peek(&self, offset: usize, len: usize) -> Vec<u8> {
        self.bytes.lock()[offset..offset + len].to_vec()
    }

    /// Overwrite bytes directly, bypassing fault injection
    pub fn poke(&self, offset: usize, data: &[u8]) {
        self.bytes.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| BchError::Einval("range overflow".to_string()))?;
        if end > self.bytes.lock().len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{}: access past end of device", self.name),
            )
            .into());
        }
        Ok(start..end)
    }
}

impl ByteDevice for MemDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read error").into());
        }
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes.lock()[range]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write error").into());
        }
        let range = self.range(offset, buf.len())?;
        {
            let mut remaining = self.drop_writes_after.lock();
            match *remaining {
                Some(0) => return Ok(()),
                Some(ref mut n) => *n -= 1,
                None => {}
            }
        }
        self.bytes.lock()[range].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_faults() {
        let dev = MemDevice::new("mem", 4096, 512);
        dev.write_at(512, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        dev.read_at(512, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(dev.writes(), 1);

        assert!(dev.read_at(4095, &mut buf).is_err());

        dev.drop_writes_after(Some(1));
        dev.write_at(0, &[9]).unwrap();
        dev.write_at(1, &[9]).unwrap();
        assert_eq!(dev.peek(0, 2), vec![9, 0]);
        dev.drop_writes_after(None);

        dev.set_fail_writes(true);
        assert!(dev.write_at(0, &[1]).is_err());
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();

        let dev = FileDevice::open(&path, false).unwrap();
        assert_eq!(dev.len_bytes(), 8192);
        assert_eq!(dev.block_size(), 512);
        dev.write_at(4096, b"bcachefs").unwrap();
        dev.sync().unwrap();

        let mut buf = [0u8; 8];
        dev.read_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"bcachefs");
    }
}
