use std::fs::File;
use std::path::Path;
use std::sync::atomic::{fence, Ordering};

use log::{info, warn};
use memmap2::{MmapMut, MmapOptions, MmapRaw};

use crate::{StoreError, PAGE_SIZE};

/*
 * Pointers persisted inside the region are natural virtual addresses,
 * so a file-backed mapping must come back at the same address after a
 * restart. The mapping is pinned at a hint derived from the file path;
 * if the pin fails, existing state is unrecoverable and the allocator
 * will refuse it as corrupted.
 */
#[cfg(target_os = "linux")]
const PM_MAP_BASE: u64 = 0x10_0000_0000;
#[cfg(target_os = "linux")]
const PM_MAP_STRIDE: u64 = 0x2_0000_0000;
#[cfg(target_os = "linux")]
const PM_MAP_SLOTS: u64 = 0x400;

enum Backing {
    Mapped(MmapRaw),
    #[cfg(target_os = "linux")]
    Pinned {
        ptr: *mut u8,
        len: usize,
    },
}

/// One mapped PM region, established at startup and living for the
/// process. All engine subsystems hold raw addresses into it, so the
/// region must be dropped last.
pub struct PmRegion {
    backing: Backing,
    file: Option<File>,
}

// The raw map pointer is handed out to worker threads; every mutation
// behind it is governed by the worker-slot protocol of the allocator/WAL.
unsafe impl Send for PmRegion {}
unsafe impl Sync for PmRegion {}

impl PmRegion {
    /// Map a PM device file, creating and sizing it as needed. The file
    /// is locked for exclusive use so two engines can't share one
    /// region.
    pub fn open<P: AsRef<Path>>(path: P, size: usize) -> Result<Self, StoreError> {
        use fs4::fs_std::FileExt;

        if PAGE_SIZE >= page_size::get() && (PAGE_SIZE % page_size::get()) != 0 {
            return Err(StoreError::Corrupted(
                "PM page size is not a multiple of the host page size",
            ));
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())
            .map_err(StoreError::Open)?;
        file.try_lock_exclusive().map_err(StoreError::Lock)?;

        let file_size = file.metadata().map_err(StoreError::Open)?.len() as usize;
        let size = size.max(file_size).max(page_size::get());
        if size != file_size {
            file.set_len(size as u64).map_err(StoreError::Open)?;
        }

        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;
            let hint = map_hint(path.as_ref());
            let ptr = unsafe {
                libc::mmap(
                    hint as *mut libc::c_void,
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE,
                    file.as_raw_fd(),
                    0,
                )
            };
            if ptr != libc::MAP_FAILED {
                info!("PM mapped at its pinned address {ptr:p}");
                return Ok(Self {
                    backing: Backing::Pinned {
                        ptr: ptr as *mut u8,
                        len: size,
                    },
                    file: Some(file),
                });
            }
            warn!("could not pin the PM mapping; existing state will not be recoverable");
        }

        let map = MmapOptions::new()
            .len(size)
            .map_raw(&file)
            .map_err(|e| StoreError::MapFailed {
                requested: size,
                source: e,
            })?;
        Ok(Self {
            backing: Backing::Mapped(map),
            file: Some(file),
        })
    }

    /// Map an anonymous region instead of a PM file. Contents do not
    /// survive the process; recovery paths can still be exercised
    /// against it as long as the mapping itself stays alive.
    pub fn open_anon(size: usize) -> Result<Self, StoreError> {
        let map = MmapRaw::from(MmapMut::map_anon(size).map_err(|e| StoreError::MapFailed {
            requested: size,
            source: e,
        })?);
        Ok(Self {
            backing: Backing::Mapped(map),
            file: None,
        })
    }

    pub fn base(&self) -> *mut u8 {
        match &self.backing {
            Backing::Mapped(map) => map.as_mut_ptr(),
            #[cfg(target_os = "linux")]
            Backing::Pinned { ptr, .. } => *ptr,
        }
    }

    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Mapped(map) => map.len(),
            #[cfg(target_os = "linux")]
            Backing::Pinned { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the whole mapping back. Only meaningful for file-backed
    /// regions; anonymous maps have nothing to sync to.
    pub fn flush(&self) -> Result<(), StoreError> {
        if self.file.is_none() {
            return Ok(());
        }
        match &self.backing {
            Backing::Mapped(map) => map.flush().map_err(StoreError::Sync),
            #[cfg(target_os = "linux")]
            Backing::Pinned { ptr, len } => {
                let rc = unsafe { libc::msync(*ptr as *mut libc::c_void, *len, libc::MS_SYNC) };
                if rc != 0 {
                    return Err(StoreError::Sync(std::io::Error::last_os_error()));
                }
                Ok(())
            }
        }
    }
}

impl Drop for PmRegion {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        if let Backing::Pinned { ptr, len } = &self.backing {
            unsafe { libc::munmap(*ptr as *mut libc::c_void, *len) };
        }
    }
}

/// Per-path pin address: the same file always maps at the same hint,
/// distinct files land in distinct strides.
#[cfg(target_os = "linux")]
fn map_hint(path: &Path) -> u64 {
    let hash = xxhash_rust::xxh3::xxh3_64(path.as_os_str().as_encoded_bytes());
    PM_MAP_BASE + (hash % PM_MAP_SLOTS) * PM_MAP_STRIDE
}

/// Store fence. Orders PM stores the same way the hardware orders them
/// for the flush-based persist below.
#[inline]
pub fn sfence() {
    fence(Ordering::SeqCst);
}

const CACHE_LINE: usize = 64;

/// Force the given byte range out of the cache hierarchy and fence, so
/// the stores are durable on PM before the caller proceeds.
#[inline]
pub fn persist(ptr: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_clflush, _mm_sfence};
        let start = ptr as usize & !(CACHE_LINE - 1);
        let end = ptr as usize + len;
        let mut line = start;
        while line < end {
            _mm_clflush(line as *const u8);
            line += CACHE_LINE;
        }
        _mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (ptr, len);
        fence(Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_region_is_zeroed_and_writable() {
        let region = PmRegion::open_anon(1 << 16).unwrap();
        assert_eq!(region.len(), 1 << 16);
        unsafe {
            assert_eq!(*region.base(), 0);
            *region.base() = 0xab;
            persist(region.base(), 1);
            assert_eq!(*region.base(), 0xab);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn file_region_reopens_at_same_address() {
        let path = std::env::temp_dir().join(format!("ridge-pmem-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let first = PmRegion::open(&path, 1 << 16).unwrap();
        let addr = first.base() as u64;
        unsafe { *first.base() = 0x5a };
        first.flush().unwrap();
        drop(first);

        let second = PmRegion::open(&path, 1 << 16).unwrap();
        assert_eq!(second.base() as u64, addr);
        assert_eq!(unsafe { *second.base() }, 0x5a);
        drop(second);
        let _ = std::fs::remove_file(&path);
    }
}
