//! Shared memory regions
//!
//! A [`SharedMemory`] is a byte range visible to both the host and the fabric
//! consumer: the queue region and the staging ("BRAM") buffer. On hardware it
//! is a `/dev/mem` window mapped with `rustix`; for the software fabric and
//! tests it is a page-aligned anonymous allocation tagged with the physical
//! address it stands in for.
//!
//! All accesses are bounds-checked and volatile. Index fields that both sides
//! update go through [`SharedMemory::atomic_u64`].

// Shared memory is naturally aligned by construction; pointer casts are checked
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::cast_possible_truncation)]

use crate::error::{AirError, Result};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::alloc::Layout;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;

const PAGE_SIZE: u64 = 4096;

#[derive(Debug)]
enum Backing {
    /// Window of a device or regular file
    Mapped {
        _file: File,
        path: PathBuf,
        /// Bytes between the page-aligned mapping start and `ptr`
        lead: usize,
    },
    /// Heap allocation standing in for device memory
    Anonymous { layout: Layout },
}

/// Host/fabric shared byte range
#[derive(Debug)]
pub struct SharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    phys_base: u64,
    backing: Backing,
}

impl SharedMemory {
    /// Map `size` bytes of `path` starting at physical address `phys_base`
    ///
    /// `path` is normally `/dev/mem`, opened `O_RDWR | O_SYNC` so writes reach
    /// the device uncached. Any file works, which lets tests exercise the
    /// mapping path on a temporary file.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `size` is 0
    /// - The file cannot be opened read/write
    /// - mmap fails
    pub fn map_physical(path: impl AsRef<Path>, phys_base: u64, size: usize) -> Result<Self> {
        let path = path.as_ref();
        if size == 0 {
            return Err(AirError::map_failed(path, "zero-sized mapping"));
        }

        tracing::debug!("Mapping {} at {phys_base:#x} ({size:#x} bytes)", path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|e| AirError::map_failed(path, format!("cannot open: {e}")))?;

        // mmap offsets must be page aligned; keep the remainder as a lead-in
        let aligned = phys_base & !(PAGE_SIZE - 1);
        let lead = (phys_base - aligned) as usize;
        let map_len = lead + size;

        // SAFETY: mmap of a freshly opened fd. Invariants: (1) file is open read/write
        // and stored in the returned value, so the fd outlives the mapping; (2) map_len
        // is non-zero; (3) aligned is page aligned as mmap requires; (4) rustix returns
        // Err instead of MAP_FAILED. The mapping is released in Drop with the same length.
        let base = unsafe {
            mmap(
                std::ptr::null_mut(),
                map_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                aligned,
            )
            .map_err(|e| AirError::map_failed(path, format!("mmap failed: {e}")))?
        };

        let ptr = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| AirError::map_failed(path, "mmap returned null"))?;
        // SAFETY: lead < PAGE_SIZE <= map_len, so the offset stays inside the mapping.
        let ptr = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(lead)) };

        tracing::info!(
            "Mapped {} [{phys_base:#x}, {:#x}) at {ptr:p}",
            path.display(),
            phys_base + size as u64
        );

        Ok(Self {
            ptr,
            size,
            phys_base,
            backing: Backing::Mapped {
                _file: file,
                path: path.to_path_buf(),
                lead,
            },
        })
    }

    /// Zeroed page-aligned allocation standing in for memory at `phys_base`
    ///
    /// # Errors
    ///
    /// Returns error if `size` is 0 or the allocation fails.
    pub fn anonymous(phys_base: u64, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(AirError::invalid_address(phys_base, "zero-sized region"));
        }
        let layout = Layout::from_size_align(size, PAGE_SIZE as usize)
            .map_err(|e| AirError::invalid_address(phys_base, format!("bad layout: {e}")))?;

        // SAFETY: layout has non-zero size (checked above) and a power-of-two alignment.
        // The allocation is released in Drop with the same layout.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| AirError::invalid_address(phys_base, "allocation failed"))?;

        tracing::debug!("Anonymous region [{phys_base:#x}, {:#x})", phys_base + size as u64);

        Ok(Self {
            ptr,
            size,
            phys_base,
            backing: Backing::Anonymous { layout },
        })
    }

    /// Region size in bytes
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Physical address of byte 0
    #[must_use]
    pub const fn phys_base(&self) -> u64 {
        self.phys_base
    }

    /// True if the region backs a device/file mapping
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped { .. })
    }

    /// True if `[phys, phys + len)` lies inside the region
    #[must_use]
    pub fn contains(&self, phys: u64, len: usize) -> bool {
        phys >= self.phys_base
            && (phys - self.phys_base)
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.size as u64)
    }

    /// Region offset of physical address `phys`
    ///
    /// # Errors
    ///
    /// Returns [`AirError::InvalidAddress`] if `[phys, phys + len)` is outside the region.
    pub fn offset_of(&self, phys: u64, len: usize) -> Result<usize> {
        if self.contains(phys, len) {
            Ok((phys - self.phys_base) as usize)
        } else {
            Err(AirError::invalid_address(
                phys,
                format!(
                    "{len} bytes not inside [{:#x}, {:#x})",
                    self.phys_base,
                    self.phys_base + self.size as u64
                ),
            ))
        }
    }

    /// Physical address of region offset `offset`
    #[must_use]
    pub const fn phys_addr(&self, offset: usize) -> u64 {
        self.phys_base + offset as u64
    }

    fn check(&self, offset: usize, len: usize, align: usize) -> Result<*mut u8> {
        let end = offset.checked_add(len);
        if end.is_none_or(|end| end > self.size) {
            return Err(AirError::OutOfBounds {
                offset,
                len,
                limit: self.size,
            });
        }
        // SAFETY: offset + len <= size, so the pointer stays inside the region.
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        if (ptr as usize) % align != 0 {
            return Err(AirError::invalid_address(
                self.phys_addr(offset),
                format!("not {align}-byte aligned"),
            ));
        }
        Ok(ptr)
    }

    /// Read a 32-bit word
    ///
    /// # Errors
    ///
    /// Returns error if the access is out of bounds or misaligned.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let ptr = self.check(offset, 4, 4)?;
        // SAFETY: read_volatile: the other side may change the value at any time.
        // ptr is in bounds and 4-byte aligned (checked).
        Ok(unsafe { ptr.cast::<u32>().read_volatile() })
    }

    /// Write a 32-bit word
    ///
    /// # Errors
    ///
    /// Returns error if the access is out of bounds or misaligned.
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        let ptr = self.check(offset, 4, 4)?;
        // SAFETY: write_volatile keeps the store observable by the device.
        // ptr is in bounds and 4-byte aligned (checked).
        unsafe { ptr.cast::<u32>().write_volatile(value) };
        Ok(())
    }

    /// Read a 64-bit word
    ///
    /// # Errors
    ///
    /// Returns error if the access is out of bounds or misaligned.
    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        let ptr = self.check(offset, 8, 8)?;
        // SAFETY: in bounds, 8-byte aligned (checked); volatile for shared memory.
        Ok(unsafe { ptr.cast::<u64>().read_volatile() })
    }

    /// Write a 64-bit word
    ///
    /// # Errors
    ///
    /// Returns error if the access is out of bounds or misaligned.
    pub fn write_u64(&self, offset: usize, value: u64) -> Result<()> {
        let ptr = self.check(offset, 8, 8)?;
        // SAFETY: in bounds, 8-byte aligned (checked); volatile for shared memory.
        unsafe { ptr.cast::<u64>().write_volatile(value) };
        Ok(())
    }

    /// Copy bytes out of the region
    ///
    /// # Errors
    ///
    /// Returns error if the read would exceed bounds.
    pub fn read_bytes(&self, offset: usize, buffer: &mut [u8]) -> Result<()> {
        let src = self.check(offset, buffer.len(), 1)?;
        for (i, b) in buffer.iter_mut().enumerate() {
            // SAFETY: src + i < src + len, inside the region (checked).
            *b = unsafe { src.add(i).read_volatile() };
        }
        Ok(())
    }

    /// Copy bytes into the region
    ///
    /// # Errors
    ///
    /// Returns error if the write would exceed bounds.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        let dst = self.check(offset, data.len(), 1)?;
        for (i, b) in data.iter().enumerate() {
            // SAFETY: dst + i < dst + len, inside the region (checked).
            unsafe { dst.add(i).write_volatile(*b) };
        }
        Ok(())
    }

    /// Read `out.len()` consecutive 32-bit words
    ///
    /// # Errors
    ///
    /// Returns error if the read would exceed bounds.
    pub fn read_words(&self, offset: usize, out: &mut [u32]) -> Result<()> {
        self.read_bytes(offset, bytemuck::cast_slice_mut(out))
    }

    /// Write consecutive 32-bit words
    ///
    /// # Errors
    ///
    /// Returns error if the write would exceed bounds.
    pub fn write_words(&self, offset: usize, words: &[u32]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(words))
    }

    /// Fill a byte range with `value`
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds bounds.
    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<()> {
        let dst = self.check(offset, len, 1)?;
        for i in 0..len {
            // SAFETY: inside the checked range.
            unsafe { dst.add(i).write_volatile(value) };
        }
        Ok(())
    }

    /// Atomic view of an 8-byte aligned word shared with the other side
    ///
    /// # Errors
    ///
    /// Returns error if the word is out of bounds or misaligned.
    pub fn atomic_u64(&self, offset: usize) -> Result<&AtomicU64> {
        let ptr = self.check(offset, 8, 8)?;
        // SAFETY: AtomicU64::from_ptr requires a valid, 8-byte aligned pointer that
        // is only accessed atomically for the returned lifetime by this process.
        // Both checked above; the borrow is tied to &self, so the memory outlives it.
        Ok(unsafe { AtomicU64::from_ptr(ptr.cast::<u64>()) })
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Mapped { path, lead, .. } => {
                tracing::debug!("Unmapping {} at {:#x}", path.display(), self.phys_base);
                // SAFETY: the mapping started `lead` bytes before ptr and spans
                // lead + size bytes, exactly what map_physical passed to mmap.
                unsafe {
                    let start = self.ptr.as_ptr().sub(*lead);
                    if let Err(e) = munmap(start.cast(), lead + self.size) {
                        tracing::error!("munmap failed during drop: {e}");
                    }
                }
            }
            Backing::Anonymous { layout } => {
                // SAFETY: ptr came from alloc_zeroed with this layout in anonymous().
                unsafe { std::alloc::dealloc(self.ptr.as_ptr(), *layout) };
            }
        }
    }
}

// SAFETY: Send - the region owns its mapping or allocation exclusively; moving it
// between threads does not invalidate the memory.
unsafe impl Send for SharedMemory {}

// SAFETY: Sync - every access is bounds-checked and either volatile (data that is
// handed over through an index publish) or atomic (index words). Cross-thread
// ordering is established by the atomic index/header protocol in the queue.
unsafe impl Sync for SharedMemory {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_anonymous_region_roundtrip() {
        let mem = SharedMemory::anonymous(0x8000_0000, 4096).unwrap();
        mem.write_u32(0, 0xdead_beef).unwrap();
        mem.write_u64(8, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(mem.read_u32(0).unwrap(), 0xdead_beef);
        assert_eq!(mem.read_u64(8).unwrap(), 0x1122_3344_5566_7788);

        mem.write_words(64, &[1, 2, 3]).unwrap();
        let mut words = [0u32; 3];
        mem.read_words(64, &mut words).unwrap();
        assert_eq!(words, [1, 2, 3]);
    }

    #[test]
    fn test_bounds_and_alignment() {
        let mem = SharedMemory::anonymous(0, 64).unwrap();
        assert!(matches!(mem.read_u32(62), Err(AirError::OutOfBounds { .. })));
        assert!(matches!(mem.read_u64(4), Err(AirError::InvalidAddress { .. })));
        assert!(mem.write_bytes(60, &[0; 8]).is_err());
        assert!(mem.read_bytes(usize::MAX, &mut [0; 2]).is_err());
    }

    #[test]
    fn test_address_translation() {
        let mem = SharedMemory::anonymous(0x1000, 0x100).unwrap();
        assert!(mem.contains(0x1000, 0x100));
        assert!(!mem.contains(0x1000, 0x101));
        assert!(!mem.contains(0xfff, 1));
        assert_eq!(mem.offset_of(0x1080, 4).unwrap(), 0x80);
        assert!(mem.offset_of(0x10fe, 4).is_err());
        assert_eq!(mem.phys_addr(0x20), 0x1020);
    }

    #[test]
    fn test_atomic_view_shares_storage() {
        let mem = SharedMemory::anonymous(0, 64).unwrap();
        let idx = mem.atomic_u64(16).unwrap();
        assert_eq!(idx.fetch_add(3, Ordering::AcqRel), 0);
        assert_eq!(mem.read_u64(16).unwrap(), 3);
    }

    #[test]
    fn test_file_backed_mapping_with_unaligned_base() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(3 * 4096).unwrap();

        // start 0x100 bytes into the second page
        let mem = SharedMemory::map_physical(file.path(), 0x1100, 0x200).unwrap();
        assert!(mem.is_mapped());
        mem.write_u32(0, 0x5a5a_5a5a).unwrap();
        drop(mem);

        let again = SharedMemory::map_physical(file.path(), 0x1000, 0x400).unwrap();
        assert_eq!(again.read_u32(0x100).unwrap(), 0x5a5a_5a5a);
    }

    #[test]
    fn test_missing_device_fails() {
        let err = SharedMemory::map_physical("/nonexistent/air-mem", 0, 4096).unwrap_err();
        assert!(matches!(err, AirError::MapFailed { .. }));
    }
}
