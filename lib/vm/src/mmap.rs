//! Virtual-memory reservations with page-granular commit.
//!
//! All runtime objects that rely on guard pages (linear memories, table
//! element arrays, compartment runtime data) are built on the same shape:
//! one large mapping reserved up front with no access rights, whose head
//! is made readable/writable as the object grows. The base address of a
//! reservation never changes.

use more_asserts::assert_le;
use std::io;
use std::slice;

/// The smallest multiple of `page_size` that is >= `size`.
pub(crate) fn round_up_to_pages(size: usize, page_size: usize) -> usize {
    debug_assert!(page_size.is_power_of_two());
    size.div_ceil(page_size) * page_size
}

/// A page-aligned virtual reservation, partially committed.
#[derive(Debug)]
pub struct Mmap {
    // The base address is kept as an integer rather than a pointer: the
    // mapping is plain shared state coordinated by the OS, and an integer
    // base leaves the type Send + Sync without unsafe impls.
    ptr: usize,
    total_size: usize,
    accessible_size: usize,
    // Where the usable region begins inside the raw mapping; non-zero only
    // for `aligned_reserved` mappings, which over-reserve to find an
    // aligned address.
    start: usize,
}

impl Mmap {
    /// A reservation of zero bytes.
    pub fn empty() -> Self {
        Self {
            // Any non-null, never-dereferenced address will do for a
            // zero-length mapping.
            ptr: std::ptr::NonNull::<u8>::dangling().as_ptr() as usize,
            total_size: 0,
            accessible_size: 0,
            start: 0,
        }
    }

    /// Reserve `mapping_size` bytes of address space and commit the first
    /// `accessible_size` of them. Both sizes must be multiples of the native
    /// page size. The uncommitted tail faults on any access until
    /// [`Mmap::make_accessible`] commits more of it.
    pub fn accessible_reserved(
        accessible_size: usize,
        mapping_size: usize,
    ) -> Result<Self, String> {
        let page_size = region::page::size();
        assert_eq!(accessible_size % page_size, 0);
        assert_eq!(mapping_size % page_size, 0);
        assert_le!(accessible_size, mapping_size);

        if mapping_size == 0 {
            return Ok(Self::empty());
        }

        // Reserve the whole range with no access rights; the kernel hands
        // out zeroed pages as regions are committed and first touched.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapping_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().to_string());
        }

        let mapping = Self {
            ptr: raw as usize,
            total_size: mapping_size,
            accessible_size,
            start: 0,
        };
        if accessible_size != 0 {
            mapping.make_accessible(0, accessible_size)?;
        }
        Ok(mapping)
    }

    /// Reserve `size` usable bytes whose base address is a multiple of
    /// `1 << alignment_log2`.
    ///
    /// The kernel gives no alignment guarantee beyond the page size, so the
    /// reservation is padded by one alignment unit and the usable region
    /// starts at the first aligned address inside it; the padding stays
    /// reserved and is never committed.
    pub fn aligned_reserved(size: usize, alignment_log2: u32) -> Result<Self, String> {
        let page_size = region::page::size();
        let alignment = 1usize << alignment_log2;
        assert_eq!(size % page_size, 0);
        assert_eq!(alignment % page_size, 0, "alignment must cover whole pages");

        let padded_size = size
            .checked_add(alignment)
            .ok_or_else(|| "aligned reservation size overflows the address space".to_string())?;

        let mut mapping = Self::accessible_reserved(0, padded_size)?;
        mapping.start = mapping.ptr.wrapping_neg() % alignment;
        Ok(mapping)
    }

    /// Commit the `len` bytes starting `start` bytes into the usable region.
    /// Both must be multiples of the native page size, and the range must
    /// lie inside the reservation.
    ///
    /// Takes `&self`: committing pages mutates only OS-level protection, and
    /// growing objects do this under their own resizing lock.
    pub fn make_accessible(&self, start: usize, len: usize) -> Result<(), String> {
        let page_size = region::page::size();
        assert_eq!(start % page_size, 0);
        assert_eq!(len % page_size, 0);
        assert_le!(len, self.len());
        assert_le!(start, self.len() - len);

        unsafe { region::protect(self.as_ptr().add(start), len, region::Protection::READ_WRITE) }
            .map_err(|e| e.to_string())
    }

    /// View the usable region as bytes.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    /// View the usable region as mutable bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.as_mut_ptr(), self.len()) }
    }

    /// The base address of the usable region.
    pub fn as_ptr(&self) -> *const u8 {
        (self.ptr + self.start) as *const u8
    }

    /// The base address of the usable region, mutably.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        (self.ptr + self.start) as *mut u8
    }

    /// The size of the usable region in bytes.
    pub fn len(&self) -> usize {
        self.total_size - self.start
    }

    /// Whether the reservation is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of bytes committed by the constructor.
    pub fn accessible_len(&self) -> usize {
        self.accessible_size
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if self.total_size == 0 {
            return;
        }
        let result = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.total_size) };
        assert_eq!(
            result,
            0,
            "failed to release a virtual reservation: {}",
            io::Error::last_os_error()
        );
    }
}

impl Default for Mmap {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_and_sync<T: Send + Sync>() {}

    #[test]
    fn mappings_are_send_and_sync() {
        assert_send_and_sync::<Mmap>();
    }

    #[test]
    fn rounding_to_pages() {
        assert_eq!(round_up_to_pages(0, 16384), 0);
        assert_eq!(round_up_to_pages(1, 16384), 16384);
        assert_eq!(round_up_to_pages(16384, 16384), 16384);
        assert_eq!(round_up_to_pages(16385, 16384), 32768);
    }

    #[test]
    fn committed_head_is_writable() {
        let page_size = region::page::size();
        let mut map = Mmap::accessible_reserved(page_size, page_size * 16).unwrap();
        map.as_mut_slice()[..page_size].fill(0xa5);
        assert_eq!(map.as_slice()[page_size - 1], 0xa5);

        map.make_accessible(page_size, page_size).unwrap();
        map.as_mut_slice()[page_size] = 1;
    }

    #[test]
    fn committed_pages_start_zeroed() {
        let page_size = region::page::size();
        let map = Mmap::accessible_reserved(page_size, page_size * 2).unwrap();
        assert!(map.as_slice()[..page_size].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn aligned_reservation_is_aligned() {
        let alignment_log2 = 24; // 16 MiB: large enough to exercise the trim
        let map = Mmap::aligned_reserved(1 << 26, alignment_log2).unwrap();
        assert_eq!((map.as_ptr() as usize) % (1 << alignment_log2), 0);
        assert_le!(1 << 26, map.len());
    }
}
