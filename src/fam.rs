//! Variable-length kernel records.
//!
//! Several KVM ioctls take a structure made of a fixed header that holds an
//! entry count, immediately followed by a flexible array member (FAM) of
//! entries. The kernel expects the whole thing in one contiguous buffer:
//!
//! ```text
//! ┌──────────────────────┬─────────┬─────────┬─────┬──────────────────┐
//! │ Header (count, ...)  │ entry 0 │ entry 1 │ ... │ entry capacity-1 │
//! └──────────────────────┴─────────┴─────────┴─────┴──────────────────┘
//! ^ as_fam_struct_ptr()  ^ ENTRY_OFFSET
//! ```
//!
//! [`FamRecord`] owns exactly one such allocation. Its capacity is fixed at
//! construction, and its length is never stored separately: the header's
//! count field is the only source of truth, so the two cannot drift apart.
//!
//! The shape of a record (header type, entry type, where the array starts,
//! how wide the count is) is described by a [`FamLayout`] implementation.
//! Concrete KVM shapes live in `kvm::records`.

use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::{Index, IndexMut};
use std::ptr::{self, NonNull};
use std::slice;

use thiserror::Error;

/// Errors produced while building or filling a [`FamRecord`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamError {
    /// More entries were supplied than the record can hold.
    #[error("{requested} entries exceed the record capacity of {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    /// The capacity cannot be represented in the header's count field.
    #[error("capacity {capacity} does not fit in the record's count field")]
    CountOverflow { capacity: usize },

    /// The byte size of the record overflows `isize`.
    #[error("record layout for capacity {capacity} overflows the address space")]
    LayoutOverflow { capacity: usize },
}

/// Description of one header-plus-trailing-array record shape.
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// - `Header` is a `#[repr(C)]` type for which the all-zero bit pattern is valid.
/// - The all-zero bit pattern is a valid `Entry`. Unused slots are zeroed and
///   become readable once the count covers them.
/// - `ENTRY_OFFSET` is the byte offset of the flexible array within the
///   kernel ABI struct, and is not smaller than `size_of::<Header>()`.
/// - `ENTRY_STRIDE` is the distance in bytes between two consecutive entries
///   in the kernel ABI struct.
/// - `count`/`set_count` read and write the header's count field, and
///   `MAX_COUNT` is the largest value that field can hold.
pub unsafe trait FamLayout {
    /// Fixed part of the record.
    type Header;

    /// Element of the trailing array.
    type Entry: Copy;

    /// Byte offset of entry 0 from the start of the header.
    const ENTRY_OFFSET: usize;

    /// Byte distance between consecutive entries.
    const ENTRY_STRIDE: usize;

    /// Largest value the count field can represent.
    const MAX_COUNT: usize;

    /// Read the count field.
    fn count(header: &Self::Header) -> usize;

    /// Write the count field. `count` never exceeds `MAX_COUNT`.
    fn set_count(header: &mut Self::Header, count: usize);
}

/// A fixed-capacity, heap-allocated record with a counted trailing array.
///
/// Indexing is bounds-checked against the current length in every build
/// profile; an out-of-range index panics.
pub struct FamRecord<L: FamLayout> {
    ptr: NonNull<u8>,
    layout: Layout,
    capacity: usize,
    _marker: PhantomData<(L::Header, L::Entry)>,
}

// The record exclusively owns its allocation.
unsafe impl<L: FamLayout> Send for FamRecord<L>
where
    L::Header: Send,
    L::Entry: Send,
{
}
unsafe impl<L: FamLayout> Sync for FamRecord<L>
where
    L::Header: Sync,
    L::Entry: Sync,
{
}

impl<L: FamLayout> FamRecord<L> {
    // Rejected at monomorphization time for shapes the container cannot
    // address as a contiguous slice.
    const LAYOUT_CHECK: () = {
        assert!(size_of::<L::Header>() > 0, "FAM header must not be zero-sized");
        assert!(
            L::ENTRY_OFFSET >= size_of::<L::Header>(),
            "FAM entries overlap the header"
        );
        assert!(
            L::ENTRY_OFFSET % align_of::<L::Entry>() == 0,
            "FAM entries are misaligned"
        );
        assert!(
            L::ENTRY_STRIDE == size_of::<L::Entry>(),
            "kernel entry stride differs from the entry type size"
        );
    };

    /// Byte layout of a record with room for `capacity` entries.
    fn layout_for(capacity: usize) -> Result<Layout, FamError> {
        let overflow = FamError::LayoutOverflow { capacity };
        let size = capacity
            .checked_mul(L::ENTRY_STRIDE)
            .and_then(|bytes| bytes.checked_add(L::ENTRY_OFFSET))
            .ok_or(overflow)?;
        let align = align_of::<L::Header>().max(align_of::<L::Entry>());
        Layout::from_size_align(size, align).map_err(|_| overflow)
    }

    /// Allocate a zeroed record with room for `capacity` entries and a
    /// length of zero.
    ///
    /// Allocation failure aborts through the global allocation error handler.
    pub fn new(capacity: usize) -> Result<Self, FamError> {
        let () = Self::LAYOUT_CHECK;

        if capacity > L::MAX_COUNT {
            return Err(FamError::CountOverflow { capacity });
        }
        let layout = Self::layout_for(capacity)?;

        // SAFETY: the layout has a non-zero size (the header is not zero-sized).
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));

        let mut record = Self {
            ptr,
            layout,
            capacity,
            _marker: PhantomData,
        };
        L::set_count(record.header_mut(), 0);
        Ok(record)
    }

    /// Allocate a record with room for `capacity` entries holding `entries`.
    pub fn from_entries(capacity: usize, entries: &[L::Entry]) -> Result<Self, FamError> {
        if entries.len() > capacity {
            return Err(FamError::CapacityExceeded {
                requested: entries.len(),
                capacity,
            });
        }
        let mut record = Self::new(capacity)?;
        record.assign(entries)?;
        Ok(record)
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of entries, as stored in the header.
    pub fn len(&self) -> usize {
        L::count(self.header())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the whole allocation in bytes.
    pub fn byte_len(&self) -> usize {
        self.layout.size()
    }

    /// Replace every entry with `entries`.
    ///
    /// On error the record is left untouched.
    pub fn assign(&mut self, entries: &[L::Entry]) -> Result<(), FamError> {
        if entries.len() > self.capacity {
            return Err(FamError::CapacityExceeded {
                requested: entries.len(),
                capacity: self.capacity,
            });
        }

        self.zero_entries(0);
        // SAFETY: `entries.len() <= capacity`, so the destination lies inside
        // the allocation, and a borrowed slice cannot alias our buffer.
        unsafe {
            ptr::copy_nonoverlapping(entries.as_ptr(), self.entry_ptr(0), entries.len());
        }
        L::set_count(self.header_mut(), entries.len());
        Ok(())
    }

    /// Append one entry.
    pub fn push(&mut self, entry: L::Entry) -> Result<(), FamError> {
        let len = self.len();
        if len >= self.capacity {
            return Err(FamError::CapacityExceeded {
                requested: len + 1,
                capacity: self.capacity,
            });
        }
        // SAFETY: `len < capacity`.
        unsafe { ptr::write(self.entry_ptr(len), entry) };
        L::set_count(self.header_mut(), len + 1);
        Ok(())
    }

    /// Keep only the entries for which `keep` returns `true`, preserving order.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&L::Entry) -> bool,
    {
        let len = self.len();
        let mut kept = 0;
        for i in 0..len {
            // SAFETY: `i < len <= capacity` and `kept <= i`.
            unsafe {
                let entry = ptr::read(self.entry_ptr(i));
                if keep(&entry) {
                    ptr::write(self.entry_ptr(kept), entry);
                    kept += 1;
                }
            }
        }
        self.zero_entries(kept);
        L::set_count(self.header_mut(), kept);
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.zero_entries(0);
        L::set_count(self.header_mut(), 0);
    }

    pub fn as_slice(&self) -> &[L::Entry] {
        // SAFETY: the count never exceeds capacity, and every slot up to
        // capacity is initialized (zeroed at allocation, then written).
        unsafe { slice::from_raw_parts(self.entry_ptr(0), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [L::Entry] {
        let len = self.len();
        // SAFETY: as in `as_slice`, and `&mut self` guarantees uniqueness.
        unsafe { slice::from_raw_parts_mut(self.entry_ptr(0), len) }
    }

    pub fn get(&self, index: usize) -> Option<&L::Entry> {
        self.as_slice().get(index)
    }

    pub fn iter(&self) -> slice::Iter<'_, L::Entry> {
        self.as_slice().iter()
    }

    /// Borrow the header.
    pub fn as_fam_struct_ref(&self) -> &L::Header {
        self.header()
    }

    /// Address of the header, suitable for handing to an ioctl.
    pub fn as_fam_struct_ptr(&self) -> *const L::Header {
        self.ptr.as_ptr().cast()
    }

    /// Mutable address of the header, suitable for handing to an ioctl.
    ///
    /// Whoever writes through this pointer must keep the count field within
    /// [`capacity`](Self::capacity).
    pub fn as_mut_fam_struct_ptr(&mut self) -> *mut L::Header {
        self.ptr.as_ptr().cast()
    }

    /// Advertise the full capacity to the kernel ahead of an ioctl that
    /// fills the record and writes back the number of entries it produced.
    pub(crate) fn prepare_for_kernel(&mut self) {
        self.zero_entries(0);
        let capacity = self.capacity;
        L::set_count(self.header_mut(), capacity);
    }

    /// Validate the count written back by the kernel. An out-of-range count
    /// is reset to zero so the record stays consistent.
    pub(crate) fn accept_kernel_count(&mut self) -> Result<(), FamError> {
        let count = L::count(self.header());
        if count > self.capacity {
            L::set_count(self.header_mut(), 0);
            return Err(FamError::CapacityExceeded {
                requested: count,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn header(&self) -> &L::Header {
        // SAFETY: the allocation is aligned for `Header` and starts with a
        // zero-initialized (hence valid) header.
        unsafe { &*self.ptr.as_ptr().cast::<L::Header>() }
    }

    fn header_mut(&mut self) -> &mut L::Header {
        // SAFETY: as in `header`, and `&mut self` guarantees uniqueness.
        unsafe { &mut *self.ptr.as_ptr().cast::<L::Header>() }
    }

    /// Pointer to slot `index`. Callers keep `index <= capacity`.
    fn entry_ptr(&self, index: usize) -> *mut L::Entry {
        debug_assert!(index <= self.capacity);
        // SAFETY: `ENTRY_OFFSET + index * ENTRY_STRIDE` is within (or one past
        // the end of) the allocation for `index <= capacity`.
        unsafe {
            self.ptr
                .as_ptr()
                .add(L::ENTRY_OFFSET + index * L::ENTRY_STRIDE)
                .cast()
        }
    }

    /// Zero slots `from..capacity`.
    fn zero_entries(&mut self, from: usize) {
        let count = self.capacity - from;
        // SAFETY: the range lies inside the allocation.
        unsafe {
            ptr::write_bytes(self.entry_ptr(from).cast::<u8>(), 0, count * L::ENTRY_STRIDE);
        }
    }
}

impl<L: FamLayout> Drop for FamRecord<L> {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl<L: FamLayout> Clone for FamRecord<L> {
    fn clone(&self) -> Self {
        let layout = self.layout;
        // SAFETY: non-zero size, see `new`.
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        // SAFETY: both buffers are `layout.size()` bytes and distinct.
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr(), ptr.as_ptr(), layout.size()) };
        Self {
            ptr,
            layout,
            capacity: self.capacity,
            _marker: PhantomData,
        }
    }
}

/// Two records are equal when they hold the same entries; capacity is ignored.
impl<L: FamLayout> PartialEq for FamRecord<L>
where
    L::Entry: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.as_slice() == other.as_slice()
    }
}

impl<L: FamLayout> Index<usize> for FamRecord<L> {
    type Output = L::Entry;

    fn index(&self, index: usize) -> &L::Entry {
        &self.as_slice()[index]
    }
}

impl<L: FamLayout> IndexMut<usize> for FamRecord<L> {
    fn index_mut(&mut self, index: usize) -> &mut L::Entry {
        &mut self.as_mut_slice()[index]
    }
}

impl<'a, L: FamLayout> IntoIterator for &'a FamRecord<L> {
    type Item = &'a L::Entry;
    type IntoIter = slice::Iter<'a, L::Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<L: FamLayout> fmt::Debug for FamRecord<L>
where
    L::Entry: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FamRecord")
            .field("capacity", &self.capacity)
            .field("entries", &self.as_slice())
            .finish()
    }
}
