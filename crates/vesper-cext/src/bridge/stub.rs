//! Backing allocations for handles given out to native code.
//!
//! Every managed value that crosses into native code is represented by a
//! stub: a real heap block carrying the standard object header (reference
//! count, type pointer) plus the item count word used by variable-size
//! values. Extension code may read the header fields directly; everything
//! else goes through the call layer.
//!
//! Stubs are uniform blocks so release never needs to recover a per-value
//! layout. They are 8-aligned, which keeps the low three pointer bits
//! clear; some extension libraries tag those bits and expect them to be
//! zero on fresh pointers.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};

use crate::abi;

/// Size of one stub block: object header plus the item count word.
pub const STUB_SIZE: usize = abi::varobj::SIZE;

const STUB_ALIGN: usize = 8;

fn stub_layout() -> Layout {
    // Both inputs are small constants; this cannot fail.
    Layout::from_size_align(STUB_SIZE, STUB_ALIGN).expect("stub layout")
}

/// Allocates a zeroed stub block and returns its address.
///
/// Allocation failure aborts the process; a bridge that cannot produce a
/// handle has no way to report the error to either domain.
pub fn alloc_stub() -> usize {
    let layout = stub_layout();
    // Zeroing gives a null type pointer and zero count until initialized.
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    debug_assert_eq!(ptr as usize % STUB_ALIGN, 0);
    ptr as usize
}

/// Returns a stub block to the allocator.
///
/// # Safety
///
/// `ptr` must have come from [`alloc_stub`] and must not be freed twice.
/// No native code may hold a live reference to the stub.
pub unsafe fn free_stub(ptr: usize) {
    dealloc(ptr as *mut u8, stub_layout());
}

/// Writes the object header of a fresh stub.
///
/// # Safety
///
/// `ptr` must point at a live stub block.
pub unsafe fn init_header(ptr: usize, refcnt: u64, type_ptr: usize) {
    abi::store_refcnt(ptr, refcnt);
    abi::write_word(ptr, abi::obj::OB_TYPE, type_ptr);
}

/// Writes the item count of a variable-size stub.
///
/// # Safety
///
/// `ptr` must point at a live stub block.
pub unsafe fn set_item_count(ptr: usize, count: i64) {
    abi::write_i64(ptr, abi::varobj::OB_SIZE, count);
}

/// Reads the type pointer of an object header.
///
/// # Safety
///
/// `ptr` must point at a live object header, stub or foreign.
pub unsafe fn type_of(ptr: usize) -> usize {
    abi::read_word(ptr, abi::obj::OB_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_alignment_leaves_tag_bits_clear() {
        let ptr = alloc_stub();
        assert_eq!(ptr & 0b111, 0);
        unsafe { free_stub(ptr) };
    }

    #[test]
    fn test_header_round_trip() {
        let ptr = alloc_stub();
        unsafe {
            assert_eq!(type_of(ptr), 0);
            init_header(ptr, abi::MANAGED_REFCNT, 0xDEAD_0000);
            set_item_count(ptr, 3);
            assert_eq!(abi::load_refcnt(ptr), abi::MANAGED_REFCNT);
            assert_eq!(type_of(ptr), 0xDEAD_0000);
            assert_eq!(abi::read_i64(ptr, abi::varobj::OB_SIZE), 3);
            free_stub(ptr);
        }
    }

    #[test]
    fn test_distinct_stubs_get_distinct_addresses() {
        let a = alloc_stub();
        let b = alloc_stub();
        assert_ne!(a, b);
        unsafe {
            free_stub(a);
            free_stub(b);
        }
    }
}
