//! Task-local box allocator
//!
//! Boxed values live in a task-private heap. Every allocation is a header
//! followed by the value body at a fixed offset, so compiled code can
//! reach the body with one constant displacement from the opaque handle.
//! Live boxes are threaded onto a doubly-linked list through their
//! headers, which lets task teardown sweep whatever compiled code leaked.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::ptr;

/// Alignment of every box allocation. The body offset is a multiple of
/// this, so bodies are as aligned as the header.
pub const BOX_ALIGN: usize = 16;

/// Layout, sizing and disposal metadata for a boxed value. Generated by
/// the compiler; this layer reads the size and forwards everything else
/// unexamined.
#[repr(C)]
pub struct TypeDesc {
    /// Intrinsic body size in bytes.
    pub size: usize,
    /// Body alignment. Must not exceed [`BOX_ALIGN`].
    pub align: usize,
    /// Disposal routine for the body, if the type has one.
    pub drop_glue: Option<unsafe extern "C" fn(*mut u8)>,
}

/// Header at the start of every box allocation.
///
/// Compiled code owns the reference count; this layer initializes it to
/// one and never touches it again. The list links belong to the
/// allocator.
#[repr(C, align(16))]
pub struct BoxHeader {
    pub ref_count: usize,
    pub td: *const TypeDesc,
    body_size: usize,
    prev: *mut BoxHeader,
    next: *mut BoxHeader,
}

impl BoxHeader {
    /// Fixed displacement from the handle to the value body.
    pub const BODY_OFFSET: usize = std::mem::size_of::<BoxHeader>();

    /// Pointer to the value body of the box at `boxp`.
    ///
    /// # Safety
    /// `boxp` must be a live box returned by [`BoxAllocator::malloc`].
    pub unsafe fn body(boxp: *mut BoxHeader) -> *mut u8 {
        unsafe { (boxp as *mut u8).add(Self::BODY_OFFSET) }
    }
}

/// The task-local heap for boxed values.
///
/// Task-private: only the thread currently running the owning task
/// touches it, so the interior state is unsynchronized.
pub struct BoxAllocator {
    live_head: Cell<*mut BoxHeader>,
    live_count: Cell<usize>,
    total_allocated: Cell<usize>,
}

impl BoxAllocator {
    pub fn new() -> Self {
        Self {
            live_head: Cell::new(ptr::null_mut()),
            live_count: Cell::new(0),
            total_allocated: Cell::new(0),
        }
    }

    /// Allocates a box for `td` with a body of `size` bytes; a `size` of
    /// zero means the descriptor's intrinsic size. The returned handle is
    /// owned by this allocator and must be released exactly once with
    /// [`free`](Self::free).
    pub fn malloc(&self, td: *const TypeDesc, size: usize) -> *mut BoxHeader {
        let body_size = if size == 0 && !td.is_null() {
            unsafe { (*td).size }
        } else {
            size
        };
        let layout = box_layout(body_size);

        let boxp = unsafe { alloc::alloc(layout) } as *mut BoxHeader;
        if boxp.is_null() {
            alloc::handle_alloc_error(layout);
        }

        unsafe {
            (*boxp).ref_count = 1;
            (*boxp).td = td;
            (*boxp).body_size = body_size;
            (*boxp).prev = ptr::null_mut();
            (*boxp).next = self.live_head.get();
            if let Some(next) = (*boxp).next.as_mut() {
                next.prev = boxp;
            }
        }
        self.live_head.set(boxp);
        self.live_count.set(self.live_count.get() + 1);
        self.total_allocated
            .set(self.total_allocated.get() + layout.size());
        boxp
    }

    /// Returns a box's storage. Releasing a handle twice, or one this
    /// allocator did not produce, is undefined behavior by caller
    /// contract.
    ///
    /// # Safety
    /// `boxp` must be a live box returned by [`malloc`](Self::malloc) on
    /// this allocator.
    pub unsafe fn free(&self, boxp: *mut BoxHeader) {
        unsafe {
            self.unlink(boxp);
            let layout = box_layout((*boxp).body_size);
            alloc::dealloc(boxp as *mut u8, layout);
        }
        self.live_count.set(self.live_count.get() - 1);
    }

    unsafe fn unlink(&self, boxp: *mut BoxHeader) {
        unsafe {
            let prev = (*boxp).prev;
            let next = (*boxp).next;
            if let Some(prev) = prev.as_mut() {
                prev.next = next;
            } else {
                self.live_head.set(next);
            }
            if let Some(next) = next.as_mut() {
                next.prev = prev;
            }
        }
    }

    /// Number of boxes allocated and not yet freed.
    pub fn live_count(&self) -> usize {
        self.live_count.get()
    }

    /// Total bytes handed out over this allocator's lifetime.
    pub fn total_allocated(&self) -> usize {
        self.total_allocated.get()
    }

    /// Frees every box still live, running drop glue where the descriptor
    /// carries one. Returns the number of boxes swept. Only the teardown
    /// path calls this, after the task's last upcall has completed.
    pub fn sweep_leaked(&self) -> usize {
        let mut swept = 0;
        while !self.live_head.get().is_null() {
            let boxp = self.live_head.get();
            unsafe {
                let td = (*boxp).td;
                if let Some(glue) = td.as_ref().and_then(|td| td.drop_glue) {
                    glue(BoxHeader::body(boxp));
                }
                self.free(boxp);
            }
            swept += 1;
        }
        swept
    }
}

impl Default for BoxAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BoxAllocator {
    fn drop(&mut self) {
        self.sweep_leaked();
    }
}

fn box_layout(body_size: usize) -> Layout {
    Layout::from_size_align(BoxHeader::BODY_OFFSET + body_size, BOX_ALIGN)
        .expect("box layout overflow")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static TD_PLAIN: TypeDesc = TypeDesc {
        size: 24,
        align: 8,
        drop_glue: None,
    };

    #[test]
    fn test_body_offset_alignment() {
        assert_eq!(BoxHeader::BODY_OFFSET % BOX_ALIGN, 0);
    }

    #[test]
    fn test_malloc_free_pairing() {
        let heap = BoxAllocator::new();
        let a = heap.malloc(&TD_PLAIN, 0);
        let b = heap.malloc(&TD_PLAIN, 100);
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_eq!(heap.live_count(), 2);

        unsafe {
            heap.free(a);
            heap.free(b);
        }
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_descriptor_intrinsic_size() {
        let heap = BoxAllocator::new();
        let boxp = heap.malloc(&TD_PLAIN, 0);
        unsafe {
            assert_eq!((*boxp).body_size, TD_PLAIN.size);
            heap.free(boxp);
        }
    }

    #[test]
    fn test_body_is_writable() {
        let heap = BoxAllocator::new();
        let boxp = heap.malloc(&TD_PLAIN, 64);
        unsafe {
            let body = BoxHeader::body(boxp);
            ptr::write_bytes(body, 0xA5, 64);
            assert_eq!(*body, 0xA5);
            heap.free(boxp);
        }
    }

    #[test]
    fn test_free_middle_of_live_list() {
        let heap = BoxAllocator::new();
        let a = heap.malloc(&TD_PLAIN, 8);
        let b = heap.malloc(&TD_PLAIN, 8);
        let c = heap.malloc(&TD_PLAIN, 8);
        unsafe {
            heap.free(b);
        }
        assert_eq!(heap.live_count(), 2);
        unsafe {
            heap.free(a);
            heap.free(c);
        }
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_sweep_runs_drop_glue() {
        static DROPPED: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C" fn note_drop(_body: *mut u8) {
            DROPPED.fetch_add(1, Ordering::SeqCst);
        }
        static TD_GLUE: TypeDesc = TypeDesc {
            size: 16,
            align: 8,
            drop_glue: Some(note_drop),
        };

        let heap = BoxAllocator::new();
        heap.malloc(&TD_GLUE, 0);
        heap.malloc(&TD_GLUE, 0);
        let before = DROPPED.load(Ordering::SeqCst);
        assert_eq!(heap.sweep_leaked(), 2);
        assert_eq!(DROPPED.load(Ordering::SeqCst) - before, 2);
        assert_eq!(heap.live_count(), 0);
    }
}
