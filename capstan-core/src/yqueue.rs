//! Chunked FIFO storage for the single-producer single-consumer pipe.
//!
//! Elements live in fixed-size chunks linked into a list, so a growing queue
//! allocates once per `N` elements instead of once per element. The most
//! recently emptied chunk is parked in a one-slot spare and handed back to
//! the writer on the next boundary crossing, which keeps a steady-state
//! queue at zero allocations.
//!
//! Cursor state is split by role: `back_*` fields are only touched by the
//! pushing side, `begin_*` fields only by the popping side. The queue is
//! `!Sync` and has no locking of its own; [`crate::ypipe`] layers the
//! cross-thread publication protocol on top and is responsible for keeping
//! the two roles on their own fields.
//!
//! # Safety
//!
//! This module uses unsafe code for the chunk list and for reading slots
//! out of `MaybeUninit` storage. The soundness argument is local: a slot is
//! only read between the matching push and pop of its position, and chunk
//! links are only followed towards positions the caller has proven occupied.

#![allow(unsafe_code)]

use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Chunk<T, const N: usize> {
    slots: [UnsafeCell<MaybeUninit<T>>; N],
    prev: Cell<*mut Chunk<T, N>>,
    next: Cell<*mut Chunk<T, N>>,
}

impl<T, const N: usize> Chunk<T, N> {
    fn allocate() -> *mut Self {
        Box::into_raw(Box::new(Self {
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            prev: Cell::new(ptr::null_mut()),
            next: Cell::new(ptr::null_mut()),
        }))
    }
}

/// Unbounded FIFO over chunked storage.
///
/// Positions are monotonic counters: [`back_pos`](Self::back_pos) counts
/// pushes, [`front_pos`](Self::front_pos) counts pops, and the queue is
/// empty exactly when they are equal. The counters never wrap in practice
/// (a `u64` outlives the process at any realistic message rate).
pub struct YQueue<T, const N: usize> {
    begin_chunk: Cell<*mut Chunk<T, N>>,
    begin_index: Cell<usize>,
    front_pos: Cell<u64>,
    back_chunk: Cell<*mut Chunk<T, N>>,
    back_index: Cell<usize>,
    back_pos: Cell<u64>,
    /// Last emptied chunk, kept for reuse. Exchanged with `AcqRel` so the
    /// adopting side sees the releasing side's final accesses.
    spare: AtomicPtr<Chunk<T, N>>,
}

// Moving the queue moves ownership of every chunk and element with it.
unsafe impl<T: Send, const N: usize> Send for YQueue<T, N> {}

impl<T, const N: usize> YQueue<T, N> {
    #[must_use]
    pub fn new() -> Self {
        let first = Chunk::allocate();
        Self {
            begin_chunk: Cell::new(first),
            begin_index: Cell::new(0),
            front_pos: Cell::new(0),
            back_chunk: Cell::new(first),
            back_index: Cell::new(0),
            back_pos: Cell::new(0),
            spare: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Total number of elements ever pushed. Writer-side state.
    #[must_use]
    pub fn back_pos(&self) -> u64 {
        self.back_pos.get()
    }

    /// Total number of elements ever popped. Reader-side state.
    #[must_use]
    pub fn front_pos(&self) -> u64 {
        self.front_pos.get()
    }

    /// Append `value` at the back.
    pub fn push(&self, value: T) {
        let mut chunk = self.back_chunk.get();
        let mut index = self.back_index.get();
        if index == N {
            chunk = self.advance_back(chunk);
            index = 0;
        }
        unsafe {
            (*(*chunk).slots[index].get()).write(value);
        }
        self.back_index.set(index + 1);
        self.back_pos.set(self.back_pos.get() + 1);
    }

    /// Remove and return the most recently pushed element.
    ///
    /// # Safety
    ///
    /// The element at `back_pos - 1` must exist and must still belong to
    /// the pushing side: it must not have been published to a reader.
    /// Calling this on an empty queue is undefined behaviour.
    pub unsafe fn unpush(&self) -> T {
        let mut chunk = self.back_chunk.get();
        let mut index = self.back_index.get();
        if index == 0 {
            chunk = (*chunk).prev.get();
            debug_assert!(!chunk.is_null());
            self.back_chunk.set(chunk);
            index = N;
        }
        index -= 1;
        self.back_index.set(index);
        self.back_pos.set(self.back_pos.get() - 1);
        (*(*chunk).slots[index].get()).assume_init_read()
    }

    /// Remove and return the front element.
    ///
    /// # Safety
    ///
    /// The element at `front_pos` must have been pushed, and on a shared
    /// queue its publication must be visible to this thread. Calling this
    /// on an empty queue is undefined behaviour.
    pub unsafe fn pop(&self) -> T {
        let mut chunk = self.begin_chunk.get();
        let mut index = self.begin_index.get();
        if index == N {
            let emptied = chunk;
            chunk = (*emptied).next.get();
            debug_assert!(!chunk.is_null());
            (*chunk).prev.set(ptr::null_mut());
            self.begin_chunk.set(chunk);
            index = 0;
            self.recycle(emptied);
        }
        let value = (*(*chunk).slots[index].get()).assume_init_read();
        self.begin_index.set(index + 1);
        self.front_pos.set(self.front_pos.get() + 1);
        value
    }

    /// Borrow the front element without popping it.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::pop`].
    pub unsafe fn front(&self) -> &T {
        let mut chunk = self.begin_chunk.get();
        let mut index = self.begin_index.get();
        if index == N {
            chunk = (*chunk).next.get();
            debug_assert!(!chunk.is_null());
            index = 0;
        }
        (*(*chunk).slots[index].get()).assume_init_ref()
    }

    /// Move the back cursor into the next chunk, reusing the spare chunk or
    /// an abandoned successor before allocating a fresh one.
    fn advance_back(&self, chunk: *mut Chunk<T, N>) -> *mut Chunk<T, N> {
        unsafe {
            let mut next = (*chunk).next.get();
            if next.is_null() {
                next = self.spare.swap(ptr::null_mut(), Ordering::AcqRel);
                if next.is_null() {
                    next = Chunk::allocate();
                } else {
                    (*next).next.set(ptr::null_mut());
                }
                (*next).prev.set(chunk);
                (*chunk).next.set(next);
            }
            self.back_chunk.set(next);
            next
        }
    }

    /// Park an emptied chunk in the spare slot, freeing whatever was there.
    fn recycle(&self, chunk: *mut Chunk<T, N>) {
        let displaced = self.spare.swap(chunk, Ordering::AcqRel);
        if !displaced.is_null() {
            unsafe { drop(Box::from_raw(displaced)) };
        }
    }
}

impl<T, const N: usize> Default for YQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for YQueue<T, N> {
    fn drop(&mut self) {
        unsafe {
            // Drop the elements still sitting between the cursors.
            let mut remaining = self.back_pos.get() - self.front_pos.get();
            let mut chunk = self.begin_chunk.get();
            let mut index = self.begin_index.get();
            while remaining > 0 {
                if index == N {
                    chunk = (*chunk).next.get();
                    index = 0;
                }
                ptr::drop_in_place((*(*chunk).slots[index].get()).as_mut_ptr());
                index += 1;
                remaining -= 1;
            }
            // Free the chunk chain and the spare.
            let mut chunk = self.begin_chunk.get();
            while !chunk.is_null() {
                let next = (*chunk).next.get();
                drop(Box::from_raw(chunk));
                chunk = next;
            }
            let spare = self.spare.swap(ptr::null_mut(), Ordering::AcqRel);
            if !spare.is_null() {
                drop(Box::from_raw(spare));
            }
        }
    }
}
