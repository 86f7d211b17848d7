//! Slab engine: per-object-type caches of fixed-size slots, carved out of
//! buddy-allocated block runs.
//!
//! A [`Cache`] keeps three intrusive singly-linked lists of [`Slab`]s
//! (`empty`, `partial`, `full`) and a free-slot bitmap per slab, MSB-first
//! within each byte (see [`crate::util::bit`]). Growing a cache asks the
//! buddy allocator for one more run; shrinking gives empty runs back.

use core::cell::UnsafeCell;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::buddy::{Buddy, BLOCK};
use crate::error::{Error, ErrorCode};
use crate::sync::RawLock;
use crate::util::align::closest_higher_pow2;
use crate::util::bit;

/// Cache-line size used to stagger slab object regions across slabs.
pub const L1_LINE: usize = 64;
const NAME_LEN: usize = 64;

pub type Ctor = fn(*mut u8);
pub type Dtor = fn(*mut u8);

/// Header placed at the start of the buddy run backing one slab. The
/// bitmap and object region immediately follow it in memory; this struct
/// only records where they start.
#[repr(C)]
struct Slab {
    color_offset: usize,
    obj_start: *mut u8,
    free_bitmap: *mut u8,
    next: *mut Slab,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SlabList {
    Partial,
    Full,
}

enum SlotOutcome {
    FoundPartial(*mut u8),
    FoundEmpty(*mut u8),
    NoSlabAvailable,
    Inconsistent,
}

/// A snapshot of a cache's shape and occupancy, for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct CacheInfo {
    pub obj_size: usize,
    pub total_blocks: usize,
    pub slab_count: usize,
    pub objects_per_slab: usize,
    pub fullness_pct: u32,
    pub unused_space: usize,
}

/// One named object cache: a set of same-shaped slabs plus the counters
/// and color state that govern how they grow and recycle.
#[repr(C)]
pub struct Cache {
    name: [u8; NAME_LEN],
    name_len: u8,

    slabs_empty: UnsafeCell<*mut Slab>,
    slabs_partial: UnsafeCell<*mut Slab>,
    slabs_full: UnsafeCell<*mut Slab>,

    object_count: UnsafeCell<usize>,
    slab_count: UnsafeCell<usize>,
    objects_per_slab: usize,
    free_map_size: usize,
    unused_space: usize,
    obj_size: usize,
    recently_added: UnsafeCell<bool>,
    next_color: UnsafeCell<usize>,

    ctor: Option<Ctor>,
    dtor: Option<Dtor>,

    /// Link for the global list of caches; not touched by any method in
    /// this module, only by the code that owns that list.
    list_next: UnsafeCell<*mut Cache>,

    lock: RawLock,
    error: AtomicU32,
}

// SAFETY: every field behind an UnsafeCell is only touched while `lock`
// is held, except `list_next`, which is touched only while the global
// cache-list lock is held by the caller.
unsafe impl Sync for Cache {}

impl Cache {
    /// Builds a cache record for objects of `obj_size` bytes. Does not
    /// insert it into any list of caches; that is the caller's job, since
    /// `Cache` has no notion of the global list it may end up on.
    pub fn new(name: &str, obj_size: usize, ctor: Option<Ctor>, dtor: Option<Dtor>) -> Self {
        let (free_map_size, objects_per_slab, unused_space) = slab_areas(obj_size);

        let mut stored_name = [0u8; NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(NAME_LEN);
        stored_name[..len].copy_from_slice(&bytes[..len]);

        Self {
            name: stored_name,
            name_len: len as u8,
            slabs_empty: UnsafeCell::new(ptr::null_mut()),
            slabs_partial: UnsafeCell::new(ptr::null_mut()),
            slabs_full: UnsafeCell::new(ptr::null_mut()),
            object_count: UnsafeCell::new(0),
            slab_count: UnsafeCell::new(0),
            objects_per_slab,
            free_map_size,
            unused_space,
            obj_size,
            recently_added: UnsafeCell::new(true),
            next_color: UnsafeCell::new(0),
            ctor,
            dtor,
            list_next: UnsafeCell::new(ptr::null_mut()),
            lock: RawLock::new(),
            error: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }

    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    pub fn objects_per_slab(&self) -> usize {
        self.objects_per_slab
    }

    pub fn object_count(&self) -> usize {
        unsafe { *self.object_count.get() }
    }

    pub fn slab_count(&self) -> usize {
        unsafe { *self.slab_count.get() }
    }

    pub fn error(&self) -> ErrorCode {
        ErrorCode::from_raw(self.error.load(Ordering::Relaxed))
    }

    pub(crate) fn list_next(&self) -> *mut Cache {
        unsafe { *self.list_next.get() }
    }

    pub(crate) fn set_list_next(&self, next: *mut Cache) {
        unsafe {
            *self.list_next.get() = next;
        }
    }

    fn set_error(&self, e: Error) {
        self.error.store(e.code(), Ordering::Relaxed);
        match e {
            Error::InconsistentSlab => {
                log::error!("cache {}: inconsistent slab detected", self.name());
            }
            _ => {
                log::warn!("cache {}: {:?}", self.name(), e);
            }
        }
    }

    /// Acquires a slot, growing the cache by one slab if no partial or
    /// empty slab exists. Prefers a partial slab over an empty one.
    pub fn alloc(&self, buddy: &Buddy) -> Option<*mut u8> {
        let _guard = self.lock.guard();

        let mut outcome = self.get_free_slot();
        if let SlotOutcome::NoSlabAvailable = outcome {
            if let Err(e) = self.extend(buddy) {
                self.set_error(e);
                return None;
            }
            outcome = self.get_free_slot();
        }

        match outcome {
            SlotOutcome::FoundPartial(addr) => {
                unsafe {
                    *self.object_count.get() += 1;
                }
                self.maybe_promote_partial_to_full();
                Some(addr)
            }
            SlotOutcome::FoundEmpty(addr) => {
                unsafe {
                    *self.object_count.get() += 1;
                }
                self.move_empty_to_partial();
                self.maybe_promote_partial_to_full();
                Some(addr)
            }
            SlotOutcome::Inconsistent => None,
            SlotOutcome::NoSlabAvailable => {
                self.set_error(Error::InconsistentSlab);
                None
            }
        }
    }

    /// Releases the slot at `addr` if it belongs to one of this cache's
    /// slabs and is currently in use. A misaligned address, or one that
    /// falls outside every slab this cache owns, is silently ignored —
    /// the small-buffer façade relies on exactly this to probe caches in
    /// turn without disturbing the ones that don't own the pointer.
    pub fn free(&self, addr: *mut u8) {
        if addr.is_null() {
            return;
        }
        let _guard = self.lock.guard();

        let (slab, from_list) = match self.find_containing_slab(addr) {
            Some(found) => found,
            None => return,
        };

        let obj_start = unsafe { (*slab).obj_start } as usize;
        let offset = addr as usize - obj_start;
        if offset % self.obj_size != 0 {
            return;
        }
        let index = offset / self.obj_size;
        let bitmap = unsafe { (*slab).free_bitmap };

        if !unsafe { bit::test(bitmap, index) } {
            self.set_error(Error::DeallocationError);
            return;
        }

        if let Some(dtor) = self.dtor {
            dtor(addr);
        }
        unsafe {
            bit::clear(bitmap, index);
            *self.object_count.get() -= 1;
        }

        if from_list == SlabList::Full {
            self.move_full_to_partial(slab);
        }
        if unsafe { bit::all_zero((*slab).free_bitmap, self.free_map_size) } {
            self.move_partial_to_empty(slab);
        }
    }

    /// Returns every empty slab to the buddy allocator and returns how
    /// many were freed, unless this cache was grown since the last call
    /// to `shrink`, in which case it clears that flag and returns 0
    /// without freeing anything (a one-grace-period policy against churn).
    pub fn shrink(&self, buddy: &Buddy) -> usize {
        let _guard = self.lock.guard();
        if unsafe { *self.recently_added.get() } {
            unsafe {
                *self.recently_added.get() = false;
            }
            return 0;
        }
        self.release_all_empty(buddy)
    }

    /// Refuses with [`Error::DeallocationError`] if any object is still
    /// live; otherwise releases every empty slab (there should be no
    /// other kind left) back to the buddy allocator.
    pub(crate) fn drain_for_destroy(&self, buddy: &Buddy) -> Result<(), Error> {
        let _guard = self.lock.guard();
        if unsafe { *self.object_count.get() } != 0 {
            return Err(Error::DeallocationError);
        }
        self.release_all_empty(buddy);
        Ok(())
    }

    pub fn info(&self) -> CacheInfo {
        let _guard = self.lock.guard();
        let slab_count = unsafe { *self.slab_count.get() };
        let object_count = unsafe { *self.object_count.get() };
        let total_blocks = total_cache_blocks(slab_count, self.obj_size);
        let fullness_pct = if slab_count == 0 || self.objects_per_slab == 0 {
            0
        } else {
            ((100 * object_count) / (slab_count * self.objects_per_slab)) as u32
        };
        CacheInfo {
            obj_size: self.obj_size,
            total_blocks,
            slab_count,
            objects_per_slab: self.objects_per_slab,
            fullness_pct,
            unused_space: self.unused_space,
        }
    }

    fn release_all_empty(&self, buddy: &Buddy) -> usize {
        let blocks = slab_block_count(self.obj_size);
        let mut count = 0;
        let mut cur = unsafe { *self.slabs_empty.get() };
        while !cur.is_null() {
            let next = unsafe { (*cur).next };
            buddy.free(cur as *mut u8, blocks);
            count += 1;
            unsafe {
                *self.slab_count.get() -= 1;
            }
            cur = next;
        }
        unsafe {
            *self.slabs_empty.get() = ptr::null_mut();
        }
        count
    }

    fn get_free_slot(&self) -> SlotOutcome {
        let partial = unsafe { *self.slabs_partial.get() };
        let (slab, from_partial) = if !partial.is_null() {
            (partial, true)
        } else {
            let empty = unsafe { *self.slabs_empty.get() };
            if empty.is_null() {
                return SlotOutcome::NoSlabAvailable;
            }
            (empty, false)
        };

        let bitmap = unsafe { (*slab).free_bitmap };
        match unsafe { bit::first_zero(bitmap, self.objects_per_slab) } {
            Some(i) => {
                unsafe {
                    bit::set(bitmap, i);
                }
                let addr = unsafe { (*slab).obj_start.add(i * self.obj_size) };
                if from_partial {
                    SlotOutcome::FoundPartial(addr)
                } else {
                    SlotOutcome::FoundEmpty(addr)
                }
            }
            None => {
                self.set_error(Error::InconsistentSlab);
                SlotOutcome::Inconsistent
            }
        }
    }

    fn find_containing_slab(&self, addr: *mut u8) -> Option<(*mut Slab, SlabList)> {
        let mut cur = unsafe { *self.slabs_full.get() };
        while !cur.is_null() {
            if self.addr_in_slab(cur, addr) {
                return Some((cur, SlabList::Full));
            }
            cur = unsafe { (*cur).next };
        }
        cur = unsafe { *self.slabs_partial.get() };
        while !cur.is_null() {
            if self.addr_in_slab(cur, addr) {
                return Some((cur, SlabList::Partial));
            }
            cur = unsafe { (*cur).next };
        }
        None
    }

    fn addr_in_slab(&self, slab: *mut Slab, addr: *mut u8) -> bool {
        let start = unsafe { (*slab).obj_start } as usize;
        let end = start + self.objects_per_slab * self.obj_size;
        let a = addr as usize;
        a >= start && a < end
    }

    fn move_empty_to_partial(&self) {
        unsafe {
            let slab = pop_front(&self.slabs_empty);
            push_front(&self.slabs_partial, slab);
        }
    }

    fn maybe_promote_partial_to_full(&self) {
        let head = unsafe { *self.slabs_partial.get() };
        if head.is_null() {
            return;
        }
        let bitmap = unsafe { (*head).free_bitmap };
        if unsafe { bit::all_ones(bitmap, self.objects_per_slab) } {
            unsafe {
                let slab = pop_front(&self.slabs_partial);
                push_front(&self.slabs_full, slab);
            }
        }
    }

    fn move_full_to_partial(&self, slab: *mut Slab) {
        unsafe {
            unlink(&self.slabs_full, slab);
            push_front(&self.slabs_partial, slab);
        }
    }

    fn move_partial_to_empty(&self, slab: *mut Slab) {
        unsafe {
            unlink(&self.slabs_partial, slab);
            push_front(&self.slabs_empty, slab);
        }
    }

    /// Grows the cache by one buddy-allocated slab, running the
    /// constructor (if any) over every slot, and links it onto `empty`.
    fn extend(&self, buddy: &Buddy) -> Result<(), Error> {
        let blocks = slab_block_count(self.obj_size);
        let raw = buddy.alloc(blocks).ok_or(Error::AllocationError)?;

        let slab_ptr = raw as *mut Slab;
        let bitmap = unsafe { raw.add(mem::size_of::<Slab>()) };
        unsafe {
            for i in 0..self.free_map_size {
                bitmap.add(i).write(0);
            }
        }

        let color_offset = unsafe { *self.next_color.get() };
        let obj_start = unsafe { bitmap.add(self.free_map_size).add(color_offset) };

        unsafe {
            ptr::write(
                slab_ptr,
                Slab {
                    color_offset,
                    obj_start,
                    free_bitmap: bitmap,
                    next: ptr::null_mut(),
                },
            );
        }

        let next_color = if color_offset + L1_LINE > self.unused_space {
            0
        } else {
            color_offset + L1_LINE
        };
        unsafe {
            *self.next_color.get() = next_color;
        }

        if let Some(ctor) = self.ctor {
            let mut cur = obj_start;
            for _ in 0..self.objects_per_slab {
                ctor(cur);
                cur = unsafe { cur.add(self.obj_size) };
            }
        }

        unsafe {
            push_front(&self.slabs_empty, slab_ptr);
            *self.slab_count.get() += 1;
            *self.recently_added.get() = true;
        }
        Ok(())
    }
}

unsafe fn unlink(list: &UnsafeCell<*mut Slab>, target: *mut Slab) {
    let head = *list.get();
    if head == target {
        *list.get() = (*target).next;
        return;
    }
    let mut prev = head;
    while !prev.is_null() {
        let next = (*prev).next;
        if next == target {
            (*prev).next = (*target).next;
            return;
        }
        prev = next;
    }
}

unsafe fn push_front(list: &UnsafeCell<*mut Slab>, node: *mut Slab) {
    (*node).next = *list.get();
    *list.get() = node;
}

unsafe fn pop_front(list: &UnsafeCell<*mut Slab>) -> *mut Slab {
    let head = *list.get();
    if !head.is_null() {
        *list.get() = (*head).next;
    }
    head
}

/// Minimum power-of-two block count that fits a slab header, one bitmap
/// byte, and one object of `obj_size` bytes.
fn slab_block_count(obj_size: usize) -> usize {
    let min_size = mem::size_of::<Slab>() + 1 + obj_size;
    let blocks = (min_size + BLOCK - 1) / BLOCK;
    closest_higher_pow2(blocks.max(1))
}

/// Computes `(free_map_size, objects_per_slab, unused_space)` for a slab
/// sized by [`slab_block_count`]: the largest object count that still
/// fits its own bitmap alongside it, grown one object at a time.
fn slab_areas(obj_size: usize) -> (usize, usize, usize) {
    let slab_size = slab_block_count(obj_size) * BLOCK;
    let space = slab_size - mem::size_of::<Slab>();

    let mut num_of_obj = 0usize;
    let mut map_size = 1usize;
    loop {
        let next_map_size = if (num_of_obj + 1) % 8 == 0 {
            map_size + 1
        } else {
            map_size
        };
        if next_map_size + (num_of_obj + 1) * obj_size <= space {
            num_of_obj += 1;
            map_size = next_map_size;
        } else {
            break;
        }
    }

    let unused_space = space - (map_size + num_of_obj * obj_size);
    (map_size, num_of_obj, unused_space)
}

fn total_cache_blocks(slab_count: usize, obj_size: usize) -> usize {
    let total_size = mem::size_of::<Cache>() + slab_count * slab_block_count(obj_size) * BLOCK;
    (total_size + BLOCK - 1) / BLOCK
}
