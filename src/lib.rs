//! A two-tier allocator over a single, externally supplied region of
//! memory: a buddy allocator managing fixed-size blocks underneath a slab
//! engine that carves block runs into per-type object caches, topped with
//! a small-buffer façade (`kalloc`/`kfree`) for general-purpose power-of-
//! two allocation.
//!
//! All of an [`Allocator`]'s state — the buddy free lists, the cache of
//! caches, and the thirteen small-buffer caches — is embedded by value in
//! the first block of the region handed to [`Allocator::init`]. There is
//! no heap allocation anywhere in this crate and no state outside the
//! supplied region; that's what makes it usable with `#![no_std]`.

#![cfg_attr(not(test), no_std)]

pub mod buddy;
pub mod error;
pub mod slab;
pub mod small;
pub mod sync;
pub mod util;

use core::cell::UnsafeCell;
use core::mem;
use core::ptr;

use static_assertions::const_assert;

pub use error::{Error, ErrorCode};
pub use slab::{Cache, CacheInfo, Ctor, Dtor};

use buddy::{Buddy, BLOCK};
use small::SMALL_BUFFER_COUNT;
use sync::RawLock;

fn small_buffer_name(order: usize) -> &'static str {
    match order {
        5 => "size-5",
        6 => "size-6",
        7 => "size-7",
        8 => "size-8",
        9 => "size-9",
        10 => "size-10",
        11 => "size-11",
        12 => "size-12",
        13 => "size-13",
        14 => "size-14",
        15 => "size-15",
        16 => "size-16",
        17 => "size-17",
        _ => unreachable!("small-buffer order out of range"),
    }
}

/// Everything the allocator needs to remember, laid out to fit inside one
/// [`BLOCK`] and placed at the very start of the client's region.
#[repr(C)]
struct RegionHeader {
    buddy: Buddy,
    cache_of_caches: Cache,
    small_buffers: [Cache; SMALL_BUFFER_COUNT],
    cache_list_head: UnsafeCell<*mut Cache>,
    cache_list_lock: RawLock,
}

const_assert!(mem::size_of::<RegionHeader>() <= BLOCK);

// SAFETY: all interior mutation of `RegionHeader` goes through `Buddy`,
// `Cache`, and `RawLock`, each of which is `Sync` in its own right.
unsafe impl Sync for RegionHeader {}

/// A handle to an allocator instance living inside a client-supplied
/// region. Cheap to copy (it's one pointer); every method call reaches
/// through to the embedded state, which is what actually owns any lock.
#[derive(Clone, Copy)]
pub struct Allocator {
    header: *mut RegionHeader,
}

unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl Allocator {
    /// Installs an allocator over `region`, which must be exactly
    /// `block_count * BLOCK` bytes, aligned to `BLOCK`, and owned
    /// exclusively by the allocator from this call onward. `block_count`
    /// must be at least 2 (one block for this header, at least one for
    /// data).
    ///
    /// # Safety
    /// `region` must satisfy the above for the entire lifetime of the
    /// returned `Allocator`.
    pub unsafe fn init(region: *mut u8, block_count: usize) -> Self {
        assert!(block_count >= 2, "need a header block and at least one data block");
        assert_eq!(region as usize % BLOCK, 0, "region must be BLOCK-aligned");

        let header_ptr = region as *mut RegionHeader;
        let small_buffers: [Cache; SMALL_BUFFER_COUNT] = core::array::from_fn(|i| {
            let order = small::SMALL_MIN_ORDER + i;
            Cache::new(small_buffer_name(order), 1usize << order, None, None)
        });

        ptr::write(
            header_ptr,
            RegionHeader {
                buddy: Buddy::uninit(),
                cache_of_caches: Cache::new("cachecache", mem::size_of::<Cache>(), None, None),
                small_buffers,
                cache_list_head: UnsafeCell::new(ptr::null_mut()),
                cache_list_lock: RawLock::new(),
            },
        );

        let header = &*header_ptr;
        header.buddy.init(region, block_count);

        let coc_ptr = &header.cache_of_caches as *const Cache as *mut Cache;
        let mut head = coc_ptr;
        for sb in header.small_buffers.iter() {
            let sb_ptr = sb as *const Cache as *mut Cache;
            (*sb_ptr).set_list_next(head);
            head = sb_ptr;
        }
        *header.cache_list_head.get() = head;

        log::info!("allocator initialized over {block_count} blocks");
        Self { header: header_ptr }
    }

    fn header(&self) -> &RegionHeader {
        unsafe { &*self.header }
    }

    /// Returns the existing cache named `name`, or creates and registers
    /// a new one sized for `obj_size`-byte objects.
    pub fn cache_create(
        &self,
        name: &str,
        obj_size: usize,
        ctor: Option<Ctor>,
        dtor: Option<Dtor>,
    ) -> Option<*mut Cache> {
        let header = self.header();
        let _guard = header.cache_list_lock.guard();

        if let Some(existing) = self.find_cache_locked(header, name) {
            return Some(existing);
        }

        let raw = header.cache_of_caches.alloc(&header.buddy)?;
        let cache_ptr = raw as *mut Cache;
        unsafe {
            ptr::write(cache_ptr, Cache::new(name, obj_size, ctor, dtor));
            (*cache_ptr).set_list_next(*header.cache_list_head.get());
            *header.cache_list_head.get() = cache_ptr;
        }
        Some(cache_ptr)
    }

    /// Looks up a registered cache by name without creating one.
    pub fn find_cache(&self, name: &str) -> Option<*mut Cache> {
        let header = self.header();
        let _guard = header.cache_list_lock.guard();
        self.find_cache_locked(header, name)
    }

    fn find_cache_locked(&self, header: &RegionHeader, name: &str) -> Option<*mut Cache> {
        let mut cur = unsafe { *header.cache_list_head.get() };
        while !cur.is_null() {
            let cache = unsafe { &*cur };
            if cache.name() == name {
                return Some(cur);
            }
            cur = cache.list_next();
        }
        None
    }

    /// Acquires one object from `cache`, growing it from the buddy
    /// allocator if needed.
    pub fn cache_alloc(&self, cache: *mut Cache) -> Option<*mut u8> {
        unsafe { (*cache).alloc(&self.header().buddy) }
    }

    /// Releases `ptr` back to `cache`, if it was allocated from there.
    pub fn cache_free(&self, cache: *mut Cache, ptr: *mut u8) {
        unsafe { (*cache).free(ptr) }
    }

    /// Returns every currently-empty slab in `cache` to the buddy
    /// allocator, subject to the one-grace-period policy documented on
    /// [`Cache::shrink`].
    pub fn cache_shrink(&self, cache: *mut Cache) -> usize {
        unsafe { (*cache).shrink(&self.header().buddy) }
    }

    /// Unregisters and releases `cache`, refusing with
    /// [`Error::DeallocationError`] if any of its objects are still live.
    pub fn cache_destroy(&self, cache: *mut Cache) -> Result<(), Error> {
        let header = self.header();
        let cache_ref = unsafe { &*cache };
        cache_ref.drain_for_destroy(&header.buddy)?;

        {
            let _guard = header.cache_list_lock.guard();
            unsafe {
                let head = *header.cache_list_head.get();
                if head == cache {
                    *header.cache_list_head.get() = cache_ref.list_next();
                } else {
                    let mut prev = head;
                    let mut cur = (*prev).list_next();
                    while !cur.is_null() && cur != cache {
                        prev = cur;
                        cur = (*cur).list_next();
                    }
                    if cur == cache {
                        (*prev).set_list_next(cache_ref.list_next());
                    }
                }
            }
        }

        header.cache_of_caches.free(cache as *mut u8);
        Ok(())
    }

    /// Logs `cache`'s current shape and occupancy and returns the same
    /// snapshot.
    pub fn cache_info(&self, cache: *mut Cache) -> CacheInfo {
        let cache_ref = unsafe { &*cache };
        let info = cache_ref.info();
        log::info!(
            "cache {}: {} objs/slab, {} slabs, {}% full",
            cache_ref.name(),
            info.objects_per_slab,
            info.slab_count,
            info.fullness_pct
        );
        info
    }

    /// Returns `cache`'s last recorded error code.
    pub fn cache_error(&self, cache: *mut Cache) -> ErrorCode {
        unsafe { (*cache).error() }
    }

    /// Rounds `n` up to a power of two and allocates from the matching
    /// small-buffer cache (sizes 2^5 ..= 2^17).
    pub fn kalloc(&self, n: usize) -> Option<*mut u8> {
        let header = self.header();
        small::kalloc(&header.buddy, &header.small_buffers, n)
    }

    /// Frees a pointer obtained from [`Allocator::kalloc`].
    pub fn kfree(&self, ptr: *mut u8) {
        small::kfree(&self.header().small_buffers, ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_allocator(blocks: usize) -> (Allocator, Vec<u8>) {
        let mut mem = vec![0u8; blocks * BLOCK];
        let alloc = unsafe { Allocator::init(mem.as_mut_ptr(), blocks) };
        (alloc, mem)
    }

    #[test]
    fn cache_create_is_idempotent_by_name() {
        let (alloc, _mem) = new_allocator(64);
        let a = alloc.cache_create("widgets", 48, None, None).unwrap();
        let b = alloc.cache_create("widgets", 48, None, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cache_alloc_free_roundtrip() {
        let (alloc, _mem) = new_allocator(64);
        let cache = alloc.cache_create("widgets", 48, None, None).unwrap();
        let p = alloc.cache_alloc(cache).unwrap();
        assert_eq!(unsafe { (*cache).object_count() }, 1);
        alloc.cache_free(cache, p);
        assert_eq!(unsafe { (*cache).object_count() }, 0);
    }

    #[test]
    fn cache_destroy_refuses_with_live_objects() {
        let (alloc, _mem) = new_allocator(64);
        let cache = alloc.cache_create("widgets", 48, None, None).unwrap();
        let p = alloc.cache_alloc(cache).unwrap();
        assert_eq!(alloc.cache_destroy(cache), Err(Error::DeallocationError));
        alloc.cache_free(cache, p);
        assert!(alloc.cache_destroy(cache).is_ok());
        assert!(alloc.find_cache("widgets").is_none());
    }

    #[test]
    fn kalloc_kfree_small_buffer_dispatch() {
        let (alloc, _mem) = new_allocator(128);
        let p = alloc.kalloc(100).expect("100 bytes maps to size-7");
        alloc.kfree(p);
    }
}
