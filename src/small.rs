//! Small-buffer façade: general-purpose power-of-two allocation layered
//! over a fixed array of slab caches, one per size class.

use crate::buddy::Buddy;
use crate::slab::Cache;
use crate::util::align::{ceil_log2, closest_higher_pow2};

/// Smallest small-buffer size class, as a power of two (2^5 = 32 bytes).
pub const SMALL_MIN_ORDER: usize = 5;
/// Largest small-buffer size class, as a power of two (2^17 = 128 KiB).
pub const SMALL_MAX_ORDER: usize = 17;
/// Number of size classes covered by the façade.
pub const SMALL_BUFFER_COUNT: usize = SMALL_MAX_ORDER - SMALL_MIN_ORDER + 1;

/// Rounds `n` up to the next power of two and dispatches to the matching
/// cache. Fails for `n == 0` or for sizes outside `2^5 ..= 2^17`.
pub fn kalloc(buddy: &Buddy, caches: &[Cache; SMALL_BUFFER_COUNT], n: usize) -> Option<*mut u8> {
    if n == 0 {
        return None;
    }
    let rounded = closest_higher_pow2(n);
    let order = ceil_log2(rounded);
    if order < SMALL_MIN_ORDER || order > SMALL_MAX_ORDER {
        return None;
    }
    caches[order - SMALL_MIN_ORDER].alloc(buddy)
}

/// Finds the owning cache by probing each small-buffer cache in turn and
/// frees from it. A cache that doesn't own `ptr` silently declines (see
/// [`Cache::free`]), so the first one whose `object_count` actually drops
/// is the one that served the original allocation.
pub fn kfree(caches: &[Cache; SMALL_BUFFER_COUNT], ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    for cache in caches.iter() {
        let before = cache.object_count();
        cache.free(ptr);
        if cache.object_count() < before {
            return;
        }
    }
}
