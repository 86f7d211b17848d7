//! The six concrete scenarios, run against the crate's public API.

use buddy_slab::buddy::{Buddy, BLOCK};
use buddy_slab::slab::L1_LINE;
use buddy_slab::Allocator;

fn new_allocator(blocks: usize) -> (Allocator, Vec<u8>) {
    let mut mem = vec![0u8; blocks * BLOCK];
    let alloc = unsafe { Allocator::init(mem.as_mut_ptr(), blocks) };
    (alloc, mem)
}

#[test]
fn scenario_1_init_and_single_alloc() {
    let mut mem = vec![0u8; 16 * BLOCK];
    let mem_start = unsafe { mem.as_mut_ptr().add(BLOCK) };
    let buddy = Buddy::uninit();
    unsafe { buddy.init(mem.as_mut_ptr(), 16) };

    // 16 blocks - 1 header = 15 usable, covered by one run each at
    // orders 3, 2, 1, 0 (8 + 4 + 2 + 1). alloc(5) rounds to order 3 and
    // must hand back that run's own address, the leftmost (and only)
    // one at that order.
    let addr = buddy.alloc(5).expect("order-3 run satisfies a request for 5 blocks");
    assert_eq!(addr, mem_start);
}

#[test]
fn scenario_2_split_chain_and_scenario_3_merge_chain() {
    let mut mem = vec![0u8; 33 * BLOCK];
    let mem_start = unsafe { mem.as_mut_ptr().add(BLOCK) };
    let buddy = Buddy::uninit();
    unsafe { buddy.init(mem.as_mut_ptr(), 33) };

    // 33 - 1 = 32 usable blocks: a single order-5 run at mem_start.
    // Allocating 1 block forces a full split chain down to order 0,
    // and the returned block is the leftmost leaf of that chain.
    let one = buddy.alloc(1).expect("splits the order-5 run down to order 0");
    assert_eq!(one, mem_start);

    // Freeing it must coalesce all the way back up: a fresh request for
    // the full 32 blocks succeeds and lands on the very same address.
    buddy.free(one, 1);
    let merged = buddy.alloc(32).expect("coalescing restored the order-5 run");
    assert_eq!(merged, mem_start);
}

#[test]
fn scenario_4_slab_lifecycle() {
    let (alloc, _mem) = new_allocator(64);
    let cache = alloc.cache_create("obj-100", 100, None, None).unwrap();
    let per_slab = unsafe { (*cache).objects_per_slab() };
    assert!(per_slab > 0);

    let mut ptrs = Vec::with_capacity(per_slab);
    for _ in 0..per_slab {
        ptrs.push(alloc.cache_alloc(cache).expect("one slab's worth of slots"));
    }
    assert_eq!(alloc.cache_info(cache).fullness_pct, 100, "slab should read as full");

    let last = ptrs.pop().unwrap();
    alloc.cache_free(cache, last);
    let mid = alloc.cache_info(cache).fullness_pct;
    assert!(mid > 0 && mid < 100, "slab should read as partial, got {mid}%");

    for p in ptrs.drain(..) {
        alloc.cache_free(cache, p);
    }
    assert_eq!(unsafe { (*cache).object_count() }, 0);

    assert_eq!(alloc.cache_shrink(cache), 0, "first shrink only clears the grace flag");
    assert_eq!(alloc.cache_shrink(cache), 1, "second shrink returns the empty slab");
    assert_eq!(unsafe { (*cache).slab_count() }, 0);
}

#[test]
fn scenario_5_coloring_stagger() {
    let (alloc, _mem) = new_allocator(256);
    // obj_size chosen so a slab only fits 2 objects, leaving over a
    // thousand bytes of unused_space; a small obj_size packs the slab
    // tightly enough that unused_space < L1_LINE and no stagger ever
    // shows up in the object addresses.
    let cache = alloc.cache_create("colored", 1400, None, None).unwrap();
    let info = alloc.cache_info(cache);
    assert!(info.unused_space >= 192, "need room for at least 3 color steps");

    let per_slab = info.objects_per_slab;
    let mut starts = Vec::with_capacity(4);
    for _ in 0..4 {
        let mut slots = Vec::with_capacity(per_slab);
        for slot in 0..per_slab {
            let p = alloc.cache_alloc(cache).unwrap();
            if slot == 0 {
                starts.push(p as usize);
            }
            slots.push(p);
        }
        for p in slots {
            alloc.cache_free(cache, p);
        }
        // Fully release the slab so the next extend draws the same
        // buddy run back; only the color offset should then differ
        // between consecutive starts.
        assert_eq!(alloc.cache_shrink(cache), 0);
        assert_eq!(alloc.cache_shrink(cache), 1);
    }

    for w in starts.windows(2) {
        let diff = w[1] as isize - w[0] as isize;
        assert!(
            diff == L1_LINE as isize || diff < 0,
            "expected a stagger of L1_LINE or a wrap to zero, got {diff}"
        );
    }
}

#[test]
fn scenario_6_small_buffer_dispatch() {
    let (alloc, _mem) = new_allocator(128);
    let size7 = alloc.find_cache("size-7").expect("small buffers exist from init");
    let before = unsafe { (*size7).object_count() };

    let p = alloc.kalloc(100).expect("100 bytes maps to the 128-byte size-7 cache");
    assert_eq!(unsafe { (*size7).object_count() }, before + 1);

    for order in 5..=17usize {
        if order == 7 {
            continue;
        }
        let name = format!("size-{order}");
        let other = alloc.find_cache(&name).unwrap();
        assert_eq!(unsafe { (*other).object_count() }, 0, "only size-7 should hold an object");
    }

    alloc.kfree(p);
    assert_eq!(unsafe { (*size7).object_count() }, before);
}
