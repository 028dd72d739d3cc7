// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Internal heap serving EMA nodes and bitmap buffers.
//!
//! Memory comes from a list of reserves carved out of the user window by
//! calling back into the public allocation path, so growing the heap
//! re-enters the manager on the same thread. While such a callback is in
//! flight (`adding_reserve`), allocations are served from a static meta
//! reserve and frees of meta blocks are dropped; this bounds the recursion
//! at one level.
//!
//! Blocks carry an 8-byte header holding their size and an in-use bit. Free
//! blocks of up to 2 KiB sit on size-segregated LIFO lists; everything
//! larger goes to a single best-fit list. All functions here must be called
//! with the EMM mutex held.

use core::mem::size_of;
use core::ptr::{self, addr_of_mut};

use crate::addr::round_to;
use crate::cell::LockedCell;
use crate::error::EmmResult;
use crate::flags::AllocFlags;
use crate::mm;

/// Initial reserve size, doubled on each addition.
pub(crate) const INITIAL_RESERVE_SIZE: usize = 0x10000;

const META_RESERVE_SIZE: usize = 0x10000;

// large enough for the bit map of an 8T area
const MAX_EMALLOC_SIZE: usize = 0x1000_0000;

const NUM_EXACT_LIST: usize = 0x100;
const HEADER_SIZE: usize = 8;
const EXACT_MATCH_INCREMENT: usize = 8;
// includes the 8-byte header
const MIN_BLOCK_SIZE: usize = 0x10;
const MAX_EXACT_SIZE: usize = MIN_BLOCK_SIZE + EXACT_MATCH_INCREMENT * (NUM_EXACT_LIST - 1);

const ALLOC_MASK: u64 = 1;
const SIZE_MASK: u64 = !(EXACT_MATCH_INCREMENT as u64 - 1);

const GUARD_SIZE: usize = 0x8000;

/// A block is an 8-byte header directly followed by the payload. Free blocks
/// reuse the payload for the list links: the next pointer always fits, the
/// back pointer only exists in blocks larger than [`MIN_BLOCK_SIZE`].
type BlockPtr = *mut u64;

/// A contiguous committed region blocks are bump-allocated from. The header
/// lives at the start of the region itself.
#[repr(C)]
struct Reserve {
    base: usize,
    size: usize,
    used: usize,
    next: *mut Reserve,
}

struct Heap {
    exact: [BlockPtr; NUM_EXACT_LIST],
    large: BlockPtr,
    reserves: *mut Reserve,
    adding_reserve: bool,
    reserve_size_increment: usize,
    meta_used: usize,
}

impl Heap {
    const fn new() -> Self {
        Self {
            exact: [ptr::null_mut(); NUM_EXACT_LIST],
            large: ptr::null_mut(),
            reserves: ptr::null_mut(),
            adding_reserve: false,
            reserve_size_increment: INITIAL_RESERVE_SIZE,
            meta_used: 0,
        }
    }
}

static HEAP: LockedCell<Heap> = LockedCell::new(Heap::new());

#[repr(align(8))]
struct MetaReserve([u8; META_RESERVE_SIZE]);

static META: LockedCell<MetaReserve> = LockedCell::new(MetaReserve([0; META_RESERVE_SIZE]));

fn meta_range() -> (usize, usize) {
    let base = META.get() as usize;
    (base, base + META_RESERVE_SIZE)
}

unsafe fn block_size(b: BlockPtr) -> usize {
    (*b & SIZE_MASK) as usize
}

unsafe fn is_alloced(b: BlockPtr) -> bool {
    *b & ALLOC_MASK != 0
}

unsafe fn block_end(b: BlockPtr) -> usize {
    b as usize + block_size(b)
}

unsafe fn payload(b: BlockPtr) -> *mut u8 {
    (b as *mut u8).add(HEADER_SIZE)
}

unsafe fn from_payload(p: *mut u8) -> BlockPtr {
    p.sub(HEADER_SIZE) as BlockPtr
}

unsafe fn next_of(b: BlockPtr) -> BlockPtr {
    *(b.add(1) as *mut BlockPtr)
}

unsafe fn set_next(b: BlockPtr, v: BlockPtr) {
    *(b.add(1) as *mut BlockPtr) = v;
}

unsafe fn prev_of(b: BlockPtr) -> BlockPtr {
    *(b.add(2) as *mut BlockPtr)
}

unsafe fn set_prev(b: BlockPtr, v: BlockPtr) {
    *(b.add(2) as *mut BlockPtr) = v;
}

fn get_list_idx(size: usize) -> usize {
    debug_assert!(size % EXACT_MATCH_INCREMENT == 0);
    if size < MIN_BLOCK_SIZE {
        return 0;
    }
    let idx = (size - MIN_BLOCK_SIZE) / EXACT_MATCH_INCREMENT;
    debug_assert!(idx < NUM_EXACT_LIST);
    idx
}

unsafe fn find_used_in_reserve(addr: usize, size: usize) -> *mut Reserve {
    if size == 0 {
        return ptr::null_mut();
    }
    let mut r = (*HEAP.get()).reserves;
    while !r.is_null() {
        if addr >= (*r).base && addr + size <= (*r).base + (*r).used {
            return r;
        }
        r = (*r).next;
    }
    ptr::null_mut()
}

unsafe fn remove_from_list(b: BlockPtr, head: *mut BlockPtr) {
    let bsize = block_size(b);
    if b == *head {
        let next = next_of(b);
        *head = next;
        if !next.is_null() && block_size(next) > MIN_BLOCK_SIZE {
            set_prev(next, ptr::null_mut());
        }
        return;
    }
    let next = next_of(b);
    let prev = if bsize > MIN_BLOCK_SIZE {
        prev_of(b)
    } else {
        // minimum-size blocks carry no back link; locate the predecessor
        let mut cur = *head;
        while !cur.is_null() && next_of(cur) != b {
            cur = next_of(cur);
        }
        cur
    };
    if !prev.is_null() {
        set_next(prev, next);
    }
    if !next.is_null() && block_size(next) > MIN_BLOCK_SIZE {
        set_prev(next, prev);
    }
}

unsafe fn remove_from_lists(b: BlockPtr) {
    let h = HEAP.get();
    let bsize = block_size(b);
    if bsize > MAX_EXACT_SIZE {
        remove_from_list(b, addr_of_mut!((*h).large));
    } else {
        remove_from_list(b, addr_of_mut!((*h).exact[get_list_idx(bsize)]));
    }
}

unsafe fn prepend_to_list(b: BlockPtr, head: *mut BlockPtr) {
    set_next(b, *head);
    if !(*head).is_null() && block_size(*head) > MIN_BLOCK_SIZE {
        set_prev(*head, b);
    }
    *head = b;
}

unsafe fn put_free_block(b: BlockPtr) {
    let h = HEAP.get();
    let bsize = block_size(b);
    if bsize <= MAX_EXACT_SIZE {
        prepend_to_list(b, addr_of_mut!((*h).exact[get_list_idx(bsize)]));
    } else {
        prepend_to_list(b, addr_of_mut!((*h).large));
    }
}

unsafe fn neighbor_right(me: BlockPtr) -> BlockPtr {
    let end = block_end(me);
    let r1 = find_used_in_reserve(me as usize, block_size(me));
    if r1.is_null() {
        return ptr::null_mut();
    }
    if end == (*r1).base + (*r1).used {
        return ptr::null_mut();
    }
    let nb = end as BlockPtr;
    let r2 = find_used_in_reserve(end, block_size(nb));
    if r1 != r2 {
        return ptr::null_mut();
    }
    nb
}

// Merge with the left neighbor is not implemented, that would need a scan or
// a footer. Most blocks are similar-sized EMA nodes, single-sided
// coalescing is enough.
unsafe fn possibly_merge(b: BlockPtr) -> BlockPtr {
    loop {
        let nr = neighbor_right(b);
        if nr.is_null() || is_alloced(nr) {
            break;
        }
        remove_from_lists(nr);
        *b += block_size(nr) as u64;
    }
    b
}

unsafe fn split_free_block(b: BlockPtr, s: usize) -> BlockPtr {
    let remain = block_size(b) - s;
    debug_assert!(remain >= MIN_BLOCK_SIZE);
    *b = s as u64;
    let new_b = (b as *mut u8).add(s) as BlockPtr;
    *new_b = remain as u64;
    new_b
}

unsafe fn get_exact_match(bsize: usize) -> BlockPtr {
    let h = HEAP.get();
    let idx = get_list_idx(bsize);
    let head = addr_of_mut!((*h).exact[idx]);
    let ret = *head;
    if ret.is_null() {
        return ret;
    }
    *head = next_of(ret);
    if idx > 0 && !(*head).is_null() {
        set_prev(*head, ptr::null_mut());
    }
    ret
}

unsafe fn get_free_block(bsize: usize) -> BlockPtr {
    if bsize <= MAX_EXACT_SIZE {
        return get_exact_match(bsize);
    }

    let h = HEAP.get();
    // Large free blocks are few: a best-fit scan over one list is enough.
    let mut tmp = (*h).large;
    let mut best: BlockPtr = ptr::null_mut();
    while !tmp.is_null() {
        if block_size(tmp) >= bsize && (best.is_null() || block_size(best) > block_size(tmp)) {
            best = tmp;
        }
        tmp = next_of(tmp);
    }
    if best.is_null() {
        return best;
    }
    remove_from_list(best, addr_of_mut!((*h).large));
    if block_size(best) >= bsize + MIN_BLOCK_SIZE {
        let tail = split_free_block(best, bsize);
        put_free_block(tail);
    }
    best
}

unsafe fn get_large_block_end_at(addr: usize) -> BlockPtr {
    let h = HEAP.get();
    let mut tmp = (*h).large;
    while !tmp.is_null() {
        if block_end(tmp) == addr {
            remove_from_list(tmp, addr_of_mut!((*h).large));
            return tmp;
        }
        tmp = next_of(tmp);
    }
    ptr::null_mut()
}

unsafe fn merge_large_blocks_to_reserve(r: *mut Reserve) {
    let mut used_end = (*r).base + (*r).used;
    let mut merge = get_large_block_end_at(used_end);
    while !merge.is_null() {
        used_end -= block_size(merge);
        merge = get_large_block_end_at(used_end);
    }
    (*r).used = used_end - (*r).base;
}

unsafe fn new_reserve(base: usize, rsize: usize) {
    let h = HEAP.get();
    let reserve = base as *mut Reserve;
    let head_size = size_of::<Reserve>();
    (*reserve).base = base + head_size;
    (*reserve).used = 0;
    (*reserve).size = rsize - head_size;
    (*reserve).next = (*h).reserves;
    (*h).reserves = reserve;
}

unsafe fn alloc_from_reserve(bsize: usize) -> BlockPtr {
    let mut r = (*HEAP.get()).reserves;
    while !r.is_null() {
        if (*r).size - (*r).used >= bsize {
            let ret = (*r).base + (*r).used;
            (*r).used += bsize;
            return ret as BlockPtr;
        }
        r = (*r).next;
    }
    ptr::null_mut()
}

unsafe fn alloc_from_meta(bsize: usize) -> *mut u8 {
    let h = HEAP.get();
    debug_assert!((*h).adding_reserve);
    if (*h).meta_used + bsize > META_RESERVE_SIZE {
        return ptr::null_mut();
    }
    let b = (META.get() as *mut u8).add((*h).meta_used) as BlockPtr;
    (*h).meta_used += bsize;
    *b = bsize as u64 | ALLOC_MASK;
    payload(b)
}

/// Obtain a fresh reserve through the public allocation path: a RESERVE
/// span with guard regions on both sides, the middle committed on demand.
fn reserve_from_user_window(incr: usize, commit_size: usize) -> EmmResult {
    let guard_base = mm::alloc(
        None,
        incr + 2 * GUARD_SIZE,
        AllocFlags::RESERVE,
        None,
        ptr::null_mut(),
    )?;
    let base = mm::alloc(
        Some(guard_base + GUARD_SIZE),
        incr,
        AllocFlags::COMMIT_ON_DEMAND | AllocFlags::FIXED,
        None,
        ptr::null_mut(),
    )?;
    mm::commit(base, commit_size)?;
    unsafe { new_reserve(base, incr) };
    Ok(())
}

fn add_reserve(rsize: usize) -> EmmResult {
    let h = HEAP.get();
    unsafe {
        if (*h).adding_reserve {
            // nested call from the allocation path below; served by the meta
            // reserve instead
            return Ok(());
        }
        if (*h).reserve_size_increment < rsize {
            (*h).reserve_size_increment = rsize;
        }
        (*h).adding_reserve = true;
    }
    let incr = unsafe { (*h).reserve_size_increment };
    let result = reserve_from_user_window(incr, rsize);
    unsafe {
        (*h).adding_reserve = false;
        if result.is_ok() {
            (*h).reserve_size_increment = (incr * 2).min(MAX_EMALLOC_SIZE);
        }
    }
    result
}

/// Bootstrap the heap with its first reserve.
pub(crate) fn emalloc_init_reserve(init_size: usize) -> EmmResult {
    add_reserve(init_size)?;
    unsafe { (*HEAP.get()).reserve_size_increment = INITIAL_RESERVE_SIZE };
    Ok(())
}

/// Allocate at least `size` bytes. Returns null when the heap cannot grow.
pub(crate) fn emalloc(size: usize) -> *mut u8 {
    let mut bsize = round_to(size + HEADER_SIZE, EXACT_MATCH_INCREMENT);
    if bsize < MIN_BLOCK_SIZE {
        bsize = MIN_BLOCK_SIZE;
    }

    unsafe {
        if (*HEAP.get()).adding_reserve {
            // called back from add_reserve
            return alloc_from_meta(bsize);
        }

        let b = get_free_block(bsize);
        if !b.is_null() {
            // an unsplit best-fit block keeps its full size
            *b = block_size(b) as u64 | ALLOC_MASK;
            return payload(b);
        }

        let mut b = alloc_from_reserve(bsize);
        if b.is_null() {
            let new_reserve_size = round_to(bsize + size_of::<Reserve>(), INITIAL_RESERVE_SIZE);
            if add_reserve(new_reserve_size).is_err() {
                return ptr::null_mut();
            }
            b = alloc_from_reserve(bsize);
            if b.is_null() {
                return ptr::null_mut();
            }
        }
        *b = bsize as u64 | ALLOC_MASK;
        payload(b)
    }
}

unsafe fn reconfigure_block(b: BlockPtr) -> BlockPtr {
    *b &= SIZE_MASK;
    set_next(b, ptr::null_mut());
    if block_size(b) > MIN_BLOCK_SIZE {
        set_prev(b, ptr::null_mut());
    }
    possibly_merge(b)
}

/// Whether `payload` may be freed or reallocated. Blocks living in the meta
/// reserve may not, except while a reserve addition is in flight.
pub(crate) fn can_erealloc(payload: *mut u8) -> bool {
    unsafe {
        let b = from_payload(payload);
        let bstart = b as usize;
        let bsize = block_size(b);
        let (meta_lo, meta_hi) = meta_range();
        if (*HEAP.get()).adding_reserve {
            true
        } else {
            !(bstart < meta_hi && bstart + bsize > meta_lo)
        }
    }
}

/// Return a block to the heap. Inconsistencies abort: this interface only
/// serves the manager itself.
pub(crate) fn efree(payload: *mut u8) {
    unsafe {
        let b = from_payload(payload);
        let bstart = b as usize;
        let bsize = block_size(b);
        let (meta_lo, meta_hi) = meta_range();
        if bstart < meta_hi && bstart + bsize > meta_lo {
            if (*HEAP.get()).adding_reserve {
                // meta-reserve blocks are never reused
                debug_assert!(bstart >= meta_lo);
                debug_assert!(bstart + bsize <= meta_hi);
                return;
            }
            error!("efree: block {:#x} lies in the meta reserve", bstart);
            panic!("efree: meta reserve misuse");
        }

        let r = find_used_in_reserve(bstart, bsize);
        if r.is_null() {
            error!("efree: block {:#x} belongs to no reserve", bstart);
            panic!("efree: unknown block");
        }
        let b = reconfigure_block(b);
        let end = block_end(b);
        if end - (*r).base == (*r).used {
            (*r).used -= block_size(b);
            merge_large_blocks_to_reserve(r);
            return;
        }

        put_free_block(b);
    }
}

/// Drop all heap bookkeeping. The backing regions are reclaimed when the
/// enclave itself goes away.
pub(crate) fn reset() {
    unsafe { *HEAP.get() = Heap::new() };
}
