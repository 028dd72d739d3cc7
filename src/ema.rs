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

//! Enclave memory areas: the region bookkeeping and the EDMM transitions.
//!
//! Each window (RTS and user) is tracked by a sentinel-guarded circular
//! doubly-linked list of [`Ema`] nodes, sorted by start address and
//! non-overlapping. Nodes are blocks from the internal heap and never move
//! until destroyed, so raw links stay valid across heap growth. Everything
//! here runs under the EMM mutex; re-entry on the same thread can insert
//! nodes while an operation is in flight, which is why iterations save the
//! next link before mutating and never keep references across calls that may
//! allocate.

use core::mem::size_of;
use core::ptr::{self, addr_of_mut};

use crate::addr::{round_to, trim_to};
use crate::bitmap::BitArray;
use crate::cell::LockedCell;
use crate::consts::{PAGE_SHIFT, PAGE_SIZE};
use crate::emalloc::{can_erealloc, efree, emalloc};
use crate::error::EmmResult;
use crate::flags::{AllocFlags, PageFlags, PageType, SecInfo, SecInfoBlock};
use crate::mm;
use crate::rt::{rt, PfHandler};

/// One contiguous page-aligned region and its per-page EACCEPT state.
pub(crate) struct Ema {
    pub start: usize,
    pub size: usize,
    pub alloc_flags: AllocFlags,
    pub si: SecInfo,
    /// One bit per page, set iff the page has been EACCEPTed into its
    /// current state. Absent on pure RESERVE areas.
    pub eaccept_map: Option<BitArray>,
    /// Demand-load hook for fault-driven commit.
    pub handler: Option<PfHandler>,
    pub priv_data: *mut u8,
    pub next: *mut Ema,
    pub prev: *mut Ema,
}

impl Ema {
    const fn empty() -> Self {
        Self {
            start: 0,
            size: 0,
            alloc_flags: AllocFlags::empty(),
            si: SecInfo::new(PageFlags::empty(), PageType::Reg),
            eaccept_map: None,
            handler: None,
            priv_data: ptr::null_mut(),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        }
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RootKind {
    Rts,
    User,
}

/// Owner of one list; the sentinel node is embedded so an empty list is the
/// guard linked to itself.
pub(crate) struct EmaRoot {
    guard: Ema,
    kind: RootKind,
}

static RTS_ROOT: LockedCell<EmaRoot> = LockedCell::new(EmaRoot {
    guard: Ema::empty(),
    kind: RootKind::Rts,
});

static USER_ROOT: LockedCell<EmaRoot> = LockedCell::new(EmaRoot {
    guard: Ema::empty(),
    kind: RootKind::User,
});

pub(crate) fn rts_root() -> *mut EmaRoot {
    RTS_ROOT.get()
}

pub(crate) fn user_root() -> *mut EmaRoot {
    USER_ROOT.get()
}

unsafe fn guard_of(root: *mut EmaRoot) -> *mut Ema {
    addr_of_mut!((*root).guard)
}

/// Relink both sentinels to themselves, forgetting any nodes.
pub(crate) unsafe fn reset_roots() {
    for root in [rts_root(), user_root()] {
        let g = guard_of(root);
        (*g).next = g;
        (*g).prev = g;
    }
}

fn is_within_user_range(start: usize, size: usize) -> bool {
    let (user_base, user_end) = mm::user_window();
    if start.checked_add(size).is_none() {
        return false;
    }
    start >= user_base && start + size <= user_end
}

fn is_within_rts_range(start: usize, size: usize) -> bool {
    let (user_base, user_end) = mm::user_window();
    if start.checked_add(size).is_none() {
        return false;
    }
    start >= user_end || start + size <= user_base
}

unsafe fn ema_lower_than_addr(node: *mut Ema, addr: usize) -> bool {
    (*node).end() <= addr
}

unsafe fn ema_higher_than_addr(node: *mut Ema, addr: usize) -> bool {
    (*node).start >= addr
}

unsafe fn ema_overlap_addr(node: *mut Ema, addr: usize) -> bool {
    addr >= (*node).start && addr < (*node).end()
}

/// Make the whole bitmap ones, creating it when absent.
pub(crate) unsafe fn ema_set_eaccept_full(node: *mut Ema) -> EmmResult {
    match (*node).eaccept_map.as_mut() {
        Some(map) => map.set_all(),
        None => (*node).eaccept_map = Some(BitArray::new_set((*node).size >> PAGE_SHIFT)?),
    }
    Ok(())
}

/// Make the whole bitmap zeros, creating it when absent.
pub(crate) unsafe fn ema_clear_eaccept_full(node: *mut Ema) -> EmmResult {
    match (*node).eaccept_map.as_mut() {
        Some(map) => map.reset_all(),
        None => (*node).eaccept_map = Some(BitArray::new_reset((*node).size >> PAGE_SHIFT)?),
    }
    Ok(())
}

/// Mark `[start, end)` as accepted, creating the bitmap when absent.
pub(crate) unsafe fn ema_set_eaccept(node: *mut Ema, start: usize, end: usize) -> EmmResult {
    debug_assert!(start >= (*node).start);
    debug_assert!(end <= (*node).end());
    let pos_begin = (start - (*node).start) >> PAGE_SHIFT;
    let pos_end = (end - (*node).start) >> PAGE_SHIFT;
    if (*node).eaccept_map.is_none() {
        (*node).eaccept_map = Some(BitArray::new_reset((*node).size >> PAGE_SHIFT)?);
    }
    (*node)
        .eaccept_map
        .as_mut()
        .unwrap()
        .set_range(pos_begin, pos_end - pos_begin);
    Ok(())
}

pub(crate) unsafe fn ema_page_committed(node: *mut Ema, addr: usize) -> bool {
    debug_assert!(addr % PAGE_SIZE == 0);
    match (*node).eaccept_map.as_ref() {
        Some(map) => map.test((addr - (*node).start) >> PAGE_SHIFT),
        None => false,
    }
}

/// The unique node whose range contains `addr`, or null.
pub(crate) unsafe fn search_ema(root: *mut EmaRoot, addr: usize) -> *mut Ema {
    let guard = guard_of(root);
    let mut node = (*guard).next;
    while node != guard {
        if ema_overlap_addr(node, addr) {
            return node;
        }
        node = (*node).next;
    }
    ptr::null_mut()
}

/// The nodes intersecting `[start, end)`: the first one, and the node right
/// after the last one (possibly the guard). None when nothing intersects.
pub(crate) unsafe fn search_ema_range(
    root: *mut EmaRoot,
    start: usize,
    end: usize,
) -> Option<(*mut Ema, *mut Ema)> {
    let guard = guard_of(root);
    let mut node = (*guard).next;

    while node != guard && ema_lower_than_addr(node, start) {
        node = (*node).next;
    }

    if node == guard || ema_higher_than_addr(node, end) {
        return None;
    }

    let first = node;
    while node != guard && !ema_higher_than_addr(node, end) {
        node = (*node).next;
    }

    Some((first, node))
}

// insert 'new_node' before 'node'
unsafe fn insert_ema(new_node: *mut Ema, node: *mut Ema) -> *mut Ema {
    (*new_node).prev = (*node).prev;
    (*new_node).next = node;
    (*(*node).prev).next = new_node;
    (*node).prev = new_node;
    new_node
}

unsafe fn replace_ema(new_node: *mut Ema, old_node: *mut Ema) {
    (*(*old_node).prev).next = new_node;
    (*(*old_node).next).prev = new_node;
    (*new_node).next = (*old_node).next;
    (*new_node).prev = (*old_node).prev;
}

unsafe fn remove_ema(node: *mut Ema) -> *mut Ema {
    // Sanity check pointers for corruption
    if (*(*node).prev).next != node || (*(*node).next).prev != node {
        error!("EMA list corruption at {:#x}", (*node).start);
        panic!("EMA list corruption");
    }
    (*(*node).prev).next = (*node).next;
    (*(*node).next).prev = (*node).prev;
    node
}

/// Append a node at the end of the list. Callers must keep the list sorted.
#[allow(dead_code)]
pub(crate) unsafe fn push_back_ema(root: *mut EmaRoot, node: *mut Ema) {
    insert_ema(node, guard_of(root));
}

/// Whether `[addr, addr + size)` lies inside this root's window.
pub(crate) unsafe fn within_window(root: *mut EmaRoot, addr: usize, size: usize) -> bool {
    match (*root).kind {
        RootKind::Rts => is_within_rts_range(addr, size),
        RootKind::User => is_within_user_range(addr, size),
    }
}

/// Visit every node in address order.
pub(crate) unsafe fn for_each_ema(root: *mut EmaRoot, f: &mut dyn FnMut(*mut Ema)) {
    let guard = guard_of(root);
    let mut node = (*guard).next;
    while node != guard {
        f(node);
        node = (*node).next;
    }
}

unsafe fn ema_aligned_end(node: *mut Ema, align: usize) -> usize {
    round_to((*node).end(), align)
}

/// First-fit scan for `size` free bytes anywhere in the root's window.
/// Returns the chosen address and the node the new area goes in front of.
pub(crate) unsafe fn find_free_region(
    root: *mut EmaRoot,
    size: usize,
    align: usize,
) -> Option<(usize, *mut Ema)> {
    let is_rts = (*root).kind == RootKind::Rts;
    let (user_base, user_end) = mm::user_window();
    let guard = guard_of(root);
    let ema_begin = (*guard).next;

    // no node on the root yet
    if ema_begin == guard {
        if is_rts {
            // prefer the space right below the user window
            if user_base >= size {
                let tmp = trim_to(user_base - size, align);
                if rt().is_within_enclave(tmp, size) {
                    debug_assert!(is_within_rts_range(tmp, size));
                    return Some((tmp, guard));
                }
            }
            let tmp = round_to(user_end, align);
            if tmp.checked_add(size).is_some() && rt().is_within_enclave(tmp, size) {
                debug_assert!(is_within_rts_range(tmp, size));
                return Some((tmp, guard));
            }
            return None;
        }
        let tmp = round_to(user_base, align);
        if is_within_user_range(tmp, size) {
            return Some((tmp, guard));
        }
        return None;
    }

    // gaps between nodes, in address order
    let mut curr = ema_begin;
    let mut next = (*curr).next;
    while next != guard {
        let curr_end = ema_aligned_end(curr, align);
        if curr_end <= (*next).start {
            let free_size = (*next).start - curr_end;
            if free_size >= size && (!is_rts || is_within_rts_range(curr_end, size)) {
                return Some((curr_end, next));
            }
        }
        curr = next;
        next = (*curr).next;
    }

    // the region above the last node
    let tmp = ema_aligned_end(curr, align);
    if rt().is_within_enclave(tmp, size)
        && ((is_rts && is_within_rts_range(tmp, size))
            || (!is_rts && is_within_user_range(tmp, size)))
    {
        return Some((tmp, next));
    }

    // the region below the first node
    if (*ema_begin).start < size {
        return None;
    }
    let tmp = trim_to((*ema_begin).start - size, align);
    if is_rts {
        if rt().is_within_enclave(tmp, size) && is_within_rts_range(tmp, size) {
            return Some((tmp, ema_begin));
        }
    } else if is_within_user_range(tmp, size) {
        return Some((tmp, ema_begin));
    }

    None
}

/// Whether `[addr, addr + size)` is free on this root; returns the node the
/// new area goes in front of.
pub(crate) unsafe fn find_free_region_at(
    root: *mut EmaRoot,
    addr: usize,
    size: usize,
) -> Option<*mut Ema> {
    if !rt().is_within_enclave(addr, size) {
        return None;
    }
    let is_rts = (*root).kind == RootKind::Rts;
    if (is_rts && !is_within_rts_range(addr, size)) || (!is_rts && !is_within_user_range(addr, size))
    {
        return None;
    }

    let guard = guard_of(root);
    let mut node = (*guard).next;
    while node != guard {
        if (*node).start >= addr + size {
            return Some(node);
        }
        if addr >= (*node).end() {
            node = (*node).next;
        } else {
            return None;
        }
    }
    Some(guard)
}

/// Create a node for `[addr, addr + size)` in front of `next`.
///
/// A stack temporary is linked in first so the range is occupied before the
/// node allocation below can recurse into the allocation path; the heap node
/// then replaces it atomically with respect to the list.
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn ema_new(
    addr: usize,
    size: usize,
    alloc_flags: AllocFlags,
    si: SecInfo,
    handler: Option<PfHandler>,
    priv_data: *mut u8,
    next: *mut Ema,
) -> EmmResult<*mut Ema> {
    let mut tmp = Ema {
        start: addr,
        size,
        alloc_flags,
        si,
        eaccept_map: None,
        handler,
        priv_data,
        next: ptr::null_mut(),
        prev: ptr::null_mut(),
    };
    let tmp_ptr: *mut Ema = &mut tmp;

    insert_ema(tmp_ptr, next);
    let node = emalloc(size_of::<Ema>()) as *mut Ema;
    if node.is_null() {
        remove_ema(tmp_ptr);
        return emm_result_err!(ENOMEM, "EMA node");
    }
    node.write(ptr::read(tmp_ptr));
    replace_ema(node, tmp_ptr);
    core::mem::forget(tmp);
    Ok(node)
}

/// Unlink and free a node together with its bitmap.
pub(crate) unsafe fn ema_destroy(node: *mut Ema) {
    remove_ema(node);
    ptr::drop_in_place(node);
    efree(node as *mut u8);
}

/// Split one node in two at `addr`. The freshly allocated node takes the
/// lower half when `new_lower` is set, the higher half otherwise, and is
/// returned. On failure the list is unchanged.
pub(crate) unsafe fn ema_split(
    node: *mut Ema,
    addr: usize,
    new_lower: bool,
) -> EmmResult<*mut Ema> {
    debug_assert!(ema_overlap_addr(node, addr));

    let new_node = emalloc(size_of::<Ema>()) as *mut Ema;
    if new_node.is_null() {
        return emm_result_err!(ENOMEM, "EMA split");
    }

    let (low, high) = match (*node).eaccept_map.take() {
        Some(map) => {
            let pos = (addr - (*node).start) >> PAGE_SHIFT;
            match map.split(pos) {
                Ok(parts) => parts,
                Err((map, e)) => {
                    (*node).eaccept_map = Some(map);
                    efree(new_node as *mut u8);
                    return Err(e);
                }
            }
        }
        None => (None, None),
    };

    let orig_start = (*node).start;
    let orig_size = (*node).size;

    // the bitmap slots are filled below; the duplicated one is empty here
    new_node.write(ptr::read(node));

    let (lo, hi) = if new_lower {
        insert_ema(new_node, node);
        (new_node, node)
    } else {
        insert_ema(new_node, (*node).next);
        (node, new_node)
    };

    (*lo).start = orig_start;
    (*lo).size = addr - orig_start;
    (*hi).start = addr;
    (*hi).size = orig_size - (*lo).size;

    (*lo).eaccept_map = low;
    (*hi).eaccept_map = high;

    Ok(new_node)
}

/// Trim a node to exactly `[start, end)` with up to two splits, returning
/// the node covering that range.
pub(crate) unsafe fn ema_split_ex(
    node: *mut Ema,
    start: usize,
    end: usize,
) -> EmmResult<*mut Ema> {
    let mut node = node;
    if start > (*node).start {
        node = ema_split(node, start, false)?;
    }
    if end < (*node).end() {
        node = ema_split(node, end, true)?;
    }
    Ok(node)
}

unsafe fn eaccept_range_forward(si: &SecInfoBlock, start: usize, end: usize) {
    let mut addr = start;
    while addr < end {
        if rt().eaccept(si, addr).is_err() {
            error!("EACCEPT failed at {:#x}, flags {:#x}", addr, si.flags());
            panic!("EACCEPT on a page the driver believes valid");
        }
        addr += PAGE_SIZE;
    }
}

unsafe fn eaccept_range_backward(si: &SecInfoBlock, start: usize, end: usize) {
    debug_assert!(start < end);
    let mut addr = end;
    while addr > start {
        addr -= PAGE_SIZE;
        if rt().eaccept(si, addr).is_err() {
            error!("EACCEPT failed at {:#x}, flags {:#x}", addr, si.flags());
            panic!("EACCEPT on a page the driver believes valid");
        }
    }
}

/// Accept a freshly EAUGed range. Grow-up regions accept bottom-up,
/// grow-down (stack) regions top-down, so the first fault-ready address is
/// always the boundary closest to the region's anchor.
unsafe fn do_commit(start: usize, size: usize, si: SecInfo, grow_up: bool) {
    let block = SecInfoBlock::new(SecInfo::new(si.flags | PageFlags::PENDING, si.page_type));
    if grow_up {
        eaccept_range_forward(&block, start, start + size);
    } else {
        eaccept_range_backward(&block, start, start + size);
    }
}

unsafe fn ema_do_commit(node: *mut Ema, start: usize, end: usize) -> EmmResult {
    // Only RESERVE areas have no bitmap.
    debug_assert!((*node).eaccept_map.is_some());
    let real_start = start.max((*node).start);
    let real_end = end.min((*node).end());

    let si = SecInfoBlock::new(SecInfo::new(
        PageFlags::RW | PageFlags::PENDING,
        PageType::Reg,
    ));

    let mut addr = real_start;
    while addr < real_end {
        let pos = (addr - (*node).start) >> PAGE_SHIFT;
        // only commit uncommitted pages
        if !(*node).eaccept_map.as_ref().unwrap().test(pos) {
            rt().eaccept(&si, addr)?;
            (*node).eaccept_map.as_mut().unwrap().set(pos);
        }
        addr += PAGE_SIZE;
    }
    Ok(())
}

unsafe fn ema_can_commit(first: *mut Ema, last: *mut Ema, end: usize) -> EmmResult {
    let mut curr = first;
    let mut prev_end = (*first).start;
    while curr != last {
        if prev_end != (*curr).start {
            return emm_result_err!(EINVAL, "gap in commit range");
        }
        if !(*curr).si.flags.contains(PageFlags::W) {
            return emm_result_err!(EACCES, "commit on a non-writable area");
        }
        if (*curr).si.page_type != PageType::Reg {
            return emm_result_err!(EACCES, "commit on a non-regular area");
        }
        if (*curr).alloc_flags.contains(AllocFlags::RESERVE) {
            return emm_result_err!(EACCES, "commit on a reserved area");
        }
        prev_end = (*curr).end();
        curr = (*curr).next;
    }
    if prev_end < end {
        return emm_result_err!(EINVAL, "commit range not fully covered");
    }
    Ok(())
}

pub(crate) unsafe fn ema_do_commit_loop(
    first: *mut Ema,
    last: *mut Ema,
    start: usize,
    end: usize,
) -> EmmResult {
    ema_can_commit(first, last, end)?;

    let mut curr = first;
    while curr != last {
        let next = (*curr).next;
        ema_do_commit(curr, start, end)?;
        curr = next;
    }
    Ok(())
}

/// Trim and de-accept every committed run in `[real_start, real_end)`.
/// `prot` is the permission set reported to the untrusted side.
unsafe fn ema_do_uncommit_real(
    node: *mut Ema,
    real_start: usize,
    real_end: usize,
    prot: PageFlags,
) -> EmmResult {
    let page_type = (*node).si.page_type;

    // nothing to release on a reserved area
    if (*node).alloc_flags.contains(AllocFlags::RESERVE) {
        return Ok(());
    }
    debug_assert!((*node).eaccept_map.is_some());

    let si = SecInfoBlock::new(SecInfo::new(PageFlags::MODIFIED, PageType::Trim));

    let mut real_start = real_start;
    while real_start < real_end {
        // find the next maximal run of committed pages
        let mut block_start = real_start;
        while block_start < real_end {
            let pos = (block_start - (*node).start) >> PAGE_SHIFT;
            if (*node).eaccept_map.as_ref().unwrap().test(pos) {
                break;
            }
            block_start += PAGE_SIZE;
        }
        if block_start == real_end {
            break;
        }
        let mut block_end = block_start + PAGE_SIZE;
        while block_end < real_end {
            let pos = (block_end - (*node).start) >> PAGE_SHIFT;
            if !(*node).eaccept_map.as_ref().unwrap().test(pos) {
                break;
            }
            block_end += PAGE_SIZE;
        }

        let block_length = block_end - block_start;
        if rt()
            .modify_ocall(
                block_start,
                block_length,
                SecInfo::new(prot, page_type),
                SecInfo::new(prot, PageType::Trim),
            )
            .is_err()
        {
            return emm_result_err!(EFAULT, "trim request failed");
        }

        eaccept_range_forward(&si, block_start, block_end);

        (*node).eaccept_map.as_mut().unwrap().reset_range(
            (block_start - (*node).start) >> PAGE_SHIFT,
            block_length >> PAGE_SHIFT,
        );

        // trim notification
        if rt()
            .modify_ocall(
                block_start,
                block_length,
                SecInfo::new(prot, PageType::Trim),
                SecInfo::new(prot, PageType::Trim),
            )
            .is_err()
        {
            return emm_result_err!(EFAULT, "trim notification failed");
        }

        real_start = block_end;
    }
    Ok(())
}

unsafe fn ema_do_uncommit(node: *mut Ema, start: usize, end: usize) -> EmmResult {
    let mut node = node;
    let real_start = start.max((*node).start);
    let real_end = end.min((*node).end());
    let prot = (*node).si.perms();
    if prot.is_empty() {
        // trimming needs read access; the raise is not undone on pages that
        // stay committed
        node = ema_modify_permissions(node, start, end, PageFlags::R)?;
    }
    ema_do_uncommit_real(node, real_start, real_end, prot)
}

unsafe fn ema_can_uncommit(first: *mut Ema, last: *mut Ema, end: usize) -> EmmResult {
    let mut curr = first;
    let mut prev_end = (*first).start;
    while curr != last {
        if prev_end != (*curr).start {
            return emm_result_err!(EINVAL, "gap in uncommit range");
        }
        if (*curr).alloc_flags.contains(AllocFlags::RESERVE) {
            return emm_result_err!(EACCES, "uncommit on a reserved area");
        }
        prev_end = (*curr).end();
        curr = (*curr).next;
    }
    if prev_end < end {
        return emm_result_err!(EINVAL, "uncommit range not fully covered");
    }
    Ok(())
}

pub(crate) unsafe fn ema_do_uncommit_loop(
    first: *mut Ema,
    last: *mut Ema,
    start: usize,
    end: usize,
) -> EmmResult {
    ema_can_uncommit(first, last, end)?;

    let mut curr = first;
    while curr != last {
        let next = (*curr).next;
        ema_do_uncommit(curr, start, end)?;
        curr = next;
    }
    Ok(())
}

unsafe fn ema_do_dealloc(node: *mut Ema, start: usize, end: usize) -> EmmResult {
    let mut node = node;
    let real_start = start.max((*node).start);
    let real_end = end.min((*node).end());

    if !(*node).alloc_flags.contains(AllocFlags::RESERVE) {
        debug_assert!((*node).eaccept_map.is_some());
        let prot = (*node).si.perms();
        if prot.is_empty() {
            // trimming needs read access
            node = ema_modify_permissions(node, start, end, PageFlags::R)?;
        }
        // permissions are irrelevant for pages about to go away
        ema_do_uncommit_real(node, real_start, real_end, PageFlags::empty())?;
    }

    // isolate the exact range, then drop it
    if real_start > (*node).start {
        node = ema_split(node, real_start, false)?;
    }
    if real_end < (*node).end() {
        node = ema_split(node, real_end, true)?;
    }
    ema_destroy(node);
    Ok(())
}

pub(crate) unsafe fn ema_do_dealloc_loop(
    first: *mut Ema,
    last: *mut Ema,
    start: usize,
    end: usize,
) -> EmmResult {
    let mut curr = first;
    while curr != last {
        let next = (*curr).next;
        ema_do_dealloc(curr, start, end)?;
        curr = next;
    }
    Ok(())
}

/// Convert the committed R+W regular page at `addr` to a TCS page.
pub(crate) unsafe fn ema_change_to_tcs(node: *mut Ema, addr: usize) -> EmmResult {
    let prot = (*node).si.perms();
    let page_type = (*node).si.page_type;

    if !ema_page_committed(node, addr) {
        return emm_result_err!(EACCES, "TCS conversion of an uncommitted page");
    }

    if page_type == PageType::Tcs {
        return Ok(()); // already a TCS page
    }

    if prot != PageFlags::RW {
        return emm_result_err!(EACCES, "TCS conversion needs R+W");
    }
    if page_type != PageType::Reg {
        return emm_result_err!(EACCES, "TCS conversion of a non-regular page");
    }

    if rt()
        .modify_ocall(
            addr,
            PAGE_SIZE,
            SecInfo::new(prot, page_type),
            SecInfo::new(prot, PageType::Tcs),
        )
        .is_err()
    {
        return emm_result_err!(EFAULT, "TCS conversion request failed");
    }

    let si = SecInfoBlock::new(SecInfo::new(PageFlags::MODIFIED, PageType::Tcs));
    if rt().eaccept(&si, addr).is_err() {
        error!("EACCEPT of TCS page {:#x} failed", addr);
        panic!("EACCEPT on a page the driver believes valid");
    }

    // hardware transition done, update the bookkeeping
    let tcs = ema_split_ex(node, addr, addr + PAGE_SIZE)?;
    (*tcs).si = SecInfo::new(PageFlags::empty(), PageType::Tcs);
    Ok(())
}

/// Change the permissions of `[start, end)` clamped to this node. Returns
/// the node covering the changed range after any splits.
unsafe fn ema_modify_permissions(
    node: *mut Ema,
    start: usize,
    end: usize,
    new_prot: PageFlags,
) -> EmmResult<*mut Ema> {
    let mut node = node;
    let prot = (*node).si.perms();
    let page_type = (*node).si.page_type;
    if prot == new_prot {
        return Ok(node);
    }

    let real_start = start.max((*node).start);
    let real_end = end.min((*node).end());

    if rt()
        .modify_ocall(
            real_start,
            real_end - real_start,
            SecInfo::new(prot, page_type),
            SecInfo::new(new_prot, page_type),
        )
        .is_err()
    {
        return emm_result_err!(EFAULT, "permission change request failed");
    }

    let si = SecInfoBlock::new(SecInfo::new(new_prot | PageFlags::PR, PageType::Reg));

    let mut page = real_start;
    while page < real_end {
        if new_prot | prot != prot {
            rt().emodpe(&si, page);
        }
        // permissions covering W+X need no untrusted EMODPR, hence no EACCEPT
        if !new_prot.contains(PageFlags::WX) {
            rt().eaccept(&si, page)?;
        }
        page += PAGE_SIZE;
    }

    // every page went through; isolate the range and record the new state
    if real_start > (*node).start {
        node = ema_split(node, real_start, false)?;
    }
    if real_end < (*node).end() {
        node = ema_split(node, real_end, true)?;
    }
    (*node).si = SecInfo::new(new_prot, page_type);

    if new_prot.is_empty() {
        // pin the untrusted mapping to PROT_NONE
        if rt()
            .modify_ocall(
                real_start,
                real_end - real_start,
                SecInfo::new(PageFlags::empty(), page_type),
                SecInfo::new(PageFlags::empty(), page_type),
            )
            .is_err()
        {
            return emm_result_err!(EFAULT, "PROT_NONE request failed");
        }
    }
    Ok(node)
}

unsafe fn ema_can_modify_permissions(
    first: *mut Ema,
    last: *mut Ema,
    start: usize,
    end: usize,
) -> EmmResult {
    let mut curr = first;
    let mut prev_end = (*first).start;
    while curr != last {
        if prev_end != (*curr).start {
            return emm_result_err!(EINVAL, "gap in permission change range");
        }
        if (*curr).si.page_type != PageType::Reg {
            return emm_result_err!(EACCES, "permission change on a non-regular area");
        }
        if (*curr).alloc_flags.contains(AllocFlags::RESERVE) {
            return emm_result_err!(EACCES, "permission change on a reserved area");
        }

        let real_start = start.max((*curr).start);
        let real_end = end.min((*curr).end());
        let pos_begin = (real_start - (*curr).start) >> PAGE_SHIFT;
        let pos_end = (real_end - (*curr).start) >> PAGE_SHIFT;
        let all_committed = match (*curr).eaccept_map.as_ref() {
            Some(map) => map.test_range(pos_begin, pos_end - pos_begin),
            None => false,
        };
        if !all_committed {
            return emm_result_err!(EINVAL, "permission change on uncommitted pages");
        }

        prev_end = (*curr).end();
        curr = (*curr).next;
    }
    if prev_end < end {
        return emm_result_err!(EINVAL, "permission change range not fully covered");
    }
    Ok(())
}

unsafe fn ema_modify_permissions_loop_nocheck(
    first: *mut Ema,
    last: *mut Ema,
    start: usize,
    end: usize,
    prot: PageFlags,
) -> EmmResult {
    let mut curr = first;
    while curr != last {
        let next = (*curr).next;
        ema_modify_permissions(curr, start, end, prot)?;
        curr = next;
    }
    Ok(())
}

pub(crate) unsafe fn ema_modify_permissions_loop(
    first: *mut Ema,
    last: *mut Ema,
    start: usize,
    end: usize,
    prot: PageFlags,
) -> EmmResult {
    ema_can_modify_permissions(first, last, start, end)?;
    ema_modify_permissions_loop_nocheck(first, last, start, end, prot)
}

unsafe fn ema_can_commit_data(
    first: *mut Ema,
    last: *mut Ema,
    start: usize,
    end: usize,
) -> EmmResult {
    let mut curr = first;
    let mut prev_end = (*first).start;
    while curr != last {
        if prev_end != (*curr).start {
            return emm_result_err!(EINVAL, "gap in commit range");
        }
        if !(*curr).si.flags.contains(PageFlags::W) {
            return emm_result_err!(EACCES, "commit with data on a non-writable area");
        }
        if (*curr).si.page_type != PageType::Reg {
            return emm_result_err!(EACCES, "commit with data on a non-regular area");
        }
        if (*curr).alloc_flags.contains(AllocFlags::RESERVE) {
            return emm_result_err!(EACCES, "commit with data on a reserved area");
        }
        if !(*curr).alloc_flags.contains(AllocFlags::COMMIT_ON_DEMAND) {
            return emm_result_err!(EINVAL, "commit with data needs a commit-on-demand area");
        }

        if let Some(map) = (*curr).eaccept_map.as_ref() {
            let real_start = start.max((*curr).start);
            let real_end = end.min((*curr).end());
            let pos_begin = (real_start - (*curr).start) >> PAGE_SHIFT;
            let pos_end = (real_end - (*curr).start) >> PAGE_SHIFT;
            if map.test_range_any(pos_begin, pos_end - pos_begin) {
                return emm_result_err!(EACCES, "commit with data over committed pages");
            }
        }
        prev_end = (*curr).end();
        curr = (*curr).next;
    }
    if prev_end < end {
        return emm_result_err!(EINVAL, "commit range not fully covered");
    }
    Ok(())
}

unsafe fn ema_do_commit_data(
    node: *mut Ema,
    start: usize,
    end: usize,
    data: *const u8,
    prot: PageFlags,
) -> EmmResult {
    let si = SecInfoBlock::new(SecInfo::new(prot, PageType::Reg));

    let mut addr = start;
    let mut src = data as usize;
    while addr < end {
        if rt().eacceptcopy(&si, addr, src).is_err() {
            return emm_result_err!(EFAULT, "EACCEPTCOPY failed");
        }
        addr += PAGE_SIZE;
        src += PAGE_SIZE;
    }
    ema_set_eaccept(node, start, end)
}

pub(crate) unsafe fn ema_do_commit_data_loop(
    first: *mut Ema,
    last: *mut Ema,
    start: usize,
    end: usize,
    data: *const u8,
    prot: PageFlags,
) -> EmmResult {
    ema_can_commit_data(first, last, start, end)?;

    // no split happens in this loop
    let mut curr = first;
    while curr != last {
        let real_start = start.max((*curr).start);
        let real_end = end.min((*curr).end());
        let real_data = data.add(real_start - start);
        ema_do_commit_data(curr, real_start, real_end, real_data, prot)?;
        curr = (*curr).next;
    }

    // demote to the requested permissions, splitting as needed
    ema_modify_permissions_loop_nocheck(first, last, start, end, prot)
}

/// Convert a span of adjacent RESERVE nodes into one area with the given
/// attributes. Fails on gaps, on non-RESERVE nodes, and on nodes tracking
/// internal-heap reserves.
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn ema_realloc_from_reserve_range(
    first: *mut Ema,
    last: *mut Ema,
    start: usize,
    end: usize,
    alloc_flags: AllocFlags,
    si: SecInfo,
    handler: Option<PfHandler>,
    priv_data: *mut u8,
) -> EmmResult<*mut Ema> {
    debug_assert!((*first).start < end);
    debug_assert!((*(*last).prev).end() > start);

    let mut curr = first;
    let mut prev_end = (*first).start;
    while curr != last {
        // do not touch internal-heap reserves
        if !can_erealloc(curr as *mut u8) {
            return emm_result_err!(EEXIST, "range tracks internal reserves");
        }
        if prev_end != (*curr).start {
            return emm_result_err!(EEXIST, "gap in reserved range");
        }
        if !(*curr).alloc_flags.contains(AllocFlags::RESERVE) {
            return emm_result_err!(EEXIST, "range is not fully reserved");
        }
        prev_end = (*curr).end();
        curr = (*curr).next;
    }

    // Splitting can append internal-heap reserve nodes, which moves the node
    // in front of the span when that node is the guard. Track the last
    // inclusive node instead.
    let mut first = first;
    let mut last = last;
    let mut last_inclusive = (*last).prev;
    if start > (*first).start {
        let old_first = first;
        first = ema_split(first, start, false)?;
        if old_first == last_inclusive {
            last_inclusive = first;
        }
    }
    if end < (*last_inclusive).end() {
        last = ema_split(last_inclusive, end, false)?;
    } else {
        last = (*last_inclusive).next;
    }

    debug_assert!((*first).alloc_flags.contains(AllocFlags::RESERVE));
    debug_assert!((*first).eaccept_map.is_none());

    let mut curr = first;
    while curr != last {
        let next = (*curr).next;
        ema_destroy(curr);
        curr = next;
    }

    ema_new(start, end - start, alloc_flags, si, handler, priv_data, last)
}

/// Drive the hardware allocation for a fresh node: EAUG request, then for
/// COMMIT_NOW an accept sweep anchored at the region's growth boundary.
pub(crate) unsafe fn ema_do_alloc(node: *mut Ema) -> EmmResult {
    let alloc_flags = (*node).alloc_flags;
    if alloc_flags.contains(AllocFlags::RESERVE) {
        return Ok(());
    }

    let start = (*node).start;
    let size = (*node).size;
    if rt()
        .alloc_ocall(start, size, (*node).si.page_type, alloc_flags)
        .is_err()
    {
        return emm_result_err!(EFAULT, "EAUG request failed");
    }

    if alloc_flags.contains(AllocFlags::COMMIT_NOW) {
        let grow_up = !alloc_flags.contains(AllocFlags::GROWSDOWN);
        do_commit(start, size, (*node).si, grow_up);
        ema_set_eaccept_full(node)
    } else {
        ema_clear_eaccept_full(node)
    }
}
