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

//! Public operations: argument validation, window selection and routing.
//!
//! Every operation acquires the process-wide recursive EMM mutex on entry
//! and releases it on every return path. A partial failure inside a driver
//! loop keeps the page transitions applied so far; callers must not assume
//! a failed operation can be retried safely.

use core::ptr;

use crate::addr::{align_down, is_aligned};
use crate::cell::LockedCell;
use crate::consts::PAGE_SIZE;
use crate::ema::{
    self, ema_change_to_tcs, ema_clear_eaccept_full, ema_destroy, ema_do_alloc,
    ema_do_commit_data_loop, ema_do_commit_loop, ema_do_dealloc_loop, ema_do_uncommit_loop,
    ema_modify_permissions_loop, ema_new, ema_page_committed, ema_realloc_from_reserve_range,
    ema_set_eaccept, ema_set_eaccept_full, find_free_region, find_free_region_at, search_ema,
    search_ema_range, Ema, EmaRoot,
};
use crate::emalloc;
use crate::error::EmmResult;
use crate::flags::{AllocFlags, PageFlags, PageType, SecInfo, SecInfoBlock};
use crate::rt::{self, lock, EmmRuntime, PfErrorCode, PfHandler, PfInfo, PfOutcome};

struct MmState {
    user_base: usize,
    user_end: usize,
    initialized: bool,
}

static MM: LockedCell<MmState> = LockedCell::new(MmState {
    user_base: 0,
    user_end: 0,
    initialized: false,
});

/// The user window boundaries recorded at [`init`].
pub(crate) fn user_window() -> (usize, usize) {
    unsafe {
        let st = MM.get();
        ((*st).user_base, (*st).user_end)
    }
}

fn ensure_initialized() -> EmmResult {
    unsafe {
        if (*MM.get()).initialized {
            Ok(())
        } else {
            emm_result_err!(EPERM, "manager not initialized")
        }
    }
}

fn check_range(addr: usize, size: usize) -> EmmResult {
    if size == 0 || !is_aligned(addr) || !is_aligned(size) || addr.checked_add(size).is_none() {
        return emm_result_err!(EINVAL, "bad address range");
    }
    Ok(())
}

fn check_perms(prot: PageFlags) -> EmmResult {
    if !PageFlags::PERM_MASK.contains(prot) {
        return emm_result_err!(EINVAL, "unknown permission bits");
    }
    if prot.contains(PageFlags::W) && !prot.contains(PageFlags::R) {
        return emm_result_err!(EINVAL, "writable pages must be readable");
    }
    Ok(())
}

/// The root whose window contains the range: user when fully inside the
/// user window, RTS otherwise.
unsafe fn root_for(addr: usize, size: usize) -> *mut EmaRoot {
    let (user_base, user_end) = user_window();
    if addr >= user_base && addr + size <= user_end {
        ema::user_root()
    } else {
        ema::rts_root()
    }
}

/// Record the runtime and the user window, then bootstrap the internal
/// heap. Call once before any other operation; a second call without an
/// intervening [`destroy`] fails with `EPERM`.
pub fn init(runtime: &'static dyn EmmRuntime, user_base: usize, user_end: usize) -> EmmResult {
    if !is_aligned(user_base) || !is_aligned(user_end) || user_base >= user_end {
        return emm_result_err!(EINVAL, "bad user range");
    }
    rt::set_runtime(runtime);

    let _lock = lock();
    unsafe {
        let st = MM.get();
        if (*st).initialized {
            return emm_result_err!(EPERM, "manager already initialized");
        }
        if !runtime.is_within_enclave(user_base, user_end - user_base) {
            return emm_result_err!(EINVAL, "user range outside the enclave");
        }
        (*st).user_base = user_base;
        (*st).user_end = user_end;
        (*st).initialized = true;
        ema::reset_roots();

        if let Err(e) = emalloc::emalloc_init_reserve(emalloc::INITIAL_RESERVE_SIZE) {
            warn!("heap bootstrap failed: {:?}", e);
            ema::reset_roots();
            emalloc::reset();
            (*st).initialized = false;
            return Err(e);
        }
    }
    info!("EMM initialized, user range {:#x}..{:#x}", user_base, user_end);
    Ok(())
}

/// Drop all bookkeeping without driving any page transition; the EPC pages
/// themselves are reclaimed with the enclave. Permits a later [`init`].
pub fn destroy() {
    let _lock = lock();
    unsafe {
        ema::reset_roots();
        emalloc::reset();
        let st = MM.get();
        (*st).user_base = 0;
        (*st).user_end = 0;
        (*st).initialized = false;
    }
    info!("EMM state dropped");
}

/// Allocate a region of `size` bytes.
///
/// `addr` is a hint unless `FIXED` is set, in which case the exact range is
/// required and a collision fails with `EEXIST` (a span of plain reserved
/// areas does satisfy a fixed request). `SYSTEM` requests go to the RTS
/// window, everything else to the user window. Returns the start address.
pub fn alloc(
    addr: Option<usize>,
    size: usize,
    flags: AllocFlags,
    handler: Option<PfHandler>,
    priv_data: *mut u8,
) -> EmmResult<usize> {
    check_range(0, size)?;
    if let Some(a) = addr {
        if a == 0 || !is_aligned(a) || a.checked_add(size).is_none() {
            return emm_result_err!(EINVAL, "bad fixed address");
        }
    }
    if (flags & AllocFlags::COMMIT_MASK).bits().count_ones() != 1 {
        return emm_result_err!(EINVAL, "exactly one commit mode required");
    }
    if flags.contains(AllocFlags::GROWSDOWN) && flags.contains(AllocFlags::GROWSUP) {
        return emm_result_err!(EINVAL, "conflicting growth directions");
    }
    if flags.contains(AllocFlags::FIXED) && addr.is_none() {
        return emm_result_err!(EINVAL, "fixed allocation without an address");
    }
    if handler.is_some() && !flags.contains(AllocFlags::COMMIT_ON_DEMAND) {
        return emm_result_err!(EINVAL, "handlers need commit-on-demand areas");
    }

    let _lock = lock();
    ensure_initialized()?;

    let root = if flags.contains(AllocFlags::SYSTEM) {
        ema::rts_root()
    } else {
        ema::user_root()
    };
    let si = SecInfo::new(PageFlags::RW, PageType::Reg);

    unsafe {
        let (start, next) = match addr {
            Some(a) => match find_free_region_at(root, a, size) {
                Some(next) => (a, next),
                None if flags.contains(AllocFlags::FIXED) => {
                    if !ema::within_window(root, a, size) {
                        return emm_result_err!(EINVAL, "fixed range escapes the window");
                    }
                    let (first, last) = search_ema_range(root, a, a + size)
                        .ok_or_else(|| emm_err!(EEXIST, "fixed address collision"))?;
                    let node = ema_realloc_from_reserve_range(
                        first,
                        last,
                        a,
                        a + size,
                        flags,
                        si,
                        handler,
                        priv_data,
                    )?;
                    finish_alloc(node)?;
                    return Ok(a);
                }
                // the hint cannot be honored, fall back to any address
                None => find_free_region(root, size, PAGE_SIZE)
                    .ok_or_else(|| emm_err!(ENOMEM, "no free region"))?,
            },
            None => find_free_region(root, size, PAGE_SIZE)
                .ok_or_else(|| emm_err!(ENOMEM, "no free region"))?,
        };

        let node = ema_new(start, size, flags, si, handler, priv_data, next)?;
        finish_alloc(node)?;
        debug!("alloc {:#x}..{:#x} {:?}", start, start + size, flags);
        Ok(start)
    }
}

unsafe fn finish_alloc(node: *mut Ema) -> EmmResult {
    if let Err(e) = ema_do_alloc(node) {
        ema_destroy(node);
        return Err(e);
    }
    Ok(())
}

/// Release a range: uncommit what is committed, then remove the covering
/// areas. Reserved areas inside the range are dropped without hardware
/// effects.
pub fn dealloc(addr: usize, size: usize) -> EmmResult {
    check_range(addr, size)?;
    let _lock = lock();
    ensure_initialized()?;
    unsafe {
        let root = root_for(addr, size);
        let (first, last) = search_ema_range(root, addr, addr + size)
            .ok_or_else(|| emm_err!(EINVAL, "no areas in range"))?;
        ema_do_dealloc_loop(first, last, addr, addr + size)?;
    }
    debug!("dealloc {:#x}..{:#x}", addr, addr + size);
    Ok(())
}

/// Make the pages of a commit-on-demand range resident.
pub fn commit(addr: usize, size: usize) -> EmmResult {
    check_range(addr, size)?;
    let _lock = lock();
    ensure_initialized()?;
    unsafe {
        let root = root_for(addr, size);
        let (first, last) = search_ema_range(root, addr, addr + size)
            .ok_or_else(|| emm_err!(EINVAL, "no areas in range"))?;
        ema_do_commit_loop(first, last, addr, addr + size)
    }
}

/// Release the pages of a range while keeping the region allocated.
pub fn uncommit(addr: usize, size: usize) -> EmmResult {
    check_range(addr, size)?;
    let _lock = lock();
    ensure_initialized()?;
    unsafe {
        let root = root_for(addr, size);
        let (first, last) = search_ema_range(root, addr, addr + size)
            .ok_or_else(|| emm_err!(EINVAL, "no areas in range"))?;
        ema_do_uncommit_loop(first, last, addr, addr + size)
    }
}

/// Commit an uncommitted writable commit-on-demand range with page contents
/// from `data` and leave it with permissions `prot`.
pub fn commit_data(addr: usize, size: usize, data: &[u8], prot: PageFlags) -> EmmResult {
    check_range(addr, size)?;
    check_perms(prot)?;
    if data.len() != size {
        return emm_result_err!(EINVAL, "data length does not match the range");
    }
    let _lock = lock();
    ensure_initialized()?;
    unsafe {
        let root = root_for(addr, size);
        let (first, last) = search_ema_range(root, addr, addr + size)
            .ok_or_else(|| emm_err!(EINVAL, "no areas in range"))?;
        ema_do_commit_data_loop(first, last, addr, addr + size, data.as_ptr(), prot)
    }
}

/// Change the permissions of a committed regular range.
pub fn modify_permissions(addr: usize, size: usize, prot: PageFlags) -> EmmResult {
    check_range(addr, size)?;
    check_perms(prot)?;
    let _lock = lock();
    ensure_initialized()?;
    unsafe {
        let root = root_for(addr, size);
        let (first, last) = search_ema_range(root, addr, addr + size)
            .ok_or_else(|| emm_err!(EINVAL, "no areas in range"))?;
        ema_modify_permissions_loop(first, last, addr, addr + size, prot)
    }
}

/// Change the type of a single committed R+W regular page. Only the
/// conversion to TCS is supported.
pub fn modify_type(addr: usize, size: usize, new_type: PageType) -> EmmResult {
    check_range(addr, size)?;
    if new_type != PageType::Tcs {
        return emm_result_err!(EINVAL, "only conversion to TCS is supported");
    }
    if size != PAGE_SIZE {
        return emm_result_err!(EINVAL, "TCS conversion takes one page");
    }
    let _lock = lock();
    ensure_initialized()?;
    unsafe {
        let root = root_for(addr, size);
        let node = search_ema(root, addr);
        if node.is_null() {
            return emm_result_err!(EINVAL, "no area at address");
        }
        ema_change_to_tcs(node, addr)
    }
}

/// Attach (or clear, with `None`) a demand-load handler on an existing,
/// fully covered range.
pub fn register_pfhandler(
    addr: usize,
    size: usize,
    handler: Option<PfHandler>,
    priv_data: *mut u8,
) -> EmmResult {
    check_range(addr, size)?;
    let _lock = lock();
    ensure_initialized()?;
    unsafe {
        let root = root_for(addr, size);
        let (first, last) = search_ema_range(root, addr, addr + size)
            .ok_or_else(|| emm_err!(EINVAL, "no areas in range"))?;

        let mut curr = first;
        let mut prev_end = (*first).start;
        while curr != last {
            if prev_end != (*curr).start {
                return emm_result_err!(EINVAL, "gap in handler range");
            }
            prev_end = (*curr).end();
            curr = (*curr).next;
        }
        if prev_end < addr + size {
            return emm_result_err!(EINVAL, "handler range not fully covered");
        }

        let mut curr = first;
        while curr != last {
            (*curr).handler = handler;
            (*curr).priv_data = priv_data;
            curr = (*curr).next;
        }
    }
    Ok(())
}

/// Record a region that already exists at enclave load (static heap,
/// stacks, TCS pages) on the RTS list. No hardware operation is driven.
pub fn init_region(addr: usize, size: usize, flags: AllocFlags, si: SecInfo) -> EmmResult {
    check_range(addr, size)?;
    if (flags & AllocFlags::COMMIT_MASK).bits().count_ones() != 1 {
        return emm_result_err!(EINVAL, "exactly one commit mode required");
    }
    let _lock = lock();
    ensure_initialized()?;
    unsafe {
        if !rt::rt().is_within_enclave(addr, size) || !ema::within_window(ema::rts_root(), addr, size)
        {
            return emm_result_err!(EINVAL, "region not in the RTS window");
        }
        let next = find_free_region_at(ema::rts_root(), addr, size)
            .ok_or_else(|| emm_err!(EEXIST, "region overlaps an existing area"))?;
        let node = ema_new(addr, size, flags, si, None, ptr::null_mut(), next)?;
        if !flags.contains(AllocFlags::RESERVE) {
            let result = if flags.contains(AllocFlags::COMMIT_NOW) {
                ema_set_eaccept_full(node)
            } else {
                ema_clear_eaccept_full(node)
            };
            if let Err(e) = result {
                ema_destroy(node);
                return Err(e);
            }
        }
    }
    debug!("init_region {:#x}..{:#x} {:?}", addr, addr + size, flags);
    Ok(())
}

/// First-phase page-fault handler: resolve the faulting page and drive a
/// fault-time commit, or delegate to the handler registered on the region.
pub fn enclave_pfhandler(info: &PfInfo) -> PfOutcome {
    let addr = align_down(info.maddr as usize);
    let guard = lock();
    if ensure_initialized().is_err() {
        return PfOutcome::ContinueSearch;
    }
    unsafe {
        let mut node = search_ema(ema::user_root(), addr);
        if node.is_null() {
            node = search_ema(ema::rts_root(), addr);
        }
        if node.is_null() {
            return PfOutcome::ContinueSearch;
        }

        if let Some(handler) = (*node).handler {
            let priv_data = (*node).priv_data;
            // run the region handler outside the lock; it may call back in
            drop(guard);
            return handler(info, priv_data);
        }

        let si = (*node).si;
        let flags = (*node).alloc_flags;

        // an access the permissions forbid is not ours to fix
        if info.pfec.contains(PfErrorCode::CAUSED_BY_WRITE) && !si.flags.contains(PageFlags::W) {
            return PfOutcome::ContinueSearch;
        }
        if info.pfec.contains(PfErrorCode::INSTRUCTION_FETCH) && !si.flags.contains(PageFlags::X) {
            return PfOutcome::ContinueSearch;
        }
        if !info.pfec.contains(PfErrorCode::CAUSED_BY_WRITE)
            && !info.pfec.contains(PfErrorCode::INSTRUCTION_FETCH)
            && !si.flags.contains(PageFlags::R)
        {
            return PfOutcome::ContinueSearch;
        }

        if !flags.contains(AllocFlags::COMMIT_ON_DEMAND) || flags.contains(AllocFlags::RESERVE) {
            return PfOutcome::ContinueSearch;
        }

        if ema_page_committed(node, addr) {
            // another thread resolved the fault already
            return PfOutcome::ContinueExecution;
        }

        let block = SecInfoBlock::new(SecInfo::new(si.perms() | PageFlags::PENDING, PageType::Reg));
        if rt::rt().eaccept(&block, addr).is_err() {
            warn!("fault-time EACCEPT failed at {:#x}", addr);
            return PfOutcome::ContinueSearch;
        }
        if ema_set_eaccept(node, addr, addr + PAGE_SIZE).is_err() {
            return PfOutcome::ContinueSearch;
        }
    }
    PfOutcome::ContinueExecution
}

/// Which window [`visit_regions`] walks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Window {
    Rts,
    User,
}

/// Snapshot of one memory area, for diagnostics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegionInfo {
    pub start: usize,
    pub size: usize,
    pub alloc_flags: AllocFlags,
    pub si: SecInfo,
    /// Number of pages currently accepted.
    pub committed_pages: usize,
    pub has_bitmap: bool,
}

/// Walk one window's areas in address order. The callback runs under the
/// EMM lock and must not call back into the manager.
pub fn visit_regions(window: Window, visit: &mut dyn FnMut(&RegionInfo)) {
    let _lock = lock();
    unsafe {
        let root = match window {
            Window::Rts => ema::rts_root(),
            Window::User => ema::user_root(),
        };
        ema::for_each_ema(root, &mut |node| {
            // nodes stay valid for the whole walk, the lock is held
            let info = unsafe {
                RegionInfo {
                    start: (*node).start,
                    size: (*node).size,
                    alloc_flags: (*node).alloc_flags,
                    si: (*node).si,
                    committed_pages: (*node)
                        .eaccept_map
                        .as_ref()
                        .map_or(0, |map| map.count_set()),
                    has_bitmap: (*node).eaccept_map.is_some(),
                }
            };
            visit(&info);
        });
    }
}
