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

//! Mock runtime for driving the manager against a simulated EPC.
//!
//! The mock owns a page-aligned arena standing in for the enclave linear
//! space, tracks per-page EPC state the way the hardware and the untrusted
//! runtime would, and records every out-call and instruction so tests can
//! assert on sequences and ordering.

use std::alloc::Layout;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use sgx_emm::flags::{AllocFlags, PageType, SecInfo, SecInfoBlock};
use sgx_emm::mm::{self, RegionInfo, Window};
use sgx_emm::rt::EmmRuntime;
use sgx_emm::{EmmResult, PAGE_SIZE};

const ENCLAVE_SIZE: usize = 64 << 20;
const USER_OFFSET: usize = 8 << 20;
const USER_SIZE: usize = 48 << 20;

const FLAG_PENDING: u64 = 1 << 3;
const FLAG_MODIFIED: u64 = 1 << 4;
const FLAG_PR: u64 = 1 << 5;
const PERM_MASK: u64 = 0x7;
const PERM_WX: u64 = 0x6;

const TYPE_TCS: u64 = 1;
const TYPE_TRIM: u64 = 4;

#[derive(Clone, Copy, Debug, Default)]
pub struct PageState {
    pub present: bool,
    pub pending: bool,
    pub trimmed: bool,
    pub tcs_pending: bool,
    pub pr: bool,
    pub committed: bool,
    pub is_tcs: bool,
    pub perms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    AllocOcall { addr: usize, size: usize },
    ModifyOcall { addr: usize, size: usize, from: u64, to: u64 },
    Eaccept { addr: usize, flags: u64 },
    Emodpe { addr: usize, flags: u64 },
    EacceptCopy { addr: usize, src: usize, flags: u64 },
}

#[derive(Default)]
struct MockState {
    pages: HashMap<usize, PageState>,
    events: Vec<Event>,
}

pub struct MockRuntime {
    base: usize,
    state: Mutex<MockState>,
    lock_owner: AtomicU64,
    lock_depth: AtomicUsize,
}

fn thread_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|t| *t)
}

impl MockRuntime {
    fn new() -> Self {
        let layout = Layout::from_size_align(ENCLAVE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
        assert!(base != 0);
        Self {
            base,
            state: Mutex::new(MockState::default()),
            lock_owner: AtomicU64::new(0),
            lock_depth: AtomicUsize::new(0),
        }
    }

    pub fn enclave_base(&self) -> usize {
        self.base
    }

    pub fn user_base(&self) -> usize {
        self.base + USER_OFFSET
    }

    pub fn user_end(&self) -> usize {
        self.base + USER_OFFSET + USER_SIZE
    }

    pub fn reset(&self) {
        let mut st = self.state();
        st.pages.clear();
        st.events.clear();
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    pub fn page(&self, addr: usize) -> PageState {
        self.state().pages.get(&addr).copied().unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fail(msg: &'static str) -> EmmResult {
        Err(sgx_emm::EmmError::new(
            sgx_emm::EmmErrorNum::EFAULT,
            file!(),
            line!(),
            column!(),
            Some(msg),
        ))
    }
}

impl EmmRuntime for MockRuntime {
    fn mm_lock(&self) {
        let me = thread_token();
        if self.lock_owner.load(Ordering::Acquire) == me {
            self.lock_depth.fetch_add(1, Ordering::Relaxed);
            return;
        }
        loop {
            if self
                .lock_owner
                .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.lock_depth.store(1, Ordering::Relaxed);
                return;
            }
            std::thread::yield_now();
        }
    }

    fn mm_unlock(&self) {
        assert_eq!(self.lock_owner.load(Ordering::Relaxed), thread_token());
        if self.lock_depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.lock_owner.store(0, Ordering::Release);
        }
    }

    fn is_within_enclave(&self, addr: usize, size: usize) -> bool {
        match addr.checked_add(size) {
            Some(end) => addr >= self.base && end <= self.base + ENCLAVE_SIZE,
            None => false,
        }
    }

    fn alloc_ocall(
        &self,
        addr: usize,
        size: usize,
        _page_type: PageType,
        _alloc_flags: AllocFlags,
    ) -> EmmResult {
        let mut st = self.state();
        st.events.push(Event::AllocOcall { addr, size });
        // The untrusted runtime only records the mapping; pages are EAUGed
        // lazily on the fault a later EACCEPT takes.
        for page in (addr..addr + size).step_by(PAGE_SIZE) {
            let p = st.pages.entry(page).or_default();
            if p.present {
                return Self::fail("mapping over an EPC-resident page");
            }
        }
        Ok(())
    }

    fn modify_ocall(&self, addr: usize, size: usize, from: SecInfo, to: SecInfo) -> EmmResult {
        let mut st = self.state();
        st.events.push(Event::ModifyOcall {
            addr,
            size,
            from: from.bits(),
            to: to.bits(),
        });
        let from_type = (from.bits() >> 8) & 0xff;
        let to_type = (to.bits() >> 8) & 0xff;
        for page in (addr..addr + size).step_by(PAGE_SIZE) {
            let p = st.pages.entry(page).or_default();
            if to_type == TYPE_TRIM && from_type != TYPE_TRIM {
                if !p.committed {
                    return Self::fail("trim of an uncommitted page");
                }
                p.trimmed = true;
            } else if to_type == TYPE_TRIM && from_type == TYPE_TRIM {
                // trim notification: the page must be accepted away already
                if p.committed || p.trimmed {
                    return Self::fail("trim notification before EACCEPT");
                }
                *p = PageState::default();
            } else if to_type == TYPE_TCS {
                if !p.committed || p.is_tcs {
                    return Self::fail("TCS conversion of an unfit page");
                }
                p.tcs_pending = true;
            } else {
                // regular permission change or PROT_NONE pin
                if from.bits() == to.bits() {
                    continue;
                }
                if !p.committed {
                    return Self::fail("permission change on an uncommitted page");
                }
                let perms = to.bits() & PERM_MASK;
                p.perms = perms;
                if perms & PERM_WX != PERM_WX {
                    p.pr = true;
                }
            }
        }
        Ok(())
    }

    fn eaccept(&self, si: &SecInfoBlock, addr: usize) -> EmmResult {
        let bits = si.flags();
        let mut st = self.state();
        st.events.push(Event::Eaccept { addr, flags: bits });
        let ptype = (bits >> 8) & 0xff;
        let p = st.pages.entry(addr).or_default();
        if bits & FLAG_PENDING != 0 {
            // The untrusted side EAUGs lazily on the fault this EACCEPT takes
            // on a non-present page.
            if !p.present {
                p.present = true;
                p.pending = true;
            }
            if !p.pending {
                return Self::fail("EACCEPT of a non-pending page");
            }
            p.pending = false;
            p.committed = true;
            p.is_tcs = false;
            p.perms = bits & PERM_MASK;
            Ok(())
        } else if bits & FLAG_MODIFIED != 0 {
            match ptype {
                TYPE_TRIM => {
                    if !p.trimmed {
                        return Self::fail("EACCEPT of a non-trimmed page");
                    }
                    p.trimmed = false;
                    p.committed = false;
                    Ok(())
                }
                TYPE_TCS => {
                    if !p.tcs_pending {
                        return Self::fail("EACCEPT of a non-converting page");
                    }
                    p.tcs_pending = false;
                    p.is_tcs = true;
                    Ok(())
                }
                _ => Self::fail("EACCEPT with a bad modified type"),
            }
        } else if bits & FLAG_PR != 0 {
            if !p.pr {
                return Self::fail("EACCEPT without a pending restriction");
            }
            p.pr = false;
            p.perms = bits & PERM_MASK;
            Ok(())
        } else {
            Self::fail("EACCEPT with no state bit")
        }
    }

    fn emodpe(&self, si: &SecInfoBlock, addr: usize) {
        let bits = si.flags();
        let mut st = self.state();
        st.events.push(Event::Emodpe { addr, flags: bits });
        let p = st.pages.entry(addr).or_default();
        p.perms |= bits & PERM_MASK;
    }

    fn eacceptcopy(&self, si: &SecInfoBlock, addr: usize, src: usize) -> EmmResult {
        let bits = si.flags();
        let mut st = self.state();
        st.events.push(Event::EacceptCopy {
            addr,
            src,
            flags: bits,
        });
        let p = st.pages.entry(addr).or_default();
        if !p.present {
            p.present = true;
            p.pending = true;
        }
        if !p.pending {
            return Self::fail("EACCEPTCOPY of a non-pending page");
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, addr as *mut u8, PAGE_SIZE);
        }
        p.pending = false;
        p.committed = true;
        p.perms = bits & PERM_MASK;
        Ok(())
    }
}

static MOCK: OnceLock<MockRuntime> = OnceLock::new();
static TEST_LOCK: Mutex<()> = Mutex::new(());

pub fn mock() -> &'static MockRuntime {
    MOCK.get_or_init(MockRuntime::new)
}

/// Serialize tests (the manager is process-global state) and start from a
/// fresh manager over a fresh simulated EPC.
pub fn setup() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let m = mock();
    m.reset();
    if mm::init(m, m.user_base(), m.user_end()).is_err() {
        mm::destroy();
        mm::init(m, m.user_base(), m.user_end()).unwrap();
    }
    guard
}

pub fn user_regions() -> Vec<RegionInfo> {
    let mut v = Vec::new();
    mm::visit_regions(Window::User, &mut |r| v.push(*r));
    v
}

pub fn rts_regions() -> Vec<RegionInfo> {
    let mut v = Vec::new();
    mm::visit_regions(Window::Rts, &mut |r| v.push(*r));
    v
}

pub fn region_at(addr: usize) -> Option<RegionInfo> {
    user_regions()
        .into_iter()
        .chain(rts_regions())
        .find(|r| r.start <= addr && addr < r.start + r.size)
}

/// EACCEPT addresses recorded with the PENDING bit, in order.
pub fn pending_accept_addrs(events: &[Event], lo: usize, hi: usize) -> Vec<usize> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Eaccept { addr, flags }
                if *addr >= lo && *addr < hi && flags & FLAG_PENDING != 0 =>
            {
                Some(*addr)
            }
            _ => None,
        })
        .collect()
}

/// All EACCEPT events in `[lo, hi)`, regardless of state bits.
pub fn accept_events(events: &[Event], lo: usize, hi: usize) -> Vec<(usize, u64)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Eaccept { addr, flags } if *addr >= lo && *addr < hi => Some((*addr, *flags)),
            _ => None,
        })
        .collect()
}
