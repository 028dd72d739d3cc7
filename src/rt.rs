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

//! Runtime abstraction consumed by the manager.
//!
//! The embedding runtime supplies the process-wide recursive mutex, the
//! enclave-range predicate, the untrusted out-calls and the in-enclave
//! instruction wrappers. It registers an implementation through
//! [`crate::mm::init`], the way a `log` consumer installs its logger.

use bitflags::bitflags;
use spin::mutex::SpinMutex;

use crate::error::EmmResult;
use crate::flags::{AllocFlags, PageType, SecInfo, SecInfoBlock};

bitflags! {
    /// Page-fault error code bits reported to the first-phase handler.
    pub struct PfErrorCode: u32 {
        const PROTECTION_VIOLATION  = 1 << 0;
        const CAUSED_BY_WRITE       = 1 << 1;
        const USER_MODE             = 1 << 2;
        const INSTRUCTION_FETCH     = 1 << 4;
        const SGX                   = 1 << 15;
    }
}

/// Fault description passed to [`crate::mm::enclave_pfhandler`] and to
/// registered region handlers.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PfInfo {
    pub maddr: u64,
    pub pfec: PfErrorCode,
    _reserved: u32,
}

impl PfInfo {
    pub fn new(maddr: u64, pfec: PfErrorCode) -> Self {
        Self {
            maddr,
            pfec,
            _reserved: 0,
        }
    }
}

/// Outcome of first-phase fault handling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PfOutcome {
    /// The fault was resolved; resume the faulting instruction.
    ContinueExecution,
    /// Not handled here; let the runtime keep searching.
    ContinueSearch,
}

/// A region page-fault handler with its private data pointer.
pub type PfHandler = fn(&PfInfo, *mut u8) -> PfOutcome;

/// Low-level services the manager builds on. All methods are called with
/// page-aligned arguments.
pub trait EmmRuntime: Sync {
    /// Acquire the process-wide EMM mutex. The mutex must be recursive:
    /// growing the internal heap re-enters the public allocation path on the
    /// same thread.
    fn mm_lock(&self);

    /// Release one level of the EMM mutex.
    fn mm_unlock(&self);

    /// Whether `[addr, addr + size)` lies entirely inside the enclave.
    fn is_within_enclave(&self, addr: usize, size: usize) -> bool;

    /// Ask the untrusted runtime to EAUG the range.
    fn alloc_ocall(
        &self,
        addr: usize,
        size: usize,
        page_type: PageType,
        alloc_flags: AllocFlags,
    ) -> EmmResult;

    /// Ask the untrusted runtime to transition the range (EMODPR/EMODT,
    /// mprotect, trim notification).
    fn modify_ocall(&self, addr: usize, size: usize, from: SecInfo, to: SecInfo) -> EmmResult;

    /// EACCEPT the page at `addr`.
    fn eaccept(&self, si: &SecInfoBlock, addr: usize) -> EmmResult;

    /// EMODPE the page at `addr`.
    fn emodpe(&self, si: &SecInfoBlock, addr: usize);

    /// EACCEPTCOPY the page at `addr` with contents from `src`.
    fn eacceptcopy(&self, si: &SecInfoBlock, addr: usize, src: usize) -> EmmResult;
}

static RUNTIME: SpinMutex<Option<&'static dyn EmmRuntime>> = SpinMutex::new(None);

pub(crate) fn set_runtime(runtime: &'static dyn EmmRuntime) {
    *RUNTIME.lock() = Some(runtime);
}

pub(crate) fn rt() -> &'static dyn EmmRuntime {
    RUNTIME.lock().expect("EMM runtime not registered")
}

/// Holds the process-wide EMM mutex for its lifetime, including early error
/// returns. Acquisition nests on the same thread.
pub(crate) struct MmLockGuard(());

pub(crate) fn lock() -> MmLockGuard {
    rt().mm_lock();
    MmLockGuard(())
}

impl Drop for MmLockGuard {
    fn drop(&mut self) {
        rt().mm_unlock();
    }
}
