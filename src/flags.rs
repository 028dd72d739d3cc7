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

//! Allocation flags, page flags and the SECINFO image.

use bitflags::bitflags;
use core::fmt::{Debug, Formatter, Result};
use numeric_enum_macro::numeric_enum;

bitflags! {
    /// Allocation policy of an enclave memory area.
    ///
    /// Exactly one of `RESERVE`, `COMMIT_NOW` and `COMMIT_ON_DEMAND` must be
    /// set on an allocation request.
    pub struct AllocFlags: u32 {
        /// Hold address space only; no EPC backing, no bitmap.
        const RESERVE           = 1 << 0;
        /// EACCEPT every page during allocation.
        const COMMIT_NOW        = 1 << 1;
        /// Populate pages lazily, by explicit commit or page fault.
        const COMMIT_ON_DEMAND  = 1 << 2;
        /// Allocate on the RTS window on behalf of the enclave runtime.
        const SYSTEM            = 1 << 4;
        /// Region grows toward lower addresses (stacks).
        const GROWSDOWN         = 1 << 5;
        /// Region grows toward higher addresses.
        const GROWSUP           = 1 << 6;
        /// The requested address is not a hint; fail on collision.
        const FIXED             = 1 << 7;
    }
}

impl AllocFlags {
    pub const COMMIT_MASK: Self = Self {
        bits: Self::RESERVE.bits() | Self::COMMIT_NOW.bits() | Self::COMMIT_ON_DEMAND.bits(),
    };
}

bitflags! {
    /// Per-page access rights and EPCM state bits, laid out as in the low
    /// byte of SECINFO.FLAGS.
    pub struct PageFlags: u8 {
        /// The page can be read from inside the enclave.
        const R         = 1 << 0;
        /// The page can be written from inside the enclave.
        const W         = 1 << 1;
        /// The page can be executed from inside the enclave.
        const X         = 1 << 2;
        /// The page is in the PENDING state.
        const PENDING   = 1 << 3;
        /// The page is in the MODIFIED state.
        const MODIFIED  = 1 << 4;
        /// A permission restriction on the page is in progress.
        const PR        = 1 << 5;
    }
}

impl PageFlags {
    pub const PERM_MASK: Self = Self {
        bits: Self::R.bits() | Self::W.bits() | Self::X.bits(),
    };
    pub const RW: Self = Self {
        bits: Self::R.bits() | Self::W.bits(),
    };
    pub const WX: Self = Self {
        bits: Self::W.bits() | Self::X.bits(),
    };
}

numeric_enum! {
    #[repr(u8)]
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    /// EPCM page type (TCS, regular or trimmed), encoded as in bits 15:8 of
    /// SECINFO.FLAGS.
    pub enum PageType {
        Tcs = 1,
        Reg = 2,
        Trim = 4,
    }
}

/// Page type and access rights of a memory area, the logical view of the
/// first SECINFO qword.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct SecInfo {
    pub flags: PageFlags,
    pub page_type: PageType,
}

impl SecInfo {
    pub const fn new(flags: PageFlags, page_type: PageType) -> Self {
        Self { flags, page_type }
    }

    /// First qword of the SECINFO image: `(page_type << 8) | flags`.
    pub fn bits(&self) -> u64 {
        ((self.page_type as u64) << 8) | self.flags.bits() as u64
    }

    /// The R/W/X subset of the flags.
    pub fn perms(&self) -> PageFlags {
        self.flags & PageFlags::PERM_MASK
    }
}

impl Debug for SecInfo {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("SecInfo")
            .field("flags", &self.flags)
            .field("page_type", &self.page_type)
            .finish()
    }
}

/// SECINFO as consumed by EACCEPT/EMODPE/EACCEPTCOPY: one qword of flags
/// followed by reserved space, aligned to its own 64-byte size.
#[repr(C, align(64))]
pub struct SecInfoBlock {
    flags: u64,
    _reserved: [u64; 7],
}
static_assertions::const_assert_eq!(core::mem::size_of::<SecInfoBlock>(), 64);

impl SecInfoBlock {
    pub fn new(info: SecInfo) -> Self {
        Self {
            flags: info.bits(),
            _reserved: [0; 7],
        }
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }
}

impl From<SecInfo> for SecInfoBlock {
    fn from(info: SecInfo) -> Self {
        Self::new(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secinfo_bits() {
        let si = SecInfo::new(PageFlags::RW, PageType::Reg);
        assert_eq!(si.bits(), 0x203);

        let si = SecInfo::new(PageFlags::PENDING | PageFlags::RW, PageType::Reg);
        assert_eq!(si.bits(), 0x20b);

        let si = SecInfo::new(PageFlags::MODIFIED, PageType::Trim);
        assert_eq!(si.bits(), 0x410);

        let si = SecInfo::new(PageFlags::MODIFIED, PageType::Tcs);
        assert_eq!(si.bits(), 0x110);
    }

    #[test]
    fn test_perm_mask() {
        let si = SecInfo::new(PageFlags::PR | PageFlags::R | PageFlags::X, PageType::Reg);
        assert_eq!(si.perms(), PageFlags::R | PageFlags::X);
    }

    #[test]
    fn test_page_type_conversion() {
        use core::convert::TryFrom;
        assert_eq!(PageType::try_from(2), Ok(PageType::Reg));
        assert_eq!(PageType::try_from(4), Ok(PageType::Trim));
        assert!(PageType::try_from(3).is_err());
    }
}
