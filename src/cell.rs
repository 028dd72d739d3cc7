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

use core::cell::UnsafeCell;

/// Interior-mutable slot for manager state guarded by the process-wide EMM
/// mutex ([`crate::rt::EmmRuntime::mm_lock`]).
///
/// Public operations can re-enter the manager on the same thread (the
/// internal heap grows by calling back into [`crate::mm::alloc`]), so
/// references into a cell must not be kept live across any call that may
/// re-enter; access stays on raw pointers.
pub(crate) struct LockedCell<T>(UnsafeCell<T>);

// Safe to share: the EMM mutex serializes all access.
unsafe impl<T> Sync for LockedCell<T> {}

impl<T> LockedCell<T> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Raw pointer to the contents. Dereference only while the EMM mutex is
    /// held.
    pub fn get(&self) -> *mut T {
        self.0.get()
    }
}
