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

//! Enclave memory manager for SGX2 enclaves with EDMM.
//!
//! The manager tracks the enclave linear address space as a set of
//! non-overlapping enclave memory areas (EMAs) and drives the EDMM page
//! transitions (EAUG/EACCEPT, trim, permission and type changes) for them.
//! Low-level primitives and the process-wide recursive mutex are supplied by
//! the embedding runtime through [`rt::EmmRuntime`]; the public operations
//! live in [`mm`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(test, allow(dead_code))]

#[macro_use]
extern crate log;

#[macro_use]
mod error;

mod addr;
mod bitmap;
mod cell;
mod consts;
mod ema;
mod emalloc;

pub mod flags;
pub mod mm;
pub mod rt;

pub use consts::{PAGE_SHIFT, PAGE_SIZE};
pub use error::{EmmError, EmmErrorNum, EmmResult};
