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

use core::fmt::{Debug, Formatter, Result};

/// POSIX errno
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum EmmErrorNum {
    EPERM = 1,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EEXIST = 17,
    EINVAL = 22,
}

pub struct EmmError {
    num: EmmErrorNum,
    loc_file: &'static str,
    loc_line: u32,
    loc_col: u32,
    msg: Option<&'static str>,
}

pub type EmmResult<T = ()> = core::result::Result<T, EmmError>;

impl EmmErrorNum {
    pub fn as_str(&self) -> &'static str {
        use EmmErrorNum::*;
        match *self {
            EPERM => "Operation not permitted",
            ENOMEM => "Out of memory",
            EACCES => "Permission denied",
            EFAULT => "Bad address",
            EEXIST => "File exists",
            EINVAL => "Invalid argument",
        }
    }

    pub fn code(&self) -> i32 {
        -(*self as u32 as i32)
    }
}

impl EmmError {
    pub fn new(
        num: EmmErrorNum,
        loc_file: &'static str,
        loc_line: u32,
        loc_col: u32,
        msg: Option<&'static str>,
    ) -> Self {
        Self {
            num,
            loc_file,
            loc_line,
            loc_col,
            msg,
        }
    }

    pub fn num(&self) -> EmmErrorNum {
        self.num
    }

    pub fn msg(&self) -> Option<&'static str> {
        self.msg
    }

    pub fn code(&self) -> i32 {
        self.num.code()
    }
}

impl From<EmmError> for i32 {
    fn from(e: EmmError) -> i32 {
        e.code()
    }
}

impl Debug for EmmError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(
            f,
            "[{}:{}:{}] {}",
            self.loc_file,
            self.loc_line,
            self.loc_col,
            self.num.as_str()
        )?;
        if let Some(msg) = self.msg {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! emm_err {
    ($num: ident) => {{
        use $crate::{EmmError, EmmErrorNum::*};
        EmmError::new($num, file!(), line!(), column!(), None)
    }};
    ($num: ident, $msg: expr) => {{
        use $crate::{EmmError, EmmErrorNum::*};
        EmmError::new($num, file!(), line!(), column!(), Some($msg))
    }};
}

#[macro_export]
macro_rules! emm_result_err {
    ($num: ident) => {
        Err(emm_err!($num))
    };
    ($num: ident, $msg: expr) => {
        Err(emm_err!($num, $msg))
    };
}
