// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use hypervisor::ControlRegister;
use hypervisor::Sregs;

use crate::error::Error;
use crate::error::Result;
use crate::guest::CR0_PINNED;
use crate::guest::CR4_PINNED;

/// Fails if any bit of `mask` is clear in `value`.
pub fn check_pinned(reg: ControlRegister, value: u64, mask: u64) -> Result<()> {
    let missing = mask & !value;
    if missing != 0 {
        return Err(Error::MissingPinnedBits {
            reg,
            value,
            missing,
        });
    }
    Ok(())
}

/// Checks that the live CR0 and CR4 still carry every pinned bit.
pub fn verify_pinned(sregs: &Sregs) -> Result<()> {
    check_pinned(ControlRegister::Cr0, sregs.cr0, CR0_PINNED)?;
    check_pinned(ControlRegister::Cr4, sregs.cr4, CR4_PINNED)
}
