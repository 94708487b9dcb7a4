// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The `pv_cr_pinning` attribute the guest kernel publishes under `/sys/hypervisor`.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::Error;
use crate::error::Result;

pub const PV_CR_PINNING_PATH: &str = "/sys/hypervisor/pv_cr_pinning";

/// Reads the attribute at `path`. `None` means it is not there, which is the case when the
/// kernel does not run on KVM or paravirtualization was disabled with `nopv`.
pub fn read_pv_cr_pinning(path: &Path) -> Result<Option<bool>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Sysfs(path.display().to_string(), e)),
    };
    match contents.trim() {
        "0" => Ok(Some(false)),
        "1" => Ok(Some(true)),
        other => Err(Error::SysfsValue(
            path.display().to_string(),
            other.to_string(),
        )),
    }
}
