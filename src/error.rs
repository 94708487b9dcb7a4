// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use hypervisor::ControlRegister;
use hypervisor::SmramFormat;
use remain::sorted;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read config file {0}: {1}")]
    ConfigFile(String, #[source] std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    ConfigParse(String, #[source] serde_json::Error),
    #[error("guest memory: {0}")]
    GuestMemory(#[from] hypervisor::guest_memory::Error),
    #[error("hypervisor: {0}")]
    Hypervisor(#[from] hypervisor::Error),
    #[error("cannot inject an SMI after stage {0}, only after stages 1 to 5")]
    InjectStage(u8),
    #[error("guest did not finish within {0} exits")]
    IterationLimit(usize),
    #[error("{reg} is {value:#x}, pinned bits {missing:#x} are clear")]
    MissingPinnedBits {
        reg: ControlRegister,
        value: u64,
        missing: u64,
    },
    #[error("{0} state changed across a save/restore cycle")]
    NotIdempotent(&'static str),
    #[error("guest reported done after stage {last}, expected stage {expected} first")]
    PrematureDone { last: u8, expected: u8 },
    #[error("save area revision is {actual:#x}, expected {expected:#x}")]
    SaveAreaRevision { expected: u32, actual: u32 },
    #[error("smram allocated at {actual:#x}, expected {expected:#x}")]
    SmramAddress { expected: u64, actual: u64 },
    #[error("failed to read {0}: {1}")]
    Sysfs(String, #[source] std::io::Error),
    #[error("unexpected value `{1}` in {0}")]
    SysfsValue(String, String),
    #[error("unexpected exit reason {0}: {1}")]
    UnexpectedExit(&'static str, String),
    #[error("unexpected port {actual:#x} (expected {expected:#x})")]
    UnexpectedPort { expected: u16, actual: u16 },
    #[error("unexpected stage {actual:#x} (expected {expected:#x})")]
    UnexpectedStage { expected: u8, actual: u8 },
    #[error("{0} save area is not used by this hypervisor")]
    UnsupportedSmramFormat(SmramFormat),
}
