// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The sync-port protocol between the guest and the host.

use std::fmt;

use crate::error::Error;
use crate::error::Result;

/// Port the guest writes its stage to.
pub const SYNC_PORT: u16 = 0x0e;

/// Stage reported by the SMI handler.
pub const SMRAM_STAGE: u8 = 0xfe;

/// Stage reported once the guest program has finished.
pub const DONE: u8 = 0xff;

/// The ordinal checkpoint that has to be passed before `DONE` is accepted.
pub const LAST_STAGE: u8 = Stage::PinCr4 as u8;

/// The checkpoints of the guest program, in order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, enumn::N)]
#[repr(u8)]
pub enum Stage {
    ReadApicBase = 1,
    EnableX2Apic = 2,
    PinCr0 = 3,
    SetCr4 = 4,
    PinCr4 = 5,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Stage::ReadApicBase => "read apic base",
            Stage::EnableX2Apic => "enable x2apic",
            Stage::PinCr0 => "pin cr0",
            Stage::SetCr4 => "set cr4",
            Stage::PinCr4 => "pin cr4",
        };
        write!(f, "{} ({})", *self as u8, name)
    }
}

/// One validated report from the guest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Report {
    /// The next ordinal stage.
    Stage(u8),
    /// The SMI handler ran.
    Smram,
    /// The guest program finished.
    Done,
}

/// Validates the stage sequence: ordinals strictly in order, SMRAM markers anywhere without
/// advancing, and `DONE` only after the last ordinal.
#[derive(Debug)]
pub struct StageTracker {
    expected: u8,
}

impl Default for StageTracker {
    fn default() -> Self {
        StageTracker { expected: 1 }
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Default::default()
    }

    /// The ordinal the guest is expected to report next.
    pub fn expected(&self) -> u8 {
        self.expected
    }

    /// Checks `stage` without advancing. Call `advance` once the report has been handled.
    pub fn check(&self, stage: u8) -> Result<Report> {
        match stage {
            SMRAM_STAGE => Ok(Report::Smram),
            DONE if self.expected > LAST_STAGE => Ok(Report::Done),
            DONE => Err(Error::PrematureDone {
                last: self.expected - 1,
                expected: self.expected,
            }),
            s if s == self.expected => Ok(Report::Stage(s)),
            s => Err(Error::UnexpectedStage {
                expected: self.expected,
                actual: s,
            }),
        }
    }

    pub fn advance(&mut self, report: Report) {
        if let Report::Stage(s) = report {
            self.expected = s + 1;
        }
    }
}
