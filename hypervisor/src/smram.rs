// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! SMRAM state-save area layouts.
//!
//! When a vcpu enters SMM the hypervisor writes the interrupted context to the top of the SMRAM
//! segment starting at SMBASE + 0x8000. The byte offsets below are relative to that point and
//! differ between save-state revisions, so they are kept as a table instead of being spread
//! around as literals.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::ControlRegister;

/// Offset from SMBASE of both the SMI entry point and the base of the save-area offsets.
pub const SMRAM_STATE_OFFSET: u64 = 0x8000;

/// Width of a field in the save area.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldWidth {
    U32,
    U64,
}

impl FieldWidth {
    pub fn bytes(self) -> usize {
        match self {
            FieldWidth::U32 => 4,
            FieldWidth::U64 => 8,
        }
    }

    /// Truncates `value` to what fits in the field.
    pub fn truncate(self, value: u64) -> u64 {
        match self {
            FieldWidth::U32 => value & 0xffff_ffff,
            FieldWidth::U64 => value,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SaveAreaField {
    pub offset: u64,
    pub width: FieldWidth,
}

const fn field64(offset: u64) -> SaveAreaField {
    SaveAreaField {
        offset,
        width: FieldWidth::U64,
    }
}

const fn field32(offset: u64) -> SaveAreaField {
    SaveAreaField {
        offset,
        width: FieldWidth::U32,
    }
}

/// Location of every field the harness and the reference vcpu touch.
#[derive(Debug, PartialEq, Eq)]
pub struct SaveAreaLayout {
    pub revision: u32,
    pub revision_field: SaveAreaField,
    pub smbase: SaveAreaField,
    pub cr0: SaveAreaField,
    pub cr3: SaveAreaField,
    pub cr4: SaveAreaField,
    pub rip: SaveAreaField,
    pub rflags: SaveAreaField,
    pub efer: Option<SaveAreaField>,
    /// Offset of general purpose register 0 (rax/eax).
    pub gpr_base: u64,
    /// Signed distance between consecutive registers in encoding order.
    pub gpr_stride: i64,
    /// Number of general purpose registers saved.
    pub gpr_count: usize,
    pub gpr_width: FieldWidth,
}

impl SaveAreaLayout {
    pub fn cr(&self, reg: ControlRegister) -> SaveAreaField {
        match reg {
            ControlRegister::Cr0 => self.cr0,
            ControlRegister::Cr4 => self.cr4,
        }
    }

    /// Field holding general purpose register `index` (encoding order), if this format saves it.
    pub fn gpr(&self, index: usize) -> Option<SaveAreaField> {
        if index >= self.gpr_count {
            return None;
        }
        let offset = self.gpr_base as i64 + self.gpr_stride * index as i64;
        Some(SaveAreaField {
            offset: offset as u64,
            width: self.gpr_width,
        })
    }
}

/// AMD64 format, used whenever the guest's CPUID advertises long mode.
pub static AMD64_LAYOUT: SaveAreaLayout = SaveAreaLayout {
    revision: 0x0002_0064,
    revision_field: field32(0x7efc),
    smbase: field32(0x7f00),
    cr0: field64(0x7f58),
    cr3: field64(0x7f50),
    cr4: field64(0x7f48),
    rip: field64(0x7f78),
    rflags: field64(0x7f70),
    efer: Some(field64(0x7ed0)),
    gpr_base: 0x7ff8,
    gpr_stride: -8,
    gpr_count: 16,
    gpr_width: FieldWidth::U64,
};

/// Legacy 32-bit format.
pub static LEGACY32_LAYOUT: SaveAreaLayout = SaveAreaLayout {
    revision: 0x0002_0000,
    revision_field: field32(0x7efc),
    smbase: field32(0x7ef8),
    cr0: field32(0x7ffc),
    cr3: field32(0x7ff8),
    cr4: field32(0x7f14),
    rip: field32(0x7ff0),
    rflags: field32(0x7ff4),
    efer: None,
    gpr_base: 0x7fd0,
    gpr_stride: 4,
    gpr_count: 8,
    gpr_width: FieldWidth::U32,
};

/// Save-state revision selecting a layout.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmramFormat {
    #[default]
    Amd64,
    Legacy32,
}

impl SmramFormat {
    pub fn layout(self) -> &'static SaveAreaLayout {
        match self {
            SmramFormat::Amd64 => &AMD64_LAYOUT,
            SmramFormat::Legacy32 => &LEGACY32_LAYOUT,
        }
    }
}

impl fmt::Display for SmramFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SmramFormat::Amd64 => write!(f, "amd64"),
            SmramFormat::Legacy32 => write!(f, "legacy32"),
        }
    }
}

impl FromStr for SmramFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" => Ok(SmramFormat::Amd64),
            "legacy32" => Ok(SmramFormat::Legacy32),
            _ => Err(format!("unknown smram format `{}` (expected amd64 or legacy32)", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amd64_control_register_offsets() {
        let layout = SmramFormat::Amd64.layout();
        assert_eq!(layout.cr(ControlRegister::Cr0).offset, 0x7f58);
        assert_eq!(layout.cr(ControlRegister::Cr4).offset, 0x7f48);
        assert_eq!(layout.cr0.width, FieldWidth::U64);
    }

    #[test]
    fn amd64_gprs_grow_down_from_rax() {
        let layout = &AMD64_LAYOUT;
        assert_eq!(layout.gpr(0).unwrap().offset, 0x7ff8);
        assert_eq!(layout.gpr(3).unwrap().offset, 0x7fe0);
        assert_eq!(layout.gpr(15).unwrap().offset, 0x7f80);
        assert!(layout.gpr(16).is_none());
    }

    #[test]
    fn legacy32_fields_are_narrow() {
        let layout = SmramFormat::Legacy32.layout();
        assert_eq!(layout.cr0.offset, 0x7ffc);
        assert_eq!(layout.cr4.offset, 0x7f14);
        assert_eq!(layout.cr4.width, FieldWidth::U32);
        assert_eq!(layout.gpr(7).unwrap().offset, 0x7fec);
        assert!(layout.gpr(8).is_none());
    }

    #[test]
    fn fields_stay_inside_the_state_page() {
        for layout in [&AMD64_LAYOUT, &LEGACY32_LAYOUT] {
            let mut fields = vec![
                layout.revision_field,
                layout.smbase,
                layout.cr0,
                layout.cr3,
                layout.cr4,
                layout.rip,
                layout.rflags,
            ];
            fields.extend(layout.efer);
            fields.extend((0..layout.gpr_count).filter_map(|i| layout.gpr(i)));
            for field in fields {
                assert!(field.offset >= 0x7e00);
                assert!(field.offset + field.width.bytes() as u64 <= 0x8000);
            }
        }
    }

    #[test]
    fn format_parses_from_cli_names() {
        assert_eq!("amd64".parse::<SmramFormat>(), Ok(SmramFormat::Amd64));
        assert_eq!("legacy32".parse::<SmramFormat>(), Ok(SmramFormat::Legacy32));
        assert!("ia64".parse::<SmramFormat>().is_err());
    }
}
