// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Architectural register state and constants shared by every backend.

use serde::Deserialize;
use serde::Serialize;
use static_assertions::const_assert_eq;

pub const X86_CR0_PE: u64 = 1 << 0;
pub const X86_CR0_EM: u64 = 1 << 2;
pub const X86_CR0_TS: u64 = 1 << 3;
pub const X86_CR0_ET: u64 = 1 << 4;
pub const X86_CR0_WP: u64 = 1 << 16;
pub const X86_CR0_PG: u64 = 1 << 31;

pub const X86_CR4_PAE: u64 = 1 << 5;
pub const X86_CR4_UMIP: u64 = 1 << 11;
pub const X86_CR4_SMEP: u64 = 1 << 20;
pub const X86_CR4_SMAP: u64 = 1 << 21;

pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;

pub const MSR_IA32_APICBASE: u32 = 0x1b;
pub const MSR_IA32_SMBASE: u32 = 0x9e;
/// The x2APIC MSR window starts here; register `r` of the xAPIC MMIO page lives at
/// `APIC_BASE_MSR + (r >> 4)`.
pub const APIC_BASE_MSR: u32 = 0x800;
pub const APIC_ICR: u32 = 0x300;
pub const MSR_X2APIC_ICR: u32 = APIC_BASE_MSR + (APIC_ICR >> 4);

/// Paravirtual MSRs through which the guest asks the hypervisor to pin CR0 and CR4 bits.
pub const MSR_KVM_CR0_PINNED: u32 = 0x4b56_4d06;
pub const MSR_KVM_CR4_PINNED: u32 = 0x4b56_4d07;

pub const MSR_IA32_APICBASE_BSP: u64 = 1 << 8;
pub const X2APIC_ENABLE: u64 = 1 << 10;
pub const MSR_IA32_APICBASE_ENABLE: u64 = 1 << 11;
pub const APIC_DEFAULT_PHYS_BASE: u64 = 0xfee0_0000;

pub const APIC_DM_SMI: u64 = 0x200;
pub const APIC_DM_MASK: u64 = 0x700;
pub const APIC_INT_ASSERT: u64 = 0x4000;
pub const APIC_DEST_SELF: u64 = 0x4_0000;
pub const APIC_DEST_SHORTHAND_MASK: u64 = 0xc_0000;

/// The bits the pinning MSRs accept for each control register.
pub const CR0_PINNABLE: u64 = X86_CR0_WP;
pub const CR4_PINNABLE: u64 = X86_CR4_UMIP | X86_CR4_SMEP | X86_CR4_SMAP;

const_assert_eq!(MSR_X2APIC_ICR, 0x830);
const_assert_eq!(CR4_PINNABLE, 0x30_0800);

/// A control register that can carry pinned bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRegister {
    Cr0,
    Cr4,
}

impl ControlRegister {
    /// Index used in the `mov crN` encodings.
    pub fn index(self) -> u8 {
        match self {
            ControlRegister::Cr0 => 0,
            ControlRegister::Cr4 => 4,
        }
    }

    pub fn pin_msr(self) -> u32 {
        match self {
            ControlRegister::Cr0 => MSR_KVM_CR0_PINNED,
            ControlRegister::Cr4 => MSR_KVM_CR4_PINNED,
        }
    }
}

impl std::fmt::Display for ControlRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ControlRegister::Cr0 => write!(f, "cr0"),
            ControlRegister::Cr4 => write!(f, "cr4"),
        }
    }
}

/// The state of a vcpu's general-purpose registers.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Regs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl Regs {
    /// Returns the registers in hardware encoding order (rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi,
    /// r8..r15).
    pub fn gprs(&self) -> [u64; 16] {
        [
            self.rax, self.rcx, self.rdx, self.rbx, self.rsp, self.rbp, self.rsi, self.rdi,
            self.r8, self.r9, self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
        ]
    }

    /// Inverse of `gprs`.
    pub fn set_gprs(&mut self, gprs: [u64; 16]) {
        [
            self.rax, self.rcx, self.rdx, self.rbx, self.rsp, self.rbp, self.rsi, self.rdi,
            self.r8, self.r9, self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
        ] = gprs;
    }
}

/// A segment register as seen by the hypervisor.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
}

impl Segment {
    /// Decodes a raw GDT descriptor living at `table_index` in the GDT.
    pub fn from_gdt_entry(entry: u64, table_index: u8) -> Segment {
        let g = ((entry >> 55) & 1) as u8;
        let raw_limit = (((entry >> 32) & 0x000f_0000) | (entry & 0xffff)) as u32;
        Segment {
            base: ((entry >> 32) & 0xff00_0000) | ((entry >> 16) & 0x00ff_ffff),
            limit: if g == 0 {
                raw_limit
            } else {
                (raw_limit << 12) | 0xfff
            },
            selector: u16::from(table_index) * 8,
            type_: ((entry >> 40) & 0xf) as u8,
            present: ((entry >> 47) & 1) as u8,
            dpl: ((entry >> 45) & 3) as u8,
            db: ((entry >> 54) & 1) as u8,
            s: ((entry >> 44) & 1) as u8,
            l: ((entry >> 53) & 1) as u8,
            g,
            avl: ((entry >> 52) & 1) as u8,
        }
    }
}

/// Builds a raw GDT descriptor.
pub fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((u64::from(base) & 0xff00_0000) << (56 - 24))
        | ((u64::from(flags) & 0x0000_f0ff) << 40)
        | ((u64::from(limit) & 0x000f_0000) << (48 - 16))
        | ((u64::from(base) & 0x00ff_ffff) << 16)
        | (u64::from(limit) & 0x0000_ffff)
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

/// The state of a vcpu's special registers.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sregs {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub tr: Segment,
    pub ldt: Segment,
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
}

impl Sregs {
    pub fn cr(&self, reg: ControlRegister) -> u64 {
        match reg {
            ControlRegister::Cr0 => self.cr0,
            ControlRegister::Cr4 => self.cr4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_from_code64_descriptor() {
        let cs = Segment::from_gdt_entry(gdt_entry(0xa09b, 0, 0xfffff), 1);
        assert_eq!(cs.selector, 0x08);
        assert_eq!(cs.l, 1);
        assert_eq!(cs.db, 0);
        assert_eq!(cs.present, 1);
        assert_eq!(cs.type_, 0xb);
        assert_eq!(cs.limit, 0xffff_ffff);
    }

    #[test]
    fn gdt_entries_match_known_encodings() {
        assert_eq!(gdt_entry(0xa09b, 0, 0xfffff), 0xaf9b000000ffff);
        assert_eq!(gdt_entry(0xc093, 0, 0xfffff), 0xcf93000000ffff);
        assert_eq!(gdt_entry(0x808b, 0, 0xfffff), 0x8f8b000000ffff);
    }

    #[test]
    fn gprs_round_trip_in_encoding_order() {
        let mut regs = Regs {
            rax: 1,
            rcx: 2,
            rbx: 4,
            r15: 16,
            ..Default::default()
        };
        let gprs = regs.gprs();
        assert_eq!(gprs[0], 1);
        assert_eq!(gprs[1], 2);
        assert_eq!(gprs[3], 4);
        assert_eq!(gprs[15], 16);
        regs.set_gprs([7; 16]);
        assert_eq!(regs.rsi, 7);
        assert_eq!(regs.r15, 7);
    }
}
