// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Machine code run inside the guest.

use hypervisor::ControlRegister;
use hypervisor::APIC_DEST_SELF;
use hypervisor::APIC_DM_SMI;
use hypervisor::APIC_INT_ASSERT;
use hypervisor::CR4_PINNABLE;
use hypervisor::MSR_IA32_APICBASE;
use hypervisor::MSR_X2APIC_ICR;
use hypervisor::X2APIC_ENABLE;
use hypervisor::X86_CR0_WP;

use crate::stage::Stage;
use crate::stage::DONE;
use crate::stage::SMRAM_STAGE;
use crate::stage::SYNC_PORT;

/// The CR0 bits the guest pins.
pub const CR0_PINNED: u64 = X86_CR0_WP;
/// The CR4 bits the guest pins.
pub const CR4_PINNED: u64 = CR4_PINNABLE;

/// General purpose registers in encoding order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
}

/// Assembles the handful of instructions the guest needs.
#[derive(Default)]
pub struct ProgramBuilder {
    code: Vec<u8>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    fn modrm(reg: u8, rm: u8) -> u8 {
        0xc0 | (reg << 3) | rm
    }

    /// `mov r32, imm32`
    pub fn mov_imm32(mut self, reg: Reg, imm: u32) -> Self {
        self.code.push(0xb8 + reg as u8);
        self.code.extend_from_slice(&imm.to_le_bytes());
        self
    }

    /// `mov dst32, src32`
    pub fn mov(mut self, dst: Reg, src: Reg) -> Self {
        self.code
            .extend_from_slice(&[0x89, Self::modrm(src as u8, dst as u8)]);
        self
    }

    /// `xor dst32, src32`
    pub fn xor(mut self, dst: Reg, src: Reg) -> Self {
        self.code
            .extend_from_slice(&[0x31, Self::modrm(src as u8, dst as u8)]);
        self
    }

    /// `or eax, imm32`
    pub fn or_eax(mut self, imm: u32) -> Self {
        self.code.push(0x0d);
        self.code.extend_from_slice(&imm.to_le_bytes());
        self
    }

    /// `or rax, imm32`; `imm` is sign extended.
    pub fn or_rax(mut self, imm: u32) -> Self {
        self.code.extend_from_slice(&[0x48, 0x0d]);
        self.code.extend_from_slice(&imm.to_le_bytes());
        self
    }

    pub fn rdmsr(mut self) -> Self {
        self.code.extend_from_slice(&[0x0f, 0x32]);
        self
    }

    pub fn wrmsr(mut self) -> Self {
        self.code.extend_from_slice(&[0x0f, 0x30]);
        self
    }

    /// `mov rax, crN`
    pub fn read_cr(mut self, cr: ControlRegister) -> Self {
        self.code.extend_from_slice(&[
            0x0f,
            0x20,
            Self::modrm(cr.index(), Reg::Rax as u8),
        ]);
        self
    }

    /// `mov crN, rax`
    pub fn write_cr(mut self, cr: ControlRegister) -> Self {
        self.code.extend_from_slice(&[
            0x0f,
            0x22,
            Self::modrm(cr.index(), Reg::Rax as u8),
        ]);
        self
    }

    /// Writes `value` to `msr`. Clobbers eax, ecx and edx.
    pub fn write_msr_imm(self, msr: u32, value: u32) -> Self {
        self.mov_imm32(Reg::Rcx, msr)
            .mov_imm32(Reg::Rax, value)
            .xor(Reg::Rdx, Reg::Rdx)
            .wrmsr()
    }

    /// Reports `stage` to the host. Clobbers al.
    pub fn sync(mut self, stage: u8) -> Self {
        self.code
            .extend_from_slice(&[0xb0, stage, 0xe6, SYNC_PORT as u8]);
        self
    }

    pub fn hlt(mut self) -> Self {
        self.code.push(0xf4);
        self
    }

    /// `hlt` in a loop, for code that must never continue.
    pub fn halt_forever(mut self) -> Self {
        // hlt; jmp back to the hlt
        self.code.extend_from_slice(&[0xf4, 0xeb, 0xfd]);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.code
    }
}

/// Variations of the guest program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramOptions {
    /// Raise an SMI on itself through the x2APIC once everything is pinned.
    pub self_smi: bool,
    /// Stage numbers to leave out of the reports.
    pub skip_stages: Vec<u8>,
    /// Halt right after reporting this stage, instead of continuing.
    pub halt_after: Option<u8>,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        ProgramOptions {
            self_smi: true,
            skip_stages: Vec::new(),
            halt_after: None,
        }
    }
}

impl ProgramOptions {
    fn sync(&self, prog: ProgramBuilder, stage: Stage) -> ProgramBuilder {
        let stage = stage as u8;
        let prog = if self.skip_stages.contains(&stage) {
            prog
        } else {
            prog.sync(stage)
        };
        if self.halt_after == Some(stage) {
            prog.hlt()
        } else {
            prog
        }
    }
}

/// The CR pinning guest program. Runs in 64-bit mode with interrupts off.
pub fn cr_pinning_program(opts: &ProgramOptions) -> Vec<u8> {
    // Keep the APIC base in ebx:esi across the sync, which clobbers al.
    let prog = ProgramBuilder::new()
        .mov_imm32(Reg::Rcx, MSR_IA32_APICBASE)
        .rdmsr()
        .mov(Reg::Rbx, Reg::Rax)
        .mov(Reg::Rsi, Reg::Rdx);
    let prog = opts.sync(prog, Stage::ReadApicBase);

    let prog = prog
        .mov_imm32(Reg::Rcx, MSR_IA32_APICBASE)
        .mov(Reg::Rax, Reg::Rbx)
        .or_eax(X2APIC_ENABLE as u32)
        .mov(Reg::Rdx, Reg::Rsi)
        .wrmsr();
    let prog = opts.sync(prog, Stage::EnableX2Apic);

    let prog = prog
        .read_cr(ControlRegister::Cr0)
        .or_rax(CR0_PINNED as u32)
        .write_cr(ControlRegister::Cr0)
        .write_msr_imm(ControlRegister::Cr0.pin_msr(), CR0_PINNED as u32);
    let prog = opts.sync(prog, Stage::PinCr0);

    let prog = prog
        .read_cr(ControlRegister::Cr4)
        .or_rax(CR4_PINNED as u32)
        .write_cr(ControlRegister::Cr4);
    let prog = opts.sync(prog, Stage::SetCr4);

    let prog = prog.write_msr_imm(ControlRegister::Cr4.pin_msr(), CR4_PINNED as u32);
    let mut prog = opts.sync(prog, Stage::PinCr4);

    if opts.self_smi {
        prog = prog.write_msr_imm(
            MSR_X2APIC_ICR,
            (APIC_DEST_SELF | APIC_INT_ASSERT | APIC_DM_SMI) as u32,
        );
    }
    prog.sync(DONE).halt_forever().build()
}

/// SMI handler copied to SMBASE + 0x8000: reports `SMRAM_STAGE` and resumes with `rsm`.
pub fn smi_handler() -> Vec<u8> {
    let mut code = ProgramBuilder::new().sync(SMRAM_STAGE).build();
    code.extend_from_slice(&[0x0f, 0xaa]);
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smi_handler_bytes() {
        assert_eq!(smi_handler(), vec![0xb0, 0xfe, 0xe6, 0x0e, 0x0f, 0xaa]);
    }

    #[test]
    fn encodings() {
        assert_eq!(
            ProgramBuilder::new()
                .mov_imm32(Reg::Rcx, 0x1b)
                .mov(Reg::Rbx, Reg::Rax)
                .xor(Reg::Rdx, Reg::Rdx)
                .read_cr(ControlRegister::Cr4)
                .write_cr(ControlRegister::Cr0)
                .or_rax(0x1_0000)
                .build(),
            vec![
                0xb9, 0x1b, 0x00, 0x00, 0x00, // mov ecx, 0x1b
                0x89, 0xc3, // mov ebx, eax
                0x31, 0xd2, // xor edx, edx
                0x0f, 0x20, 0xe0, // mov rax, cr4
                0x0f, 0x22, 0xc0, // mov cr0, rax
                0x48, 0x0d, 0x00, 0x00, 0x01, 0x00, // or rax, 0x10000
            ]
        );
    }

    fn count_syncs(code: &[u8], stage: u8) -> usize {
        code.windows(4)
            .filter(|w| *w == [0xb0, stage, 0xe6, 0x0e])
            .count()
    }

    #[test]
    fn default_program_reports_every_stage_once() {
        let code = cr_pinning_program(&Default::default());
        for stage in 1..=5 {
            assert_eq!(count_syncs(&code, stage), 1, "stage {}", stage);
        }
        assert_eq!(count_syncs(&code, DONE), 1);
        assert!(code.ends_with(&[0xf4, 0xeb, 0xfd]));
        let icr = 0x44200u32.to_le_bytes();
        assert!(code.windows(4).any(|w| w == icr));
    }

    #[test]
    fn options_shape_the_program() {
        let code = cr_pinning_program(&ProgramOptions {
            self_smi: false,
            skip_stages: vec![2],
            halt_after: Some(3),
        });
        assert_eq!(count_syncs(&code, 2), 0);
        let sync3 = code
            .windows(4)
            .position(|w| w == [0xb0, 3, 0xe6, 0x0e])
            .unwrap();
        assert_eq!(code[sync3 + 4], 0xf4);
        let icr = 0x44200u32.to_le_bytes();
        assert!(!code.windows(4).any(|w| w == icr));
    }
}
