// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Architectural state and execution of the software vcpu.

use log::debug;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use vm_memory::Bytes;
use vm_memory::GuestAddress;
use vm_memory::GuestMemoryMmap;

use super::decode::decode;
use super::decode::Instruction;
use super::decode::OperandSize;
use super::ModelConfig;
use super::ModelCpuId;
use crate::smram::FieldWidth;
use crate::smram::SaveAreaField;
use crate::smram::SMRAM_STATE_OFFSET;
use crate::x86_64::*;
use crate::IoDirection;
use crate::VcpuExit;

/// Longest legal x86 instruction.
const MAX_INSN_LEN: u64 = 15;

/// SMBASE after reset.
const DEFAULT_SMBASE: u64 = 0x3_0000;

/// A fault raised by an instruction. With no IDT handlers installed, every fault escalates to a
/// triple fault.
#[derive(Debug)]
enum Fault {
    /// #GP with what the instruction tried to do.
    Gp(String),
    /// #UD with the reason the instruction could not run.
    Ud(String),
    /// Access to guest physical memory that is not backed by any slot.
    Bus(u64),
}

/// Bits currently pinned through the paravirtual MSRs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedBits {
    pub cr0: u64,
    pub cr4: u64,
}

impl PinnedBits {
    fn get(&self, reg: ControlRegister) -> u64 {
        match reg {
            ControlRegister::Cr0 => self.cr0,
            ControlRegister::Cr4 => self.cr4,
        }
    }

    fn get_mut(&mut self, reg: ControlRegister) -> &mut u64 {
        match reg {
            ControlRegister::Cr0 => &mut self.cr0,
            ControlRegister::Cr4 => &mut self.cr4,
        }
    }
}

/// Everything the software vcpu snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    pub regs: Regs,
    pub sregs: Sregs,
    pub smbase: u64,
    pub pinned: PinnedBits,
    pub icr: u64,
    pub smm: bool,
    pub smi_pending: bool,
    pub halted: bool,
    pub shutdown: bool,
    /// Segment state of the context interrupted by the SMI. Hardware keeps it in reserved parts
    /// of the save area; only the documented fields are read back from SMRAM.
    pub smm_saved: Option<Sregs>,
}

/// What an instruction runs against.
pub struct Env<'a> {
    pub mem: &'a GuestMemoryMmap,
    pub config: &'a ModelConfig,
    pub cpuid: &'a ModelCpuId,
}

fn pinnable(reg: ControlRegister) -> u64 {
    match reg {
        ControlRegister::Cr0 => CR0_PINNABLE,
        ControlRegister::Cr4 => CR4_PINNABLE,
    }
}

fn pin_msr_register(index: u32) -> Option<ControlRegister> {
    match index {
        MSR_KVM_CR0_PINNED => Some(ControlRegister::Cr0),
        MSR_KVM_CR4_PINNED => Some(ControlRegister::Cr4),
        _ => None,
    }
}

fn read_field(mem: &GuestMemoryMmap, base: u64, field: SaveAreaField) -> Result<u64, Fault> {
    let addr = base + field.offset;
    let value = match field.width {
        FieldWidth::U32 => mem.read_obj::<u32>(GuestAddress(addr)).map(u64::from),
        FieldWidth::U64 => mem.read_obj::<u64>(GuestAddress(addr)),
    };
    value.map_err(|_| Fault::Bus(addr))
}

fn write_field(
    mem: &GuestMemoryMmap,
    base: u64,
    field: SaveAreaField,
    value: u64,
) -> Result<(), Fault> {
    let addr = base + field.offset;
    let ret = match field.width {
        FieldWidth::U32 => mem.write_obj(field.width.truncate(value) as u32, GuestAddress(addr)),
        FieldWidth::U64 => mem.write_obj(value, GuestAddress(addr)),
    };
    ret.map_err(|_| Fault::Bus(addr))
}

fn flat_segment(type_: u8, base: u64, selector: u16) -> Segment {
    Segment {
        base,
        limit: 0xffff_ffff,
        selector,
        type_,
        present: 1,
        s: 1,
        ..Default::default()
    }
}

impl CpuState {
    /// State of vcpu `id` at power on.
    pub fn reset(id: u64) -> CpuState {
        let mut apic_base = APIC_DEFAULT_PHYS_BASE | MSR_IA32_APICBASE_ENABLE;
        if id == 0 {
            apic_base |= MSR_IA32_APICBASE_BSP;
        }
        let data = flat_segment(0x3, 0, 0);
        CpuState {
            regs: Regs {
                rip: 0xfff0,
                rflags: 0x2,
                ..Default::default()
            },
            sregs: Sregs {
                cs: Segment {
                    limit: 0xffff,
                    ..flat_segment(0xb, 0xffff_0000, 0xf000)
                },
                ds: data,
                es: data,
                fs: data,
                gs: data,
                ss: data,
                cr0: X86_CR0_ET | 0x6000_0000,
                apic_base,
                ..Default::default()
            },
            smbase: DEFAULT_SMBASE,
            pinned: PinnedBits::default(),
            icr: 0,
            smm: false,
            smi_pending: false,
            halted: false,
            shutdown: false,
            smm_saved: None,
        }
    }

    fn long_mode(&self) -> bool {
        self.sregs.efer & EFER_LMA != 0 && self.sregs.cs.l != 0
    }

    fn operand_size(&self) -> OperandSize {
        if self.long_mode() || self.sregs.cs.db != 0 {
            OperandSize::Dword
        } else {
            OperandSize::Word
        }
    }

    fn code_address(&self) -> u64 {
        if self.long_mode() {
            self.regs.rip
        } else {
            self.sregs.cs.base.wrapping_add(self.regs.rip)
        }
    }

    fn x2apic_enabled(&self) -> bool {
        let mask = X2APIC_ENABLE | MSR_IA32_APICBASE_ENABLE;
        self.sregs.apic_base & mask == mask
    }

    fn fetch(&self, mem: &GuestMemoryMmap) -> Vec<u8> {
        let start = self.code_address();
        (0..MAX_INSN_LEN)
            .map_while(|i| mem.read_obj::<u8>(GuestAddress(start + i)).ok())
            .collect()
    }

    fn gpr(&self, index: u8) -> u64 {
        self.regs.gprs()[usize::from(index)]
    }

    /// Writes a register the way an instruction of `size` bytes does: 32-bit writes clear the
    /// upper half, 16-bit writes preserve it.
    fn write_gpr(&mut self, index: u8, value: u64, size: u8) {
        let mut gprs = self.regs.gprs();
        let slot = &mut gprs[usize::from(index)];
        *slot = match size {
            2 => (*slot & !0xffff) | (value & 0xffff),
            4 => value & 0xffff_ffff,
            _ => value,
        };
        self.regs.set_gprs(gprs);
    }

    /// Applies a pin MSR write. Guest writes may only add bits that are already set in the
    /// register; the host may load any pinnable value.
    pub fn write_pins(&mut self, reg: ControlRegister, value: u64, host: bool) -> bool {
        if value & !pinnable(reg) != 0 {
            return false;
        }
        if host {
            *self.pinned.get_mut(reg) = value;
            return true;
        }
        if value & !self.sregs.cr(reg) != 0 {
            return false;
        }
        *self.pinned.get_mut(reg) |= value;
        true
    }

    fn guest_rdmsr(&self, index: u32, env: &Env) -> Result<u64, Fault> {
        match index {
            MSR_IA32_APICBASE => Ok(self.sregs.apic_base),
            MSR_X2APIC_ICR if self.x2apic_enabled() => Ok(self.icr),
            _ => match pin_msr_register(index) {
                Some(reg) if env.config.pinning_supported => Ok(self.pinned.get(reg)),
                _ => Err(Fault::Gp(format!("rdmsr {:#x}", index))),
            },
        }
    }

    fn guest_wrmsr(&mut self, index: u32, value: u64, env: &Env) -> Result<(), Fault> {
        match index {
            MSR_IA32_APICBASE => {
                if value & X2APIC_ENABLE != 0
                    && (!env.cpuid.x2apic || value & MSR_IA32_APICBASE_ENABLE == 0)
                {
                    return Err(Fault::Gp(format!("x2apic enable with {:#x}", value)));
                }
                self.sregs.apic_base = value;
                Ok(())
            }
            MSR_X2APIC_ICR if self.x2apic_enabled() => {
                if value & APIC_DM_MASK != APIC_DM_SMI
                    || value & APIC_DEST_SHORTHAND_MASK != APIC_DEST_SELF
                {
                    return Err(Fault::Gp(format!("unsupported ipi {:#x}", value)));
                }
                self.icr = value;
                self.smi_pending = true;
                debug!("model vcpu: self smi requested");
                Ok(())
            }
            _ => match pin_msr_register(index) {
                Some(reg) if env.config.pinning_supported => {
                    if self.write_pins(reg, value, false) {
                        Ok(())
                    } else {
                        Err(Fault::Gp(format!("pin {} bits {:#x}", reg, value)))
                    }
                }
                _ => Err(Fault::Gp(format!("wrmsr {:#x}", index))),
            },
        }
    }

    fn write_cr(&mut self, cr: u8, value: u64, env: &Env) -> Result<(), Fault> {
        let reg = match cr {
            0 => ControlRegister::Cr0,
            3 => {
                self.sregs.cr3 = value;
                return Ok(());
            }
            4 => ControlRegister::Cr4,
            _ => return Err(Fault::Ud(format!("mov to cr{}", cr))),
        };
        let pinned = self.pinned.get(reg);
        if value & pinned != pinned {
            return Err(Fault::Gp(format!(
                "{} write {:#x} clears pinned bits {:#x}",
                reg,
                value,
                pinned & !value
            )));
        }
        if reg == ControlRegister::Cr4 {
            let reserved = env.cpuid.reserved_cr4_bits();
            if value & reserved != 0 {
                return Err(Fault::Gp(format!(
                    "cr4 write {:#x} sets unsupported bits {:#x}",
                    value,
                    value & reserved
                )));
            }
            self.sregs.cr4 = value;
        } else {
            self.sregs.cr0 = value;
        }
        Ok(())
    }

    fn enter_smm(&mut self, env: &Env) -> Result<(), Fault> {
        let layout = env.config.smram_format.layout();
        let base = self.smbase + SMRAM_STATE_OFFSET;
        let mem = env.mem;
        write_field(mem, base, layout.revision_field, u64::from(layout.revision))?;
        write_field(mem, base, layout.smbase, self.smbase)?;
        write_field(mem, base, layout.cr0, self.sregs.cr0)?;
        write_field(mem, base, layout.cr3, self.sregs.cr3)?;
        write_field(mem, base, layout.cr4, self.sregs.cr4)?;
        write_field(mem, base, layout.rip, self.regs.rip)?;
        write_field(mem, base, layout.rflags, self.regs.rflags)?;
        if let Some(efer) = layout.efer {
            write_field(mem, base, efer, self.sregs.efer)?;
        }
        for (i, value) in self.regs.gprs().iter().enumerate() {
            if let Some(field) = layout.gpr(i) {
                write_field(mem, base, field, *value)?;
            }
        }

        self.smm_saved = Some(self.sregs);
        let data = flat_segment(0x3, 0, 0);
        self.sregs.cs = flat_segment(0xb, self.smbase, (self.smbase >> 4) as u16);
        self.sregs.ds = data;
        self.sregs.es = data;
        self.sregs.fs = data;
        self.sregs.gs = data;
        self.sregs.ss = data;
        self.sregs.cr0 &= !(X86_CR0_PE | X86_CR0_EM | X86_CR0_TS | X86_CR0_PG);
        self.sregs.cr4 = 0;
        self.sregs.efer = 0;
        self.regs.rip = SMRAM_STATE_OFFSET;
        self.regs.rflags = 0x2;
        self.smm = true;
        self.halted = false;
        debug!("model vcpu: entered smm at smbase {:#x}", self.smbase);
        Ok(())
    }

    fn rsm(&mut self, env: &Env) -> Result<(), Fault> {
        if !self.smm {
            return Err(Fault::Ud("rsm outside smm".to_string()));
        }
        let saved = self
            .smm_saved
            .ok_or_else(|| Fault::Ud("rsm without saved context".to_string()))?;
        let layout = env.config.smram_format.layout();
        let base = self.smbase + SMRAM_STATE_OFFSET;
        let mem = env.mem;

        let mut cr0 = read_field(mem, base, layout.cr0)?;
        let cr3 = read_field(mem, base, layout.cr3)?;
        let mut cr4 = read_field(mem, base, layout.cr4)?;
        let rip = read_field(mem, base, layout.rip)?;
        let rflags = read_field(mem, base, layout.rflags)?;
        let efer = match layout.efer {
            Some(field) => read_field(mem, base, field)?,
            None => saved.efer,
        };
        let smbase = read_field(mem, base, layout.smbase)?;
        let mut gprs = self.regs.gprs();
        for (i, gpr) in gprs.iter_mut().enumerate() {
            if let Some(field) = layout.gpr(i) {
                *gpr = read_field(mem, base, field)?;
            }
        }

        if env.config.ignore_pins_on_rsm {
            warn!("model vcpu: rsm ignoring pinned bits");
        } else {
            cr0 |= self.pinned.cr0;
            cr4 |= self.pinned.cr4;
        }

        self.sregs = Sregs {
            cr0,
            cr3,
            cr4,
            efer,
            apic_base: self.sregs.apic_base,
            ..saved
        };
        self.regs.set_gprs(gprs);
        self.regs.rip = rip;
        self.regs.rflags = rflags | 0x2;
        self.smbase = smbase & 0xffff_ffff;
        self.smm = false;
        self.smm_saved = None;
        debug!("model vcpu: rsm to {:#x}, cr0 {:#x} cr4 {:#x}", rip, cr0, cr4);
        Ok(())
    }

    fn triple_fault(&mut self, fault: Fault) -> VcpuExit {
        warn!(
            "model vcpu: {:?} at rip {:#x}, shutting down",
            fault, self.regs.rip
        );
        self.shutdown = true;
        VcpuExit::Shutdown
    }

    /// Runs one instruction, delivering a pending SMI first. Returns the exit if the instruction
    /// needs the host.
    pub fn step(&mut self, env: &Env) -> Option<VcpuExit> {
        if self.shutdown {
            return Some(VcpuExit::Shutdown);
        }
        if self.smi_pending && !self.smm {
            self.smi_pending = false;
            if let Err(fault) = self.enter_smm(env) {
                return Some(self.triple_fault(fault));
            }
        }
        if self.halted {
            return Some(VcpuExit::Hlt);
        }
        let bytes = self.fetch(env.mem);
        let (insn, len) = match decode(&bytes, self.operand_size(), self.long_mode()) {
            Ok(decoded) => decoded,
            Err(e) => {
                let fault = Fault::Ud(format!("{:?} at {:#x}", e, self.code_address()));
                return Some(self.triple_fault(fault));
            }
        };
        match self.execute(insn, len as u64, env) {
            Ok(exit) => exit,
            Err(fault) => Some(self.triple_fault(fault)),
        }
    }

    fn execute(
        &mut self,
        insn: Instruction,
        len: u64,
        env: &Env,
    ) -> Result<Option<VcpuExit>, Fault> {
        let next_rip = self.regs.rip.wrapping_add(len);
        let long_mode = self.long_mode();
        match insn {
            Instruction::MovImm { reg, imm, size } => self.write_gpr(reg, u64::from(imm), size),
            Instruction::MovAlImm(imm) => self.write_gpr_low8(imm),
            Instruction::OutImm8Al(port) => {
                self.regs.rip = next_rip;
                let mut data = [0u8; 8];
                data[0] = self.regs.rax as u8;
                return Ok(Some(VcpuExit::Io {
                    port: u16::from(port),
                    size: 1,
                    direction: IoDirection::Out,
                    data,
                }));
            }
            Instruction::Rdmsr => {
                let value = self.guest_rdmsr(self.regs.rcx as u32, env)?;
                self.write_gpr(0, value, 4);
                self.write_gpr(2, value >> 32, 4);
            }
            Instruction::Wrmsr => {
                let value = (self.regs.rdx << 32) | (self.regs.rax & 0xffff_ffff);
                self.guest_wrmsr(self.regs.rcx as u32, value, env)?;
            }
            Instruction::MovRegReg { dst, src, size } => self.write_gpr(dst, self.gpr(src), size),
            Instruction::OrAccImm { imm, wide: true } => {
                self.regs.rax |= imm as i32 as i64 as u64;
            }
            Instruction::OrAccImm { imm, wide: false } => {
                self.write_gpr(0, self.regs.rax | u64::from(imm), 4)
            }
            Instruction::XorRegReg { dst, src, size } => {
                self.write_gpr(dst, self.gpr(dst) ^ self.gpr(src), size)
            }
            Instruction::MovFromCr { cr, reg } => {
                let value = match cr {
                    0 => self.sregs.cr0,
                    2 => self.sregs.cr2,
                    3 => self.sregs.cr3,
                    4 => self.sregs.cr4,
                    _ => return Err(Fault::Ud(format!("mov from cr{}", cr))),
                };
                self.write_gpr(reg, value, if long_mode { 8 } else { 4 });
            }
            Instruction::MovToCr { cr, reg } => {
                let mut value = self.gpr(reg);
                if !long_mode {
                    value &= 0xffff_ffff;
                }
                self.write_cr(cr, value, env)?;
            }
            Instruction::Hlt => {
                self.regs.rip = next_rip;
                self.halted = true;
                return Ok(Some(VcpuExit::Hlt));
            }
            Instruction::JmpRel8(disp) => {
                self.regs.rip = next_rip.wrapping_add(disp as i64 as u64);
                return Ok(None);
            }
            Instruction::Rsm => {
                self.rsm(env)?;
                return Ok(None);
            }
        }
        self.regs.rip = next_rip;
        Ok(None)
    }

    fn write_gpr_low8(&mut self, value: u8) {
        self.regs.rax = (self.regs.rax & !0xff) | u64::from(value);
    }
}
