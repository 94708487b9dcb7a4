// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A software vcpu implementing just enough of x86 to run the CR pinning scenario.
//!
//! It interprets the instruction subset the harness assembles, enters SMM through the configured
//! save-state layout, and enforces CR pinning the way the paravirtual interface defines it. A few
//! switches reproduce known ways a hypervisor can get pinning wrong, so that the harness can be
//! shown to catch them.

mod cpu;
pub mod decode;

use log::debug;
use serde::Deserialize;
use serde::Serialize;
use vm_memory::GuestMemoryMmap;

use self::cpu::CpuState;
use self::cpu::Env;
use crate::x86_64::*;
use crate::ControlRegister;
use crate::Error;
use crate::GuestMemory;
use crate::Hypervisor;
use crate::Regs;
use crate::Result;
use crate::SmramFormat;
use crate::Sregs;
use crate::Vcpu;
use crate::VcpuExit;
use crate::Vm;

/// CPU features the model exposes, standing in for CPUID.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelCpuId {
    pub x2apic: bool,
    pub umip: bool,
    pub smep: bool,
    pub smap: bool,
}

impl Default for ModelCpuId {
    fn default() -> Self {
        ModelCpuId {
            x2apic: true,
            umip: true,
            smep: true,
            smap: true,
        }
    }
}

impl ModelCpuId {
    /// Features a vcpu has before any CPUID is applied.
    pub fn none() -> Self {
        ModelCpuId {
            x2apic: false,
            umip: false,
            smep: false,
            smap: false,
        }
    }

    /// CR4 bits whose feature is not exposed.
    fn reserved_cr4_bits(&self) -> u64 {
        [
            (self.umip, X86_CR4_UMIP),
            (self.smep, X86_CR4_SMEP),
            (self.smap, X86_CR4_SMAP),
        ]
        .iter()
        .filter(|(present, _)| !present)
        .fold(0, |acc, (_, bit)| acc | bit)
    }
}

/// Behavior of the software vcpu.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Save-state layout written on SMM entry and read back by RSM.
    pub smram_format: SmramFormat,
    /// Whether the pin MSRs exist at all.
    pub pinning_supported: bool,
    /// Drop the pinned bits when a snapshot is restored.
    pub forget_pins_on_restore: bool,
    /// Let RSM load whatever the save area holds.
    pub ignore_pins_on_rsm: bool,
    /// Instructions `run` executes before giving up with `VcpuExit::Intr`.
    pub instruction_budget: u64,
    /// CPUID reported as supported.
    pub cpuid: ModelCpuId,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            smram_format: SmramFormat::default(),
            pinning_supported: true,
            forget_pins_on_restore: false,
            ignore_pins_on_rsm: false,
            instruction_budget: 100_000,
            cpuid: ModelCpuId::default(),
        }
    }
}

pub struct ModelHypervisor {
    config: ModelConfig,
}

impl ModelHypervisor {
    pub fn new(config: ModelConfig) -> ModelHypervisor {
        ModelHypervisor { config }
    }
}

impl Hypervisor for ModelHypervisor {
    type Vm = ModelVm;

    fn create_vm(&self, mem: &GuestMemory) -> Result<ModelVm> {
        Ok(ModelVm {
            mem: mem.mmap().clone(),
            config: self.config.clone(),
        })
    }

    fn get_supported_cpuid(&self) -> Result<ModelCpuId> {
        Ok(self.config.cpuid)
    }
}

pub struct ModelVm {
    mem: GuestMemoryMmap,
    config: ModelConfig,
}

impl Vm for ModelVm {
    type Vcpu = ModelVcpu;

    fn create_vcpu(&self, id: u64) -> Result<ModelVcpu> {
        Ok(ModelVcpu {
            cpu: CpuState::reset(id),
            cpuid: ModelCpuId::none(),
            mem: self.mem.clone(),
            config: self.config.clone(),
        })
    }
}

/// Serialized `CpuState`.
#[derive(Clone, Debug)]
pub struct ModelVcpuState {
    bytes: Vec<u8>,
}

impl ModelVcpuState {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

pub struct ModelVcpu {
    cpu: CpuState,
    cpuid: ModelCpuId,
    mem: GuestMemoryMmap,
    config: ModelConfig,
}

impl ModelVcpu {
    fn pin_register(&self, index: u32) -> Option<ControlRegister> {
        if !self.config.pinning_supported {
            return None;
        }
        [ControlRegister::Cr0, ControlRegister::Cr4]
            .into_iter()
            .find(|reg| reg.pin_msr() == index)
    }
}

impl Vcpu for ModelVcpu {
    type CpuId = ModelCpuId;
    type State = ModelVcpuState;

    fn run(&mut self) -> Result<VcpuExit> {
        let env = Env {
            mem: &self.mem,
            config: &self.config,
            cpuid: &self.cpuid,
        };
        for _ in 0..self.config.instruction_budget {
            if let Some(exit) = self.cpu.step(&env) {
                return Ok(exit);
            }
        }
        debug!(
            "model vcpu: instruction budget exhausted at rip {:#x}",
            self.cpu.regs.rip
        );
        Ok(VcpuExit::Intr)
    }

    fn get_regs(&self) -> Result<Regs> {
        Ok(self.cpu.regs)
    }

    fn set_regs(&mut self, regs: &Regs) -> Result<()> {
        self.cpu.regs = *regs;
        Ok(())
    }

    fn get_sregs(&self) -> Result<Sregs> {
        Ok(self.cpu.sregs)
    }

    fn set_sregs(&mut self, sregs: &Sregs) -> Result<()> {
        self.cpu.sregs = *sregs;
        Ok(())
    }

    fn get_msr(&self, index: u32) -> Result<u64> {
        match index {
            MSR_IA32_APICBASE => Ok(self.cpu.sregs.apic_base),
            MSR_IA32_SMBASE => Ok(self.cpu.smbase),
            MSR_X2APIC_ICR => Ok(self.cpu.icr),
            _ => match self.pin_register(index) {
                Some(ControlRegister::Cr0) => Ok(self.cpu.pinned.cr0),
                Some(ControlRegister::Cr4) => Ok(self.cpu.pinned.cr4),
                None => Err(Error::UnsupportedMsr(index)),
            },
        }
    }

    fn set_msr(&mut self, index: u32, value: u64) -> Result<()> {
        match index {
            MSR_IA32_APICBASE => self.cpu.sregs.apic_base = value,
            MSR_IA32_SMBASE => self.cpu.smbase = value & 0xffff_ffff,
            MSR_X2APIC_ICR => self.cpu.icr = value,
            _ => {
                let reg = self
                    .pin_register(index)
                    .ok_or(Error::UnsupportedMsr(index))?;
                if !self.cpu.write_pins(reg, value, true) {
                    return Err(Error::UnsupportedMsr(index));
                }
            }
        }
        Ok(())
    }

    fn set_cpuid(&mut self, cpuid: &ModelCpuId) -> Result<()> {
        self.cpuid = *cpuid;
        Ok(())
    }

    fn inject_smi(&mut self) -> Result<()> {
        self.cpu.smi_pending = true;
        Ok(())
    }

    fn save_state(&mut self) -> Result<ModelVcpuState> {
        let bytes = serde_json::to_vec(&self.cpu).map_err(Error::Snapshot)?;
        Ok(ModelVcpuState { bytes })
    }

    fn restore_state(&mut self, state: &ModelVcpuState) -> Result<()> {
        let mut cpu: CpuState = serde_json::from_slice(&state.bytes).map_err(Error::Snapshot)?;
        if self.config.forget_pins_on_restore {
            debug!("model vcpu: dropping pinned bits on restore");
            cpu.pinned = Default::default();
        }
        self.cpu = cpu;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vm_memory::GuestAddress;

    use super::*;

    fn vcpu_with(config: ModelConfig) -> (GuestMemory, ModelVcpu) {
        let mut mem = GuestMemory::new();
        mem.add_region(0, GuestAddress(0), 0x2_0000).unwrap();
        let hv = ModelHypervisor::new(config);
        let vm = hv.create_vm(&mem).unwrap();
        let mut vcpu = vm.create_vcpu(1).unwrap();
        vcpu.set_cpuid(&hv.get_supported_cpuid().unwrap()).unwrap();
        (mem, vcpu)
    }

    #[test]
    fn bsp_gets_bsp_flag() {
        let mut mem = GuestMemory::new();
        mem.add_region(0, GuestAddress(0), 0x1000).unwrap();
        let vm = ModelHypervisor::new(Default::default())
            .create_vm(&mem)
            .unwrap();
        let bsp = vm.create_vcpu(0).unwrap();
        let ap = vm.create_vcpu(1).unwrap();
        assert_eq!(bsp.get_msr(MSR_IA32_APICBASE).unwrap(), 0xfee0_0900);
        assert_eq!(ap.get_msr(MSR_IA32_APICBASE).unwrap(), 0xfee0_0800);
    }

    #[test]
    fn pin_msrs_absent_without_support() {
        let (_mem, mut vcpu) = vcpu_with(ModelConfig {
            pinning_supported: false,
            ..Default::default()
        });
        assert!(matches!(
            vcpu.get_msr(MSR_KVM_CR0_PINNED),
            Err(Error::UnsupportedMsr(MSR_KVM_CR0_PINNED))
        ));
        assert!(vcpu.set_msr(MSR_KVM_CR4_PINNED, X86_CR4_SMEP).is_err());
    }

    #[test]
    fn host_pin_writes_are_checked_against_pinnable_bits() {
        let (_mem, mut vcpu) = vcpu_with(Default::default());
        vcpu.set_msr(MSR_KVM_CR4_PINNED, X86_CR4_SMEP).unwrap();
        assert_eq!(vcpu.get_msr(MSR_KVM_CR4_PINNED).unwrap(), X86_CR4_SMEP);
        assert!(vcpu.set_msr(MSR_KVM_CR4_PINNED, X86_CR4_PAE).is_err());
    }

    #[test]
    fn snapshot_restores_into_a_fresh_vcpu() {
        let (mem, mut vcpu) = vcpu_with(Default::default());
        vcpu.set_msr(MSR_IA32_SMBASE, 0x100_0000).unwrap();
        vcpu.set_msr(MSR_KVM_CR0_PINNED, X86_CR0_WP).unwrap();
        vcpu.inject_smi().unwrap();
        let state = vcpu.save_state().unwrap();

        let vm = ModelHypervisor::new(Default::default())
            .create_vm(&mem)
            .unwrap();
        let mut fresh = vm.create_vcpu(1).unwrap();
        fresh.restore_state(&state).unwrap();
        assert_eq!(fresh.get_msr(MSR_IA32_SMBASE).unwrap(), 0x100_0000);
        assert_eq!(fresh.get_msr(MSR_KVM_CR0_PINNED).unwrap(), X86_CR0_WP);
        assert_eq!(fresh.get_regs().unwrap(), vcpu.get_regs().unwrap());
        assert_eq!(fresh.get_sregs().unwrap(), vcpu.get_sregs().unwrap());
        assert_eq!(fresh.save_state().unwrap().as_bytes(), state.as_bytes());
    }

    #[test]
    fn forgetful_restore_drops_pins() {
        let (_mem, mut vcpu) = vcpu_with(ModelConfig {
            forget_pins_on_restore: true,
            ..Default::default()
        });
        vcpu.set_msr(MSR_KVM_CR0_PINNED, X86_CR0_WP).unwrap();
        let state = vcpu.save_state().unwrap();
        vcpu.restore_state(&state).unwrap();
        assert_eq!(vcpu.get_msr(MSR_KVM_CR0_PINNED).unwrap(), 0);
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let (_mem, mut vcpu) = vcpu_with(Default::default());
        let state = ModelVcpuState {
            bytes: b"{\"regs\":".to_vec(),
        };
        assert!(matches!(
            vcpu.restore_state(&state),
            Err(Error::Snapshot(_))
        ));
    }

    #[test]
    fn spinning_guest_exhausts_budget() {
        let (mem, mut vcpu) = vcpu_with(ModelConfig {
            instruction_budget: 10,
            ..Default::default()
        });
        // jmp $
        mem.write_at_addr(&[0xeb, 0xfe], GuestAddress(0x1000))
            .unwrap();
        let mut regs = vcpu.get_regs().unwrap();
        regs.rip = 0x1000;
        vcpu.set_regs(&regs).unwrap();
        let mut sregs = vcpu.get_sregs().unwrap();
        sregs.cs.base = 0;
        vcpu.set_sregs(&sregs).unwrap();
        assert_eq!(vcpu.run().unwrap(), VcpuExit::Intr);
        assert_eq!(vcpu.get_regs().unwrap().rip, 0x1000);
    }

    #[test]
    fn unsupported_cr4_bits_fault() {
        let (mem, mut vcpu) = vcpu_with(ModelConfig {
            cpuid: ModelCpuId {
                smap: false,
                ..Default::default()
            },
            ..Default::default()
        });
        // mov cr4, rax
        mem.write_at_addr(&[0x0f, 0x22, 0xe0], GuestAddress(0x1000))
            .unwrap();
        let mut regs = vcpu.get_regs().unwrap();
        regs.rip = 0x1000;
        regs.rax = X86_CR4_SMAP;
        vcpu.set_regs(&regs).unwrap();
        let mut sregs = vcpu.get_sregs().unwrap();
        sregs.cs.base = 0;
        sregs.cs.db = 1;
        vcpu.set_sregs(&sregs).unwrap();
        assert_eq!(vcpu.run().unwrap(), VcpuExit::Shutdown);
    }
}
