// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The host control loop.
//!
//! Every exit of the guest has to be a stage report on the sync port. After handling a report the
//! vcpu is saved, the VM torn down and rebuilt over the same memory, and the state restored, so
//! that pinning has to survive a full migration-style round trip at every step.

use hypervisor::CpuIdOf;
use hypervisor::GuestAddress;
use hypervisor::GuestMemory;
use hypervisor::Hypervisor;
use hypervisor::IoDirection;
use hypervisor::Vcpu;
use hypervisor::VcpuExit;
use hypervisor::VcpuOf;
use hypervisor::Vm;
use log::debug;
use log::info;
use serde::Serialize;

use crate::boot::load_guest;
use crate::boot::setup_vcpu;
use crate::boot::MAIN_MEM_SIZE;
use crate::boot::MAIN_SLOT;
use crate::config::Config;
use crate::error::Error;
use crate::error::Result;
use crate::smram::clear_pinned_bits;
use crate::smram::set_smbase;
use crate::smram::setup_smram;
use crate::smram::TamperRecord;
use crate::stage::Report;
use crate::stage::Stage;
use crate::stage::StageTracker;
use crate::stage::SYNC_PORT;
use crate::verify::verify_pinned;

pub const VCPU_ID: u64 = 1;

/// What happened during a successful run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Every stage byte the guest reported, in order.
    pub stages: Vec<u8>,
    pub smm_entries: usize,
    pub tampering: Vec<TamperRecord>,
    /// Save/destroy/recreate/restore cycles performed.
    pub cycles: usize,
    pub final_cr0: u64,
    pub final_cr4: u64,
}

/// Returns the stage carried by `exit`, which must be a write to the sync port.
fn sync_stage<V: Vcpu>(vcpu: &V, exit: &VcpuExit) -> Result<u8> {
    match exit {
        VcpuExit::Io {
            port,
            direction: IoDirection::Out,
            ..
        } => {
            if *port != SYNC_PORT {
                return Err(Error::UnexpectedPort {
                    expected: SYNC_PORT,
                    actual: *port,
                });
            }
            Ok(vcpu.get_regs()?.rax as u8)
        }
        r => Err(Error::UnexpectedExit(r.name(), format!("{:?}", r))),
    }
}

/// Saves the vcpu, destroys it along with its VM, and restores it into a fresh instance.
fn cycle<H: Hypervisor>(
    hv: &H,
    mem: &GuestMemory,
    cpuid: &CpuIdOf<H>,
    vm: H::Vm,
    mut vcpu: VcpuOf<H>,
) -> Result<(H::Vm, VcpuOf<H>)> {
    let state = vcpu.save_state()?;
    drop(vcpu);
    drop(vm);

    let vm = hv.create_vm(mem)?;
    let mut vcpu = vm.create_vcpu(VCPU_ID)?;
    vcpu.set_cpuid(cpuid)?;
    vcpu.restore_state(&state)?;
    Ok((vm, vcpu))
}

/// Runs `program` to completion on `hv`, checking every stage and the pinned bits at the end.
pub fn run<H: Hypervisor>(hv: &H, config: &Config, program: &[u8]) -> Result<RunReport> {
    let mut mem = GuestMemory::new();
    mem.add_region(MAIN_SLOT, GuestAddress(0), MAIN_MEM_SIZE)?;
    let smbase = setup_smram(&mut mem)?;
    load_guest(&mem, program)?;

    let cpuid = hv.get_supported_cpuid()?;
    let mut vm = hv.create_vm(&mem)?;
    let mut vcpu = vm.create_vcpu(VCPU_ID)?;
    vcpu.set_cpuid(&cpuid)?;
    setup_vcpu(&mut vcpu)?;
    set_smbase(&mut vcpu, smbase)?;

    let layout = config.smram_format.layout();
    let cycles = config.cycles_per_stage.max(1);
    let mut tracker = StageTracker::new();
    let mut report = RunReport::default();

    for _ in 0..config.max_iterations {
        let exit = vcpu.run()?;
        let stage = sync_stage(&vcpu, &exit)?;
        report.stages.push(stage);
        let reported = tracker.check(stage)?;
        match reported {
            Report::Done => {
                let sregs = vcpu.get_sregs()?;
                report.final_cr0 = sregs.cr0;
                report.final_cr4 = sregs.cr4;
                verify_pinned(&sregs)?;
                info!(
                    "guest done: cr0 {:#x} cr4 {:#x} after {} cycles",
                    sregs.cr0, sregs.cr4, report.cycles
                );
                return Ok(report);
            }
            Report::Smram => {
                info!("stage {:#x} (smm)", stage);
                report.smm_entries += 1;
                report
                    .tampering
                    .extend(clear_pinned_bits(&mem, smbase, layout)?);
            }
            Report::Stage(s) => match Stage::n(s) {
                Some(stage) => info!("stage {}", stage),
                None => info!("stage {}", s),
            },
        }

        let mut before = None;
        for i in 0..cycles {
            (vm, vcpu) = cycle(hv, &mem, &cpuid, vm, vcpu)?;
            report.cycles += 1;
            debug!("save/restore cycle {} of {} done", i + 1, cycles);
            let regs = vcpu.get_regs()?;
            let sregs = vcpu.get_sregs()?;
            match before {
                None => before = Some((regs, sregs)),
                Some((prev_regs, prev_sregs)) => {
                    if regs != prev_regs {
                        return Err(Error::NotIdempotent("regs"));
                    }
                    if sregs != prev_sregs {
                        return Err(Error::NotIdempotent("sregs"));
                    }
                }
            }
        }

        if let Report::Stage(s) = reported {
            if config.inject_smi_after == Some(s) {
                info!("injecting smi after stage {}", s);
                vcpu.inject_smi()?;
            }
        }
        tracker.advance(reported);
    }
    Err(Error::IterationLimit(config.max_iterations))
}
