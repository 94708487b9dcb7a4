// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! `/dev/kvm` backend.

use kvm_bindings::kvm_debugregs;
use kvm_bindings::kvm_dtable;
use kvm_bindings::kvm_lapic_state;
use kvm_bindings::kvm_mp_state;
use kvm_bindings::kvm_msr_entry;
use kvm_bindings::kvm_regs;
use kvm_bindings::kvm_segment;
use kvm_bindings::kvm_sregs;
use kvm_bindings::kvm_userspace_memory_region;
use kvm_bindings::kvm_vcpu_events;
use kvm_bindings::kvm_xcrs;
use kvm_bindings::kvm_xsave;
use kvm_bindings::CpuId;
use kvm_bindings::Msrs;
use kvm_bindings::KVM_MAX_CPUID_ENTRIES;
use kvm_ioctls::Cap;
use kvm_ioctls::Kvm;
use kvm_ioctls::VcpuExit as KvmExit;
use kvm_ioctls::VcpuFd;
use kvm_ioctls::VmFd;
use log::debug;
use vm_memory::GuestMemoryMmap;

use crate::DescriptorTable;
use crate::Error;
use crate::GuestMemory;
use crate::Hypervisor;
use crate::IoDirection;
use crate::Regs;
use crate::Result;
use crate::Segment;
use crate::Sregs;
use crate::Vcpu;
use crate::VcpuExit;
use crate::Vm;

/// Identity map and TSS pages for VMX real-mode emulation, placed just below the 4 GiB boundary.
const KVM_TSS_ADDRESS: usize = 0xfffb_d000;

fn ioctl_err(name: &'static str) -> impl FnOnce(kvm_ioctls::Error) -> Error {
    move |e| Error::Ioctl(name, std::io::Error::from_raw_os_error(e.errno()))
}

pub struct KvmHypervisor {
    kvm: Kvm,
    msr_index_list: Vec<u32>,
}

impl KvmHypervisor {
    /// Opens `/dev/kvm` and caches the list of MSRs that make up a vcpu's saved state.
    pub fn new() -> Result<KvmHypervisor> {
        let kvm = Kvm::new().map_err(ioctl_err("open /dev/kvm"))?;
        let msr_index_list = kvm
            .get_msr_index_list()
            .map_err(ioctl_err("KVM_GET_MSR_INDEX_LIST"))?
            .as_slice()
            .to_vec();
        Ok(KvmHypervisor {
            kvm,
            msr_index_list,
        })
    }

    pub fn supports_smm(&self) -> bool {
        self.kvm.check_extension(Cap::X86Smm)
    }

    /// Whether `index` is part of the state KVM saves and restores, which is how paravirtual
    /// MSRs advertise themselves.
    pub fn supports_msr(&self, index: u32) -> bool {
        self.msr_index_list.contains(&index)
    }
}

impl Hypervisor for KvmHypervisor {
    type Vm = KvmVm;

    fn create_vm(&self, mem: &GuestMemory) -> Result<KvmVm> {
        let vm = self.kvm.create_vm().map_err(ioctl_err("KVM_CREATE_VM"))?;
        for slot in mem.slots() {
            let region = kvm_userspace_memory_region {
                slot: slot.slot,
                flags: 0,
                guest_phys_addr: slot.guest_addr.0,
                memory_size: slot.size,
                userspace_addr: mem.host_address(slot.guest_addr)? as u64,
            };
            // SAFETY: the region describes a live mapping owned by `mem`, and the returned
            // `KvmVm` holds a reference to those mappings for as long as the VM exists.
            unsafe { vm.set_user_memory_region(region) }
                .map_err(ioctl_err("KVM_SET_USER_MEMORY_REGION"))?;
        }
        vm.set_tss_address(KVM_TSS_ADDRESS)
            .map_err(ioctl_err("KVM_SET_TSS_ADDR"))?;
        vm.create_irq_chip()
            .map_err(ioctl_err("KVM_CREATE_IRQCHIP"))?;
        debug!("created kvm vm with {} memory slots", mem.slots().count());
        Ok(KvmVm {
            vm,
            _mem: mem.mmap().clone(),
            msr_index_list: self.msr_index_list.clone(),
        })
    }

    fn get_supported_cpuid(&self) -> Result<CpuId> {
        self.kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(ioctl_err("KVM_GET_SUPPORTED_CPUID"))
    }
}

pub struct KvmVm {
    vm: VmFd,
    _mem: GuestMemoryMmap,
    msr_index_list: Vec<u32>,
}

impl Vm for KvmVm {
    type Vcpu = KvmVcpu;

    fn create_vcpu(&self, id: u64) -> Result<KvmVcpu> {
        let vcpu = self
            .vm
            .create_vcpu(id)
            .map_err(ioctl_err("KVM_CREATE_VCPU"))?;
        Ok(KvmVcpu {
            vcpu,
            msr_index_list: self.msr_index_list.clone(),
        })
    }
}

/// Everything `KvmVcpu::save_state` captures.
pub struct KvmVcpuState {
    mp_state: kvm_mp_state,
    regs: kvm_regs,
    sregs: kvm_sregs,
    xsave: kvm_xsave,
    xcrs: kvm_xcrs,
    debug_regs: kvm_debugregs,
    lapic: kvm_lapic_state,
    msrs: Msrs,
    vcpu_events: kvm_vcpu_events,
}

pub struct KvmVcpu {
    vcpu: VcpuFd,
    msr_index_list: Vec<u32>,
}

impl KvmVcpu {
    /// Lets KVM finish an I/O instruction the guest exited on, without re-entering the guest.
    /// State read before this would still describe the middle of the instruction.
    fn complete_io(&mut self) -> Result<()> {
        self.vcpu.set_kvm_immediate_exit(1);
        let ret = self.vcpu.run().map(|_| ());
        self.vcpu.set_kvm_immediate_exit(0);
        match ret {
            Err(e) if e.errno() != libc::EINTR => Err(ioctl_err("KVM_RUN")(e)),
            _ => Ok(()),
        }
    }

    fn msr_entries(&self) -> Result<Msrs> {
        let entries: Vec<kvm_msr_entry> = self
            .msr_index_list
            .iter()
            .map(|&index| kvm_msr_entry {
                index,
                ..Default::default()
            })
            .collect();
        Msrs::from_entries(&entries).map_err(|_| Error::Unsupported("an MSR list this long"))
    }
}

impl Vcpu for KvmVcpu {
    type CpuId = CpuId;
    type State = KvmVcpuState;

    fn run(&mut self) -> Result<VcpuExit> {
        let exit = match self.vcpu.run() {
            Ok(exit) => exit,
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {
                return Ok(VcpuExit::Intr)
            }
            Err(e) => return Err(ioctl_err("KVM_RUN")(e)),
        };
        Ok(match exit {
            KvmExit::IoOut(port, data) => {
                let mut buf = [0u8; 8];
                let size = data.len().min(buf.len());
                buf[..size].copy_from_slice(&data[..size]);
                VcpuExit::Io {
                    port,
                    size,
                    direction: IoDirection::Out,
                    data: buf,
                }
            }
            KvmExit::IoIn(port, data) => VcpuExit::Io {
                port,
                size: data.len(),
                direction: IoDirection::In,
                data: [0; 8],
            },
            KvmExit::MmioRead(address, data) => VcpuExit::Mmio {
                address,
                size: data.len(),
                write: false,
            },
            KvmExit::MmioWrite(address, data) => VcpuExit::Mmio {
                address,
                size: data.len(),
                write: true,
            },
            KvmExit::Hlt => VcpuExit::Hlt,
            KvmExit::Shutdown => VcpuExit::Shutdown,
            KvmExit::FailEntry(hardware_entry_failure_reason, _cpu) => VcpuExit::FailEntry {
                hardware_entry_failure_reason,
            },
            KvmExit::InternalError => VcpuExit::InternalError,
            KvmExit::Intr => VcpuExit::Intr,
            KvmExit::SystemEvent(event_type, _) => VcpuExit::SystemEvent(event_type),
            other => VcpuExit::Unknown(format!("{:?}", other)),
        })
    }

    fn get_regs(&self) -> Result<Regs> {
        self.vcpu
            .get_regs()
            .map(|r| Regs::from(&r))
            .map_err(ioctl_err("KVM_GET_REGS"))
    }

    fn set_regs(&mut self, regs: &Regs) -> Result<()> {
        self.vcpu
            .set_regs(&kvm_regs::from(regs))
            .map_err(ioctl_err("KVM_SET_REGS"))
    }

    fn get_sregs(&self) -> Result<Sregs> {
        self.vcpu
            .get_sregs()
            .map(|s| Sregs::from(&s))
            .map_err(ioctl_err("KVM_GET_SREGS"))
    }

    fn set_sregs(&mut self, sregs: &Sregs) -> Result<()> {
        // Start from the current value so pending interrupt state is preserved.
        let mut kvm_sregs = self
            .vcpu
            .get_sregs()
            .map_err(ioctl_err("KVM_GET_SREGS"))?;
        sregs.apply_to(&mut kvm_sregs);
        self.vcpu
            .set_sregs(&kvm_sregs)
            .map_err(ioctl_err("KVM_SET_SREGS"))
    }

    fn get_msr(&self, index: u32) -> Result<u64> {
        let mut msrs = Msrs::from_entries(&[kvm_msr_entry {
            index,
            ..Default::default()
        }])
        .map_err(|_| Error::UnsupportedMsr(index))?;
        let read = self
            .vcpu
            .get_msrs(&mut msrs)
            .map_err(ioctl_err("KVM_GET_MSRS"))?;
        if read != 1 {
            return Err(Error::UnsupportedMsr(index));
        }
        Ok(msrs.as_slice()[0].data)
    }

    fn set_msr(&mut self, index: u32, value: u64) -> Result<()> {
        let msrs = Msrs::from_entries(&[kvm_msr_entry {
            index,
            data: value,
            ..Default::default()
        }])
        .map_err(|_| Error::UnsupportedMsr(index))?;
        let written = self
            .vcpu
            .set_msrs(&msrs)
            .map_err(ioctl_err("KVM_SET_MSRS"))?;
        if written != 1 {
            return Err(Error::UnsupportedMsr(index));
        }
        Ok(())
    }

    fn set_cpuid(&mut self, cpuid: &CpuId) -> Result<()> {
        self.vcpu
            .set_cpuid2(cpuid)
            .map_err(ioctl_err("KVM_SET_CPUID2"))
    }

    fn inject_smi(&mut self) -> Result<()> {
        self.vcpu.smi().map_err(ioctl_err("KVM_SMI"))
    }

    fn save_state(&mut self) -> Result<KvmVcpuState> {
        self.complete_io()?;

        // KVM_GET_MP_STATE may modify LAPIC state, so it goes first. KVM_GET_VCPU_EVENTS goes
        // last since the other getters can change pending event state.
        let mp_state = self
            .vcpu
            .get_mp_state()
            .map_err(ioctl_err("KVM_GET_MP_STATE"))?;
        let regs = self.vcpu.get_regs().map_err(ioctl_err("KVM_GET_REGS"))?;
        let sregs = self.vcpu.get_sregs().map_err(ioctl_err("KVM_GET_SREGS"))?;
        let xsave = self.vcpu.get_xsave().map_err(ioctl_err("KVM_GET_XSAVE"))?;
        let xcrs = self.vcpu.get_xcrs().map_err(ioctl_err("KVM_GET_XCRS"))?;
        let debug_regs = self
            .vcpu
            .get_debug_regs()
            .map_err(ioctl_err("KVM_GET_DEBUGREGS"))?;
        let lapic = self.vcpu.get_lapic().map_err(ioctl_err("KVM_GET_LAPIC"))?;
        let mut msrs = self.msr_entries()?;
        let read = self
            .vcpu
            .get_msrs(&mut msrs)
            .map_err(ioctl_err("KVM_GET_MSRS"))?;
        if read != self.msr_index_list.len() {
            return Err(Error::MsrCount {
                expected: self.msr_index_list.len(),
                got: read,
            });
        }
        let vcpu_events = self
            .vcpu
            .get_vcpu_events()
            .map_err(ioctl_err("KVM_GET_VCPU_EVENTS"))?;
        Ok(KvmVcpuState {
            mp_state,
            regs,
            sregs,
            xsave,
            xcrs,
            debug_regs,
            lapic,
            msrs,
            vcpu_events,
        })
    }

    fn restore_state(&mut self, state: &KvmVcpuState) -> Result<()> {
        // SET_SREGS restores the APIC base, so it precedes SET_LAPIC. SET_VCPU_EVENTS carries the
        // SMM flags and must come after SET_SREGS.
        self.vcpu
            .set_xsave(&state.xsave)
            .map_err(ioctl_err("KVM_SET_XSAVE"))?;
        self.vcpu
            .set_xcrs(&state.xcrs)
            .map_err(ioctl_err("KVM_SET_XCRS"))?;
        self.vcpu
            .set_sregs(&state.sregs)
            .map_err(ioctl_err("KVM_SET_SREGS"))?;
        self.vcpu
            .set_lapic(&state.lapic)
            .map_err(ioctl_err("KVM_SET_LAPIC"))?;
        let written = self
            .vcpu
            .set_msrs(&state.msrs)
            .map_err(ioctl_err("KVM_SET_MSRS"))?;
        if written != state.msrs.as_slice().len() {
            return Err(Error::MsrCount {
                expected: state.msrs.as_slice().len(),
                got: written,
            });
        }
        self.vcpu
            .set_vcpu_events(&state.vcpu_events)
            .map_err(ioctl_err("KVM_SET_VCPU_EVENTS"))?;
        self.vcpu
            .set_mp_state(state.mp_state)
            .map_err(ioctl_err("KVM_SET_MP_STATE"))?;
        self.vcpu
            .set_debug_regs(&state.debug_regs)
            .map_err(ioctl_err("KVM_SET_DEBUGREGS"))?;
        self.vcpu
            .set_regs(&state.regs)
            .map_err(ioctl_err("KVM_SET_REGS"))
    }
}

impl From<&kvm_regs> for Regs {
    fn from(r: &kvm_regs) -> Self {
        Regs {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rsp: r.rsp,
            rbp: r.rbp,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rip: r.rip,
            rflags: r.rflags,
        }
    }
}

impl From<&Regs> for kvm_regs {
    fn from(r: &Regs) -> Self {
        kvm_regs {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rsp: r.rsp,
            rbp: r.rbp,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rip: r.rip,
            rflags: r.rflags,
        }
    }
}

impl From<&kvm_segment> for Segment {
    fn from(s: &kvm_segment) -> Self {
        Segment {
            base: s.base,
            limit: s.limit,
            selector: s.selector,
            type_: s.type_,
            present: s.present,
            dpl: s.dpl,
            db: s.db,
            s: s.s,
            l: s.l,
            g: s.g,
            avl: s.avl,
        }
    }
}

impl From<&Segment> for kvm_segment {
    fn from(s: &Segment) -> Self {
        kvm_segment {
            base: s.base,
            limit: s.limit,
            selector: s.selector,
            type_: s.type_,
            present: s.present,
            dpl: s.dpl,
            db: s.db,
            s: s.s,
            l: s.l,
            g: s.g,
            avl: s.avl,
            unusable: if s.present == 0 { 1 } else { 0 },
            padding: 0,
        }
    }
}

impl From<&kvm_dtable> for DescriptorTable {
    fn from(d: &kvm_dtable) -> Self {
        DescriptorTable {
            base: d.base,
            limit: d.limit,
        }
    }
}

impl From<&DescriptorTable> for kvm_dtable {
    fn from(d: &DescriptorTable) -> Self {
        kvm_dtable {
            base: d.base,
            limit: d.limit,
            ..Default::default()
        }
    }
}

impl From<&kvm_sregs> for Sregs {
    fn from(s: &kvm_sregs) -> Self {
        Sregs {
            cs: Segment::from(&s.cs),
            ds: Segment::from(&s.ds),
            es: Segment::from(&s.es),
            fs: Segment::from(&s.fs),
            gs: Segment::from(&s.gs),
            ss: Segment::from(&s.ss),
            tr: Segment::from(&s.tr),
            ldt: Segment::from(&s.ldt),
            gdt: DescriptorTable::from(&s.gdt),
            idt: DescriptorTable::from(&s.idt),
            cr0: s.cr0,
            cr2: s.cr2,
            cr3: s.cr3,
            cr4: s.cr4,
            cr8: s.cr8,
            efer: s.efer,
            apic_base: s.apic_base,
        }
    }
}

impl Sregs {
    /// Overwrites the fields `Sregs` models, leaving the interrupt bitmap alone.
    fn apply_to(&self, s: &mut kvm_sregs) {
        s.cs = kvm_segment::from(&self.cs);
        s.ds = kvm_segment::from(&self.ds);
        s.es = kvm_segment::from(&self.es);
        s.fs = kvm_segment::from(&self.fs);
        s.gs = kvm_segment::from(&self.gs);
        s.ss = kvm_segment::from(&self.ss);
        s.tr = kvm_segment::from(&self.tr);
        s.ldt = kvm_segment::from(&self.ldt);
        s.gdt = kvm_dtable::from(&self.gdt);
        s.idt = kvm_dtable::from(&self.idt);
        s.cr0 = self.cr0;
        s.cr2 = self.cr2;
        s.cr3 = self.cr3;
        s.cr4 = self.cr4;
        s.cr8 = self.cr8;
        s.efer = self.efer;
        s.apic_base = self.apic_base;
    }
}
