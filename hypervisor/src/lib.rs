// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A crate for abstracting the hypervisor primitives the CR pinning harness drives.
//!
//! The harness only needs a narrow slice of a VMM: create and drop VMs over a shared set of
//! memory slots, run a single vcpu, poke its registers and MSRs, inject an SMI, and move the full
//! architectural state of a vcpu from one VM instance to the next. `kvm` implements that slice on
//! top of `/dev/kvm`; `model` implements it in software.

pub mod guest_memory;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod kvm;
pub mod model;
pub mod smram;
pub mod x86_64;

use remain::sorted;
use thiserror::Error;

pub use crate::guest_memory::GuestMemory;
pub use crate::guest_memory::MemSlot;
pub use crate::smram::SaveAreaLayout;
pub use crate::smram::SmramFormat;
pub use crate::x86_64::*;
pub use vm_memory::GuestAddress;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("guest memory: {0}")]
    GuestMemory(#[from] guest_memory::Error),
    #[error("{0} ioctl failed: {1}")]
    Ioctl(&'static str, #[source] std::io::Error),
    #[error("KVM_GET_MSRS returned {got} of {expected} msrs")]
    MsrCount { expected: usize, got: usize },
    #[error("malformed vcpu snapshot: {0}")]
    Snapshot(#[source] serde_json::Error),
    #[error("hypervisor does not support {0}")]
    Unsupported(&'static str),
    #[error("msr {0:#x} is not accessible")]
    UnsupportedMsr(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Direction of a port I/O access, from the guest's point of view.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoDirection {
    In,
    Out,
}

/// A reason why a vcpu exited. One of these returns every time `Vcpu::run` is called.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VcpuExit {
    /// A port I/O instruction was run. For `Out`, `data` holds the bytes written.
    Io {
        port: u16,
        size: usize,
        direction: IoDirection,
        data: [u8; 8],
    },
    Mmio {
        address: u64,
        size: usize,
        write: bool,
    },
    Hlt,
    /// The guest triple faulted.
    Shutdown,
    FailEntry {
        hardware_entry_failure_reason: u64,
    },
    InternalError,
    /// Interrupted before the guest made progress, e.g. by a signal or an exhausted time slice.
    Intr,
    SystemEvent(u32),
    /// An exit reason the backend does not classify, with the backend's description of it.
    Unknown(String),
}

impl VcpuExit {
    /// Short name in the style of the KVM exit reason strings.
    pub fn name(&self) -> &'static str {
        match self {
            VcpuExit::Io { .. } => "IO",
            VcpuExit::Mmio { .. } => "MMIO",
            VcpuExit::Hlt => "HLT",
            VcpuExit::Shutdown => "SHUTDOWN",
            VcpuExit::FailEntry { .. } => "FAIL_ENTRY",
            VcpuExit::InternalError => "INTERNAL_ERROR",
            VcpuExit::Intr => "INTR",
            VcpuExit::SystemEvent(_) => "SYSTEM_EVENT",
            VcpuExit::Unknown(_) => "UNKNOWN",
        }
    }
}

/// Entry point to a hypervisor: creates VMs over a shared `GuestMemory`.
pub trait Hypervisor {
    type Vm: Vm;

    /// Creates a VM with every slot of `mem` registered. The VM only borrows the mappings, so
    /// dropping it leaves the contents of `mem` intact.
    fn create_vm(&self, mem: &GuestMemory) -> Result<Self::Vm>;

    /// CPUID the hypervisor supports for its guests.
    fn get_supported_cpuid(&self) -> Result<CpuIdOf<Self>>;
}

pub type VcpuOf<H> = <<H as Hypervisor>::Vm as Vm>::Vcpu;
pub type CpuIdOf<H> = <VcpuOf<H> as Vcpu>::CpuId;

/// A single VM instance. Dropping it destroys the VM.
pub trait Vm {
    type Vcpu: Vcpu;

    /// Creates the vcpu with the given id. The vcpu keeps its VM alive on the hypervisor side,
    /// so it must be dropped before the VM to fully tear the instance down.
    fn create_vcpu(&self, id: u64) -> Result<Self::Vcpu>;
}

/// A wrapper around creating and using a vcpu on x86_64.
pub trait Vcpu {
    /// CPU feature descriptor applied with `set_cpuid`.
    type CpuId: Clone;
    /// Full architectural state, opaque to callers.
    type State;

    /// Runs the vcpu until it exits, returning the reason for the exit.
    fn run(&mut self) -> Result<VcpuExit>;

    fn get_regs(&self) -> Result<Regs>;
    fn set_regs(&mut self, regs: &Regs) -> Result<()>;
    fn get_sregs(&self) -> Result<Sregs>;
    fn set_sregs(&mut self, sregs: &Sregs) -> Result<()>;
    fn get_msr(&self, index: u32) -> Result<u64>;
    fn set_msr(&mut self, index: u32, value: u64) -> Result<()>;
    fn set_cpuid(&mut self, cpuid: &Self::CpuId) -> Result<()>;

    /// Queues a system management interrupt, delivered before the next guest instruction.
    fn inject_smi(&mut self) -> Result<()>;

    /// Captures everything needed to resume this vcpu on a freshly created VM.
    fn save_state(&mut self) -> Result<Self::State>;

    /// Loads a snapshot taken by `save_state`, possibly from a different VM instance.
    fn restore_state(&mut self, state: &Self::State) -> Result<()>;
}
