// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Puts the guest straight into 64-bit mode with an identity mapped first gigabyte.

use std::mem;

use hypervisor::gdt_entry;
use hypervisor::GuestAddress;
use hypervisor::GuestMemory;
use hypervisor::Regs;
use hypervisor::Segment;
use hypervisor::Vcpu;
use hypervisor::EFER_LMA;
use hypervisor::EFER_LME;
use hypervisor::X86_CR0_ET;
use hypervisor::X86_CR0_PE;
use hypervisor::X86_CR0_PG;
use hypervisor::X86_CR4_PAE;

use crate::error::Result;

/// Slot of the ordinary guest memory.
pub const MAIN_SLOT: u32 = 0;
pub const MAIN_MEM_SIZE: u64 = 2 << 20;

/// Where the guest program is loaded and starts executing.
pub const CODE_ADDR: u64 = 0x1_0000;
const BOOT_STACK: u64 = 0x8000;

const BOOT_GDT_OFFSET: u64 = 0x500;
const BOOT_IDT_OFFSET: u64 = 0x520;
const BOOT_PML4_OFFSET: u64 = 0x9000;
const BOOT_PDPTE_OFFSET: u64 = 0xa000;
const TABLE_LEN: usize = 4096;

const BOOT_GDT_MAX: usize = 4;

fn gdt_table() -> [u64; BOOT_GDT_MAX] {
    [
        gdt_entry(0, 0, 0),            // NULL
        gdt_entry(0xa09b, 0, 0xfffff), // CODE
        gdt_entry(0xc093, 0, 0xfffff), // DATA
        gdt_entry(0x808b, 0, 0xfffff), // TSS
    ]
}

/// Writes the GDT, an empty IDT, the page tables and `code` into the main slot.
pub fn load_guest(mem: &GuestMemory, code: &[u8]) -> Result<()> {
    for (i, entry) in gdt_table().iter().enumerate() {
        mem.write_u64(*entry, GuestAddress(BOOT_GDT_OFFSET + 8 * i as u64))?;
    }
    mem.write_u64(0, GuestAddress(BOOT_IDT_OFFSET))?;

    mem.fill(GuestAddress(BOOT_PML4_OFFSET), TABLE_LEN, 0)?;
    mem.write_u64(BOOT_PDPTE_OFFSET | 3, GuestAddress(BOOT_PML4_OFFSET))?;
    mem.fill(GuestAddress(BOOT_PDPTE_OFFSET), TABLE_LEN, 0)?;
    // A single present, writable 1 GiB page.
    mem.write_u64(0x83, GuestAddress(BOOT_PDPTE_OFFSET))?;

    mem.write_at_addr(code, GuestAddress(CODE_ADDR))?;
    Ok(())
}

/// Loads 64-bit segments, paging and the entry point into `vcpu`.
pub fn setup_vcpu<V: Vcpu>(vcpu: &mut V) -> Result<()> {
    let gdt = gdt_table();
    let code_seg = Segment::from_gdt_entry(gdt[1], 1);
    let data_seg = Segment::from_gdt_entry(gdt[2], 2);
    let tss_seg = Segment::from_gdt_entry(gdt[3], 3);

    let mut sregs = vcpu.get_sregs()?;
    sregs.gdt.base = BOOT_GDT_OFFSET;
    sregs.gdt.limit = mem::size_of_val(&gdt) as u16 - 1;
    sregs.idt.base = BOOT_IDT_OFFSET;
    sregs.idt.limit = mem::size_of::<u64>() as u16 - 1;
    sregs.cs = code_seg;
    sregs.ds = data_seg;
    sregs.es = data_seg;
    sregs.fs = data_seg;
    sregs.gs = data_seg;
    sregs.ss = data_seg;
    sregs.tr = tss_seg;

    sregs.cr3 = BOOT_PML4_OFFSET;
    sregs.cr4 = X86_CR4_PAE;
    sregs.cr0 = X86_CR0_PE | X86_CR0_PG | X86_CR0_ET;
    sregs.efer = EFER_LME | EFER_LMA;
    vcpu.set_sregs(&sregs)?;

    vcpu.set_regs(&Regs {
        rflags: 0x2,
        rip: CODE_ADDR,
        rsp: BOOT_STACK,
        rbp: BOOT_STACK,
        ..Default::default()
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use hypervisor::model::ModelHypervisor;
    use hypervisor::Hypervisor;
    use hypervisor::Vm;

    use super::*;

    fn main_memory() -> GuestMemory {
        let mut mem = GuestMemory::new();
        mem.add_region(MAIN_SLOT, GuestAddress(0), MAIN_MEM_SIZE)
            .unwrap();
        mem
    }

    #[test]
    fn tables_land_at_fixed_offsets() {
        let mem = main_memory();
        load_guest(&mem, &[0xf4]).unwrap();
        assert_eq!(mem.read_u64(GuestAddress(0x500)).unwrap(), 0);
        assert_eq!(mem.read_u64(GuestAddress(0x508)).unwrap(), 0xaf9b000000ffff);
        assert_eq!(mem.read_u64(GuestAddress(0x510)).unwrap(), 0xcf93000000ffff);
        assert_eq!(mem.read_u64(GuestAddress(0x518)).unwrap(), 0x8f8b000000ffff);
        assert_eq!(mem.read_u64(GuestAddress(0x9000)).unwrap(), 0xa003);
        assert_eq!(mem.read_u64(GuestAddress(0xa000)).unwrap(), 0x83);
        let mut code = [0u8; 1];
        mem.read_at_addr(&mut code, GuestAddress(CODE_ADDR)).unwrap();
        assert_eq!(code, [0xf4]);
    }

    #[test]
    fn vcpu_starts_in_long_mode() {
        let mem = main_memory();
        let vm = ModelHypervisor::new(Default::default())
            .create_vm(&mem)
            .unwrap();
        let mut vcpu = vm.create_vcpu(1).unwrap();
        setup_vcpu(&mut vcpu).unwrap();
        let sregs = vcpu.get_sregs().unwrap();
        assert_eq!(sregs.cs.selector, 0x8);
        assert_eq!(sregs.cs.l, 1);
        assert_eq!(sregs.ss.selector, 0x10);
        assert_eq!(sregs.tr.selector, 0x18);
        assert_eq!(sregs.gdt.limit, 31);
        assert_eq!(sregs.idt.limit, 7);
        assert_eq!(sregs.cr3, 0x9000);
        assert_eq!(sregs.efer, EFER_LME | EFER_LMA);
        assert_eq!(vcpu.get_regs().unwrap().rip, CODE_ADDR);
    }
}
