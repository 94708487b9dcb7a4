// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! SMRAM setup and the host side of the bypass attempt.

use hypervisor::smram::FieldWidth;
use hypervisor::smram::SMRAM_STATE_OFFSET;
use hypervisor::ControlRegister;
use hypervisor::GuestAddress;
use hypervisor::GuestMemory;
use hypervisor::SaveAreaLayout;
use hypervisor::Vcpu;
use hypervisor::MSR_IA32_SMBASE;
use log::info;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::guest::smi_handler;
use crate::guest::CR0_PINNED;
use crate::guest::CR4_PINNED;

pub const SMRAM_SIZE: u64 = 0x1_0000;
pub const SMRAM_GPA: u64 = 0x100_0000;
/// Memory slot of SMRAM. Bit 16 selects the SMM address space.
pub const SMRAM_MEMSLOT: u32 = (1 << 16) | 1;
const SMRAM_PAGES: u64 = SMRAM_SIZE / hypervisor::guest_memory::PAGE_SIZE;

/// Adds the SMRAM slot to `mem`, zeroes it and loads the SMI handler at SMBASE + 0x8000.
pub fn setup_smram(mem: &mut GuestMemory) -> Result<GuestAddress> {
    mem.add_region(SMRAM_MEMSLOT, GuestAddress(SMRAM_GPA), SMRAM_SIZE)?;
    let smram = mem.alloc_pages(SMRAM_MEMSLOT, SMRAM_PAGES, GuestAddress(SMRAM_GPA))?;
    check_smram_address(smram)?;
    mem.fill(smram, SMRAM_SIZE as usize, 0)?;
    mem.write_at_addr(&smi_handler(), GuestAddress(SMRAM_GPA + SMRAM_STATE_OFFSET))?;
    Ok(smram)
}

fn check_smram_address(addr: GuestAddress) -> Result<()> {
    if addr.0 != SMRAM_GPA {
        return Err(Error::SmramAddress {
            expected: SMRAM_GPA,
            actual: addr.0,
        });
    }
    Ok(())
}

/// Points the vcpu's SMBASE at SMRAM.
pub fn set_smbase<V: Vcpu>(vcpu: &mut V, smbase: GuestAddress) -> Result<()> {
    vcpu.set_msr(MSR_IA32_SMBASE, smbase.0)?;
    Ok(())
}

/// A control register image in the save area, before and after tampering.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TamperRecord {
    pub reg: ControlRegister,
    pub before: u64,
    pub after: u64,
}

fn pinned_mask(reg: ControlRegister) -> u64 {
    match reg {
        ControlRegister::Cr0 => CR0_PINNED,
        ControlRegister::Cr4 => CR4_PINNED,
    }
}

/// Clears the pinned bits from the CR0 and CR4 images the SMI saved, which is what SMM code
/// trying to escape pinning would do before `rsm`. Fails if the hypervisor saved the state in a
/// different format than `layout`.
pub fn clear_pinned_bits(
    mem: &GuestMemory,
    smbase: GuestAddress,
    layout: &SaveAreaLayout,
) -> Result<Vec<TamperRecord>> {
    let state = smbase.0 + SMRAM_STATE_OFFSET;
    let revision = mem.read_u32(GuestAddress(state + layout.revision_field.offset))?;
    if revision != layout.revision {
        return Err(Error::SaveAreaRevision {
            expected: layout.revision,
            actual: revision,
        });
    }
    let mut records = Vec::new();
    for reg in [ControlRegister::Cr0, ControlRegister::Cr4] {
        let field = layout.cr(reg);
        let addr = GuestAddress(state + field.offset);
        let before = match field.width {
            FieldWidth::U32 => u64::from(mem.read_u32(addr)?),
            FieldWidth::U64 => mem.read_u64(addr)?,
        };
        let after = before & !pinned_mask(reg);
        match field.width {
            FieldWidth::U32 => mem.write_u32(after as u32, addr)?,
            FieldWidth::U64 => mem.write_u64(after, addr)?,
        }
        info!(
            "smram {} image {:#x} -> {:#x} at {:#x}",
            reg, before, after, addr.0
        );
        records.push(TamperRecord { reg, before, after });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use hypervisor::smram::AMD64_LAYOUT;
    use hypervisor::smram::LEGACY32_LAYOUT;
    use hypervisor::X86_CR0_PE;
    use hypervisor::X86_CR0_PG;
    use hypervisor::X86_CR0_WP;
    use hypervisor::X86_CR4_PAE;

    use super::*;

    fn stamp_revision(mem: &GuestMemory, layout: &SaveAreaLayout) {
        let addr = SMRAM_GPA + SMRAM_STATE_OFFSET + layout.revision_field.offset;
        mem.write_u32(layout.revision, GuestAddress(addr)).unwrap();
    }

    #[test]
    fn handler_is_loaded_into_zeroed_smram() {
        let mut mem = GuestMemory::new();
        let smram = setup_smram(&mut mem).unwrap();
        assert_eq!(smram, GuestAddress(SMRAM_GPA));
        let mut handler = [0u8; 6];
        mem.read_at_addr(&mut handler, GuestAddress(0x100_8000))
            .unwrap();
        assert_eq!(handler.to_vec(), smi_handler());
        assert_eq!(mem.read_u64(GuestAddress(SMRAM_GPA + 0x8000 + 0x7f58)).unwrap(), 0);
        let slot = mem.slots().next().unwrap();
        assert_eq!(slot.slot, 0x1_0001);
        assert_eq!(slot.size, 0x1_0000);
    }

    #[test]
    fn smram_must_land_at_its_fixed_address() {
        check_smram_address(GuestAddress(SMRAM_GPA)).unwrap();
        assert!(matches!(
            check_smram_address(GuestAddress(SMRAM_GPA + 0x1000)),
            Err(Error::SmramAddress {
                expected: 0x100_0000,
                actual: 0x100_1000
            })
        ));
    }

    #[test]
    fn smram_slot_is_added_once() {
        let mut mem = GuestMemory::new();
        setup_smram(&mut mem).unwrap();
        assert!(matches!(
            setup_smram(&mut mem),
            Err(Error::GuestMemory(_))
        ));
    }

    #[test]
    fn tamper_clears_only_pinned_bits() {
        let mut mem = GuestMemory::new();
        let smram = setup_smram(&mut mem).unwrap();
        let cr0 = X86_CR0_PE | X86_CR0_PG | X86_CR0_WP;
        let cr4 = X86_CR4_PAE | CR4_PINNED;
        mem.write_u64(cr0, GuestAddress(SMRAM_GPA + 0x8000 + 0x7f58))
            .unwrap();
        mem.write_u64(cr4, GuestAddress(SMRAM_GPA + 0x8000 + 0x7f48))
            .unwrap();
        stamp_revision(&mem, &AMD64_LAYOUT);
        let records = clear_pinned_bits(&mem, smram, &AMD64_LAYOUT).unwrap();
        assert_eq!(
            records,
            vec![
                TamperRecord {
                    reg: ControlRegister::Cr0,
                    before: cr0,
                    after: X86_CR0_PE | X86_CR0_PG,
                },
                TamperRecord {
                    reg: ControlRegister::Cr4,
                    before: cr4,
                    after: X86_CR4_PAE,
                },
            ]
        );
        assert_eq!(
            mem.read_u64(GuestAddress(SMRAM_GPA + 0x8000 + 0x7f58))
                .unwrap(),
            X86_CR0_PE | X86_CR0_PG
        );
    }

    #[test]
    fn tamper_uses_narrow_fields_in_legacy_layout() {
        let mut mem = GuestMemory::new();
        let smram = setup_smram(&mut mem).unwrap();
        let cr0_addr = GuestAddress(SMRAM_GPA + 0x8000 + 0x7ffc);
        mem.write_u32((X86_CR0_PE | X86_CR0_WP) as u32, cr0_addr)
            .unwrap();
        // Neighbouring dword belongs to another field and must survive.
        mem.write_u32(0xdead_beef, GuestAddress(SMRAM_GPA + 0x8000 + 0x7ff8))
            .unwrap();
        stamp_revision(&mem, &LEGACY32_LAYOUT);
        clear_pinned_bits(&mem, smram, &LEGACY32_LAYOUT).unwrap();
        assert_eq!(mem.read_u32(cr0_addr).unwrap(), X86_CR0_PE as u32);
        assert_eq!(
            mem.read_u32(GuestAddress(SMRAM_GPA + 0x8000 + 0x7ff8))
                .unwrap(),
            0xdead_beef
        );
    }

    #[test]
    fn tamper_refuses_a_foreign_save_area() {
        let mut mem = GuestMemory::new();
        let smram = setup_smram(&mut mem).unwrap();
        let cr0_addr = GuestAddress(SMRAM_GPA + 0x8000 + 0x7f58);
        mem.write_u64(X86_CR0_PE | X86_CR0_WP, cr0_addr).unwrap();
        stamp_revision(&mem, &AMD64_LAYOUT);
        assert!(matches!(
            clear_pinned_bits(&mem, smram, &LEGACY32_LAYOUT),
            Err(Error::SaveAreaRevision {
                expected: 0x2_0000,
                actual: 0x2_0064
            })
        ));
        // Nothing was written.
        assert_eq!(mem.read_u64(cr0_addr).unwrap(), X86_CR0_PE | X86_CR0_WP);
    }

    #[test]
    fn tamper_refuses_an_empty_save_area() {
        let mut mem = GuestMemory::new();
        let smram = setup_smram(&mut mem).unwrap();
        assert!(matches!(
            clear_pinned_bits(&mem, smram, &AMD64_LAYOUT),
            Err(Error::SaveAreaRevision { actual: 0, .. })
        ));
    }
}
