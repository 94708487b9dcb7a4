// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Track memory regions that are mapped to the guest VM.
//!
//! The host mappings are owned here rather than by a VM so that they outlive any number of VM
//! instances: every newly created VM registers the same slots again and sees the same bytes.

use std::sync::Arc;

use remain::sorted;
use thiserror::Error;
use vm_memory::Bytes;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory as _;
use vm_memory::GuestMemoryMmap;
use vm_memory::GuestRegionMmap;
use vm_memory::MmapRegion;

pub const PAGE_SIZE: u64 = 0x1000;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("guest memory access at {0:#x} failed: {1}")]
    Access(u64, vm_memory::GuestMemoryError),
    #[error("failed to insert slot {0}: {1}")]
    InsertRegion(u32, vm_memory::mmap::Error),
    #[error("failed to map {1:#x} bytes for slot {0}: {2}")]
    MapRegion(u32, u64, vm_memory::mmap::MmapRegionError),
    #[error("slot {slot} has no {pages} free pages at or above {min_addr:#x}")]
    OutOfPages { slot: u32, pages: u64, min_addr: u64 },
    #[error("memory slot {0} already exists")]
    SlotExists(u32),
    #[error("region size {0:#x} is not page aligned")]
    Unaligned(u64),
    #[error("no memory slot {0}")]
    UnknownSlot(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A guest physical range registered with the hypervisor under `slot`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemSlot {
    pub slot: u32,
    pub guest_addr: GuestAddress,
    pub size: u64,
}

#[derive(Debug)]
struct SlotAllocator {
    info: MemSlot,
    next_free: u64,
}

/// Guest physical memory plus the slot bookkeeping needed to hand it to a hypervisor.
#[derive(Debug, Default)]
pub struct GuestMemory {
    mem: GuestMemoryMmap,
    slots: Vec<SlotAllocator>,
}

impl GuestMemory {
    pub fn new() -> Self {
        Default::default()
    }

    /// Maps `size` bytes of anonymous memory at `guest_addr` and tracks it as `slot`.
    pub fn add_region(&mut self, slot: u32, guest_addr: GuestAddress, size: u64) -> Result<()> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(Error::Unaligned(size));
        }
        if self.slots.iter().any(|s| s.info.slot == slot) {
            return Err(Error::SlotExists(slot));
        }
        let mapping =
            MmapRegion::new(size as usize).map_err(|e| Error::MapRegion(slot, size, e))?;
        let region = GuestRegionMmap::new(mapping, guest_addr)
            .map_err(|e| Error::InsertRegion(slot, e))?;
        self.mem = self
            .mem
            .insert_region(Arc::new(region))
            .map_err(|e| Error::InsertRegion(slot, e))?;
        self.slots.push(SlotAllocator {
            info: MemSlot {
                slot,
                guest_addr,
                size,
            },
            next_free: guest_addr.0,
        });
        Ok(())
    }

    /// Allocates `pages` contiguous pages from `slot`, at or above `min_addr`, and returns the
    /// guest physical address of the first one. Callers that need a fixed address must check the
    /// result.
    pub fn alloc_pages(
        &mut self,
        slot: u32,
        pages: u64,
        min_addr: GuestAddress,
    ) -> Result<GuestAddress> {
        let allocator = self
            .slots
            .iter_mut()
            .find(|s| s.info.slot == slot)
            .ok_or(Error::UnknownSlot(slot))?;
        let end = allocator.info.guest_addr.0 + allocator.info.size;
        let start = allocator.next_free.max(min_addr.0);
        let start = (start + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let len = pages * PAGE_SIZE;
        if pages == 0 || start.checked_add(len).map_or(true, |alloc_end| alloc_end > end) {
            return Err(Error::OutOfPages {
                slot,
                pages,
                min_addr: min_addr.0,
            });
        }
        allocator.next_free = start + len;
        Ok(GuestAddress(start))
    }

    pub fn slots(&self) -> impl Iterator<Item = MemSlot> + '_ {
        self.slots.iter().map(|s| s.info)
    }

    /// Host virtual address backing `addr`.
    pub fn host_address(&self, addr: GuestAddress) -> Result<*mut u8> {
        self.mem
            .get_host_address(addr)
            .map_err(|e| Error::Access(addr.0, e))
    }

    /// Shares the underlying mappings, e.g. with a software vcpu.
    pub fn mmap(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    pub fn write_at_addr(&self, buf: &[u8], addr: GuestAddress) -> Result<()> {
        self.mem
            .write_slice(buf, addr)
            .map_err(|e| Error::Access(addr.0, e))
    }

    pub fn read_at_addr(&self, buf: &mut [u8], addr: GuestAddress) -> Result<()> {
        self.mem
            .read_slice(buf, addr)
            .map_err(|e| Error::Access(addr.0, e))
    }

    pub fn fill(&self, addr: GuestAddress, len: usize, byte: u8) -> Result<()> {
        self.write_at_addr(&vec![byte; len], addr)
    }

    pub fn read_u64(&self, addr: GuestAddress) -> Result<u64> {
        self.mem
            .read_obj::<u64>(addr)
            .map_err(|e| Error::Access(addr.0, e))
    }

    pub fn write_u64(&self, value: u64, addr: GuestAddress) -> Result<()> {
        self.mem
            .write_obj(value, addr)
            .map_err(|e| Error::Access(addr.0, e))
    }

    pub fn read_u32(&self, addr: GuestAddress) -> Result<u32> {
        self.mem
            .read_obj::<u32>(addr)
            .map_err(|e| Error::Access(addr.0, e))
    }

    pub fn write_u32(&self, value: u32, addr: GuestAddress) -> Result<()> {
        self.mem
            .write_obj(value, addr)
            .map_err(|e| Error::Access(addr.0, e))
    }
}
