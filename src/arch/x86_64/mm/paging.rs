//! `PageMap` (spec.md §4.2): a 4-level x86-64 page table wrapper
//! supporting mixed 4 KiB/2 MiB/1 GiB mappings, NX, and protection keys,
//! addressed entirely through the higher-half direct map so the walker
//! never needs a temporary mapping to reach a child table.

use bitflags::bitflags;
use x86_64::structures::paging::{PageTable, PageTableFlags as RawFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use crate::config::MAX_PROTECTION_KEY;
use crate::error::{KernelError, Result};
use crate::mm::frame::{PhysicalFrameAllocator, Pfn};
use crate::mm::hhdm_offset;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct Flags: u32 {
		const WRITABLE  = 1 << 0;
		const USER      = 1 << 1;
		const NO_EXECUTE = 1 << 2;
		const GLOBAL    = 1 << 3;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
	Page4K,
	Page2M,
	Page1G,
}

impl Granularity {
	fn page_size(self) -> u64 {
		match self {
			Granularity::Page4K => 0x1000,
			Granularity::Page2M => 0x20_0000,
			Granularity::Page1G => 0x4000_0000,
		}
	}

	/// Depth at which this granularity's leaf entry lives: 2 = PDPT (1 GiB
	/// huge pages), 3 = PD (2 MiB huge pages), 4 = PT (4 KiB pages). The
	/// PML4 (depth 1) never holds a leaf.
	fn leaf_level(self) -> u8 {
		match self {
			Granularity::Page1G => 2,
			Granularity::Page2M => 3,
			Granularity::Page4K => 4,
		}
	}
}

fn to_raw_flags(flags: Flags, huge: bool) -> RawFlags {
	let mut raw = RawFlags::PRESENT;
	if flags.contains(Flags::WRITABLE) {
		raw |= RawFlags::WRITABLE;
	}
	if flags.contains(Flags::USER) {
		raw |= RawFlags::USER_ACCESSIBLE;
	}
	if flags.contains(Flags::NO_EXECUTE) {
		raw |= RawFlags::NO_EXECUTE;
	}
	if flags.contains(Flags::GLOBAL) {
		raw |= RawFlags::GLOBAL;
	}
	if huge {
		raw |= RawFlags::HUGE_PAGE;
	}
	raw
}

fn from_raw_flags(raw: RawFlags) -> Flags {
	let mut flags = Flags::empty();
	if raw.contains(RawFlags::WRITABLE) {
		flags |= Flags::WRITABLE;
	}
	if raw.contains(RawFlags::USER_ACCESSIBLE) {
		flags |= Flags::USER;
	}
	if raw.contains(RawFlags::NO_EXECUTE) {
		flags |= Flags::NO_EXECUTE;
	}
	if raw.contains(RawFlags::GLOBAL) {
		flags |= Flags::GLOBAL;
	}
	flags
}

fn table_index(vaddr: u64, level: u8) -> usize {
	let shift = 12 + 9 * (4 - level);
	((vaddr >> shift) & 0x1FF) as usize
}

/// A mapped address space: a PML4 frame plus every table it roots, all
/// reached via the higher-half direct map. Owns the frame it was built
/// from; dropping it does not free anything, since freeing a page table
/// chain requires knowing which leaves are shared with another address
/// space (the kernel half, in `create_child`'s case).
///
/// The `x86_64` crate's `PageTableFlags` models only the bits it knows
/// about, which does not include the protection-key field (bits 59-62);
/// rather than poke raw bits past its typed API, non-zero protection key
/// assignments live in a side table keyed by page address.
pub struct PageMap {
	pml4_frame: PhysFrame,
	pkeys: hermit_sync::InterruptTicketMutex<alloc::collections::BTreeMap<u64, u8>>,
}

impl PageMap {
	/// Wraps an already-allocated, zeroed PML4 frame.
	pub fn from_frame(frame: PhysFrame) -> Self {
		Self { pml4_frame: frame, pkeys: hermit_sync::InterruptTicketMutex::new(alloc::collections::BTreeMap::new()) }
	}

	pub fn pml4_frame(&self) -> PhysFrame {
		self.pml4_frame
	}

	/// Allocates a fresh, all-kernel-unmapped, zeroed PML4.
	pub fn new_empty(allocator: &PhysicalFrameAllocator) -> Result<Self> {
		let pfn = allocator.alloc(1)?;
		let frame = PhysFrame::containing_address(PhysAddr::new(pfn * 0x1000));
		zero_table_at(frame);
		Ok(Self {
			pml4_frame: frame,
			pkeys: hermit_sync::InterruptTicketMutex::new(alloc::collections::BTreeMap::new()),
		})
	}

	fn table_virt(&self, frame: PhysFrame) -> *mut PageTable {
		(hhdm_offset() + frame.start_address().as_u64()) as *mut PageTable
	}

	fn root(&self) -> &mut PageTable {
		unsafe { &mut *self.table_virt(self.pml4_frame) }
	}

	/// Walks from the PML4 down to `level`, allocating any missing
	/// intermediate table lazily. Returns `None` if a huge leaf was
	/// encountered above `level` (the caller asked for a finer
	/// granularity than what is actually mapped there).
	fn walk_alloc(
		&self,
		vaddr: u64,
		level: u8,
		allocator: &PhysicalFrameAllocator,
	) -> Result<&mut PageTable> {
		let mut table = self.root();
		for depth in 1..level {
			let idx = table_index(vaddr, depth);
			let entry = &mut table[idx];
			if entry.is_unused() {
				let pfn = allocator.alloc(1)?;
				let frame = PhysFrame::containing_address(PhysAddr::new(pfn * 0x1000));
				zero_table_at(frame);
				entry.set_addr(
					frame.start_address(),
					RawFlags::PRESENT | RawFlags::WRITABLE | RawFlags::USER_ACCESSIBLE,
				);
			} else if entry.flags().contains(RawFlags::HUGE_PAGE) {
				return Err(KernelError::Misaligned);
			}
			let next_frame = PhysFrame::containing_address(entry.addr());
			table = unsafe { &mut *self.table_virt(next_frame) };
		}
		Ok(table)
	}

	fn walk_readonly(&self, vaddr: u64, level: u8) -> Option<(&PageTable, u8)> {
		let mut table: &PageTable = self.root();
		for depth in 1..level {
			let idx = table_index(vaddr, depth);
			let entry = &table[idx];
			if entry.is_unused() {
				return None;
			}
			if entry.flags().contains(RawFlags::HUGE_PAGE) {
				return Some((table, depth));
			}
			let frame = PhysFrame::containing_address(entry.addr());
			table = unsafe { &*self.table_virt(frame) };
		}
		Some((table, level))
	}

	/// Maps one leaf of the requested granularity at `vaddr` to `paddr`.
	pub fn map(
		&self,
		vaddr: u64,
		paddr: u64,
		flags: Flags,
		granularity: Granularity,
		pkey: u8,
		allocator: &PhysicalFrameAllocator,
	) -> Result<()> {
		if pkey > MAX_PROTECTION_KEY {
			return Err(KernelError::InvalidArgument);
		}
		let size = granularity.page_size();
		if vaddr % size != 0 || paddr % size != 0 {
			return Err(KernelError::Misaligned);
		}
		let level = granularity.leaf_level();
		let table = self.walk_alloc(vaddr, level, allocator)?;
		let idx = table_index(vaddr, level);
		let huge = !matches!(granularity, Granularity::Page4K);
		let raw = to_raw_flags(flags, huge);
		table[idx].set_addr(PhysAddr::new(paddr), raw);
		if pkey != 0 {
			self.pkeys.lock().insert(vaddr, pkey);
		} else {
			self.pkeys.lock().remove(&vaddr);
		}
		Ok(())
	}

	/// Maps `count` consecutive leaves of `granularity` starting at
	/// `vaddr`/`paddr`, stopping and returning the first error without
	/// unwinding earlier mappings (spec.md §4.2 leaves partial-range
	/// cleanup to the caller, who knows whether the range came from a
	/// freshly reserved arena slot it can simply abandon).
	pub fn map_range(
		&self,
		vaddr: u64,
		paddr: u64,
		count: u64,
		flags: Flags,
		granularity: Granularity,
		pkey: u8,
		allocator: &PhysicalFrameAllocator,
	) -> Result<()> {
		let size = granularity.page_size();
		for i in 0..count {
			self.map(vaddr + i * size, paddr + i * size, flags, granularity, pkey, allocator)?;
		}
		Ok(())
	}

	/// Allocates a fresh physical frame and maps it, for callers (the
	/// kernel heap, user page-fault handling) that don't already have a
	/// specific frame in mind.
	pub fn map_alloc(
		&self,
		vaddr: u64,
		flags: Flags,
		granularity: Granularity,
		pkey: u8,
		allocator: &PhysicalFrameAllocator,
	) -> Result<u64> {
		let n = granularity.page_size() / 0x1000;
		let pfn = allocator.alloc(n)?;
		let paddr = pfn * 0x1000;
		self.map(vaddr, paddr, flags, granularity, pkey, allocator)?;
		Ok(paddr)
	}

	/// Clears the leaf entry covering `vaddr`, whatever granularity it
	/// was mapped at, returning the physical address that had been
	/// mapped there.
	pub fn unmap(&self, vaddr: u64) -> Result<u64> {
		let (table, level) = self.walk_readonly(vaddr, 4).ok_or(KernelError::NotFound)?;
		let idx = table_index(vaddr, level);
		let entry_addr;
		{
			let entry = &table[idx];
			if entry.is_unused() {
				return Err(KernelError::NotFound);
			}
			entry_addr = entry.addr().as_u64();
		}
		let table_mut = unsafe { &mut *(table as *const PageTable as *mut PageTable) };
		table_mut[idx].set_unused();
		Ok(entry_addr)
	}

	/// Returns the physical address and effective flags mapped at
	/// `vaddr`, resolving through whatever granularity is actually
	/// present.
	pub fn translate(&self, vaddr: u64) -> Option<(u64, Flags)> {
		let (table, level) = self.walk_readonly(vaddr, 4)?;
		let idx = table_index(vaddr, level);
		let entry = &table[idx];
		if entry.is_unused() {
			return None;
		}
		let page_size = match level {
			2 => Granularity::Page1G.page_size(),
			3 => Granularity::Page2M.page_size(),
			_ => Granularity::Page4K.page_size(),
		};
		let offset = vaddr % page_size;
		Some((entry.addr().as_u64() + offset, from_raw_flags(entry.flags())))
	}

	pub fn get_flags(&self, vaddr: u64) -> Option<Flags> {
		self.translate(vaddr).map(|(_, f)| f)
	}

	pub fn get_pkey(&self, vaddr: u64) -> Option<u8> {
		self.translate(vaddr)?;
		Some(self.pkeys.lock().get(&vaddr).copied().unwrap_or(0))
	}

	/// Installs this address space as the active one (spec.md §4.2,
	/// `load`). `pcid` must be a value the calling core's `PcidManager`
	/// currently owns for this address space; `needs_flush` comes from
	/// that same call and tells the CPU whether to preserve (`NOFLUSH`,
	/// bit 63) or discard TLB entries already tagged with `pcid`.
	///
	/// # Safety
	/// Must run with interrupts disabled, and the caller must ensure the
	/// code currently executing and its stack remain mapped identically
	/// in the address space being loaded (true for any kernel-half
	/// transfer, since kernel-half entries are shared across every
	/// `PageMap`).
	pub unsafe fn load(&self, pcid: u16, needs_flush: bool) {
		unsafe {
			if needs_flush {
				crate::arch::x86_64::kernel::processor::load_cr3_flush(self.pml4_frame, pcid);
			} else {
				crate::arch::x86_64::kernel::processor::load_cr3_no_flush(self.pml4_frame, pcid);
			}
		}
	}

	/// Builds a new address space sharing this one's kernel half (PML4
	/// entries 256..512, the conventional higher-half split) by copying
	/// those entries verbatim, per spec.md §4.7: user regions live below
	/// the split and get their own subtree.
	pub fn create_child(&self, allocator: &PhysicalFrameAllocator) -> Result<Self> {
		let child = Self::new_empty(allocator)?;
		let parent_root = self.root();
		let child_root = child.root();
		for i in 256..512 {
			child_root[i] = parent_root[i].clone();
		}
		Ok(child)
	}
}

fn zero_table_at(frame: PhysFrame) {
	let virt = (hhdm_offset() + frame.start_address().as_u64()) as *mut PageTable;
	unsafe {
		(*virt).zero();
	}
}

pub fn current_pml4() -> PhysFrame {
	x86_64::registers::control::Cr3::read().0
}
