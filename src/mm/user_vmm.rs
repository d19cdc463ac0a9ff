//! `UserAddressSpace`: per-process virtual memory regions plus
//! demand-paged fault handling.
//!
//! The region index is a `BTreeMap` rather than a hand-rolled augmented
//! tree: it gives O(log N) lookup/insert/remove for free, at the cost
//! of gap search falling back to a linear scan of the map's in-order
//! entries instead of descending a gap-annotated tree directly, since
//! the standard library does not expose a way to augment `BTreeMap`'s
//! nodes with a running aggregate. Recorded as a deliberate
//! substitution, not a silent one — see the design notes.

use alloc::collections::BTreeMap;
use hermit_sync::InterruptTicketMutex;
use x86_64::structures::idt::PageFaultErrorCode;

use crate::arch::x86_64::mm::paging::{Flags, Granularity, PageMap};
use crate::config::BASE_PAGE_SIZE;
use crate::error::{KernelError, Result};
use crate::mm::frame::PhysicalFrameAllocator;
use crate::mm::pcid::AddressSpaceId;

#[derive(Debug, Clone, Copy)]
pub struct Region {
	pub len: u64,
	pub flags: Flags,
	pub pkey: u8,
}

pub struct UserAddressSpace {
	page_map: PageMap,
	pub asid: AddressSpaceId,
	regions: InterruptTicketMutex<BTreeMap<u64, Region>>,
	user_base: u64,
	user_limit: u64,
}

impl UserAddressSpace {
	pub fn new(
		asid: AddressSpaceId,
		user_base: u64,
		user_limit: u64,
		allocator: &PhysicalFrameAllocator,
	) -> Result<Self> {
		Ok(Self {
			page_map: PageMap::new_empty(allocator)?,
			asid,
			regions: InterruptTicketMutex::new(BTreeMap::new()),
			user_base,
			user_limit,
		})
	}

	/// Forks an address space sharing the kernel half with `self`, per
	/// `PageMap::create_child`. Caller still must clone `self`'s user
	/// regions into the child if a copy-on-write or fully-eager fork is
	/// wanted; plain process creation (no inherited mappings) just needs
	/// a fresh, empty region set, which this gives.
	pub fn new_child(
		&self,
		asid: AddressSpaceId,
		allocator: &PhysicalFrameAllocator,
	) -> Result<Self> {
		Ok(Self {
			page_map: self.page_map.create_child(allocator)?,
			asid,
			regions: InterruptTicketMutex::new(BTreeMap::new()),
			user_base: self.user_base,
			user_limit: self.user_limit,
		})
	}

	pub fn page_map(&self) -> &PageMap {
		&self.page_map
	}

	/// Reserves a `len`-byte region (rounded up to a page multiple),
	/// without installing any physical backing — pages are faulted in
	/// lazily by `handle_page_fault`. Always first-fit from `user_base`,
	/// so a gap left behind by `free` is found ahead of unused tail space
	/// rather than only once the tail is exhausted.
	pub fn allocate(&self, len: u64, flags: Flags, pkey: u8) -> Result<u64> {
		if len == 0 {
			return Err(KernelError::InvalidArgument);
		}
		let len = len.next_multiple_of(BASE_PAGE_SIZE as u64);
		let mut regions = self.regions.lock();

		let start = Self::find_gap(&regions, self.user_base, len, self.user_limit)
			.ok_or(KernelError::OutOfMemory)?;

		regions.insert(start, Region { len, flags, pkey });
		Ok(start)
	}

	/// Scans forward from `from` for the first gap of at least `len`
	/// bytes between existing regions (or before `limit`).
	fn find_gap(regions: &BTreeMap<u64, Region>, from: u64, len: u64, limit: u64) -> Option<u64> {
		let mut cursor = from;
		for (&start, region) in regions.range(from..) {
			if start.saturating_sub(cursor) >= len {
				return Some(cursor);
			}
			cursor = cursor.max(start + region.len);
		}
		if limit.saturating_sub(cursor) >= len { Some(cursor) } else { None }
	}

	/// Releases a region previously returned by `allocate`, unmapping and
	/// freeing whatever pages had actually been faulted in. Callers are
	/// responsible for any TLB shootdown this requires on other cores
	/// once this returns.
	pub fn free(&self, start: u64, phys: &PhysicalFrameAllocator) -> Result<()> {
		let region = self.regions.lock().remove(&start).ok_or(KernelError::NotFound)?;
		let pages = region.len / BASE_PAGE_SIZE as u64;
		for i in 0..pages {
			let vaddr = start + i * BASE_PAGE_SIZE as u64;
			if let Ok(paddr) = self.page_map.unmap(vaddr) {
				phys.free(paddr / BASE_PAGE_SIZE as u64, 1);
			}
		}
		Ok(())
	}

	/// Installs a physical page for `fault_addr`'s covering region, if
	/// any, after checking the access implied by `error_code` against
	/// the region's permissions.
	pub fn handle_page_fault(
		&self,
		fault_addr: u64,
		error_code: PageFaultErrorCode,
		phys: &PhysicalFrameAllocator,
	) -> Result<()> {
		let page = fault_addr - (fault_addr % BASE_PAGE_SIZE as u64);
		let regions = self.regions.lock();
		let (&start, region) = regions
			.range(..=page)
			.next_back()
			.filter(|(&start, r)| page < start + r.len)
			.ok_or(KernelError::NotFound)?;
		debug_assert!(start <= page);

		let write_fault = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
		if write_fault && !region.flags.contains(Flags::WRITABLE) {
			return Err(KernelError::PermissionDenied);
		}
		let instruction_fetch = error_code.contains(PageFaultErrorCode::INSTRUCTION_FETCH);
		if instruction_fetch && region.flags.contains(Flags::NO_EXECUTE) {
			return Err(KernelError::PermissionDenied);
		}

		if self.page_map.translate(page).is_some() {
			// Already resolved by a racing fault on another core.
			return Ok(());
		}
		self.page_map.map_alloc(page, region.flags, Granularity::Page4K, region.pkey, phys)?;
		Ok(())
	}

	pub fn region_count(&self) -> usize {
		self.regions.lock().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn flags() -> Flags {
		Flags::WRITABLE
	}

	#[test]
	fn find_gap_before_first_region() {
		let mut regions = BTreeMap::new();
		regions.insert(0x10_0000, Region { len: 0x1000, flags: flags(), pkey: 0 });
		let gap = UserAddressSpace::find_gap(&regions, 0, 0x1000, 0x20_0000);
		assert_eq!(gap, Some(0));
	}

	#[test]
	fn find_gap_between_regions() {
		let mut regions = BTreeMap::new();
		regions.insert(0, Region { len: 0x1000, flags: flags(), pkey: 0 });
		regions.insert(0x3000, Region { len: 0x1000, flags: flags(), pkey: 0 });
		let gap = UserAddressSpace::find_gap(&regions, 0, 0x2000, 0x10_0000);
		assert_eq!(gap, Some(0x1000));
	}

	#[test]
	fn find_gap_reports_none_past_limit() {
		let mut regions = BTreeMap::new();
		regions.insert(0, Region { len: 0xF000, flags: flags(), pkey: 0 });
		let gap = UserAddressSpace::find_gap(&regions, 0, 0x2000, 0xF000);
		assert_eq!(gap, None);
	}

	/// `allocate` always calls `find_gap` from `user_base`, so freeing an
	/// interior region makes its gap reusable by the next `allocate`
	/// ahead of virgin tail space, rather than only once the tail runs
	/// out. `allocate`/`free` themselves need a real `PageMap` (no
	/// host-backed one exists), so this drives the same bookkeeping path
	/// through the `BTreeMap` and `find_gap` directly.
	#[test]
	fn freeing_an_interior_region_makes_its_gap_reusable_ahead_of_the_tail() {
		let mut regions = BTreeMap::new();
		// allocate(0x1000) three times from an empty space.
		for start in [0u64, 0x1000, 0x2000] {
			regions.insert(start, Region { len: 0x1000, flags: flags(), pkey: 0 });
		}
		// free the middle region.
		regions.remove(&0x1000);
		// the next allocate(0x1000) must reuse the freed middle gap, not
		// extend past the tail at 0x3000.
		let gap = UserAddressSpace::find_gap(&regions, 0, 0x1000, 0x10_0000);
		assert_eq!(gap, Some(0x1000));
	}
}
