//! `PcidManager`: per-core assignment of hardware PCIDs to address
//! spaces, with clock-hand eviction once the 4096-value PCID space is
//! exhausted.
//!
//! PCIDs are scoped per logical processor by the hardware, so each core
//! owns an independent instance; there is no cross-core sharing here.

use alloc::collections::BTreeMap;

use hermit_sync::InterruptTicketMutex;

use crate::config::PCID_SLOT_COUNT;
use crate::mm::tlb;

/// Identifies a `UserAddressSpace` generation uniquely for the lifetime
/// of the kernel. Never reused, so a stale lookup can never alias a
/// different address space that happens to reuse the same id.
pub type AddressSpaceId = u64;

/// PCID 0 is reserved for contexts that don't participate in tagging
/// (the kernel's own address space during early boot, before per-process
/// PCIDs are handed out).
const FIRST_ASSIGNABLE_PCID: u16 = 1;

/// Sentinel `AddressSpaceId` naming the kernel's own `PageMap`, which
/// `get_pcid` always resolves to PCID 0 rather than handing out a real
/// slot for it.
pub const KERNEL_ASID: AddressSpaceId = 0;

struct Inner {
	/// `owners[pcid]` is the address space currently bound to that PCID,
	/// or `None` if the slot is free.
	owners: alloc::boxed::Box<[Option<AddressSpaceId>]>,
	lookup: BTreeMap<AddressSpaceId, u16>,
	clock_hand: usize,
}

impl Inner {
	fn new() -> Self {
		Self {
			owners: alloc::vec![None; PCID_SLOT_COUNT].into_boxed_slice(),
			lookup: BTreeMap::new(),
			clock_hand: FIRST_ASSIGNABLE_PCID as usize,
		}
	}

	/// Finds a slot to (re)use via a round-robin clock hand: the first
	/// free slot encountered wins; otherwise the hand wraps once and the
	/// slot it lands back on is evicted.
	fn acquire_slot(&mut self) -> (u16, Option<AddressSpaceId>) {
		let total = self.owners.len();
		for _ in 0..total {
			let candidate = self.clock_hand;
			self.clock_hand = FIRST_ASSIGNABLE_PCID as usize
				+ (self.clock_hand + 1 - FIRST_ASSIGNABLE_PCID as usize) % (total - FIRST_ASSIGNABLE_PCID as usize);
			if self.owners[candidate].is_none() {
				return (candidate as u16, None);
			}
		}
		let victim = self.clock_hand;
		self.clock_hand = FIRST_ASSIGNABLE_PCID as usize
			+ (self.clock_hand + 1 - FIRST_ASSIGNABLE_PCID as usize) % (total - FIRST_ASSIGNABLE_PCID as usize);
		(victim as u16, self.owners[victim])
	}
}

pub struct PcidManager {
	inner: InterruptTicketMutex<Inner>,
}

impl PcidManager {
	pub fn new() -> Self {
		Self { inner: InterruptTicketMutex::new(Inner::new()) }
	}

	/// Returns the PCID bound to `asid` on this core, assigning one (and
	/// evicting another address space's binding, if necessary) when it
	/// isn't already resident. The `bool` tells the caller whether the
	/// returned PCID's TLB entries must be treated as stale: `true` means
	/// either a fresh assignment or an eviction took place and the caller
	/// must load CR3 with a flush rather than the no-flush fast path.
	pub fn get_pcid(&self, asid: AddressSpaceId) -> (u16, bool) {
		if asid == KERNEL_ASID {
			// Slot 0 is permanently the kernel's and never goes through
			// the clock-hand eviction path, so the kernel's
			// own mappings can never be victimised by a process address
			// space competing for a slot.
			return (0, false);
		}
		let mut inner = self.inner.lock();
		if let Some(&pcid) = inner.lookup.get(&asid) {
			return (pcid, false);
		}
		let (pcid, evicted) = inner.acquire_slot();
		if let Some(evicted_asid) = evicted {
			inner.lookup.remove(&evicted_asid);
			tlb::flush_context(pcid);
		}
		inner.owners[pcid as usize] = Some(asid);
		inner.lookup.insert(asid, pcid);
		(pcid, true)
	}

	/// Releases `asid`'s binding, e.g. when the address space is torn
	/// down. A later `get_pcid` for the same id is treated as entirely
	/// new.
	pub fn free_pcid(&self, asid: AddressSpaceId) {
		let mut inner = self.inner.lock();
		if let Some(pcid) = inner.lookup.remove(&asid) {
			inner.owners[pcid as usize] = None;
		}
	}

	pub fn resident_count(&self) -> usize {
		self.inner.lock().lookup.len()
	}
}

impl Default for PcidManager {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn repeated_lookup_is_stable() {
		let mgr = PcidManager::new();
		let (pcid1, fresh1) = mgr.get_pcid(42);
		assert!(fresh1);
		let (pcid2, fresh2) = mgr.get_pcid(42);
		assert_eq!(pcid1, pcid2);
		assert!(!fresh2);
	}

	#[test]
	fn distinct_address_spaces_get_distinct_pcids() {
		let mgr = PcidManager::new();
		let (a, _) = mgr.get_pcid(1);
		let (b, _) = mgr.get_pcid(2);
		assert_ne!(a, b);
	}

	#[test]
	fn exhausting_the_space_forces_an_eviction() {
		let mgr = PcidManager::new();
		for asid in 0..(PCID_SLOT_COUNT as u64) {
			mgr.get_pcid(asid);
		}
		// `asid == KERNEL_ASID` (0) never takes a slot, so the remaining
		// `PCID_SLOT_COUNT - 1` address spaces exactly fill the
		// `PCID_SLOT_COUNT - 1` assignable slots (PCID 0 is reserved) with
		// no eviction yet.
		assert_eq!(mgr.resident_count(), PCID_SLOT_COUNT - 1);
		let (_, fresh) = mgr.get_pcid((PCID_SLOT_COUNT as u64) + 1);
		assert!(fresh);
		assert_eq!(mgr.resident_count(), PCID_SLOT_COUNT - 1);
	}

	#[test]
	fn freeing_drops_the_resident_count() {
		let mgr = PcidManager::new();
		mgr.get_pcid(7);
		assert_eq!(mgr.resident_count(), 1);
		mgr.free_pcid(7);
		assert_eq!(mgr.resident_count(), 0);
		let (_, fresh) = mgr.get_pcid(9);
		assert!(fresh);
		assert_eq!(mgr.resident_count(), 1);
	}
}
