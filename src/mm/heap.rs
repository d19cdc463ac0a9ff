//! `KernelHeap`: a SLUB-style slab allocator with twelve fixed size
//! classes, a dedicated slab per core per class for the
//! lock-free fast path, and a `HeapMap` radix table recovering an
//! object's size class on `free` without a per-object header.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use alloc::boxed::Box;
use hashbrown::HashMap;
use hermit_sync::InterruptTicketMutex;
use smallvec::SmallVec;

use crate::arch::x86_64::mm::paging::{Flags, Granularity, PageMap};
use crate::config::{BASE_PAGE_SIZE, FREE_BATCH_SIZE, HEAP_SIZE_CLASSES};
use crate::error::{KernelError, Result};
use crate::mm::frame::PhysicalFrameAllocator;
use crate::mm::virtualmem::VirtualAllocator;

const NUM_CLASSES: usize = HEAP_SIZE_CLASSES.len();
/// Granularity of one `HeapMap` entry and one slab extent: large enough
/// to hold many objects of even the smallest class, small enough that a
/// sparse map over it stays cheap.
const CHUNK_SIZE: u64 = 2 * 1024 * 1024;
const RADIX_FANOUT: usize = 1024;

fn size_class_for(size: usize) -> Option<usize> {
	HEAP_SIZE_CLASSES.iter().position(|&s| s >= size)
}

#[derive(Clone, Copy)]
enum HeapMapEntry {
	/// A slab-backed object: `owner_core`'s `class`-sized free list is
	/// where it returns to.
	Small { owner_core: u32, class: u8 },
	/// An allocation too big for any size class, mapped directly by
	/// `alloc_large`. `page_count` is what `free_large` needs to unmap
	/// and release it; there is no owning core since large objects never
	/// go through the per-core slabs or their remote-free batching.
	Large { page_count: u32 },
}

/// Two-level radix keyed by `vaddr / CHUNK_SIZE`: a sparse top level
/// (most of the address space has no heap chunk at all) over a dense
/// `RADIX_FANOUT`-entry bottom level.
struct HeapMap {
	top: InterruptTicketMutex<HashMap<u64, Box<[Option<HeapMapEntry>; RADIX_FANOUT]>>>,
}

impl HeapMap {
	fn new() -> Self {
		Self { top: InterruptTicketMutex::new(HashMap::new()) }
	}

	fn insert(&self, chunk_base: u64, entry: HeapMapEntry) {
		let chunk_idx = chunk_base / CHUNK_SIZE;
		let top_idx = chunk_idx / RADIX_FANOUT as u64;
		let bottom_idx = (chunk_idx % RADIX_FANOUT as u64) as usize;
		let mut top = self.top.lock();
		let bucket = top.entry(top_idx).or_insert_with(|| Box::new([None; RADIX_FANOUT]));
		bucket[bottom_idx] = Some(entry);
	}

	fn remove(&self, chunk_base: u64) {
		let chunk_idx = chunk_base / CHUNK_SIZE;
		let top_idx = chunk_idx / RADIX_FANOUT as u64;
		let bottom_idx = (chunk_idx % RADIX_FANOUT as u64) as usize;
		if let Some(bucket) = self.top.lock().get_mut(&top_idx) {
			bucket[bottom_idx] = None;
		}
	}

	fn lookup(&self, vaddr: u64) -> Option<HeapMapEntry> {
		let chunk_idx = vaddr / CHUNK_SIZE;
		let top_idx = chunk_idx / RADIX_FANOUT as u64;
		let bottom_idx = (chunk_idx % RADIX_FANOUT as u64) as usize;
		let top = self.top.lock();
		top.get(&top_idx)?[bottom_idx]
	}
}

/// One size class's state on one core. `slab_base`/`bump`/`capacity` are
/// only ever touched by the owning core (the allocation fast path), so
/// they need no synchronization; `free_head` is a Treiber stack because
/// a free from a different core must be able to push onto it
/// concurrently with the owner popping from it.
struct CoreClassState {
	slab_base: core::cell::Cell<u64>,
	bump: core::cell::Cell<u32>,
	capacity: core::cell::Cell<u32>,
	free_head: AtomicU64,
	free_count: AtomicU32,
}

unsafe impl Sync for CoreClassState {}

impl CoreClassState {
	fn empty() -> Self {
		Self {
			slab_base: core::cell::Cell::new(0),
			bump: core::cell::Cell::new(0),
			capacity: core::cell::Cell::new(0),
			free_head: AtomicU64::new(0),
			free_count: AtomicU32::new(0),
		}
	}

	fn pop_free(&self) -> Option<u64> {
		loop {
			let head = self.free_head.load(Ordering::Acquire);
			if head == 0 {
				return None;
			}
			let next = unsafe { core::ptr::read(head as *const u64) };
			if self
				.free_head
				.compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				self.free_count.fetch_sub(1, Ordering::AcqRel);
				return Some(head);
			}
		}
	}

	fn push_free(&self, addr: u64) {
		loop {
			let head = self.free_head.load(Ordering::Acquire);
			unsafe { core::ptr::write(addr as *mut u64, head) };
			if self
				.free_head
				.compare_exchange(head, addr, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				self.free_count.fetch_add(1, Ordering::AcqRel);
				return;
			}
		}
	}
}

/// A pending remote free: an object whose owning core differs from the
/// one that called `free`. Buffered locally and flushed once full, so a
/// burst of remote frees costs one push each instead of one CAS storm
/// against cores that may be far away in the topology.
#[derive(Clone, Copy)]
struct PendingRemoteFree {
	owner_core: u32,
	class: u8,
	addr: u64,
}

pub struct KernelHeap {
	heap_map: HeapMap,
	per_core: Box<[[CoreClassState; NUM_CLASSES]]>,
	remote_batch: Box<[InterruptTicketMutex<SmallVec<[PendingRemoteFree; FREE_BATCH_SIZE]>>]>,
}

impl KernelHeap {
	pub fn new(core_count: usize) -> Self {
		let per_core = (0..core_count)
			.map(|_| core::array::from_fn(|_| CoreClassState::empty()))
			.collect();
		let remote_batch =
			(0..core_count).map(|_| InterruptTicketMutex::new(SmallVec::new())).collect();
		Self { heap_map: HeapMap::new(), per_core, remote_batch }
	}

	/// Allocates a heap object at least `size` bytes, aligned to `align`
	/// (a power of two). When `align` fits within the chosen size
	/// class's natural alignment, the slab's own layout already satisfies
	/// it for free; a stricter request falls back to
	/// `alloc_overaligned`'s reserve-and-stash scheme.
	pub fn aligned_kalloc(
		&self,
		core_idx: usize,
		size: usize,
		align: usize,
		virt: &VirtualAllocator,
		phys: &PhysicalFrameAllocator,
		page_map: &PageMap,
	) -> Result<u64> {
		if align == 0 || !align.is_power_of_two() {
			return Err(KernelError::InvalidArgument);
		}
		let Some(class) = size_class_for(size) else {
			return self.alloc_large(size, align, virt, phys, page_map);
		};
		if align > HEAP_SIZE_CLASSES[class] {
			return self.alloc_overaligned(core_idx, size, align, virt, phys, page_map);
		}
		self.alloc_class(core_idx, class, virt, phys, page_map)
	}

	/// Hands out the next free object of `class` on `core_idx`, refilling
	/// the slab first if its local free list and bump region are both
	/// exhausted.
	fn alloc_class(
		&self,
		core_idx: usize,
		class: usize,
		virt: &VirtualAllocator,
		phys: &PhysicalFrameAllocator,
		page_map: &PageMap,
	) -> Result<u64> {
		let state = &self.per_core[core_idx][class];
		if let Some(addr) = state.pop_free() {
			return Ok(addr);
		}
		if state.bump.get() >= state.capacity.get() {
			self.refill(core_idx, class, virt, phys, page_map)?;
		}
		let idx = state.bump.get();
		state.bump.set(idx + 1);
		Ok(state.slab_base.get() + u64::from(idx) * HEAP_SIZE_CLASSES[class] as u64)
	}

	/// Satisfies an alignment stricter than any size class's natural
	/// alignment by reserving `size + align + size_of::<u64>()` bytes
	/// through the plain allocator and handing back an aligned address
	/// inside the reservation, with the reservation's true address
	/// stashed in the `u64` immediately before it. `aligned_kfree` reads
	/// that stash to recover the pointer the allocator actually needs
	/// freed (spec.md §4.6; ported from `kernel/src/memory/heap.cpp`'s
	/// `aligned_kalloc`/`aligned_kfree`).
	fn alloc_overaligned(
		&self,
		core_idx: usize,
		size: usize,
		align: usize,
		virt: &VirtualAllocator,
		phys: &PhysicalFrameAllocator,
		page_map: &PageMap,
	) -> Result<u64> {
		const STASH: u64 = core::mem::size_of::<u64>() as u64;
		let overhead = (align as u64).checked_add(STASH).ok_or(KernelError::InvalidArgument)?;
		let reserved = (size as u64).checked_add(overhead).ok_or(KernelError::InvalidArgument)?;
		let reserved = reserved as usize;

		let raw = match size_class_for(reserved) {
			Some(class) => self.alloc_class(core_idx, class, virt, phys, page_map)?,
			None => self.alloc_large(reserved, 1, virt, phys, page_map)?,
		};

		let aligned = (raw + STASH).next_multiple_of(align as u64);
		unsafe {
			core::ptr::write((aligned - STASH) as *mut u64, raw);
		}
		Ok(aligned)
	}

	pub fn kalloc(
		&self,
		core_idx: usize,
		size: usize,
		virt: &VirtualAllocator,
		phys: &PhysicalFrameAllocator,
		page_map: &PageMap,
	) -> Result<u64> {
		self.aligned_kalloc(core_idx, size, 1, virt, phys, page_map)
	}

	fn refill(
		&self,
		core_idx: usize,
		class: usize,
		virt: &VirtualAllocator,
		phys: &PhysicalFrameAllocator,
		page_map: &PageMap,
	) -> Result<()> {
		let base = virt.alloc(CHUNK_SIZE, CHUNK_SIZE)?;
		let pages = CHUNK_SIZE / 0x1000;
		page_map.map_range(
			base,
			{
				let first_pfn = phys.alloc(pages)?;
				first_pfn * 0x1000
			},
			pages,
			Flags::WRITABLE,
			Granularity::Page4K,
			0,
			phys,
		)?;
		self.heap_map.insert(base, HeapMapEntry::Small { owner_core: core_idx as u32, class: class as u8 });
		let state = &self.per_core[core_idx][class];
		state.slab_base.set(base);
		state.bump.set(0);
		state.capacity.set((CHUNK_SIZE / HEAP_SIZE_CLASSES[class] as u64) as u32);
		Ok(())
	}

	/// Allocations too big for any size class fall back to direct page
	/// allocation: a fresh, exactly-
	/// sized virtual region mapped page by page, registered in the
	/// `HeapMap` as `Large` rather than slotted into a per-core slab.
	fn alloc_large(
		&self,
		size: usize,
		align: usize,
		virt: &VirtualAllocator,
		phys: &PhysicalFrameAllocator,
		page_map: &PageMap,
	) -> Result<u64> {
		if align == 0 || !align.is_power_of_two() {
			return Err(KernelError::InvalidArgument);
		}
		let page_count = size.div_ceil(BASE_PAGE_SIZE) as u64;
		let bytes = page_count * BASE_PAGE_SIZE as u64;
		let base = virt.alloc(bytes, align.max(BASE_PAGE_SIZE) as u64)?;
		let first_pfn = phys.alloc(page_count)?;
		if let Err(err) = page_map.map_range(
			base,
			first_pfn * BASE_PAGE_SIZE as u64,
			page_count,
			Flags::WRITABLE,
			Granularity::Page4K,
			0,
			phys,
		) {
			phys.free(first_pfn, page_count);
			virt.free(base, bytes)?;
			return Err(err);
		}
		self.heap_map.insert(base, HeapMapEntry::Large { page_count: page_count as u32 });
		Ok(base)
	}

	fn free_large(
		&self,
		addr: u64,
		page_count: u32,
		virt: &VirtualAllocator,
		phys: &PhysicalFrameAllocator,
		page_map: &PageMap,
	) -> Result<()> {
		for page in 0..u64::from(page_count) {
			let vaddr = addr + page * BASE_PAGE_SIZE as u64;
			let pfn = page_map.unmap(vaddr)? / BASE_PAGE_SIZE as u64;
			phys.free(pfn, 1);
		}
		self.heap_map.remove(addr);
		virt.free(addr, u64::from(page_count) * BASE_PAGE_SIZE as u64)
	}

	/// Frees an object previously returned by `aligned_kalloc`/`kalloc`.
	/// `current_core` is the core performing the free, which may differ
	/// from the object's owning core. `size`/`align` must be the same pair
	/// passed to the matching `aligned_kalloc` call (`GlobalAlloc::dealloc`
	/// gets these from its `Layout`, same as `alloc` did) — they decide
	/// whether `addr` is a raw slab address or an over-aligned address
	/// whose true pointer must first be recovered from its stash.
	/// `virt`/`phys`/`page_map` are only touched by the large-object path;
	/// small frees never leave the per-core slabs.
	pub fn aligned_kfree(
		&self,
		current_core: u32,
		addr: u64,
		size: usize,
		align: usize,
		virt: &VirtualAllocator,
		phys: &PhysicalFrameAllocator,
		page_map: &PageMap,
	) -> Result<()> {
		let over_aligned = size_class_for(size).is_some_and(|class| align > HEAP_SIZE_CLASSES[class]);
		let raw = if over_aligned {
			const STASH: u64 = core::mem::size_of::<u64>() as u64;
			unsafe { core::ptr::read((addr - STASH) as *const u64) }
		} else {
			addr
		};
		self.free_raw(current_core, raw, virt, phys, page_map)
	}

	/// Frees a raw slab/large address, i.e. exactly what `alloc_class`/
	/// `alloc_large` handed back before any over-alignment stashing.
	fn free_raw(
		&self,
		current_core: u32,
		addr: u64,
		virt: &VirtualAllocator,
		phys: &PhysicalFrameAllocator,
		page_map: &PageMap,
	) -> Result<()> {
		let entry = self.heap_map.lookup(addr).ok_or(KernelError::NotFound)?;
		let (owner_core, class) = match entry {
			HeapMapEntry::Small { owner_core, class } => (owner_core, class),
			HeapMapEntry::Large { page_count } => return self.free_large(addr, page_count, virt, phys, page_map),
		};
		if owner_core == current_core {
			self.per_core[current_core as usize][class as usize].push_free(addr);
			return Ok(());
		}

		let mut batch = self.remote_batch[current_core as usize].lock();
		batch.push(PendingRemoteFree { owner_core, class, addr });
		if batch.len() == FREE_BATCH_SIZE {
			for pending in batch.drain(..) {
				self.per_core[pending.owner_core as usize][pending.class as usize]
					.push_free(pending.addr);
			}
		}
		Ok(())
	}

	/// Flushes this core's outgoing remote-free batch regardless of
	/// whether it is full. Called from the idle loop so a quiet core's
	/// frees don't wait indefinitely for the batch to fill.
	pub fn flush_remote_batch(&self, current_core: u32) {
		let mut batch = self.remote_batch[current_core as usize].lock();
		for pending in batch.drain(..) {
			self.per_core[pending.owner_core as usize][pending.class as usize]
				.push_free(pending.addr);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn size_class_rounds_up() {
		assert_eq!(size_class_for(1), Some(0));
		assert_eq!(size_class_for(16), Some(0));
		assert_eq!(size_class_for(17), Some(1));
		assert_eq!(size_class_for(32768), Some(11));
		assert_eq!(size_class_for(32769), None);
	}

	#[test]
	fn heap_map_round_trips() {
		let map = HeapMap::new();
		map.insert(0x4000_0000, HeapMapEntry::Small { owner_core: 3, class: 5 });
		let entry = map.lookup(0x4000_0010).unwrap();
		match entry {
			HeapMapEntry::Small { owner_core, class } => {
				assert_eq!(owner_core, 3);
				assert_eq!(class, 5);
			}
			HeapMapEntry::Large { .. } => panic!("expected Small entry"),
		}
		assert!(map.lookup(0x5000_0000).is_none());
	}

	#[test]
	fn treiber_stack_pushes_and_pops_in_lifo_order() {
		let state = CoreClassState::empty();
		let mut backing = [0u64; 3];
		let addrs: alloc::vec::Vec<u64> =
			backing.iter_mut().map(|slot| slot as *mut u64 as u64).collect();
		for &a in &addrs {
			state.push_free(a);
		}
		assert_eq!(state.pop_free(), Some(addrs[2]));
		assert_eq!(state.pop_free(), Some(addrs[1]));
		assert_eq!(state.pop_free(), Some(addrs[0]));
		assert_eq!(state.pop_free(), None);
	}
}
