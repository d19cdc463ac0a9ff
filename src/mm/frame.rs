//! Physical frame allocator: bitmap + summary bitmap + per-CPU stack
//! cache.

use alloc::vec;
use alloc::vec::Vec;

use hermit_sync::InterruptTicketMutex;

use crate::config::{BASE_PAGE_SIZE, FRAME_STACK_CACHE_SIZE};
use crate::error::{KernelError, Result};

/// Physical page-frame number.
pub type Pfn = u64;

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
	pub total: u64,
	pub used: u64,
	pub free: u64,
}

struct Bitmap {
	/// One bit per page; 1 == allocated.
	words: Vec<u64>,
	/// One bit per 64-page word of `words`; 1 == that word is all-ones.
	summary: Vec<u64>,
	total_pages: u64,
}

impl Bitmap {
	fn new(total_pages: u64) -> Self {
		let word_count = total_pages.div_ceil(64) as usize;
		let summary_count = (word_count as u64).div_ceil(64) as usize;
		Self {
			words: vec![0; word_count],
			summary: vec![0; summary_count],
			total_pages,
		}
	}

	#[inline]
	fn is_allocated(&self, pfn: Pfn) -> bool {
		let word = (pfn / 64) as usize;
		let bit = pfn % 64;
		self.words[word] & (1 << bit) != 0
	}

	fn set(&mut self, pfn: Pfn) {
		let word = (pfn / 64) as usize;
		let bit = pfn % 64;
		self.words[word] |= 1 << bit;
		self.update_summary(word);
	}

	fn clear(&mut self, pfn: Pfn) {
		let word = (pfn / 64) as usize;
		let bit = pfn % 64;
		self.words[word] &= !(1 << bit);
		self.update_summary(word);
	}

	fn update_summary(&mut self, word: usize) {
		let summary_word = word / 64;
		let summary_bit = word % 64;
		if self.words[word] == u64::MAX {
			self.summary[summary_word] |= 1 << summary_bit;
		} else {
			self.summary[summary_word] &= !(1 << summary_bit);
		}
	}

	fn word_is_full(&self, word: usize) -> bool {
		let summary_word = word / 64;
		let summary_bit = word % 64;
		self.summary[summary_word] & (1 << summary_bit) != 0
	}

	fn word_count(&self) -> usize {
		self.words.len()
	}

	/// Finds the lowest free bit in `word`, if any, scanning forward from
	/// `word_hint`'s word with wraparound. `None` once every word has
	/// been tried.
	fn first_free_from(&self, word_hint: usize) -> Option<Pfn> {
		let n = self.word_count();
		for i in 0..n {
			let word = (word_hint + i) % n;
			if self.word_is_full(word) {
				continue;
			}
			let free_mask = !self.words[word];
			if free_mask == 0 {
				continue;
			}
			let bit = free_mask.trailing_zeros() as u64;
			let pfn = word as u64 * 64 + bit;
			if pfn < self.total_pages {
				return Some(pfn);
			}
		}
		None
	}

	/// Finds the first allocated page in `[start, start+len)`, or `None`
	/// if the whole range is free. Skips whole summary-full words.
	fn first_allocated_in(&self, start: Pfn, len: u64) -> Option<Pfn> {
		let end = start + len;
		let mut pfn = start;
		while pfn < end {
			let word = (pfn / 64) as usize;
			if pfn % 64 == 0 && word < self.word_count() && self.word_is_full(word) {
				// whole aligned word is allocated
				let skip_to = (word as u64 + 1) * 64;
				if skip_to <= pfn {
					pfn += 1;
				} else {
					return Some(pfn.max(start));
				}
				continue;
			}
			if self.is_allocated(pfn) {
				return Some(pfn);
			}
			pfn += 1;
		}
		None
	}
}

struct Inner {
	bitmap: Bitmap,
	/// Cache of freed single frames, avoiding a bitmap round-trip for the
	/// common alloc-one/free-one pattern.
	cache: Vec<Pfn>,
	/// Rotating word index consulted first by single-frame allocation.
	hint_word: usize,
	total_pages: u64,
	used: u64,
}

impl Inner {
	fn new(total_pages: u64) -> Self {
		Self {
			bitmap: Bitmap::new(total_pages),
			cache: Vec::with_capacity(FRAME_STACK_CACHE_SIZE),
			hint_word: 0,
			total_pages,
			used: 0,
		}
	}

	fn stats(&self) -> FrameStats {
		FrameStats {
			total: self.total_pages,
			used: self.used,
			free: self.total_pages - self.used,
		}
	}

	fn alloc_one(&mut self) -> Result<Pfn> {
		if let Some(pfn) = self.cache.pop() {
			self.used += 1;
			return Ok(pfn);
		}
		let pfn = self
			.bitmap
			.first_free_from(self.hint_word)
			.ok_or(KernelError::OutOfMemory)?;
		self.bitmap.set(pfn);
		self.hint_word = (pfn / 64) as usize;
		self.used += 1;
		Ok(pfn)
	}

	/// Contiguous run of `n` frames, the start aligned to `align_frames`
	/// (a power of two). Two-pass scan from the hint to the end, then
	/// from the beginning to the hint.
	fn alloc_run(&mut self, n: u64, align_frames: u64) -> Result<Pfn> {
		let hint_pfn = self.hint_word as u64 * 64;
		if let Some(pfn) = self.scan_run(hint_pfn, self.total_pages, n, align_frames) {
			self.commit_run(pfn, n);
			return Ok(pfn);
		}
		if let Some(pfn) = self.scan_run(0, hint_pfn, n, align_frames) {
			self.commit_run(pfn, n);
			return Ok(pfn);
		}
		Err(KernelError::OutOfMemory)
	}

	fn scan_run(&self, from: Pfn, to: Pfn, n: u64, align_frames: u64) -> Option<Pfn> {
		let mut start = from.next_multiple_of(align_frames);
		while start + n <= to && start + n <= self.total_pages {
			match self.bitmap.first_allocated_in(start, n) {
				None => return Some(start),
				Some(blocker) => {
					start = (blocker + 1).next_multiple_of(align_frames);
				}
			}
		}
		None
	}

	fn commit_run(&mut self, start: Pfn, n: u64) {
		for pfn in start..start + n {
			self.bitmap.set(pfn);
		}
		self.hint_word = ((start + n) / 64) as usize;
		self.used += n;
	}

	fn free_one(&mut self, pfn: Pfn) {
		if self.cache.len() < FRAME_STACK_CACHE_SIZE {
			self.cache.push(pfn);
			self.used -= 1;
			return;
		}
		// Cache full: flush half of it back to the bitmap, then cache
		// the newly freed frame. Flushing must decrement `used` exactly
		// once per frame to preserve `used == total - free_bits - cache`.
		let flush_count = self.cache.len() / 2;
		for _ in 0..flush_count {
			let cached = self.cache.remove(0);
			self.bitmap.clear(cached);
			if (cached / 64) as usize < self.hint_word {
				self.hint_word = (cached / 64) as usize;
			}
		}
		self.cache.push(pfn);
		self.used -= 1;
	}

	fn free_run(&mut self, start: Pfn, n: u64) {
		for pfn in start..start + n {
			self.bitmap.clear(pfn);
		}
		if (start / 64) as usize < self.hint_word {
			self.hint_word = (start / 64) as usize;
		}
		self.used -= n;
	}
}

/// Serializes every operation behind one lock: the physical allocator
/// is deliberately not lock-free, trading peak multi-core allocation
/// throughput for a much smaller correctness surface.
pub struct PhysicalFrameAllocator {
	inner: InterruptTicketMutex<Inner>,
}

impl PhysicalFrameAllocator {
	pub const fn uninit() -> Self {
		Self {
			inner: InterruptTicketMutex::new(Inner {
				bitmap: Bitmap { words: Vec::new(), summary: Vec::new(), total_pages: 0 },
				cache: Vec::new(),
				hint_word: 0,
				total_pages: 0,
				used: 0,
			}),
		}
	}

	/// Replaces the allocator's backing storage. Called once during
	/// bring-up with the total page count derived from the bootloader's
	/// memory map.
	pub fn init(&self, total_pages: u64) {
		*self.inner.lock() = Inner::new(total_pages);
	}

	/// Marks `[pfn, pfn+n)` as already allocated, e.g. for the kernel
	/// image or reserved ACPI regions discovered by the caller before any
	/// `alloc` call is made.
	pub fn reserve(&self, pfn: Pfn, n: u64) {
		let mut inner = self.inner.lock();
		for p in pfn..pfn + n {
			inner.bitmap.set(p);
		}
		inner.used += n;
	}

	pub fn alloc(&self, n: u64) -> Result<Pfn> {
		if n == 0 {
			return Err(KernelError::InvalidArgument);
		}
		let mut inner = self.inner.lock();
		if n == 1 {
			inner.alloc_one()
		} else {
			inner.alloc_run(n, 1)
		}
	}

	pub fn alloc_aligned(&self, n: u64, align: u64) -> Result<Pfn> {
		if n == 0 || align == 0 || !align.is_power_of_two() {
			return Err(KernelError::InvalidArgument);
		}
		let align_frames = align.div_ceil(BASE_PAGE_SIZE as u64).max(1);
		self.inner.lock().alloc_run(n, align_frames)
	}

	/// Allocates and zeroes the frames via `zero_frame`, a caller-supplied
	/// closure that writes zeroes through the direct map (this module has
	/// no notion of virtual addresses).
	pub fn alloc_clear(&self, n: u64, mut zero_frame: impl FnMut(Pfn)) -> Result<Pfn> {
		let pfn = self.alloc(n)?;
		for p in pfn..pfn + n {
			zero_frame(p);
		}
		Ok(pfn)
	}

	pub fn free(&self, pfn: Pfn, n: u64) {
		debug_assert!(n > 0);
		let mut inner = self.inner.lock();
		if n == 1 {
			inner.free_one(pfn);
		} else {
			inner.free_run(pfn, n);
		}
	}

	pub fn stats(&self) -> FrameStats {
		self.inner.lock().stats()
	}
}

unsafe impl Sync for PhysicalFrameAllocator {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trip_scenario() {
		let alloc = PhysicalFrameAllocator::uninit();
		alloc.init(16);

		let pfn = alloc.alloc_aligned(3, 4 * BASE_PAGE_SIZE as u64).unwrap();
		assert_eq!(pfn, 4);

		alloc.free(4, 3);

		let mut singles = Vec::new();
		for _ in 0..3 {
			singles.push(alloc.alloc(1).unwrap());
		}
		singles.sort_unstable();
		assert_eq!(singles, vec![0, 1, 2]);
		assert_eq!(alloc.stats().used, 3);
	}

	#[test]
	fn used_plus_free_always_equals_total() {
		let alloc = PhysicalFrameAllocator::uninit();
		alloc.init(64);
		let mut held = Vec::new();
		for _ in 0..20 {
			held.push(alloc.alloc(1).unwrap());
		}
		let stats = alloc.stats();
		assert_eq!(stats.used + stats.free, stats.total);
		for pfn in held.drain(..10) {
			alloc.free(pfn, 1);
		}
		let stats = alloc.stats();
		assert_eq!(stats.used + stats.free, stats.total);
		assert_eq!(stats.used, 10);
	}

	#[test]
	fn allocations_never_overlap() {
		let alloc = PhysicalFrameAllocator::uninit();
		alloc.init(256);
		let mut ranges = Vec::new();
		for _ in 0..10 {
			ranges.push((alloc.alloc(4).unwrap(), 4u64));
		}
		for i in 0..ranges.len() {
			for j in (i + 1)..ranges.len() {
				let (a_start, a_len) = ranges[i];
				let (b_start, b_len) = ranges[j];
				let disjoint = a_start + a_len <= b_start || b_start + b_len <= a_start;
				assert!(disjoint, "ranges {:?} and {:?} overlap", ranges[i], ranges[j]);
			}
		}
	}

	#[test]
	fn zero_count_is_invalid() {
		let alloc = PhysicalFrameAllocator::uninit();
		alloc.init(16);
		assert_eq!(alloc.alloc(0), Err(KernelError::InvalidArgument));
	}

	#[test]
	fn misaligned_alignment_is_invalid() {
		let alloc = PhysicalFrameAllocator::uninit();
		alloc.init(16);
		assert_eq!(
			alloc.alloc_aligned(1, 3 * BASE_PAGE_SIZE as u64),
			Err(KernelError::InvalidArgument)
		);
	}

	#[test]
	fn stack_cache_flush_preserves_accounting() {
		let alloc = PhysicalFrameAllocator::uninit();
		alloc.init(2048);
		let mut held = Vec::new();
		for _ in 0..(crate::config::FRAME_STACK_CACHE_SIZE + 50) {
			held.push(alloc.alloc(1).unwrap());
		}
		let before = alloc.stats();
		for pfn in held.drain(..) {
			alloc.free(pfn, 1);
		}
		let after = alloc.stats();
		assert_eq!(after.used, 0);
		assert_eq!(before.used + before.free, before.total);
		assert_eq!(after.used + after.free, after.total);
	}

	#[test]
	fn exhaustion_reports_out_of_memory() {
		let alloc = PhysicalFrameAllocator::uninit();
		alloc.init(4);
		alloc.alloc(4).unwrap();
		assert_eq!(alloc.alloc(1), Err(KernelError::OutOfMemory));
	}
}
