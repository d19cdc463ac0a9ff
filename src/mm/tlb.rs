//! `TlbOps`: the local-core TLB invalidation primitives `PcidManager`
//! and `IpiCoordinator` build shootdowns out of.
//!
//! Every operation here only affects the calling core's TLB; reaching
//! other cores is `IpiCoordinator`'s job.

use log::debug;
use x86_64::registers::control::{Cr3, Cr4, Cr4Flags};
use x86_64::VirtAddr;

use crate::arch::x86_64::kernel::processor::{self, InvpcidKind};

/// Caches whether this CPU model supports `INVPCID`, set once during
/// bring-up. Defaults to `false` so early boot code that runs before
/// `set_invpcid_available` always takes the safe, full-flush path.
static INVPCID_AVAILABLE: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

pub fn set_invpcid_available(available: bool) {
	INVPCID_AVAILABLE.store(available, core::sync::atomic::Ordering::Release);
}

fn invpcid_available() -> bool {
	INVPCID_AVAILABLE.load(core::sync::atomic::Ordering::Acquire)
}

fn current_pcid() -> u16 {
	let (_, flags) = Cr3::read_raw();
	(flags & 0xFFF) as u16
}

/// Invalidates a single virtual address in the currently-loaded context.
pub fn flush_one(vaddr: u64) {
	x86_64::instructions::tlb::flush(VirtAddr::new(vaddr));
}

/// Invalidates a single virtual address within `pcid`'s context, which
/// may not be the one currently loaded.
///
/// Decision recorded in the design notes: when `INVPCID` is unavailable
/// and `pcid` is not the current context, there is no way to target it
/// selectively, so this falls back to a full flush (`flush_hard`) and
/// logs the fallback at debug level rather than silently over-flushing.
pub fn flush_specific(vaddr: u64, pcid: u16) {
	if pcid == current_pcid() {
		flush_one(vaddr);
		return;
	}
	if invpcid_available() {
		unsafe { processor::invpcid(InvpcidKind::SingleAddress { pcid, addr: vaddr }) };
		return;
	}
	debug!("flush_specific({vaddr:#x}, pcid={pcid}) without INVPCID: falling back to a full flush");
	flush_hard();
}

/// Invalidates every entry tagged with `pcid`.
pub fn flush_context(pcid: u16) {
	if invpcid_available() {
		unsafe { processor::invpcid(InvpcidKind::SingleContext { pcid }) };
		return;
	}
	if pcid == current_pcid() {
		// A CR3 write without the no-flush bit always flushes the TLB for
		// the loaded context, so reloading the same frame/PCID is enough.
		let (frame, raw_flags) = Cr3::read_raw();
		Cr3::write(frame, x86_64::registers::control::Cr3Flags::from_bits_truncate(raw_flags));
		return;
	}
	debug!("flush_context(pcid={pcid}) without INVPCID: falling back to a full flush");
	flush_hard();
}

/// Invalidates every non-global entry across every context. A plain CR3
/// reload (no PCID no-flush bit) does exactly this per the architecture:
/// it invalidates all non-global translations, leaving global entries
/// untouched — unlike toggling `CR4.PGE`, which flushes global entries
/// too and is reserved for `flush_hard` below.
pub fn flush_all_retain_global() {
	if invpcid_available() {
		unsafe { processor::invpcid(InvpcidKind::AllContextsExceptGlobal) };
		return;
	}
	let (frame, raw_flags) = Cr3::read_raw();
	Cr3::write(frame, x86_64::registers::control::Cr3Flags::from_bits_truncate(raw_flags));
}

/// Invalidates every entry, global or not, across every context.
pub fn flush_hard() {
	if invpcid_available() {
		unsafe { processor::invpcid(InvpcidKind::AllContextsIncludingGlobal) };
		return;
	}
	let flags = Cr4::read();
	unsafe {
		Cr4::write(flags - Cr4Flags::PAGE_GLOBAL);
		Cr4::write(flags);
	}
	let (frame, cr3_flags) = Cr3::read_raw();
	Cr3::write(frame, x86_64::registers::control::Cr3Flags::from_bits_truncate(cr3_flags));
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fallback_flag_defaults_to_unavailable() {
		assert!(!invpcid_available());
	}

	#[test]
	fn toggling_is_idempotent_on_the_flag() {
		set_invpcid_available(true);
		assert!(invpcid_available());
		set_invpcid_available(false);
		assert!(!invpcid_available());
	}
}
