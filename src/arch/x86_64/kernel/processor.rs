//! CPUID-derived feature detection and the handful of privileged
//! instructions the memory and scheduling cores need directly (spec.md
//! §4.2 "NX", §4.4 "PCID/INVPCID", §4.8 idle loop).

use core::arch::asm;

use raw_cpuid::CpuId;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
	pub pcid: bool,
	pub invpcid: bool,
	pub nx: bool,
	pub gbpages: bool,
	pub x2apic: bool,
	pub apic: bool,
}

/// Reads CPUID once. The boot-strap processor calls this during bring-up
/// and the result is shared read-only by every application processor,
/// since CPUID feature bits do not vary across cores on any supported
/// platform.
pub fn detect() -> Features {
	let cpuid = CpuId::new();
	let features = cpuid.get_feature_info();
	let extended = cpuid.get_extended_processor_and_feature_identifiers();
	let extended_features = cpuid.get_extended_feature_info();

	Features {
		pcid: features.as_ref().is_some_and(|f| f.has_pcid()),
		invpcid: extended_features.as_ref().is_some_and(|f| f.has_invpcid()),
		nx: extended.as_ref().is_some_and(|f| f.has_execute_disable()),
		gbpages: extended.as_ref().is_some_and(|f| f.has_1gib_pages()),
		x2apic: features.as_ref().is_some_and(|f| f.has_x2apic()),
		apic: features.as_ref().is_some_and(|f| f.has_apic()),
	}
}

#[inline]
pub fn halt() {
	x86_64::instructions::hlt();
}

#[inline]
pub fn pause() {
	core::hint::spin_loop();
}

#[inline]
pub fn enable_interrupts() {
	x86_64::instructions::interrupts::enable();
}

#[inline]
pub fn disable_interrupts() {
	x86_64::instructions::interrupts::disable();
}

#[inline]
pub fn interrupts_enabled() -> bool {
	x86_64::instructions::interrupts::are_enabled()
}

/// Reads CR3 as `(physical_frame, pcid)`, matching the bit layout used
/// when PCID is enabled (spec.md §4.4).
pub fn read_cr3_pcid() -> (PhysAddr, u16) {
	let (frame, flags) = Cr3::read_raw();
	let pcid = flags & 0xFFF;
	(frame.start_address(), pcid as u16)
}

/// Loads CR3 with an explicit PCID and the no-flush bit, per the fast
/// context-switch path described in spec.md §4.4. Callers are responsible
/// for knowing the PCID's generation is still valid; this function only
/// performs the write.
///
/// # Safety
/// The frame must contain a valid, fully-built top-level page table for
/// the target address space.
pub unsafe fn load_cr3_no_flush(frame: PhysFrame, pcid: u16) {
	const NO_FLUSH_BIT: u64 = 1 << 63;
	let value = frame.start_address().as_u64() | u64::from(pcid) | NO_FLUSH_BIT;
	unsafe {
		asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
	}
}

/// Loads CR3 performing a full TLB flush (used when the target PCID's
/// generation does not match, or PCID support is absent).
///
/// Deliberately does not go through `Cr3::write`: that call's `Cr3Flags`
/// only models the non-PCID CR3 format's `PWT`/`PCD` bits (3 and 4), so
/// passing a PCID through it would silently drop whichever of its low
/// bits fall outside that mask instead of writing them.
///
/// # Safety
/// The frame must contain a valid, fully-built top-level page table for
/// the target address space.
pub unsafe fn load_cr3_flush(frame: PhysFrame, pcid: u16) {
	let value = frame.start_address().as_u64() | u64::from(pcid);
	unsafe {
		asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
	}
}

/// `INVPCID` descriptor types (Intel SDM Vol. 3A, 4.10.4.1).
#[derive(Debug, Clone, Copy)]
pub enum InvpcidKind {
	SingleAddress { pcid: u16, addr: u64 },
	SingleContext { pcid: u16 },
	AllContextsIncludingGlobal,
	AllContextsExceptGlobal,
}

/// # Safety
/// The caller must have confirmed `Features::invpcid` is set.
pub unsafe fn invpcid(kind: InvpcidKind) {
	let (ty, pcid, addr): (u64, u64, u64) = match kind {
		InvpcidKind::SingleAddress { pcid, addr } => (0, u64::from(pcid), addr),
		InvpcidKind::SingleContext { pcid } => (1, u64::from(pcid), 0),
		InvpcidKind::AllContextsIncludingGlobal => (2, 0, 0),
		InvpcidKind::AllContextsExceptGlobal => (3, 0, 0),
	};
	#[repr(C, align(16))]
	struct Descriptor {
		pcid: u64,
		addr: u64,
	}
	let descriptor = Descriptor { pcid, addr };
	unsafe {
		asm!(
			"invpcid {ty}, [{desc}]",
			ty = in(reg) ty,
			desc = in(reg) &descriptor,
			options(nostack),
		);
	}
}
