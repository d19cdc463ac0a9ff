//! Memory, scheduling and inter-CPU coordination core of a preemptive
//! SMP x86-64 kernel.
//!
//! This crate is the load-bearing triplet of a preemptive kernel: the
//! physical/virtual memory stack (`mm`), the per-core MLFQ scheduler
//! (`scheduler`), and inter-CPU coordination (`ipi`, `synch::Mutex`).
//! Bootloader handoff, device drivers, ACPI table parsing and IPC ports
//! are out of scope collaborators this crate only reaches through the
//! narrow surfaces `boot` and `topology` describe.
#![no_std]
#![feature(abi_x86_interrupt)]
#![allow(internal_features)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod boot;
pub mod config;
pub mod error;
pub mod ipi;
pub mod logging;
pub mod mm;
pub mod scheduler;
pub mod synch;
pub mod topology;

use alloc::alloc::{GlobalAlloc, Layout};

use crate::arch::x86_64::kernel::{apic, core_local, gdt, idt, interrupts, processor};
use crate::boot::BootInfo;

/// Forwards the global allocator to the per-core `KernelHeap`,
/// resolving the calling core's identity and backing allocators
/// from the statics `mm::init` installs. Nothing in this crate calls
/// `alloc`/`Vec`/`Box` before `mm::init` has run; doing so would panic
/// through `mm::heap()`'s `expect`.
struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
	unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
		let core_idx = arch::core_id() as usize;
		match mm::heap().aligned_kalloc(
			core_idx,
			layout.size(),
			layout.align(),
			&mm::KERNEL_VIRT,
			&mm::FRAME_ALLOCATOR,
			mm::kernel_page_map(),
		) {
			Ok(addr) => addr as *mut u8,
			Err(_) => core::ptr::null_mut(),
		}
	}

	unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
		let core_idx = arch::core_id();
		let _ = mm::heap().aligned_kfree(
			core_idx,
			ptr as u64,
			layout.size(),
			layout.align(),
			&mm::KERNEL_VIRT,
			&mm::FRAME_ALLOCATOR,
			mm::kernel_page_map(),
		);
	}
}

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

/// Brings up the boot-strap processor: CPU feature detection, this
/// core's GDT/TSS/IDT, the physical/virtual memory stack and heap, the
/// scheduler, and the IPI coordinator. `idle_stack_tops[i]`/
/// `reaper_stack_tops[i]` must be core
/// `i`'s idle and reaper threads' kernel stack tops, already carved out
/// by the caller (stack allocation itself predates the heap and is this
/// crate's boot collaborator's job).
pub fn bsp_init(
	boot_info: &BootInfo,
	apic_ids: &[u32],
	bsp_apic_id: u32,
	idle_stack_tops: &[u64],
	reaper_stack_tops: &[u64],
) {
	let features = processor::detect();
	mm::tlb::set_invpcid_available(features.invpcid && cfg!(feature = "invpcid"));

	core_local::init(apic_ids, bsp_apic_id);
	let bsp_idx = apic_ids.iter().position(|&id| id == bsp_apic_id).unwrap_or(0);
	core_local::activate(bsp_idx);

	gdt::init(apic_ids.len());
	gdt::load(bsp_idx);
	idt::build();
	idt::load();

	apic::init(features.x2apic, boot_info.hhdm_offset);

	mm::init(boot_info, apic_ids.len());
	scheduler::init(apic_ids.len(), idle_stack_tops, reaper_stack_tops);
	ipi::init(apic_ids.len());

	interrupts::set_reschedule_hook(reschedule_hook);
	core_local::core_local().mark_online();
}

/// Brings up an application processor. Must run on the target core
/// itself, after `bsp_init` has completed on the boot-strap processor.
pub fn ap_init(core_idx: usize, hhdm_offset: u64) {
	let features = processor::detect();
	core_local::activate(core_idx);
	gdt::load(core_idx);
	idt::load();
	apic::init(features.x2apic, hhdm_offset);
	core_local::core_local().mark_online();
}

/// Invoked by `InterruptDispatcher::dispatch` after EOI whenever the
/// handler it just ran requested a reschedule. Kept as a
/// plain function pointer rather than a direct dependency so
/// `arch::x86_64::kernel::interrupts` does not need to know about the
/// scheduler module's types.
fn reschedule_hook() {
	let core_idx = arch::core_id() as usize;
	scheduler::scheduler().schedule(core_idx);
}
