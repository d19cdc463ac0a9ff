//! Per-CPU data block (spec.md §3, "Per-CPU data") addressed through the
//! `GS` segment base, one instance per online core, allocated once at
//! bring-up and never moved or freed.

use alloc::boxed::Box;
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use hermit_sync::OnceCell;
use x86_64::VirtAddr;
use x86_64::registers::segmentation::{GS, Segment64};

use crate::scheduler::CoreScheduler;

static CORES: OnceCell<Box<[CoreLocal]>> = OnceCell::new();

/// Everything a core needs to find without going through a lock: its own
/// identity, its scheduler, and the flags the interrupt path touches.
pub struct CoreLocal {
	pub core_idx: u32,
	pub apic_id: u32,
	pub is_bsp: bool,
	online: AtomicBool,
	kernel_stack_top: Cell<u64>,
	/// Set once by the scheduler during this core's bring-up; `None`
	/// beforehand, so code that runs before scheduling starts (early
	/// interrupt setup) never dereferences a dangling pointer.
	scheduler: Cell<*mut CoreScheduler>,
	/// Set by the timer interrupt, consumed by `InterruptDispatcher`'s
	/// return-from-interrupt path (spec.md §4.11).
	reschedule_requested: AtomicBool,
}

// `scheduler` is a raw pointer only ever read/written by the owning core;
// cross-core reads happen solely through the IPI/scheduler APIs.
unsafe impl Sync for CoreLocal {}

impl CoreLocal {
	fn new(core_idx: u32, apic_id: u32, is_bsp: bool) -> Self {
		Self {
			core_idx,
			apic_id,
			is_bsp,
			online: AtomicBool::new(false),
			kernel_stack_top: Cell::new(0),
			scheduler: Cell::new(core::ptr::null_mut()),
			reschedule_requested: AtomicBool::new(false),
		}
	}

	pub fn is_online(&self) -> bool {
		self.online.load(Ordering::Acquire)
	}

	pub fn mark_online(&self) {
		self.online.store(true, Ordering::Release);
	}

	pub fn kernel_stack_top(&self) -> u64 {
		self.kernel_stack_top.get()
	}

	pub fn set_kernel_stack_top(&self, top: u64) {
		self.kernel_stack_top.set(top);
	}

	/// # Safety
	/// `sched` must stay valid for the remaining lifetime of this core;
	/// callers pass a `'static` allocation owned by the scheduler module.
	pub unsafe fn set_scheduler(&self, sched: *mut CoreScheduler) {
		self.scheduler.set(sched);
	}

	pub fn scheduler(&self) -> &CoreScheduler {
		let ptr = self.scheduler.get();
		debug_assert!(!ptr.is_null(), "scheduler accessed before this core's bring-up completed");
		unsafe { &*ptr }
	}

	pub fn request_reschedule(&self) {
		self.reschedule_requested.store(true, Ordering::Release);
	}

	pub fn take_reschedule_request(&self) -> bool {
		self.reschedule_requested.swap(false, Ordering::AcqRel)
	}
}

/// Allocates the fixed-size, never-reallocated table of per-core blocks.
/// Called once on the boot-strap processor before any application
/// processor is started.
pub fn init(apic_ids: &[u32], bsp_apic_id: u32) {
	let cores: Box<[CoreLocal]> = apic_ids
		.iter()
		.enumerate()
		.map(|(idx, &apic_id)| CoreLocal::new(idx as u32, apic_id, apic_id == bsp_apic_id))
		.collect();
	CORES.set(cores).ok().expect("core_local::init called twice");
}

/// Points this core's `GS` base at its slot in the table. Must run once on
/// each core, including the BSP, before `core_local()` is called there.
pub fn activate(core_idx: usize) {
	let cores = CORES.get().expect("core_local::init not called");
	let slot = &cores[core_idx] as *const CoreLocal as u64;
	unsafe {
		GS::write_base(VirtAddr::new(slot));
	}
}

/// Returns the calling core's block. Panics if `activate` has not run on
/// this core (`GS` base would be zero, a reliably bogus pointer).
pub fn core_local() -> &'static CoreLocal {
	let base = GS::read_base().as_u64();
	assert_ne!(base, 0, "core_local() called before activate() on this core");
	unsafe { &*(base as *const CoreLocal) }
}

pub fn core_count() -> usize {
	CORES.get().map_or(0, |c| c.len())
}

/// Looks up another core's block by index, for code (the IPI
/// coordinator, topology-driven bring-up) that must address a specific
/// core rather than only ever reading its own.
pub fn core(idx: usize) -> &'static CoreLocal {
	&CORES.get().expect("core_local::init not called")[idx]
}

pub fn core_id() -> u32 {
	core_local().core_idx
}
