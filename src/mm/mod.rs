//! Memory core: global bring-up and the shared statics every other
//! memory-facing module (paging, heap, user address spaces) reaches
//! through rather than threading arguments everywhere.

pub mod frame;
pub mod heap;
pub mod pcid;
pub mod tlb;
pub mod user_vmm;
pub mod virtualmem;

use core::sync::atomic::{AtomicU64, Ordering};

use hermit_sync::OnceCell;
use log::info;
use x86_64::structures::idt::PageFaultErrorCode;

use crate::arch::x86_64::kernel::interrupts;
use crate::arch::x86_64::mm::paging::PageMap;
use crate::boot::{BootInfo, MemoryKind};
use crate::config::BASE_PAGE_SIZE;

pub static FRAME_ALLOCATOR: frame::PhysicalFrameAllocator = frame::PhysicalFrameAllocator::uninit();
pub static KERNEL_VIRT: virtualmem::VirtualAllocator = virtualmem::VirtualAllocator::uninit();

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);
static KERNEL_PAGE_MAP: OnceCell<PageMap> = OnceCell::new();
static HEAP: OnceCell<heap::KernelHeap> = OnceCell::new();

/// Reserved for the kernel virtual arena: everything above the
/// higher-half split that isn't the direct map or the kernel image
/// itself (heap slabs, vmalloc-style mappings).
const KERNEL_ARENA_BASE: u64 = 0xFFFF_9000_0000_0000;
const KERNEL_ARENA_LEN: u64 = 0x0000_1000_0000_0000;

pub fn hhdm_offset() -> u64 {
	HHDM_OFFSET.load(Ordering::Relaxed)
}

pub fn kernel_page_map() -> &'static PageMap {
	KERNEL_PAGE_MAP.get().expect("mm::init not called")
}

pub fn heap() -> &'static heap::KernelHeap {
	HEAP.get().expect("mm::init not called")
}

/// Brings up the physical frame allocator, kernel virtual arena, the
/// kernel's own `PageMap` handle, and the heap. Runs once, on the
/// boot-strap processor, before any application processor starts.
pub fn init(boot_info: &BootInfo, core_count: usize) {
	HHDM_OFFSET.store(boot_info.hhdm_offset, Ordering::Relaxed);

	let total_bytes = boot_info.memory_map.iter().map(|e| e.end()).max().unwrap_or(0);
	let total_pages = total_bytes.div_ceil(BASE_PAGE_SIZE as u64);
	FRAME_ALLOCATOR.init(total_pages);

	for entry in &boot_info.memory_map {
		if entry.kind != MemoryKind::Usable {
			let base_pfn = entry.base / BASE_PAGE_SIZE as u64;
			let pages = entry.length.div_ceil(BASE_PAGE_SIZE as u64);
			if pages > 0 {
				FRAME_ALLOCATOR.reserve(base_pfn, pages);
			}
		}
	}

	info!(
		"physical memory: {} MiB usable out of {} MiB total",
		boot_info.usable_bytes() / (1024 * 1024),
		total_bytes / (1024 * 1024),
	);

	KERNEL_VIRT.init(KERNEL_ARENA_BASE, KERNEL_ARENA_LEN);
	KERNEL_PAGE_MAP.set(PageMap::from_frame(crate::arch::x86_64::mm::paging::current_pml4())).ok();
	HEAP.set(heap::KernelHeap::new(core_count)).ok();
}

/// Entry point for the kernel-mode `#PF` stub. User-mode faults are
/// delegated to the faulting thread's address space; anything else (a
/// fault taken while already in the kernel) has no recovery path.
pub fn handle_kernel_page_fault(fault_addr: u64, error_code: PageFaultErrorCode, rip: u64) {
	if error_code.contains(PageFaultErrorCode::USER_MODE) {
		let resolved = crate::scheduler::handle_user_page_fault(fault_addr, error_code)
			.is_some_and(|r| r.is_ok());
		if resolved {
			return;
		}
	}
	interrupts::fatal_exception(14, error_code.bits(), rip);
}
