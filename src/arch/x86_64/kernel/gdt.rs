//! Per-core GDT and TSS. Each core owns its own table so the double-fault
//! and NMI stacks in its TSS are never shared across cores.

use hermit_sync::OnceCell;
use x86_64::VirtAddr;
use x86_64::instructions::segmentation::{CS, Segment};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;

use crate::config::MAX_CPUS;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const STACK_SIZE: usize = 4096 * 5;

struct CoreTables {
	gdt: GlobalDescriptorTable,
	tss: TaskStateSegment,
	double_fault_stack: [u8; STACK_SIZE],
	code_selector: Option<SegmentSelector>,
}

/// One table per possible core, never reallocated once built, mirroring
/// `core_local`'s fixed table.
static TABLES: OnceCell<alloc::boxed::Box<[OnceCell<CoreTables>]>> = OnceCell::new();

pub fn init(core_count: usize) {
	let slots = (0..core_count.min(MAX_CPUS)).map(|_| OnceCell::new()).collect();
	TABLES.set(slots).ok().expect("gdt::init called twice");
}

/// Builds and loads this core's GDT, TSS and segment registers. Must run
/// once per core, before interrupts are enabled there.
pub fn load(core_idx: usize) {
	let tables = TABLES.get().expect("gdt::init not called");
	let slot = &tables[core_idx];
	slot.set(CoreTables {
		gdt: GlobalDescriptorTable::new(),
		tss: TaskStateSegment::new(),
		double_fault_stack: [0; STACK_SIZE],
		code_selector: None,
	})
	.ok();

	// SAFETY: this core is the only one ever touching its own slot, and
	// the slot's address is stable for the kernel's lifetime once `init`
	// has allocated the boxed slice.
	let entry = unsafe { &mut *(slot as *const OnceCell<CoreTables> as *mut OnceCell<CoreTables>) };
	let built = entry.get_mut().expect("slot just initialized");

	let stack_top = VirtAddr::from_ptr(built.double_fault_stack.as_ptr()) + STACK_SIZE as u64;
	built.tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = stack_top;

	let tss_ref: &'static TaskStateSegment =
		unsafe { &*(&built.tss as *const TaskStateSegment) };
	let code_selector = built.gdt.append(Descriptor::kernel_code_segment());
	let tss_selector = built.gdt.append(Descriptor::tss_segment(tss_ref));
	built.code_selector = Some(code_selector);

	let gdt_ref: &'static GlobalDescriptorTable = unsafe { &*(&built.gdt as *const GlobalDescriptorTable) };
	gdt_ref.load();

	unsafe {
		CS::set_reg(code_selector);
		load_tss(tss_selector);
	}
}

pub fn kernel_code_selector(core_idx: usize) -> SegmentSelector {
	let tables = TABLES.get().expect("gdt::init not called");
	let built = tables[core_idx].get().expect("gdt::load not called for this core");
	built.code_selector.expect("gdt::load not called for this core")
}
