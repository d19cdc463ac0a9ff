//! IDT construction. CPU exceptions get dedicated stubs that forward into
//! `InterruptDispatcher`'s exception policy; platform vectors (timer,
//! IPIs, and a block of routed device vectors) forward into
//! `interrupts::dispatch`.

use hermit_sync::OnceCell;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::arch::x86_64::kernel::gdt::DOUBLE_FAULT_IST_INDEX;
use crate::arch::x86_64::kernel::interrupts;
use crate::config::{
	FIRST_PLATFORM_VECTOR, REMOTE_CALL_VECTOR, ROUTED_VECTOR_COUNT, RESCHEDULE_VECTOR,
	SPURIOUS_VECTOR, STOP_VECTOR, TLB_SHOOTDOWN_VECTOR,
};

static IDT: OnceCell<InterruptDescriptorTable> = OnceCell::new();

macro_rules! routed_stub {
	($vector:literal) => {{
		extern "x86-interrupt" fn handler(_frame: InterruptStackFrame) {
			interrupts::dispatch($vector);
		}
		handler as extern "x86-interrupt" fn(InterruptStackFrame)
	}};
}

extern "x86-interrupt" fn divide_error(frame: InterruptStackFrame) {
	interrupts::fatal_exception(0, 0, frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn debug_exception(_frame: InterruptStackFrame) {}

extern "x86-interrupt" fn breakpoint(frame: InterruptStackFrame) {
	log::debug!("breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn invalid_opcode(frame: InterruptStackFrame) {
	interrupts::fatal_exception(6, 0, frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn device_not_available(frame: InterruptStackFrame) {
	interrupts::fatal_exception(7, 0, frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, error_code: u64) -> ! {
	panic!(
		"double fault, error_code={error_code:#x} rip={:#x}",
		frame.instruction_pointer.as_u64()
	);
}

extern "x86-interrupt" fn general_protection_fault(frame: InterruptStackFrame, error_code: u64) {
	interrupts::fatal_exception(13, error_code, frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn page_fault(
	frame: InterruptStackFrame,
	error_code: PageFaultErrorCode,
) {
	let fault_addr = x86_64::registers::control::Cr2::read().expect("valid CR2 on #PF");
	crate::mm::handle_kernel_page_fault(
		fault_addr.as_u64(),
		error_code,
		frame.instruction_pointer.as_u64(),
	);
}

extern "x86-interrupt" fn timer_tick(_frame: InterruptStackFrame) {
	interrupts::dispatch(crate::config::FIRST_PLATFORM_VECTOR);
}

extern "x86-interrupt" fn tlb_shootdown(_frame: InterruptStackFrame) {
	interrupts::dispatch(TLB_SHOOTDOWN_VECTOR);
}

extern "x86-interrupt" fn reschedule(_frame: InterruptStackFrame) {
	interrupts::dispatch(RESCHEDULE_VECTOR);
}

extern "x86-interrupt" fn remote_call(_frame: InterruptStackFrame) {
	interrupts::dispatch(REMOTE_CALL_VECTOR);
}

extern "x86-interrupt" fn stop(_frame: InterruptStackFrame) {
	interrupts::dispatch(STOP_VECTOR);
}

extern "x86-interrupt" fn spurious(_frame: InterruptStackFrame) {
	interrupts::dispatch(SPURIOUS_VECTOR);
}

/// Builds the single, shared IDT. Called once on the boot-strap
/// processor; every core loads the same table with its own `lidt`.
pub fn build() {
	let mut idt = InterruptDescriptorTable::new();
	idt.divide_error.set_handler_fn(divide_error);
	idt.debug.set_handler_fn(debug_exception);
	idt.breakpoint.set_handler_fn(breakpoint);
	idt.invalid_opcode.set_handler_fn(invalid_opcode);
	idt.device_not_available.set_handler_fn(device_not_available);
	unsafe {
		idt.double_fault.set_handler_fn(double_fault).set_stack_index(DOUBLE_FAULT_IST_INDEX);
	}
	idt.general_protection_fault.set_handler_fn(general_protection_fault);
	idt.page_fault.set_handler_fn(page_fault);

	idt[FIRST_PLATFORM_VECTOR as usize].set_handler_fn(timer_tick);
	idt[TLB_SHOOTDOWN_VECTOR as usize].set_handler_fn(tlb_shootdown);
	idt[RESCHEDULE_VECTOR as usize].set_handler_fn(reschedule);
	idt[REMOTE_CALL_VECTOR as usize].set_handler_fn(remote_call);
	idt[STOP_VECTOR as usize].set_handler_fn(stop);
	idt[SPURIOUS_VECTOR as usize].set_handler_fn(spurious);

	let routed: [extern "x86-interrupt" fn(InterruptStackFrame); ROUTED_VECTOR_COUNT as usize] = [
		routed_stub!(33),
		routed_stub!(34),
		routed_stub!(35),
		routed_stub!(36),
		routed_stub!(37),
		routed_stub!(38),
		routed_stub!(39),
		routed_stub!(40),
		routed_stub!(41),
		routed_stub!(42),
		routed_stub!(43),
		routed_stub!(44),
		routed_stub!(45),
		routed_stub!(46),
		routed_stub!(47),
		routed_stub!(48),
	];
	for (i, stub) in routed.into_iter().enumerate() {
		idt[FIRST_PLATFORM_VECTOR as usize + 1 + i].set_handler_fn(stub);
	}

	IDT.set(idt).ok().expect("idt::build called twice");
}

/// Loads the shared IDT on the calling core. Must run once per core,
/// after `build()` and after `gdt::load` (the double-fault IST index must
/// already resolve in this core's TSS).
pub fn load() {
	IDT.get().expect("idt::build not called").load();
}
