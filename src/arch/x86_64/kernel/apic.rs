//! Local APIC bring-up, end-of-interrupt, and the ICR-write IPI send path
//! `IpiCoordinator` (spec.md §4.9) builds on.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hermit_sync::OnceCell;
use x86_64::registers::model_specific::Msr;

const IA32_APIC_BASE: u32 = 0x1B;
const X2APIC_ENABLE_BIT: u64 = 1 << 10;
const APIC_GLOBAL_ENABLE_BIT: u64 = 1 << 11;

// xAPIC MMIO register offsets (in units of bytes from the APIC base page).
const REG_EOI: usize = 0x0B0;
const REG_SPURIOUS: usize = 0x0F0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_DIVIDE: usize = 0x3E0;
const REG_TIMER_INITIAL_COUNT: usize = 0x380;

// x2APIC MSR indices (Intel SDM Vol. 3A, 10.12.1).
const X2_EOI: u32 = 0x80B;
const X2_SPURIOUS: u32 = 0x80F;
const X2_ICR: u32 = 0x830;
const X2_LVT_TIMER: u32 = 0x832;
const X2_TIMER_DIVIDE: u32 = 0x83E;
const X2_TIMER_INITIAL_COUNT: u32 = 0x838;

static USE_X2APIC: AtomicBool = AtomicBool::new(false);
/// Higher-half virtual address of the xAPIC's MMIO page; unused in x2APIC
/// mode.
static MMIO_BASE: OnceCell<u64> = OnceCell::new();
static APIC_ID: AtomicU64 = AtomicU64::new(0);

/// Delivery modes used on the ICR (spec.md §4.9 IPI kinds map onto these
/// via fixed vectors rather than special delivery modes, except INIT/SIPI
/// during AP bring-up).
#[derive(Debug, Clone, Copy)]
pub enum DeliveryMode {
	Fixed,
	Init,
	StartUp,
}

/// Brings the calling core's LAPIC into software-enabled state. Must run
/// on every core once, after `processor::detect()` has determined
/// whether x2APIC is available.
pub fn init(x2apic_supported: bool, hhdm_offset: u64) {
	let mut base_msr = Msr::new(IA32_APIC_BASE);
	let mut base = unsafe { base_msr.read() };
	let phys_base = base & !0xFFF;

	if x2apic_supported {
		base |= X2APIC_ENABLE_BIT | APIC_GLOBAL_ENABLE_BIT;
		unsafe { base_msr.write(base) };
		USE_X2APIC.store(true, Ordering::Release);
		let id = unsafe { Msr::new(0x802).read() };
		APIC_ID.store(id, Ordering::Release);
	} else {
		base |= APIC_GLOBAL_ENABLE_BIT;
		unsafe { base_msr.write(base) };
		MMIO_BASE.set(hhdm_offset + phys_base).ok();
		let id = unsafe { read_xapic(0x020) } >> 24;
		APIC_ID.store(u64::from(id), Ordering::Release);
	}

	// Software-enable with a fixed spurious vector; the EOI broadcast
	// suppression bit is left clear since this core only targets other
	// cores by APIC ID, never a broadcast.
	write_reg(REG_SPURIOUS, X2_SPURIOUS, u64::from(crate::config::SPURIOUS_VECTOR) | 0x100);
}

pub fn id() -> u32 {
	APIC_ID.load(Ordering::Acquire) as u32
}

pub fn eoi() {
	write_reg(REG_EOI, X2_EOI, 0);
}

/// Sends a fixed-vector interrupt to a single APIC ID, the primitive
/// `IpiCoordinator` uses for TLB shootdown, remote call, and stop
/// requests (spec.md §4.9).
pub fn send_ipi(target_apic_id: u32, vector: u8) {
	send_ipi_inner(DeliveryMode::Fixed, target_apic_id, vector);
}

pub fn send_init(target_apic_id: u32) {
	send_ipi_inner(DeliveryMode::Init, target_apic_id, 0);
}

pub fn send_startup(target_apic_id: u32, start_page: u8) {
	send_ipi_inner(DeliveryMode::StartUp, target_apic_id, start_page);
}

fn send_ipi_inner(mode: DeliveryMode, target_apic_id: u32, vector: u8) {
	let delivery_bits: u64 = match mode {
		DeliveryMode::Fixed => 0b000,
		DeliveryMode::Init => 0b101,
		DeliveryMode::StartUp => 0b110,
	};
	let low = u64::from(vector) | (delivery_bits << 8) | (1 << 14); // level=assert

	if USE_X2APIC.load(Ordering::Acquire) {
		let icr = (u64::from(target_apic_id) << 32) | low;
		unsafe { Msr::new(X2_ICR).write(icr) };
	} else {
		let base = *MMIO_BASE.get().expect("apic::init not called");
		unsafe {
			write_xapic_at(base, REG_ICR_HIGH, target_apic_id << 24);
			write_xapic_at(base, REG_ICR_LOW, low as u32);
			// Wait for delivery before returning, since the xAPIC MMIO
			// path has no completion interrupt of its own.
			while read_xapic_at(base, REG_ICR_LOW) & (1 << 12) != 0 {
				core::hint::spin_loop();
			}
		}
	}
}

/// Programs the APIC timer in one-shot mode with `initial_count` ticks,
/// firing `vector` on expiry. The scheduler's tick source (spec.md §4.8)
/// re-arms this on every interrupt.
pub fn arm_timer(initial_count: u32, vector: u8) {
	write_reg(REG_TIMER_DIVIDE, X2_TIMER_DIVIDE, 0b1011); // divide by 1
	write_reg(REG_LVT_TIMER, X2_LVT_TIMER, u64::from(vector));
	write_reg(REG_TIMER_INITIAL_COUNT, X2_TIMER_INITIAL_COUNT, u64::from(initial_count));
}

fn write_reg(xapic_offset: usize, x2apic_msr: u32, value: u64) {
	if USE_X2APIC.load(Ordering::Acquire) {
		unsafe { Msr::new(x2apic_msr).write(value) };
	} else {
		let base = *MMIO_BASE.get().expect("apic::init not called");
		unsafe { write_xapic_at(base, xapic_offset, value as u32) };
	}
}

unsafe fn read_xapic(offset: usize) -> u32 {
	let base = *MMIO_BASE.get().expect("apic::init not called");
	unsafe { read_xapic_at(base, offset) }
}

unsafe fn read_xapic_at(base: u64, offset: usize) -> u32 {
	unsafe { core::ptr::read_volatile((base as usize + offset) as *const u32) }
}

unsafe fn write_xapic_at(base: u64, offset: usize, value: u32) {
	unsafe { core::ptr::write_volatile((base as usize + offset) as *mut u32, value) };
}
