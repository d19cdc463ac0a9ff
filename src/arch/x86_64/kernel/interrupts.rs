//! `InterruptDispatcher` (spec.md §4.11): a vector-indexed handler table
//! sitting behind the CPU's IDT, plus the EOI and reschedule policy every
//! entry point funnels through.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use hermit_sync::{InterruptTicketMutex, OnceCell};
use log::{debug, warn};

use crate::arch::x86_64::kernel::{apic, core_local};
use crate::config::{FIRST_PLATFORM_VECTOR, ROUTED_VECTOR_COUNT, SPURIOUS_VECTOR};

pub type HandlerFn = fn(vector: u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EoiPolicy {
	/// CPU exceptions: the processor never expects an EOI for these.
	None,
	/// Ordinary external interrupt: send EOI once the handler returns.
	Standard,
	/// Send EOI *before* invoking the handler, for handlers that need
	/// interrupts re-enabled on the controller while they run (spec.md
	/// §4.11: "optionally pre-EOI, invoke, then post-EOI unless pre-EOI
	/// happened").
	Pre,
}

const NO_HANDLER: usize = 0;
const HANDLER_SLOTS: usize = 256;
const POLICY_NONE: u8 = 0;
const POLICY_STANDARD: u8 = 1;
const POLICY_PRE: u8 = 2;

struct Slot {
	handler: AtomicUsize,
	policy: AtomicU8,
}

const INIT_SLOT: Slot = Slot { handler: AtomicUsize::new(NO_HANDLER), policy: AtomicU8::new(POLICY_NONE) };

static HANDLERS: [Slot; HANDLER_SLOTS] = [INIT_SLOT; HANDLER_SLOTS];

/// GSI/legacy-IRQ to vector assignment table, guarded by a lock since it
/// is only touched during driver bring-up, never on the interrupt path.
static IRQ_TO_VECTOR: InterruptTicketMutex<alloc::collections::BTreeMap<u32, u8>> =
	InterruptTicketMutex::new(alloc::collections::BTreeMap::new());

/// Routed device vectors occupy `FIRST_PLATFORM_VECTOR + 1` through
/// `FIRST_PLATFORM_VECTOR + ROUTED_VECTOR_COUNT`; `FIRST_PLATFORM_VECTOR`
/// itself is the timer tick, so GSI mapping must not hand that one out.
static NEXT_DYNAMIC_VECTOR: AtomicUsize = AtomicUsize::new(FIRST_PLATFORM_VECTOR as usize + 1);
const LAST_ROUTED_VECTOR: usize = FIRST_PLATFORM_VECTOR as usize + ROUTED_VECTOR_COUNT as usize;

/// Invoked after every `Standard`-policy vector is handled and EOI'd, so
/// the scheduler can act on a reschedule request raised by the handler
/// (typically the timer tick) without this module depending on the
/// scheduler module's types directly.
static RESCHEDULE_HOOK: OnceCell<fn()> = OnceCell::new();

pub fn set_reschedule_hook(hook: fn()) {
	RESCHEDULE_HOOK.set(hook).ok();
}

fn policy_from_u8(v: u8) -> EoiPolicy {
	match v {
		POLICY_STANDARD => EoiPolicy::Standard,
		POLICY_PRE => EoiPolicy::Pre,
		_ => EoiPolicy::None,
	}
}

fn policy_to_u8(policy: EoiPolicy) -> u8 {
	match policy {
		EoiPolicy::None => POLICY_NONE,
		EoiPolicy::Standard => POLICY_STANDARD,
		EoiPolicy::Pre => POLICY_PRE,
	}
}

/// Registers `handler` for `vector`. Exceptions (vector < 32) register
/// with `EoiPolicy::None`; everything else defaults to `Standard`.
pub fn register(vector: u8, handler: HandlerFn) {
	let policy = if vector < FIRST_PLATFORM_VECTOR { EoiPolicy::None } else { EoiPolicy::Standard };
	register_with_policy(vector, handler, policy);
}

pub fn register_with_policy(vector: u8, handler: HandlerFn, policy: EoiPolicy) {
	let slot = &HANDLERS[vector as usize];
	slot.handler.store(handler as usize, Ordering::Release);
	slot.policy.store(policy_to_u8(policy), Ordering::Release);
}

/// Allocates a fresh vector for a legacy ISA IRQ already mapped to `gsi`
/// and remembers the mapping so a second call for the same GSI returns
/// the same vector, matching spec.md §4.11's routing contract.
pub fn map_legacy_irq(gsi: u32) -> u8 {
	map_gsi(gsi)
}

/// Allocates (or returns the existing) vector for a PCI interrupt line
/// already resolved to a GSI.
pub fn map_pci_irq(gsi: u32) -> u8 {
	map_gsi(gsi)
}

fn map_gsi(gsi: u32) -> u8 {
	let mut table = IRQ_TO_VECTOR.lock();
	if let Some(&vector) = table.get(&gsi) {
		return vector;
	}
	let vector = NEXT_DYNAMIC_VECTOR.fetch_add(1, Ordering::AcqRel);
	assert!(vector <= LAST_ROUTED_VECTOR, "routed device vector space exhausted");
	table.insert(gsi, vector as u8);
	vector as u8
}

/// The common entry point every IDT stub for vectors >= 32 calls into.
/// CPU exception stubs call their own handlers directly and never reach
/// this path, since they carry architecture-specific frames this
/// function does not model.
pub fn dispatch(vector: u8) {
	if vector == SPURIOUS_VECTOR {
		return;
	}

	let slot = &HANDLERS[vector as usize];
	let handler = slot.handler.load(Ordering::Acquire);
	let policy = policy_from_u8(slot.policy.load(Ordering::Acquire));

	if policy == EoiPolicy::Pre {
		apic::eoi();
	}

	if handler == NO_HANDLER {
		// Exceptions (vector < FIRST_PLATFORM_VECTOR) never reach this
		// branch: `idt::build` wires each of them to its own stub that
		// calls `fatal_exception` directly, per spec.md §7 ("Fatal").
		// Only a platform vector can legitimately have no handler here.
		warn!("no handler registered for interrupt vector {vector}");
	} else {
		let handler: HandlerFn = unsafe { core::mem::transmute::<usize, HandlerFn>(handler) };
		handler(vector);
	}

	if policy == EoiPolicy::Standard {
		apic::eoi();
	}

	if core_local::core_local().take_reschedule_request() {
		if let Some(hook) = RESCHEDULE_HOOK.get() {
			debug!("vector {vector} requested a reschedule");
			hook();
		}
	}
}

/// Panics with full diagnostic context; called by exception stubs for
/// vectors with no registered recovery path (spec.md §7, "Fatal").
pub fn fatal_exception(vector: u8, error_code: u64, instruction_pointer: u64) -> ! {
	panic!(
		"unhandled cpu exception vector={vector} error_code={error_code:#x} rip={instruction_pointer:#x}"
	);
}
