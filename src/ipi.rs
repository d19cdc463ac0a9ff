//! Inter-CPU coordination: TLB shootdown, remote function call, and
//! panic-stop, all riding the same inter-processor-interrupt machinery
//! through `apic::send_ipi` and `InterruptDispatcher`.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use hermit_sync::InterruptTicketMutex;

use crate::arch::x86_64::kernel::interrupts::EoiPolicy;
use crate::arch::x86_64::kernel::{apic, core_local, interrupts};
use crate::config::{BASE_PAGE_SIZE, REMOTE_CALL_VECTOR, RESCHEDULE_VECTOR, STOP_VECTOR, TLB_SHOOTDOWN_VECTOR};
use crate::mm::tlb;

/// Serializes the three mailboxes below: only one kind of IPI round can
/// be in flight system-wide at a time.
static DISPATCH_LOCK: InterruptTicketMutex<()> = InterruptTicketMutex::new(());

/// Acknowledgement counter the initiator spins on, shared across mailbox
/// kinds since `DISPATCH_LOCK` already keeps rounds from overlapping.
static PENDING_ACKS: AtomicU32 = AtomicU32::new(0);

struct TlbShootdownMailbox {
	start_va: AtomicU64,
	page_count: AtomicUsize,
}
static TLB_MAILBOX: TlbShootdownMailbox =
	TlbShootdownMailbox { start_va: AtomicU64::new(0), page_count: AtomicUsize::new(0) };

pub type RemoteFn = fn(usize);

struct RemoteCallMailbox {
	func: AtomicUsize,
	arg: AtomicUsize,
	target_apic_id: AtomicU32,
}
static REMOTE_CALL_MAILBOX: RemoteCallMailbox =
	RemoteCallMailbox { func: AtomicUsize::new(0), arg: AtomicUsize::new(0), target_apic_id: AtomicU32::new(0) };

/// Registers this module's IPI vectors with the `InterruptDispatcher` and
/// gives the scheduler a way to nudge a remote core into rescheduling
/// when `unblock` wakes a thread that outranks it.
pub fn init(_core_count: usize) {
	interrupts::register_with_policy(TLB_SHOOTDOWN_VECTOR, handle_tlb_shootdown, EoiPolicy::Standard);
	interrupts::register_with_policy(REMOTE_CALL_VECTOR, handle_remote_call, EoiPolicy::Standard);
	interrupts::register_with_policy(RESCHEDULE_VECTOR, handle_reschedule, EoiPolicy::Standard);
	interrupts::register_with_policy(STOP_VECTOR, handle_stop, EoiPolicy::None);
	crate::scheduler::set_remote_reschedule_hook(send_reschedule);
}

fn online_peer_apic_ids(excluding: u32) -> Vec<u32> {
	let n = core_local::core_count();
	(0..n)
		.map(core_local::core)
		.filter(|core| core.apic_id != excluding && core.is_online())
		.map(|core| core.apic_id)
		.collect()
}

/// Broadcasts `vector` to every other online core, having first stored
/// the peer count into `PENDING_ACKS`, then spins until every recipient
/// has acknowledged.
fn broadcast_and_wait(vector: u8) {
	let peers = online_peer_apic_ids(apic::id());
	PENDING_ACKS.store(peers.len() as u32, Ordering::Release);
	for apic_id in peers {
		apic::send_ipi(apic_id, vector);
	}
	while PENDING_ACKS.load(Ordering::Acquire) != 0 {
		core::hint::spin_loop();
	}
}

/// Invalidates `page_count` pages starting at `start_va` on every other
/// online core and waits for all of them to acknowledge, providing a
/// release barrier for the page-table writes the caller just made. A
/// no-op on a single-CPU system.
pub fn shootdown_tlb(start_va: u64, page_count: usize) {
	if core_local::core_count() <= 1 {
		return;
	}
	let _guard = DISPATCH_LOCK.lock();
	TLB_MAILBOX.start_va.store(start_va, Ordering::Release);
	TLB_MAILBOX.page_count.store(page_count, Ordering::Release);
	broadcast_and_wait(TLB_SHOOTDOWN_VECTOR);
}

fn handle_tlb_shootdown(_vector: u8) {
	let start_va = TLB_MAILBOX.start_va.load(Ordering::Acquire);
	let page_count = TLB_MAILBOX.page_count.load(Ordering::Acquire);
	for page in 0..page_count {
		tlb::flush_one(start_va + (page * BASE_PAGE_SIZE) as u64);
	}
	PENDING_ACKS.fetch_sub(1, Ordering::AcqRel);
}

/// Runs `func(arg)` on `target_apic_id` and waits for it to finish. If
/// that core is offline (or this is a single-CPU system), returns
/// immediately without sending anything — nothing would ever
/// acknowledge.
pub fn call_remote(target_apic_id: u32, func: RemoteFn, arg: usize) {
	if core_local::core_count() <= 1 {
		return;
	}
	let online = online_peer_apic_ids(apic::id()).contains(&target_apic_id);
	if !online {
		return;
	}
	let _guard = DISPATCH_LOCK.lock();
	REMOTE_CALL_MAILBOX.func.store(func as usize, Ordering::Release);
	REMOTE_CALL_MAILBOX.arg.store(arg, Ordering::Release);
	REMOTE_CALL_MAILBOX.target_apic_id.store(target_apic_id, Ordering::Release);
	PENDING_ACKS.store(1, Ordering::Release);
	apic::send_ipi(target_apic_id, REMOTE_CALL_VECTOR);
	while PENDING_ACKS.load(Ordering::Acquire) != 0 {
		core::hint::spin_loop();
	}
}

fn handle_remote_call(_vector: u8) {
	// Broadcast would be wasteful for a one-on-one primitive; fixed IPIs
	// are still only delivered to the addressed APIC ID, so this check
	// is a defensive mismatch guard rather than a real filter.
	if REMOTE_CALL_MAILBOX.target_apic_id.load(Ordering::Acquire) == apic::id() {
		let func_ptr = REMOTE_CALL_MAILBOX.func.load(Ordering::Acquire);
		let arg = REMOTE_CALL_MAILBOX.arg.load(Ordering::Acquire);
		let func: RemoteFn = unsafe { core::mem::transmute::<usize, RemoteFn>(func_ptr) };
		func(arg);
	}
	PENDING_ACKS.fetch_sub(1, Ordering::AcqRel);
}

/// Halts every other online core for panic propagation. Does not wait
/// for acknowledgement — a halted core can never send one — the caller
/// is expected to halt itself immediately afterwards.
pub fn stop_others() {
	if core_local::core_count() <= 1 {
		return;
	}
	let _guard = DISPATCH_LOCK.lock();
	let me = apic::id();
	for apic_id in online_peer_apic_ids(me) {
		apic::send_ipi(apic_id, STOP_VECTOR);
	}
}

fn handle_stop(_vector: u8) {
	x86_64::instructions::interrupts::disable();
	loop {
		x86_64::instructions::hlt();
	}
}

fn handle_reschedule(_vector: u8) {
	core_local::core_local().request_reschedule();
}

/// Nudges `target_apic_id` into running its scheduler soon, used by
/// `scheduler::unblock` when the thread it just woke outranks whatever
/// that core is currently running.
fn send_reschedule(target_apic_id: u32) {
	if core_local::core_count() <= 1 {
		return;
	}
	if target_apic_id == apic::id() {
		core_local::core_local().request_reschedule();
		return;
	}
	apic::send_ipi(target_apic_id, RESCHEDULE_VECTOR);
}
