//! Thread and process data model (spec.md §3).

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::mm::user_vmm::UserAddressSpace;

pub type ThreadId = u64;
pub type ProcessId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
	Ready = 0,
	Running = 1,
	Blocked = 2,
	Sleeping = 3,
	/// Terminated but not yet collected; owned by the owning core's
	/// zombie queue until its reaper thread destroys it.
	Zombie = 4,
}

impl ThreadState {
	fn from_u8(v: u8) -> Self {
		match v {
			0 => Self::Ready,
			1 => Self::Running,
			2 => Self::Blocked,
			3 => Self::Sleeping,
			_ => Self::Zombie,
		}
	}
}

/// Callee-saved registers and stack pointer captured across a voluntary
/// context switch. `context_switch` is the only code that reads or
/// writes this; everything above the scheduler treats it as opaque.
#[repr(C)]
pub struct Context {
	pub rsp: u64,
}

/// A schedulable unit of execution. Always reached through an `Arc`: the
/// scheduler's ready queues, the sleep heap, and the owning process's
/// thread list all hold independent references to the same thread.
pub struct Thread {
	pub id: ThreadId,
	pub process: ProcessId,
	state: AtomicU8,
	/// Current MLFQ level, `0..MLFQ_LEVELS` (spec.md §4.8).
	pub priority: AtomicU8,
	pub remaining_slice: AtomicU32,
	pub kernel_stack_top: u64,
	pub context: UnsafeCell<Context>,
	/// Absent for kernel threads, which run entirely against the kernel
	/// page map.
	pub address_space: Option<Arc<UserAddressSpace>>,
	/// Absolute scheduler tick this thread should wake at; only
	/// meaningful while `state() == Sleeping`.
	wake_tick: AtomicU64,
	/// Core this thread last ran on, consulted by work stealing to
	/// prefer warm caches over strict load balance.
	pub last_core: AtomicU32,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
	pub fn new(
		id: ThreadId,
		process: ProcessId,
		kernel_stack_top: u64,
		initial_rsp: u64,
		address_space: Option<Arc<UserAddressSpace>>,
	) -> Arc<Self> {
		Arc::new(Self {
			id,
			process,
			state: AtomicU8::new(ThreadState::Ready as u8),
			priority: AtomicU8::new(0),
			remaining_slice: AtomicU32::new(0),
			kernel_stack_top,
			context: UnsafeCell::new(Context { rsp: initial_rsp }),
			address_space,
			wake_tick: AtomicU64::new(0),
			last_core: AtomicU32::new(u32::MAX),
		})
	}

	pub fn state(&self) -> ThreadState {
		ThreadState::from_u8(self.state.load(Ordering::Acquire))
	}

	pub fn set_state(&self, state: ThreadState) {
		self.state.store(state as u8, Ordering::Release);
	}

	pub fn wake_tick(&self) -> u64 {
		self.wake_tick.load(Ordering::Relaxed)
	}

	pub fn set_wake_tick(&self, tick: u64) {
		self.wake_tick.store(tick, Ordering::Relaxed);
	}
}

pub struct Process {
	pub id: ProcessId,
	pub address_space: Arc<UserAddressSpace>,
	threads: hermit_sync::InterruptTicketMutex<alloc::vec::Vec<ThreadId>>,
}

impl Process {
	pub fn new(id: ProcessId, address_space: Arc<UserAddressSpace>) -> Self {
		Self { id, address_space, threads: hermit_sync::InterruptTicketMutex::new(alloc::vec::Vec::new()) }
	}

	pub fn add_thread(&self, tid: ThreadId) {
		self.threads.lock().push(tid);
	}

	pub fn remove_thread(&self, tid: ThreadId) {
		self.threads.lock().retain(|&t| t != tid);
	}

	pub fn thread_count(&self) -> usize {
		self.threads.lock().len()
	}
}

/// # Safety
/// `prev` and `next` must each point at a live `Context` belonging to a
/// thread whose kernel stack is not concurrently in use elsewhere.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(prev: *mut Context, next: *const Context) {
	core::arch::naked_asm!(
		"push rbx",
		"push rbp",
		"push r12",
		"push r13",
		"push r14",
		"push r15",
		"mov [rdi], rsp",
		"mov rsp, [rsi]",
		"pop r15",
		"pop r14",
		"pop r13",
		"pop r12",
		"pop rbp",
		"pop rbx",
		"ret",
	);
}
