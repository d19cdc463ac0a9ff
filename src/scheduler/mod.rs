//! `Scheduler` (spec.md §4.8): a multi-level feedback queue per core,
//! with work stealing for load balance and a per-core sleep min-heap
//! driven off the same tick that drives the MLFQ bookkeeping.

pub mod task;
pub mod timer;

use alloc::boxed::Box;
use alloc::collections::{BinaryHeap, VecDeque};
use alloc::sync::Arc;
use core::cmp::Reverse;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use hermit_sync::{InterruptTicketMutex, OnceCell};
use log::trace;
use x86_64::structures::idt::PageFaultErrorCode;

use crate::arch::x86_64::kernel::core_local;
use crate::config::{MLFQ_LEVELS, PRIORITY_BOOST_INTERVAL, TIME_SLICES};
use crate::error::Result;
use crate::mm::frame::PhysicalFrameAllocator;
use crate::mm::pcid::{KERNEL_ASID, PcidManager};
use crate::scheduler::task::{Context, Process, ProcessId, Thread, ThreadId, ThreadState, context_switch};

struct SleepEntry {
	wake_tick: u64,
	thread: Arc<Thread>,
}
impl PartialEq for SleepEntry {
	fn eq(&self, other: &Self) -> bool {
		self.wake_tick == other.wake_tick
	}
}
impl Eq for SleepEntry {}
impl PartialOrd for SleepEntry {
	fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for SleepEntry {
	fn cmp(&self, other: &Self) -> core::cmp::Ordering {
		self.wake_tick.cmp(&other.wake_tick)
	}
}

/// One core's run queues. Reached through `core_local::core_local().scheduler()`.
pub struct CoreScheduler {
	core_idx: u32,
	ready: [InterruptTicketMutex<VecDeque<Arc<Thread>>>; MLFQ_LEVELS],
	current: InterruptTicketMutex<Option<Arc<Thread>>>,
	idle: Arc<Thread>,
	/// Blocked until `terminate` wakes it; collects this core's zombies.
	/// Invariant (spec.md §9): the reaper's own body never calls
	/// `terminate`, so it can never itself reach `Zombie`.
	reaper: Arc<Thread>,
	zombies: InterruptTicketMutex<VecDeque<Arc<Thread>>>,
	sleeping: InterruptTicketMutex<BinaryHeap<Reverse<SleepEntry>>>,
	pub timer: timer::Timer,
	/// This core's tagged-TLB identifier assignment (spec.md §4.4); one
	/// instance per core, never shared, consulted only from `schedule`.
	pcid_mgr: PcidManager,
	tick: AtomicU64,
	/// Set by `tick` when the running thread's time slice has just run
	/// out, consulted by the next `schedule` call to decide whether the
	/// preempted thread demotes a level (spec.md §4.8: quantum expiry
	/// demotes, a voluntary `yield` does not).
	quantum_expired: core::sync::atomic::AtomicBool,
}

impl CoreScheduler {
	fn new(core_idx: u32, idle: Arc<Thread>, reaper: Arc<Thread>) -> Self {
		Self {
			core_idx,
			ready: core::array::from_fn(|_| InterruptTicketMutex::new(VecDeque::new())),
			current: InterruptTicketMutex::new(None),
			idle,
			reaper,
			zombies: InterruptTicketMutex::new(VecDeque::new()),
			sleeping: InterruptTicketMutex::new(BinaryHeap::new()),
			timer: timer::Timer::new(),
			pcid_mgr: PcidManager::new(),
			tick: AtomicU64::new(0),
			quantum_expired: core::sync::atomic::AtomicBool::new(false),
		}
	}

	pub fn current_thread(&self) -> Option<Arc<Thread>> {
		self.current.lock().clone()
	}

	pub fn current_tick(&self) -> u64 {
		self.tick.load(Ordering::Relaxed)
	}

	fn enqueue_ready(&self, thread: Arc<Thread>) {
		thread.set_state(ThreadState::Ready);
		let level = thread.priority.load(Ordering::Relaxed) as usize;
		self.ready[level.min(MLFQ_LEVELS - 1)].lock().push_back(thread);
	}

	/// Pops the highest-priority runnable thread, or `None` if every
	/// local queue is empty (the caller then tries work stealing).
	fn pop_ready(&self) -> Option<Arc<Thread>> {
		for level in 0..MLFQ_LEVELS {
			if let Some(thread) = self.ready[level].lock().pop_front() {
				return Some(thread);
			}
		}
		None
	}

	fn steal_one(&self) -> Option<Arc<Thread>> {
		// Steal from the back (the coldest entries) of the lowest-priority
		// non-empty queue, leaving the stealing-core-favoring front alone.
		// `try_lock` only, never block: a victim's queue currently held by
		// its own core (or by another thief) is simply skipped rather than
		// waited on, so work stealing can't deadlock against a victim
		// (spec.md §4.8 step 2, §5).
		for level in (0..MLFQ_LEVELS).rev() {
			if let Some(mut queue) = self.ready[level].try_lock() {
				if let Some(thread) = queue.pop_back() {
					return Some(thread);
				}
			}
		}
		None
	}
}

pub struct Scheduler {
	cores: Box<[CoreScheduler]>,
	threads: InterruptTicketMutex<HashMap<ThreadId, Arc<Thread>>>,
	processes: InterruptTicketMutex<HashMap<ProcessId, Arc<Process>>>,
	next_tid: AtomicU64,
	next_pid: AtomicU64,
}

static SCHEDULER: OnceCell<Scheduler> = OnceCell::new();

pub fn scheduler() -> &'static Scheduler {
	SCHEDULER.get().expect("scheduler::init not called")
}

/// Called by `unblock` when the newly-runnable thread outranks whatever is
/// running on its target core, so that core doesn't wait for its next
/// unrelated interrupt to notice (spec.md §4.9). Populated by `ipi::init`
/// with a function that sends that core a reschedule IPI; kept as a plain
/// function pointer so this module doesn't need to depend on `ipi`.
static REMOTE_RESCHEDULE_HOOK: OnceCell<fn(u32)> = OnceCell::new();

pub fn set_remote_reschedule_hook(hook: fn(u32)) {
	REMOTE_RESCHEDULE_HOOK.set(hook).ok().expect("set_remote_reschedule_hook called twice");
}

/// Builds the global scheduler and wires each `CoreLocal`'s scheduler
/// pointer to its `CoreScheduler`. Each core needs an idle thread and a
/// reaper thread ready before this runs; `idle_stack_tops[i]` /
/// `reaper_stack_tops[i]` are core `i`'s idle and reaper threads' kernel
/// stack tops, already built the way `reaper_main` expects to resume
/// into (the boot collaborator's job, like any other thread's stack).
pub fn init(core_count: usize, idle_stack_tops: &[u64], reaper_stack_tops: &[u64]) {
	let next_tid = AtomicU64::new(1);
	let cores: Box<[CoreScheduler]> = (0..core_count)
		.map(|i| {
			let idle_tid = next_tid.fetch_add(1, Ordering::Relaxed);
			let idle = Thread::new(idle_tid, 0, idle_stack_tops[i], idle_stack_tops[i], None);
			idle.set_state(ThreadState::Running);

			let reaper_tid = next_tid.fetch_add(1, Ordering::Relaxed);
			let reaper = Thread::new(reaper_tid, 0, reaper_stack_tops[i], reaper_stack_tops[i], None);
			reaper.set_state(ThreadState::Blocked);

			CoreScheduler::new(i as u32, idle, reaper)
		})
		.collect();

	SCHEDULER
		.set(Scheduler {
			cores,
			threads: InterruptTicketMutex::new(HashMap::new()),
			processes: InterruptTicketMutex::new(HashMap::new()),
			next_tid,
			next_pid: AtomicU64::new(1),
		})
		.ok()
		.expect("scheduler::init called twice");

	let sched = scheduler();
	for (i, core) in sched.cores.iter().enumerate() {
		unsafe { core_local::core(i).set_scheduler(core as *const CoreScheduler as *mut CoreScheduler) };
	}
}

impl Scheduler {
	pub fn core(&self, idx: usize) -> &CoreScheduler {
		&self.cores[idx]
	}

	pub fn core_count(&self) -> usize {
		self.cores.len()
	}

	pub fn spawn_thread(
		&self,
		process: ProcessId,
		kernel_stack_top: u64,
		initial_rsp: u64,
		address_space: Option<Arc<crate::mm::user_vmm::UserAddressSpace>>,
		core_idx: usize,
	) -> ThreadId {
		let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
		let thread = Thread::new(tid, process, kernel_stack_top, initial_rsp, address_space);
		self.threads.lock().insert(tid, thread.clone());
		if let Some(proc) = self.processes.lock().get(&process) {
			proc.add_thread(tid);
		}
		thread.last_core.store(core_idx as u32, Ordering::Relaxed);
		self.cores[core_idx].enqueue_ready(thread);
		tid
	}

	pub fn spawn_process(&self, address_space: Arc<crate::mm::user_vmm::UserAddressSpace>) -> ProcessId {
		let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
		self.processes.lock().insert(pid, Arc::new(Process::new(pid, address_space)));
		pid
	}

	fn thread_by_id(&self, tid: ThreadId) -> Option<Arc<Thread>> {
		self.threads.lock().get(&tid).cloned()
	}

	/// Advances this core's tick: fires due timers, wakes sleepers whose
	/// deadline has passed, ages the current thread's time slice, and
	/// periodically boosts every ready thread back to the top MLFQ
	/// level (spec.md §4.8, "starvation avoidance").
	pub fn tick(&self, core_idx: usize) {
		let core = &self.cores[core_idx];
		let tick = core.tick.fetch_add(1, Ordering::Relaxed) + 1;
		core.timer.fire(tick);

		loop {
			let due = {
				let mut sleeping = core.sleeping.lock();
				match sleeping.peek() {
					Some(Reverse(entry)) if entry.wake_tick <= tick => {
						sleeping.pop().map(|Reverse(e)| e.thread)
					}
					_ => None,
				}
			};
			let Some(thread) = due else { break };
			core.enqueue_ready(thread);
		}

		if tick % PRIORITY_BOOST_INTERVAL == 0 {
			self.boost_all(core_idx);
		}

		if let Some(current) = core.current_thread() {
			let remaining = current.remaining_slice.fetch_sub(1, Ordering::Relaxed);
			if remaining <= 1 {
				core.quantum_expired.store(true, Ordering::Relaxed);
				core_local::core_local().request_reschedule();
			}
		}
	}

	/// Picks the next thread to run and switches to it. Called from the
	/// reschedule hook once the interrupt path sees
	/// `request_reschedule()` set, or directly by `yield_now`/`sleep`/
	/// `block`/`terminate`.
	pub fn schedule(&self, core_idx: usize) {
		let core = &self.cores[core_idx];
		let next = core.pop_ready().or_else(|| self.steal_from_others(core_idx)).unwrap_or_else(|| core.idle.clone());

		let level = next.priority.load(Ordering::Relaxed) as usize;
		next.remaining_slice.store(TIME_SLICES[level.min(MLFQ_LEVELS - 1)], Ordering::Relaxed);
		next.set_state(ThreadState::Running);
		next.last_core.store(core_idx as u32, Ordering::Relaxed);

		let prev = core.current.lock().replace(next.clone());

		// spec.md §4.8 step 4: a process switch means a different
		// `PageMap`, which means asking this core's `PcidManager` for the
		// tagged-TLB slot to load it under before anything in the new
		// thread's address space runs.
		let switching_process = prev.as_ref().is_none_or(|p| p.process != next.process);
		if switching_process {
			self.load_address_space(core, &next);
		}

		let Some(prev) = prev else {
			// First schedule on this core: there's no context to save.
			return;
		};
		if Arc::ptr_eq(&prev, &next) {
			return;
		}
		if prev.state() == ThreadState::Running {
			// Quantum expiry demotes a level; a voluntary yield (which
			// never sets the flag) leaves priority untouched.
			if core.quantum_expired.swap(false, Ordering::Relaxed) {
				self.demote(&prev);
			}
			core.enqueue_ready(prev.clone());
		}
		trace!("core {core_idx} switching thread {} -> {}", prev.id, next.id);
		unsafe {
			context_switch(prev.context.get(), next.context.get() as *const Context);
		}
	}

	/// Loads `thread`'s address space on `core`, asking the core's
	/// `PcidManager` for the PCID to load it under (spec.md §4.2 `load`,
	/// §4.4 `get_pcid`). Kernel threads (no `address_space`) load the
	/// singleton kernel `PageMap` under the reserved PCID 0.
	fn load_address_space(&self, core: &CoreScheduler, thread: &Thread) {
		let (page_map, asid) = match &thread.address_space {
			Some(vm) => (vm.page_map(), vm.asid),
			None => (crate::mm::kernel_page_map(), KERNEL_ASID),
		};
		let (pcid, needs_flush) = core.pcid_mgr.get_pcid(asid);
		unsafe { page_map.load(pcid, needs_flush) };
	}

	fn steal_from_others(&self, core_idx: usize) -> Option<Arc<Thread>> {
		for offset in 1..self.cores.len() {
			let victim = (core_idx + offset) % self.cores.len();
			if victim == core_idx {
				continue;
			}
			if let Some(thread) = self.cores[victim].steal_one() {
				return Some(thread);
			}
		}
		None
	}

	/// Puts the current thread to sleep for `ticks`, then reschedules.
	pub fn sleep(&self, core_idx: usize, ticks: u64) {
		let core = &self.cores[core_idx];
		let current = core.current.lock().take().expect("sleep called with no current thread");
		current.set_state(ThreadState::Sleeping);
		let wake_tick = core.tick.load(Ordering::Relaxed) + ticks;
		current.set_wake_tick(wake_tick);
		core.sleeping.lock().push(Reverse(SleepEntry { wake_tick, thread: current }));
		self.schedule(core_idx);
	}

	/// Blocks the current thread (e.g. waiting on a `Mutex`); some other
	/// thread must call `unblock` with this thread's id later.
	pub fn block(&self, core_idx: usize) -> ThreadId {
		let core = &self.cores[core_idx];
		let current = core.current.lock().take().expect("block called with no current thread");
		current.set_state(ThreadState::Blocked);
		let tid = current.id;
		drop(current);
		self.schedule(core_idx);
		tid
	}

	/// Moves a blocked or sleeping thread back to ready, on whichever
	/// core it last ran on. If that thread now outranks what's running on
	/// the target core, sends that core a reschedule IPI (spec.md §4.9) so
	/// it doesn't wait for its next unrelated interrupt to notice.
	///
	/// A thread that blocked having used less than half its quantum is
	/// promoted one MLFQ level, favoring interactive (block-heavy) work
	/// over CPU-bound work (spec.md §4.8). `remaining_slice` is frozen at
	/// whatever `tick` left it the instant this thread stopped being
	/// `current`, so it still reflects the quantum at block time here.
	pub fn unblock(&self, tid: ThreadId) -> Option<u32> {
		let thread = self.thread_by_id(tid)?;
		if thread.state() == ThreadState::Zombie {
			return None;
		}
		let level = thread.priority.load(Ordering::Relaxed);
		if level > 0 {
			let full = TIME_SLICES[level as usize] as u32;
			let remaining = thread.remaining_slice.load(Ordering::Relaxed);
			if remaining * 2 > full {
				thread.priority.store(level - 1, Ordering::Relaxed);
			}
		}
		let target_core = thread.last_core.load(Ordering::Relaxed);
		let target_core = if (target_core as usize) < self.cores.len() { target_core } else { 0 };
		let core = &self.cores[target_core as usize];
		let unblocked_priority = thread.priority.load(Ordering::Relaxed);
		let outranks_current = core.current_thread().is_none_or(|current| unblocked_priority < current.priority.load(Ordering::Relaxed));
		core.enqueue_ready(thread);
		if outranks_current {
			if let Some(hook) = REMOTE_RESCHEDULE_HOOK.get() {
				hook(core_local::core(target_core as usize).apic_id);
			}
		}
		Some(target_core)
	}

	pub fn yield_now(&self, core_idx: usize) {
		let core = &self.cores[core_idx];
		if let Some(current) = core.current_thread() {
			current.set_state(ThreadState::Ready);
		}
		self.schedule(core_idx);
	}

	/// Moves the current thread to `Zombie` and hands it to this core's
	/// reaper rather than destroying it inline (spec.md §4.8, "the per-CPU
	/// reaper thread collects and destroys thread objects"). The thread
	/// stays in `self.threads`/its process's list until the reaper
	/// actually reaps it.
	pub fn terminate(&self, core_idx: usize) {
		let core = &self.cores[core_idx];
		if let Some(current) = core.current.lock().take() {
			current.set_state(ThreadState::Zombie);
			core.zombies.lock().push_back(current);
			self.unblock(core.reaper.id);
		}
		self.schedule(core_idx);
	}

	/// Destroys every thread this core's reaper has collected since the
	/// last call: drops it from the global thread table and its owning
	/// process's thread list, releasing the scheduler's last `Arc`
	/// reference. Meant to be called from the reaper thread's own body
	/// (`reaper_main`), never from the thread being reaped.
	pub fn reap(&self, core_idx: usize) {
		let core = &self.cores[core_idx];
		loop {
			let zombie = core.zombies.lock().pop_front();
			let Some(zombie) = zombie else { break };
			self.threads.lock().remove(&zombie.id);
			if let Some(proc) = self.processes.lock().get(&zombie.process) {
				proc.remove_thread(zombie.id);
			}
		}
	}

	/// Resets every ready thread on `core_idx` to MLFQ level 0, the
	/// starvation-avoidance sweep spec.md §4.8 calls for.
	pub fn boost_all(&self, core_idx: usize) {
		let core = &self.cores[core_idx];
		for level in 1..MLFQ_LEVELS {
			let mut queue = core.ready[level].lock();
			if queue.is_empty() {
				continue;
			}
			let mut lifted: VecDeque<Arc<Thread>> = queue.drain(..).collect();
			for thread in &lifted {
				thread.priority.store(0, Ordering::Relaxed);
			}
			core.ready[0].lock().append(&mut lifted);
		}
	}

	/// Demotes the thread that just exhausted its time slice one MLFQ
	/// level, the complement to `boost_all`. Called by `schedule` before
	/// a preempted thread (as opposed to one that blocked voluntarily)
	/// is re-enqueued.
	pub fn demote(&self, thread: &Thread) {
		let level = thread.priority.load(Ordering::Relaxed);
		if (level as usize) + 1 < MLFQ_LEVELS {
			thread.priority.store(level + 1, Ordering::Relaxed);
		}
	}
}

/// Delegates a user-mode page fault to the faulting thread's address
/// space. `None` if there is no current thread or it has none (a kernel
/// thread took a fault tagged user-mode, which cannot legitimately
/// happen and is treated as fatal by the caller).
pub fn handle_user_page_fault(fault_addr: u64, error_code: PageFaultErrorCode) -> Option<Result<()>> {
	let core = core_local::core_local();
	let thread = core.scheduler().current_thread()?;
	let address_space = thread.address_space.as_ref()?;
	Some(address_space.handle_page_fault(fault_addr, error_code, &crate::mm::FRAME_ALLOCATOR))
}

/// Entry point for a core's reaper thread: reap whatever `terminate`
/// handed off, then block again until woken for the next batch. Never
/// calls `terminate` on itself, satisfying the invariant that the reaper
/// can't reach `Zombie` (spec.md §9).
pub fn reaper_main(core_idx: usize) -> ! {
	let sched = scheduler();
	loop {
		sched.reap(core_idx);
		sched.block(core_idx);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn thread(id: ThreadId) -> Arc<Thread> {
		Thread::new(id, 0, 0, 0, None)
	}

	fn core() -> CoreScheduler {
		CoreScheduler::new(0, thread(900), thread(901))
	}

	#[test]
	fn steal_one_takes_from_the_lowest_priority_queue_tail() {
		let sched = core();
		sched.ready[0].lock().push_back(thread(1));
		sched.ready[2].lock().push_back(thread(2));
		sched.ready[2].lock().push_back(thread(3));
		let stolen = sched.steal_one().unwrap();
		assert_eq!(stolen.id, 3);
	}

	/// A victim level whose lock is currently held (another thief, or the
	/// victim core itself mid-`pop_ready`/`enqueue_ready`) must be skipped,
	/// never waited on.
	#[test]
	fn steal_one_skips_a_level_whose_lock_is_currently_held() {
		let sched = core();
		sched.ready[MLFQ_LEVELS - 1].lock().push_back(thread(1));
		sched.ready[MLFQ_LEVELS - 2].lock().push_back(thread(2));
		let held = sched.ready[MLFQ_LEVELS - 1].lock();
		let stolen = sched.steal_one().unwrap();
		assert_eq!(stolen.id, 2);
		drop(held);
	}

	#[test]
	fn steal_one_returns_none_when_every_queue_is_empty_or_held() {
		let sched = core();
		let _held = sched.ready[MLFQ_LEVELS - 1].lock();
		assert!(sched.steal_one().is_none());
	}
}
