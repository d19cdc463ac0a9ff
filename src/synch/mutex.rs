//! Adaptive mutex (spec.md §4.10): try a lock-free acquire, spin briefly
//! under contention, then mark the lock contended and block until
//! handed off or a timeout fires.
//!
//! Split into a non-generic `RawMutex` (the atomic state and FIFO
//! wait-list) and a generic `Mutex<T>` wrapper around it. The timeout
//! arm of `lock` boxes a closure that must reach back into the mutex's
//! wait-list from a timer callback with no useful lifetime to borrow
//! through; `RawMutex` gives that closure a `'static`-shaped target to
//! point at instead of fighting the borrow checker over `T`.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use hermit_sync::InterruptTicketMutex;

use crate::arch;
use crate::config::SPIN_LIMIT;
use crate::error::{KernelError, Result};
use crate::scheduler::task::ThreadId;
use crate::scheduler::scheduler;

const FREE: u8 = 0;
const LOCKED: u8 = 1;
const LOCKED_WITH_WAITERS: u8 = 2;

struct Waiter {
	tid: ThreadId,
	timed_out: Arc<AtomicBool>,
}

/// The lock's state and wait-list, with no data to protect. Lives
/// embedded in `Mutex<T>`, but addressed on its own by the timeout
/// closure armed in the slow path.
struct RawMutex {
	state: AtomicU8,
	waiters: InterruptTicketMutex<VecDeque<Waiter>>,
}

impl RawMutex {
	const fn new() -> Self {
		Self { state: AtomicU8::new(FREE), waiters: InterruptTicketMutex::new(VecDeque::new()) }
	}

	fn try_acquire(&self) -> bool {
		self.state.compare_exchange(FREE, LOCKED, Ordering::Acquire, Ordering::Relaxed).is_ok()
	}

	/// Removes a specific waiter by thread id, wherever it sits in the
	/// queue. Used by the timeout path, which cannot assume its waiter is
	/// still at the front; idempotent so the woken thread's own cleanup
	/// and a racing timer never double-act on the same entry.
	fn remove_waiter(&self, tid: ThreadId) -> bool {
		let mut waiters = self.waiters.lock();
		if let Some(pos) = waiters.iter().position(|w| w.tid == tid) {
			waiters.remove(pos);
			true
		} else {
			false
		}
	}

	/// Blocking acquire with an optional timeout, in scheduler ticks.
	/// `None` blocks indefinitely.
	fn lock(&self, timeout_ticks: Option<u64>) -> Result<()> {
		if self.try_acquire() {
			return Ok(());
		}

		loop {
			let mut spins = 0u32;
			let core_idx = arch::core_id() as usize;
			while self.state.load(Ordering::Relaxed) == LOCKED && spins < SPIN_LIMIT {
				scheduler().yield_now(core_idx);
				spins += 1;
			}
			if self.try_acquire() {
				return Ok(());
			}
			// Mark contention; a failed CAS here just means the lock was
			// released or another spinner already marked it, either of
			// which we recheck for below.
			let _ = self.state.compare_exchange(LOCKED, LOCKED_WITH_WAITERS, Ordering::Relaxed, Ordering::Relaxed);
			if self.try_acquire() {
				return Ok(());
			}

			let current = scheduler().core(core_idx).current_thread().expect("lock called with no current thread");
			let tid = current.id;
			let timed_out = Arc::new(AtomicBool::new(false));
			self.waiters.lock().push_back(Waiter { tid, timed_out: timed_out.clone() });

			if let Some(ticks) = timeout_ticks {
				let core = scheduler().core(core_idx);
				let deadline = core.current_tick() + ticks;
				let self_addr = self as *const RawMutex as usize;
				let timer_timed_out = timed_out.clone();
				core.timer.schedule_once_boxed(
					deadline,
					Box::new(move || {
						// Safety: `RawMutex`es embedded in a `Mutex<T>` live
						// for the program's duration; nothing ever drops one.
						let raw = unsafe { &*(self_addr as *const RawMutex) };
						if raw.remove_waiter(tid) {
							timer_timed_out.store(true, Ordering::Relaxed);
							scheduler().unblock(tid);
						}
					}),
				);
			}

			scheduler().block(core_idx);

			// Whichever path woke us — a handoff from `unlock`, or the
			// timeout firing — make sure we're off the list before
			// re-checking why we woke.
			self.remove_waiter(tid);

			if timed_out.load(Ordering::Relaxed) {
				return Err(KernelError::Timeout);
			}
			// Lost the race to another spinner; loop back and try again.
		}
	}

	fn unlock(&self) {
		let prev = self.state.fetch_sub(1, Ordering::Release);
		if prev == LOCKED {
			return;
		}
		debug_assert_eq!(prev, LOCKED_WITH_WAITERS, "unlock called on an already-free mutex");
		self.state.store(FREE, Ordering::Release);
		if let Some(waiter) = self.waiters.lock().pop_front() {
			scheduler().unblock(waiter.tid);
		}
	}
}

unsafe impl Sync for RawMutex {}

/// Priority-inversion-safe adaptive mutex with timed waiting (spec.md
/// §4.10). Safe to use from any suspending context; interrupt handlers
/// must not call `lock`.
pub struct Mutex<T: ?Sized> {
	raw: RawMutex,
	data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
	pub const fn new(data: T) -> Self {
		Self { raw: RawMutex::new(), data: UnsafeCell::new(data) }
	}

	pub fn into_inner(self) -> T {
		self.data.into_inner()
	}
}

impl<T: ?Sized> Mutex<T> {
	/// Blocks until the lock is acquired.
	pub fn lock(&self) -> MutexGuard<'_, T> {
		self.raw.lock(None).expect("unbounded lock never times out");
		MutexGuard { mutex: self }
	}

	/// Blocks until the lock is acquired or `timeout_ticks` scheduler
	/// ticks elapse, whichever comes first.
	pub fn lock_timeout(&self, timeout_ticks: u64) -> Result<MutexGuard<'_, T>> {
		self.raw.lock(Some(timeout_ticks))?;
		Ok(MutexGuard { mutex: self })
	}

	pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
		self.raw.try_acquire().then_some(MutexGuard { mutex: self })
	}
}

impl<T: ?Sized + Default> Default for Mutex<T> {
	fn default() -> Self {
		Self::new(T::default())
	}
}

pub struct MutexGuard<'a, T: ?Sized> {
	mutex: &'a Mutex<T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
	type Target = T;
	fn deref(&self) -> &T {
		unsafe { &*self.mutex.data.get() }
	}
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.mutex.data.get() }
	}
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
	fn drop(&mut self) {
		self.mutex.raw.unlock();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn uncontended_lock_round_trips_the_value() {
		let mutex = Mutex::new(41);
		{
			let mut guard = mutex.lock();
			*guard += 1;
		}
		assert_eq!(*mutex.lock(), 42);
	}

	#[test]
	fn try_lock_fails_while_held() {
		let mutex = Mutex::new(0);
		let guard = mutex.lock();
		assert!(mutex.try_lock().is_none());
		drop(guard);
		assert!(mutex.try_lock().is_some());
	}
}
