//! Timer facade: a min-heap of one-shot and periodic callbacks driven by
//! the scheduler's tick interrupt, used for sleep wakeups and any other
//! deadline-based work that doesn't warrant its own interrupt vector.

use core::cmp::Reverse;

use alloc::boxed::Box;
use alloc::collections::BinaryHeap;
use hermit_sync::InterruptTicketMutex;

pub type TimerCallback = fn();

/// A one-shot/periodic callback is either a bare function pointer (the
/// common case: re-armed periodics, simple wakeups with no state to
/// capture) or a boxed closure for callers that need to carry an
/// argument — e.g. `Mutex::lock`'s timeout arm, which must unblock one
/// specific thread id.
enum Callback {
	Fn(TimerCallback),
	Boxed(Box<dyn FnOnce() + Send>),
}

impl Callback {
	fn invoke(self) {
		match self {
			Callback::Fn(f) => f(),
			Callback::Boxed(f) => f(),
		}
	}
}

struct TimerEntry {
	deadline: u64,
	period: Option<u64>,
	callback: Callback,
}

impl PartialEq for TimerEntry {
	fn eq(&self, other: &Self) -> bool {
		self.deadline == other.deadline
	}
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
	fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for TimerEntry {
	fn cmp(&self, other: &Self) -> core::cmp::Ordering {
		self.deadline.cmp(&other.deadline)
	}
}

pub struct Timer {
	heap: InterruptTicketMutex<BinaryHeap<Reverse<TimerEntry>>>,
}

impl Timer {
	pub const fn new() -> Self {
		Self { heap: InterruptTicketMutex::new(BinaryHeap::new()) }
	}

	pub fn schedule_once(&self, deadline: u64, callback: TimerCallback) {
		self.heap.lock().push(Reverse(TimerEntry { deadline, period: None, callback: Callback::Fn(callback) }));
	}

	/// One-shot variant for callers that must capture state (e.g. a thread
	/// id to unblock). Never re-armed, so there is no periodic counterpart.
	pub fn schedule_once_boxed(&self, deadline: u64, callback: Box<dyn FnOnce() + Send>) {
		self.heap.lock().push(Reverse(TimerEntry { deadline, period: None, callback: Callback::Boxed(callback) }));
	}

	pub fn schedule_periodic(&self, first_deadline: u64, period: u64, callback: TimerCallback) {
		self.heap
			.lock()
			.push(Reverse(TimerEntry { deadline: first_deadline, period: Some(period), callback: Callback::Fn(callback) }));
	}

	/// Fires every entry whose deadline has passed, re-arming periodic
	/// ones. Called once per tick from the scheduler's timer interrupt
	/// handler.
	pub fn fire(&self, now: u64) {
		loop {
			let due = {
				let mut heap = self.heap.lock();
				match heap.peek() {
					Some(Reverse(entry)) if entry.deadline <= now => heap.pop().map(|Reverse(e)| e),
					_ => None,
				}
			};
			let Some(entry) = due else { break };
			// A periodic entry is always `Callback::Fn` (a boxed one-shot
			// has nothing sensible to re-arm with), so grab a copy of the
			// function pointer before `invoke` consumes the callback.
			let rearm = match (&entry.callback, entry.period) {
				(Callback::Fn(f), Some(period)) => Some((*f, entry.deadline + period, period)),
				_ => None,
			};
			entry.callback.invoke();
			if let Some((f, deadline, period)) = rearm {
				self.heap.lock().push(Reverse(TimerEntry { deadline, period: Some(period), callback: Callback::Fn(f) }));
			}
		}
	}

	pub fn next_deadline(&self) -> Option<u64> {
		self.heap.lock().peek().map(|Reverse(e)| e.deadline)
	}
}

impl Default for Timer {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use core::sync::atomic::{AtomicU32, Ordering};

	static FIRE_COUNT: AtomicU32 = AtomicU32::new(0);
	fn bump() {
		FIRE_COUNT.fetch_add(1, Ordering::Relaxed);
	}

	#[test]
	fn one_shot_fires_once() {
		FIRE_COUNT.store(0, Ordering::Relaxed);
		let timer = Timer::new();
		timer.schedule_once(10, bump);
		timer.fire(5);
		assert_eq!(FIRE_COUNT.load(Ordering::Relaxed), 0);
		timer.fire(10);
		assert_eq!(FIRE_COUNT.load(Ordering::Relaxed), 1);
		timer.fire(20);
		assert_eq!(FIRE_COUNT.load(Ordering::Relaxed), 1);
	}

	#[test]
	fn periodic_rearms() {
		FIRE_COUNT.store(0, Ordering::Relaxed);
		let timer = Timer::new();
		timer.schedule_periodic(10, 10, bump);
		timer.fire(10);
		timer.fire(20);
		timer.fire(30);
		assert_eq!(FIRE_COUNT.load(Ordering::Relaxed), 3);
	}

	#[test]
	fn next_deadline_reports_the_soonest() {
		let timer = Timer::new();
		timer.schedule_once(50, bump);
		timer.schedule_once(20, bump);
		assert_eq!(timer.next_deadline(), Some(20));
	}
}
