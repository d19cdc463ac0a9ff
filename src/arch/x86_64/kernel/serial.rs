//! A narrow [`crate::logging::Sink`] over a 16550 UART, the kernel's only
//! output path before a real console driver attaches (out of scope, per
//! spec.md §1).

use core::cell::UnsafeCell;

use hermit_sync::InterruptTicketMutex;
use uart_16550::SerialPort;

use crate::logging::Sink;

pub struct SerialSink {
	port: InterruptTicketMutex<UnsafeCell<SerialPort>>,
}

// `SerialPort` is only ever touched behind the mutex above.
unsafe impl Sync for SerialSink {}

impl SerialSink {
	/// # Safety
	/// `io_port` must be a valid, exclusively-owned serial port address.
	pub const unsafe fn new(io_port: u16) -> Self {
		Self { port: InterruptTicketMutex::new(UnsafeCell::new(unsafe { SerialPort::new(io_port) })) }
	}

	pub fn enable(&self) {
		let guard = self.port.lock();
		unsafe { (*guard.get()).init() };
	}
}

impl Sink for SerialSink {
	fn write_str(&self, s: &str) {
		use core::fmt::Write;
		let guard = self.port.lock();
		let _ = unsafe { (*guard.get()).write_str(s) };
	}
}
