//! Error taxonomy shared by the memory, scheduling and IPI cores.

use thiserror::Error;

/// Propagation policy: allocation failures below the heap and
/// kernel-mode page faults are not represented here because callers in
/// that layer panic rather than unwind. Everything at or above the
/// heap, `UserAddressSpace`, and `Mutex` returns this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
	/// No physical frames, no virtual arena slot, no reusable PCID slot,
	/// or a heap size class could not be refilled.
	#[error("out of memory")]
	OutOfMemory,
	/// Zero count, misaligned alignment, out-of-range virtual address,
	/// or an unsupported page granularity was requested.
	#[error("invalid argument")]
	InvalidArgument,
	/// A page fault occurred against a region lacking the required
	/// permission bit.
	#[error("permission denied")]
	PermissionDenied,
	/// `free` on an address the heap does not own, or `unmap` of a
	/// virtual address backed by no region.
	#[error("not found")]
	NotFound,
	/// A `Mutex::lock` timer expired before the lock was acquired.
	#[error("timed out")]
	Timeout,
	/// A requested page granularity is not supported by this PageMap.
	#[error("huge pages unsupported")]
	NoHugePageSupport,
	/// The page-table walk reached a huge entry at a level finer
	/// granularity was requested through.
	#[error("address misaligned for requested granularity")]
	Misaligned,
}

pub type Result<T> = core::result::Result<T, KernelError>;

/// Errors that are never meant to propagate: the caller panics with full
/// diagnostic context instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FatalError {
	#[error("double fault")]
	DoubleFault,
	#[error("unhandled cpu exception vector {0}")]
	UnknownException(u8),
	#[error("corrupted task state segment or stack")]
	CorruptedStack,
}
