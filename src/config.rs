//! Tunables shared across the memory, scheduling and IPI cores.

/// Size in bytes of the base (smallest) page granularity.
pub const BASE_PAGE_SIZE: usize = 0x1000;

/// Number of MLFQ priority levels.
pub const MLFQ_LEVELS: usize = 4;

/// Time slice, in ticks, granted to a thread at each MLFQ level.
pub const TIME_SLICES: [u32; MLFQ_LEVELS] = [10, 20, 40, 80];

/// How often (in ticks) `Scheduler::boost_all` is invoked.
pub const PRIORITY_BOOST_INTERVAL: u64 = 4000;

/// Iterations of busy-spin a `Mutex::lock` slow path attempts before
/// parking the calling thread.
pub const SPIN_LIMIT: u32 = 1000;

/// Number of pointers buffered per-CPU before a `KernelHeap` class lock
/// is acquired to return them to their slabs.
pub const FREE_BATCH_SIZE: usize = 32;

/// Maximum number of freed single frames cached per-CPU by the
/// `PhysicalFrameAllocator` before a flush to the bitmap.
pub const FRAME_STACK_CACHE_SIZE: usize = 512;

/// SLUB size classes, geometrically spaced powers of two starting at 16
/// bytes: twelve size classes spaced geometrically from 16 up.
pub const HEAP_SIZE_CLASSES: [usize; 12] =
	[16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768];

/// Number of PCID slots per CPU. Slot 0 is reserved for the kernel.
pub const PCID_SLOT_COUNT: usize = 4096;

/// Upper bound on the number of CPUs this build supports. Used to size
/// fixed per-CPU tables without dynamic topology discovery at compile
/// time.
pub const MAX_CPUS: usize = 256;

/// First vector number handed out to platform (non-exception) interrupt
/// sources. Vectors below this are reserved for CPU exceptions. This
/// vector itself is the timer tick; routed device vectors start at
/// `FIRST_PLATFORM_VECTOR + 1`.
pub const FIRST_PLATFORM_VECTOR: u8 = 32;

/// Number of consecutive vectors, starting at `FIRST_PLATFORM_VECTOR + 1`,
/// wired to generic dispatch stubs for legacy ISA and PCI-routed device
/// interrupts. Matches the ISA's 16 legacy IRQ lines.
pub const ROUTED_VECTOR_COUNT: u8 = 16;

/// Vector used for TLB shootdown IPIs.
pub const TLB_SHOOTDOWN_VECTOR: u8 = 0xf0;

/// Vector used for reschedule IPIs.
pub const RESCHEDULE_VECTOR: u8 = 0xf1;

/// Vector used for remote function call IPIs.
pub const REMOTE_CALL_VECTOR: u8 = 0xf2;

/// Vector used to stop a remote core (panic propagation).
pub const STOP_VECTOR: u8 = 0xf3;

/// Vector reserved for the spurious interrupt handler.
pub const SPURIOUS_VECTOR: u8 = 0xff;

/// Lowest and highest valid protection-key values.
pub const MAX_PROTECTION_KEY: u8 = 15;
