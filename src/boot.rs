//! Types describing the data the bootloader collaborator hands the
//! kernel at entry.
//!
//! Nothing in this module parses a bootloader's on-disk or wire format;
//! it only defines the shape that collaborator is expected to fill in.
//! Bootloader handoff itself is out of scope for this crate.

/// Kind of a physical memory map entry, as classified by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
	Usable,
	BootloaderReclaimable,
	ExecutableAndModules,
	AcpiReclaimable,
	AcpiNvs,
	AcpiTables,
	Framebuffer,
	Reserved,
}

/// One contiguous physical memory range from the bootloader's memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
	pub base: u64,
	pub length: u64,
	pub kind: MemoryKind,
}

impl MemoryMapEntry {
	pub fn end(&self) -> u64 {
		self.base + self.length
	}
}

/// Per-CPU entry of the SMP descriptor.
#[derive(Debug, Clone, Copy)]
pub struct SmpProcessor {
	pub processor_id: u32,
	pub apic_id: u32,
	pub goto_address: u64,
	pub extra_argument: u64,
}

/// The SMP descriptor the bootloader hands over: one entry per detected
/// CPU plus which of them is the boot-strap processor.
#[derive(Debug, Clone)]
pub struct SmpDescriptor {
	pub bsp_apic_id: u32,
	pub processors: alloc::vec::Vec<SmpProcessor>,
}

/// Everything the kernel core needs out of bring-up before it can
/// initialize the physical frame allocator and kernel page map.
#[derive(Debug, Clone)]
pub struct BootInfo {
	pub memory_map: alloc::vec::Vec<MemoryMapEntry>,
	/// Offset added to a physical address to reach its mapping in the
	/// higher-half direct map (HHDM).
	pub hhdm_offset: u64,
	pub rsdp: Option<u64>,
	pub kernel_phys_base: u64,
	pub kernel_virt_base: u64,
	pub kernel_image: &'static [u8],
	pub smp: Option<SmpDescriptor>,
}

impl BootInfo {
	/// Sum of the length of all `Usable` regions below `kernel_end`, used
	/// only for sanity logging — the frame allocator derives its real
	/// accounting from walking the map itself.
	pub fn usable_bytes(&self) -> u64 {
		self.memory_map
			.iter()
			.filter(|e| e.kind == MemoryKind::Usable)
			.map(|e| e.length)
			.sum()
	}
}
