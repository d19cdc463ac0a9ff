//! Immutable ACPI-derived topology snapshot: LAPIC, I/O APIC and
//! interrupt-source-override lists built once at boot and passed to
//! consumers, rather than left as global mutable state that every MADT
//! consumer pokes at independently.
//!
//! ACPI table parsing itself (MADT/FADT) is out of scope for this crate;
//! this module only holds the derived lists a parser would hand over.

use alloc::vec::Vec;

/// One entry of the MADT's Local APIC list.
#[derive(Debug, Clone, Copy)]
pub struct LocalApicDesc {
	pub processor_id: u8,
	pub apic_id: u8,
	pub enabled: bool,
}

/// One entry of the MADT's I/O APIC list.
#[derive(Debug, Clone, Copy)]
pub struct IoApicDesc {
	pub id: u8,
	pub address: u32,
	/// First Global System Interrupt handled by this I/O APIC.
	pub gsi_base: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
	ActiveHigh,
	ActiveLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
	Edge,
	Level,
}

/// An Interrupt Source Override: remaps a legacy ISA IRQ to a GSI with
/// optional polarity/trigger changes.
#[derive(Debug, Clone, Copy)]
pub struct IsoDesc {
	pub legacy_irq: u8,
	pub gsi: u32,
	pub polarity: Polarity,
	pub trigger_mode: TriggerMode,
}

/// The full derived topology, built once during bring-up and shared by
/// reference thereafter. Nothing mutates it after construction, so no
/// lock guards access.
#[derive(Debug, Clone)]
pub struct Topology {
	pub local_apics: Vec<LocalApicDesc>,
	pub io_apics: Vec<IoApicDesc>,
	pub isos: Vec<IsoDesc>,
}

impl Topology {
	pub fn processor_count(&self) -> usize {
		self.local_apics.iter().filter(|l| l.enabled).count()
	}

	/// Resolves a legacy ISA IRQ to its GSI and polarity/trigger,
	/// applying any matching Interrupt Source Override, falling back to
	/// the identity mapping (edge-triggered, active-high) the ISA bus
	/// assumes in the absence of an override.
	pub fn resolve_legacy_irq(&self, irq: u8) -> (u32, Polarity, TriggerMode) {
		for iso in &self.isos {
			if iso.legacy_irq == irq {
				return (iso.gsi, iso.polarity, iso.trigger_mode);
			}
		}
		(u32::from(irq), Polarity::ActiveHigh, TriggerMode::Edge)
	}

	/// Finds which I/O APIC owns a given GSI.
	pub fn io_apic_for_gsi(&self, gsi: u32) -> Option<&IoApicDesc> {
		self.io_apics
			.iter()
			.filter(|a| a.gsi_base <= gsi)
			.max_by_key(|a| a.gsi_base)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample() -> Topology {
		Topology {
			local_apics: alloc::vec![
				LocalApicDesc { processor_id: 0, apic_id: 0, enabled: true },
				LocalApicDesc { processor_id: 1, apic_id: 2, enabled: true },
				LocalApicDesc { processor_id: 2, apic_id: 4, enabled: false },
			],
			io_apics: alloc::vec![
				IoApicDesc { id: 0, address: 0xFEC0_0000, gsi_base: 0 },
				IoApicDesc { id: 1, address: 0xFEC1_0000, gsi_base: 24 },
			],
			isos: alloc::vec![IsoDesc {
				legacy_irq: 0,
				gsi: 2,
				polarity: Polarity::ActiveHigh,
				trigger_mode: TriggerMode::Edge,
			}],
		}
	}

	#[test]
	fn counts_only_enabled_processors() {
		assert_eq!(sample().processor_count(), 2);
	}

	#[test]
	fn resolves_iso_override() {
		let (gsi, _, _) = sample().resolve_legacy_irq(0);
		assert_eq!(gsi, 2);
	}

	#[test]
	fn falls_back_to_identity_mapping() {
		let (gsi, polarity, trigger) = sample().resolve_legacy_irq(5);
		assert_eq!(gsi, 5);
		assert_eq!(polarity, Polarity::ActiveHigh);
		assert_eq!(trigger, TriggerMode::Edge);
	}

	#[test]
	fn picks_correct_ioapic_for_gsi() {
		let topo = sample();
		assert_eq!(topo.io_apic_for_gsi(5).unwrap().id, 0);
		assert_eq!(topo.io_apic_for_gsi(30).unwrap().id, 1);
	}
}
