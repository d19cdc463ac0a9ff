pub mod apic;
pub mod core_local;
pub mod gdt;
pub mod idt;
pub mod interrupts;
pub mod processor;
pub mod serial;
