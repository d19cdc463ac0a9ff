//! Architecture dispatch layer. `x86_64` is the only backend this crate
//! targets, but callers reach it through this module so the seam exists
//! where a second backend would plug in.

pub mod x86_64;

pub use self::x86_64::core_id;
