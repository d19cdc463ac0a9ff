//! A `log::Log` implementation that writes formatted records through a
//! narrow [`Sink`] trait, kept separate from the concrete UART driver
//! since device drivers are out of scope for this crate — they remain
//! narrow-interface collaborators reached only through `Sink`.

use core::fmt::Write;

use hermit_sync::OnceCell;
use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::arch::core_id;

/// Anything the logger can write formatted records to. Implementors own
/// their own interior synchronization (the serial driver guards its port
/// behind a spinlock; tests guard an in-memory buffer the same way).
pub trait Sink: Sync {
	fn write_str(&self, s: &str);
}

struct SinkWriter<'a>(&'a dyn Sink);

impl Write for SinkWriter<'_> {
	fn write_str(&mut self, s: &str) -> core::fmt::Result {
		self.0.write_str(s);
		Ok(())
	}
}

pub struct KernelLogger {
	sink: OnceCell<&'static dyn Sink>,
}

static LOGGER: KernelLogger = KernelLogger {
	sink: OnceCell::new(),
};

impl Log for KernelLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= log::max_level() && self.sink.get().is_some()
	}

	fn log(&self, record: &Record<'_>) {
		let Some(sink) = self.sink.get() else {
			return;
		};
		if !self.enabled(record.metadata()) {
			return;
		}
		let mut writer = SinkWriter(*sink);
		let _ = writeln!(writer, "[{}][{}] {}", core_id(), record.level(), record.args());
	}

	fn flush(&self) {}
}

/// Installs the global logger with the given sink and level filter.
///
/// Idempotent: a second call only updates the level filter, since
/// `log::set_logger` cannot be called twice and every CPU shares the
/// same sink.
pub fn init(sink: &'static dyn Sink, filter: LevelFilter) {
	log::set_max_level(filter);
	if LOGGER.sink.get().is_some() {
		return;
	}
	LOGGER.sink.set(sink).ok();
	log::set_logger(&LOGGER).expect("logger installed twice");
}

/// Default level used until `init` runs: informational output without
/// debug noise.
pub const DEFAULT_LEVEL: LevelFilter = Level::Info.to_level_filter();
