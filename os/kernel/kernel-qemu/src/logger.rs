use crate::qemu_fmt::QemuSink;
use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log` backend that writes `[LEVEL] target: message` lines to the debug port.
///
/// Filtering is done through [`log::max_level`], so the level can be raised
/// or lowered at runtime with [`log::set_max_level`].
pub struct QemuLogger;

static LOGGER: QemuLogger = QemuLogger;

/// Install the QEMU logger. Call this once during early init.
///
/// # Errors
/// Fails if another logger was installed before.
pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

impl QemuLogger {
    /// Format a record as a single output line.
    fn write_record<W: Write>(out: &mut W, record: &Record) -> fmt::Result {
        writeln!(
            out,
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = Self::write_record(&mut QemuSink, record);
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn record_line_format() {
        let mut out = String::new();
        let record = Record::builder()
            .level(Level::Warn)
            .target("kernel_alloc::pma")
            .args(format_args!("{} frames left", 3))
            .build();
        QemuLogger::write_record(&mut out, &record).unwrap();
        assert_eq!(out, "[WARN] kernel_alloc::pma: 3 frames left\n");
    }
}
