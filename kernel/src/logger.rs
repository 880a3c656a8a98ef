//! Kernel logger
//!
//! Backs the `log` facade with a platform-supplied byte sink (serial port,
//! early console). Formats on the stack, so it works before the allocator
//! and inside interrupt context.

use core::fmt::Write;
use log::{Level, LevelFilter, Metadata, Record};
use spin::Once;

/// Where log lines go. The platform installs one at boot.
pub trait LogSink: Send + Sync {
    fn write_bytes(&self, bytes: &[u8]);
}

static SINK: Once<&'static dyn LogSink> = Once::new();

struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    pos: usize,
}

impl Write for BufferWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let room = self.buffer.len() - self.pos;
        let n = bytes.len().min(room);
        self.buffer[self.pos..self.pos + n].copy_from_slice(&bytes[..n]);
        self.pos += n;
        Ok(())
    }
}

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        SINK.get().is_some()
    }

    fn log(&self, record: &Record) {
        let Some(sink) = SINK.get() else { return };
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        // Long lines are truncated rather than allocated for.
        let mut buf = [0u8; 512];
        let pos = {
            let mut writer = BufferWriter { buffer: &mut buf, pos: 0 };
            let _ = write!(writer, "[{}] {}\n", level, record.args());
            writer.pos
        };
        sink.write_bytes(&buf[..pos]);
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Route the `log` macros to `sink`. Call once, early in boot.
pub fn init(sink: &'static dyn LogSink, level: LevelFilter) {
    SINK.call_once(|| sink);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
