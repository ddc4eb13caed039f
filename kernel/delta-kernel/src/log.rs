//! Kernel logging infrastructure.
//!
//! Two phases:
//!
//! **Phase 1 — early serial (pre-heap):** [`init_early_serial`] registers
//! lock-free print/log functions that write straight to COM1. All output
//! during PMM, VMM, and heap init goes through this path.
//!
//! **Phase 2 — full logger (post-heap):** [`init_logger`] installs a
//! [`Logger`] with a sink list behind a spin lock; the serial sink and the
//! ring-log sink are registered by default.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use delta_core::log::LogLevel;
use delta_core::sync::SpinLock;

use crate::drivers::uart16550::{COM1, Uart16550};
use crate::obj::klog::KLOG;

/// A dyn-compatible output sink for the kernel logger.
pub trait LogSink: Send + Sync {
    /// Writes a string fragment to this sink.
    fn write_str(&self, s: &str);
    /// Maximum level accepted (`level <= max_level` is written).
    fn max_level(&self) -> LogLevel;
    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;
}

/// A [`LogSink`] writing to a 16550 UART.
pub struct SerialSink {
    uart: Uart16550,
    max_level: LogLevel,
}

impl SerialSink {
    /// Creates a new serial sink.
    pub fn new(uart: Uart16550, max_level: LogLevel) -> Self {
        Self { uart, max_level }
    }
}

impl LogSink for SerialSink {
    fn write_str(&self, s: &str) {
        self.uart.write_str(s);
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "serial"
    }
}

/// A [`LogSink`] mirroring every line into the `$kernel/log` ring.
pub struct KlogSink {
    max_level: LogLevel,
}

impl KlogSink {
    /// Creates a new ring-log sink.
    pub fn new(max_level: LogLevel) -> Self {
        Self { max_level }
    }
}

impl LogSink for KlogSink {
    fn write_str(&self, s: &str) {
        KLOG.write_bytes(s.as_bytes());
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "klog"
    }
}

// ---------------------------------------------------------------------------
// Early serial functions (phase 1, pre-heap)
// ---------------------------------------------------------------------------

struct SerialWriter(Uart16550);

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

fn early_serial_print(args: fmt::Arguments<'_>) {
    let mut w = SerialWriter(Uart16550::new(COM1));
    let _ = w.write_fmt(args);
}

fn early_serial_log(level: LogLevel, args: fmt::Arguments<'_>) {
    let mut w = SerialWriter(Uart16550::new(COM1));
    let _ = write!(w, "[{}] {} {}\n", crate::time::ticks(), level.name(), args);
}

/// Registers the lock-free early serial functions. Call after UART init,
/// before any `kprint!`/`klog!` use.
pub fn init_early_serial() {
    Uart16550::new(COM1).init();
    // SAFETY: Both functions build the UART handle on the stack and write
    // bytes; they are safe from any context.
    unsafe {
        delta_core::log::set_print_fn(early_serial_print);
        delta_core::log::set_log_fn(early_serial_log);
    }
}

// ---------------------------------------------------------------------------
// Full logger (phase 2, post-heap)
// ---------------------------------------------------------------------------

struct LoggerInner {
    sinks: Vec<Box<dyn LogSink>>,
}

/// The kernel logger: a fan-out over registered sinks.
pub struct Logger {
    inner: SpinLock<Option<LoggerInner>>,
}

impl Logger {
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    fn init_default_sinks(&self) {
        let mut sinks: Vec<Box<dyn LogSink>> = Vec::with_capacity(4);
        sinks.push(Box::new(SerialSink::new(
            Uart16550::new(COM1),
            LogLevel::Trace,
        )));
        sinks.push(Box::new(KlogSink::new(LogLevel::Debug)));
        *self.inner.lock() = Some(LoggerInner { sinks });

        // SAFETY: The logger functions are safe from any context; the lock
        // is only held for the fan-out.
        unsafe {
            delta_core::log::set_print_fn(logger_print);
            delta_core::log::set_log_fn(logger_log);
        }
    }

    fn add_sink(&self, sink: Box<dyn LogSink>) {
        if let Some(inner) = self.inner.lock().as_mut() {
            inner.sinks.push(sink);
        }
    }

    fn write_fmt(&self, args: fmt::Arguments<'_>) {
        let guard = self.inner.lock();
        if let Some(inner) = guard.as_ref() {
            for sink in &inner.sinks {
                let mut w = SinkWriter(sink.as_ref());
                let _ = fmt::Write::write_fmt(&mut w, args);
            }
        }
    }

    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        let nanos = crate::time::boot_nanos();
        let secs = nanos / 1_000_000_000;
        let micros = (nanos / 1_000) % 1_000_000;

        let guard = self.inner.lock();
        if let Some(inner) = guard.as_ref() {
            for sink in &inner.sinks {
                if level <= sink.max_level() {
                    let mut w = SinkWriter(sink.as_ref());
                    let _ = write!(w, "[{secs:>5}.{micros:06}] {} {args}\n", level.name());
                }
            }
        }
    }
}

struct SinkWriter<'a>(&'a dyn LogSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// Global logger instance.
pub static LOGGER: Logger = Logger::new();

fn logger_print(args: fmt::Arguments<'_>) {
    LOGGER.write_fmt(args);
}

fn logger_log(level: LogLevel, args: fmt::Arguments<'_>) {
    LOGGER.log(level, args);
}

/// Installs the full logger (requires the heap). The early serial
/// functions are replaced without losing output.
pub fn init_logger() {
    LOGGER.init_default_sinks();
}

/// Registers an additional sink.
pub fn add_sink(sink: Box<dyn LogSink>) {
    LOGGER.add_sink(sink);
}

/// Writes a panic message straight to COM1: no locks, no allocation, safe
/// while the logger lock may be held by the panicking context.
pub fn panic_serial(info: &core::panic::PanicInfo<'_>) {
    let mut w = SerialWriter(Uart16550::new(COM1));
    let _ = write!(w, "\n!!! KERNEL PANIC !!!\n{info}\n");
}
