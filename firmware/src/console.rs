//! Console output
//!
//! Log records and echoed bytes share one byte console. The console is
//! registered once at start-up; until then output is dropped.

use core::fmt;
use embedded_io::{Error, ErrorKind, ErrorType, Write};
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Byte-level console output
pub trait ConsoleWrite: Send {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ErrorKind>;
}

impl<W: Write + Send> ConsoleWrite for W {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ErrorKind> {
        self.write_all(bytes).map_err(|e| e.kind())
    }
}

/// A registered console
pub type Console = &'static mut dyn ConsoleWrite;

static CONSOLE: Mutex<Option<Console>> = Mutex::new(None);

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Formats log lines onto a console
struct Lines<'a>(&'a mut dyn ConsoleWrite);

impl fmt::Write for Lines<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_bytes(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

/// `log` backend writing `[LEVEL] target: message` lines to the console
pub struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(console) = CONSOLE.lock().as_mut() {
            // Nowhere left to report a failing console
            let _ = fmt::write(
                &mut Lines(&mut **console),
                format_args!(
                    "[{}] {}: {}\r\n",
                    record.level(),
                    record.target(),
                    record.args()
                ),
            );
        }
    }

    fn flush(&self) {}
}

/// Register `console` and install the logger.
///
/// Calling this again swaps the console; the logger stays installed.
pub fn init(console: Console, level: LevelFilter) {
    *CONSOLE.lock() = Some(console);
    // Already installed on a second call
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Raw writer onto the console, for echoed client bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl ErrorType for ConsoleSink {
    type Error = ErrorKind;
}

impl Write for ConsoleSink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorKind> {
        if let Some(console) = CONSOLE.lock().as_mut() {
            console.write_bytes(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), ErrorKind> {
        Ok(())
    }
}
