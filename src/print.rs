//! `print` macros and the kernel logger, writing to a platform console.

use crate::sync::{spin_lock, Once, SpinLock};
use core::fmt::{self, Arguments};

/// The output device used by the logger and the `print` macros.
pub trait Console: Sync {
    /// Writes the string to the device.
    fn write_str(&self, s: &str);
}

static CONSOLE: Once<&'static dyn Console> = Once::new();

/// Serializes lines written by different harts.
static PRINT_LOCK: SpinLock<()> = spin_lock(());

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

struct Writer(&'static dyn Console);

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: Arguments<'_>) {
    use core::fmt::Write;

    // output before `init_logging` goes nowhere
    if let Some(console) = CONSOLE.get() {
        let _guard = PRINT_LOCK.lock();
        // `Writer` never fails
        let _ = Writer(*console).write_fmt(args);
    }
}

struct Logger;

impl log::Log for Logger {
    #[allow(unused_variables)]
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        #[cfg(any(debug_assertions, feature = "logging"))]
        return true;
        #[cfg(all(not(debug_assertions), not(feature = "logging")))]
        return metadata.level() <= log::Level::Info;
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let mod_path = record
                .module_path_static()
                .or_else(|| record.module_path())
                .unwrap_or("<n/a>");

            println!("[ {:>5} ] [{}] {}", record.level(), mod_path, record.args());
        }
    }

    fn flush(&self) {}
}

/// Route the `log` macros and `print!` to `console`.
pub fn init_logging(console: &'static dyn Console) -> Result<(), log::SetLoggerError> {
    CONSOLE.call_once(|| console);
    log::set_logger(&Logger)?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}
