//! Utility macros.

/// Prints to the kernel console.
///
/// Equivalent to the [`kprintln!`] macro except that a newline is not printed
/// at the end of the message.
#[macro_export]
macro_rules! kprint {
    () => ($crate::console::_print_timestamp());
    ($($arg:tt)*) => ({
        $crate::console::_print_timestamp();
        $crate::console::_print(format_args!($($arg)*));
    });
}

/// Prints to the kernel console with a newline (`\n`).
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)+) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}

/// Prints a line continuation to the kernel console.
///
/// No extra characters (eg. timestamp) will be prepended to the line.
#[macro_export]
macro_rules! kprintc {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

/// Prints an unconditional kernel message.
#[macro_export]
macro_rules! pr {
    ($($arg:tt)*) => ($crate::kprintln!($($arg)*));
}

/// Prints a warning-level message.
#[macro_export]
macro_rules! pr_warn {
    ($($arg:tt)*) => {
        if $crate::console::loglevel() >= $crate::console::LOGLEVEL_WARN {
            $crate::kprintln!($($arg)*);
        }
    };
}

/// Prints an info-level message.
#[macro_export]
macro_rules! pr_info {
    ($($arg:tt)*) => {
        if $crate::console::loglevel() >= $crate::console::LOGLEVEL_INFO {
            $crate::kprintln!($($arg)*);
        }
    };
}

/// Prints a debug-level message.
#[macro_export]
macro_rules! pr_dbg {
    ($($arg:tt)*) => {
        if $crate::console::loglevel() >= $crate::console::LOGLEVEL_DBG {
            $crate::kprintln!($($arg)*);
        }
    };
}
