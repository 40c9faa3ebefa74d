//! Kernel console.
//!
//! Output starts on the SBI firmware console and is rebound to a devfs
//! character device during [`init`], selected by the `console=` boot
//! parameter or the FDT `stdout-path`. Everything written is also mirrored
//! into a fixed ring buffer, which keeps the most recent output inspectable
//! (and lets a host observe a guest's console in tests).

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::{string::String, sync::Arc};
use spin::Mutex;

use crate::fs::devfs::{self, DevfsNode};
use crate::ringbuf::RingBuf;
use crate::timer;

/// Messages at or below this level are always printed.
pub const LOGLEVEL_WARN: usize = 4;
/// Default level: informational boot messages.
pub const LOGLEVEL_INFO: usize = 6;
/// Verbose debugging.
pub const LOGLEVEL_DBG: usize = 8;

static LOGLEVEL: AtomicUsize = AtomicUsize::new(LOGLEVEL_INFO);

/// Bytes of console history retained for inspection.
const CONSOLE_RING_SIZE: usize = 4096;

struct Console {
    node: Option<Arc<DevfsNode>>,
    ring: RingBuf<CONSOLE_RING_SIZE>,
}

static CONSOLE: Mutex<Console> = Mutex::new(Console {
    node: None,
    ring: RingBuf::new(),
});

/// Name of the devfs node to bind the console to, from `console=`. Fixed
/// storage: boot parameters are parsed before the heap exists.
static CONSOLE_PARAM: Mutex<([u8; 32], usize)> = Mutex::new(([0; 32], 0));

/// Returns the current console loglevel.
pub fn loglevel() -> usize {
    LOGLEVEL.load(Ordering::Relaxed)
}

pub(crate) fn parse_loglevel(arg: Option<&str>) {
    if let Some(lvl) = arg.and_then(|a| a.parse().ok()) {
        if lvl <= 10 {
            LOGLEVEL.store(lvl, Ordering::Relaxed);
        }
    }
}

pub(crate) fn parse_console(arg: Option<&str>) {
    if let Some(name) = arg {
        let mut param = CONSOLE_PARAM.lock();
        let n = name.len().min(param.0.len());
        param.0[..n].copy_from_slice(&name.as_bytes()[..n]);
        param.1 = n;
    }
}

/// Writes a single byte to the console and its history ring.
pub fn putc(c: u8) {
    let mut con = CONSOLE.lock();
    con.ring.push(c);
    match &con.node {
        Some(node) => node.sink_write(&[c]),
        None => sbi::Console::putchar(c),
    }
}

/// Writes a string to the console.
pub fn puts(s: &str) {
    for c in s.bytes() {
        putc(c);
    }
}

/// Copies out the most recent console output.
pub fn recent_output(buf: &mut [u8]) -> usize {
    CONSOLE.lock().ring.peek(buf)
}

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        puts(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let _ = ConsoleWriter.write_fmt(args);
}

#[doc(hidden)]
pub fn _print_timestamp() {
    let ns = timer::get_wall_ns();
    let sec = ns / 1_000_000_000;
    let usec = (ns % 1_000_000_000) / 1_000;

    _print(format_args!("[{sec:5}.{usec:06}] "));
}

/// Binds the console to its final device.
///
/// Preference order: `console=` boot parameter, then the FDT `stdout-path`,
/// then `ttySBI`.
pub fn init(stdout_path: Option<&str>) -> crate::errno::Result<()> {
    let name = {
        let param = CONSOLE_PARAM.lock();
        if param.1 != 0 {
            String::from(core::str::from_utf8(&param.0[..param.1]).unwrap_or("ttySBI"))
        } else {
            let fallback = stdout_path
                .map(|p| p.rsplit('/').next().unwrap_or(p))
                .unwrap_or("ttySBI");
            String::from(fallback)
        }
    };

    // An unknown name (e.g. a raw stdout-path node) falls back to the
    // firmware console.
    let (name, node) = match devfs::lookup(&name) {
        Ok(node) => (name, node),
        Err(_) => (String::from("ttySBI"), devfs::lookup("ttySBI")?),
    };
    devfs::register_symlink("console", &name)?;

    pr_info!("console: using /dev/{}", name);
    CONSOLE.lock().node = Some(node);

    Ok(())
}
