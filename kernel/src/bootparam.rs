//! Boot command line handling.
//!
//! The command line arrives via the FDT `/chosen` `bootargs` property as
//! space-separated `name` or `name=value` tokens. Each recognized name has a
//! handler; unknown names are ignored so that the same command line can be
//! shared with a different kernel generation.

use crate::{console, memtest, mm::kheap, task::process, timer, ttp};

struct BootParam {
    name: &'static str,
    parse: fn(Option<&str>),
}

static BOOTPARAMS: &[BootParam] = &[
    BootParam {
        name: "memtest",
        parse: memtest::parse_memtest,
    },
    BootParam {
        name: "init",
        parse: process::parse_init,
    },
    BootParam {
        name: "console",
        parse: console::parse_console,
    },
    BootParam {
        name: "loglevel",
        parse: console::parse_loglevel,
    },
    BootParam {
        name: "kheap_size",
        parse: kheap::parse_kheap_size,
    },
    BootParam {
        name: "malloc_fsck",
        parse: kheap::parse_malloc_fsck,
    },
    BootParam {
        name: "timer_hz",
        parse: timer::parse_timer_hz,
    },
    BootParam {
        name: "ttp_maxevents",
        parse: ttp::parse_maxevents,
    },
];

fn parse_token(token: &str) {
    let (name, arg) = match token.split_once('=') {
        Some((name, arg)) => (name, Some(arg)),
        None => (token, None),
    };

    for param in BOOTPARAMS {
        if param.name == name {
            (param.parse)(arg);
        }
    }
}

/// Parses the boot command line, dispatching every recognized parameter.
pub fn init(bootargs: Option<&str>) {
    let bootargs = match bootargs {
        Some(args) => args,
        None => {
            pr_info!("bootparam: no bootargs provided");
            return;
        }
    };

    pr!("grinch cmdline: {}", bootargs);

    for token in bootargs.split(' ') {
        if !token.is_empty() {
            parse_token(token);
        }
    }
}

/// Parses a size argument with an optional `K`/`M`/`G` suffix.
pub fn parse_size(arg: &str) -> Option<usize> {
    let (digits, shift) = match arg.as_bytes().last()? {
        b'K' | b'k' => (&arg[..arg.len() - 1], 10),
        b'M' | b'm' => (&arg[..arg.len() - 1], 20),
        b'G' | b'g' => (&arg[..arg.len() - 1], 30),
        _ => (arg, 0),
    };

    let base: usize = digits.parse().ok()?;
    base.checked_shl(shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("16K"), Some(16 * 1024));
        assert_eq!(parse_size("2M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("1G"), Some(1 << 30));
        assert_eq!(parse_size("1g"), Some(1 << 30));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("x"), None);
        assert_eq!(parse_size("12Q"), None);
    }
}
