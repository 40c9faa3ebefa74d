//! Serial consoles.
//!
//! Every probed chip registers a `ttyS<N>` character device; the SBI
//! firmware console is always present as `ttySBI`. Received bytes go into
//! the device's ring buffer, transmit goes byte-at-a-time to the chip.

use fdt::{Fdt, Node};
use riscv::PhysAddr;
use spin::Mutex;

use alloc::sync::Arc;

use crate::drivers::irqchip;
use crate::errno::{Errno, Result};
use crate::fs::devfs::{self, DevfsNode};
use crate::mm::ioremap;
use crate::percpu::this_cpu_id;

fn sbi_tx(buf: &[u8]) {
    for c in buf {
        sbi::Console::putchar(*c);
    }
}

/// Registers the firmware console device.
pub fn register_sbi_console() -> Result<()> {
    devfs::register_chardev("ttySBI", sbi_tx).map(|_| ())
}

/// 16550-compatible UART register offsets.
mod ns16550 {
    pub const RBR: usize = 0; // receive buffer
    pub const THR: usize = 0; // transmit holding
    pub const IER: usize = 1; // interrupt enable
    pub const LSR: usize = 5; // line status

    pub const IER_RDI: u8 = 1 << 0;
    pub const LSR_DR: u8 = 1 << 0;
    pub const LSR_THRE: u8 = 1 << 5;
}

struct Ns16550 {
    base: usize,
    node: Arc<DevfsNode>,
}

// Only one 16550 instance is expected on the supported platforms.
static UART: Mutex<Option<Ns16550>> = Mutex::new(None);

impl Ns16550 {
    fn read(&self, reg: usize) -> u8 {
        // SAFETY: base is the ioremapped chip window
        unsafe { ((self.base + reg) as *const u8).read_volatile() }
    }

    fn write(&self, reg: usize, val: u8) {
        // SAFETY: as in read
        unsafe { ((self.base + reg) as *mut u8).write_volatile(val) }
    }

    fn putc(&self, c: u8) {
        while self.read(ns16550::LSR) & ns16550::LSR_THRE == 0 {}
        self.write(ns16550::THR, c);
    }

    fn drain_rx(&self) {
        let mut buf = [0u8; 16];
        let mut n = 0;
        while self.read(ns16550::LSR) & ns16550::LSR_DR != 0 && n < buf.len() {
            buf[n] = self.read(ns16550::RBR);
            n += 1;
        }
        if n > 0 {
            self.node.push_input(&buf[..n]);
        }
    }
}

fn uart_tx(buf: &[u8]) {
    if let Some(uart) = &*UART.lock() {
        for c in buf {
            uart.putc(*c);
        }
    }
}

fn uart_irq(_data: usize) {
    if let Some(uart) = &*UART.lock() {
        uart.drain_rx();
    }
}

/// Probes a 16550-compatible UART node.
pub fn probe_ns16550(node: &Node<'_>) -> Result<()> {
    let (base, size) = node.reg(2, 2).next().ok_or(Errno::EINVAL)?;
    let va = ioremap::ioremap(PhysAddr::new(base), size as usize)?;

    let devnode = devfs::register_chardev("ttyS0", uart_tx)?;

    let uart = Ns16550 {
        base: va.data(),
        node: devnode,
    };

    // Interrupt-driven receive
    uart.write(ns16550::IER, ns16550::IER_RDI);
    if let Some(irq) = node.property::<u32>("interrupts") {
        irqchip::register_handler(irq, uart_irq, 0)?;
        irqchip::enable_irq(this_cpu_id(), irq, 1, 0)?;
    }

    pr_info!("ns16550: {:#x}, registered as ttyS0", base);

    *UART.lock() = Some(uart);
    Ok(())
}

/// Probes all serial devices in the tree.
pub fn init(fdt: &Fdt<'_>) -> Result<()> {
    register_sbi_console()?;

    if let Ok(Some(node)) = fdt.find_compatible(&["ns16550a", "ns16550"]) {
        if node.is_available() {
            if let Err(e) = probe_ns16550(&node) {
                pr_warn!("serial: probing {} failed: {}", node.identifier(), e);
            }
        }
    }

    Ok(())
}
