//! Interrupt controller abstraction.
//!
//! The core consumes one irqchip capability: claim-and-dispatch plus
//! per-CPU enable/disable of a source. Drivers register their handlers in a
//! fixed table; sources without a handler are logged and dropped. The only
//! in-tree implementation is the PLIC.

use alloc::boxed::Box;
use fdt::{Fdt, PropEncodedArray};
use spin::{Mutex, Once};

use crate::config::IRQ_MAX;
use crate::errno::{Errno, Result};
use crate::mm::ioremap;
use crate::percpu::{per_cpu, this_per_cpu};

/// The irqchip capability the kernel core consumes.
pub trait IrqChip: Send + Sync {
    /// Claims and dispatches all pending external interrupts of this hart.
    fn handle_irq(&self);

    /// Routes `irq` to `cpu` with the given priority and threshold.
    fn enable_irq(&self, cpu: usize, irq: u32, prio: u32, thres: u32);

    /// Masks `irq` on `cpu`.
    fn disable_irq(&self, cpu: usize, irq: u32);
}

type Handler = (fn(usize), usize);

static IRQCHIP: Once<&'static dyn IrqChip> = Once::INIT;
static HANDLERS: Mutex<[Option<Handler>; IRQ_MAX]> = Mutex::new([None; IRQ_MAX]);

/// Registers a handler for an interrupt source.
pub fn register_handler(irq: u32, handler: fn(usize), data: usize) -> Result<()> {
    let mut handlers = HANDLERS.lock();
    let slot = handlers.get_mut(irq as usize).ok_or(Errno::EINVAL)?;
    if slot.is_some() {
        return Err(Errno::EBUSY);
    }
    *slot = Some((handler, data));
    Ok(())
}

/// Dispatches one claimed source to its registered handler.
fn dispatch(irq: u32) {
    let handler = HANDLERS.lock().get(irq as usize).copied().flatten();
    match handler {
        Some((handler, data)) => handler(data),
        None => pr_warn!("irqchip: no handler for IRQ {}", irq),
    }
}

/// External interrupt entry: let the chip claim and dispatch.
pub fn handle_irq() {
    if let Some(chip) = IRQCHIP.get() {
        chip.handle_irq();
    }
}

/// Routes an interrupt source to a CPU.
pub fn enable_irq(cpu: usize, irq: u32, prio: u32, thres: u32) -> Result<()> {
    let chip = IRQCHIP.get().ok_or(Errno::ENODEV)?;
    chip.enable_irq(cpu, irq, prio, thres);
    Ok(())
}

/// Masks an interrupt source on a CPU.
pub fn disable_irq(cpu: usize, irq: u32) -> Result<()> {
    let chip = IRQCHIP.get().ok_or(Errno::ENODEV)?;
    chip.disable_irq(cpu, irq);
    Ok(())
}

/// Platform-Level Interrupt Controller.
///
/// Register map: source priorities at the base, per-context enable bits at
/// 0x2000, per-context threshold and claim/complete at 0x200000.
struct Plic {
    base: usize,
}

const PLIC_ENABLE_BASE: usize = 0x2000;
const PLIC_ENABLE_STRIDE: usize = 0x80;
const PLIC_CONTEXT_BASE: usize = 0x20_0000;
const PLIC_CONTEXT_STRIDE: usize = 0x1000;

impl Plic {
    fn reg(&self, offset: usize) -> *mut u32 {
        (self.base + offset) as *mut u32
    }

    fn read(&self, offset: usize) -> u32 {
        // SAFETY: offset derived from the PLIC register map, base is the
        // ioremapped window
        unsafe { self.reg(offset).read_volatile() }
    }

    fn write(&self, offset: usize, value: u32) {
        // SAFETY: as in read
        unsafe { self.reg(offset).write_volatile(value) }
    }

    fn claim_offset(ctx: usize) -> usize {
        PLIC_CONTEXT_BASE + ctx * PLIC_CONTEXT_STRIDE + 4
    }

    fn threshold_offset(ctx: usize) -> usize {
        PLIC_CONTEXT_BASE + ctx * PLIC_CONTEXT_STRIDE
    }

    fn enable_offset(ctx: usize, irq: u32) -> usize {
        PLIC_ENABLE_BASE + ctx * PLIC_ENABLE_STRIDE + (irq as usize / 32) * 4
    }
}

impl IrqChip for Plic {
    fn handle_irq(&self) {
        let ctx = this_per_cpu().irqchip_ctx();

        loop {
            let irq = self.read(Self::claim_offset(ctx));
            if irq == 0 {
                break;
            }
            dispatch(irq);
            self.write(Self::claim_offset(ctx), irq);
        }
    }

    fn enable_irq(&self, cpu: usize, irq: u32, prio: u32, thres: u32) {
        let ctx = per_cpu(cpu).irqchip_ctx();

        self.write(4 * irq as usize, prio);
        self.write(Self::threshold_offset(ctx), thres);

        let enable = Self::enable_offset(ctx, irq);
        let bits = self.read(enable) | (1 << (irq % 32));
        self.write(enable, bits);
    }

    fn disable_irq(&self, cpu: usize, irq: u32) {
        let ctx = per_cpu(cpu).irqchip_ctx();

        let enable = Self::enable_offset(ctx, irq);
        let bits = self.read(enable) & !(1 << (irq % 32));
        self.write(enable, bits);
    }
}

/// Probes the interrupt controller from the device tree.
pub fn init(fdt: &Fdt<'_>) -> Result<()> {
    let node = fdt
        .find_compatible(&["riscv,plic0", "sifive,plic-1.0.0"])
        .map_err(|_| Errno::EINVAL)?
        .ok_or(Errno::ENOENT)?;

    let (base, size) = node.reg(2, 2).next().ok_or(Errno::EINVAL)?;
    let va = ioremap::ioremap(riscv::PhysAddr::new(base), size as usize)?;

    pr_info!("PLIC: {:#x} - {:#x}", base, base + size);

    // Each (phandle, irq) pair of interrupts-extended is one context; the
    // S-mode external contexts (irq 9) belong to the harts in order.
    const S_MODE_EXT: u32 = 9;

    let mut hart = 0;
    if let Some(cells) = node.property::<PropEncodedArray<u32>>("interrupts-extended") {
        let cells: alloc::vec::Vec<u32> = cells.collect();
        for (ctx, pair) in cells.chunks_exact(2).enumerate() {
            if pair[1] == S_MODE_EXT {
                per_cpu(hart).set_irqchip_ctx(ctx);
                hart += 1;
            }
        }
    }
    // Without the property, fall back to the conventional layout
    if hart == 0 {
        for cpu in 0..crate::config::MAX_CPUS {
            per_cpu(cpu).set_irqchip_ctx(cpu * 2 + 1);
        }
    }

    let chip: &'static Plic = Box::leak(Box::new(Plic { base: va.data() }));
    IRQCHIP.call_once(|| chip);

    Ok(())
}
