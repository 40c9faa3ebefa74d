//! Device drivers.
//!
//! The kernel core only consumes two capabilities from this layer: the
//! irqchip vtable and byte-at-a-time console sinks. Probing walks the
//! device tree by `compatible` string.

pub mod irqchip;
pub mod serial;

use fdt::Fdt;

use crate::errno::Result;

/// Probes the interrupt controller and the serial devices.
pub fn init(fdt: &Fdt<'_>) -> Result<()> {
    if let Err(e) = irqchip::init(fdt) {
        pr_warn!("drivers: no usable irqchip: {}", e);
    }

    serial::init(fdt)?;

    Ok(())
}
