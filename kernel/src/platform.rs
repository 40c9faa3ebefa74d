//! Platform discovery from the device tree.
//!
//! The boot FDT is mapped once through the MMIO window and kept for the
//! kernel's lifetime; queries reparse lazily, which costs nothing before
//! the heap exists. This module answers the kernel's questions - where is
//! memory, which harts exist, what was chosen - without exposing raw FDT
//! plumbing to the rest of the kernel.

use fdt::Fdt;
use riscv::{isa::Isa, PhysAddr};
use spin::Once;

use crate::arch;
use crate::config::MAX_CPUS;
use crate::errno::{Errno, Result};
use crate::mm::{gfp, ioremap};
use crate::smp;

/// Upper bound for the mapped FDT window.
const FDT_MAX_SIZE: usize = 2 * 1024 * 1024;

static FDT: Once<Fdt<'static>> = Once::INIT;

/// Maps and validates the boot FDT.
pub fn fdt_init(fdt_pa: PhysAddr) -> Result<()> {
    let va = ioremap::ioremap(fdt_pa, FDT_MAX_SIZE)?;

    // SAFETY: the window covers the maximum supported blob size and stays
    // mapped for the kernel's lifetime
    let probe = unsafe { core::slice::from_raw_parts(va.as_ptr::<u8>(), FDT_MAX_SIZE) };
    let fdt = Fdt::from_bytes(probe).map_err(|_| Errno::EINVAL)?;

    FDT.call_once(|| fdt);
    Ok(())
}

/// The parsed boot device tree.
pub fn fdt() -> &'static Fdt<'static> {
    FDT.get().expect("FDT used before fdt_init")
}

/// The `/chosen` `bootargs` string.
pub fn bootargs() -> Option<&'static str> {
    fdt().find_by_path("/chosen").ok()??.property("bootargs")
}

/// The `/chosen` `stdout-path`, without any `:options` suffix.
pub fn stdout_path() -> Option<&'static str> {
    let path: &str = fdt().find_by_path("/chosen").ok()??.property("stdout-path")?;
    Some(path.split(':').next().unwrap_or(path))
}

/// The initrd's physical extent from `/chosen`. The cell width of the
/// initrd properties varies between firmware generations.
pub fn initrd_region() -> Option<(PhysAddr, usize)> {
    let chosen = fdt().find_by_path("/chosen").ok()??;

    let cell = |name: &str| -> Option<u64> {
        match chosen.property::<&[u8]>(name)?.len() {
            8 => chosen.property::<u64>(name),
            4 => chosen.property::<u32>(name).map(u64::from),
            _ => None,
        }
    };

    let start = cell("linux,initrd-start")?;
    let end = cell("linux,initrd-end")?;
    if end <= start {
        return None;
    }

    Some((PhysAddr::new(start), (end - start) as usize))
}

/// Registers main memory and its reservations with the page allocator.
pub fn memory_init() -> Result<()> {
    let fdt = fdt();
    let root = fdt.root_node().map_err(|_| Errno::EINVAL)?;

    let address_cells: u32 = root.property("#address-cells").unwrap_or(2);
    let size_cells: u32 = root.property("#size-cells").unwrap_or(2);

    let memory = fdt
        .find_by_path("/memory")
        .map_err(|_| Errno::EINVAL)?
        .ok_or(Errno::ENOENT)?;
    let (base, size) = memory
        .reg(address_cells, size_cells)
        .next()
        .ok_or(Errno::EINVAL)?;

    pr_info!("memory: {:#x}, size {:#x}", base, size);

    // The direct map must exist before the area is registered, its bitmap
    // lives behind it.
    crate::mm::paging::init_direct_map(PhysAddr::new(base), size as usize)?;
    gfp::phys_mem_init(PhysAddr::new(base), size as usize)?;

    if let Ok(Some(reserved)) = fdt.find_by_path("/reserved-memory") {
        for child in reserved.children() {
            if !child.is_available() {
                continue;
            }
            if let Some((base, size)) = child.reg(address_cells, size_cells).next() {
                pr_info!(
                    "memory: reserving {} ({:#x}, len {:#x})",
                    child.identifier(),
                    base,
                    size
                );
                let _ =
                    gfp::phys_mark_used(PhysAddr::new(base), gfp::pages(size as usize));
            }
        }
    }

    // Firmware reservations from the header block
    for entry in fdt.reserved_memory_map().flatten() {
        let _ = gfp::phys_mark_used(
            PhysAddr::new(entry.address),
            gfp::pages(entry.size as usize),
        );
    }

    Ok(())
}

/// Scans `/cpus`: marks usable harts available and decides whether every
/// one of them carries the hypervisor extension.
pub fn cpus_init() -> Result<()> {
    let fdt = fdt();
    let cpus = fdt
        .find_by_path("/cpus")
        .map_err(|_| Errno::EINVAL)?
        .ok_or(Errno::ENOENT)?;

    let mut all_hyp = true;
    let mut found = 0;

    for cpu in cpus.children() {
        if cpu.name() != "cpu" || !cpu.is_available() {
            continue;
        }

        let hartid: u32 = match cpu.property("reg") {
            Some(id) => id,
            None => continue,
        };
        if hartid as usize >= MAX_CPUS {
            pr_warn!("cpus: hart {} beyond the supported maximum", hartid);
            continue;
        }

        let isa = cpu
            .property::<&str>("riscv,isa")
            .and_then(Isa::parse)
            .unwrap_or_default();
        if !isa.hypervisor {
            all_hyp = false;
        }

        smp::set_available(hartid as usize);
        found += 1;
    }

    if found == 0 {
        return Err(Errno::ENOENT);
    }

    arch::set_has_hypervisor(all_hyp);
    pr_info!(
        "cpus: {} hart(s), hypervisor extension {}",
        found,
        if all_hyp { "available" } else { "not available" }
    );

    Ok(())
}

/// The timer frequency from `/cpus`.
pub fn timebase_frequency() -> Option<u64> {
    let freq: u32 = fdt().find_by_path("/cpus").ok()??.property("timebase-frequency")?;
    Some(freq as u64)
}

/// The board model string.
pub fn model() -> Option<&'static str> {
    fdt().root_node().ok()?.property("model")
}
