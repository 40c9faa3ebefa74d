//! Virtual machine monitor: guest construction and teardown.
//!
//! A guest owns one contiguous physical memory region, translated through a
//! G-stage table whose root spans four naturally aligned pages. New guests
//! boot a copy of this kernel's own image: the kernel binary at the guest
//! base, the initrd and a synthesized device tree at fixed offsets above
//! it. The guest-visible state machine (trap handling, SBI emulation) lives
//! in the architecture layer.

use alloc::boxed::Box;

use riscv::paging::{MemFlags, PAGE_SIZE};
use riscv::{PhysAddr, VirtAddr};

use crate::arch;
use crate::errno::{Errno, Result};
use crate::fs;
use crate::mm::{gfp, paging};
use crate::task::{self, Pid};
use crate::timer;

/// Guest-physical base of a VM's memory.
pub const VM_GPHYS_BASE: usize = 0xa000_0000;

/// Size of the synthesized device tree.
const FDT_SIZE: usize = PAGE_SIZE;

/// Guest memory: kernel image, initrd, device tree.
const VM_SIZE_RAW: usize = 6 * 1024 * 1024 + FDT_SIZE;
const VM_PAGES: usize = VM_SIZE_RAW / PAGE_SIZE;

/// Offset of the device tree within guest memory.
const VM_FDT_OFFSET: usize = VM_SIZE_RAW - PAGE_SIZE;

/// Offset of the initrd within guest memory.
const VM_INITRD_OFFSET: usize = 4 * 1024 * 1024;

/// Pages of a G-stage root table.
const GUEST_ROOT_PT_PAGES: usize = 4;

/// Image the guest kernel is loaded from.
const VM_KERNEL_IMAGE: &str = "/initrd/grinch.bin";

/// Shadow of the mutable VS-mode register state.
#[derive(Debug, Clone, Copy, Default)]
pub struct VsRegs {
    /// VS status.
    pub vsstatus: u64,
    /// VS interrupt enables.
    pub vsie: u64,
    /// VS trap vector.
    pub vstvec: u64,
    /// VS scratch.
    pub vsscratch: u64,
    /// VS trap cause.
    pub vscause: u64,
    /// VS trap value.
    pub vstval: u64,
    /// Virtual interrupt pending bits.
    pub hvip: u64,
    /// VS address translation.
    pub vsatp: u64,
    /// Whether the vCPU runs in VS-mode (as opposed to VU-mode).
    pub vs: bool,
}

/// One virtual machine (a single vCPU).
pub struct VMachine {
    /// Guest memory: host-physical base and size.
    pub memregion: (PhysAddr, usize),
    /// G-stage root table, four contiguous naturally-aligned pages.
    pub gstage_root: PhysAddr,
    /// Shadowed VS-mode registers.
    pub vregs: VsRegs,
    /// A host timer fired for this guest; delivered on next entry.
    pub timer_pending: bool,
}

/// Copies into guest memory at `offset`.
fn vm_memcpy(vm: &VMachine, offset: usize, src: &[u8]) -> Result<()> {
    let (base, size) = vm.memregion;
    if offset + src.len() > size {
        return Err(Errno::ERANGE);
    }

    let dst = gfp::p2v(base + offset as u64).as_mut_ptr::<u8>();
    // SAFETY: guest memory is RAM inside the direct map, bounds-checked
    unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };

    Ok(())
}

/// Loads a VFS file into guest memory at `offset`.
fn vm_load_file(vm: &VMachine, path: &str, offset: usize) -> Result<()> {
    let content = fs::read_file(path)?;
    vm_memcpy(vm, offset, &content)
}

/// Synthesizes the guest's device tree.
fn vm_create_dtb(vm: &VMachine, initrd_len: usize) -> Result<()> {
    let mut w = fdt::writer::FdtWriter::new();

    let initrd_start = (VM_GPHYS_BASE + VM_INITRD_OFFSET) as u64;

    w.begin_node("");
    w.property_string("model", "riscv-grinchvm");
    w.property_u32("#address-cells", 2);
    w.property_u32("#size-cells", 2);

    w.begin_node("cpus");
    w.property_u32("#address-cells", 1);
    w.property_u32("#size-cells", 0);
    w.property_u32("timebase-frequency", timer::timebase_frequency() as u32);
    w.begin_node("cpu@0");
    w.property_string("device_type", "cpu");
    w.property_string("riscv,isa", "rv64imafdc");
    w.property_string("compatible", "riscv");
    w.property_u32("reg", 0);
    w.property_string("status", "okay");
    w.end_node().map_err(|_| Errno::EINVAL)?;
    w.end_node().map_err(|_| Errno::EINVAL)?;

    w.begin_node("chosen");
    w.property_u64("linux,initrd-start", initrd_start);
    w.property_u64("linux,initrd-end", initrd_start + initrd_len as u64);
    w.property_string(
        "bootargs",
        "console=ttySBI timer_hz=0 init=/initrd/bin/jittertest",
    );
    w.end_node().map_err(|_| Errno::EINVAL)?;

    w.begin_node("memory@a0000000");
    w.property_string("device_type", "memory");
    w.property_reg_u64("reg", VM_GPHYS_BASE as u64, VM_SIZE_RAW as u64);
    w.end_node().map_err(|_| Errno::EINVAL)?;

    w.end_node().map_err(|_| Errno::EINVAL)?;
    let blob = w.finish().map_err(|_| Errno::EINVAL)?;

    if blob.len() > FDT_SIZE {
        return Err(Errno::ENOMEM);
    }

    vm_memcpy(vm, VM_FDT_OFFSET, &blob)
}

/// Releases a guest's memory and translation structures.
pub fn vmachine_destroy(vm: &mut VMachine) {
    let (base, size) = vm.memregion;

    if vm.gstage_root != PhysAddr::new(0) {
        if paging::vm_unmap_range(vm.gstage_root, VirtAddr::new(VM_GPHYS_BASE), size).is_err() {
            panic!("tearing down G-stage mapping failed");
        }
        if gfp::free_pages(gfp::p2v(vm.gstage_root), GUEST_ROOT_PT_PAGES).is_err() {
            panic!("releasing G-stage root failed");
        }
        vm.gstage_root = PhysAddr::new(0);
    }

    if size != 0 {
        if gfp::phys_free_pages(base, gfp::pages(size)).is_err() {
            panic!("releasing guest memory failed");
        }
        vm.memregion = (PhysAddr::new(0), 0);
    }
}

/// Builds a new guest and hands it to the scheduler. Returns its pid.
pub fn create_grinch_vm() -> Result<Pid> {
    if !arch::has_hypervisor() {
        return Err(Errno::ENOSYS);
    }

    let mem = gfp::phys_pages_alloc_aligned(VM_PAGES, PAGE_SIZE)?;
    let mut vm = Box::new(VMachine {
        memregion: (mem, VM_PAGES * PAGE_SIZE),
        gstage_root: PhysAddr::new(0),
        vregs: VsRegs {
            vs: true,
            ..VsRegs::default()
        },
        timer_pending: false,
    });

    let built: Result<()> = (|| {
        pr_dbg!("vmm: copying kernel...");
        vm_load_file(&vm, VM_KERNEL_IMAGE, 0)?;

        pr_dbg!("vmm: copying initrd...");
        let initrd = crate::fs::initrdfs::raw()?;
        vm_memcpy(&vm, VM_INITRD_OFFSET, initrd)?;

        pr_dbg!("vmm: creating device tree...");
        vm_create_dtb(&vm, initrd.len())?;

        let root_va = gfp::zalloc_pages_aligned(
            GUEST_ROOT_PT_PAGES,
            GUEST_ROOT_PT_PAGES * PAGE_SIZE,
        )?;
        vm.gstage_root = gfp::v2p(root_va);

        paging::vm_map_range(
            vm.gstage_root,
            VirtAddr::new(VM_GPHYS_BASE),
            vm.memregion.0,
            vm.memregion.1,
            MemFlags::RWXU,
        )
    })();

    if let Err(e) = built {
        vmachine_destroy(&mut vm);
        return Err(e);
    }

    let fdt_addr = VM_GPHYS_BASE + VM_FDT_OFFSET;
    Ok(task::spawn_vmachine(vm, VM_GPHYS_BASE, fdt_addr))
}

/// Probes for the hypervisor extension and prepares this CPU.
pub fn init() -> Result<()> {
    if !arch::has_hypervisor() {
        return Err(Errno::ENOSYS);
    }

    arch::vmm::vmm_cpu_init();
    Ok(())
}
