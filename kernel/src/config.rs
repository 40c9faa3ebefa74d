//! Kernel virtual memory layout and global tunables.
//!
//! The layout matches the linker script: the kernel image lives in the
//! uppermost Sv39 gigapage together with its internal page pool; device
//! mappings, the heap window and the direct physical map carve further
//! regions out of the kernel half.

use riscv::paging::{GIGA_PAGE_SIZE, MEGA_PAGE_SIZE, PAGE_SIZE};

/// Virtual base of the kernel image.
pub const VMGRINCH_BASE: usize = 0xffff_ffc0_0000_0000;

/// Size of the kernel area: image plus the internal page pool.
pub const GRINCH_SIZE: usize = 4 * MEGA_PAGE_SIZE;

/// End of the kernel area.
pub const VMGRINCH_END: usize = VMGRINCH_BASE + GRINCH_SIZE;

/// Base of the MMIO remap window. Placed so the window shares the kernel's
/// top-level page table entry.
pub const IOREMAP_BASE: usize = VMGRINCH_BASE | (1 << 29);

/// Size of the MMIO remap window.
pub const IOREMAP_SIZE: usize = 1 << 28;

/// End of the MMIO remap window.
pub const IOREMAP_END: usize = IOREMAP_BASE + IOREMAP_SIZE;

/// Base of the kernel heap mapping.
pub const KHEAP_BASE: usize = IOREMAP_END;

/// Default kernel heap size; `kheap_size=` overrides.
pub const KHEAP_DEFAULT_SIZE: usize = 4 * MEGA_PAGE_SIZE;

/// Base of the direct physical map: a linear window over all usable RAM.
pub const DIR_PHYS_BASE: usize = VMGRINCH_BASE + GIGA_PAGE_SIZE;

/// First user virtual address.
pub const USER_START: usize = 0x1000;

/// One past the last user virtual address.
pub const USER_END: usize = 1 << 38;

/// Size of the initial user stack.
pub const USER_STACK_SIZE: usize = 0x10_0000;

/// Top of the user stack.
pub const USER_STACK_TOP: usize = USER_END;

/// Base of the user stack mapping.
pub const USER_STACK_BASE: usize = USER_STACK_TOP - USER_STACK_SIZE;

/// Base of the per-process heap; `brk` grows upwards from here.
pub const USER_HEAP_BASE: usize = 0x2000_0000;

/// Maximum number of harts.
pub const MAX_CPUS: usize = 64;

/// Per-process file handle table size.
pub const MAX_FDS: usize = 10;

/// Per-CPU exception stack size.
pub const STACK_SIZE: usize = 2 * PAGE_SIZE;

/// External interrupt sources the irqchip layer can route.
pub const IRQ_MAX: usize = 64;

/// Pid namespace offset between nested grinch instances.
pub const VM_PID_OFFSET: u32 = 10_000;

const _: () = assert!(GRINCH_SIZE % (64 * PAGE_SIZE) == 0);
const _: () = assert!(USER_STACK_BASE % PAGE_SIZE == 0);
const _: () = assert!(IOREMAP_END <= DIR_PHYS_BASE);
