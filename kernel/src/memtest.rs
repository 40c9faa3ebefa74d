//! Boot-time memory stress, armed by the `memtest` boot parameter.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::vec::Vec;

use riscv::paging::PAGE_SIZE;

use crate::errno::Result;
use crate::mm::gfp;

static DO_MEMTEST: AtomicBool = AtomicBool::new(false);

pub(crate) fn parse_memtest(_arg: Option<&str>) {
    DO_MEMTEST.store(true, Ordering::Relaxed);
}

/// Whether a memory test was requested on the command line.
pub fn requested() -> bool {
    DO_MEMTEST.load(Ordering::Relaxed)
}

fn pattern(i: usize) -> u8 {
    (i as u8) ^ 0xa5
}

/// Exercises the page allocator and the heap with pattern checks.
pub fn memtest() -> Result<()> {
    const ROUNDS: usize = 8;
    const CHUNK_PAGES: usize = 4;

    pr!("memtest: page allocator...");
    let mut pages = Vec::new();
    for round in 0..ROUNDS {
        let va = gfp::zalloc_pages(CHUNK_PAGES)?;

        // SAFETY: freshly allocated, directly mapped
        let mem = unsafe {
            core::slice::from_raw_parts_mut(va.as_mut_ptr::<u8>(), CHUNK_PAGES * PAGE_SIZE)
        };
        for (i, b) in mem.iter_mut().enumerate() {
            *b = pattern(i + round);
        }
        pages.push((va, round));
    }

    for (va, round) in &pages {
        // SAFETY: still owned by us
        let mem = unsafe {
            core::slice::from_raw_parts(va.as_ptr::<u8>(), CHUNK_PAGES * PAGE_SIZE)
        };
        for (i, b) in mem.iter().enumerate() {
            if *b != pattern(i + round) {
                panic!("memtest: page pattern mismatch at {}+{:#x}", va, i);
            }
        }
        gfp::free_pages(*va, CHUNK_PAGES)?;
    }

    pr!("memtest: kernel heap...");
    let mut blobs: Vec<Vec<u8>> = Vec::new();
    for round in 0..ROUNDS {
        let size = 32 << round;
        let mut blob = Vec::with_capacity(size);
        for i in 0..size {
            blob.push(pattern(i + round));
        }
        blobs.push(blob);
    }
    for (round, blob) in blobs.iter().enumerate() {
        for (i, b) in blob.iter().enumerate() {
            if *b != pattern(i + round) {
                panic!("memtest: heap pattern mismatch in round {}", round);
            }
        }
    }

    pr!("memtest: passed");
    Ok(())
}
