//! Sequential flattened-device-tree builder.
//!
//! Mirrors the libfdt sequential-write API: open nodes with
//! [`FdtWriter::begin_node`], attach properties, close with
//! [`FdtWriter::end_node`], then [`FdtWriter::finish`] assembles the final
//! blob. The VMM uses this to hand each guest a device tree describing its
//! synthetic machine.

use alloc::vec::Vec;

const FDT_MAGIC: u32 = 0xd00dfeed;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;

/// Errors produced while building a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdtWriterError {
    /// `end_node` without a matching `begin_node`.
    Unbalanced,
    /// `finish` while nodes are still open.
    NodeStillOpen,
}

/// An in-construction device tree.
#[derive(Debug, Default)]
pub struct FdtWriter {
    structure: Vec<u8>,
    strings: Vec<u8>,
    reservations: Vec<(u64, u64)>,
    depth: usize,
}

impl FdtWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry to the memory reservation block.
    pub fn add_reservation(&mut self, address: u64, size: u64) {
        self.reservations.push((address, size));
    }

    /// Opens a new node. The root node has the empty name.
    pub fn begin_node(&mut self, name: &str) {
        self.push_token(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad_structure();
        self.depth += 1;
    }

    /// Closes the most recently opened node.
    pub fn end_node(&mut self) -> Result<(), FdtWriterError> {
        if self.depth == 0 {
            return Err(FdtWriterError::Unbalanced);
        }
        self.depth -= 1;
        self.push_token(FDT_END_NODE);
        Ok(())
    }

    /// Attaches a raw property to the open node.
    pub fn property(&mut self, name: &str, value: &[u8]) {
        let name_off = self.string_offset(name);
        self.push_token(FDT_PROP);
        self.structure.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.structure.extend_from_slice(&name_off.to_be_bytes());
        self.structure.extend_from_slice(value);
        self.pad_structure();
    }

    /// Attaches a `u32` property.
    pub fn property_u32(&mut self, name: &str, value: u32) {
        self.property(name, &value.to_be_bytes());
    }

    /// Attaches a `u64` property.
    pub fn property_u64(&mut self, name: &str, value: u64) {
        self.property(name, &value.to_be_bytes());
    }

    /// Attaches a NUL-terminated string property.
    pub fn property_string(&mut self, name: &str, value: &str) {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.property(name, &bytes);
    }

    /// Attaches a `reg` property of one `(address, size)` pair with two cells
    /// each.
    pub fn property_reg_u64(&mut self, name: &str, address: u64, size: u64) {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&address.to_be_bytes());
        bytes[8..].copy_from_slice(&size.to_be_bytes());
        self.property(name, &bytes);
    }

    /// Assembles the final blob.
    pub fn finish(mut self) -> Result<Vec<u8>, FdtWriterError> {
        if self.depth != 0 {
            return Err(FdtWriterError::NodeStillOpen);
        }
        self.push_token(FDT_END);

        const HEADER_LEN: usize = 40;
        let off_mem_rsvmap = HEADER_LEN;
        let rsvmap_len = (self.reservations.len() + 1) * 16;
        let off_dt_struct = off_mem_rsvmap + rsvmap_len;
        let off_dt_strings = off_dt_struct + self.structure.len();
        let totalsize = off_dt_strings + self.strings.len();

        let mut out = Vec::with_capacity(totalsize);
        for word in [
            FDT_MAGIC,
            totalsize as u32,
            off_dt_struct as u32,
            off_dt_strings as u32,
            off_mem_rsvmap as u32,
            FDT_VERSION,
            FDT_LAST_COMP_VERSION,
            0, // boot_cpuid_phys
            self.strings.len() as u32,
            self.structure.len() as u32,
        ] {
            out.extend_from_slice(&word.to_be_bytes());
        }

        for (address, size) in self.reservations.iter().chain(&[(0, 0)]) {
            out.extend_from_slice(&address.to_be_bytes());
            out.extend_from_slice(&size.to_be_bytes());
        }

        out.extend_from_slice(&self.structure);
        out.extend_from_slice(&self.strings);

        Ok(out)
    }

    fn push_token(&mut self, token: u32) {
        self.structure.extend_from_slice(&token.to_be_bytes());
    }

    fn pad_structure(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    /// Returns the strings-block offset of `name`, interning it on first use.
    fn string_offset(&mut self, name: &str) -> u32 {
        let bytes = name.as_bytes();

        let mut off = 0;
        while off < self.strings.len() {
            let end = off + self.strings[off..].iter().position(|&b| b == 0).unwrap();
            if &self.strings[off..end] == bytes {
                return off as u32;
            }
            off = end + 1;
        }

        let off = self.strings.len();
        self.strings.extend_from_slice(bytes);
        self.strings.push(0);
        off as u32
    }
}
