//! `riscv,isa` string parsing.
//!
//! ISA strings look like `rv64imafdch_zicsr_zifencei`: a base token with
//! single-letter extensions, followed by underscore-separated multi-letter
//! extensions. The kernel only cares about a handful of single-letter
//! extensions, most prominently `h` for the hypervisor path.

/// Decoded capabilities of one hart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Isa {
    /// Base integer ISA is rv64.
    pub rv64: bool,
    /// Atomic extension.
    pub atomics: bool,
    /// Compressed instructions.
    pub compressed: bool,
    /// Single- and double-precision floats.
    pub fpu: bool,
    /// Hypervisor extension.
    pub hypervisor: bool,
}

impl Isa {
    /// Parses an ISA string. Returns `None` when the base token is not a
    /// valid `rv64`/`rv32` specifier.
    pub fn parse(s: &str) -> Option<Isa> {
        let mut tokens = s.split('_');
        let base = tokens.next()?;

        let rest = base
            .strip_prefix("rv64")
            .or_else(|| base.strip_prefix("rv32"))?;
        let mut isa = Isa {
            rv64: base.starts_with("rv64"),
            ..Isa::default()
        };

        for c in rest.chars() {
            match c {
                'a' => isa.atomics = true,
                'c' => isa.compressed = true,
                'f' | 'd' => isa.fpu = true,
                'h' => isa.hypervisor = true,
                // 'i', 'm', 'g' and anything else carry no decision here
                _ => (),
            }
        }

        Some(isa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_rv64() {
        let isa = Isa::parse("rv64imafdc").unwrap();
        assert!(isa.rv64);
        assert!(isa.atomics);
        assert!(isa.fpu);
        assert!(isa.compressed);
        assert!(!isa.hypervisor);
    }

    #[test]
    fn hypervisor_token() {
        let isa = Isa::parse("rv64imafdch").unwrap();
        assert!(isa.hypervisor);

        // `h` in a multi-letter extension must not enable the hypervisor.
        let isa = Isa::parse("rv64imafdc_zihintpause").unwrap();
        assert!(!isa.hypervisor);
    }

    #[test]
    fn underscore_extensions_are_skipped() {
        let isa = Isa::parse("rv64imafdch_zicsr_zifencei_sstc").unwrap();
        assert!(isa.hypervisor);
        assert!(isa.compressed);
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(Isa::parse("x86_64"), None);
        assert_eq!(Isa::parse(""), None);
    }
}
