use fdt::{writer::FdtWriter, Fdt, PropEncodedArray, StringList};

/// Builds the device tree shape a grinch guest is booted with.
fn guest_dtb() -> Vec<u8> {
    let mut w = FdtWriter::new();

    w.begin_node("");
    w.property_string("model", "riscv-grinchvm");
    w.property_u32("#address-cells", 2);
    w.property_u32("#size-cells", 2);

    w.begin_node("cpus");
    w.property_u32("#address-cells", 1);
    w.property_u32("#size-cells", 0);
    w.property_u32("timebase-frequency", 10_000_000);
    w.begin_node("cpu@0");
    w.property_string("device_type", "cpu");
    w.property_string("riscv,isa", "rv64imafdc");
    w.property_string("compatible", "riscv");
    w.property_u32("reg", 0);
    w.property_string("status", "okay");
    w.end_node().unwrap();
    w.end_node().unwrap();

    w.begin_node("chosen");
    w.property_u64("linux,initrd-start", 0xa040_0000);
    w.property_u64("linux,initrd-end", 0xa040_2000);
    w.property_string("bootargs", "console=ttySBI timer_hz=0");
    w.end_node().unwrap();

    w.begin_node("memory@a0000000");
    w.property_string("device_type", "memory");
    w.property_reg_u64("reg", 0xa000_0000, 6 * 1024 * 1024 + 4096);
    w.end_node().unwrap();

    w.end_node().unwrap();
    w.finish().unwrap()
}

#[test]
fn written_tree_parses_back() {
    let blob = guest_dtb();
    let fdt = Fdt::from_bytes(&blob).expect("self-built blob must parse");

    let root = fdt.root_node().unwrap();
    assert_eq!(root.property::<&str>("model"), Some("riscv-grinchvm"));
    assert_eq!(root.property::<u32>("#address-cells"), Some(2));

    let chosen = fdt.find_by_path("/chosen").unwrap().unwrap();
    assert_eq!(chosen.property::<u64>("linux,initrd-start"), Some(0xa040_0000));
    assert_eq!(
        chosen.property::<&str>("bootargs"),
        Some("console=ttySBI timer_hz=0")
    );

    let cpu = fdt.find_by_path("/cpus/cpu@0").unwrap().unwrap();
    assert!(cpu.is_available());
    assert_eq!(cpu.property::<&str>("riscv,isa"), Some("rv64imafdc"));

    let memory = fdt.find_by_path("/memory").unwrap().unwrap();
    assert_eq!(memory.address(), Some("a0000000"));
    let (base, size) = memory.reg(2, 2).next().unwrap();
    assert_eq!(base, 0xa000_0000);
    assert_eq!(size, 6 * 1024 * 1024 + 4096);
}

#[test]
fn compatible_lookup_and_dfs() {
    let blob = guest_dtb();
    let fdt = Fdt::from_bytes(&blob).unwrap();

    let cpu = fdt.find_compatible(&["riscv", "riscv,unmatched"]).unwrap();
    assert_eq!(cpu.unwrap().name(), "cpu");

    assert!(fdt.find_compatible(&["acme,frobnicator"]).unwrap().is_none());

    let names: Vec<_> = fdt.nodes().unwrap().map(|n| n.name().to_string()).collect();
    assert!(names.contains(&"chosen".to_string()));
    assert!(names.contains(&"memory".to_string()));
}

#[test]
fn string_and_array_properties_decode() {
    let mut w = FdtWriter::new();
    w.begin_node("");
    w.begin_node("soc");
    w.begin_node("plic@c000000");
    // Two compatible strings, the way QEMU advertises its PLIC.
    w.property("compatible", b"sifive,plic-1.0.0\0riscv,plic0\0");
    w.property(
        "interrupts-extended",
        &[0u32, 11, 0, 9, 1, 11, 1, 9]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect::<Vec<_>>(),
    );
    w.end_node().unwrap();
    w.end_node().unwrap();
    w.end_node().unwrap();
    let blob = w.finish().unwrap();

    let fdt = Fdt::from_bytes(&blob).unwrap();
    let plic = fdt.find_compatible(&["riscv,plic0"]).unwrap().unwrap();

    let compat: Vec<_> = plic.property::<StringList>("compatible").unwrap().collect();
    assert_eq!(compat, vec!["sifive,plic-1.0.0", "riscv,plic0"]);

    let cells: Vec<u32> = plic
        .property::<PropEncodedArray<u32>>("interrupts-extended")
        .unwrap()
        .collect();
    assert_eq!(cells, vec![0, 11, 0, 9, 1, 11, 1, 9]);
}

#[test]
fn reservation_block_roundtrip() {
    let mut w = FdtWriter::new();
    w.add_reservation(0x8000_0000, 0x20_0000);
    w.begin_node("");
    w.end_node().unwrap();
    let blob = w.finish().unwrap();

    let fdt = Fdt::from_bytes(&blob).unwrap();
    let rsv: Vec<_> = fdt
        .reserved_memory_map()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(rsv.len(), 1);
    assert_eq!(rsv[0].address, 0x8000_0000);
    assert_eq!(rsv[0].size, 0x20_0000);
}

#[test]
fn unbalanced_nodes_are_rejected() {
    let mut w = FdtWriter::new();
    w.begin_node("");
    assert!(w.finish().is_err());

    let mut w = FdtWriter::new();
    assert!(w.end_node().is_err());
}
