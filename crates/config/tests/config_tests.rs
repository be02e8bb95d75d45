// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use picosim_config::{ChipDescriptor, IrqTrigger};

#[test]
fn parse_minimal_descriptor() {
    let yaml = r#"
name: test-chip
bootrom:
  base: 0x0
  size: "16 KiB"
flash:
  base: 0x10000000
  size: "2 MiB"
ram:
  base: 0x20000000
  size: "64 KiB"
peripherals:
  - id: uart0
    type: uart
    base_address: 0x40034000
    irq: 20
"#;
    let chip: ChipDescriptor = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(chip.name, "test-chip");
    assert_eq!(chip.schema_version, "1.0");
    assert_eq!(chip.peripherals.len(), 1);
    // Trigger defaults to level when unspecified.
    assert_eq!(chip.peripherals[0].trigger, IrqTrigger::Level);
}

#[test]
fn parse_edge_trigger() {
    let yaml = r#"
name: t
bootrom: { base: 0, size: "16 KiB" }
flash: { base: 0x10000000, size: "1 MiB" }
ram: { base: 0x20000000, size: "64 KiB" }
peripherals:
  - id: gpio
    type: sio
    base_address: 0xd0000000
    trigger: edge
"#;
    let chip: ChipDescriptor = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(chip.peripherals[0].trigger, IrqTrigger::Edge);
}
