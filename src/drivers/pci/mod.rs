//! PCI enumeration and configuration space access
//!
//! This module provides legacy I/O port-based (CAM) configuration space
//! access and class-code based device discovery. Access goes through the
//! `ConfigAccess` trait so enumeration logic can be driven against a fake
//! config space in tests.

#[cfg(target_arch = "x86_64")]
use x86_64::instructions::port::{Port, PortWriteOnly};

/// PCI configuration space ports (legacy CAM)
const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
const PCI_CONFIG_DATA: u16 = 0xCFC;

/// PCI class codes for storage controllers
pub const CLASS_STORAGE: u8 = 0x01;
pub const SUBCLASS_SATA: u8 = 0x06; // AHCI
pub const SUBCLASS_NVME: u8 = 0x08; // NVMe
pub const PROG_IF_AHCI: u8 = 0x01;
pub const PROG_IF_NVME: u8 = 0x02;

/// All-ones read from a device that is not present
const INVALID_DEVICE: u32 = 0xFFFF_FFFF;

/// PCI device location (Bus:Device.Function)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Calculate legacy CAM address for a register
    fn cam_address(&self, offset: u8) -> u32 {
        let mut addr = 1u32 << 31; // Enable bit
        addr |= (self.bus as u32) << 16;
        addr |= (self.device as u32) << 11;
        addr |= (self.function as u32) << 8;
        addr |= (offset as u32) & 0xFC; // Must be 4-byte aligned
        addr
    }
}

impl core::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// PCI configuration space reader
///
/// Implemented by the legacy CAM port pair on hardware and by fake config
/// spaces in tests.
pub trait ConfigAccess {
    /// Read a 32-bit value from configuration space
    fn read32(&self, addr: PciAddress, offset: u8) -> u32;
}

/// Legacy CAM access through ports 0xCF8/0xCFC
#[cfg(target_arch = "x86_64")]
pub struct PortCam;

#[cfg(target_arch = "x86_64")]
impl ConfigAccess for PortCam {
    fn read32(&self, addr: PciAddress, offset: u8) -> u32 {
        let mut address_port: PortWriteOnly<u32> = PortWriteOnly::new(PCI_CONFIG_ADDRESS);
        let mut data_port: Port<u32> = Port::new(PCI_CONFIG_DATA);

        unsafe {
            address_port.write(addr.cam_address(offset));
            data_port.read()
        }
    }
}

/// A matched PCI function
#[derive(Debug, Clone, Copy)]
pub struct PciFunction {
    pub address: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
}

/// Find the first function matching a class/subclass/prog-if triple.
///
/// Scans all buses, 32 devices per bus and 8 functions per device. A device
/// that is absent at function 0 is skipped entirely; functions 1-7 are never
/// probed in that case.
pub fn find_function<C: ConfigAccess>(
    cam: &C,
    class_code: u8,
    subclass: u8,
    prog_if: u8,
) -> Option<PciFunction> {
    for bus in 0..=255u8 {
        for device in 0..32u8 {
            for function in 0..8u8 {
                let addr = PciAddress::new(bus, device, function);
                let id = cam.read32(addr, 0x00);

                if id == INVALID_DEVICE {
                    if function == 0 {
                        break;
                    }
                    continue;
                }

                // Class/subclass/prog-if live in the upper bytes of offset 0x08
                let class_data = cam.read32(addr, 0x08);
                let fn_prog_if = ((class_data >> 8) & 0xFF) as u8;
                let fn_subclass = ((class_data >> 16) & 0xFF) as u8;
                let fn_class = ((class_data >> 24) & 0xFF) as u8;

                if fn_class == class_code && fn_subclass == subclass && fn_prog_if == prog_if {
                    let found = PciFunction {
                        address: addr,
                        vendor_id: (id & 0xFFFF) as u16,
                        device_id: (id >> 16) as u16,
                        class_code: fn_class,
                        subclass: fn_subclass,
                        prog_if: fn_prog_if,
                    };
                    log::info!(
                        "PCI {}: {:04x}:{:04x} class={:02x}:{:02x}:{:02x}",
                        found.address,
                        found.vendor_id,
                        found.device_id,
                        found.class_code,
                        found.subclass,
                        found.prog_if
                    );
                    return Some(found);
                }
            }
        }
    }
    None
}

/// Decode the base address register at the given config-space offset.
///
/// Low flag bits are masked off. A 64-bit memory BAR consumes the next
/// 32-bit register as the high half of the address.
pub fn read_bar<C: ConfigAccess>(cam: &C, addr: PciAddress, offset: u8) -> u64 {
    let bar = cam.read32(addr, offset);

    if bar & 0x1 != 0 {
        // I/O BAR
        return (bar & 0xFFFF_FFFC) as u64;
    }

    let mut base = (bar & 0xFFFF_FFF0) as u64;
    if bar & 0x6 == 0x4 {
        // 64-bit memory BAR
        let hi = cam.read32(addr, offset + 4);
        base |= (hi as u64) << 32;
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::vec::Vec;

    /// Recording fake configuration space
    struct FakeCam {
        regs: BTreeMap<(u8, u8, u8, u8), u32>,
        accessed: RefCell<Vec<PciAddress>>,
    }

    impl FakeCam {
        fn new() -> Self {
            Self {
                regs: BTreeMap::new(),
                accessed: RefCell::new(Vec::new()),
            }
        }

        fn set(&mut self, addr: PciAddress, offset: u8, value: u32) {
            self.regs
                .insert((addr.bus, addr.device, addr.function, offset), value);
        }

        fn add_function(&mut self, addr: PciAddress, ids: u32, class: u8, subclass: u8, prog_if: u8) {
            self.set(addr, 0x00, ids);
            self.set(
                addr,
                0x08,
                ((class as u32) << 24) | ((subclass as u32) << 16) | ((prog_if as u32) << 8),
            );
        }
    }

    impl ConfigAccess for FakeCam {
        fn read32(&self, addr: PciAddress, offset: u8) -> u32 {
            self.accessed.borrow_mut().push(addr);
            *self
                .regs
                .get(&(addr.bus, addr.device, addr.function, offset))
                .unwrap_or(&INVALID_DEVICE)
        }
    }

    #[test]
    fn test_find_function_by_class() {
        let mut cam = FakeCam::new();
        let nvme = PciAddress::new(0, 2, 0);
        cam.add_function(nvme, 0x0123_8086, CLASS_STORAGE, SUBCLASS_NVME, PROG_IF_NVME);

        let found = find_function(&cam, CLASS_STORAGE, SUBCLASS_NVME, PROG_IF_NVME)
            .expect("controller not found");
        assert_eq!(found.address, nvme);
        assert_eq!(found.vendor_id, 0x8086);
        assert_eq!(found.device_id, 0x0123);
    }

    #[test]
    fn test_missing_class_not_found() {
        let mut cam = FakeCam::new();
        cam.add_function(
            PciAddress::new(0, 1, 0),
            0x0001_1234,
            CLASS_STORAGE,
            SUBCLASS_SATA,
            PROG_IF_AHCI,
        );

        assert!(find_function(&cam, CLASS_STORAGE, SUBCLASS_NVME, PROG_IF_NVME).is_none());
    }

    #[test]
    fn test_absent_device_skips_remaining_functions() {
        // A function 5 exists but function 0 does not; the scan must never
        // touch functions 1-7 of that device.
        let mut cam = FakeCam::new();
        cam.add_function(
            PciAddress::new(0, 3, 5),
            0x0001_1234,
            CLASS_STORAGE,
            SUBCLASS_NVME,
            PROG_IF_NVME,
        );

        assert!(find_function(&cam, CLASS_STORAGE, SUBCLASS_NVME, PROG_IF_NVME).is_none());

        for addr in cam.accessed.borrow().iter() {
            if addr.bus == 0 && addr.device == 3 {
                assert_eq!(addr.function, 0, "probed hidden function {}", addr);
            }
        }
    }

    #[test]
    fn test_read_bar_32bit() {
        let mut cam = FakeCam::new();
        let addr = PciAddress::new(0, 4, 0);
        cam.set(addr, 0x24, 0xFEBF_1000);

        assert_eq!(read_bar(&cam, addr, 0x24), 0xFEBF_1000);
    }

    #[test]
    fn test_read_bar_64bit_join() {
        let mut cam = FakeCam::new();
        let addr = PciAddress::new(0, 4, 0);
        cam.set(addr, 0x10, 0xFEB0_0004);
        cam.set(addr, 0x14, 0x0000_00FF);

        assert_eq!(read_bar(&cam, addr, 0x10), 0xFF_FEB0_0000);
    }

    #[test]
    fn test_cam_address_encoding() {
        let addr = PciAddress::new(1, 2, 3).cam_address(0x26);
        assert_eq!(addr, (1 << 31) | (1 << 16) | (2 << 11) | (3 << 8) | 0x24);
    }
}
