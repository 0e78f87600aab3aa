//! AHCI HBA and port register definitions

use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite};

/// Offset of the first port register block from the HBA base
pub const PORT_BASE: u64 = 0x100;
/// Size of each port register block
pub const PORT_SIZE: u64 = 0x80;

/// FIS type: Register - Host to Device
pub const FIS_TYPE_REG_H2D: u8 = 0x27;

/// ATA commands
pub const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
pub const ATA_CMD_IDENTIFY: u8 = 0xEC;

/// Port signature for a SATA disk
pub const SATA_SIG_ATA: u32 = 0x0000_0101;

register_bitfields! [
    u32,
    /// Host Capabilities (CAP)
    pub CAP [
        /// Number of Ports (0's based)
        NP OFFSET(0) NUMBITS(5) [],
        /// Number of Command Slots (0's based)
        NCS OFFSET(8) NUMBITS(5) [],
        /// Supports 64-bit Addressing
        S64A OFFSET(31) NUMBITS(1) []
    ],
    /// Global Host Control (GHC)
    pub GHC [
        /// HBA Reset
        HR OFFSET(0) NUMBITS(1) [],
        /// Interrupt Enable
        IE OFFSET(1) NUMBITS(1) [],
        /// AHCI Enable
        AE OFFSET(31) NUMBITS(1) []
    ],
    /// Port Command and Status (PxCMD)
    pub PORT_CMD [
        /// Start (command list processing)
        ST OFFSET(0) NUMBITS(1) [],
        /// Spin-Up Device
        SUD OFFSET(1) NUMBITS(1) [],
        /// FIS Receive Enable
        FRE OFFSET(4) NUMBITS(1) [],
        /// FIS Receive Running
        FR OFFSET(14) NUMBITS(1) [],
        /// Command List Running
        CR OFFSET(15) NUMBITS(1) []
    ],
    /// Port Task File Data (PxTFD)
    pub PORT_TFD [
        /// Status: Error
        STS_ERR OFFSET(0) NUMBITS(1) [],
        /// Status: Data Request
        STS_DRQ OFFSET(3) NUMBITS(1) [],
        /// Status: Busy
        STS_BSY OFFSET(7) NUMBITS(1) []
    ],
    /// Port SATA Status (PxSSTS)
    pub PORT_SSTS [
        /// Device Detection (3 = present and Phy established)
        DET OFFSET(0) NUMBITS(4) [],
        /// Interface Power Management (1 = active)
        IPM OFFSET(8) NUMBITS(4) []
    ],
    /// Port Interrupt Status (PxIS)
    pub PORT_IS [
        /// Task File Error Status
        TFES OFFSET(30) NUMBITS(1) []
    ]
];

/// HBA generic registers memory map (base of the ABAR region)
#[repr(C)]
pub struct AhciHbaRegisters {
    /// Host Capabilities
    pub cap: ReadOnly<u32, CAP::Register>,
    /// Global Host Control
    pub ghc: ReadWrite<u32, GHC::Register>,
    /// Interrupt Status
    pub is: ReadWrite<u32>,
    /// Ports Implemented
    pub pi: ReadOnly<u32>,
    /// Version
    pub vs: ReadOnly<u32>,
}

/// Per-port registers memory map (ABAR + 0x100 + port * 0x80)
#[repr(C)]
pub struct AhciPortRegisters {
    /// Command List Base Address
    pub clb: ReadWrite<u32>,
    /// Command List Base Address (upper 32 bits)
    pub clbu: ReadWrite<u32>,
    /// FIS Base Address
    pub fb: ReadWrite<u32>,
    /// FIS Base Address (upper 32 bits)
    pub fbu: ReadWrite<u32>,
    /// Interrupt Status
    pub is: ReadWrite<u32, PORT_IS::Register>,
    /// Interrupt Enable
    pub ie: ReadWrite<u32>,
    /// Command and Status
    pub cmd: ReadWrite<u32, PORT_CMD::Register>,
    _reserved0: u32,
    /// Task File Data
    pub tfd: ReadOnly<u32, PORT_TFD::Register>,
    /// Signature
    pub sig: ReadOnly<u32>,
    /// SATA Status
    pub ssts: ReadOnly<u32, PORT_SSTS::Register>,
    /// SATA Control
    pub sctl: ReadWrite<u32>,
    /// SATA Error
    pub serr: ReadWrite<u32>,
    /// SATA Active
    pub sact: ReadOnly<u32>,
    /// Command Issue
    pub ci: ReadWrite<u32>,
}
