//! Platform configuration constants
//!
//! Memory map, interrupt numbers and layout parameters for the secure
//! world of the target platform. Everything security-relevant that the
//! rest of the crate derives from lives here, so a port to another
//! board is a change to this file plus `services.rs`.

/// Secure PL011 UART base (secure-world console)
pub const SECURE_UART_BASE: usize = 0x0904_0000;

/// PL031 RTC base, mapped secure-only; supplies tamper timestamps
pub const RTC_BASE: usize = 0x0901_0000;

/// GIC distributor base
pub const GICD_BASE: usize = 0x0800_0000;
/// GIC CPU interface base
pub const GICC_BASE: usize = 0x0801_0000;

/// Trust-zone memory partition controller base
pub const TZC_BASE: usize = 0x0c10_0000;
/// Tamper controller base (absent on some hardware revisions)
pub const TAMP_BASE: usize = 0x0c11_0000;
/// SP805-style independent watchdog base
pub const WDOG_BASE: usize = 0x0c12_0000;
/// Fuse / boot-configuration shadow block base
pub const FUSE_BASE: usize = 0x0c13_0000;
/// Clock tree status block base
pub const CLK_BASE: usize = 0x0c14_0000;

/// Virtio MMIO windows scanned for an entropy device at RNG init
pub const VIRTIO_MMIO_ADDRS: [usize; 8] = [
    0x0a000000, 0x0a000200, 0x0a000400, 0x0a000600, 0x0a000800, 0x0a000a00, 0x0a000c00, 0x0a000e00,
];

// ============================================================================
// On-chip memory layout (secure / non-secure split)
// ============================================================================

/// On-chip SRAM bank base
pub const SYSRAM_BASE: usize = 0x2ffc_0000;
/// On-chip SRAM bank size (256 KiB)
pub const SYSRAM_SIZE: usize = 0x4_0000;

/// Secure SRAM region base; must equal the bank base
pub const SEC_SYSRAM_BASE: usize = SYSRAM_BASE;
/// Secure SRAM region size
pub const SEC_SYSRAM_SIZE: usize = 0x2_0000;

/// Non-secure SRAM region, `None` on all-secure layouts.
/// When present it must run exactly to the end of the bank.
pub const NS_SYSRAM_BASE: Option<usize> = Some(0x2ffe_0000);
/// Non-secure SRAM region size (meaningless when `NS_SYSRAM_BASE` is `None`)
pub const NS_SYSRAM_SIZE: usize = 0x2_0000;

/// Boot ROM base; the ROM bank is always fully secure
pub const ROM_BASE: usize = 0x0000_0000;
/// Boot ROM size (128 KiB)
pub const ROM_SIZE: usize = 0x2_0000;

/// Minimum protection granule of the partition controller (4 KiB)
pub const GRANULE_SIZE: usize = 0x1000;
/// log2 of [`GRANULE_SIZE`]
pub const GRANULE_SHIFT: usize = 12;

// ============================================================================
// Secure interrupt sources
// ============================================================================

/// Low-order bits of the GIC interrupt acknowledge value that carry the
/// interrupt ID; higher bits are CPU/source metadata and must be masked
/// off before dispatch.
pub const INT_ID_MASK: u32 = 0x3ff;

/// Memory partition controller violation interrupt (SPI)
pub const IRQ_TZC: u32 = 36;
/// Tamper controller interrupt (SPI)
pub const IRQ_TAMPER: u32 = 37;
/// Bus/fabric error interrupt (SPI)
pub const IRQ_BUS_ERROR: u32 = 38;

// ============================================================================
// Backup register bank partition
// ============================================================================

/// Total battery-backed backup registers in the tamper controller
pub const BKP_REG_COUNT: u32 = 32;
/// Backup registers reserved to the secure world (zone 1)
pub const BKP_SEC_REG_COUNT: u32 = 10;
/// Backup registers shared between worlds (zone 2); the remainder of the
/// bank is implicitly non-secure
pub const BKP_SHARED_REG_COUNT: u32 = 0;

/// Watchdog timeout, in watchdog clock ticks (~32 kHz clock, ~30 s)
pub const WDOG_LOAD_TICKS: u32 = 0x000f_0000;
