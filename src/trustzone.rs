//! Trust-zone partition configurator
//!
//! Programs the memory partition controller that splits on-chip ROM
//! and SRAM into secure and non-secure ranges. This must be the first
//! security-relevant action after console bring-up and before any
//! non-secure-capable peripheral is touched: a failure here leaves the
//! trust boundary undefined, so every error is fatal upstream.
//!
//! The controller's range registers encode "index of the last secure
//! granule", not a byte count. The off-by-one that implies lives in
//! exactly one place, [`secure_range_units`], derived once from the
//! static layout in `config.rs`.

use core::ptr::{read_volatile, write_volatile};

use spinning_top::Spinlock;

use crate::config;

// ============================================================================
// Static layout invariants (build-time, not runtime)
// ============================================================================

const _: () = assert!(
    config::SEC_SYSRAM_BASE == config::SYSRAM_BASE,
    "secure SRAM must start at the bank base"
);
const _: () = assert!(
    config::SEC_SYSRAM_BASE + config::SEC_SYSRAM_SIZE
        <= config::SYSRAM_BASE + config::SYSRAM_SIZE,
    "secure SRAM must fit inside the bank"
);
const _: () = {
    match config::NS_SYSRAM_BASE {
        Some(ns_base) => {
            assert!(
                ns_base >= config::SEC_SYSRAM_BASE + config::SEC_SYSRAM_SIZE,
                "non-secure SRAM overlaps the secure region"
            );
            assert!(
                ns_base + config::NS_SYSRAM_SIZE == config::SYSRAM_BASE + config::SYSRAM_SIZE,
                "non-secure SRAM must end exactly at the bank end"
            );
            assert!(
                ns_base % config::GRANULE_SIZE == 0,
                "non-secure SRAM base must be granule aligned"
            );
        }
        None => {}
    }
};

// ============================================================================
// Range encoding
// ============================================================================

/// Range register value meaning "entire bank secure"
pub const RANGE_ALL_SECURE: u32 = 0x3ff;

/// Last-secure-granule index for a bank whose non-secure region (if
/// any) starts at `ns_base`. `None` means the bank is fully secure.
///
/// The register encodes the index of the last secure unit, so one
/// granule is backed off the byte-derived count; getting this wrong
/// silently moves the trust boundary by a full granule.
pub const fn secure_range_units(bank_base: usize, ns_base: Option<usize>) -> u32 {
    match ns_base {
        None => RANGE_ALL_SECURE,
        Some(ns) => (((ns - bank_base) >> config::GRANULE_SHIFT) - 1) as u32,
    }
}

/// SRAM range value, derived once from the static layout
pub const SYSRAM_SECURE_RANGE: u32 =
    secure_range_units(config::SYSRAM_BASE, config::NS_SYSRAM_BASE);
/// ROM is always fully secure
pub const ROM_SECURE_RANGE: u32 = RANGE_ALL_SECURE;

/// Partitionable regions, in controller register order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Rom = 0,
    Sysram = 1,
}

// ============================================================================
// Partition controller driver
// ============================================================================

/// Register offsets
const REG_RANGE_BASE: usize = 0x000; // one range register per region
const REG_VIOL_STATUS: usize = 0x010; // bit 0: violation pending
const REG_VIOL_ADDR: usize = 0x014; // faulting address
const REG_VIOL_CLEAR: usize = 0x018; // write 1 to acknowledge
const REG_LOCK: usize = 0x020; // bit 0: configuration locked
const REG_PERIPH_ID: usize = 0x3f0;

const VIOL_PENDING: u32 = 1 << 0;
const LOCK_BIT: u32 = 1 << 0;

/// Peripheral ID the driver accepts; anything else is an unknown
/// revision and the trust boundary cannot be relied on.
pub const TZC_PERIPH_ID: u32 = 0x00e7_2c01;

/// Why partition configuration failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TzError {
    /// Controller did not identify itself with a supported revision
    BadRevision(u32),
    /// Configuration refused after security lockdown
    Locked,
}

impl core::fmt::Display for TzError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TzError::BadRevision(id) => write!(f, "unsupported controller revision {:#010x}", id),
            TzError::Locked => write!(f, "partition configuration is locked"),
        }
    }
}

/// Memory partition controller driver. Lock state is mirrored in the
/// driver so refusal does not depend on the hardware bit reading back.
pub struct TzController {
    base: usize,
    locked: bool,
}

impl TzController {
    /// Create a driver for the controller at `base`
    pub const fn new(base: usize) -> Self {
        Self { base, locked: false }
    }

    #[inline]
    fn read(&self, offset: usize) -> u32 {
        // SAFETY: offsets are private constants inside the controller window
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write(&mut self, offset: usize, value: u32) {
        // SAFETY: offsets are private constants inside the controller window
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }

    /// Verify the controller responds with a supported revision.
    /// Idempotent; also the recovery step of the violation fault path.
    pub fn init(&mut self) -> Result<(), TzError> {
        let id = self.read(REG_PERIPH_ID);
        if id != TZC_PERIPH_ID {
            return Err(TzError::BadRevision(id));
        }
        Ok(())
    }

    /// Program the last-secure-granule index for one region
    pub fn configure_region(&mut self, region: Region, range: u32) -> Result<(), TzError> {
        if self.locked() {
            return Err(TzError::Locked);
        }
        self.write(REG_RANGE_BASE + (region as usize) * 4, range);
        Ok(())
    }

    /// Read back a region's range register
    pub fn region_range(&self, region: Region) -> u32 {
        self.read(REG_RANGE_BASE + (region as usize) * 4)
    }

    /// Read and acknowledge the pending violation record, if any.
    /// The faulting address is only diagnostic; the fault itself is
    /// unrecoverable and the caller halts after draining.
    pub fn drain_violation(&mut self) {
        let status = self.read(REG_VIOL_STATUS);
        if status & VIOL_PENDING != 0 {
            let addr = self.read(REG_VIOL_ADDR);
            crate::error!("partition violation at {:#010x}", addr);
            self.write(REG_VIOL_CLEAR, VIOL_PENDING);
        }
    }

    /// Irreversibly lock partition configuration
    pub fn lock(&mut self) {
        self.locked = true;
        self.write(REG_LOCK, LOCK_BIT);
    }

    fn locked(&self) -> bool {
        self.locked || self.read(REG_LOCK) & LOCK_BIT != 0
    }
}

/// Apply the static layout: ROM fully secure, SRAM secure-only or
/// split per `config.rs`. Idempotent; every failure is fatal upstream
/// because there is no safe insecure fallback.
pub fn configure(tzc: &mut TzController) -> Result<(), TzError> {
    tzc.init()?;
    tzc.configure_region(Region::Rom, ROM_SECURE_RANGE)?;
    tzc.configure_region(Region::Sysram, SYSRAM_SECURE_RANGE)?;
    Ok(())
}

// ============================================================================
// Installed controller (used by the interrupt dispatcher)
// ============================================================================

static CONTROLLER: Spinlock<Option<TzController>> = Spinlock::new(None);

/// Install the configured controller for the fault path
pub fn install(tzc: TzController) {
    *CONTROLLER.lock() = Some(tzc);
}

/// Run `f` with the installed controller, if any
pub fn with_controller<R>(f: impl FnOnce(Option<&mut TzController>) -> R) -> R {
    let mut guard = CONTROLLER.lock();
    f(guard.as_mut())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_regs() -> Box<[u32; 256]> {
        let mut regs = Box::new([0u32; 256]);
        regs[REG_PERIPH_ID / 4] = TZC_PERIPH_ID;
        regs
    }

    fn controller(regs: &mut [u32; 256]) -> TzController {
        TzController::new(regs.as_mut_ptr() as usize)
    }

    #[test]
    fn range_derivation_matches_layout_formula() {
        // Split layout from config.rs: (0x2ffe0000 - 0x2ffc0000) / 4K - 1
        assert_eq!(secure_range_units(0x2ffc_0000, Some(0x2ffe_0000)), 0x1f);
        assert_eq!(SYSRAM_SECURE_RANGE, 0x1f);
        // Minimal split: one secure granule
        assert_eq!(secure_range_units(0x2ffc_0000, Some(0x2ffc_1000)), 0);
        // Larger bank, NS window in the middle of a 1 MiB bank
        assert_eq!(secure_range_units(0x1000_0000, Some(0x1008_0000)), 0x7f);
        // Degenerate case: no non-secure region at all
        assert_eq!(secure_range_units(0x2ffc_0000, None), RANGE_ALL_SECURE);
    }

    #[test]
    fn configure_programs_rom_and_sysram() {
        let mut regs = fake_regs();
        let mut tzc = controller(&mut regs);
        configure(&mut tzc).unwrap();
        assert_eq!(tzc.region_range(Region::Rom), RANGE_ALL_SECURE);
        assert_eq!(tzc.region_range(Region::Sysram), SYSRAM_SECURE_RANGE);
    }

    #[test]
    fn configure_is_idempotent() {
        let mut regs = fake_regs();
        let mut tzc = controller(&mut regs);
        configure(&mut tzc).unwrap();
        let snapshot = *regs;
        let mut tzc = controller(&mut regs);
        configure(&mut tzc).unwrap();
        assert_eq!(*regs, snapshot, "second application must not shift the boundary");
    }

    #[test]
    fn unknown_revision_is_refused() {
        let mut regs = Box::new([0u32; 256]);
        regs[REG_PERIPH_ID / 4] = 0xdead_beef;
        let mut tzc = controller(&mut regs);
        assert_eq!(configure(&mut tzc), Err(TzError::BadRevision(0xdead_beef)));
    }

    #[test]
    fn locked_controller_refuses_reconfiguration() {
        let mut regs = fake_regs();
        let mut tzc = controller(&mut regs);
        configure(&mut tzc).unwrap();
        tzc.lock();
        assert_eq!(tzc.configure_region(Region::Sysram, RANGE_ALL_SECURE), Err(TzError::Locked));
        // Partition state is unchanged by the refused write.
        assert_eq!(tzc.region_range(Region::Sysram), SYSRAM_SECURE_RANGE);
    }

    #[test]
    fn lock_holds_even_if_the_lock_register_reads_clear() {
        let mut regs = fake_regs();
        let mut tzc = controller(&mut regs);
        configure(&mut tzc).unwrap();
        tzc.lock();
        // Hardware that drops the lock bit must not reopen config.
        regs[REG_LOCK / 4] = 0;
        assert_eq!(tzc.configure_region(Region::Sysram, RANGE_ALL_SECURE), Err(TzError::Locked));
    }

    #[test]
    fn drain_violation_acknowledges_pending_record() {
        let mut regs = fake_regs();
        regs[REG_VIOL_STATUS / 4] = VIOL_PENDING;
        regs[REG_VIOL_ADDR / 4] = 0x2ffe_4000;
        let mut tzc = controller(&mut regs);
        tzc.drain_violation();
        assert_eq!(regs[REG_VIOL_CLEAR / 4], VIOL_PENDING);
    }
}
