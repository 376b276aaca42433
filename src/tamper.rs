//! Tamper detection and response
//!
//! Four internal sensors (power domain, temperature, low- and
//! high-speed oscillator monitors) feed a tamper controller that owns
//! the battery-backed backup register bank. Bring-up order matters:
//! the backup bank is partitioned into trust zones before any source
//! is armed, otherwise there is a window where tamper status could be
//! read or cleared from the wrong world.
//!
//! The response contract is fail-secure: a detected tamper has exactly
//! two outcomes, a diagnostic record and a full system reset. The
//! bound callback only *directs* the reset; the controller driver
//! performs it, so no code path after detection can intercept it.

use core::ptr::{read_volatile, write_volatile};

use spinning_top::Spinlock;

use crate::config;

/// Internal tamper sources, identified on the wire by 1-based indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TamperSource {
    RtcPowerDomain = 1,
    Temperature = 2,
    LseMonitor = 3,
    HseMonitor = 4,
}

impl TamperSource {
    pub const ALL: [TamperSource; 4] = [
        TamperSource::RtcPowerDomain,
        TamperSource::Temperature,
        TamperSource::LseMonitor,
        TamperSource::HseMonitor,
    ];

    /// Map a wire identifier back to a source; identifiers outside
    /// the known set yield `None`, never an out-of-bounds lookup.
    pub fn from_id(id: u32) -> Option<TamperSource> {
        match id {
            1 => Some(TamperSource::RtcPowerDomain),
            2 => Some(TamperSource::Temperature),
            3 => Some(TamperSource::LseMonitor),
            4 => Some(TamperSource::HseMonitor),
            _ => None,
        }
    }

    /// Human-readable name for diagnostics
    pub fn name(self) -> &'static str {
        match self {
            TamperSource::RtcPowerDomain => "RTC power domain",
            TamperSource::Temperature => "Temperature monitoring",
            TamperSource::LseMonitor => "LSE monitoring",
            TamperSource::HseMonitor => "HSE monitoring",
        }
    }

    const fn bit(self) -> u32 {
        1 << (self as u32 - 1)
    }
}

/// Directive returned by a tamper response callback. The driver acts
/// on it; the callback itself has no side effect on the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TamperResponse {
    /// Acknowledge the tamper and force a full system reset
    AckAndReset,
}

/// Response callback bound to each armed source
pub type TamperAction = fn(id: u32) -> TamperResponse;

/// Shared response for every internal source: name the source (or
/// "unknown" for identifiers outside the set), record the diagnostic,
/// direct a reset. Never continues in a possibly-compromised state.
pub fn default_tamper_action(id: u32) -> TamperResponse {
    let name = TamperSource::from_id(id).map(TamperSource::name).unwrap_or("unknown");
    crate::error!("tamper {} ({}) detected", id, name);
    TamperResponse::AckAndReset
}

/// Backup register bank partition: an explicit secure-only zone, an
/// explicit shared zone, the remainder implicitly non-secure.
#[derive(Debug, Clone, Copy)]
pub struct BackupZoneConfig {
    pub zone1_secure_regs: u32,
    pub zone2_shared_regs: u32,
}

/// Bank partition for this platform
pub const BACKUP_ZONES: BackupZoneConfig = BackupZoneConfig {
    zone1_secure_regs: config::BKP_SEC_REG_COUNT,
    zone2_shared_regs: config::BKP_SHARED_REG_COUNT,
};

/// Why tamper configuration failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TamperError {
    /// Backup zone counts exceed the bank
    InvalidZones,
    /// Controller did not accept the committed configuration
    Rejected,
    /// Configuration refused after security lockdown
    Locked,
}

impl core::fmt::Display for TamperError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TamperError::InvalidZones => write!(f, "backup zone counts exceed the bank"),
            TamperError::Rejected => write!(f, "controller rejected tamper configuration"),
            TamperError::Locked => write!(f, "tamper configuration is locked"),
        }
    }
}

// ============================================================================
// Tamper controller driver
// ============================================================================

/// Register offsets
const REG_CR1: usize = 0x00; // internal source enable bits
const REG_CR2: usize = 0x04; // feature control
const REG_SMCR: usize = 0x10; // secure mode: zone counts + secure access
const REG_IER: usize = 0x14; // interrupt enable
const REG_SR: usize = 0x18; // pending status
const REG_SCR: usize = 0x1c; // write 1 to acknowledge
const REG_RSTCR: usize = 0x20; // reset request
const REG_LOCKR: usize = 0x24; // bit 0: configuration locked
const REG_PERIPH_ID: usize = 0x3f0;

/// CR2: attach an RTC timestamp to every tamper event
const CR2_TIMESTAMP: u32 = 1 << 31;
/// SMCR: controller registers secure-world-only
const SMCR_SECURE_ACCESS: u32 = 1 << 30;
const SMCR_ZONE1_SHIFT: u32 = 0;
const SMCR_ZONE2_SHIFT: u32 = 16;
/// RSTCR: request a full system reset
const RSTCR_RESET_REQ: u32 = 1 << 0;
const LOCK_BIT: u32 = 1 << 0;

/// Mask of the four internal source bits
const INTERNAL_SOURCE_MASK: u32 = 0xf;

/// Peripheral ID reported by present hardware revisions
pub const TAMP_PERIPH_ID: u32 = 0x0001_4a4d;

/// Tamper controller driver. Sources are staged with
/// [`TampController::arm_internal`] and take effect atomically at
/// [`TampController::commit`]. Lock state is mirrored in the driver so
/// refusal does not depend on the hardware bit reading back.
pub struct TampController {
    base: usize,
    staged_enable: u32,
    locked: bool,
    actions: [Option<TamperAction>; 4],
}

impl TampController {
    /// Probe for a controller at `base`. Absence (older hardware
    /// revisions) is not an error; tamper handling is skipped.
    pub fn probe(base: usize) -> Option<TampController> {
        // SAFETY: reading the ID register of the controller window
        let id = unsafe { read_volatile((base + REG_PERIPH_ID) as *const u32) };
        if id != TAMP_PERIPH_ID {
            return None;
        }
        Some(TampController { base, staged_enable: 0, locked: false, actions: [None; 4] })
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

    fn locked(&self) -> bool {
        self.locked || self.read(REG_LOCKR) & LOCK_BIT != 0
    }

    /// Partition the backup register bank. Must run before any source
    /// is armed.
    pub fn set_secure_backup_zones(&mut self, zones: &BackupZoneConfig) -> Result<(), TamperError> {
        if self.locked() {
            return Err(TamperError::Locked);
        }
        if zones.zone1_secure_regs + zones.zone2_shared_regs > config::BKP_REG_COUNT {
            return Err(TamperError::InvalidZones);
        }
        let smcr = self.read(REG_SMCR) & SMCR_SECURE_ACCESS;
        self.write(
            REG_SMCR,
            smcr | (zones.zone1_secure_regs << SMCR_ZONE1_SHIFT)
                | (zones.zone2_shared_regs << SMCR_ZONE2_SHIFT),
        );
        Ok(())
    }

    /// Make the controller's own control/status registers
    /// secure-world-only.
    pub fn secure_access_only(&mut self) {
        let smcr = self.read(REG_SMCR);
        self.write(REG_SMCR, smcr | SMCR_SECURE_ACCESS);
    }

    /// Stage an internal source as enabled and bind its response
    /// callback. Takes effect at [`TampController::commit`].
    pub fn arm_internal(&mut self, source: TamperSource, action: TamperAction) -> Result<(), TamperError> {
        if self.locked() {
            return Err(TamperError::Locked);
        }
        self.staged_enable |= source.bit();
        self.actions[source as usize - 1] = Some(action);
        Ok(())
    }

    /// Commit the staged configuration to hardware. Read-back
    /// verification catches a controller that silently refuses the
    /// enable set.
    pub fn commit(&mut self) -> Result<(), TamperError> {
        if self.locked() {
            return Err(TamperError::Locked);
        }
        self.write(REG_CR1, self.staged_enable);
        self.write(REG_IER, self.staged_enable);
        if self.read(REG_CR1) != self.staged_enable {
            return Err(TamperError::Rejected);
        }
        Ok(())
    }

    /// Attach an RTC timestamp to future tamper events
    pub fn enable_timestamp(&mut self) {
        let cr2 = self.read(REG_CR2);
        self.write(REG_CR2, cr2 | CR2_TIMESTAMP);
    }

    /// Irreversibly lock tamper configuration
    pub fn lock(&mut self) {
        self.locked = true;
        self.write(REG_LOCKR, LOCK_BIT);
    }

    /// Service a tamper interrupt: for every pending source run its
    /// bound callback, acknowledge, and on `AckAndReset` raise the
    /// system reset request. A pending source with no bound action
    /// still resets; silently continuing would break the fail-secure
    /// contract.
    pub fn interrupt_handler(&mut self) {
        let pending = self.read(REG_SR);
        let mut reset = false;

        for source in TamperSource::ALL {
            if pending & source.bit() == 0 {
                continue;
            }
            let id = source as u32;
            let response = match self.actions[id as usize - 1] {
                Some(action) => action(id),
                None => {
                    crate::error!("tamper {} pending with no bound action", id);
                    TamperResponse::AckAndReset
                }
            };
            match response {
                TamperResponse::AckAndReset => {
                    self.write(REG_SCR, source.bit());
                    reset = true;
                }
            }
        }

        let unknown = pending & !INTERNAL_SOURCE_MASK;
        if unknown != 0 {
            crate::error!("unknown tamper status bits {:#x}", unknown);
            self.write(REG_SCR, unknown);
            reset = true;
        }

        if reset {
            self.write(REG_RSTCR, RSTCR_RESET_REQ);
        }
    }
}

/// Arm the tamper subsystem in the required order: partition the
/// backup bank, restrict register access to the secure world, stage
/// all four internal sources on the shared response, commit, enable
/// timestamping. Zone and commit rejections are fatal upstream.
pub fn init(tamp: &mut TampController) -> Result<(), TamperError> {
    tamp.set_secure_backup_zones(&BACKUP_ZONES)?;
    tamp.secure_access_only();
    for source in TamperSource::ALL {
        tamp.arm_internal(source, default_tamper_action)?;
    }
    tamp.commit()?;
    tamp.enable_timestamp();
    Ok(())
}

// ============================================================================
// Installed controller (used by the interrupt dispatcher)
// ============================================================================

static CONTROLLER: Spinlock<Option<TampController>> = Spinlock::new(None);

/// Install the armed controller for the interrupt path
pub fn install(tamp: TampController) {
    *CONTROLLER.lock() = Some(tamp);
}

/// Run `f` with the installed controller, if any
pub fn with_controller<R>(f: impl FnOnce(Option<&mut TampController>) -> R) -> R {
    let mut guard = CONTROLLER.lock();
    f(guard.as_mut())
}
