//! Fatal-condition handling
//!
//! Every unrecoverable condition in the stage funnels through
//! [`Fatal`]: the setup phases return it synchronously, the interrupt
//! dispatcher reaches it through its halt outcome, and a single
//! top-level handler logs the condition and stops the CPU. There is no
//! recovery surface at this layer; from the outside a fatal condition
//! is indistinguishable from a hang.

use crate::handoff::HandoffError;
use crate::tamper::TamperError;
use crate::trustzone::TzError;

/// An unrecoverable condition. Constructing one of these means no
/// further setup code may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    /// Handoff parameter block missing, mistyped or under-versioned
    Handoff(HandoffError),
    /// Trust-zone partition controller unavailable or rejected config
    TrustZone(TzError),
    /// Device tree unreadable
    DeviceTree,
    /// Fuse / boot-configuration probe failure
    FuseProbe,
    /// Clock tree probe failure
    ClockProbe,
    /// Regulator core configuration failure
    RegulatorConfig,
    /// Tamper backup-zone or configuration commit failure
    Tamper(TamperError),
    /// Watchdog could not be armed; an unsupervised secure stage is
    /// not acceptable
    Watchdog,
}

impl core::fmt::Display for Fatal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Fatal::Handoff(e) => write!(f, "handoff contract violated: {}", e),
            Fatal::TrustZone(e) => write!(f, "trust-zone partitioning failed: {}", e),
            Fatal::DeviceTree => write!(f, "device tree unreadable"),
            Fatal::FuseProbe => write!(f, "fuse/boot-config probe failed"),
            Fatal::ClockProbe => write!(f, "clock tree probe failed"),
            Fatal::RegulatorConfig => write!(f, "regulator core config failed"),
            Fatal::Tamper(e) => write!(f, "tamper subsystem config failed: {}", e),
            Fatal::Watchdog => write!(f, "watchdog arm failed"),
        }
    }
}

/// Stop the CPU permanently in a low-power wait loop.
pub fn halt() -> ! {
    loop {
        #[cfg(target_arch = "aarch64")]
        // SAFETY: wfi puts the CPU in a low-power state until the next
        // interrupt; it has no memory safety implications.
        unsafe {
            core::arch::asm!("wfi")
        }
        #[cfg(not(target_arch = "aarch64"))]
        core::hint::spin_loop();
    }
}

/// Log a fatal condition and halt. The single terminal exit for every
/// error in the fatal tier.
pub fn die(err: Fatal) -> ! {
    crate::error!("{}", err);
    halt()
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use core::fmt::Write;

    crate::console::print("\n!!! PANIC !!!\n");
    // Stack-based formatting: the panic path must not depend on any
    // state the panic may have corrupted.
    let mut buf = crate::console::StackWriter::<256>::new();
    let _ = write!(buf, "{}\n", info);
    crate::console::print(buf.as_str());
    halt()
}
