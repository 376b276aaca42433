//! Secure interrupt dispatch
//!
//! The only asynchronous entry into the stage. Once the interrupt
//! controller is armed at the end of the early phase, any of three
//! hardware sources can preempt the main sequence: a memory-protection
//! violation, a tamper event, or a bus/fabric error. Raw acknowledge
//! values are masked down to a closed cause enumeration and dispatched
//! exhaustively; an identifier outside the set is logged and dropped
//! rather than treated as fatal, so future platform additions cannot
//! brick the stage.
//!
//! Every path here runs with the serviced interrupt still masked (the
//! GIC holds it until end-of-interrupt), so handlers of one class are
//! never re-entered.

use crate::config;
use crate::fatal;
use crate::tamper::TampController;
use crate::trustzone::TzController;
use crate::{gic, tamper, trustzone};

// ============================================================================
// IRQ Guard - RAII guard for masking interrupts
// ============================================================================

/// RAII guard that masks IRQs/FIQs when created and restores the
/// previous mask state when dropped, even if the guarded code panics.
pub struct IrqGuard {
    #[cfg_attr(not(target_arch = "aarch64"), allow(dead_code))]
    saved_daif: u64,
}

impl IrqGuard {
    #[cfg(target_arch = "aarch64")]
    #[inline]
    pub fn new() -> Self {
        let daif: u64;
        // SAFETY: Reading and modifying DAIF only affects interrupt
        // masking for the current CPU
        unsafe {
            core::arch::asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack));
            core::arch::asm!("msr daifset, #3", options(nomem, nostack));
            core::arch::asm!("isb", options(nomem, nostack));
        }
        Self { saved_daif: daif }
    }

    #[cfg(not(target_arch = "aarch64"))]
    #[inline]
    pub fn new() -> Self {
        Self { saved_daif: 0 }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: Restoring DAIF to its previous state is safe
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!("msr daif, {}", in(reg) self.saved_daif, options(nomem, nostack));
        }
    }
}

// ============================================================================
// Cause decoding and dispatch
// ============================================================================

/// The closed set of secure interrupt causes. Hardware acknowledge
/// values may carry bias bits above the ID field; masking with
/// [`config::INT_ID_MASK`] recovers the logical source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureIrqCause {
    /// Partition controller reported an access violation
    MemoryProtection,
    /// Tamper controller interrupt
    Tamper,
    /// Bus/fabric error
    BusError,
    /// Masked identifier matching no known source
    Unknown(u32),
}

impl SecureIrqCause {
    pub fn from_raw(raw: u32) -> SecureIrqCause {
        match raw & config::INT_ID_MASK {
            config::IRQ_TZC => SecureIrqCause::MemoryProtection,
            config::IRQ_TAMPER => SecureIrqCause::Tamper,
            config::IRQ_BUS_ERROR => SecureIrqCause::BusError,
            id => SecureIrqCause::Unknown(id),
        }
    }
}

/// What the dispatcher decided: return to the armed/idle state, or
/// stop the stage for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Idle,
    Halt,
}

/// Fault-response state machine. Stateless between events by design:
/// an unknown identifier must leave nothing behind that could corrupt
/// the handling of the next valid one.
pub fn dispatch(
    cause: SecureIrqCause,
    tzc: Option<&mut TzController>,
    tamp: Option<&mut TampController>,
) -> Outcome {
    match cause {
        SecureIrqCause::MemoryProtection => {
            crate::error!("memory protection violation");
            if let Some(tzc) = tzc {
                // Re-init is idempotent; drain logs and acknowledges
                // the violation record before the halt.
                let _ = tzc.init();
                tzc.drain_violation();
            }
            Outcome::Halt
        }
        SecureIrqCause::Tamper => {
            // The tamper subsystem decides whether to reset; this path
            // returns to idle either way.
            match tamp {
                Some(tamp) => tamp.interrupt_handler(),
                None => crate::warn!("tamper interrupt with no controller armed"),
            }
            Outcome::Idle
        }
        SecureIrqCause::BusError => {
            crate::error!("bus fabric error interrupt");
            Outcome::Halt
        }
        SecureIrqCause::Unknown(id) => {
            crate::error!("no secure handler for interrupt {}", id);
            Outcome::Idle
        }
    }
}

/// Secure interrupt entry: decode, dispatch against the installed
/// controllers, then either halt or acknowledge completion.
pub fn secure_interrupt_handler(raw: u32) {
    let cause = SecureIrqCause::from_raw(raw);
    let outcome = trustzone::with_controller(|tzc| {
        tamper::with_controller(|tamp| dispatch(cause, tzc, tamp))
    });
    match outcome {
        Outcome::Halt => fatal::halt(),
        Outcome::Idle => gic::end_of_interrupt(raw),
    }
}
