//! Generic Interrupt Controller (GICv2) driver
//!
//! Secure-world configuration: the three secure interrupt sources are
//! placed in Group 0 so they are delivered as FIQ to this stage, while
//! everything else stays masked until the normal world owns it.

use core::ptr::{read_volatile, write_volatile};

use spinning_top::Spinlock;

use crate::config;

// GIC Distributor register offsets
const GICD_CTLR: usize = 0x000; // Control Register
const GICD_IGROUPR: usize = 0x080; // Interrupt Group Registers
const GICD_ISENABLER: usize = 0x100; // Interrupt Set-Enable Registers
const GICD_ICENABLER: usize = 0x180; // Interrupt Clear-Enable Registers
const GICD_IPRIORITYR: usize = 0x400; // Interrupt Priority Registers

// GIC CPU Interface register offsets
const GICC_CTLR: usize = 0x000; // CPU Interface Control Register
const GICC_PMR: usize = 0x004; // Interrupt Priority Mask Register
const GICC_IAR: usize = 0x00c; // Interrupt Acknowledge Register
const GICC_EOIR: usize = 0x010; // End of Interrupt Register

/// GICC_CTLR: enable Group 0 + deliver Group 0 as FIQ
const GICC_ENABLE_GRP0_FIQ: u32 = (1 << 0) | (1 << 3);
/// GICD_CTLR: enable Group 0 forwarding
const GICD_ENABLE_GRP0: u32 = 1 << 0;

/// Interrupt IDs at or above this are reserved/spurious
const SPURIOUS_THRESHOLD: u32 = 1020;

/// GICv2 driver over the distributor and CPU interface windows
pub struct Gic {
    gicd: usize,
    gicc: usize,
}

impl Gic {
    pub const fn new(gicd: usize, gicc: usize) -> Self {
        Self { gicd, gicc }
    }

    #[inline]
    fn dist_write(&mut self, offset: usize, value: u32) {
        // SAFETY: offsets are private constants inside the distributor window
        unsafe { write_volatile((self.gicd + offset) as *mut u32, value) }
    }

    #[inline]
    fn dist_read(&self, offset: usize) -> u32 {
        // SAFETY: offsets are private constants inside the distributor window
        unsafe { read_volatile((self.gicd + offset) as *const u32) }
    }

    #[inline]
    fn cpu_write(&mut self, offset: usize, value: u32) {
        // SAFETY: offsets are private constants inside the CPU interface window
        unsafe { write_volatile((self.gicc + offset) as *mut u32, value) }
    }

    #[inline]
    fn cpu_read(&self, offset: usize) -> u32 {
        // SAFETY: offsets are private constants inside the CPU interface window
        unsafe { read_volatile((self.gicc + offset) as *const u32) }
    }

    /// Initialize distributor and CPU interface with every source
    /// masked; sources are opted in one by one with [`Gic::enable_irq`].
    pub fn init(&mut self) {
        self.dist_write(GICD_CTLR, 0);

        // Mask all interrupts
        for i in 0..32 {
            self.dist_write(GICD_ICENABLER + i * 4, 0xffff_ffff);
        }

        // Default priority for all sources
        for i in 0..256 {
            self.dist_write(GICD_IPRIORITYR + i * 4, 0xa0a0_a0a0);
        }

        self.dist_write(GICD_CTLR, GICD_ENABLE_GRP0);

        // Allow all priorities through, deliver Group 0 as FIQ
        self.cpu_write(GICC_PMR, 0xff);
        self.cpu_write(GICC_CTLR, GICC_ENABLE_GRP0_FIQ);
    }

    /// Place an interrupt in Group 0 (secure, FIQ)
    pub fn set_group0(&mut self, irq: u32) {
        if irq >= SPURIOUS_THRESHOLD {
            return;
        }
        let offset = GICD_IGROUPR + ((irq / 32) * 4) as usize;
        let cleared = self.dist_read(offset) & !(1 << (irq % 32));
        self.dist_write(offset, cleared);
    }

    /// Enable a specific IRQ
    pub fn enable_irq(&mut self, irq: u32) {
        if irq >= SPURIOUS_THRESHOLD {
            return;
        }
        let offset = GICD_ISENABLER + ((irq / 32) * 4) as usize;
        self.dist_write(offset, 1 << (irq % 32));
    }

    /// Disable a specific IRQ
    pub fn disable_irq(&mut self, irq: u32) {
        if irq >= SPURIOUS_THRESHOLD {
            return;
        }
        let offset = GICD_ICENABLER + ((irq / 32) * 4) as usize;
        self.dist_write(offset, 1 << (irq % 32));
    }

    /// Acknowledge the highest-priority pending interrupt and return
    /// the raw acknowledge value, or `None` for a spurious interrupt.
    pub fn acknowledge(&mut self) -> Option<u32> {
        let iar = self.cpu_read(GICC_IAR);
        if (iar & config::INT_ID_MASK) >= SPURIOUS_THRESHOLD {
            None
        } else {
            Some(iar)
        }
    }

    /// Signal end of interrupt handling. The controller does not
    /// unmask the serviced source until this runs, so handlers of the
    /// same class are never re-entered.
    pub fn end_of_interrupt(&mut self, iar: u32) {
        self.cpu_write(GICC_EOIR, iar);
    }
}

// ============================================================================
// Installed controller
// ============================================================================

static GIC: Spinlock<Option<Gic>> = Spinlock::new(None);

/// Install the armed controller for the interrupt entry path
pub fn install(gic: Gic) {
    *GIC.lock() = Some(gic);
}

/// Acknowledge on the installed controller
pub fn acknowledge() -> Option<u32> {
    GIC.lock().as_mut().and_then(Gic::acknowledge)
}

/// Enable a source on the installed controller
pub fn enable_irq(irq: u32) {
    if let Some(gic) = GIC.lock().as_mut() {
        gic.enable_irq(irq);
    }
}

/// End-of-interrupt on the installed controller
pub fn end_of_interrupt(iar: u32) {
    if let Some(gic) = GIC.lock().as_mut() {
        gic.end_of_interrupt(iar);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The distributor window spans 0x1000 bytes of registers we touch.
    fn fake_blocks() -> (Box<[u32; 1024]>, Box<[u32; 64]>) {
        (Box::new([0u32; 1024]), Box::new([0u32; 64]))
    }

    #[test]
    fn init_masks_everything_then_enables_group0() {
        let (mut gicd, mut gicc) = fake_blocks();
        let mut gic = Gic::new(gicd.as_mut_ptr() as usize, gicc.as_mut_ptr() as usize);
        gic.init();
        assert_eq!(gicd[GICD_CTLR / 4], GICD_ENABLE_GRP0);
        assert_eq!(gicd[GICD_ICENABLER / 4], 0xffff_ffff);
        assert_eq!(gicc[GICC_CTLR / 4], GICC_ENABLE_GRP0_FIQ);
        assert_eq!(gicc[GICC_PMR / 4], 0xff);
    }

    #[test]
    fn enable_irq_sets_the_right_bank_and_bit() {
        let (mut gicd, mut gicc) = fake_blocks();
        let mut gic = Gic::new(gicd.as_mut_ptr() as usize, gicc.as_mut_ptr() as usize);
        gic.enable_irq(config::IRQ_TAMPER); // SPI 37 -> bank 1, bit 5
        assert_eq!(gicd[(GICD_ISENABLER + 4) / 4], 1 << 5);
    }

    #[test]
    fn spurious_acknowledge_is_none() {
        let (mut gicd, mut gicc) = fake_blocks();
        gicc[GICC_IAR / 4] = 1023;
        let mut gic = Gic::new(gicd.as_mut_ptr() as usize, gicc.as_mut_ptr() as usize);
        assert!(gic.acknowledge().is_none());
        gicc[GICC_IAR / 4] = config::IRQ_TZC;
        assert_eq!(gic.acknowledge(), Some(config::IRQ_TZC));
    }
}
