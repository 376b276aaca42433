//! Default platform collaborators
//!
//! [`VirtServices`] implements [`PlatformServices`] for the target
//! board. Everything here is a thin driver or probe over a fixed MMIO
//! window from `config.rs`; the orchestration and error tiering live
//! in `platform.rs`, not here.

use core::ptr::{read_volatile, write_volatile};

use arm_pl031::Rtc;
use spinning_top::Spinlock;

use crate::config;
use crate::platform::{PlatformServices, SvcError};
use crate::{gic, vectors};

// PL031 RTC instance; supplies the wall-clock for tamper timestamps
static RTC: Spinlock<Option<Rtc>> = Spinlock::new(None);

/// The three secure interrupt sources this stage owns
const SECURE_IRQS: [u32; 3] = [config::IRQ_TZC, config::IRQ_TAMPER, config::IRQ_BUS_ERROR];

// ============================================================================
// SP805-style watchdog
// ============================================================================

const WDOG_LOAD: usize = 0x000;
const WDOG_CONTROL: usize = 0x008;
const WDOG_LOCK: usize = 0xc00;

/// Writing this to the lock register opens it; anything else closes it
const WDOG_UNLOCK_MAGIC: u32 = 0x1acc_e551;
/// CONTROL: interrupt enable + reset on second timeout
const WDOG_INTEN_RESEN: u32 = 0x3;

/// SP805 watchdog driver
struct Sp805 {
    base: usize,
}

impl Sp805 {
    const fn new(base: usize) -> Self {
        Self { base }
    }

    #[inline]
    fn read(&self, offset: usize) -> u32 {
        // SAFETY: offsets are private constants inside the watchdog window
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write(&mut self, offset: usize, value: u32) {
        // SAFETY: offsets are private constants inside the watchdog window
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }

    /// Load the timeout, enable interrupt+reset, and relock the
    /// register file. Read-back catches a dead or held-in-reset block.
    fn arm(&mut self, load_ticks: u32) -> Result<(), SvcError> {
        self.write(WDOG_LOCK, WDOG_UNLOCK_MAGIC);
        self.write(WDOG_LOAD, load_ticks);
        self.write(WDOG_CONTROL, WDOG_INTEN_RESEN);
        self.write(WDOG_LOCK, 0);
        if self.read(WDOG_CONTROL) != WDOG_INTEN_RESEN {
            return Err(SvcError("watchdog did not accept control word"));
        }
        Ok(())
    }
}

// ============================================================================
// Virtio entropy device probe
// ============================================================================

const VIRTIO_MMIO_MAGIC_VALUE: usize = 0x000;
const VIRTIO_MMIO_DEVICE_ID: usize = 0x008;

/// "virt" little-endian
const VIRTIO_MAGIC: u32 = 0x7472_6976;
/// Device ID for entropy devices
const VIRTIO_DEVICE_ID_RNG: u32 = 4;

/// Scan the virtio windows for an entropy device and return its base
fn probe_entropy_device(addrs: &[usize]) -> Option<usize> {
    for &base in addrs {
        // SAFETY: probing fixed device windows defined by the platform
        let magic = unsafe { read_volatile((base + VIRTIO_MMIO_MAGIC_VALUE) as *const u32) };
        if magic != VIRTIO_MAGIC {
            continue;
        }
        // SAFETY: same window, device ID register
        let id = unsafe { read_volatile((base + VIRTIO_MMIO_DEVICE_ID) as *const u32) };
        if id == VIRTIO_DEVICE_ID_RNG {
            return Some(base);
        }
    }
    None
}

// ============================================================================
// Fuse and clock status blocks
// ============================================================================

const STATUS_READY: u32 = 1 << 0;

fn probe_ready_block(base: usize, what: &'static str) -> Result<(), SvcError> {
    // SAFETY: reading the status word of a fixed platform block
    let status = unsafe { read_volatile(base as *const u32) };
    if status & STATUS_READY == 0 {
        return Err(SvcError(what));
    }
    Ok(())
}

// ============================================================================
// Default services
// ============================================================================

/// Collaborator implementations for the target board
pub struct VirtServices;

impl PlatformServices for VirtServices {
    fn console_setup(&mut self) {
        // The secure PL011 needs no baud programming under this
        // platform's fixed clocking; announce the stage and move on.
        crate::console::print("kekkai secure stage\n");
    }

    fn dt_open_and_check(&mut self, addr: usize) -> Result<(), SvcError> {
        if addr == 0 {
            return Err(SvcError("no device tree address"));
        }
        // SAFETY: the handoff contract passes a readable DTB location
        let fdt = unsafe { fdt::Fdt::from_ptr(addr as *const u8) }
            .map_err(|_| SvcError("device tree failed validation"))?;
        if fdt.memory().regions().next().is_none() {
            return Err(SvcError("device tree has no memory node"));
        }
        Ok(())
    }

    fn fuse_probe(&mut self) -> Result<(), SvcError> {
        probe_ready_block(config::FUSE_BASE, "fuse shadow block not ready")
    }

    fn clock_probe(&mut self) -> Result<(), SvcError> {
        probe_ready_block(config::CLK_BASE, "clock tree not ready")
    }

    fn uart_console_setup(&mut self) -> Result<(), SvcError> {
        // Same UART as the early console once clocks are probed.
        Ok(())
    }

    fn delay_timer_init(&mut self) {
        #[cfg(target_arch = "aarch64")]
        {
            let freq: u64;
            // SAFETY: reading the counter frequency register
            unsafe {
                core::arch::asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack));
            }
            crate::info!("delay timer at {} Hz", freq);
        }
    }

    fn pmic_present(&mut self) -> bool {
        // This board has fixed rails only.
        false
    }

    fn pmic_init(&mut self) {}

    fn fixed_regulators_register(&mut self) {
        crate::info!("fixed regulators registered");
    }

    fn regulator_config(&mut self) -> Result<(), SvcError> {
        // Fixed always-on rails; nothing to sequence.
        Ok(())
    }

    fn regulator_cleanup(&mut self) {}

    fn usb_phy_regulator_disable(&mut self) -> Result<(), SvcError> {
        // Only PMIC-driven boards carry a switchable USB PHY supply.
        Ok(())
    }

    fn clock_mcu_protect(&mut self, enable: bool) {
        if !enable {
            crate::info!("MCU subsystem clock protection dropped");
        }
    }

    fn rtc_init(&mut self) -> Result<(), SvcError> {
        // SAFETY: fixed PL031 window, mapped secure-only
        let rtc = unsafe { Rtc::new(config::RTC_BASE as *mut _) };
        let now = rtc.get_unix_timestamp();
        *RTC.lock() = Some(rtc);
        crate::info!("RTC up, unix time {}", now);
        Ok(())
    }

    fn rtc_enable_tamper_timestamp(&mut self) {
        // The tamper controller latches the RTC counter itself; here
        // we only confirm the clock is live for the snapshot.
        match RTC.lock().as_ref().map(|r| r.get_unix_timestamp()) {
            Some(now) => crate::info!("tamper timestamping armed at {}", now),
            None => crate::warn!("tamper timestamping armed without RTC"),
        }
    }

    fn rng_init(&mut self) -> Result<(), SvcError> {
        match probe_entropy_device(&config::VIRTIO_MMIO_ADDRS) {
            Some(base) => {
                crate::info!("entropy device at {:#x}", base);
                Ok(())
            }
            None => Err(SvcError("no entropy device found")),
        }
    }

    fn watchdog_arm(&mut self) -> Result<(), SvcError> {
        Sp805::new(config::WDOG_BASE).arm(config::WDOG_LOAD_TICKS)
    }

    fn interrupt_controller_arm(&mut self) {
        let mut controller = gic::Gic::new(config::GICD_BASE, config::GICC_BASE);
        controller.init();
        for irq in SECURE_IRQS {
            controller.set_group0(irq);
        }
        gic::install(controller);
        vectors::init();
    }

    fn interrupt_delivery_enable(&mut self) {
        for irq in SECURE_IRQS {
            gic::enable_irq(irq);
        }
        vectors::enable_fiq();
    }

    fn management_server_start(&mut self) {
        // The management-interface server is its own component; by the
        // lock ordering above it can no longer change security state.
        crate::info!("management interface server released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchdog_arm_unlocks_programs_and_relocks() {
        let mut regs = Box::new([0u32; 1024]);
        let mut wdog = Sp805 { base: regs.as_mut_ptr() as usize };
        wdog.arm(config::WDOG_LOAD_TICKS).unwrap();
        assert_eq!(regs[WDOG_LOAD / 4], config::WDOG_LOAD_TICKS);
        assert_eq!(regs[WDOG_CONTROL / 4], WDOG_INTEN_RESEN);
        assert_eq!(regs[WDOG_LOCK / 4], 0, "register file must be relocked");
    }

    #[test]
    fn entropy_probe_skips_non_rng_devices() {
        // Three fake windows: absent, a block device, an entropy device.
        let mut absent = Box::new([0u32; 4]);
        let mut block = Box::new([0u32; 4]);
        block[VIRTIO_MMIO_MAGIC_VALUE / 4] = VIRTIO_MAGIC;
        block[VIRTIO_MMIO_DEVICE_ID / 4] = 2;
        let mut rng = Box::new([0u32; 4]);
        rng[VIRTIO_MMIO_MAGIC_VALUE / 4] = VIRTIO_MAGIC;
        rng[VIRTIO_MMIO_DEVICE_ID / 4] = VIRTIO_DEVICE_ID_RNG;

        let addrs = [
            absent.as_mut_ptr() as usize,
            block.as_mut_ptr() as usize,
            rng.as_mut_ptr() as usize,
        ];
        assert_eq!(probe_entropy_device(&addrs), Some(addrs[2]));
        assert_eq!(probe_entropy_device(&addrs[..2]), None);
    }
}
