//! Platform setup orchestration
//!
//! The two linear setup phases of the stage, in the exact order the
//! security argument depends on:
//!
//! * [`early_setup`]: handoff validation and the first
//!   security-relevant action, trust-zone partitioning, before any
//!   non-secure-capable peripheral is touched.
//! * [`platform_setup`]: interrupt controller, secure peripherals,
//!   watchdog, then the irreversible security lock, and only then the
//!   management server.
//!
//! Collaborator drivers (clock tree, regulators, PMIC, RTC, RNG,
//! watchdog, device tree, management server) sit behind
//! [`PlatformServices`]; every fallible call is inspected at the call
//! site and classified fatal or advisory per the error tiering; there
//! is no unwinding.

use once_cell::race::OnceBool;
use spinning_top::Spinlock;

use crate::config;
use crate::fatal::{self, Fatal};
use crate::handoff::{BootContext, BootParams, EntryPointInfo, NEXT_STAGE_IMAGE_ID};
use crate::tamper::{self, TampController};
use crate::trustzone::{self, TzController};

/// Collaborator failure; carries only a diagnostic string because the
/// caller's reaction is decided by which call failed, not how.
#[derive(Debug, Clone, Copy)]
pub struct SvcError(pub &'static str);

impl core::fmt::Display for SvcError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.0)
    }
}

/// The contract this stage requires from its platform collaborators.
/// Each method is a black box returning success or failure; fatal
/// versus advisory classification happens at the call sites below.
pub trait PlatformServices {
    /// Bring up the early (pre-clock-tree) console
    fn console_setup(&mut self);
    /// Open and sanity-check the device tree at `addr`
    fn dt_open_and_check(&mut self, addr: usize) -> Result<(), SvcError>;
    /// Probe the fuse / boot-configuration shadow block
    fn fuse_probe(&mut self) -> Result<(), SvcError>;
    /// Probe the clock tree. Must run after the fuse probe; the
    /// ordering is a preserved platform contract.
    fn clock_probe(&mut self) -> Result<(), SvcError>;
    /// Re-run console setup over the full UART driver
    fn uart_console_setup(&mut self) -> Result<(), SvcError>;
    /// Initialize the delay timer
    fn delay_timer_init(&mut self);
    /// Whether the board carries a PMIC at all
    fn pmic_present(&mut self) -> bool;
    /// Bring up the PMIC (only called when present)
    fn pmic_init(&mut self);
    /// Register the board's fixed regulators
    fn fixed_regulators_register(&mut self);
    /// Configure the regulator framework
    fn regulator_config(&mut self) -> Result<(), SvcError>;
    /// Release regulator configuration state no longer needed
    fn regulator_cleanup(&mut self);
    /// Disable the unused USB PHY supply, if a PMIC drives one
    fn usb_phy_regulator_disable(&mut self) -> Result<(), SvcError>;
    /// Drop the MCU-subsystem clock protection
    fn clock_mcu_protect(&mut self, enable: bool);
    /// Initialize the real-time clock
    fn rtc_init(&mut self) -> Result<(), SvcError>;
    /// Have the RTC timestamp future tamper events
    fn rtc_enable_tamper_timestamp(&mut self);
    /// Initialize the random number generator
    fn rng_init(&mut self) -> Result<(), SvcError>;
    /// Arm the independent watchdog
    fn watchdog_arm(&mut self) -> Result<(), SvcError>;
    /// Configure the interrupt controller for the secure sources.
    /// Delivery stays masked; sources may latch but cannot preempt.
    fn interrupt_controller_arm(&mut self);
    /// Unmask delivery of the armed secure sources. Only legal once
    /// every subsystem the dispatcher consults is installed.
    fn interrupt_delivery_enable(&mut self);
    /// Start the post-handoff management-interface server
    fn management_server_start(&mut self);
}

// ============================================================================
// Early setup
// ============================================================================

/// Early platform setup. `args` are the four machine words handed
/// over by the previous stage: parameter list, device tree address,
/// optional hardware-configuration blob, reserved.
///
/// Runs once, synchronously, with interrupts still disarmed. Any
/// `Err` is terminal for the process.
pub fn early_setup<S: PlatformServices>(
    args: [usize; 4],
    ctx: &mut BootContext,
    services: &mut S,
    tzc: &mut TzController,
) -> Result<(), Fatal> {
    services.console_setup();

    // Validate the handoff contract before anything else runs; a
    // malformed block is fatal before any peripheral is touched.
    // SAFETY: argument 0 of the inbound handoff contract points to a
    // parameter list kept live by the previous stage through setup.
    let params = unsafe { BootParams::from_addr(args[0]) }.map_err(Fatal::Handoff)?;

    // Copy the next stage's entry point out of the previous stage's
    // memory; it may be reclaimed once we proceed. A missing entry is
    // a deferred failure, not an immediate one.
    if let Some(ep) = params.find_entry(NEXT_STAGE_IMAGE_ID) {
        ctx.publish(ep);
        // A hardware-configuration blob discovered by this stage is
        // forwarded through the argument slots without touching the
        // original list entry.
        if args[2] != 0 {
            ctx.forward_hw_config(args[2]);
        }
    }

    services.dt_open_and_check(args[1]).map_err(|_| Fatal::DeviceTree)?;
    services.fuse_probe().map_err(|_| Fatal::FuseProbe)?;
    services.clock_probe().map_err(|_| Fatal::ClockProbe)?;

    if let Err(e) = services.uart_console_setup() {
        crate::warn!("uart console setup failed: {}", e);
    }

    // First security-relevant action: partition memory before any
    // non-secure-capable peripheral is brought up.
    trustzone::configure(tzc).map_err(Fatal::TrustZone)?;

    services.delay_timer_init();

    if services.pmic_present() {
        services.pmic_init();
    } else {
        crate::warn!("no PMIC on this board");
    }

    services.fixed_regulators_register();
    services.regulator_config().map_err(|_| Fatal::RegulatorConfig)?;

    if let Err(e) = services.usb_phy_regulator_disable() {
        crate::warn!("USB PHY supply disable failed: {}", e);
    }

    ctx.finish_early_setup();
    Ok(())
}

// ============================================================================
// Platform setup
// ============================================================================

/// Secure peripheral bring-up: RTC and RNG are best-effort (their
/// loss does not weaken the trust boundary), the tamper subsystem is
/// all-or-nothing when its controller is present.
fn init_secure_peripherals<S: PlatformServices>(
    services: &mut S,
    tamp: Option<&mut TampController>,
) -> Result<(), Fatal> {
    services.clock_mcu_protect(false);

    if let Err(e) = services.rtc_init() {
        crate::warn!("RTC init failed: {}", e);
    }
    if let Err(e) = services.rng_init() {
        crate::warn!("RNG init failed: {}", e);
    }

    match tamp {
        Some(tamp) => {
            tamper::init(tamp).map_err(Fatal::Tamper)?;
            services.rtc_enable_tamper_timestamp();
        }
        // Not all hardware revisions carry a tamper controller.
        None => crate::info!("no tamper controller, tamper handling skipped"),
    }
    Ok(())
}

/// Platform setup: interrupt controller, secure peripherals, watchdog,
/// irreversible lock, management server. Strictly ordered; the lock
/// must fall after all security-relevant configuration and before the
/// management server exists.
pub fn platform_setup<S: PlatformServices>(
    services: &mut S,
    tzc: &mut TzController,
    mut tamp: Option<&mut TampController>,
) -> Result<(), Fatal> {
    services.interrupt_controller_arm();

    init_secure_peripherals(services, tamp.as_deref_mut())?;

    services.watchdog_arm().map_err(|_| Fatal::Watchdog)?;

    security_lockdown(tzc, tamp);

    services.management_server_start();
    services.regulator_cleanup();
    Ok(())
}

/// Commit the chip into its final security posture: no trust-zone or
/// peripheral-security setting can change for the remainder of the
/// process.
fn security_lockdown(tzc: &mut TzController, tamp: Option<&mut TampController>) {
    tzc.lock();
    if let Some(tamp) = tamp {
        tamp.lock();
    }
    crate::info!("peripheral security configuration locked");
}

// ============================================================================
// Process-lifetime state and the top-level runner
// ============================================================================

static BOOT_CONTEXT: Spinlock<BootContext> = Spinlock::new(BootContext::new());
static EARLY_SETUP_DONE: OnceBool = OnceBool::new();

/// Outbound handoff contract: the published next-stage entry, or
/// `None` when no matching image was found. Only meaningful once
/// [`run`] has completed early setup.
pub fn next_stage_entry() -> Option<EntryPointInfo> {
    debug_assert!(
        EARLY_SETUP_DONE.get().unwrap_or(false),
        "next-stage entry queried before early setup"
    );
    BOOT_CONTEXT.lock().next_stage_entry().copied()
}

/// Idle until a secure interrupt fires or an external resume path
/// takes over. This stage never returns to its caller.
fn idle_wait() -> ! {
    loop {
        #[cfg(target_arch = "aarch64")]
        // SAFETY: wfi waits for the next interrupt; no memory effects.
        unsafe {
            core::arch::asm!("wfi")
        }
        #[cfg(not(target_arch = "aarch64"))]
        core::hint::spin_loop();
    }
}

/// Run the whole stage: both setup phases against the real hardware,
/// then the interrupt-driven wait state. Fatal conditions funnel to
/// [`fatal::die`]; nothing else leaves this function.
pub fn run<S: PlatformServices>(args: [usize; 4], services: &mut S) -> ! {
    let mut ctx = BootContext::new();
    let mut tzc = TzController::new(config::TZC_BASE);

    if let Err(e) = early_setup(args, &mut ctx, services, &mut tzc) {
        fatal::die(e);
    }

    // Outbound handoff state is valid from this point.
    *BOOT_CONTEXT.lock() = ctx;
    let _ = EARLY_SETUP_DONE.set(true);

    let mut tamp = TampController::probe(config::TAMP_BASE);
    if let Err(e) = platform_setup(services, &mut tzc, tamp.as_mut()) {
        fatal::die(e);
    }

    // Hand the controllers to the dispatcher. Delivery is unmasked
    // only after the installs: a source that latched during setup is
    // serviced with its owning subsystem in place, never dropped, and
    // no FIQ can preempt while the install locks are held.
    trustzone::install(tzc);
    if let Some(tamp) = tamp {
        tamper::install(tamp);
    }
    services.interrupt_delivery_enable();

    crate::info!("setup complete, waiting for handoff");
    idle_wait()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::{ParamHeader, ParamNode, PARAM_BOOT_PARAMS, PARAM_MIN_VERSION};
    use crate::tamper::TAMP_PERIPH_ID;
    use crate::trustzone::TZC_PERIPH_ID;

    /// Recording mock: every call appends its name, and any call can
    /// be primed to fail.
    struct MockServices {
        calls: Vec<&'static str>,
        fail: Option<&'static str>,
        pmic: bool,
    }

    impl MockServices {
        fn new() -> Self {
            Self { calls: Vec::new(), fail: None, pmic: true }
        }

        fn failing(call: &'static str) -> Self {
            Self { fail: Some(call), ..Self::new() }
        }

        fn record(&mut self, call: &'static str) -> Result<(), SvcError> {
            self.calls.push(call);
            if self.fail == Some(call) {
                Err(SvcError("primed failure"))
            } else {
                Ok(())
            }
        }
    }

    impl PlatformServices for MockServices {
        fn console_setup(&mut self) {
            let _ = self.record("console_setup");
        }
        fn dt_open_and_check(&mut self, _addr: usize) -> Result<(), SvcError> {
            self.record("dt_open_and_check")
        }
        fn fuse_probe(&mut self) -> Result<(), SvcError> {
            self.record("fuse_probe")
        }
        fn clock_probe(&mut self) -> Result<(), SvcError> {
            self.record("clock_probe")
        }
        fn uart_console_setup(&mut self) -> Result<(), SvcError> {
            self.record("uart_console_setup")
        }
        fn delay_timer_init(&mut self) {
            let _ = self.record("delay_timer_init");
        }
        fn pmic_present(&mut self) -> bool {
            self.calls.push("pmic_present");
            self.pmic
        }
        fn pmic_init(&mut self) {
            let _ = self.record("pmic_init");
        }
        fn fixed_regulators_register(&mut self) {
            let _ = self.record("fixed_regulators_register");
        }
        fn regulator_config(&mut self) -> Result<(), SvcError> {
            self.record("regulator_config")
        }
        fn regulator_cleanup(&mut self) {
            let _ = self.record("regulator_cleanup");
        }
        fn usb_phy_regulator_disable(&mut self) -> Result<(), SvcError> {
            self.record("usb_phy_regulator_disable")
        }
        fn clock_mcu_protect(&mut self, _enable: bool) {
            let _ = self.record("clock_mcu_protect");
        }
        fn rtc_init(&mut self) -> Result<(), SvcError> {
            self.record("rtc_init")
        }
        fn rtc_enable_tamper_timestamp(&mut self) {
            let _ = self.record("rtc_enable_tamper_timestamp");
        }
        fn rng_init(&mut self) -> Result<(), SvcError> {
            self.record("rng_init")
        }
        fn watchdog_arm(&mut self) -> Result<(), SvcError> {
            self.record("watchdog_arm")
        }
        fn interrupt_controller_arm(&mut self) {
            let _ = self.record("interrupt_controller_arm");
        }
        fn interrupt_delivery_enable(&mut self) {
            let _ = self.record("interrupt_delivery_enable");
        }
        fn management_server_start(&mut self) {
            let _ = self.record("management_server_start");
        }
    }

    fn fake_tzc_regs() -> Box<[u32; 256]> {
        let mut regs = Box::new([0u32; 256]);
        regs[0x3f0 / 4] = TZC_PERIPH_ID;
        regs
    }

    fn fake_tamp_regs() -> Box<[u32; 256]> {
        let mut regs = Box::new([0u32; 256]);
        regs[0x3f0 / 4] = TAMP_PERIPH_ID;
        regs
    }

    struct Handoff {
        params: BootParams,
        #[allow(dead_code)]
        node: Box<ParamNode>,
        #[allow(dead_code)]
        ep: Box<EntryPointInfo>,
    }

    fn handoff_with_next_stage(pc: usize, args3: [usize; 3]) -> Handoff {
        let ep = Box::new(EntryPointInfo {
            pc,
            spsr: 0x1d3,
            args: [args3[0], args3[1], args3[2], 0],
        });
        let node = Box::new(ParamNode {
            image_id: NEXT_STAGE_IMAGE_ID,
            ep_info: &*ep,
            next: core::ptr::null(),
        });
        let params = BootParams {
            h: ParamHeader {
                kind: PARAM_BOOT_PARAMS,
                version: PARAM_MIN_VERSION,
                size: 16,
                attr: 0,
            },
            head: &*node,
        };
        Handoff { params, node, ep }
    }

    fn empty_handoff() -> BootParams {
        BootParams {
            h: ParamHeader {
                kind: PARAM_BOOT_PARAMS,
                version: PARAM_MIN_VERSION,
                size: 16,
                attr: 0,
            },
            head: core::ptr::null(),
        }
    }

    #[test]
    fn early_setup_preserves_collaborator_order() {
        let handoff = handoff_with_next_stage(0x2ffc_0000, [1, 2, 3]);
        let mut services = MockServices::new();
        let mut ctx = BootContext::new();
        let mut regs = fake_tzc_regs();
        let mut tzc = TzController::new(regs.as_mut_ptr() as usize);

        let args = [&handoff.params as *const _ as usize, 0x4400_0000, 0, 0];
        early_setup(args, &mut ctx, &mut services, &mut tzc).unwrap();

        assert_eq!(
            services.calls,
            vec![
                "console_setup",
                "dt_open_and_check",
                "fuse_probe",
                "clock_probe",
                "uart_console_setup",
                "delay_timer_init",
                "pmic_present",
                "pmic_init",
                "fixed_regulators_register",
                "regulator_config",
                "usb_phy_regulator_disable",
            ]
        );
    }

    #[test]
    fn malformed_handoff_stops_before_any_peripheral() {
        let mut services = MockServices::new();
        let mut ctx = BootContext::new();
        let mut regs = fake_tzc_regs();
        let mut tzc = TzController::new(regs.as_mut_ptr() as usize);

        let err = early_setup([0, 0, 0, 0], &mut ctx, &mut services, &mut tzc).unwrap_err();
        assert!(matches!(err, Fatal::Handoff(_)));
        // Nothing beyond the early console may have been touched.
        assert_eq!(services.calls, vec!["console_setup"]);
        assert_eq!(regs[0x000 / 4], 0, "no partition register may be written");
    }

    #[test]
    fn end_to_end_publish_with_hw_config_forwarding() {
        let handoff = handoff_with_next_stage(0x2ffc_0000, [1, 2, 3]);
        let mut services = MockServices::new();
        let mut ctx = BootContext::new();
        let mut regs = fake_tzc_regs();
        let mut tzc = TzController::new(regs.as_mut_ptr() as usize);

        let args = [&handoff.params as *const _ as usize, 0x4400_0000, 0x1000_0000, 0];
        early_setup(args, &mut ctx, &mut services, &mut tzc).unwrap();

        let published = ctx.next_stage_entry().unwrap();
        assert_eq!(published.pc, 0x2ffc_0000);
        assert_eq!(published.args, [0, 0, 0x1000_0000, 0]);
        // Source entry stays untouched.
        assert_eq!(handoff.ep.args, [1, 2, 3, 0]);
    }

    #[test]
    fn empty_handoff_list_defers_the_failure() {
        let params = empty_handoff();
        let mut services = MockServices::new();
        let mut ctx = BootContext::new();
        let mut regs = fake_tzc_regs();
        let mut tzc = TzController::new(regs.as_mut_ptr() as usize);

        let args = [&params as *const _ as usize, 0x4400_0000, 0, 0];
        early_setup(args, &mut ctx, &mut services, &mut tzc).unwrap();
        assert!(ctx.next_stage_entry().is_none());
    }

    #[test]
    fn device_tree_failure_is_fatal() {
        let params = empty_handoff();
        let mut services = MockServices::failing("dt_open_and_check");
        let mut ctx = BootContext::new();
        let mut regs = fake_tzc_regs();
        let mut tzc = TzController::new(regs.as_mut_ptr() as usize);

        let args = [&params as *const _ as usize, 0, 0, 0];
        let err = early_setup(args, &mut ctx, &mut services, &mut tzc).unwrap_err();
        assert_eq!(err, Fatal::DeviceTree);
        assert!(!services.calls.contains(&"fuse_probe"));
    }

    #[test]
    fn absent_pmic_is_advisory() {
        let params = empty_handoff();
        let mut services = MockServices::new();
        services.pmic = false;
        let mut ctx = BootContext::new();
        let mut regs = fake_tzc_regs();
        let mut tzc = TzController::new(regs.as_mut_ptr() as usize);

        let args = [&params as *const _ as usize, 0, 0, 0];
        early_setup(args, &mut ctx, &mut services, &mut tzc).unwrap();
        assert!(!services.calls.contains(&"pmic_init"));
        assert!(services.calls.contains(&"regulator_config"));
    }

    #[test]
    fn platform_setup_orders_lock_after_watchdog_and_before_server() {
        let mut services = MockServices::new();
        let mut tzc_regs = fake_tzc_regs();
        let mut tzc = TzController::new(tzc_regs.as_mut_ptr() as usize);
        let mut tamp_regs = fake_tamp_regs();
        let mut tamp = TampController::probe(tamp_regs.as_mut_ptr() as usize).unwrap();

        platform_setup(&mut services, &mut tzc, Some(&mut tamp)).unwrap();

        assert_eq!(
            services.calls,
            vec![
                "interrupt_controller_arm",
                "clock_mcu_protect",
                "rtc_init",
                "rng_init",
                "rtc_enable_tamper_timestamp",
                "watchdog_arm",
                "management_server_start",
                "regulator_cleanup",
            ]
        );
        // Lock bits are set on both controllers after the sequence.
        assert!(tzc.configure_region(crate::trustzone::Region::Sysram, 0).is_err());
        assert!(tamp.commit().is_err());
    }

    #[test]
    fn rtc_and_rng_failures_are_advisory() {
        let mut services = MockServices::failing("rtc_init");
        let mut tzc_regs = fake_tzc_regs();
        let mut tzc = TzController::new(tzc_regs.as_mut_ptr() as usize);

        platform_setup(&mut services, &mut tzc, None).unwrap();
        assert!(services.calls.contains(&"watchdog_arm"));

        let mut services = MockServices::failing("rng_init");
        let mut tzc_regs = fake_tzc_regs();
        let mut tzc = TzController::new(tzc_regs.as_mut_ptr() as usize);
        platform_setup(&mut services, &mut tzc, None).unwrap();
        assert!(services.calls.contains(&"management_server_start"));
    }

    #[test]
    fn watchdog_failure_is_fatal_and_stops_before_lock() {
        let mut services = MockServices::failing("watchdog_arm");
        let mut tzc_regs = fake_tzc_regs();
        let mut tzc = TzController::new(tzc_regs.as_mut_ptr() as usize);

        let err = platform_setup(&mut services, &mut tzc, None).unwrap_err();
        assert_eq!(err, Fatal::Watchdog);
        assert!(!services.calls.contains(&"management_server_start"));
        // The stage halts before locking; configuration never happened.
        assert!(tzc.configure_region(crate::trustzone::Region::Sysram, 0).is_ok());
    }

    #[test]
    fn setup_never_unmasks_delivery_itself() {
        let mut services = MockServices::new();
        let mut tzc_regs = fake_tzc_regs();
        let mut tzc = TzController::new(tzc_regs.as_mut_ptr() as usize);
        let mut tamp_regs = fake_tamp_regs();
        let mut tamp = TampController::probe(tamp_regs.as_mut_ptr() as usize).unwrap();

        platform_setup(&mut services, &mut tzc, Some(&mut tamp)).unwrap();
        // Delivery opens in run(), after the dispatcher owns the
        // controllers; neither setup phase may unmask it.
        assert!(!services.calls.contains(&"interrupt_delivery_enable"));
    }

    #[test]
    fn tamper_latched_during_setup_is_reset_once_dispatched() {
        use crate::interrupt::{dispatch, Outcome, SecureIrqCause};

        let mut services = MockServices::new();
        let mut tzc_regs = fake_tzc_regs();
        let mut tzc = TzController::new(tzc_regs.as_mut_ptr() as usize);
        let mut tamp_regs = fake_tamp_regs();
        let mut tamp = TampController::probe(tamp_regs.as_mut_ptr() as usize).unwrap();

        platform_setup(&mut services, &mut tzc, Some(&mut tamp)).unwrap();

        // Temperature monitoring fires while delivery is still masked;
        // the event latches and is serviced after the dispatcher owns
        // the controller.
        tamp_regs[0x18 / 4] = 1 << 1;
        let outcome = dispatch(SecureIrqCause::Tamper, Some(&mut tzc), Some(&mut tamp));
        assert_eq!(outcome, Outcome::Idle);
        assert_eq!(tamp_regs[0x1c / 4], 1 << 1, "source must be acknowledged");
        assert_ne!(tamp_regs[0x20 / 4], 0, "reset must be requested");
    }

    #[test]
    fn global_entry_accessor_reflects_published_context() {
        let mut ctx = BootContext::new();
        let ep = EntryPointInfo { pc: 0x2ffc_0000, spsr: 0x1d3, args: [0, 0, 0, 0] };
        ctx.publish(&ep);
        ctx.finish_early_setup();

        // run() stores the context and latches completion directly
        // after early setup; platform setup must not gate the accessor.
        *BOOT_CONTEXT.lock() = ctx;
        let _ = EARLY_SETUP_DONE.set(true);
        assert_eq!(next_stage_entry().map(|e| e.pc), Some(0x2ffc_0000));
    }

    #[test]
    fn absent_tamper_controller_skips_tamper_bringup() {
        let mut services = MockServices::new();
        let mut tzc_regs = fake_tzc_regs();
        let mut tzc = TzController::new(tzc_regs.as_mut_ptr() as usize);

        platform_setup(&mut services, &mut tzc, None).unwrap();
        assert!(!services.calls.contains(&"rtc_enable_tamper_timestamp"));
    }
}
