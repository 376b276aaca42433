//! Exception vectors
//!
//! Minimal vector table for the secure stage: FIQ is the only
//! expected asynchronous entry (all three secure sources are routed
//! as Group 0 / FIQ by `gic`), everything else lands in a default
//! handler that returns. Table install and FIQ unmask are separate
//! steps: delivery only opens once the dispatch path owns its
//! controllers.

#[cfg(target_arch = "aarch64")]
use core::arch::global_asm;

#[cfg(target_arch = "aarch64")]
global_asm!(
    r#"
.section .text.exceptions
.balign 0x800

.global secure_vector_table
secure_vector_table:
    // Current EL with SP0
    .balign 0x80
    b default_exception_handler   // Synchronous
    .balign 0x80
    b default_exception_handler   // IRQ
    .balign 0x80
    b fiq_handler                 // FIQ
    .balign 0x80
    b default_exception_handler   // SError

    // Current EL with SPx
    .balign 0x80
    b default_exception_handler   // Synchronous
    .balign 0x80
    b default_exception_handler   // IRQ
    .balign 0x80
    b fiq_handler                 // FIQ
    .balign 0x80
    b default_exception_handler   // SError

    // Lower EL using AArch64
    .balign 0x80
    b default_exception_handler   // Synchronous
    .balign 0x80
    b default_exception_handler   // IRQ
    .balign 0x80
    b fiq_handler                 // FIQ
    .balign 0x80
    b default_exception_handler   // SError

    // Lower EL using AArch32
    .balign 0x80
    b default_exception_handler   // Synchronous
    .balign 0x80
    b default_exception_handler   // IRQ
    .balign 0x80
    b fiq_handler                 // FIQ
    .balign 0x80
    b default_exception_handler   // SError

// Default exception handler - just returns
default_exception_handler:
    eret

// FIQ handler - saves context and calls the Rust dispatcher
fiq_handler:
    stp x0, x1, [sp, #-16]!
    stp x2, x3, [sp, #-16]!
    stp x4, x5, [sp, #-16]!
    stp x6, x7, [sp, #-16]!
    stp x8, x9, [sp, #-16]!
    stp x10, x11, [sp, #-16]!
    stp x12, x13, [sp, #-16]!
    stp x14, x15, [sp, #-16]!
    stp x16, x17, [sp, #-16]!
    stp x18, x19, [sp, #-16]!
    stp x20, x21, [sp, #-16]!
    stp x22, x23, [sp, #-16]!
    stp x24, x25, [sp, #-16]!
    stp x26, x27, [sp, #-16]!
    stp x28, x29, [sp, #-16]!
    str x30, [sp, #-16]!

    bl rust_fiq_handler

    ldr x30, [sp], #16
    ldp x28, x29, [sp], #16
    ldp x26, x27, [sp], #16
    ldp x24, x25, [sp], #16
    ldp x22, x23, [sp], #16
    ldp x20, x21, [sp], #16
    ldp x18, x19, [sp], #16
    ldp x16, x17, [sp], #16
    ldp x14, x15, [sp], #16
    ldp x12, x13, [sp], #16
    ldp x10, x11, [sp], #16
    ldp x8, x9, [sp], #16
    ldp x6, x7, [sp], #16
    ldp x4, x5, [sp], #16
    ldp x2, x3, [sp], #16
    ldp x0, x1, [sp], #16

    eret
"#
);

#[cfg(target_arch = "aarch64")]
unsafe extern "C" {
    static secure_vector_table: u8;
}

/// Install the vector table. FIQ stays masked; delivery is opened
/// separately with [`enable_fiq`] once every handler collaborator is
/// in place.
#[cfg(target_arch = "aarch64")]
pub fn init() {
    unsafe {
        let vbar = &secure_vector_table as *const _ as u64;

        core::arch::asm!(
            "msr vbar_el1, {vbar}",
            "isb",
            vbar = in(reg) vbar
        );
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub fn init() {}

/// Unmask FIQ (bit 0 of the DAIF clear immediate)
#[cfg(target_arch = "aarch64")]
pub fn enable_fiq() {
    // SAFETY: clearing the F mask bit only affects interrupt delivery
    // on the current CPU
    unsafe {
        core::arch::asm!("msr daifclr, #1");
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub fn enable_fiq() {}

/// Rust FIQ handler called from assembly
#[cfg_attr(target_arch = "aarch64", unsafe(no_mangle))]
#[cfg_attr(not(target_arch = "aarch64"), allow(dead_code))]
extern "C" fn rust_fiq_handler() {
    // Acknowledge, dispatch, and (unless the dispatcher halted) signal
    // end of interrupt from the dispatcher itself.
    if let Some(iar) = crate::gic::acknowledge() {
        crate::interrupt::secure_interrupt_handler(iar);
    }
}
