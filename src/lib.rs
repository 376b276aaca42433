//! Kekkai: secure-world boot stage
//!
//! The last fully-secure software stage before control passes to the
//! normal-world loader. It validates the handoff contract left by the
//! previous boot stage, partitions on-chip memory and peripherals into
//! secure and non-secure trust domains, arms the secure-only interrupt
//! sources (memory-protection violations, bus errors, tamper sensors)
//! and commits the chip into a locked security posture before releasing
//! the next image.
//!
//! Control flow is strictly two-phase:
//! 1. [`platform::early_setup`]: handoff validation, console bring-up,
//!    trust-zone partitioning, clock/power bring-up. Runs once.
//! 2. [`platform::platform_setup`]: interrupt controller, secure
//!    peripherals, watchdog, final lock. Runs once.
//!
//! After both phases the stage is interrupt-driven only: it idles until
//! a secure fault or tamper event reaches the dispatcher in
//! [`interrupt`], or an external resume path consumes the published
//! next-stage entry point.
//!
//! There is no heap. The whole stage is a linear setup pass over
//! statically-known hardware plus a small amount of locked global state.

#![cfg_attr(not(test), no_std)]

pub mod config;
#[macro_use]
pub mod console;
pub mod fatal;
pub mod gic;
pub mod handoff;
pub mod interrupt;
pub mod platform;
pub mod services;
pub mod tamper;
pub mod trustzone;
pub mod vectors;
