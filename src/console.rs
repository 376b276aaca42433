//! Secure-world console
//!
//! PL011 UART driver plus stack-buffer formatting. All diagnostics the
//! stage emits go through the severity macros at the bottom of this
//! file; there is no heap, so formatting always lands in a fixed-size
//! stack buffer and is truncated rather than allocated.

use core::fmt::Write;

// ============================================================================
// UART Driver - Encapsulates all MMIO access
// ============================================================================

/// PL011 register offsets
const DR_OFFSET: usize = 0x00; // Data register
const FR_OFFSET: usize = 0x18; // Flag register

/// Transmit FIFO full flag
const TXFF: u32 = 1 << 5;

/// UART driver that encapsulates all MMIO access
struct Uart {
    base: usize,
}

#[cfg_attr(test, allow(dead_code))]
impl Uart {
    /// Create a new UART driver at the given base address
    const fn new(base: usize) -> Self {
        Self { base }
    }

    /// Write a byte to the UART data register
    #[inline]
    fn write(&self, byte: u8) {
        while self.tx_full() {}
        // SAFETY: Writing to UART data register at known address
        unsafe {
            ((self.base + DR_OFFSET) as *mut u8).write_volatile(byte);
        }
    }

    /// Check whether the transmit FIFO is full
    #[inline]
    fn tx_full(&self) -> bool {
        // SAFETY: Reading from UART flag register at known address
        let flags = unsafe { ((self.base + FR_OFFSET) as *const u32).read_volatile() };
        (flags & TXFF) != 0
    }
}

/// Global UART instance for the secure-world console
#[cfg_attr(test, allow(dead_code))]
static UART: Uart = Uart::new(crate::config::SECURE_UART_BASE);

// ============================================================================
// Public API
// ============================================================================

/// Print a string to the secure console.
/// Masks IRQs so dispatcher output cannot interleave with setup output
/// mid-message.
pub fn print(s: &str) {
    #[cfg(not(test))]
    {
        let _guard = crate::interrupt::IrqGuard::new();
        for c in s.bytes() {
            UART.write(c);
        }
    }
    #[cfg(test)]
    {
        std::print!("{}", s);
    }
}

// ============================================================================
// Stack-based formatting (no heap allocation, panic-safe)
// ============================================================================

/// A stack-allocated buffer for formatting without heap allocation.
/// Use with `core::fmt::Write`.
pub struct StackWriter<const N: usize> {
    buf: [u8; N],
    pos: usize,
}

impl<const N: usize> StackWriter<N> {
    /// Create a new stack writer with the given buffer size
    pub const fn new() -> Self {
        Self { buf: [0; N], pos: 0 }
    }

    /// Get the formatted string (returns empty on invalid UTF-8)
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.pos]).unwrap_or("")
    }

    /// Print the buffer contents to the console and clear
    pub fn flush(&mut self) {
        print(self.as_str());
        self.pos = 0;
    }
}

impl<const N: usize> Default for StackWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Write for StackWriter<N> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let remaining = self.buf.len() - self.pos;
        let to_copy = bytes.len().min(remaining);
        self.buf[self.pos..self.pos + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.pos += to_copy;
        // Don't return error on truncation - just truncate silently for safety
        Ok(())
    }
}

/// Emit one severity-tagged diagnostic line.
pub fn log(level: &str, args: core::fmt::Arguments<'_>) {
    let mut writer = StackWriter::<256>::new();
    let _ = write!(writer, "{}: {}\n", level, args);
    writer.flush();
}

/// Informational progress line.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::console::log("INFO", format_args!($($arg)*))
    };
}

/// Recoverable condition; execution continues.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::console::log("WARN", format_args!($($arg)*))
    };
}

/// Condition that is fatal or about to be fatal.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::console::log("ERROR", format_args!($($arg)*))
    };
}
