//! Serial output facade
//!
//! On the boards this is the PL011 UART; on host builds (unit tests)
//! serial output goes to stdout so test failures stay readable. Newline
//! translation to CR+LF happens here, on the caller side of the HAL
//! boundary -- the UART driver itself writes raw bytes.

use core::fmt;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod target {
    use super::fmt;
    use spin::Mutex;

    use crate::arch::aarch64::serial::Pl011Uart;

    #[cfg(feature = "qemu")]
    const UART_BASE: usize = 0x0900_0000;
    #[cfg(all(feature = "pi", not(feature = "qemu")))]
    const UART_BASE: usize = 0x3F20_1000;

    static UART: Mutex<Pl011Uart> = Mutex::new(Pl011Uart::new(UART_BASE));

    pub fn init() {
        UART.lock().init();
    }

    pub fn write_byte(byte: u8) {
        let uart = UART.lock();
        if byte == b'\n' {
            uart.write_byte(b'\r');
        }
        uart.write_byte(byte);
    }

    pub fn try_read_byte() -> Option<u8> {
        UART.lock().try_read_byte()
    }

    pub struct SerialWriter;

    impl fmt::Write for SerialWriter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for &b in s.as_bytes() {
                write_byte(b);
            }
            Ok(())
        }
    }

    pub fn print(args: fmt::Arguments) {
        let _ = fmt::Write::write_fmt(&mut SerialWriter, args);
    }
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
mod target {
    use super::fmt;

    pub fn init() {}

    pub fn write_byte(byte: u8) {
        std::print!("{}", byte as char);
    }

    pub fn try_read_byte() -> Option<u8> {
        None
    }

    pub fn print(args: fmt::Arguments) {
        std::print!("{}", args);
    }
}

/// Bring up the UART. Safe to call before anything else; the boot path
/// runs it first so panics are visible.
pub fn init() {
    target::init();
}

/// Send one byte (LF expands to CR+LF).
pub fn write_byte(byte: u8) {
    target::write_byte(byte);
}

/// Non-blocking receive.
pub fn try_read_byte() -> Option<u8> {
    target::try_read_byte()
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    target::print(args);
}
