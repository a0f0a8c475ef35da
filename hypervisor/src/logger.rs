//! Serial port logger.
//!
//! Writes every `log` record to a 16550 UART, prefixed with the APIC id of the processor
//! that emitted it. Initialization is idempotent: the loader and [`crate::vmm::start`] may
//! both call [`init`], and later calls only change the level.

use {
    core::fmt::{self, Write},
    spin::{Mutex, Once},
    x86::io::{inb, outb},
};

const UART_OFFSET_DATA: u16 = 0x0;
const UART_OFFSET_INTERRUPT_ENABLE: u16 = 0x1;
const UART_OFFSET_FIFO_CONTROL: u16 = 0x2;
const UART_OFFSET_LINE_CONTROL: u16 = 0x3;
const UART_OFFSET_MODEM_CONTROL: u16 = 0x4;
const UART_OFFSET_LINE_STATUS: u16 = 0x5;

/// Line status: transmitter holding register empty.
const LINE_STATUS_THR_EMPTY: u8 = 0x20;

static LOGGER: Once<SerialLogger> = Once::new();

/// Installs the serial logger as the global `log` logger and sets the maximum level.
pub fn init(port: SerialPort, level: log::LevelFilter) {
    let mut installed = false;
    let logger = LOGGER.call_once(|| {
        installed = true;
        SerialLogger::new(port)
    });

    // Another logger may have been registered by the loader; keep using it.
    if installed && log::set_logger(logger).is_err() {
        log::debug!("A logger is already installed, serial logger left unregistered");
    }
    log::set_max_level(level);
}

/// Serial ports supported by the logger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SerialPort {
    COM1 = 0x3F8,
    COM2 = 0x2F8,
}

pub struct SerialLogger {
    serial: Mutex<Serial>,
}

impl SerialLogger {
    fn new(port: SerialPort) -> Self {
        let mut serial = Serial { port };
        serial.init();
        Self { serial: Mutex::new(serial) }
    }
}

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let mut serial = self.serial.lock();
            let _ = write_record(&mut *serial, apic_id(), record);
        }
    }

    fn flush(&self) {}
}

fn write_record(writer: &mut impl Write, apic_id: u32, record: &log::Record<'_>) -> fmt::Result {
    writeln!(writer, "cpu-{} {}: {}", apic_id, record.level(), record.args())
}

struct Serial {
    port: SerialPort,
}

impl Serial {
    fn init(&mut self) {
        let base = self.port as u16;

        // SAFETY: the UART registers are plain I/O ports.
        unsafe {
            outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
            // DLAB on, divisor 1 (115200 baud), DLAB off with 8N1.
            outb(base + UART_OFFSET_LINE_CONTROL, 0x80);
            outb(base + UART_OFFSET_DATA, 0x01);
            outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
            outb(base + UART_OFFSET_LINE_CONTROL, 0x03);
            outb(base + UART_OFFSET_FIFO_CONTROL, 0xC7);
            outb(base + UART_OFFSET_MODEM_CONTROL, 0x0B);
        }
    }

    fn write_byte(&mut self, byte: u8) {
        let base = self.port as u16;

        // SAFETY: see `init`.
        unsafe {
            while inb(base + UART_OFFSET_LINE_STATUS) & LINE_STATUS_THR_EMPTY == 0 {
                core::hint::spin_loop();
            }
            outb(base + UART_OFFSET_DATA, byte);
        }
    }
}

impl Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// Initial APIC id of the current processor (CPUID.01H:EBX[31:24]).
fn apic_id() -> u32 {
    x86::cpuid::cpuid!(0x1).ebx >> 24
}
