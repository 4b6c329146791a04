// COM1 serial console sink for the kernel log

use super::cpu::{in_port_byte, out_port_byte};
use spin::Mutex;

const COM1: u16 = 0x3F8;

static SERIAL_LOCK: Mutex<()> = Mutex::new(());

/// 115200 8N1, FIFO enabled.
pub fn init() {
    out_port_byte(COM1 + 1, 0x00); // disable interrupts
    out_port_byte(COM1 + 3, 0x80); // DLAB on
    out_port_byte(COM1 + 0, 0x01); // divisor 1 = 115200 baud
    out_port_byte(COM1 + 1, 0x00);
    out_port_byte(COM1 + 3, 0x03); // 8N1, DLAB off
    out_port_byte(COM1 + 2, 0xC7); // FIFO on, clear, 14-byte threshold
    out_port_byte(COM1 + 4, 0x0B); // DTR, RTS, OUT2
}

fn transmit_ready() -> bool {
    (in_port_byte(COM1 + 5) & 0x20) != 0
}

fn write_byte(byte: u8) {
    while !transmit_ready() {}
    out_port_byte(COM1, byte);
}

pub fn write_str(text: &str) {
    let _guard = SERIAL_LOCK.lock();
    for byte in text.bytes() {
        if byte == b'\n' {
            write_byte(b'\r');
        }
        write_byte(byte);
    }
}
