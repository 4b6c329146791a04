// 8253/8254 programmable interval timer

use super::cpu::out_port_byte;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

const PIT_INPUT_HZ: u32 = 1_193_182;

/// Scheduler tick frequency. Must agree with `time::TICK_MS`.
pub const TICK_HZ: u32 = 100;

/// Program channel 0 as a rate generator at `TICK_HZ`.
pub fn program_interval_timer() {
    let divisor = PIT_INPUT_HZ / TICK_HZ;

    out_port_byte(PIT_COMMAND, 0x36); // channel 0, lobyte/hibyte, mode 3
    out_port_byte(PIT_CHANNEL0, (divisor & 0xFF) as u8);
    out_port_byte(PIT_CHANNEL0, (divisor >> 8) as u8);
}
