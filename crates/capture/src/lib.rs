// Copyright 2025-2026 CEMAXECUTER LLC

//! IQ receive pipeline for the Polaris digitizer: UDP packet capture,
//! VITA-49 IQ decode, and per-tuner stream demultiplexing.

pub mod listener;
pub mod manager;
pub mod pool;
pub mod workers;

use std::io::Write;
use std::time::Duration;

/// Number of simultaneous IQ streams (4 tuners x 2 DDCs).
pub const NUM_STREAMS: usize = 8;

/// Complex samples held per double-buffer half, per stream.
pub const NUM_COMPLEX: usize = 200_000_000;

/// Complex samples carried by one IQ packet.
pub const COMPLEX_PER_PACKET: usize = 994;

/// First 32-bit word of sample data within an IQ packet.
pub const DATA_START_INDEX: usize = 5;

/// Highest value of the modulo-16 packet counter.
pub const MAX_PACKET_COUNT: i64 = 15;

/// Divisor normalizing signed 16-bit samples to [-1, 1).
pub const IQ_SCALE_FACTOR: f32 = 32768.0;

/// Sleep used while waiting on a time-critical request.
pub const SHORT_SLEEP: Duration = Duration::from_micros(5);

/// Sleep used while waiting on non-critical work.
pub const LONG_SLEEP: Duration = Duration::from_micros(100);

/// Printed once per generation handoff when the capture ring wrapped.
pub const OVERFLOW_MSG: &str = "O";

/// Printed once per detected gap in a stream's packet counter.
pub const PACKET_LOSS_MSG: &str = "L";

/// Printed when a packet is dropped to keep the other streams flowing.
pub const CAPPING_LOSS_MSG: &str = "C";

/// Single-character console tokens for the operator; bypasses the log
/// facade so back-to-back events stay on one line.
pub(crate) fn operator_token(msg: &str) {
    let mut out = std::io::stdout();
    let _ = out.write_all(msg.as_bytes());
    let _ = out.flush();
}
