// Copyright 2025-2026 CEMAXECUTER LLC

//! Flex FFT receive pipeline: UDP datagram capture, VITA-49 frame
//! reassembly, magnitude conversion to dBm, and per-stream delivery with
//! metadata-change markers.

pub mod assembler;
pub mod engine;
pub mod frame;
pub mod manager;
pub mod receiver;

use std::io::Write;

/// Maximum size of a single flex UDP payload.  This bounds one datagram,
/// not a whole VITA-49 frame.
pub const MAX_FLEX_RECV_SIZE: usize = 9_000;

/// Datagrams the receiver can hold before handing data to the parser.
pub const NUM_FLEX_PACKETS: usize = 10_000;

/// Total size of each of the receiver's two byte arenas.
pub const FLEX_RECV_BUFFER_SIZE: usize = NUM_FLEX_PACKETS * MAX_FLEX_RECV_SIZE;

/// Frames the parser can hold in flight at once.
pub const BUFFER_SIZE: usize = 1_000;

/// Largest accepted VITA-49 frame, across however many datagrams carry it.
pub const MAX_FRAME_SIZE: usize = 20_000;

/// Bytes per 32-bit wire word.
pub const WORD_SIZE: usize = 4;

/// Printed with the stream ID appended when a flex stream drops a frame.
pub const FLEX_LOSS_MSG: &str = "D";

/// Printed when the receive arena overflows and resets.
pub const FLEX_OVERFLOW_MSG: &str = "Q";

pub(crate) fn operator_token(msg: &str) {
    let mut out = std::io::stdout();
    let _ = out.write_all(msg.as_bytes());
    let _ = out.flush();
}
