//! VITA-49 flex frame parsing and magnitude conversion.
//!
//! A frame is a "VRLP"-prefixed pair of packets sharing one stream ID: a
//! data packet of packed signed 16-bit magnitudes and a 14-word context
//! packet carrying frequency, reference level, sample rate, FFT size and
//! averaging, terminated by "VEND".  All wire words are big-endian and
//! decoded with explicit mask and shift.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};

use crate::WORD_SIZE;

/// Frame sync word, "VRLP".
pub const FRAME_SYNC: u32 = 0x5652_4C50;

/// Frame tail word, "VEND".
pub const FRAME_TAIL: u32 = 0x5645_4E44;

/// VITA-49 packet type of the data packet.
const DATA_PACKET_TYPE: u32 = 3;

/// VITA-49 packet type of the context packet.
const CONTEXT_PACKET_TYPE: u32 = 5;

/// Fixed size in words of the context packet.
const CONTEXT_PACKET_WORDS: u32 = 14;

/// Fixed-point scale of the frequency and sample-rate fields.
const FREQ_SCALE: f64 = 0x100000 as f64;

/// Samples below this are clamped; the radio's noise floor in dBm.
pub const MAGNITUDE_FLOOR: f32 = -115.0;

/// Smallest byte count that can hold a whole frame (empty payload).
const MIN_FRAME_BYTES: usize = 88;

/// Word offset of the first payload sample, from the sync word.
const PAYLOAD_WORD: usize = 7;

/// Everything parsed out of one frame's headers and context packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMeta {
    pub stream_id: u32,
    pub frame_counter: u32,
    pub frame_words: u32,
    pub data_packet_count: u32,
    /// Parsed for diagnostics; nothing downstream consumes it.
    pub context_packet_count: u32,
    pub data_packet_words: u32,
    pub num_samples: usize,
    pub frequency: f64,
    pub reference_level: f64,
    pub sample_rate: f64,
    pub fft_size: u32,
    pub start_index: u32,
    pub end_index: u32,
    pub num_averages: f64,
}

struct FramePayload {
    processing: AtomicBool,
    samples: Mutex<Vec<f32>>,
}

/// A reassembled frame.  The magnitude conversion runs on its own
/// short-lived thread; `is_ready` flips once the samples are in place.
pub struct FlexFrame {
    pub meta: FrameMeta,
    payload: Arc<FramePayload>,
    location: Option<usize>,
}

impl FlexFrame {
    pub fn is_ready(&self) -> bool {
        !self.payload.processing.load(Ordering::Acquire)
    }

    /// Run `f` over the converted samples; `None` until conversion ends.
    pub fn with_samples<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Option<R> {
        if !self.is_ready() {
            return None;
        }
        let guard = self.payload.samples.lock().unwrap();
        Some(f(&guard))
    }

    pub(crate) fn set_location(&mut self, location: usize) {
        self.location = Some(location);
    }

    pub(crate) fn take_location(&mut self) -> Option<usize> {
        self.location.take()
    }
}

pub enum ParseOutcome {
    /// A whole frame was recognized; `consumed` bytes of the buffer
    /// belong to it (leading junk included).
    Complete { frame: FlexFrame, consumed: usize },
    /// Nothing wrong yet, but the frame is not all here.
    Incomplete,
    /// Structurally broken; the accumulated bytes are worthless.
    Invalid,
}

/// Try to parse one frame out of `buf`.  Scans for the sync word from the
/// first byte; bytes ahead of it are skipped and counted as consumed.
pub fn try_parse(buf: &[u8]) -> ParseOutcome {
    if buf.len() < MIN_FRAME_BYTES {
        return ParseOutcome::Incomplete;
    }
    let mut skip = 0usize;
    while skip + WORD_SIZE <= buf.len() && BigEndian::read_u32(&buf[skip..]) != FRAME_SYNC {
        skip += 1;
    }
    if skip + WORD_SIZE > buf.len() {
        return ParseOutcome::Incomplete;
    }

    let words = &buf[skip..];
    let num_words = words.len() / WORD_SIZE;
    let word = |i: usize| BigEndian::read_u32(&words[i * WORD_SIZE..]);

    if num_words < 2 {
        return ParseOutcome::Incomplete;
    }
    let header = word(1);
    let frame_counter = header >> 20;
    let frame_words = (header & 0xF_FFFF) as usize;
    let consumed = skip + frame_words * WORD_SIZE;
    if frame_words > num_words {
        return ParseOutcome::Incomplete;
    }
    // Sync + frame header + minimal data packet + context + tail.
    if frame_words < 22 {
        return ParseOutcome::Invalid;
    }

    let data_header = word(2);
    if data_header >> 28 != DATA_PACKET_TYPE {
        return ParseOutcome::Invalid;
    }
    let data_packet_count = (data_header >> 16) & 0xF;
    let data_packet_words = data_header & 0xFFFF;
    if data_packet_words < 5 {
        return ParseOutcome::Invalid;
    }
    let num_samples = (data_packet_words as usize - 5) * 2;
    let stream_id = word(3);

    let payload_end = PAYLOAD_WORD * WORD_SIZE + num_samples * 2;
    let context = PAYLOAD_WORD + (data_packet_words as usize - 5);
    if context + 15 > num_words || payload_end > words.len() {
        return ParseOutcome::Invalid;
    }

    let context_header = word(context);
    if context_header >> 28 != CONTEXT_PACKET_TYPE {
        return ParseOutcome::Invalid;
    }
    if context_header & 0xFFFF != CONTEXT_PACKET_WORDS {
        return ParseOutcome::Invalid;
    }
    let context_packet_count = (context_header >> 16) & 0xF;
    if word(context + 1) != stream_id {
        return ParseOutcome::Invalid;
    }

    let frequency =
        ((u64::from(word(context + 5)) << 32) | u64::from(word(context + 6))) as f64 / FREQ_SCALE;
    let reference_level = f64::from((word(context + 7) & 0xFFFF) as u16 as i16) / 128.0;
    let sample_rate =
        ((u64::from(word(context + 8)) << 32) | u64::from(word(context + 9))) as f64 / FREQ_SCALE;
    let fft_size = word(context + 10);
    let start_index = word(context + 11);
    let end_index = word(context + 12);
    let num_averages = f64::from(word(context + 13));

    if word(context + 14) != FRAME_TAIL {
        return ParseOutcome::Invalid;
    }

    let meta = FrameMeta {
        stream_id,
        frame_counter,
        frame_words: frame_words as u32,
        data_packet_count,
        context_packet_count,
        data_packet_words,
        num_samples,
        frequency,
        reference_level,
        sample_rate,
        fft_size,
        start_index,
        end_index,
        num_averages,
    };

    // Hand the conversion an owned copy of the payload so the arena slot
    // only has to outlive the reassembly, not the worker.
    let payload = Arc::new(FramePayload {
        processing: AtomicBool::new(true),
        samples: Mutex::new(Vec::new()),
    });
    let raw = words[PAYLOAD_WORD * WORD_SIZE..payload_end].to_vec();
    let worker = payload.clone();
    std::thread::spawn(move || {
        let converted = convert_magnitudes(&raw, reference_level);
        *worker.samples.lock().unwrap() = converted;
        worker.processing.store(false, Ordering::Release);
    });

    ParseOutcome::Complete {
        frame: FlexFrame {
            meta,
            payload,
            location: None,
        },
        consumed,
    }
}

/// dBFS to dBm: each big-endian signed 16-bit value is divided by 128,
/// offset by the reference level, and clamped to the noise floor.
pub fn convert_magnitudes(raw: &[u8], reference_level: f64) -> Vec<f32> {
    raw.chunks_exact(2)
        .map(|pair| {
            let v = f32::from(i16::from_be_bytes([pair[0], pair[1]]));
            (v / 128.0 + reference_level as f32).max(MAGNITUDE_FLOOR)
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod test_frames {
    use super::*;

    pub struct FrameSpec {
        pub stream_id: u32,
        pub frame_counter: u32,
        pub data_packet_count: u32,
        pub samples: Vec<i16>,
        pub frequency_raw: u64,
        pub reference_raw: i16,
        pub sample_rate_raw: u64,
        pub fft_size: u32,
        pub start_index: u32,
        pub end_index: u32,
        pub num_averages: u32,
    }

    impl Default for FrameSpec {
        fn default() -> Self {
            Self {
                stream_id: 7,
                frame_counter: 1,
                data_packet_count: 0,
                samples: vec![0x0100; 120],
                frequency_raw: 100 << 20,
                reference_raw: -128,
                sample_rate_raw: 1 << 20,
                fft_size: 128,
                start_index: 0,
                end_index: 127,
                num_averages: 1,
            }
        }
    }

    /// Serialize a bit-exact frame; sample count must be even so the
    /// payload is whole words.
    pub fn build_frame(spec: &FrameSpec) -> Vec<u8> {
        assert!(spec.samples.len() % 2 == 0);
        let payload_words = spec.samples.len() / 2;
        let data_packet_words = payload_words as u32 + 5;
        let frame_words = payload_words as u32 + 22;

        let mut words: Vec<u32> = Vec::new();
        words.push(FRAME_SYNC);
        words.push((spec.frame_counter << 20) | frame_words);
        words.push(
            (DATA_PACKET_TYPE << 28) | ((spec.data_packet_count & 0xF) << 16) | data_packet_words,
        );
        words.push(spec.stream_id);
        words.push(0); // class/reserved
        words.push(0);
        words.push(0);
        for pair in spec.samples.chunks(2) {
            words.push(((pair[0] as u16 as u32) << 16) | pair[1] as u16 as u32);
        }
        words.push((CONTEXT_PACKET_TYPE << 28) | CONTEXT_PACKET_WORDS);
        words.push(spec.stream_id);
        words.push(0);
        words.push(0);
        words.push(0);
        words.push((spec.frequency_raw >> 32) as u32);
        words.push(spec.frequency_raw as u32);
        words.push(spec.reference_raw as u16 as u32);
        words.push((spec.sample_rate_raw >> 32) as u32);
        words.push(spec.sample_rate_raw as u32);
        words.push(spec.fft_size);
        words.push(spec.start_index);
        words.push(spec.end_index);
        words.push(spec.num_averages);
        words.push(FRAME_TAIL);
        assert_eq!(words.len(), frame_words as usize);

        let mut bytes = vec![0u8; words.len() * WORD_SIZE];
        for (i, w) in words.iter().enumerate() {
            BigEndian::write_u32(&mut bytes[i * WORD_SIZE..], *w);
        }
        bytes
    }

    pub fn wait_ready(frame: &FlexFrame) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while !frame.is_ready() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(frame.is_ready(), "magnitude conversion never finished");
    }
}

#[cfg(test)]
mod tests {
    use super::test_frames::*;
    use super::*;

    #[test]
    fn parses_a_whole_frame() {
        let bytes = build_frame(&FrameSpec::default());
        let ParseOutcome::Complete { frame, consumed } = try_parse(&bytes) else {
            panic!("expected a complete frame");
        };
        assert_eq!(consumed, bytes.len());
        assert_eq!(frame.meta.stream_id, 7);
        assert_eq!(frame.meta.frame_counter, 1);
        assert_eq!(frame.meta.num_samples, 120);
        assert_eq!(frame.meta.frequency, 100.0);
        assert_eq!(frame.meta.reference_level, -1.0);
        assert_eq!(frame.meta.sample_rate, 1.0);
        assert_eq!(frame.meta.fft_size, 128);
        assert_eq!(frame.meta.num_averages, 1.0);

        wait_ready(&frame);
        // 0x0100 = 256 -> 256/128 - 1.0 = 1.0 dBm.
        frame
            .with_samples(|s| {
                assert_eq!(s.len(), 120);
                assert!(s.iter().all(|&v| v == 1.0));
            })
            .unwrap();
    }

    #[test]
    fn leading_junk_is_skipped() {
        let mut bytes = vec![0xDEu8, 0xAD, 0xBE];
        let frame_bytes = build_frame(&FrameSpec::default());
        bytes.extend_from_slice(&frame_bytes);
        let ParseOutcome::Complete { frame, consumed } = try_parse(&bytes) else {
            panic!("expected a complete frame");
        };
        assert_eq!(consumed, 3 + frame_bytes.len());
        assert_eq!(frame.meta.stream_id, 7);
    }

    #[test]
    fn truncated_frame_is_incomplete() {
        let bytes = build_frame(&FrameSpec::default());
        assert!(matches!(
            try_parse(&bytes[..bytes.len() - 8]),
            ParseOutcome::Incomplete
        ));
        assert!(matches!(try_parse(&bytes[..40]), ParseOutcome::Incomplete));
    }

    #[test]
    fn wrong_packet_type_is_invalid() {
        let mut bytes = build_frame(&FrameSpec::default());
        // Overwrite the data header's packet type with 4.
        let mut hdr = BigEndian::read_u32(&bytes[8..]);
        hdr = (hdr & 0x0FFF_FFFF) | (4 << 28);
        BigEndian::write_u32(&mut bytes[8..], hdr);
        assert!(matches!(try_parse(&bytes), ParseOutcome::Invalid));
    }

    #[test]
    fn stream_id_mismatch_is_invalid() {
        let bytes = build_frame(&FrameSpec::default());
        let context_word = 7 + 60 + 1; // context stream ID
        let mut bad = bytes.clone();
        BigEndian::write_u32(&mut bad[context_word * WORD_SIZE..], 9);
        assert!(matches!(try_parse(&bad), ParseOutcome::Invalid));
    }

    #[test]
    fn missing_tail_is_invalid() {
        let mut bytes = build_frame(&FrameSpec::default());
        let last = bytes.len() - WORD_SIZE;
        BigEndian::write_u32(&mut bytes[last..], 0x1234_5678);
        assert!(matches!(try_parse(&bytes), ParseOutcome::Invalid));
    }

    #[test]
    fn magnitude_conversion_clamps_at_floor() {
        // -32768/128 - 1.0 is far below the floor.
        let raw = (-32768i16).to_be_bytes();
        let out = convert_magnitudes(&raw, -1.0);
        assert_eq!(out, vec![MAGNITUDE_FLOOR]);

        let raw = 256i16.to_be_bytes();
        let out = convert_magnitudes(&raw, -1.0);
        assert_eq!(out, vec![1.0]);
    }

    #[test]
    fn magnitude_formula_matches_reference() {
        for (v, r) in [(0i16, 0.0f64), (1000, -20.0), (-14720, 0.0), (127, 3.5)] {
            let out = convert_magnitudes(&v.to_be_bytes(), r);
            let expected = (f32::from(v) / 128.0 + r as f32).max(-115.0);
            assert_eq!(out[0], expected);
        }
    }
}
