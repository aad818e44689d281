// Copyright 2025-2026 CEMAXECUTER LLC

//! Frame reassembly and the consumer handoff lists.
//!
//! The assembler owns an arena of fixed-size slots and a free-index
//! stack.  Datagrams accumulate in the claimed slot until a whole frame
//! parses out; the frame is then published to the active list and any
//! trailing bytes start the next slot.  The consumer swaps lists through
//! the `ListExchange` flip protocol; the assembler settles a pending flip
//! before each parse, releasing the retired list's arena slots once their
//! magnitude conversions have finished.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::frame::{self, FlexFrame, ParseOutcome};
use crate::{BUFFER_SIZE, MAX_FRAME_SIZE};

/// Two frame lists ping-ponged between the assembler and the consumer.
/// The assembler pushes to `lists[active]`; the consumer drains the other
/// once a flip it requested has settled.
pub struct ListExchange {
    lists: [Mutex<VecDeque<FlexFrame>>; 2],
    active: AtomicUsize,
    flip: AtomicBool,
}

impl ListExchange {
    pub fn new() -> Self {
        Self {
            lists: [Mutex::new(VecDeque::new()), Mutex::new(VecDeque::new())],
            active: AtomicUsize::new(0),
            flip: AtomicBool::new(false),
        }
    }

    fn push(&self, frame: FlexFrame) {
        let idx = self.active.load(Ordering::Relaxed);
        self.lists[idx].lock().unwrap().push_back(frame);
    }

    /// Consumer side of the flip protocol.  The first call requests a
    /// flip and returns `None`; once the assembler has settled it, the
    /// retired list comes back.  `requested` is the caller's own request
    /// memory between calls.
    pub fn take_ready(&self, requested: &mut bool) -> Option<VecDeque<FlexFrame>> {
        if self.flip.load(Ordering::Acquire) {
            return None;
        }
        if *requested {
            *requested = false;
            let idx = 1 - self.active.load(Ordering::Acquire);
            let mut list = self.lists[idx].lock().unwrap();
            Some(std::mem::take(&mut *list))
        } else {
            *requested = true;
            self.flip.store(true, Ordering::Release);
            None
        }
    }
}

impl Default for ListExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AssemblerConfig {
    pub num_slots: usize,
    pub max_frame_size: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            num_slots: BUFFER_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

pub struct FrameAssembler {
    exchange: Arc<ListExchange>,
    /// Slot storage, `num_slots` runs of `max_frame_size` bytes.
    arena: Vec<u8>,
    free: Vec<usize>,
    current: Option<usize>,
    write_len: usize,
    max_frame_size: usize,
    waiting_for_settle: bool,
    discarded: u64,
}

impl FrameAssembler {
    pub fn new(exchange: Arc<ListExchange>) -> Self {
        Self::with_config(exchange, AssemblerConfig::default())
    }

    pub fn with_config(exchange: Arc<ListExchange>, cfg: AssemblerConfig) -> Self {
        Self {
            exchange,
            arena: vec![0u8; cfg.num_slots * cfg.max_frame_size],
            free: (0..cfg.num_slots).rev().collect(),
            current: None,
            write_len: 0,
            max_frame_size: cfg.max_frame_size,
            waiting_for_settle: false,
            discarded: 0,
        }
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn slot(&self, index: usize) -> &[u8] {
        let base = index * self.max_frame_size;
        &self.arena[base..base + self.max_frame_size]
    }

    fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        let base = index * self.max_frame_size;
        &mut self.arena[base..base + self.max_frame_size]
    }

    /// Feed one datagram's bytes.  An empty chunk still advances the flip
    /// state machine, so the loop can make progress on an idle link.
    /// Returns false when the data could not be accepted (no free slot,
    /// or a chunk that cannot fit a frame slot).
    pub fn parse(&mut self, chunk: &[u8]) -> bool {
        self.advance_flip();
        if chunk.is_empty() {
            return false;
        }

        let mut data = chunk;
        loop {
            let slot = match self.current {
                Some(s) => s,
                None => match self.free.pop() {
                    Some(s) => {
                        self.current = Some(s);
                        s
                    }
                    None => return false,
                },
            };

            if data.len() > self.max_frame_size {
                return false;
            }
            // A chunk that cannot be appended abandons the partial frame.
            if self.write_len > 0 && data.len() > self.max_frame_size - self.write_len {
                self.write_len = 0;
            }
            if self.write_len + data.len() >= self.max_frame_size {
                return false;
            }

            let previous = self.write_len;
            let end = previous + data.len();
            self.slot_mut(slot)[previous..end].copy_from_slice(data);
            self.write_len = end;

            match frame::try_parse(&self.slot(slot)[..end]) {
                ParseOutcome::Complete { mut frame, consumed } => {
                    frame.set_location(slot);
                    self.exchange.push(frame);
                    self.write_len = 0;
                    self.current = None;
                    if consumed < end {
                        // The tail of this datagram belongs to the next
                        // frame; feed it again from the original bytes.
                        let used_from_chunk = consumed - previous;
                        data = &data[used_from_chunk..];
                        continue;
                    }
                    return true;
                }
                ParseOutcome::Invalid => {
                    self.free.push(slot);
                    self.current = None;
                    self.write_len = 0;
                    self.discarded += 1;
                    return true;
                }
                ParseOutcome::Incomplete => return true,
            }
        }
    }

    /// Advance a pending list flip: first toggle the active list, then on
    /// later calls release the retired list's slots once every frame in
    /// it has finished converting.
    fn advance_flip(&mut self) {
        if !self.exchange.flip.load(Ordering::Acquire) {
            return;
        }
        if !self.waiting_for_settle {
            let active = self.exchange.active.load(Ordering::Relaxed);
            self.exchange.active.store(1 - active, Ordering::Release);
            self.waiting_for_settle = true;
            return;
        }
        let retired = 1 - self.exchange.active.load(Ordering::Relaxed);
        let mut list = self.exchange.lists[retired].lock().unwrap();
        if !list.iter().all(|f| f.is_ready()) {
            return;
        }
        for f in list.iter_mut() {
            if let Some(location) = f.take_location() {
                self.free.push(location);
            }
        }
        drop(list);
        self.waiting_for_settle = false;
        self.exchange.flip.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::test_frames::{build_frame, FrameSpec};

    fn assembler() -> (FrameAssembler, Arc<ListExchange>) {
        let exchange = Arc::new(ListExchange::new());
        let cfg = AssemblerConfig {
            num_slots: 16,
            max_frame_size: MAX_FRAME_SIZE,
        };
        (FrameAssembler::with_config(exchange.clone(), cfg), exchange)
    }

    /// Run the consumer protocol to completion: request, settle, take.
    fn take_frames(asm: &mut FrameAssembler, exchange: &ListExchange) -> Vec<FlexFrame> {
        let mut requested = false;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if let Some(list) = exchange.take_ready(&mut requested) {
                return list.into_iter().collect();
            }
            asm.parse(&[]);
            assert!(
                std::time::Instant::now() < deadline,
                "flip never settled"
            );
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    fn meta_tuple(f: &FlexFrame) -> (u32, f64, f64, u32, usize, Vec<f32>) {
        crate::frame::test_frames::wait_ready(f);
        let samples = f.with_samples(|s| s.to_vec()).unwrap();
        (
            f.meta.stream_id,
            f.meta.frequency,
            f.meta.sample_rate,
            f.meta.fft_size,
            f.meta.num_samples,
            samples,
        )
    }

    #[test]
    fn one_chunk_one_frame() {
        let (mut asm, exchange) = assembler();
        assert!(asm.parse(&build_frame(&FrameSpec::default())));
        let frames = take_frames(&mut asm, &exchange);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].meta.stream_id, 7);
    }

    #[test]
    fn fragmentation_is_invisible() {
        let one = build_frame(&FrameSpec::default());
        let two = build_frame(&FrameSpec {
            stream_id: 9,
            frame_counter: 2,
            data_packet_count: 1,
            samples: vec![0x0200; 64],
            ..FrameSpec::default()
        });
        let mut stream = one.clone();
        stream.extend_from_slice(&two);

        // Whole-frame delivery as the baseline.
        let (mut asm, exchange) = assembler();
        asm.parse(&one);
        asm.parse(&two);
        let baseline: Vec<_> = take_frames(&mut asm, &exchange)
            .iter()
            .map(meta_tuple)
            .collect();
        assert_eq!(baseline.len(), 2);

        // Sweep a few fragmentation patterns over the same byte stream.
        for split in [1usize, 7, 64, 300, one.len(), one.len() + 3] {
            let (mut asm, exchange) = assembler();
            for piece in stream.chunks(split) {
                asm.parse(piece);
            }
            let got: Vec<_> = take_frames(&mut asm, &exchange)
                .iter()
                .map(meta_tuple)
                .collect();
            assert_eq!(got, baseline, "split at {} changed the result", split);
        }
    }

    #[test]
    fn trailing_bytes_start_the_next_frame() {
        // Two frames plus a half frame delivered as one datagram.
        let one = build_frame(&FrameSpec::default());
        let two = build_frame(&FrameSpec {
            stream_id: 3,
            ..FrameSpec::default()
        });
        let three = build_frame(&FrameSpec {
            stream_id: 4,
            ..FrameSpec::default()
        });
        let mut blob = one.clone();
        blob.extend_from_slice(&two);
        blob.extend_from_slice(&three[..50]);

        let (mut asm, exchange) = assembler();
        asm.parse(&blob);
        asm.parse(&three[50..]);
        let ids: Vec<u32> = take_frames(&mut asm, &exchange)
            .iter()
            .map(|f| f.meta.stream_id)
            .collect();
        assert_eq!(ids, vec![7, 3, 4]);
    }

    #[test]
    fn structural_garbage_recovers() {
        let (mut asm, exchange) = assembler();
        // A sync word followed by a bogus data packet type.
        let mut bad = build_frame(&FrameSpec::default());
        bad[8] = 0x40; // packet type 4
        asm.parse(&bad);
        assert_eq!(asm.discarded(), 1);

        asm.parse(&build_frame(&FrameSpec::default()));
        let frames = take_frames(&mut asm, &exchange);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn arena_slots_all_come_back() {
        let (mut asm, exchange) = assembler();
        let total = asm.free_slots();
        for i in 0..5u32 {
            asm.parse(&build_frame(&FrameSpec {
                frame_counter: i,
                data_packet_count: i & 0xF,
                ..FrameSpec::default()
            }));
        }
        assert_eq!(asm.free_slots(), total - 5);

        // The pull's flip settles once every conversion is done and the
        // retired list's slots come back before the frames are handed out.
        let frames = take_frames(&mut asm, &exchange);
        assert_eq!(frames.len(), 5);
        assert_eq!(asm.free_slots(), total);
        drop(frames);

        // A further cycle with nothing in flight changes nothing.
        let empty = take_frames(&mut asm, &exchange);
        assert!(empty.is_empty());
        assert_eq!(asm.free_slots(), total);
    }

    #[test]
    fn arena_exhaustion_refuses_data() {
        let exchange = Arc::new(ListExchange::new());
        let mut asm = FrameAssembler::with_config(
            exchange.clone(),
            AssemblerConfig {
                num_slots: 2,
                max_frame_size: MAX_FRAME_SIZE,
            },
        );
        assert!(asm.parse(&build_frame(&FrameSpec::default())));
        assert!(asm.parse(&build_frame(&FrameSpec::default())));
        // Both slots are held by unreleased frames now.
        assert!(!asm.parse(&build_frame(&FrameSpec::default())));
        let frames = {
            let mut requested = false;
            loop {
                if let Some(l) = exchange.take_ready(&mut requested) {
                    break l;
                }
                asm.parse(&[]);
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        };
        assert_eq!(frames.len(), 2);
    }
}
