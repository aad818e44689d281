// Copyright 2025-2026 CEMAXECUTER LLC

//! Per-stream delivery of completed flex frames.
//!
//! The manager drains the assembler's published list into per-stream
//! FIFOs, copies whole frames into the consumer's buffers, checks the
//! modulo-16 data packet counter, and emits a `StreamChange` whenever a
//! frame's metadata differs from the last one reported on that stream.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::assembler::ListExchange;
use crate::frame::{FlexFrame, FrameMeta};
use crate::{operator_token, FLEX_LOSS_MSG};

/// Frames a single stream may queue before the oldest is dropped.
pub const STREAM_FIFO_CAPACITY: usize = 1_000;

/// Metadata snapshot attached to the sample offset where it took effect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamChange {
    pub starting_sample: usize,
    pub sample_rate: f64,
    pub fft_size: u32,
    pub reference_level: f64,
    pub num_averages: f64,
    pub frequency: f64,
}

impl StreamChange {
    fn matches(&self, meta: &FrameMeta) -> bool {
        self.fft_size == meta.fft_size
            && self.frequency == meta.frequency
            && self.num_averages == meta.num_averages
            && self.reference_level == meta.reference_level
            && self.sample_rate == meta.sample_rate
    }

    fn from_meta(meta: &FrameMeta, starting_sample: usize) -> Self {
        Self {
            starting_sample,
            sample_rate: meta.sample_rate,
            fft_size: meta.fft_size,
            reference_level: meta.reference_level,
            num_averages: meta.num_averages,
            frequency: meta.frequency,
        }
    }
}

struct StreamData {
    stream_id: u32,
    /// Last data packet counter seen, -1 before the first frame.
    packet_counter: i32,
    frames: VecDeque<FlexFrame>,
    last_change: Option<StreamChange>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FlexStats {
    pub frames: u64,
    pub lost: u64,
    pub dropped: u64,
}

pub struct FlexManager {
    exchange: Arc<ListExchange>,
    streams: Vec<StreamData>,
    pending: VecDeque<FlexFrame>,
    flip_requested: bool,
    fifo_capacity: usize,
    stats: FlexStats,
}

impl FlexManager {
    pub fn new(exchange: Arc<ListExchange>) -> Self {
        Self {
            exchange,
            streams: Vec::new(),
            pending: VecDeque::new(),
            flip_requested: false,
            fifo_capacity: STREAM_FIFO_CAPACITY,
            stats: FlexStats::default(),
        }
    }

    /// Register a stream.  Order matters: stream `i` here fills
    /// `dests[i]` in `copy_data`.
    pub fn add_stream(&mut self, stream_id: u32) {
        self.streams.push(StreamData {
            stream_id,
            packet_counter: -1,
            frames: VecDeque::new(),
            last_change: None,
        });
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn clear_streams(&mut self) {
        self.streams.clear();
    }

    pub fn stats(&self) -> FlexStats {
        self.stats
    }

    /// The flex pull.  Copies as many whole frames as fit into each
    /// destination (never a partial frame), reports per-stream sample
    /// counts through `amounts`, and appends a `StreamChange` for every
    /// metadata transition.
    pub fn copy_data(
        &mut self,
        dests: &mut [&mut [f32]],
        request_amount: usize,
        amounts: &mut [usize],
        changes: &mut [Vec<StreamChange>],
    ) {
        if amounts.len() != self.streams.len()
            || changes.len() != self.streams.len()
            || dests.len() != self.streams.len()
        {
            amounts.fill(0);
            return;
        }

        if self.pending.is_empty() {
            if let Some(list) = self.exchange.take_ready(&mut self.flip_requested) {
                self.pending = list;
            }
        }

        // Route the published frames to their streams; frames for
        // nothing we own are discarded.
        while let Some(frame) = self.pending.pop_front() {
            match self
                .streams
                .iter_mut()
                .find(|s| s.stream_id == frame.meta.stream_id)
            {
                Some(stream) => {
                    if stream.frames.len() >= self.fifo_capacity {
                        stream.frames.pop_front();
                        self.stats.dropped += 1;
                        log::warn!("flex stream {} queue overflow, dropping oldest", stream.stream_id);
                    }
                    stream.frames.push_back(frame);
                }
                None => drop(frame),
            }
        }

        for (i, stream) in self.streams.iter_mut().enumerate() {
            let mut copied = 0usize;
            loop {
                let Some(front) = stream.frames.front() else { break };
                if !front.is_ready() {
                    log::warn!("flex frame data was not prepared in time");
                    break;
                }
                let num_samples = front.meta.num_samples;
                if copied + num_samples > request_amount {
                    break;
                }
                let Some(frame) = stream.frames.pop_front() else { break };
                let copied_ok = frame
                    .with_samples(|s| dests[i][copied..copied + num_samples].copy_from_slice(s));
                if copied_ok.is_none() {
                    log::error!("null sample data handed to the flex manager");
                    break;
                }
                copied += num_samples;
                self.stats.frames += 1;

                let got = frame.meta.data_packet_count as i32;
                if stream.packet_counter >= 0 {
                    let expected = (stream.packet_counter + 1) % 16;
                    if expected != got {
                        self.stats.lost += 1;
                        operator_token(&format!("{}{}", FLEX_LOSS_MSG, stream.stream_id));
                    }
                }
                stream.packet_counter = got;

                let needs_change = stream
                    .last_change
                    .map_or(true, |last| !last.matches(&frame.meta));
                if needs_change {
                    let change = StreamChange::from_meta(&frame.meta, copied - num_samples);
                    changes[i].push(change);
                    stream.last_change = Some(change);
                }
            }
            amounts[i] = copied;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{AssemblerConfig, FrameAssembler};
    use crate::frame::test_frames::{build_frame, FrameSpec};

    fn pipeline() -> (FrameAssembler, FlexManager) {
        let exchange = Arc::new(ListExchange::new());
        let asm = FrameAssembler::with_config(
            exchange.clone(),
            AssemblerConfig {
                num_slots: 32,
                max_frame_size: crate::MAX_FRAME_SIZE,
            },
        );
        (asm, FlexManager::new(exchange))
    }

    /// Pull until every stream is quiet for one full round.
    fn drain(
        asm: &mut FrameAssembler,
        mgr: &mut FlexManager,
        request: usize,
    ) -> (Vec<Vec<f32>>, Vec<Vec<StreamChange>>) {
        let n = mgr.num_streams();
        let mut out = vec![Vec::new(); n];
        let mut all_changes = vec![Vec::new(); n];
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        let mut quiet = 0;
        while quiet < 4 && std::time::Instant::now() < deadline {
            let mut bufs: Vec<Vec<f32>> = (0..n).map(|_| vec![0.0; request]).collect();
            let mut dests: Vec<&mut [f32]> = bufs.iter_mut().map(|b| &mut b[..]).collect();
            let mut amounts = vec![0usize; n];
            let mut changes = vec![Vec::new(); n];
            mgr.copy_data(&mut dests, request, &mut amounts, &mut changes);
            let got: usize = amounts.iter().sum();
            for i in 0..n {
                out[i].extend_from_slice(&bufs[i][..amounts[i]]);
                all_changes[i].append(&mut changes[i]);
            }
            if got == 0 {
                quiet += 1;
            } else {
                quiet = 0;
            }
            asm.parse(&[]);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        (out, all_changes)
    }

    #[test]
    fn single_frame_delivery() {
        let (mut asm, mut mgr) = pipeline();
        mgr.add_stream(7);
        asm.parse(&build_frame(&FrameSpec::default()));

        let (out, changes) = drain(&mut asm, &mut mgr, 4096);
        assert_eq!(out[0].len(), 120);
        assert!(out[0].iter().all(|&v| v == 1.0));
        // Exactly one change marker, anchored at sample zero.
        assert_eq!(changes[0].len(), 1);
        let c = &changes[0][0];
        assert_eq!(c.starting_sample, 0);
        assert_eq!(c.frequency, 100.0);
        assert_eq!(c.fft_size, 128);
        assert_eq!(c.reference_level, -1.0);
        assert_eq!(c.num_averages, 1.0);
    }

    #[test]
    fn change_markers_are_minimal() {
        let (mut asm, mut mgr) = pipeline();
        mgr.add_stream(7);
        // Metadata runs: A A B B A -> 3 transitions (first included).
        let freqs = [100u64, 100, 250, 250, 100];
        for (i, f) in freqs.iter().enumerate() {
            asm.parse(&build_frame(&FrameSpec {
                frequency_raw: f << 20,
                data_packet_count: i as u32,
                ..FrameSpec::default()
            }));
        }

        let (out, changes) = drain(&mut asm, &mut mgr, 8192);
        assert_eq!(out[0].len(), 5 * 120);
        let seq: Vec<(usize, f64)> = changes[0]
            .iter()
            .map(|c| (c.starting_sample, c.frequency))
            .collect();
        assert_eq!(seq, vec![(0, 100.0), (240, 250.0), (480, 100.0)]);
        assert_eq!(mgr.stats().lost, 0);
    }

    #[test]
    fn counter_gap_is_flagged() {
        let (mut asm, mut mgr) = pipeline();
        mgr.add_stream(7);
        for count in [0u32, 1, 3] {
            asm.parse(&build_frame(&FrameSpec {
                data_packet_count: count,
                ..FrameSpec::default()
            }));
        }
        let (out, _) = drain(&mut asm, &mut mgr, 8192);
        assert_eq!(out[0].len(), 3 * 120);
        assert_eq!(mgr.stats().lost, 1);
    }

    #[test]
    fn counter_wrap_is_silent() {
        let (mut asm, mut mgr) = pipeline();
        mgr.add_stream(7);
        for count in [14u32, 15, 0, 1] {
            asm.parse(&build_frame(&FrameSpec {
                data_packet_count: count,
                ..FrameSpec::default()
            }));
        }
        let (out, _) = drain(&mut asm, &mut mgr, 8192);
        assert_eq!(out[0].len(), 4 * 120);
        assert_eq!(mgr.stats().lost, 0);
    }

    #[test]
    fn frames_route_by_stream_id() {
        let (mut asm, mut mgr) = pipeline();
        mgr.add_stream(7);
        mgr.add_stream(9);
        asm.parse(&build_frame(&FrameSpec::default()));
        asm.parse(&build_frame(&FrameSpec {
            stream_id: 9,
            samples: vec![0x0200; 64],
            ..FrameSpec::default()
        }));
        // A stream nobody registered; silently discarded.
        asm.parse(&build_frame(&FrameSpec {
            stream_id: 11,
            ..FrameSpec::default()
        }));

        let (out, _) = drain(&mut asm, &mut mgr, 4096);
        assert_eq!(out[0].len(), 120);
        assert_eq!(out[1].len(), 64);
        assert!(out[1].iter().all(|&v| v == 3.0)); // 512/128 - 1
    }

    #[test]
    fn partial_frames_are_never_copied() {
        let (mut asm, mut mgr) = pipeline();
        mgr.add_stream(7);
        for i in 0..3u32 {
            asm.parse(&build_frame(&FrameSpec {
                data_packet_count: i,
                ..FrameSpec::default()
            }));
        }
        // Room for two whole frames only.
        let (out, _) = drain(&mut asm, &mut mgr, 240);
        // Every pull moved 0, 120 or 240 samples; totals stay a multiple.
        assert_eq!(out[0].len() % 120, 0);
        assert_eq!(out[0].len(), 3 * 120);
    }
}
