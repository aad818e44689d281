//! Decode worker pool.
//!
//! A fixed set of threads drains a bounded job queue.  Each job carries
//! everything the decode needs by value: the generation pool, the slot
//! index, the destination bank, and the reserved write offset.  An
//! in-flight counter, bumped before enqueue and dropped after the decode,
//! gives the orchestrator its workers-idle predicate.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use byteorder::{BigEndian, ByteOrder};
use crossbeam::channel::{bounded, Sender};
use num_complex::Complex32;

use crate::pool::{AlignedPool, SampleBank};
use crate::{COMPLEX_PER_PACKET, DATA_START_INDEX, IQ_SCALE_FACTOR, SHORT_SLEEP};

/// Threads decoding packets simultaneously.
pub const NUM_THREADS: usize = 10;

/// A single packet decode: slot `slot` of `generation` into
/// `bank[start..start + COMPLEX_PER_PACKET]`.
pub struct DecodeJob {
    pub generation: Arc<AlignedPool>,
    pub slot: usize,
    pub bank: Arc<SampleBank>,
    pub start: usize,
}

impl DecodeJob {
    fn run(self) {
        let packet = self.generation.at(self.slot);
        // SAFETY: the orchestrator reserved this range for this job alone
        // and quiesces the pool before anything else touches the half.
        let out = unsafe { self.bank.range_mut(self.start, COMPLEX_PER_PACKET) };
        decode_words(packet, out);
    }
}

/// Decode the packed IQ payload of one packet: for each big-endian word,
/// the upper signed 16 bits are I and the lower are Q, normalized by the
/// fixed scale factor.
pub fn decode_words(packet: &[u8], out: &mut [Complex32]) {
    for (k, sample) in out.iter_mut().enumerate() {
        let off = (DATA_START_INDEX + k) * 4;
        let word = BigEndian::read_u32(&packet[off..off + 4]);
        let i = (word >> 16) as i16;
        let q = (word & 0xFFFF) as i16;
        *sample = Complex32::new(f32::from(i) / IQ_SCALE_FACTOR, f32::from(q) / IQ_SCALE_FACTOR);
    }
}

pub struct WorkerPool {
    tx: Option<Sender<DecodeJob>>,
    in_flight: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(num_threads: usize) -> Self {
        let (tx, rx) = bounded::<DecodeJob>(num_threads);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let handles = (0..num_threads)
            .map(|_| {
                let rx = rx.clone();
                let in_flight = in_flight.clone();
                std::thread::spawn(move || {
                    for job in rx.iter() {
                        job.run();
                        in_flight.fetch_sub(1, Ordering::Release);
                    }
                })
            })
            .collect();
        Self {
            tx: Some(tx),
            in_flight,
            handles,
        }
    }

    /// Queue a decode.  Blocks only when every worker is busy and the
    /// queue is full, which is the backpressure the orchestrator wants.
    pub fn dispatch(&self, job: DecodeJob) {
        self.in_flight.fetch_add(1, Ordering::Release);
        if self.tx.as_ref().expect("worker pool stopped").send(job).is_err() {
            self.in_flight.fetch_sub(1, Ordering::Release);
        }
    }

    pub fn idle(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0
    }

    /// Spin until every queued decode has retired, or `running` clears.
    pub fn wait_idle(&self, running: &AtomicBool) {
        while !self.idle() && running.load(Ordering::Acquire) {
            std::thread::sleep(SHORT_SLEEP);
        }
    }

    pub fn stop(&mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
