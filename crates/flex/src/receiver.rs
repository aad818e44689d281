// Copyright 2025-2026 CEMAXECUTER LLC

//! UDP receiver for the flex FFT stream.
//!
//! Datagrams are appended to a large byte arena with a parallel log of
//! per-read sizes, so the parser downstream sees the original datagram
//! boundaries.  Two arenas ping-pong between the receive thread and the
//! process thread over capacity-1 channels; handing back the drained
//! arena is the swap request, and the receiver publishes only once it has
//! data.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};

use crate::{operator_token, FLEX_OVERFLOW_MSG, FLEX_RECV_BUFFER_SIZE, MAX_FLEX_RECV_SIZE};

/// Socket receive timeout; bounds how long stop() can take.
const RECV_TIMEOUT: Duration = Duration::from_micros(500);

#[derive(Debug, Clone, Copy)]
pub struct ReceiverConfig {
    pub arena_size: usize,
    pub max_recv_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            arena_size: FLEX_RECV_BUFFER_SIZE,
            max_recv_size: MAX_FLEX_RECV_SIZE,
        }
    }
}

/// One receive arena: raw bytes plus the datagram-size log.
pub struct RecvBlock {
    data: Vec<u8>,
    chunks: Vec<usize>,
    used: usize,
}

impl RecvBlock {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            chunks: Vec::new(),
            used: 0,
        }
    }

    pub fn reset(&mut self) {
        self.chunks.clear();
        self.used = 0;
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// The received datagrams, in arrival order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        let mut offset = 0usize;
        self.chunks.iter().map(move |&len| {
            let chunk = &self.data[offset..offset + len];
            offset += len;
            chunk
        })
    }
}

pub struct FlexReceiver {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    full_rx: Receiver<RecvBlock>,
    empty_tx: Sender<RecvBlock>,
    spare: Option<RecvBlock>,
    local_addr: Option<SocketAddr>,
}

impl FlexReceiver {
    pub fn new(ip: &str, port: u16) -> Self {
        Self::with_config(ip, port, ReceiverConfig::default())
    }

    pub fn with_config(ip: &str, port: u16, cfg: ReceiverConfig) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let (full_tx, full_rx) = bounded::<RecvBlock>(1);
        let (empty_tx, empty_rx) = bounded::<RecvBlock>(1);
        let spare = Some(RecvBlock::new(cfg.arena_size));

        let socket = match UdpSocket::bind((ip, port)) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to bind flex socket {}:{}: {}", ip, port, e);
                return Self {
                    running,
                    handle: None,
                    full_rx,
                    empty_tx,
                    spare,
                    local_addr: None,
                };
            }
        };
        if let Err(e) = socket.set_read_timeout(Some(RECV_TIMEOUT)) {
            log::warn!("failed to set flex socket timeout: {}", e);
        }
        let local_addr = socket.local_addr().ok();

        let flag = running.clone();
        let block = RecvBlock::new(cfg.arena_size);
        let max_recv = cfg.max_recv_size;
        let handle = std::thread::spawn(move || {
            receive_loop(socket, block, max_recv, empty_rx, full_tx, flag);
        });

        Self {
            running,
            handle: Some(handle),
            full_rx,
            empty_tx,
            spare,
            local_addr,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.handle.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Request a swap and wait up to `timeout` for a filled arena.
    pub fn fetch(&mut self, timeout: Duration) -> Option<RecvBlock> {
        if !self.is_bound() || !self.running.load(Ordering::Acquire) {
            return None;
        }
        if let Some(block) = self.spare.take() {
            match self.empty_tx.try_send(block) {
                Ok(()) => {}
                Err(TrySendError::Full(b)) | Err(TrySendError::Disconnected(b)) => {
                    self.spare = Some(b);
                }
            }
        }
        self.full_rx.recv_timeout(timeout).ok()
    }

    pub fn recycle(&mut self, mut block: RecvBlock) {
        block.reset();
        self.spare = Some(block);
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FlexReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    socket: UdpSocket,
    mut block: RecvBlock,
    max_recv: usize,
    empty_rx: Receiver<RecvBlock>,
    full_tx: Sender<RecvBlock>,
    running: Arc<AtomicBool>,
) {
    let capacity = block.data.len();
    while running.load(Ordering::Acquire) {
        if block.used + max_recv > capacity {
            operator_token(FLEX_OVERFLOW_MSG);
            block.reset();
        }
        let end = block.used + max_recv;
        match socket.recv(&mut block.data[block.used..end]) {
            Ok(n) if n > 0 => {
                block.chunks.push(n);
                block.used += n;
            }
            Ok(_) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::error!("flex recv error: {}", e);
                break;
            }
        }

        if !block.is_empty() {
            if let Ok(next) = empty_rx.try_recv() {
                let filled = std::mem::replace(&mut block, next);
                match full_tx.try_send(filled) {
                    Ok(()) => {}
                    Err(TrySendError::Full(b)) | Err(TrySendError::Disconnected(b)) => {
                        block = b;
                    }
                }
            }
        }
    }
}
